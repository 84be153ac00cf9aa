//! Broker gateway. One durable JetStream work queue carries confirmed
//! events to the emitters (each message delivered to exactly one consumer);
//! plain per-component subjects carry control broadcasts so every instance
//! of a component receives every reload.

use std::time::Duration;

use async_nats::Client;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy};
use async_nats::jetstream::{self, Context};
use tracing::{error, info};

use crate::codec::{ControlMessage, EventMessage};

pub const EVENTS_STREAM: &str = "EVM_EVENTS";
pub const EVENTS_SUBJECT: &str = "relay.events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Observer,
    Emitter,
}

impl Component {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Component::Observer => "relay.control.observer",
            Component::Emitter => "relay.control.emitter",
        }
    }
}

#[derive(Clone)]
pub struct Broker {
    pub client: Client,
    pub js: Context,
}

pub async fn connect(url: &str) -> anyhow::Result<Broker> {
    let client = loop {
        match async_nats::connect(url).await {
            Ok(conn) => break conn,
            Err(e) => {
                error!("[NATS] Connection failed: {}, retrying...", e);
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    };
    info!("[NATS] Connected to NATS at {}", url);

    let js = jetstream::new(client.clone());

    Ok(Broker { client, js })
}

impl Broker {
    /// Ensure the durable events stream exists; get-or-create so redundant
    /// instances can race the declaration safely.
    pub async fn ensure_events_stream(&self) -> anyhow::Result<()> {
        self.js
            .get_or_create_stream(StreamConfig {
                name: EVENTS_STREAM.to_string(),
                subjects: vec![EVENTS_SUBJECT.to_string()],
                retention: RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await?;
        info!("Events stream \"{}\" ready", EVENTS_STREAM);
        Ok(())
    }

    pub async fn publish_event(&self, message: &EventMessage) -> anyhow::Result<()> {
        let ack = self
            .js
            .publish(EVENTS_SUBJECT, message.encode().into())
            .await?;
        ack.await?;
        Ok(())
    }

    /// Durable pull consumer on the events stream; all emitter instances
    /// share the durable name and compete for messages.
    pub async fn events_consumer(&self, durable: &str) -> anyhow::Result<PullConsumer> {
        let stream = self.js.get_stream(EVENTS_STREAM).await?;
        let consumer = stream
            .get_or_create_consumer(
                durable,
                PullConfig {
                    durable_name: Some(durable.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(consumer)
    }

    /// Bind this instance's private control queue under the component's
    /// routing key. Every subscriber gets its own copy of each broadcast.
    pub async fn subscribe_control(
        &self,
        component: Component,
    ) -> anyhow::Result<async_nats::Subscriber> {
        let subscriber = self.client.subscribe(component.routing_key()).await?;
        info!(
            "Bound control queue under routing key {}",
            component.routing_key()
        );
        Ok(subscriber)
    }

    /// Invoked by the admin layer (via control-publisher) right after a
    /// sources/destinations write commits.
    pub async fn publish_reload(&self, component: Component) -> anyhow::Result<()> {
        self.client
            .publish(component.routing_key(), ControlMessage::Reload.encode().into())
            .await?;
        self.client.flush().await?;
        Ok(())
    }
}
