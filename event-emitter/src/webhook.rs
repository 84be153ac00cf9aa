//! Webhook delivery: payload construction and the HTTP POST itself.
//! Delivery is best-effort once finalized; failures are logged by the
//! caller and never retried here.

use std::time::Duration;

use alloy_primitives::B256;
use serde::Serialize;
use thiserror::Error;

use relay_core::abi::DecodedEvent;
use relay_core::codec::EventMessage;
use relay_core::types::EventRecord;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook delivery failed with status {status}")]
    DeliveryFailed { status: u16 },
}

#[derive(Debug, Serialize)]
pub struct EventArgs {
    pub named: serde_json::Map<String, serde_json::Value>,
    pub ordered: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    pub block_index: u64,
    pub log_index: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub source_address: String,
    pub abi_hash: String,
    pub abi_signature: String,
    pub args: EventArgs,
}

/// Minimal body for a synthetic test request: no transaction hash,
/// signature or args, and a zero block hash.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPayload {
    pub block_timestamp: i64,
    pub block_index: i64,
    pub log_index: i64,
    pub block_hash: String,
    pub source_address: String,
    pub abi_hash: String,
}

pub fn delivery_payload(record: &EventRecord, decoded: DecodedEvent) -> DeliveryPayload {
    DeliveryPayload {
        block_index: record.block_number.max(0) as u64,
        log_index: record.log_index.max(0) as u64,
        block_hash: format!("{:#x}", record.block_hash),
        transaction_hash: format!("{:#x}", record.tx_hash),
        source_address: record.source_address.to_checksum(None),
        abi_hash: format!("{:#x}", record.abi_hash),
        abi_signature: decoded.signature,
        args: EventArgs {
            named: decoded.named,
            ordered: decoded.ordered,
        },
    }
}

pub fn test_payload(message: &EventMessage) -> TestPayload {
    TestPayload {
        block_timestamp: message.block_timestamp as i64,
        block_index: -1,
        log_index: message.log_index as i64,
        block_hash: format!("{:#x}", B256::ZERO),
        source_address: message.address.to_checksum(None),
        abi_hash: format!("{:#x}", message.sig_hash),
    }
}

pub struct WebhookClient {
    http: reqwest::Client,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    pub async fn post<T: Serialize>(&self, url: &str, payload: &T) -> Result<(), WebhookError> {
        let response = self.http.post(url).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::DeliveryFailed {
                status: status.as_u16(),
            })
        }
    }
}
