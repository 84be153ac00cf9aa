use alloy_primitives::{Address, B256, Bytes};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::types::{AbiEntry, EmitDestination, EventRecord, EventSource};

const SCHEMA: &str = include_str!("../sql/schema.sql");

pub async fn connect_pg(dsn: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(dsn, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Postgres connection error: {:?}", e);
        }
    });

    // Create schema if not exists
    client.batch_execute(SCHEMA).await?;

    info!("PostgreSQL ready");

    Ok(client)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The `(block_timestamp, log_index)` key already exists: another
    /// observer instance won the race.
    Duplicate,
}

pub async fn insert_event(client: &Client, record: &EventRecord) -> anyhow::Result<InsertOutcome> {
    let query = r#"
        INSERT INTO event_records (
            block_timestamp, log_index, tx_index, block_number,
            block_hash, tx_hash, source_address, abi_hash,
            topic1, topic2, topic3, data
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
    "#;

    let block_hash = record.block_hash.as_slice();
    let tx_hash = record.tx_hash.as_slice();
    let source_address = record.source_address.as_slice();
    let abi_hash = record.abi_hash.as_slice();
    let topic1 = record.topics.first().map(|t| t.as_slice());
    let topic2 = record.topics.get(1).map(|t| t.as_slice());
    let topic3 = record.topics.get(2).map(|t| t.as_slice());
    let data = record.data.as_ref();

    let result = client
        .execute(
            query,
            &[
                &record.block_timestamp,
                &record.log_index,
                &record.tx_index,
                &record.block_number,
                &block_hash,
                &tx_hash,
                &source_address,
                &abi_hash,
                &topic1,
                &topic2,
                &topic3,
                &data,
            ],
        )
        .await;

    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
            debug!(
                "Event record ({}, {}) already present",
                record.block_timestamp, record.log_index
            );
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_event(
    client: &Client,
    block_timestamp: i64,
    log_index: i64,
) -> anyhow::Result<u64> {
    let deleted = client
        .execute(
            "DELETE FROM event_records WHERE block_timestamp = $1 AND log_index = $2",
            &[&block_timestamp, &log_index],
        )
        .await?;
    if deleted == 0 {
        debug!("No event record to delete at ({block_timestamp}, {log_index})");
    }
    Ok(deleted)
}

pub async fn find_event(
    client: &Client,
    block_timestamp: i64,
    log_index: i64,
) -> anyhow::Result<Option<EventRecord>> {
    let row = client
        .query_opt(
            r#"
            SELECT block_timestamp, log_index, tx_index, block_number,
                   block_hash, tx_hash, source_address, abi_hash,
                   topic1, topic2, topic3, data
            FROM event_records
            WHERE block_timestamp = $1 AND log_index = $2
            "#,
            &[&block_timestamp, &log_index],
        )
        .await?;
    row.map(|row| record_from_row(&row)).transpose()
}

pub async fn load_sources(client: &Client) -> anyhow::Result<Vec<EventSource>> {
    let rows = client
        .query("SELECT source_address, abi_hash FROM event_sources", &[])
        .await?;
    rows.iter()
        .map(|row| {
            Ok(EventSource {
                address: addr_col(row, "source_address")?,
                abi_hash: b256_col(row, "abi_hash")?,
            })
        })
        .collect()
}

pub async fn load_abis(client: &Client) -> anyhow::Result<Vec<AbiEntry>> {
    let rows = client
        .query("SELECT abi_hash, abi_json FROM abi_entries", &[])
        .await?;
    rows.iter()
        .map(|row| {
            Ok(AbiEntry {
                abi_hash: b256_col(row, "abi_hash")?,
                abi_json: row.try_get("abi_json")?,
            })
        })
        .collect()
}

pub async fn find_abi(client: &Client, abi_hash: B256) -> anyhow::Result<Option<AbiEntry>> {
    let hash = abi_hash.as_slice();
    let row = client
        .query_opt(
            "SELECT abi_hash, abi_json FROM abi_entries WHERE abi_hash = $1",
            &[&hash],
        )
        .await?;
    row.map(|row| {
        Ok(AbiEntry {
            abi_hash: b256_col(&row, "abi_hash")?,
            abi_json: row.try_get("abi_json")?,
        })
    })
    .transpose()
}

pub async fn load_destinations(client: &Client) -> anyhow::Result<Vec<EmitDestination>> {
    let rows = client
        .query(
            r#"
            SELECT id, source_address, abi_hash, webhook_url, topic1, topic2, topic3
            FROM emit_destinations
            "#,
            &[],
        )
        .await?;
    rows.iter()
        .map(|row| {
            let id: Uuid = row.try_get("id")?;
            Ok(EmitDestination {
                id,
                source_address: addr_col(row, "source_address")?,
                abi_hash: b256_col(row, "abi_hash")?,
                webhook_url: row.try_get("webhook_url")?,
                topics: [
                    b256_col_opt(row, "topic1")?,
                    b256_col_opt(row, "topic2")?,
                    b256_col_opt(row, "topic3")?,
                ],
            })
        })
        .collect()
}

fn record_from_row(row: &Row) -> anyhow::Result<EventRecord> {
    let mut topics = Vec::new();
    for col in ["topic1", "topic2", "topic3"] {
        match b256_col_opt(row, col)? {
            Some(topic) => topics.push(topic),
            // log topics are positional; the first NULL ends the list
            None => break,
        }
    }
    let data: Vec<u8> = row.try_get("data")?;
    Ok(EventRecord {
        block_timestamp: row.try_get("block_timestamp")?,
        log_index: row.try_get("log_index")?,
        tx_index: row.try_get("tx_index")?,
        block_number: row.try_get("block_number")?,
        block_hash: b256_col(row, "block_hash")?,
        tx_hash: b256_col(row, "tx_hash")?,
        source_address: addr_col(row, "source_address")?,
        abi_hash: b256_col(row, "abi_hash")?,
        topics,
        data: Bytes::from(data),
    })
}

fn b256_col(row: &Row, col: &str) -> anyhow::Result<B256> {
    let raw: Vec<u8> = row.try_get(col)?;
    if raw.len() != 32 {
        anyhow::bail!("column {col} holds {} bytes, expected 32", raw.len());
    }
    Ok(B256::from_slice(&raw))
}

fn b256_col_opt(row: &Row, col: &str) -> anyhow::Result<Option<B256>> {
    let raw: Option<Vec<u8>> = row.try_get(col)?;
    match raw {
        Some(raw) => {
            if raw.len() != 32 {
                anyhow::bail!("column {col} holds {} bytes, expected 32", raw.len());
            }
            Ok(Some(B256::from_slice(&raw)))
        }
        None => Ok(None),
    }
}

fn addr_col(row: &Row, col: &str) -> anyhow::Result<Address> {
    let raw: Vec<u8> = row.try_get(col)?;
    if raw.len() != 20 {
        anyhow::bail!("column {col} holds {} bytes, expected 20", raw.len());
    }
    Ok(Address::from_slice(&raw))
}
