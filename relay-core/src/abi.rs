//! ABI-driven event argument decoding for webhook payloads.
//!
//! Indexed parameters come out of the log topics, non-indexed ones out of
//! the data blob; the results are exposed both by name and in declaration
//! order, plus the human-readable canonical signature.

use alloy::json_abi::{Event, EventParam, JsonAbi};
use alloy_dyn_abi::{DynSolType, DynSolValue};
use alloy_primitives::{B256, Bytes};
use anyhow::{Result, anyhow};
use serde_json::Value;

#[derive(Debug)]
pub struct DecodedEvent {
    /// Canonical form, e.g. `Transfer(address,address,uint256)`.
    pub signature: String,
    pub named: serde_json::Map<String, Value>,
    pub ordered: Vec<Value>,
}

/// Decode the arguments of a single event occurrence. `topics` holds the
/// indexed topics past the signature topic.
pub fn decode_event(
    abi_json: &str,
    sig_hash: B256,
    topics: &[B256],
    data: &Bytes,
) -> Result<DecodedEvent> {
    let abi: JsonAbi = serde_json::from_str(abi_json)?;
    let event = abi
        .events()
        .find(|event| event.selector() == sig_hash)
        .ok_or_else(|| anyhow!("event selector {sig_hash:#x} not present in ABI entry"))?;
    decode_with_event(event, topics, data)
}

fn decode_with_event(event: &Event, topics: &[B256], data: &Bytes) -> Result<DecodedEvent> {
    let indexed: Vec<&EventParam> = event.inputs.iter().filter(|p| p.indexed).collect();
    let non_indexed: Vec<&EventParam> = event.inputs.iter().filter(|p| !p.indexed).collect();

    if topics.len() < indexed.len() {
        return Err(anyhow!(
            "event {} declares {} indexed parameters but the log carries {} topics",
            event.name,
            indexed.len(),
            topics.len()
        ));
    }

    let mut values: Vec<(String, Value)> = Vec::with_capacity(event.inputs.len());

    for (param, topic) in indexed.iter().zip(topics.iter()) {
        let value = decode_indexed_param(param, *topic)?;
        values.push((param.name.clone(), value_to_json(&value)?));
    }

    if !non_indexed.is_empty() {
        let decoded = decode_data_params(&non_indexed, data)?;
        for (param, value) in non_indexed.iter().zip(decoded.iter()) {
            values.push((param.name.clone(), value_to_json(value)?));
        }
    }

    // restore declaration order across the indexed/non-indexed split
    values.sort_by_key(|(name, _)| {
        event
            .inputs
            .iter()
            .position(|param| &param.name == name)
            .unwrap_or(usize::MAX)
    });

    let mut named = serde_json::Map::with_capacity(values.len());
    let mut ordered = Vec::with_capacity(values.len());
    for (name, value) in values {
        ordered.push(value.clone());
        named.insert(name, value);
    }

    Ok(DecodedEvent {
        signature: event.signature(),
        named,
        ordered,
    })
}

/// Decode an indexed parameter from a topic
fn decode_indexed_param(param: &EventParam, topic: B256) -> Result<DynSolValue> {
    let sol_type = DynSolType::parse(&param.ty)?;

    // For dynamic types, topics carry the keccak256 hash of the value; the
    // original cannot be recovered, so the hash is surfaced as bytes32.
    match &sol_type {
        DynSolType::String | DynSolType::Bytes | DynSolType::Array(_) => {
            Ok(DynSolValue::FixedBytes(topic.0.into(), 32))
        }
        _ => sol_type
            .abi_decode_params(topic.as_slice())
            .map_err(|e| anyhow!("Failed to decode indexed parameter {}: {}", param.name, e)),
    }
}

/// Decode non-indexed parameters from log data
fn decode_data_params(params: &[&EventParam], data: &Bytes) -> Result<Vec<DynSolValue>> {
    let param_types: Result<Vec<DynSolType>> = params
        .iter()
        .map(|p| {
            DynSolType::parse(&p.ty).map_err(|e| {
                anyhow!(
                    "Failed to parse non-indexed parameter {} of type {}: {}",
                    p.name,
                    p.ty,
                    e
                )
            })
        })
        .collect();
    let tuple_type = DynSolType::Tuple(param_types?);

    let decoded = tuple_type
        .abi_decode_params(data)
        .map_err(|e| anyhow!("Failed to decode log data: {}", e))?;

    match decoded {
        DynSolValue::Tuple(values) => Ok(values),
        _ => Err(anyhow!("Expected tuple from log data decoding")),
    }
}

/// Convert DynSolValue to JSON. Numbers become decimal strings so values
/// past 64 bits survive JSON consumers untouched.
fn value_to_json(value: &DynSolValue) -> Result<Value> {
    match value {
        DynSolValue::Bool(b) => Ok(Value::Bool(*b)),
        DynSolValue::Int(i, _) => Ok(Value::String(i.to_string())),
        DynSolValue::Uint(u, _) => Ok(Value::String(u.to_string())),
        DynSolValue::FixedBytes(bytes, size) => {
            Ok(Value::String(format!("0x{}", hex::encode(&bytes[..*size]))))
        }
        DynSolValue::Bytes(bytes) => Ok(Value::String(format!("0x{}", hex::encode(bytes)))),
        DynSolValue::Address(addr) => Ok(Value::String(format!("{addr:#x}"))),
        DynSolValue::String(s) => Ok(Value::String(s.clone())),
        DynSolValue::Array(arr) | DynSolValue::FixedArray(arr) | DynSolValue::Tuple(arr) => {
            let json: Result<Vec<Value>> = arr.iter().map(value_to_json).collect();
            Ok(Value::Array(json?))
        }
        _ => Ok(Value::String(format!("{value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::*;

    const TRANSFER_ABI: &str = r#"[
        {
            "type": "event",
            "name": "Transfer",
            "anonymous": false,
            "inputs": [
                {"name": "from", "type": "address", "indexed": true},
                {"name": "to", "type": "address", "indexed": true},
                {"name": "value", "type": "uint256", "indexed": false}
            ]
        }
    ]"#;

    fn topic_for(address: Address) -> B256 {
        let mut raw = [0u8; 32];
        raw[12..].copy_from_slice(address.as_slice());
        B256::from(raw)
    }

    #[test]
    fn decodes_transfer_arguments() {
        let abi: JsonAbi = serde_json::from_str(TRANSFER_ABI).unwrap();
        let selector = abi.events().next().unwrap().selector();

        let from = Address::repeat_byte(0x11);
        let to = Address::repeat_byte(0x22);
        let topics = vec![topic_for(from), topic_for(to)];
        // uint256 value = 10^18
        let mut data = [0u8; 32];
        data[24..].copy_from_slice(&1_000_000_000_000_000_000u64.to_be_bytes());
        let data = Bytes::from(data.to_vec());

        let decoded = decode_event(TRANSFER_ABI, selector, &topics, &data).unwrap();
        assert_eq!(decoded.signature, "Transfer(address,address,uint256)");
        assert_eq!(decoded.ordered.len(), 3);
        assert_eq!(decoded.named["from"], Value::String(format!("{from:#x}")));
        assert_eq!(decoded.named["to"], Value::String(format!("{to:#x}")));
        assert_eq!(
            decoded.named["value"],
            Value::String("1000000000000000000".to_string())
        );
        // ordered follows the declaration order
        assert_eq!(decoded.ordered[0], decoded.named["from"]);
        assert_eq!(decoded.ordered[2], decoded.named["value"]);
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let err = decode_event(
            TRANSFER_ABI,
            B256::repeat_byte(0xee),
            &[],
            &Bytes::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not present"));
    }

    #[test]
    fn missing_topics_are_an_error() {
        let abi: JsonAbi = serde_json::from_str(TRANSFER_ABI).unwrap();
        let selector = abi.events().next().unwrap().selector();
        let err = decode_event(TRANSFER_ABI, selector, &[], &Bytes::new()).unwrap_err();
        assert!(err.to_string().contains("indexed parameters"));
    }
}
