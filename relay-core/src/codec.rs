//! Wire codec for the broker messages.
//!
//! A compact, deterministic, self-describing binary form built from three
//! primitives: byte strings, arbitrary-precision integers and ordered lists.
//! No named fields travel on the wire; both message kinds are fixed-arity
//! tuples. Decoding rejects truncated input, trailing bytes, wrong arity and
//! non-minimal integer encodings.

use alloy_primitives::{Address, B256};
use thiserror::Error;

use crate::types::EventRecord;

const TAG_BYTES: u8 = b'b';
const TAG_INT: u8 = b'i';
const TAG_LIST: u8 = b'l';

/// Block-number sentinel marking a synthetic test-webhook request.
pub const TEST_WEBHOOK_BLOCK: i128 = -1;

const MAX_INT_MAGNITUDE_BYTES: usize = 16;
const MAX_TOPICS: usize = 3;
const MAX_DEPTH: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,
    #[error("trailing bytes after message")]
    TrailingBytes,
    #[error("unknown type tag {0:#04x}")]
    UnknownTag(u8),
    #[error("invalid sign byte {0:#04x}")]
    BadSign(u8),
    #[error("non-minimal integer encoding")]
    NonMinimalInt,
    #[error("integer magnitude exceeds 16 bytes")]
    IntOutOfRange,
    #[error("nesting too deep")]
    TooDeep,
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("expected {expected} elements, found {found}")]
    BadArity { expected: usize, found: usize },
    #[error("expected a {expected}-byte string, found {found} bytes")]
    BadLength { expected: usize, found: usize },
    #[error("topic list holds {0} entries, at most 3 allowed")]
    TooManyTopics(usize),
    #[error("unknown control action {0:?}")]
    UnknownAction(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Bytes(Vec<u8>),
    Int(i128),
    List(Vec<Value>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Bytes(_) => "byte string",
            Value::Int(_) => "integer",
            Value::List(_) => "list",
        }
    }

    fn into_int(self) -> Result<i128, CodecError> {
        match self {
            Value::Int(value) => Ok(value),
            other => Err(CodecError::TypeMismatch {
                expected: "integer",
                found: other.kind(),
            }),
        }
    }

    fn into_list(self) -> Result<Vec<Value>, CodecError> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(CodecError::TypeMismatch {
                expected: "list",
                found: other.kind(),
            }),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>, CodecError> {
        match self {
            Value::Bytes(bytes) => Ok(bytes),
            other => Err(CodecError::TypeMismatch {
                expected: "byte string",
                found: other.kind(),
            }),
        }
    }

    fn into_fixed<const N: usize>(self) -> Result<[u8; N], CodecError> {
        let bytes = self.into_bytes()?;
        if bytes.len() != N {
            return Err(CodecError::BadLength {
                expected: N,
                found: bytes.len(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(TAG_BYTES);
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn put_int(out: &mut Vec<u8>, value: i128) {
    out.push(TAG_INT);
    out.push(u8::from(value < 0));
    let magnitude = value.unsigned_abs().to_be_bytes();
    let skip = magnitude.iter().take_while(|b| **b == 0).count();
    let minimal = &magnitude[skip..];
    out.push(minimal.len() as u8);
    out.extend_from_slice(minimal);
}

fn put_list_header(out: &mut Vec<u8>, count: usize) {
    out.push(TAG_LIST);
    out.extend_from_slice(&(count as u32).to_be_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u32_be(&mut self) -> Result<u32, CodecError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn value(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep);
        }
        match self.byte()? {
            TAG_BYTES => {
                let len = self.u32_be()? as usize;
                Ok(Value::Bytes(self.take(len)?.to_vec()))
            }
            TAG_INT => {
                let sign = self.byte()?;
                if sign > 1 {
                    return Err(CodecError::BadSign(sign));
                }
                let len = self.byte()? as usize;
                if len > MAX_INT_MAGNITUDE_BYTES {
                    return Err(CodecError::IntOutOfRange);
                }
                let raw = self.take(len)?;
                if raw.first() == Some(&0) {
                    return Err(CodecError::NonMinimalInt);
                }
                if sign == 1 && raw.is_empty() {
                    // negative zero has no minimal form
                    return Err(CodecError::NonMinimalInt);
                }
                let mut magnitude = 0u128;
                for b in raw {
                    magnitude = (magnitude << 8) | u128::from(*b);
                }
                if magnitude > i128::MAX as u128 {
                    return Err(CodecError::IntOutOfRange);
                }
                let value = magnitude as i128;
                Ok(Value::Int(if sign == 1 { -value } else { value }))
            }
            TAG_LIST => {
                let count = self.u32_be()? as usize;
                let mut items = Vec::new();
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

fn decode_root(buf: &[u8]) -> Result<Value, CodecError> {
    let mut reader = Reader::new(buf);
    let value = reader.value(0)?;
    if reader.pos != buf.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(value)
}

fn expect_arity<const N: usize>(items: Vec<Value>) -> Result<[Value; N], CodecError> {
    items.try_into().map_err(|items: Vec<Value>| CodecError::BadArity {
        expected: N,
        found: items.len(),
    })
}

/// Wire projection of a confirmed event. The payload bytes and transaction
/// hash are re-fetched from the ledger at delivery time rather than carried
/// here; only the identity and finality-check fields travel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMessage {
    pub address: Address,
    pub sig_hash: B256,
    pub topics: Vec<B256>,
    pub block_timestamp: i128,
    pub tx_index: i128,
    pub log_index: i128,
    pub block_number: i128,
    pub block_hash: B256,
}

impl EventMessage {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            address: record.source_address,
            sig_hash: record.abi_hash,
            topics: record.topics.clone(),
            block_timestamp: i128::from(record.block_timestamp),
            tx_index: i128::from(record.tx_index),
            log_index: i128::from(record.log_index),
            block_number: i128::from(record.block_number),
            block_hash: record.block_hash,
        }
    }

    pub fn is_test_webhook(&self) -> bool {
        self.block_number == TEST_WEBHOOK_BLOCK
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(192);
        put_list_header(&mut out, 8);
        put_bytes(&mut out, self.address.as_slice());
        put_bytes(&mut out, self.sig_hash.as_slice());
        put_list_header(&mut out, self.topics.len());
        for topic in &self.topics {
            put_bytes(&mut out, topic.as_slice());
        }
        put_int(&mut out, self.block_timestamp);
        put_int(&mut out, self.tx_index);
        put_int(&mut out, self.log_index);
        put_int(&mut out, self.block_number);
        put_bytes(&mut out, self.block_hash.as_slice());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let [address, sig_hash, topics, block_timestamp, tx_index, log_index, block_number, block_hash] =
            expect_arity::<8>(decode_root(buf)?.into_list()?)?;

        let raw_topics = topics.into_list()?;
        if raw_topics.len() > MAX_TOPICS {
            return Err(CodecError::TooManyTopics(raw_topics.len()));
        }
        let mut topics = Vec::with_capacity(raw_topics.len());
        for raw in raw_topics {
            topics.push(B256::from(raw.into_fixed::<32>()?));
        }

        Ok(Self {
            address: Address::from(address.into_fixed::<20>()?),
            sig_hash: B256::from(sig_hash.into_fixed::<32>()?),
            topics,
            block_timestamp: block_timestamp.into_int()?,
            tx_index: tx_index.into_int()?,
            log_index: log_index.into_int()?,
            block_number: block_number.into_int()?,
            block_hash: B256::from(block_hash.into_fixed::<32>()?),
        })
    }
}

const ACTION_RELOAD: &[u8] = b"reload";

/// Broadcast instruction telling a component to reload its configuration
/// from the ledger. Encoded as a 1-tuple so future actions can extend the
/// arity without breaking old decoders loudly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Reload,
}

impl ControlMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        put_list_header(&mut out, 1);
        match self {
            ControlMessage::Reload => put_bytes(&mut out, ACTION_RELOAD),
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let [action] = expect_arity::<1>(decode_root(buf)?.into_list()?)?;
        let action = action.into_bytes()?;
        match action.as_slice() {
            ACTION_RELOAD => Ok(ControlMessage::Reload),
            other => Err(CodecError::UnknownAction(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> EventMessage {
        EventMessage {
            address: Address::repeat_byte(0xab),
            sig_hash: B256::repeat_byte(0x11),
            topics: vec![B256::repeat_byte(0x22), B256::repeat_byte(0x33)],
            block_timestamp: 1_700_000_000,
            tx_index: 4,
            log_index: 3,
            block_number: 100,
            block_hash: B256::repeat_byte(0x44),
        }
    }

    #[test]
    fn event_message_round_trip() {
        let message = sample_message();
        let decoded = EventMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn event_message_round_trip_boundary_values() {
        let mut message = sample_message();
        message.topics = Vec::new();
        message.block_timestamp = 0;
        message.tx_index = 0;
        message.log_index = 0;
        message.block_number = 1i128 << 63;
        message.block_hash = B256::repeat_byte(0xff);
        message.sig_hash = B256::repeat_byte(0xff);
        let decoded = EventMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_webhook_sentinel_round_trips() {
        let mut message = sample_message();
        message.block_number = TEST_WEBHOOK_BLOCK;
        let decoded = EventMessage::decode(&message.encode()).unwrap();
        assert!(decoded.is_test_webhook());
        assert_eq!(decoded.block_number, -1);
    }

    #[test]
    fn control_message_round_trip() {
        let decoded = ControlMessage::decode(&ControlMessage::Reload.encode()).unwrap();
        assert_eq!(decoded, ControlMessage::Reload);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = sample_message().encode();
        for cut in [1, encoded.len() / 2, encoded.len() - 1] {
            assert_eq!(
                EventMessage::decode(&encoded[..cut]).unwrap_err(),
                CodecError::Truncated,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut encoded = sample_message().encode();
        encoded.push(0);
        assert_eq!(
            EventMessage::decode(&encoded).unwrap_err(),
            CodecError::TrailingBytes
        );
    }

    #[test]
    fn extra_tuple_fields_are_rejected() {
        let message = sample_message();
        let mut out = Vec::new();
        put_list_header(&mut out, 9);
        put_bytes(&mut out, message.address.as_slice());
        put_bytes(&mut out, message.sig_hash.as_slice());
        put_list_header(&mut out, 0);
        put_int(&mut out, message.block_timestamp);
        put_int(&mut out, message.tx_index);
        put_int(&mut out, message.log_index);
        put_int(&mut out, message.block_number);
        put_bytes(&mut out, message.block_hash.as_slice());
        put_int(&mut out, 0);
        assert_eq!(
            EventMessage::decode(&out).unwrap_err(),
            CodecError::BadArity {
                expected: 8,
                found: 9
            }
        );
    }

    #[test]
    fn wrong_hash_width_is_rejected() {
        let message = sample_message();
        let mut out = Vec::new();
        put_list_header(&mut out, 8);
        put_bytes(&mut out, &message.address.as_slice()[..19]);
        put_bytes(&mut out, message.sig_hash.as_slice());
        put_list_header(&mut out, 0);
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_bytes(&mut out, message.block_hash.as_slice());
        assert_eq!(
            EventMessage::decode(&out).unwrap_err(),
            CodecError::BadLength {
                expected: 20,
                found: 19
            }
        );
    }

    #[test]
    fn non_minimal_integers_are_rejected() {
        // 'i', positive, two magnitude bytes with a leading zero
        let raw = [TAG_INT, 0, 2, 0, 5];
        let mut reader = Reader::new(&raw);
        assert_eq!(reader.value(0).unwrap_err(), CodecError::NonMinimalInt);

        // negative zero
        let raw = [TAG_INT, 1, 0];
        let mut reader = Reader::new(&raw);
        assert_eq!(reader.value(0).unwrap_err(), CodecError::NonMinimalInt);
    }

    #[test]
    fn unknown_control_action_is_rejected() {
        let mut out = Vec::new();
        put_list_header(&mut out, 1);
        put_bytes(&mut out, b"resync");
        assert_eq!(
            ControlMessage::decode(&out).unwrap_err(),
            CodecError::UnknownAction("resync".to_string())
        );
    }

    #[test]
    fn too_many_topics_are_rejected() {
        let message = sample_message();
        let mut out = Vec::new();
        put_list_header(&mut out, 8);
        put_bytes(&mut out, message.address.as_slice());
        put_bytes(&mut out, message.sig_hash.as_slice());
        put_list_header(&mut out, 4);
        for _ in 0..4 {
            put_bytes(&mut out, B256::ZERO.as_slice());
        }
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_int(&mut out, 0);
        put_bytes(&mut out, message.block_hash.as_slice());
        assert_eq!(
            EventMessage::decode(&out).unwrap_err(),
            CodecError::TooManyTopics(4)
        );
    }

    #[test]
    fn from_record_projects_identity_fields() {
        let record = EventRecord {
            block_timestamp: 1_700_000_000,
            tx_index: 7,
            log_index: 3,
            block_number: 100,
            block_hash: B256::repeat_byte(0x44),
            tx_hash: B256::repeat_byte(0x55),
            source_address: Address::repeat_byte(0xab),
            abi_hash: B256::repeat_byte(0x11),
            topics: vec![B256::repeat_byte(0x22)],
            data: alloy_primitives::Bytes::from(vec![1, 2, 3]),
        };
        let message = EventMessage::from_record(&record);
        assert_eq!(message.address, record.source_address);
        assert_eq!(message.sig_hash, record.abi_hash);
        assert_eq!(message.block_number, 100);
        assert_eq!(message.topics, record.topics);
        // the data payload never travels on the wire
        let round = EventMessage::decode(&message.encode()).unwrap();
        assert_eq!(round, message);
    }
}
