use alloy_primitives::{Address, B256, Bytes};
use uuid::Uuid;

/// A (contract address, event signature hash) pair the observer watches for.
/// Many sources can share an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSource {
    pub address: Address,
    pub abi_hash: B256,
}

/// Registry entry for a decodable event shape, keyed by the keccak hash of
/// its canonical signature.
#[derive(Debug, Clone)]
pub struct AbiEntry {
    pub abi_hash: B256,
    pub abi_json: String,
}

/// A webhook routing rule. Events from `source_address` carrying signature
/// `abi_hash` are delivered to `webhook_url`, optionally narrowed by up to
/// three indexed-topic filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitDestination {
    pub id: Uuid,
    pub source_address: Address,
    pub abi_hash: B256,
    pub webhook_url: String,
    pub topics: [Option<B256>; 3],
}

impl EmitDestination {
    /// Positional topic matching: an unset filter slot is a wildcard, a set
    /// slot must equal the event topic at the same position.
    pub fn matches(&self, address: Address, sig_hash: B256, topics: &[B256]) -> bool {
        if self.source_address != address || self.abi_hash != sig_hash {
            return false;
        }
        self.topics
            .iter()
            .enumerate()
            .all(|(i, filter)| match filter {
                Some(want) => topics.get(i) == Some(want),
                None => true,
            })
    }
}

/// A durably stored observation of a single log. Identified by
/// `(block_timestamp, log_index)`; never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub block_timestamp: i64,
    pub tx_index: i64,
    pub log_index: i64,
    pub block_number: i64,
    pub block_hash: B256,
    pub tx_hash: B256,
    pub source_address: Address,
    pub abi_hash: B256,
    /// Indexed topics past the signature topic, in log order (at most three).
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination(topics: [Option<B256>; 3]) -> EmitDestination {
        EmitDestination {
            id: Uuid::new_v4(),
            source_address: Address::repeat_byte(0xaa),
            abi_hash: B256::repeat_byte(0x11),
            webhook_url: "http://localhost:9999/hook".to_string(),
            topics,
        }
    }

    #[test]
    fn matches_requires_address_and_signature() {
        let dest = destination([None, None, None]);
        assert!(dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &[]));
        assert!(!dest.matches(Address::repeat_byte(0xbb), B256::repeat_byte(0x11), &[]));
        assert!(!dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x22), &[]));
    }

    #[test]
    fn unset_topic_filter_is_a_wildcard() {
        let t2 = B256::repeat_byte(0x02);
        let dest = destination([None, Some(t2), None]);

        // any topic1 passes as long as topic2 matches positionally
        let topics = vec![B256::repeat_byte(0x99), t2];
        assert!(dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &topics));

        let wrong = vec![B256::repeat_byte(0x99), B256::repeat_byte(0x03)];
        assert!(!dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &wrong));
    }

    #[test]
    fn set_topic_filters_must_all_match() {
        let t1 = B256::repeat_byte(0x01);
        let t2 = B256::repeat_byte(0x02);
        let dest = destination([Some(t1), Some(t2), None]);

        assert!(dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &[t1, t2]));
        assert!(!dest.matches(
            Address::repeat_byte(0xaa),
            B256::repeat_byte(0x11),
            &[t1, B256::repeat_byte(0x03)]
        ));
        // filter set but event has no topic at that position
        assert!(!dest.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &[t1]));
    }
}
