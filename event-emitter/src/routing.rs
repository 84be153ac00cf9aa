use std::sync::Arc;

use alloy_primitives::{Address, B256};
use arc_swap::ArcSwap;

use relay_core::types::EmitDestination;

/// Immutable snapshot of destination rules. A reload builds the new list
/// and swaps the pointer wholesale, so concurrent readers never observe a
/// partially rebuilt table.
pub struct RoutingTable {
    inner: ArcSwap<Vec<EmitDestination>>,
}

impl RoutingTable {
    pub fn new(destinations: Vec<EmitDestination>) -> Self {
        Self {
            inner: ArcSwap::from_pointee(destinations),
        }
    }

    pub fn replace(&self, destinations: Vec<EmitDestination>) {
        self.inner.store(Arc::new(destinations));
    }

    /// Rules matching the event under the positional topic filter semantics.
    pub fn matches(&self, address: Address, sig_hash: B256, topics: &[B256]) -> Vec<EmitDestination> {
        self.inner
            .load()
            .iter()
            .filter(|dest| dest.matches(address, sig_hash, topics))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn destination(url: &str) -> EmitDestination {
        EmitDestination {
            id: Uuid::new_v4(),
            source_address: Address::repeat_byte(0xaa),
            abi_hash: B256::repeat_byte(0x11),
            webhook_url: url.to_string(),
            topics: [None, None, None],
        }
    }

    #[test]
    fn unmatched_events_route_nowhere() {
        let table = RoutingTable::new(vec![destination("http://one")]);
        assert!(table
            .matches(Address::repeat_byte(0xbb), B256::repeat_byte(0x11), &[])
            .is_empty());
    }

    #[test]
    fn reload_swaps_the_visible_rule_set() {
        // destination added after startup is invisible until the swap
        let table = RoutingTable::new(Vec::new());
        assert!(table
            .matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &[])
            .is_empty());

        table.replace(vec![destination("http://one"), destination("http://two")]);
        let matched = table.matches(Address::repeat_byte(0xaa), B256::repeat_byte(0x11), &[]);
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].webhook_url, "http://one");
    }
}
