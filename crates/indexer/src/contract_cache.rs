//! Process-wide memo of which addresses hold contract code.

use std::collections::HashMap;

use alloy::primitives::Address;
use ledgerwatch_chain::ChainSource;
use ledgerwatch_core::AppError;
use tokio::sync::RwLock;

pub const DEFAULT_CAPACITY: usize = 100_000;

/// Read-mostly cache of code lookups. Entries never expire; once the map
/// reaches its capacity it is cleared wholesale before the next insert.
#[derive(Debug)]
pub struct ContractCache {
    entries: RwLock<HashMap<Address, bool>>,
    capacity: usize,
}

impl Default for ContractCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ContractCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub async fn is_contract(
        &self,
        chain: &dyn ChainSource,
        address: Address,
    ) -> Result<bool, AppError> {
        if let Some(hit) = self.entries.read().await.get(&address).copied() {
            return Ok(hit);
        }

        let is_contract = !chain.code_at(address).await?.is_empty();

        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            tracing::debug!(entries = entries.len(), "Contract cache full, clearing");
            entries.clear();
        }
        entries.insert(address, is_contract);
        Ok(is_contract)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockChain;
    use alloy::primitives::{Bytes, address};

    const TOKEN: Address = address!("1111111111111111111111111111111111111111");
    const ALICE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

    #[tokio::test]
    async fn memoizes_code_lookups() {
        let chain = MockChain::new();
        chain.set_code(TOKEN, Bytes::from_static(&[0x60, 0x80]));
        let cache = ContractCache::default();

        assert!(cache.is_contract(&chain, TOKEN).await.unwrap());
        assert!(cache.is_contract(&chain, TOKEN).await.unwrap());
        assert!(!cache.is_contract(&chain, ALICE).await.unwrap());
        assert!(!cache.is_contract(&chain, ALICE).await.unwrap());
        assert_eq!(chain.code_lookups(), 2);
    }

    #[tokio::test]
    async fn clears_when_full() {
        let chain = MockChain::new();
        let cache = ContractCache::new(2);
        for byte in 1..=2u8 {
            cache
                .is_contract(&chain, Address::repeat_byte(byte))
                .await
                .unwrap();
        }
        assert_eq!(cache.len().await, 2);

        cache.is_contract(&chain, Address::repeat_byte(3)).await.unwrap();
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_failure_is_not_cached() {
        let chain = MockChain::new();
        let cache = ContractCache::default();
        chain.fail_next(1);
        assert!(cache.is_contract(&chain, ALICE).await.is_err());
        assert!(cache.is_empty().await);
        assert!(!cache.is_contract(&chain, ALICE).await.unwrap());
    }
}
