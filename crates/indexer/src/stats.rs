//! Running per-account statistics, updated as ledger rows are appended.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::NaiveDateTime;
use ledgerwatch_chain::{ChainSource, ChainTransaction, ZERO_ADDRESS, format_address};
use ledgerwatch_core::{AppError, amount};
use ledgerwatch_storage::Ledger;
use ledgerwatch_storage::models::{AccountStats, NewErc20Transfer};

use crate::contract_cache::ContractCache;

#[derive(Clone)]
pub struct StatsAccumulator {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn ChainSource>,
    contracts: Arc<ContractCache>,
}

impl StatsAccumulator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn ChainSource>,
        contracts: Arc<ContractCache>,
    ) -> Self {
        Self {
            ledger,
            chain,
            contracts,
        }
    }

    /// Apply a newly appended successful transaction.
    ///
    /// Contract creations and transfers to the zero address leave stats
    /// untouched. Recipients that hold code only get their sender side
    /// counted, never an activity update of their own.
    pub async fn record_transaction(
        &self,
        tx: &ChainTransaction,
        at: NaiveDateTime,
    ) -> Result<(), AppError> {
        let Some(to) = tx.to else {
            return Ok(());
        };
        if to == ZERO_ADDRESS {
            return Ok(());
        }

        let mut sender = self
            .ledger
            .get_or_create_account_stats(&format_address(&tx.from))
            .await?;
        sender.total_transactions += 1;
        sender.total_volume_eth = amount::add(&sender.total_volume_eth, &tx.value.to_string())?;
        sender.touch(at);
        self.refresh_balance(&mut sender, tx.from).await;
        self.ledger.save_account_stats(&sender).await?;

        if self.contracts.is_contract(self.chain.as_ref(), to).await? {
            return Ok(());
        }

        let mut recipient = self
            .ledger
            .get_or_create_account_stats(&format_address(&to))
            .await?;
        recipient.touch(at);
        self.refresh_balance(&mut recipient, to).await;
        self.ledger.save_account_stats(&recipient).await?;
        Ok(())
    }

    /// Apply a newly appended token transfer row.
    ///
    /// `first_for_sender` is whether no transfer row from the same sender in
    /// the same transaction existed before this one, so the sender's ERC20
    /// counter moves once per transaction. Both sides land in one ledger
    /// write; the zero side of mints and burns is skipped.
    pub async fn record_transfer(
        &self,
        transfer: &NewErc20Transfer,
        first_for_sender: bool,
    ) -> Result<(), AppError> {
        self.ledger
            .apply_transfer_effects(transfer, first_for_sender)
            .await?;
        Ok(())
    }

    /// Current ETH balance straight from the chain.
    pub async fn calculate_eth_balance(&self, address: Address) -> Result<U256, AppError> {
        self.chain.balance_at(address).await
    }

    async fn refresh_balance(&self, stats: &mut AccountStats, address: Address) {
        match self.calculate_eth_balance(address).await {
            Ok(balance) => stats.eth_balance = balance.to_string(),
            Err(e) => {
                tracing::warn!(address = %stats.address, error = %e, "ETH balance refresh failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::transfer_record;
    use crate::test_utils::{MockChain, ether, eth_transfer, hash};
    use alloy::primitives::{Bytes, address};
    use ledgerwatch_chain::TransferEvent;
    use ledgerwatch_core::period;
    use ledgerwatch_storage::MemoryLedger;

    const TOKEN: Address = address!("1111111111111111111111111111111111111111");
    const ALICE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const BOB: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");

    fn setup() -> (Arc<MemoryLedger>, Arc<MockChain>, StatsAccumulator) {
        let ledger = Arc::new(MemoryLedger::new());
        let chain = Arc::new(MockChain::new());
        let stats = StatsAccumulator::new(
            ledger.clone(),
            chain.clone(),
            Arc::new(ContractCache::default()),
        );
        (ledger, chain, stats)
    }

    fn transfer(from: Address, to: Address, value: u64, tx: u8) -> NewErc20Transfer {
        let event = TransferEvent {
            token_address: TOKEN,
            from,
            to,
            value: U256::from(value),
            transaction_hash: hash(tx),
            block_number: 1,
            log_index: 0,
            block_timestamp: None,
        };
        transfer_record(&event, period::from_unix(1_700_000_000))
    }

    #[tokio::test]
    async fn sender_and_recipient_stats() {
        let (ledger, chain, stats) = setup();
        chain.set_balance(ALICE, ether(9));
        let at = period::from_unix(1_700_000_000);

        for n in 1..=2u8 {
            let tx = eth_transfer(hash(n), ALICE, BOB, ether(1));
            stats.record_transaction(&tx, at).await.unwrap();
        }

        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.total_transactions, 2);
        assert_eq!(alice.total_volume_eth, ether(2).to_string());
        assert_eq!(alice.eth_balance, ether(9).to_string());
        assert_eq!(alice.first_activity_at, Some(at));

        let bob = ledger.account_stats(&format_address(&BOB)).await.unwrap().unwrap();
        assert_eq!(bob.total_transactions, 0);
        assert_eq!(bob.last_activity_at, Some(at));
    }

    #[tokio::test]
    async fn contract_recipient_and_zero_recipient() {
        let (ledger, chain, stats) = setup();
        chain.set_code(TOKEN, Bytes::from_static(&[0x60]));
        let at = period::from_unix(1_700_000_000);

        stats
            .record_transaction(&eth_transfer(hash(1), ALICE, TOKEN, U256::ZERO), at)
            .await
            .unwrap();
        assert!(ledger.account_stats(&format_address(&TOKEN)).await.unwrap().is_none());

        stats
            .record_transaction(&eth_transfer(hash(2), BOB, ZERO_ADDRESS, ether(1)), at)
            .await
            .unwrap();
        assert!(ledger.account_stats(&format_address(&BOB)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn balance_failure_does_not_block_stats() {
        let (ledger, chain, stats) = setup();
        let at = period::from_unix(1_700_000_000);
        // First chain call is the sender's balance lookup.
        chain.fail_next(1);
        stats
            .record_transaction(&eth_transfer(hash(1), ALICE, BOB, ether(1)), at)
            .await
            .unwrap();
        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.total_transactions, 1);
        assert_eq!(alice.eth_balance, "0");
    }

    #[tokio::test]
    async fn mint_leaves_zero_address_untouched() {
        let (ledger, _chain, stats) = setup();
        stats
            .record_transfer(&transfer(ZERO_ADDRESS, BOB, 100, 1), true)
            .await
            .unwrap();

        let token = format_address(&TOKEN);
        assert_eq!(ledger.token_balance(&format_address(&BOB), &token), Some("100".into()));
        assert_eq!(ledger.token_balance(&format_address(&ZERO_ADDRESS), &token), None);
        assert!(ledger
            .account_stats(&format_address(&ZERO_ADDRESS))
            .await
            .unwrap()
            .is_none());
        let bob = ledger.account_stats(&format_address(&BOB)).await.unwrap().unwrap();
        assert_eq!(bob.unique_tokens_count, 1);
        assert_eq!(bob.erc20_transactions, 0);
    }

    #[tokio::test]
    async fn erc20_count_once_per_transaction() {
        let (ledger, _chain, stats) = setup();
        stats.record_transfer(&transfer(ZERO_ADDRESS, ALICE, 50, 1), true).await.unwrap();
        stats.record_transfer(&transfer(ALICE, BOB, 10, 2), true).await.unwrap();
        stats.record_transfer(&transfer(ALICE, BOB, 10, 2), false).await.unwrap();

        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.erc20_transactions, 1);
        assert_eq!(
            ledger.token_balance(&format_address(&ALICE), &format_address(&TOKEN)),
            Some("30".into())
        );
    }

    #[tokio::test]
    async fn overdraw_floors_and_drops_token_count() {
        let (ledger, _chain, stats) = setup();
        stats.record_transfer(&transfer(ZERO_ADDRESS, ALICE, 5, 1), true).await.unwrap();
        stats.record_transfer(&transfer(ALICE, BOB, 8, 2), true).await.unwrap();

        assert_eq!(
            ledger.token_balance(&format_address(&ALICE), &format_address(&TOKEN)),
            Some("0".into())
        );
        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.unique_tokens_count, 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_both_sides_untouched() {
        let (ledger, _chain, stats) = setup();
        stats.record_transfer(&transfer(ZERO_ADDRESS, ALICE, 20, 1), true).await.unwrap();

        ledger.set_fail_writes(true);
        assert!(stats.record_transfer(&transfer(ALICE, BOB, 8, 2), true).await.is_err());
        ledger.set_fail_writes(false);

        let token = format_address(&TOKEN);
        assert_eq!(ledger.token_balance(&format_address(&ALICE), &token), Some("20".into()));
        assert_eq!(ledger.token_balance(&format_address(&BOB), &token), None);
        assert!(ledger.account_stats(&format_address(&BOB)).await.unwrap().is_none());
        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.erc20_transactions, 0);
    }
}
