//! Resumable block-range replay into the ledger.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use ledgerwatch_chain::{ChainBlock, ChainSource, ChainTransaction, decode_transfer};
use ledgerwatch_core::{AppError, period};
use ledgerwatch_storage::Ledger;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activity::DirtyPeriods;
use crate::records::{transaction_record, transfer_record};
use crate::stats::StatsAccumulator;

pub struct BlockProcessor {
    chain: Arc<dyn ChainSource>,
    ledger: Arc<dyn Ledger>,
    stats: StatsAccumulator,
    start_block: u64,
    max_blocks_per_tick: u64,
    dirty: DirtyPeriods,
}

impl BlockProcessor {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        ledger: Arc<dyn Ledger>,
        stats: StatsAccumulator,
        start_block: u64,
        max_blocks_per_tick: u64,
    ) -> Self {
        Self {
            chain,
            ledger,
            stats,
            start_block,
            max_blocks_per_tick: max_blocks_per_tick.max(1),
            dirty: DirtyPeriods::default(),
        }
    }

    /// Flag the period of every processed block in `dirty`.
    pub fn with_dirty_periods(mut self, dirty: DirtyPeriods) -> Self {
        self.dirty = dirty;
        self
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(&cancel).await {
                tracing::error!(error = %e, "Block processing failed, retrying next tick");
            }
        }
        tracing::info!("Block processor stopped");
    }

    /// Replay the next bounded range of blocks. Returns how many blocks were
    /// fully processed. The cursor moves after every block, so an error only
    /// costs the block that failed.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<u64, AppError> {
        let head = self.chain.current_header().await?.number;
        let mut cursor = self.ledger.get_cursor_block().await?;
        if cursor == 0 && self.start_block > 0 {
            cursor = self.start_block - 1;
        }
        if head <= cursor {
            return Ok(0);
        }

        let to = head.min(cursor + self.max_blocks_per_tick);
        let mut processed = 0;
        for number in cursor + 1..=to {
            if cancel.is_cancelled() {
                break;
            }
            self.process_block(number).await?;
            self.ledger.advance_cursor_block(number).await?;
            processed += 1;
        }

        tracing::info!(from = cursor + 1, to, processed, head, "Indexed block range");
        Ok(processed)
    }

    async fn process_block(&self, number: u64) -> Result<(), AppError> {
        let block = self.chain.block_by_number(number).await?;
        let at = period::from_unix(block.timestamp);
        for tx in &block.transactions {
            self.process_transaction(&block, tx, at).await?;
        }
        self.dirty.mark(at);
        tracing::debug!(
            block = number,
            transactions = block.transactions.len(),
            "Block processed"
        );
        Ok(())
    }

    /// Persist one transaction and the transfers in its receipt.
    ///
    /// Rows already present are skipped by the ledger; statistics are only
    /// applied for rows this call actually inserted, so replaying a block
    /// after a crash leaves them unchanged.
    async fn process_transaction(
        &self,
        block: &ChainBlock,
        tx: &ChainTransaction,
        at: NaiveDateTime,
    ) -> Result<(), AppError> {
        let receipt = self.chain.transaction_receipt(tx.hash).await?;
        let row = transaction_record(tx, &receipt, block.number, at);

        let inserted = if self.ledger.transaction_exists(&row.hash).await? {
            false
        } else {
            self.ledger.insert_transaction(&row).await?
        };

        if !row.is_success() || row.is_contract_creation() {
            return Ok(());
        }

        if inserted {
            if let Err(e) = self.stats.record_transaction(tx, at).await {
                tracing::error!(tx = %row.hash, error = %e, "Transaction stats update failed");
            }
        }

        for log in &receipt.logs {
            let event = match decode_transfer(log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(tx = %row.hash, log_index = ?log.log_index, error = %e, "Skipping undecodable log");
                    continue;
                }
            };
            let transfer = transfer_record(&event, at);
            let first_for_sender = !self
                .ledger
                .sender_transfer_exists(&transfer.transaction_hash, &transfer.from_address)
                .await?;
            if self.ledger.insert_transfer(&transfer).await? {
                if let Err(e) = self.stats.record_transfer(&transfer, first_for_sender).await {
                    tracing::error!(
                        tx = %row.hash,
                        from = %transfer.from_address,
                        to = %transfer.to_address,
                        error = %e,
                        "Transfer stats update failed"
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract_cache::ContractCache;
    use crate::test_utils::{MockChain, eth_transfer, ether, hash, receipt, transfer_log};
    use alloy::primitives::{Address, U256, address};
    use ledgerwatch_chain::format_address;
    use ledgerwatch_storage::MemoryLedger;

    const TOKEN: Address = address!("1111111111111111111111111111111111111111");
    const ALICE: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const BOB: Address = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    const T0: u64 = 1_700_000_010;

    fn processor(
        chain: &Arc<MockChain>,
        ledger: &Arc<MemoryLedger>,
        start_block: u64,
        max_blocks: u64,
    ) -> BlockProcessor {
        let stats = StatsAccumulator::new(
            ledger.clone(),
            chain.clone(),
            Arc::new(ContractCache::default()),
        );
        BlockProcessor::new(chain.clone(), ledger.clone(), stats, start_block, max_blocks)
    }

    /// Block `number` holding one 1 ETH transfer from ALICE to BOB.
    fn push_eth_block(chain: &MockChain, number: u64) {
        let tx = eth_transfer(hash(number as u8), ALICE, BOB, ether(1));
        chain.push_block(
            ChainBlock {
                number,
                timestamp: T0 + number,
                transactions: vec![tx],
            },
            vec![receipt(hash(number as u8), number, true, Vec::new())],
        );
    }

    #[tokio::test]
    async fn processes_in_bounded_batches() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        for n in 1..=5 {
            push_eth_block(&chain, n);
        }
        let processor = processor(&chain, &ledger, 0, 2);
        let cancel = CancellationToken::new();

        assert_eq!(processor.tick(&cancel).await.unwrap(), 2);
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 2);
        assert_eq!(processor.tick(&cancel).await.unwrap(), 2);
        assert_eq!(processor.tick(&cancel).await.unwrap(), 1);
        assert_eq!(processor.tick(&cancel).await.unwrap(), 0);
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 5);
        assert_eq!(ledger.transactions().len(), 5);

        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.total_transactions, 5);
        assert_eq!(alice.total_volume_eth, ether(5).to_string());
    }

    #[tokio::test]
    async fn starts_from_configured_block() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        for n in 1..=4 {
            push_eth_block(&chain, n);
        }
        let processor = processor(&chain, &ledger, 3, 10);
        assert_eq!(processor.tick(&CancellationToken::new()).await.unwrap(), 2);
        let blocks: Vec<i64> = ledger.transactions().iter().map(|t| t.block_number).collect();
        assert_eq!(blocks, vec![3, 4]);
    }

    #[tokio::test]
    async fn failing_block_stops_cursor_before_it() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        push_eth_block(&chain, 1);
        push_eth_block(&chain, 2);
        // Block 3 is announced by the head but not retrievable yet.
        chain.set_head(3, T0 + 3);
        let processor = processor(&chain, &ledger, 0, 10);

        assert!(processor.tick(&CancellationToken::new()).await.is_err());
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 2);

        push_eth_block(&chain, 3);
        assert_eq!(processor.tick(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn replay_after_crash_does_not_duplicate() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        for n in 99..=100 {
            push_eth_block(&chain, n);
        }
        let processor = processor(&chain, &ledger, 99, 10);

        // Block 100's rows land but the cursor write after it fails.
        ledger.advance_cursor_block(98).await.unwrap();
        processor.process_block(99).await.unwrap();
        ledger.advance_cursor_block(99).await.unwrap();
        processor.process_block(100).await.unwrap();
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 99);

        assert_eq!(processor.tick(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 100);
        assert_eq!(ledger.transactions().len(), 2);

        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.total_transactions, 2);
    }

    #[tokio::test]
    async fn cursor_write_failure_aborts_tick() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        push_eth_block(&chain, 1);
        let processor = processor(&chain, &ledger, 0, 10);

        ledger.set_fail_cursor_writes(true);
        assert!(processor.tick(&CancellationToken::new()).await.is_err());
        assert_eq!(ledger.get_cursor_block().await.unwrap(), 0);

        ledger.set_fail_cursor_writes(false);
        assert_eq!(processor.tick(&CancellationToken::new()).await.unwrap(), 1);
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[tokio::test]
    async fn reverted_and_creation_skip_stats_and_logs() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        let log = transfer_log(TOKEN, ALICE, BOB, U256::from(5u64), hash(1), 1, 0);
        let reverted = eth_transfer(hash(1), ALICE, BOB, ether(1));
        let mut creation = eth_transfer(hash(2), ALICE, BOB, U256::ZERO);
        creation.to = None;
        chain.push_block(
            ChainBlock {
                number: 1,
                timestamp: T0,
                transactions: vec![reverted, creation],
            },
            vec![
                receipt(hash(1), 1, false, vec![log]),
                receipt(hash(2), 1, true, Vec::new()),
            ],
        );

        processor(&chain, &ledger, 0, 10)
            .tick(&CancellationToken::new())
            .await
            .unwrap();

        let rows = ledger.transactions();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, 0);
        assert_eq!(rows[1].to_address, "");
        assert!(ledger.transfers().is_empty());
        assert!(ledger.account_stats(&format_address(&ALICE)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn receipt_transfers_are_recorded_once() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        let logs = vec![
            transfer_log(TOKEN, Address::ZERO, ALICE, U256::from(100u64), hash(1), 1, 0),
            transfer_log(TOKEN, ALICE, BOB, U256::from(30u64), hash(1), 1, 1),
            transfer_log(TOKEN, ALICE, BOB, U256::from(20u64), hash(1), 1, 2),
        ];
        let mut tx = eth_transfer(hash(1), ALICE, TOKEN, U256::ZERO);
        tx.gas_price = Some(7);
        chain.push_block(
            ChainBlock {
                number: 1,
                timestamp: T0,
                transactions: vec![tx],
            },
            vec![receipt(hash(1), 1, true, logs)],
        );
        let processor = processor(&chain, &ledger, 0, 10);

        processor.tick(&CancellationToken::new()).await.unwrap();
        processor.process_block(1).await.unwrap();

        assert_eq!(ledger.transfers().len(), 3);
        assert_eq!(ledger.transactions()[0].gas_price, "7");
        let token = format_address(&TOKEN);
        assert_eq!(ledger.token_balance(&format_address(&ALICE), &token), Some("50".into()));
        assert_eq!(ledger.token_balance(&format_address(&BOB), &token), Some("50".into()));
        let alice = ledger.account_stats(&format_address(&ALICE)).await.unwrap().unwrap();
        assert_eq!(alice.erc20_transactions, 1);
    }

    #[tokio::test]
    async fn marks_processed_block_periods() {
        let chain = Arc::new(MockChain::new());
        let ledger = Arc::new(MemoryLedger::new());
        push_eth_block(&chain, 1);
        push_eth_block(&chain, 40);
        for n in 2..40 {
            chain.push_block(
                ChainBlock {
                    number: n,
                    timestamp: T0 + n,
                    transactions: Vec::new(),
                },
                Vec::new(),
            );
        }
        let dirty = DirtyPeriods::default();
        processor(&chain, &ledger, 0, 100)
            .with_dirty_periods(dirty.clone())
            .tick(&CancellationToken::new())
            .await
            .unwrap();

        let periods: Vec<NaiveDateTime> = dirty.take().into_iter().collect();
        let first = period::period_start(period::from_unix(T0 + 1));
        assert_eq!(periods.first(), Some(&first));
        assert_eq!(
            periods.last(),
            Some(&period::period_start(period::from_unix(T0 + 40)))
        );
        assert_eq!(periods.len(), 3);
    }
}
