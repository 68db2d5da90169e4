//! Confirmation-depth polling of one token contract's Transfer logs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256};
use alloy::sol_types::SolEvent;
use chrono::Utc;
use ledgerwatch_chain::{ChainSource, IERC20, LogQuery, decode_transfer};
use ledgerwatch_core::{AppError, period};
use ledgerwatch_storage::Ledger;
use ledgerwatch_storage::models::NewErc20Transfer;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::activity::DirtyPeriods;
use crate::records::transfer_record;
use crate::stats::StatsAccumulator;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// (transaction hash, block number, log index)
type EventKey = (B256, u64, u64);

pub struct LogPoller {
    chain: Arc<dyn ChainSource>,
    ledger: Arc<dyn Ledger>,
    stats: StatsAccumulator,
    dirty: DirtyPeriods,
    contract: Address,
    confirmations: u64,
    batch_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    /// Highest block already polled. In memory only; seeded on first tick.
    last_block: Option<u64>,
    /// Events seen in the poll in progress.
    seen: HashSet<EventKey>,
}

impl LogPoller {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        ledger: Arc<dyn Ledger>,
        stats: StatsAccumulator,
        contract: Address,
        confirmations: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            chain,
            ledger,
            stats,
            dirty: DirtyPeriods::default(),
            contract,
            confirmations,
            batch_size: batch_size.max(1),
            retry_attempts: RETRY_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            last_block: None,
            seen: HashSet::new(),
        }
    }

    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    /// Flag the period of every inserted transfer in `dirty`.
    pub fn with_dirty_periods(mut self, dirty: DirtyPeriods) -> Self {
        self.dirty = dirty;
        self
    }

    pub fn last_block(&self) -> Option<u64> {
        self.last_block
    }

    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        tracing::info!(contract = %self.contract, confirmations = self.confirmations, "Log poller started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.tick(&cancel).await {
                tracing::error!(error = %e, "Log poll gave up until next tick");
            }
        }
        tracing::info!("Log poller stopped");
    }

    /// One poll with in-tick retries and linear backoff. Returns the number
    /// of transfer rows newly inserted.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<u64, AppError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.poll().await {
                Ok(inserted) => return Ok(inserted),
                Err(e) => e,
            };
            if attempt >= self.retry_attempts {
                return Err(err);
            }
            tracing::warn!(attempt, max = self.retry_attempts, error = %err, "Log poll failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return Err(err),
                _ = tokio::time::sleep(self.retry_delay * attempt) => {}
            }
        }
    }

    async fn poll(&mut self) -> Result<u64, AppError> {
        // Leftovers of a failed attempt must not suppress its retry.
        self.seen.clear();

        let head = self.chain.current_header().await?.number;
        let Some(last) = self.last_block else {
            let seed = head.saturating_sub(self.confirmations);
            tracing::info!(head, seed, "Seeded log poller cursor");
            self.last_block = Some(seed);
            return Ok(0);
        };
        if head < last + self.confirmations {
            return Ok(0);
        }
        let to = head - self.confirmations;
        if to <= last {
            return Ok(0);
        }

        let query = LogQuery {
            from_block: last + 1,
            to_block: to,
            address: Some(self.contract),
            topics: vec![IERC20::Transfer::SIGNATURE_HASH],
        };
        let logs = self.chain.filter_logs(&query).await?;

        let mut batch: Vec<NewErc20Transfer> = Vec::with_capacity(self.batch_size);
        let mut inserted = 0;
        let mut duplicates = 0;
        for log in &logs {
            let event = match decode_transfer(log) {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(tx = ?log.transaction_hash, error = %e, "Skipping undecodable log");
                    continue;
                }
            };
            if !self
                .seen
                .insert((event.transaction_hash, event.block_number, event.log_index))
            {
                duplicates += 1;
                continue;
            }
            let created_at = event
                .block_timestamp
                .map(period::from_unix)
                .unwrap_or_else(|| Utc::now().naive_utc());
            batch.push(transfer_record(&event, created_at));

            if batch.len() >= self.batch_size {
                inserted += self.flush(&mut batch).await?;
            }
        }
        if !batch.is_empty() {
            inserted += self.flush(&mut batch).await?;
        }

        self.seen.clear();
        self.last_block = Some(to);
        tracing::info!(
            from = last + 1,
            to,
            logs = logs.len(),
            inserted,
            duplicates,
            "Polled transfer logs"
        );
        Ok(inserted)
    }

    /// Insert `batch` and apply statistics for the rows that were new.
    ///
    /// Whether a row is the first of its (transaction, sender) pair is
    /// decided against the ledger before the insert, so replaying the same
    /// logs or a later block replay leaves the counters unchanged.
    async fn flush(&self, batch: &mut Vec<NewErc20Transfer>) -> Result<u64, AppError> {
        let mut checked = HashSet::new();
        let mut first_for_sender = HashSet::new();
        for row in batch.iter() {
            let key = (row.transaction_hash.clone(), row.from_address.clone());
            if checked.insert(key.clone())
                && !self.ledger.sender_transfer_exists(&key.0, &key.1).await?
            {
                first_for_sender.insert(key);
            }
        }

        let inserted = self.ledger.insert_transfers_batch(batch).await?;
        batch.clear();

        for row in &inserted {
            self.dirty.mark(row.created_at);
            let first = first_for_sender
                .remove(&(row.transaction_hash.clone(), row.from_address.clone()));
            if let Err(e) = self.stats.record_transfer(row, first).await {
                tracing::error!(
                    tx = %row.transaction_hash,
                    from = %row.from_address,
                    to = %row.to_address,
                    error = %e,
                    "Transfer stats update failed"
                );
            }
        }
        Ok(inserted.len() as u64)
    }
}
