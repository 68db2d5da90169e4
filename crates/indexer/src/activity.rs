//! 15-second windowed account activity over the ledger, with a
//! staleness-bounded cache in `account_activity`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use ledgerwatch_core::{AppError, period};
use ledgerwatch_storage::Ledger;
use ledgerwatch_storage::models::{AccountActivity, NewAccountActivity};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const WRITE_BACK_CAPACITY: usize = 1024;

pub struct ActivityAggregator {
    ledger: Arc<dyn Ledger>,
    writes: mpsc::Sender<NewAccountActivity>,
    dirty: DirtyPeriods,
}

/// Period starts that received ledger rows since the last refresh.
///
/// Ingest marks the periods it writes into so a refresh also covers blocks
/// that arrive long after their own window closed.
#[derive(Clone, Default)]
pub struct DirtyPeriods(Arc<Mutex<BTreeSet<NaiveDateTime>>>);

impl DirtyPeriods {
    pub fn mark(&self, at: NaiveDateTime) {
        self.lock().insert(period::period_start(at));
    }

    pub fn take(&self) -> BTreeSet<NaiveDateTime> {
        std::mem::take(&mut *self.lock())
    }

    fn restore(&self, periods: impl IntoIterator<Item = NaiveDateTime>) {
        self.lock().extend(periods);
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<NaiveDateTime>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Background writer draining the aggregator's cache write-backs.
pub struct WriteBack {
    ledger: Arc<dyn Ledger>,
    queue: mpsc::Receiver<NewAccountActivity>,
}

impl ActivityAggregator {
    pub fn new(ledger: Arc<dyn Ledger>, capacity: usize) -> (Self, WriteBack) {
        let (writes, queue) = mpsc::channel(capacity.max(1));
        let aggregator = Self {
            ledger: ledger.clone(),
            writes,
            dirty: DirtyPeriods::default(),
        };
        (aggregator, WriteBack { ledger, queue })
    }

    /// Shared handle ingest uses to flag periods for the next refresh.
    pub fn dirty_periods(&self) -> DirtyPeriods {
        self.dirty.clone()
    }

    /// Activity of `address` in the period containing `at`, or `None` when
    /// it neither sent a transaction nor a token transfer in that window.
    pub async fn get_activity(
        &self,
        address: &str,
        at: NaiveDateTime,
    ) -> Result<Option<NewAccountActivity>, AppError> {
        let start = period::period_start(at);
        let now = Utc::now().naive_utc();

        if let Some(row) = self.ledger.cached_activity(address, start).await? {
            if is_fresh(&row, now) {
                tracing::debug!(address, period = %start, "Activity cache hit");
                return Ok(Some(row.to_window()));
            }
        }
        tracing::debug!(address, period = %start, "Activity cache miss");

        let end = period::period_end(start);
        let summary = self.ledger.sender_tx_summary(address, start, end).await?;
        let transfers = self.ledger.sender_transfer_count(address, start, end).await?;
        if summary.transaction_count + transfers == 0 {
            return Ok(None);
        }

        let window = NewAccountActivity {
            address: address.to_string(),
            period: start,
            transaction_count: summary.transaction_count,
            volume_eth: summary.volume,
            token_transfers: transfers,
            updated_at: now,
        };
        self.write_back(window.clone());
        Ok(Some(window))
    }

    /// Activity of every sender active in the period containing `at`,
    /// ordered by address.
    pub async fn get_all_activity(
        &self,
        at: NaiveDateTime,
    ) -> Result<Vec<NewAccountActivity>, AppError> {
        let start = period::period_start(at);
        let end = period::period_end(start);
        let now = Utc::now().naive_utc();

        let senders = self.ledger.active_senders(start, end).await?;
        if senders.is_empty() {
            return Ok(Vec::new());
        }

        let fresh: HashMap<String, AccountActivity> = self
            .ledger
            .cached_activities_for_period(start)
            .await?
            .into_iter()
            .filter(|row| is_fresh(row, now))
            .map(|row| (row.address.clone(), row))
            .collect();

        let (cached, missing): (Vec<String>, Vec<String>) = senders
            .into_iter()
            .partition(|address| fresh.contains_key(address));

        let mut windows: Vec<NewAccountActivity> = cached
            .iter()
            .filter_map(|address| fresh.get(address).map(AccountActivity::to_window))
            .collect();

        if !missing.is_empty() {
            let summaries: HashMap<String, _> = self
                .ledger
                .tx_summaries_by_sender(&missing, start, end)
                .await?
                .into_iter()
                .map(|s| (s.address.clone(), s))
                .collect();

            for address in &missing {
                let transfers = self.ledger.sender_transfer_count(address, start, end).await?;
                let (count, volume) = summaries
                    .get(address)
                    .map(|s| (s.transaction_count, s.volume.clone()))
                    .unwrap_or((0, "0".to_string()));
                if count + transfers == 0 {
                    continue;
                }
                let window = NewAccountActivity {
                    address: address.clone(),
                    period: start,
                    transaction_count: count,
                    volume_eth: volume,
                    token_transfers: transfers,
                    updated_at: now,
                };
                self.write_back(window.clone());
                windows.push(window);
            }
        }

        tracing::debug!(
            period = %start,
            cached = cached.len(),
            recomputed = missing.len(),
            "Aggregated period activity"
        );
        windows.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(windows)
    }

    /// Materialized windows of `address` for periods in `[from, to)`,
    /// oldest first. Periods never refreshed are absent.
    pub async fn history(
        &self,
        address: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<Vec<NewAccountActivity>, AppError> {
        let rows = self.ledger.activity_history(address, from, to).await?;
        Ok(rows.iter().map(AccountActivity::to_window).collect())
    }

    /// Materialize every period flagged by ingest plus the current and
    /// previous wall-clock periods. Periods not reached because of an error
    /// stay flagged for the next refresh.
    pub async fn refresh(&self) -> Result<usize, AppError> {
        let current = period::current_period();
        let mut periods = self.dirty.take();
        periods.insert(current - period::period_length());
        periods.insert(current);

        let mut total = 0;
        let mut pending = periods.into_iter();
        while let Some(start) = pending.next() {
            match self.get_all_activity(start).await {
                Ok(windows) => total += windows.len(),
                Err(e) => {
                    self.dirty.restore(std::iter::once(start).chain(pending));
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    pub async fn run_refresh(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "Activity refresh failed");
            }
        }
        tracing::info!("Activity refresh stopped");
    }

    /// Best-effort cache write. Dropped when the queue is full.
    fn write_back(&self, window: NewAccountActivity) {
        match self.writes.try_send(window) {
            Ok(()) => {}
            Err(TrySendError::Full(window)) => {
                tracing::debug!(address = %window.address, "Activity write-back queue full, dropping");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

fn is_fresh(row: &AccountActivity, now: NaiveDateTime) -> bool {
    now - row.updated_at < period::period_length()
}

impl WriteBack {
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.recv() => match next {
                    Some(window) => self.write(&window).await,
                    None => break,
                },
            }
        }
        let flushed = self.drain().await;
        tracing::info!(flushed, "Activity write-back stopped");
    }

    /// Write everything currently queued. Returns the number of rows taken.
    pub async fn drain(&mut self) -> usize {
        let mut taken = 0;
        while let Ok(window) = self.queue.try_recv() {
            self.write(&window).await;
            taken += 1;
        }
        taken
    }

    async fn write(&self, window: &NewAccountActivity) {
        if let Err(e) = self.ledger.upsert_activity(window).await {
            tracing::warn!(address = %window.address, period = %window.period, error = %e, "Activity write-back failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use ledgerwatch_storage::MemoryLedger;
    use ledgerwatch_storage::models::{NewErc20Transfer, NewTransaction, TX_STATUS_SUCCESS};

    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const ONE_ETH: &str = "1000000000000000000";

    fn window_start() -> NaiveDateTime {
        period::period_start(Utc::now().naive_utc())
    }

    async fn send(ledger: &MemoryLedger, n: u8, from: &str, at: NaiveDateTime) {
        ledger
            .insert_transaction(&NewTransaction {
                hash: format!("0x{n:064x}"),
                block_number: 1,
                from_address: from.to_string(),
                to_address: BOB.to_string(),
                value: ONE_ETH.to_string(),
                gas_used: 21_000,
                gas_price: "1".to_string(),
                status: TX_STATUS_SUCCESS,
                timestamp: at,
            })
            .await
            .unwrap();
    }

    async fn token_transfer(ledger: &MemoryLedger, n: u8, from: &str, at: NaiveDateTime) {
        ledger
            .insert_transfer(&NewErc20Transfer {
                transaction_hash: format!("0x{n:064x}"),
                contract_address: "0x1111111111111111111111111111111111111111".to_string(),
                from_address: from.to_string(),
                to_address: ALICE.to_string(),
                value: "5".to_string(),
                block_number: 1,
                log_index: 0,
                created_at: at,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn computes_window_from_ledger() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = window_start();
        for n in 1..=4 {
            send(&ledger, n, ALICE, start + TimeDelta::seconds(n as i64)).await;
        }
        // Next period, must not count.
        send(&ledger, 9, ALICE, period::period_end(start)).await;

        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 16);
        let window = aggregator.get_activity(ALICE, start).await.unwrap().unwrap();
        assert_eq!(window.transaction_count, 4);
        assert_eq!(window.volume_eth, "4000000000000000000");
        assert_eq!(window.token_transfers, 0);

        assert_eq!(write_back.drain().await, 1);
        let cached = ledger.cached_activity(ALICE, start).await.unwrap().unwrap();
        assert_eq!(cached.transaction_count, 4);
    }

    #[tokio::test]
    async fn inactive_address_writes_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 16);
        assert!(aggregator.get_activity(ALICE, window_start()).await.unwrap().is_none());
        assert_eq!(write_back.drain().await, 0);
        assert!(ledger.activities().is_empty());
    }

    #[tokio::test]
    async fn fresh_cache_is_served_and_stale_is_recomputed() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = window_start();
        send(&ledger, 1, ALICE, start).await;
        let (aggregator, _write_back) = ActivityAggregator::new(ledger.clone(), 16);

        let mut cached = NewAccountActivity {
            address: ALICE.to_string(),
            period: start,
            transaction_count: 7,
            volume_eth: "7".to_string(),
            token_transfers: 0,
            updated_at: Utc::now().naive_utc(),
        };
        ledger.upsert_activity(&cached).await.unwrap();
        let hit = aggregator.get_activity(ALICE, start).await.unwrap().unwrap();
        assert_eq!(hit.transaction_count, 7);

        cached.updated_at = Utc::now().naive_utc() - TimeDelta::seconds(20);
        ledger.upsert_activity(&cached).await.unwrap();
        let miss = aggregator.get_activity(ALICE, start).await.unwrap().unwrap();
        assert_eq!(miss.transaction_count, 1);
        assert_eq!(miss.volume_eth, ONE_ETH);
    }

    #[tokio::test]
    async fn all_activity_merges_cached_and_recomputed() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = window_start();
        send(&ledger, 1, ALICE, start).await;
        token_transfer(&ledger, 2, BOB, start).await;
        token_transfer(&ledger, 3, BOB, start).await;

        ledger
            .upsert_activity(&NewAccountActivity {
                address: ALICE.to_string(),
                period: start,
                transaction_count: 1,
                volume_eth: ONE_ETH.to_string(),
                token_transfers: 0,
                updated_at: Utc::now().naive_utc(),
            })
            .await
            .unwrap();

        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 16);
        let windows = aggregator.get_all_activity(start).await.unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].address, ALICE);
        assert_eq!(windows[1].address, BOB);
        assert_eq!(windows[1].transaction_count, 0);
        assert_eq!(windows[1].token_transfers, 2);

        // Only the recomputed window is written back.
        assert_eq!(write_back.drain().await, 1);
    }

    #[tokio::test]
    async fn refresh_covers_marked_past_periods() {
        let ledger = Arc::new(MemoryLedger::new());
        let old = window_start() - TimeDelta::minutes(5);
        send(&ledger, 1, ALICE, old).await;
        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 16);

        assert_eq!(aggregator.refresh().await.unwrap(), 0);
        aggregator.dirty_periods().mark(old + TimeDelta::seconds(3));
        assert_eq!(aggregator.refresh().await.unwrap(), 1);
        assert_eq!(write_back.drain().await, 1);
        assert!(ledger.cached_activity(ALICE, old).await.unwrap().is_some());

        // Marks are consumed by a successful refresh.
        assert!(aggregator.dirty_periods().take().is_empty());
    }

    #[tokio::test]
    async fn history_lists_materialized_windows_oldest_first() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = window_start() - TimeDelta::minutes(2);
        let step = period::period_length();
        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 16);
        for (n, offset) in [(1u8, 2), (2, 0), (3, 1), (4, 3)] {
            let at = start + step * offset;
            send(&ledger, n, ALICE, at).await;
            aggregator.get_all_activity(at).await.unwrap();
        }
        send(&ledger, 9, BOB, start).await;
        aggregator.get_all_activity(start).await.unwrap();
        write_back.drain().await;

        let windows = aggregator.history(ALICE, start, start + step * 3).await.unwrap();
        let periods: Vec<NaiveDateTime> = windows.iter().map(|w| w.period).collect();
        assert_eq!(periods, vec![start, start + step, start + step * 2]);
        assert!(windows.iter().all(|w| w.address == ALICE));
    }

    #[test]
    fn dirty_periods_collapse_to_period_start() {
        let dirty = DirtyPeriods::default();
        let start = window_start();
        dirty.mark(start);
        dirty.mark(start + TimeDelta::seconds(14));
        dirty.mark(period::period_end(start));
        let taken: Vec<NaiveDateTime> = dirty.take().into_iter().collect();
        assert_eq!(taken, vec![start, period::period_end(start)]);
    }

    #[tokio::test]
    async fn full_queue_drops_write_back() {
        let ledger = Arc::new(MemoryLedger::new());
        let start = window_start();
        send(&ledger, 1, ALICE, start).await;
        let (aggregator, mut write_back) = ActivityAggregator::new(ledger.clone(), 1);

        aggregator.get_activity(ALICE, start).await.unwrap();
        aggregator.get_activity(ALICE, start).await.unwrap();
        assert_eq!(write_back.drain().await, 1);
    }
}
