//! In-memory [`Ledger`] with the same idempotency and cursor semantics as
//! the PostgreSQL store, for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use ledgerwatch_core::amount;

use crate::error::{StorageError, StorageResult};
use crate::ledger::Ledger;
use crate::models::*;

type TransferKey = (String, String, String, String, i64);

#[derive(Default)]
struct State {
    transactions: Vec<Transaction>,
    tx_hashes: HashSet<String>,
    transfers: Vec<Erc20Transfer>,
    transfer_keys: HashSet<TransferKey>,
    cursor_block: Option<u64>,
    activity_cursor: Option<i64>,
    stats: HashMap<String, AccountStats>,
    balances: BTreeMap<(String, String), TokenBalance>,
    activity: BTreeMap<(String, NaiveDateTime), AccountActivity>,
    next_id: i64,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_transfer(&mut self, t: &NewErc20Transfer) -> bool {
        let key = (
            t.transaction_hash.clone(),
            t.contract_address.clone(),
            t.from_address.clone(),
            t.to_address.clone(),
            t.log_index,
        );
        if !self.transfer_keys.insert(key) {
            return false;
        }
        let id = self.next_id();
        self.transfers.push(Erc20Transfer {
            id,
            transaction_hash: t.transaction_hash.clone(),
            contract_address: t.contract_address.clone(),
            from_address: t.from_address.clone(),
            to_address: t.to_address.clone(),
            value: t.value.clone(),
            block_number: t.block_number,
            log_index: t.log_index,
            created_at: t.created_at,
        });
        true
    }

    fn sender_summary(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<SenderSummary> {
        let values: Vec<&str> = self
            .transactions
            .iter()
            .filter(|tx| {
                tx.from_address == address
                    && tx.status == TX_STATUS_SUCCESS
                    && tx.timestamp >= start
                    && tx.timestamp < end
            })
            .map(|tx| tx.value.as_str())
            .collect();
        Ok(SenderSummary {
            address: address.to_string(),
            transaction_count: values.len() as i64,
            volume: amount::sum(values).map_err(invalid_amount)?,
        })
    }
}

fn invalid_amount(err: ledgerwatch_core::AppError) -> StorageError {
    StorageError::InvalidAmount(err.to_string())
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<State>,
    fail_writes: AtomicBool,
    fail_cursor_writes: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every ledger row insert fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every cursor advance fail until reset.
    pub fn set_fail_cursor_writes(&self, fail: bool) {
        self.fail_cursor_writes.store(fail, Ordering::SeqCst);
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.state().map(|s| s.transactions.clone()).unwrap_or_default()
    }

    pub fn transfers(&self) -> Vec<Erc20Transfer> {
        self.state().map(|s| s.transfers.clone()).unwrap_or_default()
    }

    pub fn activities(&self) -> Vec<AccountActivity> {
        let mut rows: Vec<AccountActivity> = self
            .state()
            .map(|s| s.activity.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|a| a.id);
        rows
    }

    /// Stored balance including zero balances, `None` if never touched.
    pub fn token_balance(&self, address: &str, token_address: &str) -> Option<String> {
        self.state().ok().and_then(|s| {
            s.balances
                .get(&(address.to_string(), token_address.to_string()))
                .map(|b| b.balance.clone())
        })
    }

    fn state(&self) -> StorageResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StorageError::Unavailable("memory ledger lock poisoned".into()))
    }

    fn check_writes(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    fn check_cursor_writes(&self) -> StorageResult<()> {
        if self.fail_cursor_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("injected cursor failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_transaction(&self, tx: &NewTransaction) -> StorageResult<bool> {
        self.check_writes()?;
        let mut state = self.state()?;
        if !state.tx_hashes.insert(tx.hash.clone()) {
            return Ok(false);
        }
        let id = state.next_id();
        state.transactions.push(Transaction {
            id,
            hash: tx.hash.clone(),
            block_number: tx.block_number,
            from_address: tx.from_address.clone(),
            to_address: tx.to_address.clone(),
            value: tx.value.clone(),
            gas_used: tx.gas_used,
            gas_price: tx.gas_price.clone(),
            status: tx.status,
            timestamp: tx.timestamp,
        });
        Ok(true)
    }

    async fn transaction_exists(&self, hash: &str) -> StorageResult<bool> {
        Ok(self.state()?.tx_hashes.contains(hash))
    }

    async fn insert_transfer(&self, transfer: &NewErc20Transfer) -> StorageResult<bool> {
        self.check_writes()?;
        Ok(self.state()?.insert_transfer(transfer))
    }

    async fn insert_transfers_batch(
        &self,
        transfers: &[NewErc20Transfer],
    ) -> StorageResult<Vec<NewErc20Transfer>> {
        self.check_writes()?;
        let mut state = self.state()?;
        Ok(transfers
            .iter()
            .filter(|t| state.insert_transfer(t))
            .cloned()
            .collect())
    }

    async fn sender_transfer_exists(
        &self,
        tx_hash: &str,
        from_address: &str,
    ) -> StorageResult<bool> {
        Ok(self
            .state()?
            .transfers
            .iter()
            .any(|t| t.transaction_hash == tx_hash && t.from_address == from_address))
    }

    async fn get_cursor_block(&self) -> StorageResult<u64> {
        Ok(self.state()?.cursor_block.unwrap_or(0))
    }

    async fn advance_cursor_block(&self, block: u64) -> StorageResult<()> {
        self.check_cursor_writes()?;
        let mut state = self.state()?;
        if state.cursor_block.is_none_or(|current| block > current) {
            state.cursor_block = Some(block);
        }
        Ok(())
    }

    async fn get_activity_cursor(&self) -> StorageResult<i64> {
        Ok(*self.state()?.activity_cursor.get_or_insert(0))
    }

    async fn advance_activity_cursor(&self, id: i64) -> StorageResult<()> {
        self.check_cursor_writes()?;
        let mut state = self.state()?;
        let current = state.activity_cursor.get_or_insert(0);
        if id > *current {
            *current = id;
        }
        Ok(())
    }

    async fn get_or_create_account_stats(&self, address: &str) -> StorageResult<AccountStats> {
        let now = Utc::now().naive_utc();
        Ok(self
            .state()?
            .stats
            .entry(address.to_string())
            .or_insert_with(|| AccountStats::new(address, now))
            .clone())
    }

    async fn save_account_stats(&self, stats: &AccountStats) -> StorageResult<()> {
        let mut state = self.state()?;
        if let Some(row) = state.stats.get_mut(&stats.address) {
            *row = AccountStats {
                updated_at: Utc::now().naive_utc(),
                ..stats.clone()
            };
        }
        Ok(())
    }

    async fn account_stats(&self, address: &str) -> StorageResult<Option<AccountStats>> {
        Ok(self.state()?.stats.get(address).cloned())
    }

    async fn apply_transfer_effects(
        &self,
        transfer: &NewErc20Transfer,
        count_for_sender: bool,
    ) -> StorageResult<()> {
        self.check_writes()?;
        let now = Utc::now().naive_utc();
        let mut state = self.state()?;
        let sides: Vec<(&String, bool)> = [
            (&transfer.from_address, false),
            (&transfer.to_address, true),
        ]
        .into_iter()
        .filter(|(address, _)| address.as_str() != ZERO_ADDRESS)
        .collect();

        // Stage every balance before touching state so a bad amount applies nothing.
        let mut staged: HashMap<(String, String), String> = HashMap::new();
        for &(address, credit) in &sides {
            let key = (address.clone(), transfer.contract_address.clone());
            let current = staged
                .get(&key)
                .cloned()
                .or_else(|| state.balances.get(&key).map(|b| b.balance.clone()))
                .unwrap_or_else(|| "0".to_string());
            let next = if credit {
                amount::add(&current, &transfer.value)
            } else {
                amount::sub_floor(&current, &transfer.value)
            }
            .map_err(invalid_amount)?;
            staged.insert(key, next);
        }

        for ((address, token_address), balance) in staged {
            state.balances.insert(
                (address.clone(), token_address.clone()),
                TokenBalance {
                    address,
                    token_address,
                    balance,
                    updated_at: now,
                },
            );
        }
        for (address, credit) in sides {
            let held = state
                .balances
                .values()
                .filter(|b| &b.address == address && !amount::is_zero(&b.balance))
                .count() as i64;
            let stats = state
                .stats
                .entry(address.clone())
                .or_insert_with(|| AccountStats::new(address, now));
            if !credit && count_for_sender {
                stats.erc20_transactions += 1;
            }
            stats.unique_tokens_count = held;
            stats.updated_at = now;
        }
        Ok(())
    }

    async fn token_balances(&self, address: &str) -> StorageResult<Vec<TokenBalance>> {
        Ok(self
            .state()?
            .balances
            .values()
            .filter(|b| b.address == address && !amount::is_zero(&b.balance))
            .cloned()
            .collect())
    }

    async fn sender_tx_summary(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<SenderSummary> {
        self.state()?.sender_summary(address, start, end)
    }

    async fn sender_transfer_count(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<i64> {
        Ok(self
            .state()?
            .transfers
            .iter()
            .filter(|t| t.from_address == address && t.created_at >= start && t.created_at < end)
            .count() as i64)
    }

    async fn active_senders(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<String>> {
        let state = self.state()?;
        let mut senders: Vec<String> = state
            .transactions
            .iter()
            .filter(|tx| tx.status == TX_STATUS_SUCCESS && tx.timestamp >= start && tx.timestamp < end)
            .map(|tx| tx.from_address.clone())
            .chain(
                state
                    .transfers
                    .iter()
                    .filter(|t| {
                        t.created_at >= start && t.created_at < end && t.from_address != ZERO_ADDRESS
                    })
                    .map(|t| t.from_address.clone()),
            )
            .collect();
        senders.sort();
        senders.dedup();
        Ok(senders)
    }

    async fn tx_summaries_by_sender(
        &self,
        addresses: &[String],
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<SenderSummary>> {
        let state = self.state()?;
        let mut summaries = Vec::new();
        for address in addresses {
            let summary = state.sender_summary(address, start, end)?;
            if summary.transaction_count > 0 {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    async fn cached_activity(
        &self,
        address: &str,
        period: NaiveDateTime,
    ) -> StorageResult<Option<AccountActivity>> {
        Ok(self
            .state()?
            .activity
            .get(&(address.to_string(), period))
            .cloned())
    }

    async fn cached_activities_for_period(
        &self,
        period: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>> {
        Ok(self
            .state()?
            .activity
            .values()
            .filter(|a| a.period == period)
            .cloned()
            .collect())
    }

    async fn upsert_activity(&self, activity: &NewAccountActivity) -> StorageResult<()> {
        let mut state = self.state()?;
        let key = (activity.address.clone(), activity.period);
        let fresh_id = state.next_id();
        match state.activity.get_mut(&key) {
            Some(row) => {
                let changed = row.transaction_count != activity.transaction_count
                    || row.token_transfers != activity.token_transfers
                    || row.volume_eth != activity.volume_eth;
                if changed {
                    row.id = fresh_id;
                    row.transaction_count = activity.transaction_count;
                    row.token_transfers = activity.token_transfers;
                    row.volume_eth = activity.volume_eth.clone();
                }
                row.updated_at = activity.updated_at;
            }
            None => {
                state.activity.insert(
                    key,
                    AccountActivity {
                        id: fresh_id,
                        address: activity.address.clone(),
                        period: activity.period,
                        transaction_count: activity.transaction_count,
                        volume_eth: activity.volume_eth.clone(),
                        token_transfers: activity.token_transfers,
                        updated_at: activity.updated_at,
                    },
                );
            }
        }
        Ok(())
    }

    async fn activities_after(&self, after: i64, limit: i64) -> StorageResult<Vec<AccountActivity>> {
        let mut rows: Vec<AccountActivity> = self
            .state()?
            .activity
            .values()
            .filter(|a| a.id > after)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.id);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn activity_history(
        &self,
        address: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>> {
        let mut rows: Vec<AccountActivity> = self
            .state()?
            .activity
            .values()
            .filter(|a| a.address == address && a.period >= from && a.period < to)
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.period);
        Ok(rows)
    }
}
