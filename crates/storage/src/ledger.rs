//! The persistence contract shared by the PostgreSQL and in-memory stores.
//!
//! All appends are idempotent: inserting a row whose uniqueness key already
//! exists reports `false` (or a smaller count) instead of failing. Any other
//! failure is returned to the caller, which must not advance its cursor.

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::error::StorageResult;
use crate::models::*;

#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    // ── Ledger rows ─────────────────────────────────────────────────────

    /// Insert a transaction. Returns `true` if a new row was written.
    async fn insert_transaction(&self, tx: &NewTransaction) -> StorageResult<bool>;

    async fn transaction_exists(&self, hash: &str) -> StorageResult<bool>;

    /// Insert a transfer. Returns `true` if a new row was written.
    async fn insert_transfer(&self, transfer: &NewErc20Transfer) -> StorageResult<bool>;

    /// Insert many transfers at once. Returns the rows that were new.
    async fn insert_transfers_batch(
        &self,
        transfers: &[NewErc20Transfer],
    ) -> StorageResult<Vec<NewErc20Transfer>>;

    /// Whether a transfer row sent by `from_address` already exists in `tx_hash`.
    async fn sender_transfer_exists(&self, tx_hash: &str, from_address: &str)
    -> StorageResult<bool>;

    // ── Cursors ─────────────────────────────────────────────────────────

    /// Last fully processed block, 0 on first run.
    async fn get_cursor_block(&self) -> StorageResult<u64>;

    /// Raise the block cursor to `block`; lower or equal values are no-ops.
    async fn advance_cursor_block(&self, block: u64) -> StorageResult<()>;

    /// Last activity row id consumed by the notifier, created at 0 if absent.
    async fn get_activity_cursor(&self) -> StorageResult<i64>;

    /// Raise the activity cursor to `id`; lower or equal values are no-ops.
    async fn advance_activity_cursor(&self, id: i64) -> StorageResult<()>;

    // ── Account stats & balances ────────────────────────────────────────

    async fn get_or_create_account_stats(&self, address: &str) -> StorageResult<AccountStats>;

    async fn save_account_stats(&self, stats: &AccountStats) -> StorageResult<()>;

    async fn account_stats(&self, address: &str) -> StorageResult<Option<AccountStats>>;

    /// Apply a transfer to token balances and account stats atomically.
    ///
    /// Debits the sender (floored at zero) and credits the recipient, skipping
    /// the zero side of mints and burns, and refreshes each party's
    /// `unique_tokens_count`. With `count_for_sender` the sender's
    /// `erc20_transactions` also moves by one. Either every change lands or
    /// none does.
    async fn apply_transfer_effects(
        &self,
        transfer: &NewErc20Transfer,
        count_for_sender: bool,
    ) -> StorageResult<()>;

    /// Token balances of `address` that are non-zero.
    async fn token_balances(&self, address: &str) -> StorageResult<Vec<TokenBalance>>;

    // ── Window queries over `[start, end)` ──────────────────────────────

    /// Count and summed value of successful transactions sent by `address`.
    async fn sender_tx_summary(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<SenderSummary>;

    /// Number of token transfers sent by `address`.
    async fn sender_transfer_count(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<i64>;

    /// Distinct non-zero senders of successful transactions or transfers.
    async fn active_senders(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<String>>;

    /// [`Ledger::sender_tx_summary`] for many senders in one grouped query.
    /// Senders without transactions are omitted.
    async fn tx_summaries_by_sender(
        &self,
        addresses: &[String],
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<SenderSummary>>;

    // ── Activity cache ──────────────────────────────────────────────────

    async fn cached_activity(
        &self,
        address: &str,
        period: NaiveDateTime,
    ) -> StorageResult<Option<AccountActivity>>;

    async fn cached_activities_for_period(
        &self,
        period: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>>;

    /// Write a computed window. A changed row receives a new `id` so the
    /// notifier sees it again, which re-alerts a window that was already
    /// past the threshold. An unchanged row only refreshes `updated_at`.
    async fn upsert_activity(&self, activity: &NewAccountActivity) -> StorageResult<()>;

    /// Activity rows with `id > after`, ordered by id, at most `limit`.
    async fn activities_after(&self, after: i64, limit: i64) -> StorageResult<Vec<AccountActivity>>;

    /// Cached periods of one address with `from <= period < to`.
    async fn activity_history(
        &self,
        address: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>>;
}
