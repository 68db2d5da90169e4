use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::PgPool;

use crate::error::{StorageError, StorageResult};
use crate::ledger::Ledger;
use crate::models::*;
use crate::repos;

/// [`Ledger`] backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_block(value: i64) -> StorageResult<u64> {
    u64::try_from(value)
        .map_err(|_| StorageError::Unavailable(format!("negative block cursor {value}")))
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::Unavailable(format!("block number {value} out of range")))
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_transaction(&self, tx: &NewTransaction) -> StorageResult<bool> {
        Ok(repos::insert_transaction(&self.pool, tx).await?)
    }

    async fn transaction_exists(&self, hash: &str) -> StorageResult<bool> {
        Ok(repos::transaction_exists(&self.pool, hash).await?)
    }

    async fn insert_transfer(&self, transfer: &NewErc20Transfer) -> StorageResult<bool> {
        Ok(repos::insert_transfer(&self.pool, transfer).await?)
    }

    async fn insert_transfers_batch(
        &self,
        transfers: &[NewErc20Transfer],
    ) -> StorageResult<Vec<NewErc20Transfer>> {
        let mut tx = self.pool.begin().await?;
        let inserted = repos::insert_transfers_batch(&mut *tx, transfers).await?;
        tx.commit().await?;
        tracing::debug!(
            rows = transfers.len(),
            inserted = inserted.len(),
            "Transfer batch committed"
        );
        Ok(inserted)
    }

    async fn sender_transfer_exists(
        &self,
        tx_hash: &str,
        from_address: &str,
    ) -> StorageResult<bool> {
        Ok(repos::sender_transfer_exists(&self.pool, tx_hash, from_address).await?)
    }

    async fn get_cursor_block(&self) -> StorageResult<u64> {
        to_block(repos::get_cursor_block(&self.pool).await?)
    }

    async fn advance_cursor_block(&self, block: u64) -> StorageResult<()> {
        Ok(repos::advance_cursor_block(&self.pool, to_i64(block)?).await?)
    }

    async fn get_activity_cursor(&self) -> StorageResult<i64> {
        Ok(repos::get_activity_cursor(&self.pool).await?)
    }

    async fn advance_activity_cursor(&self, id: i64) -> StorageResult<()> {
        Ok(repos::advance_activity_cursor(&self.pool, id).await?)
    }

    async fn get_or_create_account_stats(&self, address: &str) -> StorageResult<AccountStats> {
        Ok(repos::get_or_create_account_stats(&self.pool, address).await?)
    }

    async fn save_account_stats(&self, stats: &AccountStats) -> StorageResult<()> {
        Ok(repos::save_account_stats(&self.pool, stats).await?)
    }

    async fn account_stats(&self, address: &str) -> StorageResult<Option<AccountStats>> {
        Ok(repos::get_account_stats(&self.pool, address).await?)
    }

    async fn apply_transfer_effects(
        &self,
        transfer: &NewErc20Transfer,
        count_for_sender: bool,
    ) -> StorageResult<()> {
        let sides = [
            (&transfer.from_address, false),
            (&transfer.to_address, true),
        ];

        let mut tx = self.pool.begin().await?;
        for (address, credit) in sides {
            if address == ZERO_ADDRESS {
                continue;
            }
            repos::apply_token_delta(
                &mut *tx,
                address,
                &transfer.contract_address,
                &transfer.value,
                credit,
            )
            .await?;
            let held = repos::count_held_tokens(&mut *tx, address).await?;
            let increment = i64::from(!credit && count_for_sender);
            repos::update_token_stats(&mut *tx, address, increment, held).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn token_balances(&self, address: &str) -> StorageResult<Vec<TokenBalance>> {
        Ok(repos::get_token_balances(&self.pool, address).await?)
    }

    async fn sender_tx_summary(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<SenderSummary> {
        Ok(repos::sender_tx_summary(&self.pool, address, start, end).await?)
    }

    async fn sender_transfer_count(
        &self,
        address: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<i64> {
        Ok(repos::sender_transfer_count(&self.pool, address, start, end).await?)
    }

    async fn active_senders(
        &self,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<String>> {
        Ok(repos::active_senders(&self.pool, start, end).await?)
    }

    async fn tx_summaries_by_sender(
        &self,
        addresses: &[String],
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> StorageResult<Vec<SenderSummary>> {
        Ok(repos::tx_summaries_by_sender(&self.pool, addresses, start, end).await?)
    }

    async fn cached_activity(
        &self,
        address: &str,
        period: NaiveDateTime,
    ) -> StorageResult<Option<AccountActivity>> {
        Ok(repos::get_cached_activity(&self.pool, address, period).await?)
    }

    async fn cached_activities_for_period(
        &self,
        period: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>> {
        Ok(repos::get_cached_activities_for_period(&self.pool, period).await?)
    }

    async fn upsert_activity(&self, activity: &NewAccountActivity) -> StorageResult<()> {
        Ok(repos::upsert_activity(&self.pool, activity).await?)
    }

    async fn activities_after(&self, after: i64, limit: i64) -> StorageResult<Vec<AccountActivity>> {
        Ok(repos::get_activities_after(&self.pool, after, limit).await?)
    }

    async fn activity_history(
        &self,
        address: &str,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> StorageResult<Vec<AccountActivity>> {
        Ok(repos::get_activity_history(&self.pool, address, from, to).await?)
    }
}
