use chrono::NaiveDateTime;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder};

use crate::models::*;

// ─── Transaction Queries ────────────────────────────────────────────────────

/// Insert a transaction, skipping duplicates on `hash`.
/// Returns `true` when a row was written.
pub async fn insert_transaction<'e, E>(executor: E, tx: &NewTransaction) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO transactions (hash, block_number, from_address, to_address, value, gas_used, gas_price, status, timestamp)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (hash) DO NOTHING
        "#,
    )
    .bind(&tx.hash)
    .bind(tx.block_number)
    .bind(&tx.from_address)
    .bind(&tx.to_address)
    .bind(&tx.value)
    .bind(tx.gas_used)
    .bind(&tx.gas_price)
    .bind(tx.status)
    .bind(tx.timestamp)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn transaction_exists(pool: &PgPool, hash: &str) -> Result<bool, sqlx::Error> {
    let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM transactions WHERE hash = $1)")
        .bind(hash)
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

// ─── Transfer Queries ───────────────────────────────────────────────────────

/// Insert a single transfer, skipping duplicates on its identity key.
pub async fn insert_transfer<'e, E>(
    executor: E,
    transfer: &NewErc20Transfer,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO erc20_transfers (transaction_hash, contract_address, from_address, to_address, value, block_number, log_index, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (transaction_hash, contract_address, from_address, to_address, log_index) DO NOTHING
        "#,
    )
    .bind(&transfer.transaction_hash)
    .bind(&transfer.contract_address)
    .bind(&transfer.from_address)
    .bind(&transfer.to_address)
    .bind(&transfer.value)
    .bind(transfer.block_number)
    .bind(transfer.log_index)
    .bind(transfer.created_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Insert a batch of transfers using a single multi-value INSERT.
/// Returns the rows actually written; duplicates are left out.
pub async fn insert_transfers_batch<'e, E>(
    executor: E,
    transfers: &[NewErc20Transfer],
) -> Result<Vec<NewErc20Transfer>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    if transfers.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO erc20_transfers (transaction_hash, contract_address, from_address, to_address, value, block_number, log_index, created_at) ",
    );

    qb.push_values(transfers, |mut b, t| {
        b.push_bind(&t.transaction_hash)
            .push_bind(&t.contract_address)
            .push_bind(&t.from_address)
            .push_bind(&t.to_address)
            .push_bind(&t.value)
            .push_bind(t.block_number)
            .push_bind(t.log_index)
            .push_bind(t.created_at);
    });

    qb.push(
        " ON CONFLICT (transaction_hash, contract_address, from_address, to_address, log_index) DO NOTHING \
         RETURNING transaction_hash, contract_address, from_address, to_address, value, block_number, log_index, created_at",
    );
    qb.build_query_as::<NewErc20Transfer>()
        .fetch_all(executor)
        .await
}

pub async fn sender_transfer_exists(
    pool: &PgPool,
    tx_hash: &str,
    from_address: &str,
) -> Result<bool, sqlx::Error> {
    let row: (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM erc20_transfers WHERE transaction_hash = $1 AND from_address = $2)",
    )
    .bind(tx_hash)
    .bind(from_address)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

// ─── Cursor State ───────────────────────────────────────────────────────────

/// Get the last processed block, 0 when the cursor row does not exist yet.
pub async fn get_cursor_block(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT last_processed_block FROM indexer_cursor WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|r| r.0).unwrap_or(0))
}

/// Raise the block cursor under a row lock. Smaller values are no-ops.
pub async fn advance_cursor_block(pool: &PgPool, block_number: i64) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO indexer_cursor (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(&mut *tx)
        .await?;

    let (current,): (i64,) = sqlx::query_as(
        "SELECT last_processed_block FROM indexer_cursor WHERE id = 1 FOR UPDATE",
    )
    .fetch_one(&mut *tx)
    .await?;

    if block_number > current {
        sqlx::query(
            "UPDATE indexer_cursor SET last_processed_block = $1, updated_at = NOW() WHERE id = 1",
        )
        .bind(block_number)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Get the notifier cursor, creating the cursor row at 0 if absent.
pub async fn get_activity_cursor(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query("INSERT INTO indexer_cursor (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(pool)
        .await?;
    let row: (i64,) =
        sqlx::query_as("SELECT last_processed_activity_id FROM indexer_cursor WHERE id = 1")
            .fetch_one(pool)
            .await?;
    Ok(row.0)
}

/// Raise the notifier cursor under a row lock. Smaller values are no-ops.
pub async fn advance_activity_cursor(pool: &PgPool, activity_id: i64) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO indexer_cursor (id) VALUES (1) ON CONFLICT (id) DO NOTHING")
        .execute(&mut *tx)
        .await?;

    let (current,): (i64,) = sqlx::query_as(
        "SELECT last_processed_activity_id FROM indexer_cursor WHERE id = 1 FOR UPDATE",
    )
    .fetch_one(&mut *tx)
    .await?;

    if activity_id > current {
        sqlx::query(
            "UPDATE indexer_cursor SET last_processed_activity_id = $1, updated_at = NOW() WHERE id = 1",
        )
        .bind(activity_id)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

// ─── Account Stats ──────────────────────────────────────────────────────────

pub async fn get_or_create_account_stats(
    pool: &PgPool,
    address: &str,
) -> Result<AccountStats, sqlx::Error> {
    sqlx::query("INSERT INTO account_stats (address) VALUES ($1) ON CONFLICT (address) DO NOTHING")
        .bind(address)
        .execute(pool)
        .await?;
    sqlx::query_as::<_, AccountStats>("SELECT * FROM account_stats WHERE address = $1")
        .bind(address)
        .fetch_one(pool)
        .await
}

pub async fn get_account_stats(
    pool: &PgPool,
    address: &str,
) -> Result<Option<AccountStats>, sqlx::Error> {
    sqlx::query_as::<_, AccountStats>("SELECT * FROM account_stats WHERE address = $1")
        .bind(address)
        .fetch_optional(pool)
        .await
}

pub async fn save_account_stats(pool: &PgPool, stats: &AccountStats) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE account_stats
        SET total_transactions = $2,
            erc20_transactions = $3,
            total_volume_eth = $4,
            eth_balance = $5,
            unique_tokens_count = $6,
            first_activity_at = $7,
            last_activity_at = $8,
            updated_at = NOW()
        WHERE address = $1
        "#,
    )
    .bind(&stats.address)
    .bind(stats.total_transactions)
    .bind(stats.erc20_transactions)
    .bind(&stats.total_volume_eth)
    .bind(&stats.eth_balance)
    .bind(stats.unique_tokens_count)
    .bind(stats.first_activity_at)
    .bind(stats.last_activity_at)
    .execute(pool)
    .await?;
    Ok(())
}

// ─── Token Balances ─────────────────────────────────────────────────────────

/// Upsert a token balance by adding or subtracting `amount`.
/// Debits are clamped at zero; the resulting balance is returned.
pub async fn apply_token_delta<'e, E>(
    executor: E,
    address: &str,
    token_address: &str,
    amount: &str,
    credit: bool,
) -> Result<String, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    // Text arithmetic via CAST; amounts are always non-negative integers as strings.
    let row: (String,) = if credit {
        sqlx::query_as(
            r#"
            INSERT INTO token_balances (address, token_address, balance, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (address, token_address) DO UPDATE
            SET balance = (CAST(token_balances.balance AS NUMERIC) + CAST($3 AS NUMERIC))::TEXT,
                updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(address)
        .bind(token_address)
        .bind(amount)
        .fetch_one(executor)
        .await?
    } else {
        sqlx::query_as(
            r#"
            INSERT INTO token_balances (address, token_address, balance, updated_at)
            VALUES ($1, $2, '0', NOW())
            ON CONFLICT (address, token_address) DO UPDATE
            SET balance = GREATEST(0, CAST(token_balances.balance AS NUMERIC) - CAST($3 AS NUMERIC))::TEXT,
                updated_at = NOW()
            RETURNING balance
            "#,
        )
        .bind(address)
        .bind(token_address)
        .bind(amount)
        .fetch_one(executor)
        .await?
    };
    Ok(row.0)
}

/// Number of tokens `address` holds a non-zero balance of.
pub async fn count_held_tokens<'e, E>(executor: E, address: &str) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM token_balances WHERE address = $1 AND CAST(balance AS NUMERIC) > 0",
    )
    .bind(address)
    .fetch_one(executor)
    .await?;
    Ok(row.0)
}

/// Create-or-update the token side of an account's stats.
pub async fn update_token_stats<'e, E>(
    executor: E,
    address: &str,
    erc20_increment: i64,
    unique_tokens_count: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO account_stats (address, erc20_transactions, unique_tokens_count)
        VALUES ($1, $2, $3)
        ON CONFLICT (address) DO UPDATE
        SET erc20_transactions = account_stats.erc20_transactions + $2,
            unique_tokens_count = $3,
            updated_at = NOW()
        "#,
    )
    .bind(address)
    .bind(erc20_increment)
    .bind(unique_tokens_count)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_token_balances(
    pool: &PgPool,
    address: &str,
) -> Result<Vec<TokenBalance>, sqlx::Error> {
    sqlx::query_as::<_, TokenBalance>(
        r#"
        SELECT * FROM token_balances
        WHERE address = $1 AND CAST(balance AS NUMERIC) > 0
        ORDER BY token_address
        "#,
    )
    .bind(address)
    .fetch_all(pool)
    .await
}

// ─── Window Queries ─────────────────────────────────────────────────────────

pub async fn sender_tx_summary(
    pool: &PgPool,
    address: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<SenderSummary, sqlx::Error> {
    sqlx::query_as::<_, SenderSummary>(
        r#"
        SELECT $1::TEXT AS address,
               COUNT(*) AS transaction_count,
               COALESCE(SUM(CAST(value AS NUMERIC)), 0)::TEXT AS volume
        FROM transactions
        WHERE from_address = $1 AND status = 1 AND timestamp >= $2 AND timestamp < $3
        "#,
    )
    .bind(address)
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await
}

pub async fn sender_transfer_count(
    pool: &PgPool,
    address: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM erc20_transfers
        WHERE from_address = $1 AND created_at >= $2 AND created_at < $3
        "#,
    )
    .bind(address)
    .bind(start)
    .bind(end)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn active_senders(
    pool: &PgPool,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT from_address FROM transactions
        WHERE status = 1 AND timestamp >= $1 AND timestamp < $2
        UNION
        SELECT from_address FROM erc20_transfers
        WHERE created_at >= $1 AND created_at < $2 AND from_address <> $3
        ORDER BY 1
        "#,
    )
    .bind(start)
    .bind(end)
    .bind(ZERO_ADDRESS)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

pub async fn tx_summaries_by_sender(
    pool: &PgPool,
    addresses: &[String],
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<Vec<SenderSummary>, sqlx::Error> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, SenderSummary>(
        r#"
        SELECT from_address AS address,
               COUNT(*) AS transaction_count,
               COALESCE(SUM(CAST(value AS NUMERIC)), 0)::TEXT AS volume
        FROM transactions
        WHERE from_address = ANY($1) AND status = 1 AND timestamp >= $2 AND timestamp < $3
        GROUP BY from_address
        "#,
    )
    .bind(addresses)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await
}

// ─── Account Activity ───────────────────────────────────────────────────────

pub async fn get_cached_activity(
    pool: &PgPool,
    address: &str,
    period: NaiveDateTime,
) -> Result<Option<AccountActivity>, sqlx::Error> {
    sqlx::query_as::<_, AccountActivity>(
        "SELECT * FROM account_activity WHERE address = $1 AND period = $2",
    )
    .bind(address)
    .bind(period)
    .fetch_optional(pool)
    .await
}

pub async fn get_cached_activities_for_period(
    pool: &PgPool,
    period: NaiveDateTime,
) -> Result<Vec<AccountActivity>, sqlx::Error> {
    sqlx::query_as::<_, AccountActivity>(
        "SELECT * FROM account_activity WHERE period = $1 ORDER BY address",
    )
    .bind(period)
    .fetch_all(pool)
    .await
}

/// Upsert a computed activity window.
///
/// When counts or volume change the row is re-keyed with a fresh id so the
/// notification cursor picks it up again. A window already past the alert
/// threshold that grows further is therefore alerted on a second time.
pub async fn upsert_activity<'e, E>(
    executor: E,
    activity: &NewAccountActivity,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO account_activity (address, period, transaction_count, volume_eth, token_transfers, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (address, period) DO UPDATE SET
            id = CASE
                WHEN account_activity.transaction_count <> EXCLUDED.transaction_count
                  OR account_activity.token_transfers <> EXCLUDED.token_transfers
                  OR account_activity.volume_eth <> EXCLUDED.volume_eth
                THEN nextval(pg_get_serial_sequence('account_activity', 'id'))
                ELSE account_activity.id
            END,
            transaction_count = EXCLUDED.transaction_count,
            volume_eth = EXCLUDED.volume_eth,
            token_transfers = EXCLUDED.token_transfers,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&activity.address)
    .bind(activity.period)
    .bind(activity.transaction_count)
    .bind(&activity.volume_eth)
    .bind(activity.token_transfers)
    .bind(activity.updated_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_activities_after(
    pool: &PgPool,
    after_id: i64,
    limit: i64,
) -> Result<Vec<AccountActivity>, sqlx::Error> {
    sqlx::query_as::<_, AccountActivity>(
        "SELECT * FROM account_activity WHERE id > $1 ORDER BY id ASC LIMIT $2",
    )
    .bind(after_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn get_activity_history(
    pool: &PgPool,
    address: &str,
    from: NaiveDateTime,
    to: NaiveDateTime,
) -> Result<Vec<AccountActivity>, sqlx::Error> {
    sqlx::query_as::<_, AccountActivity>(
        r#"
        SELECT * FROM account_activity
        WHERE address = $1 AND period >= $2 AND period < $3
        ORDER BY period ASC
        "#,
    )
    .bind(address)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}
