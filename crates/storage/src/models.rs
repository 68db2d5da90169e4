use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger form of the zero address, the missing side of mints and burns.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

// ─── Transaction ────────────────────────────────────────────────────────────

pub const TX_STATUS_REVERTED: i16 = 0;
pub const TX_STATUS_SUCCESS: i16 = 1;

/// An immutable ledger row for one on-chain transaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: i64,
    pub hash: String,
    pub block_number: i64,
    pub from_address: String,
    /// Empty for contract creation.
    pub to_address: String,
    pub value: String,
    pub gas_used: i64,
    pub gas_price: String,
    pub status: i16,
    pub timestamp: NaiveDateTime,
}

/// Insert-ready transaction (no `id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub hash: String,
    pub block_number: i64,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub gas_used: i64,
    pub gas_price: String,
    pub status: i16,
    pub timestamp: NaiveDateTime,
}

impl NewTransaction {
    pub fn is_success(&self) -> bool {
        self.status == TX_STATUS_SUCCESS
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to_address.is_empty()
    }
}

// ─── ERC20 Transfer ─────────────────────────────────────────────────────────

/// An immutable record of a token movement decoded from a Transfer log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Erc20Transfer {
    pub id: i64,
    pub transaction_hash: String,
    pub contract_address: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub block_number: i64,
    pub log_index: i64,
    pub created_at: NaiveDateTime,
}

/// Insert-ready transfer (no `id`).
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct NewErc20Transfer {
    pub transaction_hash: String,
    pub contract_address: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
    pub block_number: i64,
    pub log_index: i64,
    pub created_at: NaiveDateTime,
}

// ─── AccountStats ───────────────────────────────────────────────────────────

/// Running per-address aggregates.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct AccountStats {
    pub address: String,
    pub total_transactions: i64,
    pub erc20_transactions: i64,
    pub total_volume_eth: String,
    /// Last balance read from the chain, in wei.
    pub eth_balance: String,
    pub unique_tokens_count: i64,
    pub first_activity_at: Option<NaiveDateTime>,
    pub last_activity_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl AccountStats {
    pub fn new(address: &str, now: NaiveDateTime) -> Self {
        Self {
            address: address.to_string(),
            total_transactions: 0,
            erc20_transactions: 0,
            total_volume_eth: "0".to_string(),
            eth_balance: "0".to_string(),
            unique_tokens_count: 0,
            first_activity_at: None,
            last_activity_at: None,
            updated_at: now,
        }
    }

    /// Widen the first/last activity range to include `at`.
    pub fn touch(&mut self, at: NaiveDateTime) {
        if self.first_activity_at.is_none_or(|first| at < first) {
            self.first_activity_at = Some(at);
        }
        if self.last_activity_at.is_none_or(|last| at > last) {
            self.last_activity_at = Some(at);
        }
    }
}

// ─── TokenBalance ───────────────────────────────────────────────────────────

/// Current balance for an (address, token) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenBalance {
    pub address: String,
    pub token_address: String,
    pub balance: String,
    pub updated_at: NaiveDateTime,
}

// ─── AccountActivity ────────────────────────────────────────────────────────

/// Cached activity of one address over one 15-second period.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AccountActivity {
    pub id: i64,
    pub address: String,
    pub period: NaiveDateTime,
    pub transaction_count: i64,
    pub volume_eth: String,
    pub token_transfers: i64,
    pub updated_at: NaiveDateTime,
}

impl AccountActivity {
    pub fn total_events(&self) -> i64 {
        self.transaction_count + self.token_transfers
    }

    pub fn to_window(&self) -> NewAccountActivity {
        NewAccountActivity {
            address: self.address.clone(),
            period: self.period,
            transaction_count: self.transaction_count,
            volume_eth: self.volume_eth.clone(),
            token_transfers: self.token_transfers,
            updated_at: self.updated_at,
        }
    }
}

/// Activity computed from the ledger, ready to be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccountActivity {
    pub address: String,
    pub period: NaiveDateTime,
    pub transaction_count: i64,
    pub volume_eth: String,
    pub token_transfers: i64,
    pub updated_at: NaiveDateTime,
}

// ─── Window aggregates ──────────────────────────────────────────────────────

/// Outgoing successful transactions of one sender within a window.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct SenderSummary {
    pub address: String,
    pub transaction_count: i64,
    pub volume: String,
}
