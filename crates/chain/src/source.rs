use alloy::consensus::TxType;
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::rpc::types::{Filter, Log};
use async_trait::async_trait;
use ledgerwatch_core::AppError;

/// Minimal view of the chain head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub timestamp: u64,
}

/// A block with its transactions, senders already resolved.
#[derive(Debug, Clone)]
pub struct ChainBlock {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<ChainTransaction>,
}

#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub hash: B256,
    pub tx_type: TxType,
    /// Sender recovered from the signature.
    pub from: Address,
    /// `None` for contract creation.
    pub to: Option<Address>,
    pub value: U256,
    /// Declared gas price; absent for fee-market transactions.
    pub gas_price: Option<u128>,
}

#[derive(Debug, Clone)]
pub struct ChainReceipt {
    pub transaction_hash: B256,
    pub block_number: Option<u64>,
    pub success: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub logs: Vec<Log>,
}

impl ChainTransaction {
    /// Gas price actually paid: the declared price for legacy and access-list
    /// transactions, the receipt's effective price for fee-market ones.
    pub fn resolved_gas_price(&self, receipt: &ChainReceipt) -> u128 {
        self.gas_price.unwrap_or(receipt.effective_gas_price)
    }

    pub fn is_contract_creation(&self) -> bool {
        self.to.is_none()
    }
}

/// Log filter over an inclusive block range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub from_block: u64,
    pub to_block: u64,
    pub address: Option<Address>,
    /// Accepted values for topic 0 (empty matches any event).
    pub topics: Vec<B256>,
}

impl LogQuery {
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new()
            .from_block(self.from_block)
            .to_block(self.to_block);
        if let Some(address) = self.address {
            filter = filter.address(address);
        }
        if !self.topics.is_empty() {
            filter = filter.event_signature(self.topics.clone());
        }
        filter
    }
}

/// Read-only capabilities the indexer needs from an Ethereum node.
///
/// Every call may fail transiently; callers retry on their next tick.
#[async_trait]
pub trait ChainSource: Send + Sync + 'static {
    async fn current_header(&self) -> Result<BlockHeader, AppError>;

    async fn block_by_number(&self, number: u64) -> Result<ChainBlock, AppError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<ChainReceipt, AppError>;

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<Log>, AppError>;

    async fn balance_at(&self, address: Address) -> Result<U256, AppError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, AppError>;
}
