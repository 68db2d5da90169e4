use alloy::consensus::transaction::SignerRecoverable;
use alloy::consensus::{BlockHeader as _, Transaction as ConsensusTransaction};
use alloy::eips::BlockNumberOrTag;
use alloy::network::{Ethereum, TransactionResponse};
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Log, Transaction};
use async_trait::async_trait;
use ledgerwatch_core::AppError;

use crate::source::{BlockHeader, ChainBlock, ChainReceipt, ChainSource, ChainTransaction, LogQuery};

/// The Ethereum RPC provider type used throughout the application.
pub type EthProvider = RootProvider<Ethereum>;

/// Create an HTTP provider from an RPC URL string.
pub fn create_provider(rpc_url: &str) -> eyre::Result<EthProvider> {
    let url = rpc_url.parse()?;
    Ok(RootProvider::<Ethereum>::new_http(url))
}

fn rpc_err(e: impl std::fmt::Display) -> AppError {
    AppError::Rpc(e.to_string())
}

/// [`ChainSource`] backed by a JSON-RPC node.
#[derive(Clone)]
pub struct RpcChainSource {
    provider: EthProvider,
}

impl RpcChainSource {
    pub fn new(provider: EthProvider) -> Self {
        Self { provider }
    }

    pub fn connect(rpc_url: &str) -> eyre::Result<Self> {
        Ok(Self::new(create_provider(rpc_url)?))
    }
}

/// Resolve the sender from the transaction signature.
///
/// The envelope variant selects the signing hash: EIP-155 replay-protected
/// hashing for legacy transactions, typed hashing for access-list and
/// fee-market ones. If recovery fails the node-reported sender is used.
fn recover_sender(tx: &Transaction) -> Address {
    match tx.inner.inner().recover_signer() {
        Ok(signer) => signer,
        Err(e) => {
            tracing::warn!(
                tx = %TransactionResponse::tx_hash(tx),
                error = %e,
                "Signature recovery failed, using node-reported sender"
            );
            TransactionResponse::from(tx)
        }
    }
}

fn convert_transaction(tx: &Transaction) -> ChainTransaction {
    ChainTransaction {
        hash: TransactionResponse::tx_hash(tx),
        tx_type: tx.inner.inner().tx_type(),
        from: recover_sender(tx),
        to: ConsensusTransaction::to(tx),
        value: ConsensusTransaction::value(tx),
        gas_price: ConsensusTransaction::gas_price(tx),
    }
}

#[async_trait]
impl ChainSource for RpcChainSource {
    async fn current_header(&self) -> Result<BlockHeader, AppError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Latest)
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| AppError::Rpc("latest block not available".into()))?;
        Ok(BlockHeader {
            number: block.header.number(),
            timestamp: block.header.timestamp(),
        })
    }

    async fn block_by_number(&self, number: u64) -> Result<ChainBlock, AppError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| AppError::Rpc(format!("block {number} not found on chain")))?;

        let transactions = block
            .transactions
            .as_transactions()
            .ok_or_else(|| AppError::Rpc(format!("block {number} returned without bodies")))?
            .iter()
            .map(convert_transaction)
            .collect();

        Ok(ChainBlock {
            number: block.header.number(),
            timestamp: block.header.timestamp(),
            transactions,
        })
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<ChainReceipt, AppError> {
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .map_err(rpc_err)?
            .ok_or_else(|| AppError::Rpc(format!("receipt for {hash} not found")))?;

        Ok(ChainReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: receipt.block_number,
            success: receipt.inner.status(),
            gas_used: receipt.gas_used,
            effective_gas_price: receipt.effective_gas_price,
            logs: receipt.inner.logs().to_vec(),
        })
    }

    async fn filter_logs(&self, query: &LogQuery) -> Result<Vec<Log>, AppError> {
        self.provider
            .get_logs(&query.to_filter())
            .await
            .map_err(rpc_err)
    }

    async fn balance_at(&self, address: Address) -> Result<U256, AppError> {
        self.provider.get_balance(address).await.map_err(rpc_err)
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, AppError> {
        self.provider.get_code_at(address).await.map_err(rpc_err)
    }
}
