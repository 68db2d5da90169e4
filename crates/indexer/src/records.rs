//! Conversions from chain data into ledger rows.

use alloy::primitives::B256;
use chrono::NaiveDateTime;
use ledgerwatch_chain::{ChainReceipt, ChainTransaction, TransferEvent, format_address};
use ledgerwatch_storage::models::{
    NewErc20Transfer, NewTransaction, TX_STATUS_REVERTED, TX_STATUS_SUCCESS,
};

/// Canonical text form of a transaction hash (`0x` + 64 lowercase hex).
pub fn format_hash(hash: &B256) -> String {
    format!("{hash:#x}")
}

pub fn transaction_record(
    tx: &ChainTransaction,
    receipt: &ChainReceipt,
    block_number: u64,
    timestamp: NaiveDateTime,
) -> NewTransaction {
    NewTransaction {
        hash: format_hash(&tx.hash),
        block_number: block_number as i64,
        from_address: format_address(&tx.from),
        to_address: tx.to.as_ref().map(format_address).unwrap_or_default(),
        value: tx.value.to_string(),
        gas_used: receipt.gas_used as i64,
        gas_price: tx.resolved_gas_price(receipt).to_string(),
        status: if receipt.success {
            TX_STATUS_SUCCESS
        } else {
            TX_STATUS_REVERTED
        },
        timestamp,
    }
}

pub fn transfer_record(event: &TransferEvent, created_at: NaiveDateTime) -> NewErc20Transfer {
    NewErc20Transfer {
        transaction_hash: format_hash(&event.transaction_hash),
        contract_address: format_address(&event.token_address),
        from_address: format_address(&event.from),
        to_address: format_address(&event.to),
        value: event.value.to_string(),
        block_number: event.block_number as i64,
        log_index: event.log_index as i64,
        created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::consensus::TxType;
    use alloy::primitives::{U256, address};
    use ledgerwatch_core::period;

    fn receipt(success: bool) -> ChainReceipt {
        ChainReceipt {
            transaction_hash: B256::with_last_byte(1),
            block_number: Some(7),
            success,
            gas_used: 21_000,
            effective_gas_price: 30,
            logs: Vec::new(),
        }
    }

    #[test]
    fn contract_creation_has_empty_recipient() {
        let tx = ChainTransaction {
            hash: B256::with_last_byte(1),
            tx_type: TxType::Eip1559,
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: None,
            value: U256::ZERO,
            gas_price: None,
        };
        let row = transaction_record(&tx, &receipt(true), 7, period::from_unix(100));
        assert!(row.is_contract_creation());
        assert_eq!(row.gas_price, "30");
        assert_eq!(row.hash.len(), 66);
    }

    #[test]
    fn reverted_receipt_sets_status() {
        let tx = ChainTransaction {
            hash: B256::with_last_byte(2),
            tx_type: TxType::Legacy,
            from: address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            to: Some(address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb")),
            value: U256::from(5u64),
            gas_price: Some(11),
        };
        let row = transaction_record(&tx, &receipt(false), 7, period::from_unix(100));
        assert!(!row.is_success());
        assert_eq!(row.gas_price, "11");
        assert_eq!(row.to_address, "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
    }
}
