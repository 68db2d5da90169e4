pub mod abi;
pub mod decoder;
pub mod provider;
pub mod source;

pub use abi::IERC20;
pub use decoder::{DecodeError, TransferEvent, ZERO_ADDRESS, decode_transfer, format_address};
pub use provider::{EthProvider, RpcChainSource, create_provider};
pub use source::{BlockHeader, ChainBlock, ChainReceipt, ChainSource, ChainTransaction, LogQuery};
