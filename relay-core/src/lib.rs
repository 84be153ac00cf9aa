pub mod abi;
pub mod broker;
pub mod chain;
pub mod codec;
pub mod config;
pub mod finality;
pub mod ledger;
pub mod types;
