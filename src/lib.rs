mod broadcast;
pub mod client;
pub mod config;
pub mod ethers_client;
pub mod keystore;
pub mod manager;
pub mod nonce;
pub mod queue;
pub mod time;
pub mod transaction;

pub use client::{ChainClient, ClientProvider, SubmitFailure};
pub use ethers_client::{EthersClient, HttpClientProvider};
pub use keystore::{Keystore, LocalKeystore};
pub use manager::{Configuration, Error, Lifecycle, Manager as TransactionManager};
pub use transaction::{Chain, FunctionCall, SignedTransaction};
