use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, H256, U256};
use std::fmt::Debug;

use crate::transaction::SignedTransaction;

/// How a failed submission must be handled by the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitFailure {
    /// The node already holds this exact transaction. Counts as accepted.
    AlreadyKnown,

    /// The node reports that the nonce was already used or leaves a gap. The
    /// tracked nonce is stale and must be resynced.
    NonceDesync,

    /// The node answered and refused the transaction for another reason.
    Rejected,

    /// No usable answer from the node. The transaction may or may not have
    /// reached the network.
    Transport,
}

/// ClientProvider encapsulates client instantiation. It is called at the
/// start of every broadcast attempt, so implementations are free to rotate
/// endpoints or reconnect. Failures are expected and are retried on the next
/// tick.
#[async_trait]
pub trait ClientProvider: Debug + Send + Sync + 'static {
    type Client: ChainClient;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_client(&self) -> Result<Self::Client, Self::Error>;
}

#[async_trait]
pub trait ChainClient: Debug + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Next nonce expected by the chain for `account`, pending transactions
    /// included.
    async fn nonce(&self, account: Address) -> Result<U256, Self::Error>;

    /// Fills gas limit and fee fields of an unsigned transaction.
    async fn fill_transaction(&self, transaction: &mut TypedTransaction) -> Result<(), Self::Error>;

    async fn send_transaction(&self, transaction: &SignedTransaction) -> Result<H256, Self::Error>;

    fn classify(err: &Self::Error) -> SubmitFailure;
}
