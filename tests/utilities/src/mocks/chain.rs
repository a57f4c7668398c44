use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use eth_txm::client::{ChainClient, SubmitFailure};
use eth_txm::ethers_client::classify_error;
use eth_txm::transaction::SignedTransaction;

/// Failure injected into the next `send_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Connection error, the chain never sees the transaction.
    Transport,

    /// The node refuses the transaction.
    Rejected,

    /// The node claims the nonce was already used.
    NonceTooLow,

    /// The node never answers. The chain never sees the transaction.
    Hang,

    /// The chain includes the transaction but the answer never arrives.
    AcceptThenHang,

    /// The chain includes the transaction, then the node answers as if it
    /// had been sent twice.
    AcceptThenAlreadyKnown,
}

#[derive(Debug, thiserror::Error)]
pub enum MockClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("(code: {code}, message: {message})")]
    JsonRpcError { code: i64, message: String },
}

impl MockClientError {
    fn rpc(message: impl Into<String>) -> Self {
        Self::JsonRpcError {
            code: -32000,
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    nonces: HashMap<Address, U256>,
    /// Included transactions, with the id of the client that sent them.
    sent: Vec<(usize, SignedTransaction)>,
    clients: usize,
    send_failures: VecDeque<SendFailure>,
    nonce_failures: usize,
    nonce_queries: usize,
    send_attempts: usize,
}

/// In-memory chain shared by every client handed out by the mock provider.
/// Only transactions carrying the account's next nonce are included.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    state: Arc<Mutex<State>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_nonce(&self, account: Address, nonce: u64) {
        self.lock().nonces.insert(account, nonce.into());
    }

    pub fn nonce(&self, account: Address) -> U256 {
        self.lock().nonces.get(&account).copied().unwrap_or_default()
    }

    /// Every transaction included so far, in inclusion order.
    pub fn sent(&self) -> Vec<SignedTransaction> {
        self.lock()
            .sent
            .iter()
            .map(|(_, transaction)| transaction.clone())
            .collect()
    }

    pub fn sent_by(&self, account: Address) -> Vec<SignedTransaction> {
        self.lock()
            .sent
            .iter()
            .filter(|(_, transaction)| transaction.from == account)
            .map(|(_, transaction)| transaction.clone())
            .collect()
    }

    /// Sizes of the groups of `account`'s transactions included through the
    /// same client, in inclusion order. The broadcaster acquires one client
    /// per batch, so these are the batch sizes.
    pub fn batch_sizes(&self, account: Address) -> Vec<usize> {
        let state = self.lock();
        let mut sizes: Vec<(usize, usize)> = Vec::new();
        for (client, _) in state.sent.iter().filter(|(_, t)| t.from == account) {
            match sizes.last_mut() {
                Some((last, size)) if *last == *client => *size += 1,
                _ => sizes.push((*client, 1)),
            }
        }
        sizes.into_iter().map(|(_, size)| size).collect()
    }

    pub fn push_send_failure(&self, failure: SendFailure) {
        self.lock().send_failures.push_back(failure);
    }

    /// Makes the next `n` nonce queries fail.
    pub fn fail_nonce_queries(&self, n: usize) {
        self.lock().nonce_failures = n;
    }

    pub fn nonce_queries(&self) -> usize {
        self.lock().nonce_queries
    }

    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    /// Includes a transaction sent by someone else, moving the nonce forward.
    pub fn external_transaction(&self, account: Address) {
        let mut state = self.lock();
        let nonce = state.nonces.entry(account).or_default();
        *nonce += U256::one();
    }

    pub fn client(&self) -> MockClient {
        let mut state = self.lock();
        state.clients += 1;
        MockClient {
            chain: self.clone(),
            id: state.clients,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn include(&self, client: usize, transaction: &SignedTransaction) -> Result<H256, MockClientError> {
        let mut state = self.lock();
        let expected = state
            .nonces
            .get(&transaction.from)
            .copied()
            .unwrap_or_default();

        if transaction.nonce < expected {
            return Err(MockClientError::rpc(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                expected, transaction.nonce
            )));
        }
        if transaction.nonce > expected {
            return Err(MockClientError::rpc(format!(
                "nonce too high: next nonce {}, tx nonce {}",
                expected, transaction.nonce
            )));
        }

        state.nonces.insert(transaction.from, expected + U256::one());
        state.sent.push((client, transaction.clone()));
        Ok(transaction.hash)
    }
}

#[derive(Debug, Clone)]
pub struct MockClient {
    chain: MockChain,
    id: usize,
}

#[async_trait]
impl ChainClient for MockClient {
    type Error = MockClientError;

    async fn nonce(&self, account: Address) -> Result<U256, Self::Error> {
        let mut state = self.chain.lock();
        state.nonce_queries += 1;
        if state.nonce_failures > 0 {
            state.nonce_failures -= 1;
            return Err(MockClientError::Transport("connection refused".into()));
        }
        Ok(state.nonces.get(&account).copied().unwrap_or_default())
    }

    async fn fill_transaction(&self, transaction: &mut TypedTransaction) -> Result<(), Self::Error> {
        transaction.set_gas(100_000u64);
        transaction.set_gas_price(1_000_000_000u64);
        Ok(())
    }

    async fn send_transaction(&self, transaction: &SignedTransaction) -> Result<H256, Self::Error> {
        let failure = {
            let mut state = self.chain.lock();
            state.send_attempts += 1;
            state.send_failures.pop_front()
        };

        match failure {
            None => self.chain.include(self.id, transaction),
            Some(SendFailure::Transport) => Err(MockClientError::Transport("connection reset".into())),
            Some(SendFailure::Rejected) => Err(MockClientError::rpc("insufficient funds for gas * price + value")),
            Some(SendFailure::NonceTooLow) => Err(MockClientError::rpc("nonce too low")),
            Some(SendFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(MockClientError::Transport("hung up".into()))
            }
            Some(SendFailure::AcceptThenHang) => {
                self.chain.include(self.id, transaction)?;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(MockClientError::Transport("hung up".into()))
            }
            Some(SendFailure::AcceptThenAlreadyKnown) => {
                self.chain.include(self.id, transaction)?;
                Err(MockClientError::rpc("already known"))
            }
        }
    }

    fn classify(err: &Self::Error) -> SubmitFailure {
        classify_error(err)
    }
}
