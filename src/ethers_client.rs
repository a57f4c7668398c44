use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, NameOrAddress, H256, U256};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};
use url::Url;

use crate::client::{ChainClient, ClientProvider, SubmitFailure};
use crate::transaction::{Chain, SignedTransaction};

/// Error messages meaning the nonce was already used or skipped.
const NONCE_DESYNC_ERRORS: [&str; 3] = [
    "nonce too low",
    "nonce too high",
    "replacement transaction underpriced",
];

/// Maps a node error to the way the broadcaster handles it. `already known`
/// means the node holds this very transaction, so the send went through.
/// Errors carrying one of the nonce messages above are desyncs, any other
/// JSON-RPC error response is a rejection, and everything else is a
/// transport failure.
pub fn classify_error<E: Debug>(err: &E) -> SubmitFailure {
    let message = format!("{:?}", err).to_lowercase();
    if message.contains("already known") {
        SubmitFailure::AlreadyKnown
    } else if NONCE_DESYNC_ERRORS.iter().any(|s| message.contains(s)) {
        SubmitFailure::NonceDesync
    } else if message.contains("jsonrpcerror") {
        SubmitFailure::Rejected
    } else {
        SubmitFailure::Transport
    }
}

/// Chain client over any ethers middleware.
#[derive(Debug)]
pub struct EthersClient<M> {
    provider: Arc<M>,
}

impl<M> Clone for EthersClient<M> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<M: Middleware + 'static> EthersClient<M> {
    pub fn new(provider: M) -> Self {
        Self {
            provider: Arc::new(provider),
        }
    }

    pub fn provider(&self) -> &M {
        &self.provider
    }
}

impl<M> From<Arc<M>> for EthersClient<M> {
    fn from(provider: Arc<M>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersClient<M> {
    type Error = M::Error;

    #[tracing::instrument(level = "trace", skip_all)]
    async fn nonce(&self, account: Address) -> Result<U256, Self::Error> {
        self.provider
            .get_transaction_count(
                NameOrAddress::Address(account),
                Some(BlockId::Number(BlockNumber::Pending)),
            )
            .await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn fill_transaction(&self, transaction: &mut TypedTransaction) -> Result<(), Self::Error> {
        self.provider.fill_transaction(transaction, None).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn send_transaction(&self, transaction: &SignedTransaction) -> Result<H256, Self::Error> {
        let pending_transaction = self
            .provider
            .send_raw_transaction(transaction.raw.clone())
            .await?;
        let hash = *pending_transaction;

        if hash != transaction.hash {
            warn!(
                "Node returned hash {:?} for transaction {:?}.",
                hash, transaction.hash
            );
        }
        Ok(hash)
    }

    fn classify(err: &Self::Error) -> SubmitFailure {
        classify_error(err)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpClientProviderError {
    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(url::ParseError),

    #[error("none of the {endpoints} endpoint(s) is usable, last error: {last_error}")]
    Unavailable { endpoints: usize, last_error: String },
}

/// Hands out HTTP clients, rotating over a list of endpoints. An endpoint is
/// only used if it answers and serves the expected chain. The last healthy
/// endpoint is tried first on the next call.
#[derive(Debug)]
pub struct HttpClientProvider {
    endpoints: Vec<Url>,
    chain: Chain,
    cursor: AtomicUsize,
}

impl HttpClientProvider {
    pub fn new(endpoints: Vec<Url>, chain: Chain) -> Result<Self, HttpClientProviderError> {
        if endpoints.is_empty() {
            return Err(HttpClientProviderError::NoEndpoints);
        }

        Ok(Self {
            endpoints,
            chain,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn parse<S: AsRef<str>>(
        endpoints: impl IntoIterator<Item = S>,
        chain: Chain,
    ) -> Result<Self, HttpClientProviderError> {
        let endpoints = endpoints
            .into_iter()
            .map(|s| Url::parse(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(HttpClientProviderError::InvalidUrl)?;
        Self::new(endpoints, chain)
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }
}

#[async_trait]
impl ClientProvider for HttpClientProvider {
    type Client = EthersClient<Provider<Http>>;
    type Error = HttpClientProviderError;

    #[tracing::instrument(level = "trace", skip_all)]
    async fn get_client(&self) -> Result<Self::Client, Self::Error> {
        let n = self.endpoints.len();
        let first = self.cursor.load(Ordering::Relaxed);
        let mut last_error = String::new();

        for i in 0..n {
            let index = (first + i) % n;
            let url = &self.endpoints[index];
            let provider = Provider::new(Http::new(url.clone()));

            match provider.get_chainid().await {
                Ok(id) if id == U256::from(self.chain.id) => {
                    trace!("Using endpoint {}.", url);
                    self.cursor.store(index, Ordering::Relaxed);
                    return Ok(EthersClient::new(provider));
                }

                Ok(id) => {
                    warn!(
                        "Endpoint {} serves chain {}, expected {}.",
                        url, id, self.chain.id
                    );
                    last_error = format!("{} serves chain {}", url, id);
                }

                Err(err) => {
                    warn!("Endpoint {} is unreachable: {}", url, err);
                    last_error = format!("{}: {}", url, err);
                }
            }
        }

        Err(HttpClientProviderError::Unavailable {
            endpoints: n,
            last_error,
        })
    }
}
