use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use eth_txm::client::ClientProvider;

use super::chain::{MockChain, MockClient};

#[derive(Debug, thiserror::Error)]
pub enum MockProviderError {
    #[error("provider mock error: call {0} failed")]
    Unavailable(usize),
}

/// Hands out clients of a `MockChain`. Calls are numbered from 1 and any of
/// them can be made to fail.
#[derive(Debug, Clone)]
pub struct MockClientProvider {
    chain: MockChain,
    calls: Arc<AtomicUsize>,
    failing_calls: Arc<Mutex<HashSet<usize>>>,
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl MockClientProvider {
    pub fn new(chain: MockChain) -> Self {
        Self {
            chain,
            calls: Arc::new(AtomicUsize::new(0)),
            failing_calls: Arc::new(Mutex::new(HashSet::new())),
            fail_after: Arc::new(Mutex::new(None)),
        }
    }

    pub fn fail_call(self, n: usize) -> Self {
        self.failing_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(n);
        self
    }

    pub fn fail_calls(self, calls: impl IntoIterator<Item = usize>) -> Self {
        calls.into_iter().fold(self, |provider, n| provider.fail_call(n))
    }

    /// Every call after the `n`-th one fails.
    pub fn fail_after(self, n: usize) -> Self {
        *self
            .fail_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientProvider for MockClientProvider {
    type Client = MockClient;
    type Error = MockProviderError;

    async fn get_client(&self) -> Result<Self::Client, Self::Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let failing = self
            .failing_calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&n);
        let exhausted = self
            .fail_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map_or(false, |after| n > after);

        if failing || exhausted {
            Err(MockProviderError::Unavailable(n))
        } else {
            Ok(self.chain.client())
        }
    }
}
