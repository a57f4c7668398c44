use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::Address;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use eth_txm::keystore::{Keystore, LocalKeystore, LocalKeystoreError};

#[derive(Debug, thiserror::Error)]
pub enum FailingKeystoreError {
    #[error("keystore mock error: {0}")]
    Local(LocalKeystoreError),

    #[error("keystore mock error: unavailable")]
    Unavailable,
}

/// Local keystore whose lookups can be made to fail.
#[derive(Debug, Clone)]
pub struct FailingKeystore {
    inner: LocalKeystore,
    failures: Arc<AtomicUsize>,
}

impl FailingKeystore {
    pub fn new(wallets: impl IntoIterator<Item = LocalWallet>) -> Self {
        let mut inner = LocalKeystore::new();
        for wallet in wallets {
            inner.insert(wallet);
        }

        Self {
            inner,
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `n` calls to `get` fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Keystore for FailingKeystore {
    type Signer = LocalWallet;
    type Error = FailingKeystoreError;

    async fn get(&self, account: Address) -> Result<Self::Signer, Self::Error> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FailingKeystoreError::Unavailable);
        }

        self.inner
            .get(account)
            .await
            .map_err(FailingKeystoreError::Local)
    }

    async fn get_all(&self) -> Result<Vec<Self::Signer>, Self::Error> {
        self.inner.get_all().await.map_err(FailingKeystoreError::Local)
    }
}
