use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer, WalletError};
use ethers::types::Address;
use std::collections::HashMap;
use std::fmt::Debug;

#[async_trait]
pub trait Keystore: Debug + Send + Sync + 'static {
    type Signer: Signer + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, account: Address) -> Result<Self::Signer, Self::Error>;

    async fn get_all(&self) -> Result<Vec<Self::Signer>, Self::Error>;
}

#[derive(Debug, thiserror::Error)]
pub enum LocalKeystoreError {
    #[error("invalid private key: {0}")]
    InvalidKey(WalletError),

    #[error("key does not exist for account {0:?}")]
    KeyNotFound(Address),
}

/// Keystore holding private keys in memory.
#[derive(Debug, Clone, Default)]
pub struct LocalKeystore {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a keystore from hex encoded private keys.
    pub fn from_private_keys<S: AsRef<str>>(
        private_keys: impl IntoIterator<Item = S>,
    ) -> Result<Self, LocalKeystoreError> {
        let mut keystore = Self::new();
        for key in private_keys {
            let wallet = key
                .as_ref()
                .parse::<LocalWallet>()
                .map_err(LocalKeystoreError::InvalidKey)?;
            keystore.insert(wallet);
        }
        Ok(keystore)
    }

    pub fn insert(&mut self, wallet: LocalWallet) -> Address {
        let address = wallet.address();
        self.wallets.insert(address, wallet);
        address
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }
}

#[async_trait]
impl Keystore for LocalKeystore {
    type Signer = LocalWallet;
    type Error = LocalKeystoreError;

    async fn get(&self, account: Address) -> Result<Self::Signer, Self::Error> {
        self.wallets
            .get(&account)
            .cloned()
            .ok_or(LocalKeystoreError::KeyNotFound(account))
    }

    async fn get_all(&self) -> Result<Vec<Self::Signer>, Self::Error> {
        Ok(self.wallets.values().cloned().collect())
    }
}
