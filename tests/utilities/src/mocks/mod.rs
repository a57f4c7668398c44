mod chain;
mod keystore;
mod provider;
mod time;

pub use chain::{MockChain, MockClient, MockClientError, SendFailure};
pub use keystore::{FailingKeystore, FailingKeystoreError};
pub use provider::{MockClientProvider, MockProviderError};
pub use time::CountingTime;
