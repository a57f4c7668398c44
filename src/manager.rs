use ethers::signers::Signer;
use ethers::types::{Address, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::broadcast::{self, Broadcaster};
use crate::client::{ChainClient, ClientProvider};
use crate::keystore::Keystore;
use crate::nonce::NonceError;
use crate::time::{DefaultTime, Time};
use crate::transaction::{Chain, FunctionCall};

// Default values.
const TX_MAX_BATCH_SIZE: usize = 100;
const TX_SEND_FREQUENCY: Duration = Duration::from_secs(15);
const TX_TIMEOUT: Duration = Duration::from_secs(10);
const NONCE_SYNC_RETRIES: usize = 5;
const NONCE_SYNC_DELAY: Duration = Duration::from_secs(1);
const FAILURE_ALERT_THRESHOLD: usize = 10;

pub type ClientError<P> = <<P as ClientProvider>::Client as ChainClient>::Error;
pub type SignerError<K> = <<K as Keystore>::Signer as Signer>::Error;

#[derive(Debug, thiserror::Error)]
pub enum Error<P: ClientProvider, K: Keystore> {
    #[error("transaction manager is not running")]
    NotRunning,

    #[error("transaction manager is not ready")]
    NotReady,

    #[error("transaction manager was already started")]
    AlreadyStarted,

    #[error("account {0:?} is not managed by the keystore")]
    UnknownAccount(Address),

    #[error("invalid configuration: {0}")]
    Configuration(ConfigurationError),

    #[error("client unavailable: {0}")]
    ClientUnavailable(P::Error),

    #[error("keystore: {0}")]
    Keystore(K::Error),

    #[error("keystore returned signer {signer:?} for account {account:?}")]
    SignerMismatch { account: Address, signer: Address },

    #[error("signing failure: {0}")]
    Signing(SignerError<K>),

    #[error("nonce: {0}")]
    Nonce(NonceError),

    #[error("chain client: {0}")]
    Client(ClientError<P>),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("submission timed out after {0:?}")]
    SubmissionTimeout(Duration),

    #[error("submission rejected: {0}")]
    SubmissionRejected(ClientError<P>),

    #[error("submission failed: {0}")]
    SubmissionFailed(ClientError<P>),

    #[error("nonce desync detected: {0}")]
    NonceDesync(ClientError<P>),

    #[error("initial nonce sync failed for account {account:?} after {attempts} attempt(s): {reason}")]
    Startup {
        account: Address,
        attempts: usize,
        reason: String,
    },
}

impl<P: ClientProvider, K: Keystore> Error<P, K> {
    /// True for submission failures after which the chain may hold the
    /// failed transaction.
    pub fn is_uncertain(&self) -> bool {
        matches!(self, Error::SubmissionTimeout(_) | Error::SubmissionFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("tx_max_batch_size must be positive")]
    ZeroBatchSize,

    #[error("tx_send_frequency must be positive")]
    ZeroSendFrequency,

    #[error("tx_timeout must be positive")]
    ZeroTimeout,

    #[error("nonce_sync_retries must be positive")]
    ZeroNonceSyncRetries,

    #[error("failure_alert_threshold must be positive")]
    ZeroFailureAlertThreshold,
}

#[derive(Debug, Clone)]
pub struct Configuration<T: Time> {
    /// Maximum number of intents of one account broadcast per tick.
    pub tx_max_batch_size: usize,

    /// Period of the broadcast loop.
    pub tx_send_frequency: Duration,

    /// Deadline for submitting one batch. It also bounds client acquisition,
    /// nonce syncs, signing, and the wait for in-flight batches on close.
    /// Should not exceed `tx_send_frequency`.
    pub tx_timeout: Duration,

    /// Attempts per account for the initial nonce sync.
    pub nonce_sync_retries: usize,

    /// Delay between initial nonce sync attempts.
    pub nonce_sync_delay: Duration,

    /// Consecutive failed broadcasts of one account before raising an alert.
    pub failure_alert_threshold: usize,

    /// Dependency that handles process sleeping and calculating elapsed time.
    pub time: T,
}

impl<T: Time> Configuration<T> {
    pub fn set_tx_max_batch_size(mut self, tx_max_batch_size: usize) -> Configuration<T> {
        self.tx_max_batch_size = tx_max_batch_size;
        self
    }

    pub fn set_tx_send_frequency(mut self, tx_send_frequency: Duration) -> Configuration<T> {
        self.tx_send_frequency = tx_send_frequency;
        self
    }

    pub fn set_tx_timeout(mut self, tx_timeout: Duration) -> Configuration<T> {
        self.tx_timeout = tx_timeout;
        self
    }

    pub fn set_nonce_sync_retries(mut self, nonce_sync_retries: usize) -> Configuration<T> {
        self.nonce_sync_retries = nonce_sync_retries;
        self
    }

    pub fn set_nonce_sync_delay(mut self, nonce_sync_delay: Duration) -> Configuration<T> {
        self.nonce_sync_delay = nonce_sync_delay;
        self
    }

    pub fn set_failure_alert_threshold(mut self, failure_alert_threshold: usize) -> Configuration<T> {
        self.failure_alert_threshold = failure_alert_threshold;
        self
    }

    pub fn set_time<U: Time>(self, time: U) -> Configuration<U> {
        Configuration {
            tx_max_batch_size: self.tx_max_batch_size,
            tx_send_frequency: self.tx_send_frequency,
            tx_timeout: self.tx_timeout,
            nonce_sync_retries: self.nonce_sync_retries,
            nonce_sync_delay: self.nonce_sync_delay,
            failure_alert_threshold: self.failure_alert_threshold,
            time,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.tx_max_batch_size == 0 {
            return Err(ConfigurationError::ZeroBatchSize);
        }
        if self.tx_send_frequency.is_zero() {
            return Err(ConfigurationError::ZeroSendFrequency);
        }
        if self.tx_timeout.is_zero() {
            return Err(ConfigurationError::ZeroTimeout);
        }
        if self.nonce_sync_retries == 0 {
            return Err(ConfigurationError::ZeroNonceSyncRetries);
        }
        if self.failure_alert_threshold == 0 {
            return Err(ConfigurationError::ZeroFailureAlertThreshold);
        }
        Ok(())
    }
}

impl Default for Configuration<DefaultTime> {
    fn default() -> Self {
        Self {
            tx_max_batch_size: TX_MAX_BATCH_SIZE,
            tx_send_frequency: TX_SEND_FREQUENCY,
            tx_timeout: TX_TIMEOUT,
            nonce_sync_retries: NONCE_SYNC_RETRIES,
            nonce_sync_delay: NONCE_SYNC_DELAY,
            failure_alert_threshold: FAILURE_ALERT_THRESHOLD,
            time: DefaultTime,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Closed,
}

#[derive(Debug, Default)]
struct Control {
    stop: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct Manager<P: ClientProvider, K: Keystore, T: Time = DefaultTime> {
    broadcaster: Arc<Broadcaster<P, K, T>>,
    lifecycle: std::sync::Mutex<Lifecycle>,

    // Serializes start and close.
    control: Mutex<Control>,
}

/// Public functions.
impl<P: ClientProvider, K: Keystore, T: Time> Manager<P, K, T> {
    pub fn new(provider: P, keystore: K, chain: Chain, configuration: Configuration<T>) -> Self {
        let manager = Self {
            broadcaster: Arc::new(Broadcaster::new(provider, keystore, chain, configuration)),
            lifecycle: std::sync::Mutex::new(Lifecycle::Created),
            control: Mutex::new(Control::default()),
        };
        trace!("Instantiating a new transaction manager => {:#?}", manager);
        manager
    }

    /// Syncs the nonce of every account in the keystore and starts the
    /// broadcast loop in the background. If any account cannot be synced
    /// within its retry budget, the manager is left unstarted.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn start(&self) -> Result<(), Error<P, K>> {
        let mut control = self.control.lock().await;

        match self.lifecycle() {
            Lifecycle::Created => {}
            Lifecycle::Running => return Err(Error::AlreadyStarted),
            Lifecycle::Closed => return Err(Error::NotRunning),
        }

        let configuration = &self.broadcaster.configuration;
        configuration.validate().map_err(Error::Configuration)?;
        if configuration.tx_timeout > configuration.tx_send_frequency {
            warn!(
                "Transaction timeout ({:?}) exceeds the send frequency ({:?}).",
                configuration.tx_timeout, configuration.tx_send_frequency
            );
        }

        let accounts: Vec<Address> = self
            .broadcaster
            .keystore
            .get_all()
            .await
            .map_err(Error::Keystore)?
            .iter()
            .map(|signer| signer.address())
            .collect();
        if accounts.is_empty() {
            warn!("The keystore has no keys, nothing will be broadcast.");
        }

        for &account in &accounts {
            self.broadcaster.initial_sync(account).await?;
        }
        for &account in &accounts {
            self.broadcaster.register(account);
        }

        let (stop_sender, stop_receiver) = watch::channel(false);
        self.broadcaster.set_healthy(true);
        control.handle = Some(tokio::spawn(broadcast::run(
            Arc::clone(&self.broadcaster),
            stop_receiver,
        )));
        control.stop = Some(stop_sender);
        self.set_lifecycle(Lifecycle::Running);

        info!(
            "Transaction manager started for {} account(s).",
            accounts.len()
        );
        Ok(())
    }

    /// Queues `call` to be broadcast by `account`. Calls of the same account
    /// are sent in the order they were enqueued.
    pub fn enqueue(&self, account: Address, call: FunctionCall) -> Result<(), Error<P, K>> {
        if self.lifecycle() != Lifecycle::Running {
            return Err(Error::NotRunning);
        }

        self.broadcaster
            .queue
            .push(account, call)
            .map_err(|_| Error::UnknownAccount(account))?;

        trace!(
            "Enqueued call for {:?} ({} pending).",
            account,
            self.broadcaster.queue.len(&account)
        );
        Ok(())
    }

    /// Succeeds while the manager is running and its broadcast loop is alive.
    /// Failing broadcasts of individual accounts do not affect readiness.
    pub fn ready(&self) -> Result<(), Error<P, K>> {
        if self.lifecycle() == Lifecycle::Running && self.broadcaster.is_healthy() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    /// Stops the broadcast loop, waiting up to `tx_timeout` for in-flight
    /// batches. Calls still queued are discarded. Closing twice is a no-op.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn close(&self) -> Result<(), Error<P, K>> {
        let mut control = self.control.lock().await;

        if self.lifecycle() == Lifecycle::Closed {
            return Ok(());
        }
        self.set_lifecycle(Lifecycle::Closed);

        if let Some(stop) = control.stop.take() {
            // The loop may already be gone.
            let _ = stop.send(true);
        }
        if let Some(handle) = control.handle.take() {
            if let Err(err) = handle.await {
                error!("Broadcast loop terminated abnormally: {}", err);
            }
        }
        self.broadcaster.set_healthy(false);

        let discarded = self.broadcaster.queue.clear();
        if discarded > 0 {
            warn!("Discarded {} queued call(s) on close.", discarded);
        }
        info!("Transaction manager closed.");
        Ok(())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Accounts being managed. Empty before start.
    pub fn accounts(&self) -> Vec<Address> {
        self.broadcaster.queue.accounts()
    }

    /// Number of calls queued for `account`.
    pub fn pending(&self, account: &Address) -> usize {
        self.broadcaster.queue.len(account)
    }

    /// Next nonce the manager will use for `account`.
    pub fn nonce(&self, account: &Address) -> Option<U256> {
        self.broadcaster.nonces.get(account)
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        *self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = lifecycle;
    }
}
