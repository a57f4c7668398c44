//! The broadcast loop.
//!
//! Every `tx_send_frequency` the loop spawns one attempt per account with
//! queued calls. An attempt drains up to `tx_max_batch_size` calls, acquires
//! a client, reserves one nonce per call, signs and submits the batch. Any
//! failure puts the unsent calls back in front of the account's queue, so
//! they are retried on a later tick in their original order.

use dashmap::DashMap;
use ethers::signers::Signer;
use ethers::types::{Address, H256, U256};
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use crate::client::{ChainClient, ClientProvider, SubmitFailure};
use crate::keystore::Keystore;
use crate::manager::{Configuration, Error};
use crate::nonce::{NonceTracker, Reservation};
use crate::queue::PendingQueue;
use crate::time::Time;
use crate::transaction::{Chain, FunctionCall, SignedBatch, SignedTransaction};

#[derive(Debug, Default)]
struct AccountSlot {
    /// Held for the whole duration of a broadcast attempt.
    in_flight: Arc<Mutex<()>>,
    consecutive_failures: AtomicUsize,
}

#[derive(Debug)]
pub(crate) struct Broadcaster<P: ClientProvider, K: Keystore, T: Time> {
    pub(crate) provider: P,
    pub(crate) keystore: K,
    pub(crate) chain: Chain,
    pub(crate) configuration: Configuration<T>,

    pub(crate) queue: PendingQueue,
    pub(crate) nonces: NonceTracker,

    slots: DashMap<Address, Arc<AccountSlot>>,
    healthy: AtomicBool,
}

/// Drives ticks until `stop` fires or its sender is dropped.
pub(crate) async fn run<P, K, T>(broadcaster: Arc<Broadcaster<P, K, T>>, mut stop: watch::Receiver<bool>)
where
    P: ClientProvider,
    K: Keystore,
    T: Time,
{
    let configuration = &broadcaster.configuration;
    info!(
        "Broadcast loop started (frequency = {:?}, batch size = {}, timeout = {:?}).",
        configuration.tx_send_frequency, configuration.tx_max_batch_size, configuration.tx_timeout
    );

    let mut attempts = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = configuration.time.sleep(configuration.tx_send_frequency) => {}
        }

        let healthy = reap(&mut attempts);
        broadcaster.set_healthy(healthy);
        broadcaster.tick(&mut attempts);
    }

    broadcaster.set_healthy(false);
    debug!("Stopping broadcast loop, {} attempt(s) in flight.", attempts.len());

    let drain = async {
        while let Some(result) = attempts.join_next().await {
            log_join_error(result);
        }
    };
    if tokio::time::timeout(configuration.tx_timeout, drain).await.is_err() {
        warn!(
            "In-flight broadcasts did not finish within {:?}, aborting them.",
            configuration.tx_timeout
        );
        attempts.abort_all();
    }

    info!("Broadcast loop stopped.");
}

/// Collects finished attempts without waiting. Returns false if any of them
/// panicked.
fn reap(attempts: &mut JoinSet<()>) -> bool {
    let mut healthy = true;
    while let Some(Some(result)) = attempts.join_next().now_or_never() {
        healthy &= log_join_error(result);
    }
    healthy
}

fn log_join_error(result: Result<(), tokio::task::JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) if err.is_cancelled() => true,
        Err(err) => {
            error!("Broadcast attempt terminated abnormally: {}", err);
            false
        }
    }
}

impl<P: ClientProvider, K: Keystore, T: Time> Broadcaster<P, K, T> {
    pub(crate) fn new(provider: P, keystore: K, chain: Chain, configuration: Configuration<T>) -> Self {
        Self {
            provider,
            keystore,
            chain,
            configuration,
            queue: PendingQueue::new(),
            nonces: NonceTracker::new(),
            slots: DashMap::new(),
            healthy: AtomicBool::new(false),
        }
    }

    pub(crate) fn register(&self, account: Address) {
        self.queue.register(account);
        self.slots.entry(account).or_default();
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Initial nonce sync, retried up to `nonce_sync_retries` times with a
    /// fresh client on each attempt.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) async fn initial_sync(&self, account: Address) -> Result<U256, Error<P, K>> {
        let retries = self.configuration.nonce_sync_retries;
        let mut attempt = 0;
        loop {
            attempt += 1;

            let result = match self.acquire_client().await {
                Ok(client) => self.sync_nonce(account, &client).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(nonce) => {
                    info!("Nonce of {:?} synced at {}.", account, nonce);
                    return Ok(nonce);
                }

                Err(err) if attempt < retries => {
                    warn!(
                        "Nonce sync of {:?} failed (attempt {}/{}): {}",
                        account, attempt, retries, err
                    );
                    self.configuration
                        .time
                        .sleep(self.configuration.nonce_sync_delay)
                        .await;
                }

                Err(err) => {
                    error!(
                        "Nonce sync of {:?} failed after {} attempt(s): {}",
                        account, attempt, err
                    );
                    return Err(Error::Startup {
                        account,
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Spawns one attempt for every account with queued calls, skipping
    /// accounts whose previous attempt is still running.
    fn tick(self: &Arc<Self>, attempts: &mut JoinSet<()>) {
        for account in self.queue.accounts_with_pending() {
            let slot = self.slot(&account);
            let guard = match Arc::clone(&slot.in_flight).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    trace!("Broadcast for {:?} still in flight, skipping.", account);
                    continue;
                }
            };

            let this = Arc::clone(self);
            attempts.spawn(async move { this.broadcast(account, slot, guard).await });
        }
    }

    async fn broadcast(&self, account: Address, slot: Arc<AccountSlot>, _in_flight: OwnedMutexGuard<()>) {
        let start = Instant::now();

        match self.try_broadcast(account).await {
            Ok(hashes) => {
                slot.consecutive_failures.store(0, Ordering::Relaxed);
                if !hashes.is_empty() {
                    info!(
                        "Broadcast {} transaction(s) for {:?}: {:?}.",
                        hashes.len(),
                        account,
                        hashes
                    );
                }
            }

            Err(err) => {
                let failures = slot.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Broadcast for {:?} failed: {}", account, err);

                let threshold = self.configuration.failure_alert_threshold;
                if failures % threshold == 0 {
                    error!(
                        "Broadcast for {:?} has failed {} consecutive time(s), {} call(s) pending. Last error: {}",
                        account,
                        failures,
                        self.queue.len(&account),
                        err
                    );
                }
            }
        }

        let elapsed = self.configuration.time.elapsed(start);
        if elapsed > self.configuration.tx_send_frequency {
            warn!(
                "Broadcast for {:?} took {:?}, longer than the send frequency.",
                account, elapsed
            );
        }
    }

    /// One drain-sign-submit cycle. Returns the hashes of the transactions
    /// accepted by the node.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn try_broadcast(&self, account: Address) -> Result<Vec<H256>, Error<P, K>> {
        let mut calls = self
            .queue
            .drain(&account, self.configuration.tx_max_batch_size);
        if calls.is_empty() {
            return Ok(Vec::new());
        }
        trace!("Drained {} call(s) for {:?}.", calls.len(), account);

        let client = match self.acquire_client().await {
            Ok(client) => client,
            Err(err) => {
                self.queue.requeue_front(&account, calls);
                return Err(err);
            }
        };

        if self.nonces.is_stale(&account) {
            let nonce = match self.sync_nonce(account, &client).await {
                Ok(nonce) => nonce,
                Err(err) => {
                    self.queue.requeue_front(&account, calls);
                    return Err(err);
                }
            };

            // Calls of an earlier uncertain submission sit at the front of
            // the queue. Those the chain included must not be sent again.
            if let Some(uncertain) = self.nonces.take_uncertain(&account) {
                let landed = uncertain.landed(nonce).min(calls.len());
                if landed > 0 {
                    debug!(
                        "{} call(s) of {:?} reached the chain despite an earlier failure, dropping them.",
                        landed, account
                    );
                    calls.drain(..landed);
                }
                if calls.is_empty() {
                    return Ok(Vec::new());
                }
            }
        }

        let reservation = match self.nonces.reserve(account, calls.len()) {
            Ok(reservation) => reservation,
            Err(err) => {
                self.queue.requeue_front(&account, calls);
                return Err(Error::Nonce(err));
            }
        };

        let signed = self
            .bounded("signing", self.sign(account, &client, &calls, &reservation))
            .await
            .and_then(|signed| signed);
        let batch = match signed {
            Ok(batch) => batch,
            Err(err) => {
                // Nothing reached the chain, the nonces can be reused.
                self.nonces.rollback(&reservation);
                self.queue.requeue_front(&account, calls);
                return Err(err);
            }
        };

        let (hashes, result) = self.submit(&client, &batch).await;
        let err = match result {
            Ok(()) => return Ok(hashes),
            Err(err) => err,
        };

        // The chain may or may not have seen the failed transaction.
        self.nonces.mark_stale(account);
        let synced = match self.sync_nonce(account, &client).await {
            Ok(nonce) => Some(nonce),
            Err(sync_err) => {
                warn!(
                    "Nonce resync of {:?} failed, retrying next tick: {}",
                    account, sync_err
                );
                None
            }
        };

        let mut sent = hashes.len();
        if err.is_uncertain() {
            match synced {
                Some(nonce) => {
                    let landed = reservation.landed(nonce);
                    if landed > sent {
                        debug!(
                            "{} transaction(s) of {:?} reached the chain despite the failure: {:?}.",
                            landed - sent,
                            account,
                            batch.transactions[sent..landed]
                                .iter()
                                .map(|transaction| transaction.hash)
                                .collect::<Vec<_>>()
                        );
                        sent = landed;
                    }
                }

                // Settled by the next successful sync.
                None => self.nonces.mark_uncertain(reservation.skip(sent)),
            }
        }

        let unsent = calls.split_off(sent);
        debug!(
            "Submission for {:?} failed after {} of {} transaction(s), requeueing {}.",
            account,
            sent,
            batch.len(),
            unsent.len()
        );
        self.queue.requeue_front(&account, unsent);

        Err(err)
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn sign(
        &self,
        account: Address,
        client: &P::Client,
        calls: &[FunctionCall],
        reservation: &Reservation,
    ) -> Result<SignedBatch, Error<P, K>> {
        let signer = self.keystore.get(account).await.map_err(Error::Keystore)?;
        if signer.address() != account {
            return Err(Error::SignerMismatch {
                account,
                signer: signer.address(),
            });
        }

        let mut batch = SignedBatch::default();
        for (call, nonce) in calls.iter().zip(reservation.nonces()) {
            let mut typed_transaction = call.to_transaction_request(account, self.chain, nonce);

            client
                .fill_transaction(&mut typed_transaction)
                .await
                .map_err(Error::Client)?;

            let signature = signer
                .sign_transaction(&typed_transaction)
                .await
                .map_err(Error::Signing)?;

            batch.push(SignedTransaction::new(
                call.clone(),
                account,
                nonce,
                &typed_transaction,
                &signature,
            ));
        }

        Ok(batch)
    }

    /// Sends the batch in order under a single `tx_timeout` deadline, stopping
    /// at the first failure. Returns the hashes of the accepted transactions.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn submit(&self, client: &P::Client, batch: &SignedBatch) -> (Vec<H256>, Result<(), Error<P, K>>) {
        let timeout = self.configuration.tx_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut hashes = Vec::with_capacity(batch.len());
        for transaction in batch {
            let result = tokio::time::timeout_at(deadline, client.send_transaction(transaction)).await;

            match result {
                Ok(Ok(hash)) => {
                    trace!(
                        "Submitted transaction {:?} (nonce = {}).",
                        hash,
                        transaction.nonce
                    );
                    hashes.push(hash);
                }

                Ok(Err(err)) => {
                    let err = match <P::Client as ChainClient>::classify(&err) {
                        SubmitFailure::AlreadyKnown => {
                            debug!(
                                "Transaction {:?} (nonce = {}) already known by the node.",
                                transaction.hash, transaction.nonce
                            );
                            hashes.push(transaction.hash);
                            continue;
                        }
                        SubmitFailure::NonceDesync => Error::NonceDesync(err),
                        SubmitFailure::Rejected => Error::SubmissionRejected(err),
                        SubmitFailure::Transport => Error::SubmissionFailed(err),
                    };
                    return (hashes, Err(err));
                }

                Err(_) => return (hashes, Err(Error::SubmissionTimeout(timeout))),
            }
        }

        (hashes, Ok(()))
    }

    async fn acquire_client(&self) -> Result<P::Client, Error<P, K>> {
        let result = self
            .bounded("client acquisition", self.provider.get_client())
            .await?;
        result.map_err(Error::ClientUnavailable)
    }

    async fn sync_nonce(&self, account: Address, client: &P::Client) -> Result<U256, Error<P, K>> {
        let result = self
            .bounded("nonce sync", self.nonces.sync(account, client))
            .await?;
        result.map_err(Error::Client)
    }

    /// Runs `future` under `tx_timeout`.
    async fn bounded<F: Future>(&self, operation: &'static str, future: F) -> Result<F::Output, Error<P, K>> {
        let after = self.configuration.tx_timeout;
        tokio::time::timeout(after, future)
            .await
            .map_err(|_| Error::Timeout { operation, after })
    }

    fn slot(&self, account: &Address) -> Arc<AccountSlot> {
        Arc::clone(&self.slots.entry(*account).or_default())
    }
}
