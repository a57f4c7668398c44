//! Local nonce tracking for the managed accounts.
//!
//! Handles:
//! - Seeding and resyncing from the chain
//! - Atomic reservation of consecutive nonces
//! - Best-effort rollback of reservations that never reached the chain

use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::client::ChainClient;

#[derive(Debug, thiserror::Error)]
pub enum NonceError {
    #[error("nonce not initialized for account {0:?}")]
    Uninitialized(Address),
}

/// Consecutive nonces handed out to one broadcast attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub account: Address,
    pub start: U256,
    pub count: usize,
    epoch: u64,
}

impl Reservation {
    pub fn nonces(&self) -> impl Iterator<Item = U256> {
        let start = self.start;
        (0..self.count).map(move |i| start + U256::from(i))
    }

    /// First nonce after the reservation.
    pub fn end(&self) -> U256 {
        self.start + U256::from(self.count)
    }

    /// The reservation without its first `n` nonces.
    pub fn skip(&self, n: usize) -> Reservation {
        let n = n.min(self.count);
        Reservation {
            start: self.start + U256::from(n),
            count: self.count - n,
            ..*self
        }
    }

    /// Number of these nonces the chain has used, given its next nonce.
    pub fn landed(&self, chain_nonce: U256) -> usize {
        if chain_nonce <= self.start {
            0
        } else if chain_nonce >= self.end() {
            self.count
        } else {
            (chain_nonce - self.start).as_usize()
        }
    }
}

#[derive(Debug)]
struct NonceState {
    /// Next nonce to hand out.
    next: U256,
    /// Incremented on every sync, invalidating older reservations.
    epoch: u64,
    /// On-chain nonce is uncertain and a sync is due.
    stale: bool,
    /// Nonces whose transactions may or may not have reached the chain,
    /// waiting for a sync to tell.
    uncertain: Option<Reservation>,
}

#[derive(Debug, Default)]
pub struct NonceTracker {
    nonces: DashMap<Address, Mutex<NonceState>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries the chain for the account's nonce and overwrites the tracked
    /// value with it.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn sync<C: ChainClient>(&self, account: Address, client: &C) -> Result<U256, C::Error> {
        let nonce = client.nonce(account).await?;
        self.set(account, nonce);
        Ok(nonce)
    }

    /// Overwrites the tracked nonce with a value observed on chain.
    pub fn set(&self, account: Address, nonce: U256) {
        match self.nonces.get(&account) {
            Some(state) => {
                let mut state = lock(&state);
                if nonce < state.next {
                    warn!(
                        "Resync moved nonce of {:?} back from {} to {}.",
                        account, state.next, nonce
                    );
                } else {
                    debug!("Synced nonce of {:?}: {} -> {}.", account, state.next, nonce);
                }
                state.next = nonce;
                state.epoch += 1;
                state.stale = false;
            }
            None => {
                debug!("Initialized nonce of {:?}: {}.", account, nonce);
                self.nonces.insert(
                    account,
                    Mutex::new(NonceState {
                        next: nonce,
                        epoch: 0,
                        stale: false,
                        uncertain: None,
                    }),
                );
            }
        }
    }

    /// Hands out `count` consecutive nonces and advances the tracked value
    /// past them.
    pub fn reserve(&self, account: Address, count: usize) -> Result<Reservation, NonceError> {
        let state = self
            .nonces
            .get(&account)
            .ok_or(NonceError::Uninitialized(account))?;
        let mut state = lock(&state);

        let reservation = Reservation {
            account,
            start: state.next,
            count,
            epoch: state.epoch,
        };
        state.next = reservation.end();

        trace!(
            "Reserved nonces [{}, {}) for {:?}.",
            reservation.start,
            reservation.end(),
            account
        );
        Ok(reservation)
    }

    /// Gives the nonces of `reservation` back. Only applies when nothing was
    /// reserved after it and no sync happened since. Returns whether the
    /// rollback was applied.
    pub fn rollback(&self, reservation: &Reservation) -> bool {
        let state = match self.nonces.get(&reservation.account) {
            Some(state) => state,
            None => return false,
        };
        let mut state = lock(&state);

        if state.epoch == reservation.epoch && state.next == reservation.end() {
            state.next = reservation.start;
            trace!(
                "Rolled back nonces [{}, {}) for {:?}.",
                reservation.start,
                reservation.end(),
                reservation.account
            );
            true
        } else {
            debug!(
                "Skipping rollback of nonces [{}, {}) for {:?}: state moved on.",
                reservation.start,
                reservation.end(),
                reservation.account
            );
            false
        }
    }

    pub fn mark_stale(&self, account: Address) {
        if let Some(state) = self.nonces.get(&account) {
            lock(&state).stale = true;
        }
    }

    /// Marks the account stale and remembers `reservation` until the next
    /// successful sync can tell which of its transactions were included.
    pub fn mark_uncertain(&self, reservation: Reservation) {
        if let Some(state) = self.nonces.get(&reservation.account) {
            let mut state = lock(&state);
            state.stale = true;
            state.uncertain = Some(reservation);
        }
    }

    pub fn take_uncertain(&self, account: &Address) -> Option<Reservation> {
        self.nonces
            .get(account)
            .and_then(|state| lock(&state).uncertain.take())
    }

    /// True for accounts that were never synced, too.
    pub fn is_stale(&self, account: &Address) -> bool {
        self.nonces
            .get(account)
            .map(|state| lock(&state).stale)
            .unwrap_or(true)
    }

    pub fn get(&self, account: &Address) -> Option<U256> {
        self.nonces.get(account).map(|state| lock(&state).next)
    }
}

fn lock(state: &Mutex<NonceState>) -> MutexGuard<'_, NonceState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
