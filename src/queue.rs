//! Per-account FIFO of call intents waiting to be broadcast.
//!
//! Every account has its own lock, so enqueuing for one account never waits
//! on another account being drained.

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::transaction::FunctionCall;

#[derive(Debug, Default)]
pub struct PendingQueue {
    queues: DashMap<Address, Mutex<VecDeque<FunctionCall>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `account` known to the queue. Registering twice keeps the
    /// already queued intents.
    pub fn register(&self, account: Address) {
        self.queues.entry(account).or_default();
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.queues.iter().map(|entry| *entry.key()).collect()
    }

    /// Appends `call` to the account's queue. Returns the call back if the
    /// account is not registered.
    pub fn push(&self, account: Address, call: FunctionCall) -> Result<(), FunctionCall> {
        match self.queues.get(&account) {
            Some(queue) => {
                lock(&queue).push_back(call);
                Ok(())
            }
            None => Err(call),
        }
    }

    /// Removes up to `max` intents, oldest first.
    pub fn drain(&self, account: &Address, max: usize) -> Vec<FunctionCall> {
        match self.queues.get(account) {
            Some(queue) => {
                let mut queue = lock(&queue);
                let n = max.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    /// Puts `calls` back in front of the queue, keeping their relative order,
    /// so they are drained again before anything enqueued meanwhile.
    pub fn requeue_front(&self, account: &Address, calls: Vec<FunctionCall>) {
        if calls.is_empty() {
            return;
        }

        let queue = self.queues.entry(*account).or_default();
        let mut queue = lock(&queue);
        for call in calls.into_iter().rev() {
            queue.push_front(call);
        }
    }

    pub fn len(&self, account: &Address) -> usize {
        self.queues
            .get(account)
            .map(|queue| lock(&queue).len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, account: &Address) -> bool {
        self.len(account) == 0
    }

    /// Accounts with at least one queued intent.
    pub fn accounts_with_pending(&self) -> Vec<Address> {
        self.queues
            .iter()
            .filter(|entry| !lock(entry.value()).is_empty())
            .map(|entry| *entry.key())
            .collect()
    }

    /// Drops every queued intent and returns how many were dropped.
    pub fn clear(&self) -> usize {
        self.queues
            .iter()
            .map(|entry| {
                let mut queue = lock(entry.value());
                let n = queue.len();
                queue.clear();
                n
            })
            .sum()
    }
}

// A poisoned queue still holds valid intents.
fn lock(queue: &Mutex<VecDeque<FunctionCall>>) -> std::sync::MutexGuard<'_, VecDeque<FunctionCall>> {
    queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
