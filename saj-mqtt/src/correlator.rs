//! Pending request table.
//!
//! Maps the [`RequestKey`] of every in-flight request to its outcome. The
//! inbound pump resolves entries, callers wait on them. A single mutex
//! guards the table and a [`Notify`] wakes waiters after every resolution;
//! the lock is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{FrameError, Result, SajError};
use crate::frame::RequestKey;

/// Decoded content of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Register bytes of a read response, big-endian as sent by the device.
    Registers(Vec<u8>),
    /// Value echoed by a write response.
    Value(u16),
}

impl Payload {
    /// Register bytes, or a protocol error if this is a write echo.
    pub fn into_registers(self) -> Result<Vec<u8>> {
        match self {
            Payload::Registers(data) => Ok(data),
            Payload::Value(_) => Err(SajError::Protocol(
                "expected register data, got a write echo".to_string(),
            )),
        }
    }

    /// Echoed value, or a protocol error if this is register data.
    pub fn into_value(self) -> Result<u16> {
        match self {
            Payload::Value(value) => Ok(value),
            Payload::Registers(_) => Err(SajError::Protocol(
                "expected a write echo, got register data".to_string(),
            )),
        }
    }
}

/// Terminal outcome handed back to a waiting caller.
pub type Resolution = std::result::Result<Payload, FrameError>;

#[derive(Debug)]
enum Outcome {
    Pending,
    Resolved(Payload),
    Failed(FrameError),
}

impl Outcome {
    fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Thread-safe table of in-flight requests.
#[derive(Debug, Default)]
pub struct Correlator {
    table: Mutex<HashMap<RequestKey, Outcome>>,
    resolved: Notify,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    // The table only holds plain values, so a panic elsewhere cannot leave
    // it half-updated.
    fn table(&self) -> MutexGuard<'_, HashMap<RequestKey, Outcome>> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert `key` as pending.
    ///
    /// Returns `false` without touching the table if the key is already in
    /// flight.
    pub fn register(&self, key: RequestKey) -> bool {
        let mut table = self.table();
        if table.contains_key(&key) {
            return false;
        }
        table.insert(key, Outcome::Pending);
        true
    }

    /// Whether `key` is registered and still waiting for a response.
    pub fn is_pending(&self, key: &RequestKey) -> bool {
        matches!(self.table().get(key), Some(Outcome::Pending))
    }

    /// Whether `key` is present in the table, in any state.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.table().contains_key(key)
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Move a pending entry to its terminal outcome and wake every waiter.
    ///
    /// Returns `false` if the key is unknown (never registered, or already
    /// purged by a timed-out caller) or already resolved.
    pub fn resolve(&self, key: RequestKey, resolution: Resolution) -> bool {
        {
            let mut table = self.table();
            match table.get_mut(&key) {
                Some(outcome @ Outcome::Pending) => {
                    *outcome = match resolution {
                        Ok(payload) => Outcome::Resolved(payload),
                        Err(err) => Outcome::Failed(err),
                    };
                }
                _ => return false,
            }
        }

        self.resolved.notify_waiters();
        true
    }

    /// Remove `keys` from the table, whatever their state.
    pub fn purge(&self, keys: &[RequestKey]) {
        let mut table = self.table();
        for key in keys {
            table.remove(key);
        }
    }

    /// Wait until every key in `keys` has a terminal outcome.
    ///
    /// On success the outcomes are returned in the order of `keys` and the
    /// entries are removed. On timeout every key is removed and
    /// [`SajError::RequestTimeout`] is returned.
    pub async fn await_all(
        &self,
        keys: &[RequestKey],
        timeout: Duration,
    ) -> Result<Vec<Resolution>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let wait = async {
            loop {
                // Arm the notification before checking so a resolution
                // landing in between is not missed.
                let notified = self.resolved.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(taken) = self.take_if_terminal(keys) {
                    return taken;
                }

                notified.await;
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(taken) => taken,
            Err(_) => {
                let outstanding = {
                    let mut table = self.table();
                    keys.iter()
                        .filter_map(|key| table.remove(key))
                        .filter(|outcome| !outcome.is_terminal())
                        .count()
                };

                tracing::debug!(
                    requests = keys.len(),
                    outstanding,
                    "Timed out waiting for responses"
                );

                Err(SajError::RequestTimeout {
                    outstanding,
                    timeout,
                })
            }
        }
    }

    /// Remove and return all outcomes if every key is terminal.
    fn take_if_terminal(&self, keys: &[RequestKey]) -> Option<Result<Vec<Resolution>>> {
        let mut table = self.table();

        let mut ready = true;
        for key in keys {
            match table.get(key) {
                Some(outcome) => ready &= outcome.is_terminal(),
                None => {
                    for stale in keys {
                        table.remove(stale);
                    }
                    return Some(Err(SajError::invalid_request(format!(
                        "request {} is not registered",
                        key
                    ))));
                }
            }
        }

        if !ready {
            return None;
        }

        let resolutions = keys
            .iter()
            .filter_map(|key| table.remove(key))
            .map(|outcome| match outcome {
                Outcome::Resolved(payload) => Ok(payload),
                Outcome::Failed(err) => Err(err),
                Outcome::Pending => unreachable!("checked terminal above"),
            })
            .collect();

        Some(Ok(resolutions))
    }
}

/// The keys registered by one call.
///
/// Dropping the guard removes any key still in the table, so a caller that
/// is cancelled mid-wait leaves nothing behind. [`PendingRequests::wait`]
/// consumes the guard once the table has released the keys itself.
#[derive(Debug)]
pub struct PendingRequests {
    correlator: Arc<Correlator>,
    keys: Vec<RequestKey>,
}

impl PendingRequests {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            correlator,
            keys: Vec::new(),
        }
    }

    /// Register `key`, returning `false` if it is already in flight.
    pub fn register(&mut self, key: RequestKey) -> bool {
        if !self.correlator.register(key) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn keys(&self) -> &[RequestKey] {
        &self.keys
    }

    /// Wait for every key under one deadline, as [`Correlator::await_all`].
    pub async fn wait(mut self, timeout: Duration) -> Result<Vec<Resolution>> {
        let result = self.correlator.await_all(&self.keys, timeout).await;
        // await_all removed the keys; they may already belong to another call.
        self.keys.clear();
        result
    }
}

impl Drop for PendingRequests {
    fn drop(&mut self) {
        if !self.keys.is_empty() {
            self.correlator.purge(&self.keys);
        }
    }
}
