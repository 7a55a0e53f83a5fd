//! A single slot gate that serializes mutating operations.
//!
//! Backup, import and install operations touch the same trees and must never
//! overlap. Instead of a global busy flag every such operation takes an
//! [`OperationPermit`] which can only be obtained from the [`OperationGate`].

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Returned when another operation currently holds the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("another operation is already in progress")]
pub struct GateBusy;

/// Hands out at most one [`OperationPermit`] at a time. Cloning the gate
/// shares the slot.
#[derive(Debug, Clone)]
pub struct OperationGate {
    semaphore: Arc<Semaphore>,
}

impl Default for OperationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationGate {
    /// Creates a new open gate.
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Takes the slot without waiting.
    pub fn try_acquire(&self) -> Result<OperationPermit, GateBusy> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(OperationPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => Err(GateBusy),
        }
    }

    /// Waits until the slot is free and takes it.
    pub async fn acquire(&self) -> Result<OperationPermit, GateBusy> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_err| GateBusy)?;
        Ok(OperationPermit { _permit: permit })
    }

    /// Returns true if an operation is currently running.
    pub fn is_busy(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

/// Proof that the caller holds the [`OperationGate`]. The slot is released
/// when the permit is dropped.
#[derive(Debug)]
pub struct OperationPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_single_slot() {
        let gate = OperationGate::new();
        let permit = gate.try_acquire().unwrap();
        assert!(gate.is_busy());
        assert_matches!(gate.clone().try_acquire(), Err(GateBusy));
        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let gate = OperationGate::new();
        let permit = gate.try_acquire().unwrap();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.acquire().await.map(|_permit| ()) }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert!(waiter.await.unwrap().is_ok());
    }
}
