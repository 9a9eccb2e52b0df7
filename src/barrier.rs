//! One-shot completion gate.
//!
//! [`CompletionBarrier`] counts the distinct peers that have sent their
//! final batch. It moves from [`BarrierState::Waiting`] to
//! [`BarrierState::Released`] exactly once, when every peer is done, and
//! never goes back. The owner keeps it under the same lock as the receive
//! buffer and fires a [`ReleaseSignal`] on the transition.

use tokio::sync::watch;

use crate::error::{Result, SortError};
use crate::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierState {
    Waiting,
    Released,
}

#[derive(Debug)]
pub struct CompletionBarrier {
    me: NodeId,
    finished: Vec<bool>,
    received: usize,
    expected: usize,
    state: BarrierState,
}

impl CompletionBarrier {
    /// A barrier waiting on every node of a `total_nodes` cluster except
    /// `me`. A single-node cluster starts released.
    pub fn new(total_nodes: usize, me: NodeId) -> Self {
        let expected = total_nodes.saturating_sub(1);
        CompletionBarrier {
            me,
            finished: vec![false; total_nodes],
            received: 0,
            expected,
            state: if expected == 0 {
                BarrierState::Released
            } else {
                BarrierState::Waiting
            },
        }
    }

    /// Records that `peer` has sent its final batch.
    ///
    /// Returns `true` only on the call that releases the barrier. Repeated
    /// finals from the same peer are not counted again.
    pub fn mark_final(&mut self, peer: NodeId) -> Result<bool> {
        if peer == self.me {
            return Err(SortError::Protocol(format!(
                "node {peer} cannot signal completion to itself"
            )));
        }
        let seen = self.finished.get_mut(peer).ok_or_else(|| {
            SortError::Protocol(format!("unknown peer {peer} signalled completion"))
        })?;
        if *seen {
            return Ok(false);
        }
        *seen = true;
        self.received += 1;

        if self.state == BarrierState::Waiting && self.received >= self.expected {
            self.state = BarrierState::Released;
            return Ok(true);
        }
        Ok(false)
    }

    /// Whether `peer` has already sent its final batch.
    pub fn has_finished(&self, peer: NodeId) -> bool {
        self.finished.get(peer).copied().unwrap_or(false)
    }

    pub fn state(&self) -> BarrierState {
        self.state
    }

    pub fn is_released(&self) -> bool {
        self.state == BarrierState::Released
    }

    /// Distinct peers that have finished.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn expected(&self) -> usize {
        self.expected
    }
}

/// Broadcast side of the barrier. Firing it more than once is harmless.
#[derive(Debug)]
pub struct ReleaseSignal {
    tx: watch::Sender<bool>,
}

impl ReleaseSignal {
    pub fn new(released: bool) -> Self {
        let (tx, _) = watch::channel(released);
        ReleaseSignal { tx }
    }

    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        rx.wait_for(|released| *released).await.ok();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use rstest::*;

    use super::*;

    #[rstest]
    fn test_single_node_starts_released() {
        let barrier = CompletionBarrier::new(1, 0);
        assert_eq!(barrier.state(), BarrierState::Released);
        assert_eq!(barrier.expected(), 0);
    }

    #[rstest]
    fn test_releases_after_every_peer() {
        let mut barrier = CompletionBarrier::new(4, 2);

        assert!(!barrier.mark_final(0).unwrap());
        assert!(!barrier.mark_final(3).unwrap());
        assert_eq!(barrier.state(), BarrierState::Waiting);
        assert!(barrier.mark_final(1).unwrap());
        assert!(barrier.is_released());
    }

    #[rstest]
    fn test_duplicate_final_is_not_counted() {
        let mut barrier = CompletionBarrier::new(3, 0);

        assert!(!barrier.mark_final(1).unwrap());
        assert!(!barrier.mark_final(1).unwrap());
        assert!(!barrier.mark_final(1).unwrap());
        assert_eq!(barrier.received(), 1);
        assert_eq!(barrier.state(), BarrierState::Waiting);

        assert!(barrier.mark_final(2).unwrap());
        assert!(!barrier.mark_final(2).unwrap());
        assert!(barrier.is_released());
    }

    #[rstest]
    #[case::itself(1)]
    #[case::unknown(7)]
    fn test_rejects_bad_peer(#[case] peer: NodeId) {
        let mut barrier = CompletionBarrier::new(3, 1);
        assert!(matches!(barrier.mark_final(peer), Err(SortError::Protocol(_))));
        assert_eq!(barrier.received(), 0);
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let signal = Arc::new(ReleaseSignal::new(false));
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        signal.fire();
        signal.fire();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(signal.is_fired());
    }

    #[tokio::test]
    async fn test_wait_after_fire_returns_immediately() {
        let signal = ReleaseSignal::new(true);
        tokio::time::timeout(Duration::from_secs(1), signal.wait())
            .await
            .unwrap();
    }
}
