//! Bounded hand-off between every source and the controller.
//!
//! Many `Publisher`s, one `Collector`. Capacity, timeouts and the full/empty
//! outcomes are explicit; the channel never grows past its capacity.

use crate::error::PublishError;
use crate::frame::Envelope;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// Create a channel holding at most `capacity` envelopes (minimum 1).
pub fn bounded<P>(capacity: usize) -> (Publisher<P>, Collector<P>) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Publisher { tx }, Collector { rx, capacity })
}

/// An envelope the channel did not accept, handed back for a retry.
#[derive(Debug)]
pub struct Rejected<P> {
    pub reason: PublishError,
    pub envelope: Envelope<P>,
}

/// Producer side, one clone per source.
pub struct Publisher<P> {
    tx: Sender<Envelope<P>>,
}

impl<P> Clone for Publisher<P> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<P> Publisher<P> {
    /// Wait up to `timeout` for room, then enqueue.
    pub fn publish(&self, envelope: Envelope<P>, timeout: Duration) -> Result<(), Rejected<P>> {
        self.tx
            .send_timeout(envelope, timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(envelope) => Rejected {
                    reason: PublishError::Timeout,
                    envelope,
                },
                SendTimeoutError::Disconnected(envelope) => Rejected {
                    reason: PublishError::Closed,
                    envelope,
                },
            })
    }
}

/// Consumer side, owned by the controller.
pub struct Collector<P> {
    rx: Receiver<Envelope<P>>,
    capacity: usize,
}

impl<P> Collector<P> {
    /// Wait up to `timeout` for one envelope. `None` when nothing arrived or
    /// every publisher is gone.
    pub fn receive(&self, timeout: Duration) -> Option<Envelope<P>> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Take one envelope if one is already queued.
    pub fn try_receive(&self) -> Option<Envelope<P>> {
        match self.rx.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Envelopes currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
