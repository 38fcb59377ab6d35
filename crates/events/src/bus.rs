//! Publish/subscribe boundary for chunk dispatch notifications.
//!
//! The bus is the **transport layer** between the enqueue gateway and the
//! worker pool:
//!
//! ```text
//! Maintenance pass → Enqueue gateway (READY → QUEUED) → NotificationBus → Workers
//! ```
//!
//! The status transition is recorded first; publishing happens only after the
//! compare-and-swap succeeded. If publishing fails the chunk stays `QUEUED` and
//! a redrive policy outside this workspace is responsible for it.
//!
//! ## Delivery
//!
//! - **At-least-once** from the transport's point of view: workers must treat
//!   a failed dequeue (chunk no longer `QUEUED`) as "nothing to claim"
//! - **No ordering guarantees** between chunks
//! - **No persistence**: the chunk store is the source of truth

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a notification stream.
///
/// Each subscription receives its own copy of every published message
/// (broadcast semantics). Subscriptions are meant to be drained by a single
/// thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Transport-agnostic notification bus.
///
/// Implementations must be `Send + Sync`; the enqueue gateway publishes from
/// maintenance threads while workers subscribe from their own threads.
pub trait NotificationBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> NotificationBus<M> for Arc<B>
where
    B: NotificationBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
