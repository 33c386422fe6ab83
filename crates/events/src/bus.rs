//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes messages (notification requests, upload triggers) to
//! consumers. It is transport-agnostic and makes minimal assumptions:
//!
//! - **At-least-once delivery**: messages may be delivered more than once;
//!   consumers must be idempotent (notification requests carry a dedup key)
//! - **No ordering guarantees** between publishers
//! - **No persistence**: the step log and the document store are the source of truth

use std::sync::Arc;
use std::sync::mpsc::Receiver;

/// A subscription to a message stream.
///
/// Each subscription gets a copy of every message published after it was
/// created (broadcast semantics). Designed for single-threaded consumption.
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

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic pub/sub abstraction.
///
/// `publish()` can fail (bus closed, network error). Failures are surfaced to
/// the caller, which decides whether the failure is fatal for its step.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
