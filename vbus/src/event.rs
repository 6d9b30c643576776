//! Outbound event delivery to observers.

use std::sync::{Arc, Mutex, PoisonError};

use vbus_proto::Update;

/// Receiver of the machine's outbound updates.
///
/// The host decides how updates reach observers: over its network layer,
/// into a queue, or nowhere.
pub trait EventSink: Send {
    /// Delivers one update. Called on the host thread, in order.
    fn publish(&mut self, update: Update);
}

impl<F: FnMut(Update) + Send> EventSink for F {
    fn publish(&mut self, update: Update) {
        self(update);
    }
}

/// Sink that drops every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Discard;

impl EventSink for Discard {
    fn publish(&mut self, _update: Update) {}
}

/// In-memory sink; clones share one queue.
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    inner: Arc<Mutex<Vec<Update>>>,
}

impl EventQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every queued update, oldest first.
    pub fn drain(&self) -> Vec<Update> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl EventSink for EventQueue {
    fn publish(&mut self, update: Update) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
    }
}
