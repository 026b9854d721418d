// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Completion signaling between the interrupt path and a blocked consumer.
//!
//! The signal is a single-slot mailbox: the interrupt path posts into it, and a
//! consumer takes the posted event out. There is no count. Any number of
//! interrupts that arrive before the consumer takes the event collapse into
//! one, so multiple rapid completions are indistinguishable from a single one.

use crate::DeviceError;
use event_listener::Event;
use event_listener::Listener;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::AcqRel;
use std::sync::atomic::Ordering::Release;

/// A coalescing completion flag with a wait channel.
///
/// Cloning produces another handle to the same signal.
#[derive(Clone)]
pub struct CompletionSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    pending: AtomicBool,
    event: Event,
}

impl std::fmt::Debug for CompletionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionSignal")
            .field("pending", &self.inner.pending.load(Acquire))
            .finish()
    }
}

impl CompletionSignal {
    /// Creates a new signal in the clear state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                pending: AtomicBool::new(false),
                event: Event::new(),
            }),
        }
    }

    /// Posts an event and wakes all waiters.
    ///
    /// Safe to call from an interrupt path: this never blocks and never
    /// allocates. If an event is already pending, this does nothing.
    pub fn signal(&self) {
        if self.inner.pending.swap(true, AcqRel) {
            return;
        }
        self.inner.event.notify(usize::MAX);
    }

    /// Returns whether an event is pending, without consuming it.
    pub fn poll_ready(&self) -> bool {
        self.inner.pending.load(Acquire)
    }

    /// Discards any pending event.
    pub fn reset(&self) {
        self.inner.pending.store(false, Release);
    }

    /// Blocks until an event is pending, then consumes it.
    ///
    /// Returns [`DeviceError::Interrupted`] if `cancel` is (or becomes)
    /// cancelled first. A cancelled wait leaves any pending event in place.
    pub fn wait_for_event(&self, cancel: &CancelToken) -> Result<(), DeviceError> {
        loop {
            if cancel.take() {
                return Err(DeviceError::Interrupted);
            }
            if self.try_take() {
                return Ok(());
            }
            let listener = self.inner.event.listen();
            // Check again now that the listener is registered, so that a
            // signal or cancel racing with `listen` is not lost.
            if cancel.take() {
                return Err(DeviceError::Interrupted);
            }
            if self.try_take() {
                return Ok(());
            }
            listener.wait();
        }
    }

    /// Waits until an event is pending, without consuming it.
    pub async fn ready(&self) {
        loop {
            if self.poll_ready() {
                return;
            }
            let listener = self.inner.event.listen();
            if self.poll_ready() {
                return;
            }
            listener.await;
        }
    }

    /// Returns a new cancellation token for waits on this signal.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            inner: self.inner.clone(),
            state: Arc::new(TokenState {
                cancelled: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn try_take(&self) -> bool {
        self.inner.pending.swap(false, AcqRel)
    }
}

/// Aborts a blocked [`CompletionSignal::wait_for_event`].
///
/// A cancellation is consumed by the wait that observes it. If no wait is in
/// progress, the next wait using this token returns
/// [`DeviceError::Interrupted`] immediately.
///
/// Closing the token is permanent: every current and future wait using it
/// returns [`DeviceError::Interrupted`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<SignalInner>,
    state: Arc<TokenState>,
}

struct TokenState {
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl CancelToken {
    /// Cancels the current (or next) wait that uses this token.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Release);
        // Waiters on other tokens wake too, recheck, and go back to sleep.
        self.inner.event.notify(usize::MAX);
    }

    /// Cancels every wait that uses this token, now and later.
    pub fn close(&self) {
        self.state.closed.store(true, Release);
        self.inner.event.notify(usize::MAX);
    }

    /// Returns whether a cancellation is outstanding.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Acquire)
    }

    fn take(&self) -> bool {
        self.is_closed() || self.state.cancelled.swap(false, AcqRel)
    }
}
