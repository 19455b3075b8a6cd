//! Per-destination decide/queue/drain state machine.
//!
//! A [`FlowController`] owns one [`CreditCounter`] and one [`PendingQueue`]
//! for a single destination and moves between two states:
//!
//! - **Flowing**: the queue is empty; a send that fits the remaining
//!   credit is forwarded downstream immediately
//! - **Queuing**: at least one message is held; every further send is
//!   appended behind it so queued messages are never bypassed, and a
//!   replenishment drains the queue head-first for as far as the new
//!   credit reaches
//!
//! # Lock discipline
//!
//! All credit and queue bookkeeping happens under one `parking_lot::Mutex`
//! per destination. The lock is always released before the
//! [`DownstreamSender`] is invoked, both on the immediate-send path and for
//! each drained message, so a slow transport never stalls senders and a
//! downstream call that re-enters this layer cannot deadlock.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::credit::CreditCounter;
use crate::metrics::Counter;
use crate::queue::PendingQueue;
use crate::{
    DownstreamSender, FlowControlConfig, MessageSize, OverflowPolicy, Result, SendOutcome,
};

/// Mutable per-destination state, guarded by the controller lock.
struct ControllerState<M> {
    credit: CreditCounter,
    queue: PendingQueue<M>,
    /// True from the first queued message until the queue fully drains.
    queuing: bool,
    /// When the last credit request was emitted for this destination.
    last_credit_request: Option<Instant>,
}

/// Flow controller for a single destination.
///
/// Normally managed by a [`FlowRegistry`](crate::FlowRegistry), which
/// creates one controller per live destination; a controller can also be
/// used standalone when only a single peer is flow-controlled.
pub struct FlowController<D, M> {
    destination: D,
    config: FlowControlConfig,
    sender: Arc<dyn DownstreamSender<D, M>>,
    state: Mutex<ControllerState<M>>,
    /// Times a message was queued due to insufficient credit.
    queuings: Counter,
    /// Messages evicted by the drop-oldest overflow policy.
    dropped: Counter,
    /// Credit requests emitted toward the destination.
    credit_requests: Counter,
}

impl<D, M> FlowController<D, M> {
    /// Create a controller with a full credit budget and an empty queue.
    pub fn new(
        destination: D,
        config: FlowControlConfig,
        sender: Arc<dyn DownstreamSender<D, M>>,
    ) -> Self {
        let state = ControllerState {
            credit: CreditCounter::new(config.max_credits),
            queue: PendingQueue::new(config.max_queue_size),
            queuing: false,
            last_credit_request: None,
        };
        Self {
            destination,
            config,
            sender,
            state: Mutex::new(state),
            queuings: Counter::new(),
            dropped: Counter::new(),
            credit_requests: Counter::new(),
        }
    }

    /// The destination this controller governs.
    pub fn destination(&self) -> &D {
        &self.destination
    }

    /// True while at least one message is held awaiting credit.
    pub fn is_queuing(&self) -> bool {
        self.state.lock().queuing
    }

    /// Messages currently held in the pending queue.
    pub fn queued_messages(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Bytes currently held in the pending queue.
    pub fn queued_bytes(&self) -> u64 {
        self.state.lock().queue.queued_bytes()
    }

    /// Bytes that may still be sent before queuing starts.
    pub fn remaining_credit(&self) -> u64 {
        self.state.lock().credit.remaining()
    }

    /// Point-in-time view of this destination's flow-control state.
    pub fn stats(&self) -> DestinationStats {
        let state = self.state.lock();
        DestinationStats {
            remaining_credit: state.credit.remaining(),
            queued_messages: state.queue.len(),
            queued_bytes: state.queue.queued_bytes(),
            is_queuing: state.queuing,
            queuings: self.queuings.get(),
            dropped_messages: self.dropped.get(),
            credit_requests_sent: self.credit_requests.get(),
        }
    }

    /// Reset the monotonic counters to zero.
    pub fn reset_stats(&self) {
        self.queuings.reset();
        self.dropped.reset();
        self.credit_requests.reset();
    }
}

impl<D, M> FlowController<D, M>
where
    D: fmt::Debug,
    M: MessageSize,
{
    /// Forward `message` now if credit allows, otherwise queue it.
    ///
    /// Never blocks: the worst case appends to the in-memory queue (or
    /// rejects per the overflow policy) and returns. While earlier
    /// messages are held, later ones are queued behind them even if they
    /// would fit the remaining credit, preserving per-destination order.
    pub fn send(&self, message: M) -> Result<SendOutcome> {
        let size = message.size_in_bytes();
        let mut state = self.state.lock();

        if !state.queuing && state.credit.try_consume(size) {
            trace!(
                "Forwarding {} bytes to {:?}, {} credit remaining",
                size,
                self.destination,
                state.credit.remaining()
            );
            drop(state);
            self.sender.forward(&self.destination, message);
            return Ok(SendOutcome::Sent);
        }

        // Queue path: already queuing, or not enough credit for this one.
        let enqueued = self.queue_message(&mut state, message, size);
        let request = self.due_credit_request(&mut state);
        drop(state);

        if let Some(amount) = request {
            debug!(
                "Requesting {} bytes of credit from {:?}",
                amount, self.destination
            );
            self.credit_requests.inc();
            self.sender.request_credit(&self.destination, amount);
        }
        enqueued.map(|_| SendOutcome::Queued)
    }

    /// Apply a credit grant and forward queued messages it covers.
    ///
    /// Drained messages are handed to the downstream sender one at a
    /// time, in queue order, after the state lock is released. The drain
    /// stops the instant credit is insufficient for the head message, so
    /// work done on the replenishing thread stays bounded.
    pub fn replenish(&self, amount: u64) {
        let drained = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.credit.replenish(amount);
            let drained = state.queue.drain(&mut state.credit);
            if state.queue.is_empty() {
                state.queuing = false;
            }
            if !drained.is_empty() {
                trace!(
                    "Draining {} message(s) to {:?}, {} still queued, {} credit remaining",
                    drained.len(),
                    self.destination,
                    state.queue.len(),
                    state.credit.remaining()
                );
            }
            drained
        };

        for message in drained {
            self.sender.forward(&self.destination, message);
        }
    }

    /// Append a message to the pending queue per the overflow policy.
    fn queue_message(
        &self,
        state: &mut ControllerState<M>,
        message: M,
        size: u64,
    ) -> Result<()> {
        if size > self.config.max_credits {
            warn!(
                "Message of {} bytes to {:?} exceeds the credit ceiling of {} and can never drain",
                size, self.destination, self.config.max_credits
            );
        }

        match self.config.overflow_policy {
            OverflowPolicy::RejectNew => state.queue.enqueue(message, size)?,
            OverflowPolicy::DropOldest => {
                if size > self.config.max_queue_size {
                    // Nothing to evict would make this fit.
                    return Err(crate::FlowControlError::CapacityExceeded {
                        message_size: size,
                        queued_bytes: state.queue.queued_bytes(),
                        max_queue_size: self.config.max_queue_size,
                    });
                }
                let mut evicted = 0u64;
                while !state.queue.fits(size) {
                    if state.queue.drop_oldest().is_none() {
                        break;
                    }
                    evicted += 1;
                }
                if evicted > 0 {
                    self.dropped.add(evicted);
                    warn!(
                        "Dropped {} queued message(s) to {:?} to admit a newer one",
                        evicted, self.destination
                    );
                }
                state.queue.enqueue(message, size)?;
            }
        }

        state.queuing = true;
        self.queuings.inc();
        trace!(
            "Queued {} bytes for {:?} ({} messages, {} bytes held)",
            size,
            self.destination,
            state.queue.len(),
            state.queue.queued_bytes()
        );
        Ok(())
    }

    /// Stamp and return the current deficit if the throttle allows
    /// another credit request.
    ///
    /// Runs on every send that takes the queue path, including sends the
    /// overflow policy rejected: a full queue is still starved for credit.
    fn due_credit_request(&self, state: &mut ControllerState<M>) -> Option<u64> {
        let due = match state.last_credit_request {
            None => true,
            Some(at) => at.elapsed() >= self.config.min_credit_request_interval,
        };
        if !due {
            return None;
        }
        state.last_credit_request = Some(Instant::now());
        Some(state.credit.deficit())
    }
}

/// Point-in-time view of one destination's flow-control state.
#[derive(Debug, Clone)]
pub struct DestinationStats {
    /// Bytes that may still be sent before queuing starts.
    pub remaining_credit: u64,
    /// Messages currently held in the pending queue.
    pub queued_messages: usize,
    /// Bytes currently held in the pending queue.
    pub queued_bytes: u64,
    /// True while at least one message is held awaiting credit.
    pub is_queuing: bool,
    /// Times a message was queued due to insufficient credit.
    pub queuings: u64,
    /// Messages evicted by the drop-oldest overflow policy.
    pub dropped_messages: u64,
    /// Credit requests emitted toward the destination.
    pub credit_requests_sent: u64,
}
