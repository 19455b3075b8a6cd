//! Per-destination, non-blocking, credit-based flow control for message
//! transports.
//!
//! This crate keeps a fast sender from overrunning a slow receiver without
//! ever blocking the sending thread. Each destination is allotted a credit
//! budget in bytes; sending consumes credit, and when the budget runs out
//! outgoing messages are queued locally (bounded by a byte budget) instead
//! of stalling the caller. Queued messages are released automatically once
//! the receiver replenishes credit.
//!
//! # Architecture
//!
//! The crate is organized around these components:
//!
//! - [`FlowRegistry`] - Maps each destination to its controller, creating
//!   controllers on first use and discarding them when a destination
//!   departs; aggregates the stats surface
//! - [`FlowController`] - Per-destination decide/queue/drain state machine
//! - [`CreditCounter`] - Remaining credit for one destination
//! - [`PendingQueue`] - FIFO byte-budgeted buffer of unsent messages
//! - [`DownstreamSender`] - The transport hooks this layer calls into,
//!   always with no internal lock held
//!
//! # Protocol Overview
//!
//! 1. A caller submits `(destination, message)` via [`FlowRegistry::send`]
//! 2. If the destination has enough credit, the message is forwarded to the
//!    [`DownstreamSender`] immediately and the credit is consumed
//! 3. Otherwise the message is queued and a credit request (throttled by
//!    [`FlowControlConfig::min_credit_request_interval`]) asks the
//!    destination for its current deficit
//! 4. When the destination grants credit, [`FlowRegistry::on_replenish`]
//!    drains queued messages, in order, as far as the new credit allows
//!
//! `send` never blocks and never performs I/O under a lock. The only form
//! of backpressure a caller observes is
//! [`FlowControlError::CapacityExceeded`] when a destination's queue is
//! full; see [`OverflowPolicy`] for the available policies.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice_flow::{DownstreamSender, FlowControlConfig, FlowRegistry, SendOutcome};
//!
//! struct Transport;
//!
//! impl DownstreamSender<String, Vec<u8>> for Transport {
//!     fn forward(&self, destination: &String, message: Vec<u8>) {
//!         println!("-> {destination}: {} bytes", message.len());
//!     }
//!
//!     fn request_credit(&self, destination: &String, amount: u64) {
//!         println!("asking {destination} for {amount} bytes of credit");
//!     }
//! }
//!
//! # fn main() -> sluice_flow::Result<()> {
//! let registry: FlowRegistry<String, Vec<u8>> =
//!     FlowRegistry::new(FlowControlConfig::default(), Arc::new(Transport))?;
//! let dest = "node-b".to_string();
//!
//! // Plenty of credit: forwarded immediately.
//! assert_eq!(registry.send(&dest, vec![0u8; 1024])?, SendOutcome::Sent);
//!
//! // The peer grants credit back as it consumes data.
//! registry.on_replenish(&dest, 1024);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

mod controller;
mod credit;
mod error;
mod metrics;
mod queue;
mod registry;

pub use controller::{DestinationStats, FlowController};
pub use credit::CreditCounter;
pub use error::FlowControlError;
pub use queue::PendingQueue;
pub use registry::{FlowControlStats, FlowRegistry};

/// Result type for flow-control operations.
pub type Result<T> = std::result::Result<T, FlowControlError>;

/// Size, in bytes, charged against a destination's credit budget.
///
/// The flow-control layer is agnostic to framing and serialization; it
/// only needs to know how many bytes a message costs to send.
pub trait MessageSize {
    /// Number of bytes this message costs to send.
    fn size_in_bytes(&self) -> u64;
}

impl MessageSize for Vec<u8> {
    fn size_in_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl MessageSize for Box<[u8]> {
    fn size_in_bytes(&self) -> u64 {
        self.len() as u64
    }
}

/// Downstream transport hooks invoked by the flow-control layer.
///
/// Both methods are always called with no controller lock held, so an
/// implementation may be slow or may re-enter the flow-control layer
/// without stalling unrelated senders or deadlocking.
pub trait DownstreamSender<D, M>: Send + Sync {
    /// Forward a message that flow control has cleared for sending.
    fn forward(&self, destination: &D, message: M);

    /// Ask `destination` to grant more credit.
    ///
    /// `amount` is the destination's current credit deficit.
    fn request_credit(&self, destination: &D, amount: u64);
}

/// What [`FlowController::send`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Credit was available; the message went straight downstream.
    Sent,
    /// The message is held in the pending queue awaiting credit.
    Queued,
}

/// Policy applied when a message does not fit the destination's pending
/// queue.
///
/// The caller is never blocked; the policy decides which message pays for
/// the shortfall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Reject the new message with
    /// [`FlowControlError::CapacityExceeded`]. The error is synchronous
    /// and retriable and nothing is silently dropped, so upper layers keep
    /// their delivery expectations.
    #[default]
    RejectNew,

    /// Evict queued messages, oldest first, until the new message fits.
    /// Evictions are logged and counted in the drop statistics. A message
    /// larger than the whole queue budget is still rejected.
    DropOldest,
}

/// Configuration for the flow-control layer.
///
/// One copy is shared by every destination's controller.
#[derive(Debug, Clone)]
pub struct FlowControlConfig {
    /// Per-destination credit ceiling in bytes.
    ///
    /// A destination starts with this much credit and replenishment never
    /// raises the counter above it. Note that a message larger than the
    /// ceiling can never be forwarded once credit runs short.
    pub max_credits: u64,

    /// Per-destination byte budget for queued messages.
    ///
    /// When a destination has no credit left and its queue already holds
    /// this many bytes, the [`OverflowPolicy`] applies.
    pub max_queue_size: u64,

    /// Minimum gap between credit requests to the same destination.
    ///
    /// Every send that ends up queuing wants fresh credit; this throttle
    /// keeps a burst of queued sends from flooding the peer with requests.
    pub min_credit_request_interval: Duration,

    /// What to do with a message that does not fit the pending queue.
    pub overflow_policy: OverflowPolicy,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            max_credits: 500_000,
            max_queue_size: 10_000_000,
            min_credit_request_interval: Duration::from_millis(500),
            overflow_policy: OverflowPolicy::RejectNew,
        }
    }
}

impl FlowControlConfig {
    /// Check the configured budgets.
    ///
    /// A zero credit ceiling could never forward anything and a zero queue
    /// budget could never hold anything, so both are rejected up front.
    pub fn validate(&self) -> Result<()> {
        if self.max_credits == 0 {
            return Err(FlowControlError::InvalidConfig(
                "max_credits must be greater than zero".to_string(),
            ));
        }
        if self.max_queue_size == 0 {
            return Err(FlowControlError::InvalidConfig(
                "max_queue_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FlowControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_credits, 500_000);
        assert_eq!(config.max_queue_size, 10_000_000);
        assert_eq!(config.min_credit_request_interval, Duration::from_millis(500));
        assert_eq!(config.overflow_policy, OverflowPolicy::RejectNew);
    }

    #[test]
    fn test_zero_budgets_rejected() {
        let config = FlowControlConfig {
            max_credits: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowControlError::InvalidConfig(_))
        ));

        let config = FlowControlConfig {
            max_queue_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(FlowControlError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_message_size_impls() {
        assert_eq!(vec![0u8; 16].size_in_bytes(), 16);
        let boxed: Box<[u8]> = vec![0u8; 8].into_boxed_slice();
        assert_eq!(boxed.size_in_bytes(), 8);
    }
}
