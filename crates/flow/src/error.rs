//! Error types for flow-control operations.

use thiserror::Error;

/// Errors that can occur while submitting messages to the flow-control layer.
///
/// Backpressure is the only runtime failure: `send` never blocks, so a
/// pending queue that cannot hold a message surfaces synchronously as
/// [`FlowControlError::CapacityExceeded`].
#[derive(Debug, Error)]
pub enum FlowControlError {
    /// The destination's pending queue cannot hold the message.
    ///
    /// The message was not appended and nothing else changed; the caller
    /// may retry after credit is replenished and the queue drains.
    #[error(
        "pending queue full: {queued_bytes} of {max_queue_size} bytes held, \
         message of {message_size} bytes rejected"
    )]
    CapacityExceeded {
        /// Size of the rejected message.
        message_size: u64,
        /// Bytes held in the queue at rejection time.
        queued_bytes: u64,
        /// Configured byte budget for the queue.
        max_queue_size: u64,
    },

    /// Configuration rejected at construction.
    #[error("invalid flow-control configuration: {0}")]
    InvalidConfig(String),
}

impl FlowControlError {
    /// Returns true if the operation could succeed on retry.
    ///
    /// Queue overflow clears once the destination grants credit and the
    /// queue drains; configuration errors do not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, FlowControlError::CapacityExceeded { .. })
    }
}
