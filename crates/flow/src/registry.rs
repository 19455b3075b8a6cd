//! Destination-to-controller mapping and the aggregate stats surface.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::controller::{DestinationStats, FlowController};
use crate::{DownstreamSender, FlowControlConfig, MessageSize, Result, SendOutcome};

/// Flow-control state for a whole group of destinations.
///
/// Controllers are created lazily on the first send to a destination and
/// discarded when the membership layer reports the destination gone.
/// Lookups and lifecycle changes go through a concurrent map, so senders
/// to different destinations never contend with each other.
pub struct FlowRegistry<D, M> {
    config: FlowControlConfig,
    sender: Arc<dyn DownstreamSender<D, M>>,
    controllers: DashMap<D, Arc<FlowController<D, M>>>,
}

impl<D, M> FlowRegistry<D, M>
where
    D: Clone + Eq + Hash + fmt::Debug,
    M: MessageSize,
{
    /// Create a registry with no tracked destinations.
    pub fn new(
        config: FlowControlConfig,
        sender: Arc<dyn DownstreamSender<D, M>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sender,
            controllers: DashMap::new(),
        })
    }

    /// Controller for `destination`, created on first use.
    ///
    /// Concurrent first accesses for the same destination agree on a
    /// single controller.
    pub fn resolve(&self, destination: &D) -> Arc<FlowController<D, M>> {
        self.controllers
            .entry(destination.clone())
            .or_insert_with(|| {
                trace!("Tracking flow control for new destination {:?}", destination);
                Arc::new(FlowController::new(
                    destination.clone(),
                    self.config.clone(),
                    Arc::clone(&self.sender),
                ))
            })
            .clone()
    }

    /// Submit a message for `destination`, forwarding or queuing it.
    pub fn send(&self, destination: &D, message: M) -> Result<SendOutcome> {
        self.resolve(destination).send(message)
    }

    /// Apply a credit grant reported by `destination`.
    ///
    /// Unknown destinations are ignored: duplicate or late grants for a
    /// departed peer are expected network noise, not errors.
    pub fn on_replenish(&self, destination: &D, amount: u64) {
        // Clone out of the map so no shard lock is held while draining.
        let controller = self
            .controllers
            .get(destination)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(controller) = controller {
            controller.replenish(amount);
        }
    }

    /// Drop all flow-control state for a departed destination.
    ///
    /// Messages still queued for it are discarded; the destination is no
    /// longer reachable, so delivery is moot. Unknown destinations are
    /// ignored.
    pub fn on_destination_removed(&self, destination: &D) {
        if let Some((_, controller)) = self.controllers.remove(destination) {
            let queued = controller.queued_messages();
            if queued > 0 {
                debug!(
                    "Discarding {} queued message(s) for departed destination {:?}",
                    queued, destination
                );
            }
        }
    }

    /// True if messages are currently held for `destination`.
    pub fn is_queuing_to(&self, destination: &D) -> bool {
        self.controllers
            .get(destination)
            .map(|controller| controller.is_queuing())
            .unwrap_or(false)
    }

    /// Messages currently held for `destination`.
    pub fn queued_messages_to(&self, destination: &D) -> usize {
        self.controllers
            .get(destination)
            .map(|controller| controller.queued_messages())
            .unwrap_or(0)
    }

    /// Point-in-time view of one destination, if tracked.
    pub fn destination_stats(&self, destination: &D) -> Option<DestinationStats> {
        self.controllers
            .get(destination)
            .map(|controller| controller.stats())
    }

    /// Number of destinations currently tracked.
    pub fn destinations(&self) -> usize {
        self.controllers.len()
    }

    /// Messages currently held across all destinations.
    pub fn queued_messages(&self) -> usize {
        self.controllers
            .iter()
            .map(|controller| controller.queued_messages())
            .sum()
    }

    /// Bytes currently held across all destinations.
    pub fn queued_bytes(&self) -> u64 {
        self.controllers
            .iter()
            .map(|controller| controller.queued_bytes())
            .sum()
    }

    /// Times any message was queued due to insufficient credit.
    pub fn queuings(&self) -> u64 {
        self.controllers
            .iter()
            .map(|controller| controller.stats().queuings)
            .sum()
    }

    /// Point-in-time aggregate across all destinations.
    ///
    /// The snapshot tolerates concurrent sends and membership changes; it
    /// is a monitoring view, not authoritative state.
    pub fn stats(&self) -> FlowControlStats {
        let mut stats = FlowControlStats::default();
        for controller in self.controllers.iter() {
            let per_dest = controller.stats();
            stats.destinations += 1;
            stats.queued_messages += per_dest.queued_messages;
            stats.queued_bytes += per_dest.queued_bytes;
            stats.queuings += per_dest.queuings;
            stats.dropped_messages += per_dest.dropped_messages;
            stats.credit_requests_sent += per_dest.credit_requests_sent;
        }
        stats
    }

    /// Reset the monotonic counters on every tracked destination.
    pub fn reset_stats(&self) {
        for controller in self.controllers.iter() {
            controller.reset_stats();
        }
    }
}

/// Aggregate statistics across all tracked destinations.
#[derive(Debug, Clone, Default)]
pub struct FlowControlStats {
    /// Destinations currently tracked.
    pub destinations: usize,
    /// Messages currently held across all pending queues.
    pub queued_messages: usize,
    /// Bytes currently held across all pending queues.
    pub queued_bytes: u64,
    /// Times any message was queued due to insufficient credit.
    pub queuings: u64,
    /// Messages evicted by the drop-oldest overflow policy.
    pub dropped_messages: u64,
    /// Credit requests emitted across all destinations.
    pub credit_requests_sent: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FlowControlError, OverflowPolicy};
    use parking_lot::Mutex;

    struct RecordingSender {
        forwarded: Mutex<Vec<(u32, Vec<u8>)>>,
        credit_requests: Mutex<Vec<(u32, u64)>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                forwarded: Mutex::new(Vec::new()),
                credit_requests: Mutex::new(Vec::new()),
            })
        }

        fn forwarded(&self) -> Vec<(u32, Vec<u8>)> {
            self.forwarded.lock().clone()
        }
    }

    impl DownstreamSender<u32, Vec<u8>> for RecordingSender {
        fn forward(&self, destination: &u32, message: Vec<u8>) {
            self.forwarded.lock().push((*destination, message));
        }

        fn request_credit(&self, destination: &u32, amount: u64) {
            self.credit_requests.lock().push((*destination, amount));
        }
    }

    fn make_registry(
        config: FlowControlConfig,
    ) -> (Arc<RecordingSender>, FlowRegistry<u32, Vec<u8>>) {
        let sender = RecordingSender::new();
        let registry = FlowRegistry::new(config, sender.clone()).unwrap();
        (sender, registry)
    }

    fn config(max_credits: u64, max_queue_size: u64) -> FlowControlConfig {
        FlowControlConfig {
            max_credits,
            max_queue_size,
            ..Default::default()
        }
    }

    fn msg(n: usize) -> Vec<u8> {
        vec![0u8; n]
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sender = RecordingSender::new();
        let result: Result<FlowRegistry<u32, Vec<u8>>> =
            FlowRegistry::new(config(0, 100), sender);
        assert!(matches!(result, Err(FlowControlError::InvalidConfig(_))));
    }

    #[test]
    fn test_resolve_creates_exactly_one_controller() {
        let (_, registry) = make_registry(config(100, 1_000));

        let first = registry.resolve(&1);
        let second = registry.resolve(&1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.destinations(), 1);

        registry.resolve(&2);
        assert_eq!(registry.destinations(), 2);
    }

    #[test]
    fn test_destinations_have_independent_budgets() {
        let (sender, registry) = make_registry(config(100, 1_000));

        assert_eq!(registry.send(&1, msg(80)).unwrap(), SendOutcome::Sent);
        assert_eq!(registry.send(&1, msg(80)).unwrap(), SendOutcome::Queued);

        // Destination 2 is unaffected by destination 1's exhaustion.
        assert_eq!(registry.send(&2, msg(80)).unwrap(), SendOutcome::Sent);

        assert!(registry.is_queuing_to(&1));
        assert!(!registry.is_queuing_to(&2));
        assert_eq!(sender.forwarded().len(), 2);
    }

    #[test]
    fn test_replenish_unknown_destination_is_noop() {
        let (_, registry) = make_registry(config(100, 1_000));

        registry.on_replenish(&9, 1_000);

        // No controller is conjured up for an unknown destination.
        assert_eq!(registry.destinations(), 0);
    }

    #[test]
    fn test_remove_unknown_destination_is_noop() {
        let (_, registry) = make_registry(config(100, 1_000));
        registry.on_destination_removed(&9);
        assert_eq!(registry.destinations(), 0);
    }

    #[test]
    fn test_removed_destination_starts_fresh() {
        let (sender, registry) = make_registry(config(100, 1_000));

        registry.send(&1, msg(100)).unwrap();
        registry.send(&1, msg(40)).unwrap();
        registry.send(&1, msg(40)).unwrap();
        assert_eq!(registry.queued_messages_to(&1), 2);

        registry.on_destination_removed(&1);
        assert_eq!(registry.destinations(), 0);

        // A later resolve creates a fresh controller with full credit and
        // an empty queue; the old queue is not resurrected.
        assert_eq!(registry.send(&1, msg(100)).unwrap(), SendOutcome::Sent);
        assert_eq!(registry.queued_messages_to(&1), 0);
        assert!(!registry.is_queuing_to(&1));

        // The two discarded messages were never forwarded.
        let sizes: Vec<usize> = sender.forwarded().iter().map(|(_, m)| m.len()).collect();
        assert_eq!(sizes, vec![100, 100]);
    }

    #[test]
    fn test_replenish_after_removal_does_not_resurrect() {
        let (sender, registry) = make_registry(config(100, 1_000));

        registry.send(&1, msg(100)).unwrap();
        registry.send(&1, msg(40)).unwrap();
        registry.on_destination_removed(&1);

        registry.on_replenish(&1, 1_000);

        assert_eq!(registry.destinations(), 0);
        assert_eq!(sender.forwarded().len(), 1);
    }

    #[test]
    fn test_aggregate_stats_span_destinations() {
        let (_, registry) = make_registry(config(50, 1_000));

        registry.send(&1, msg(50)).unwrap();
        registry.send(&1, msg(30)).unwrap();
        registry.send(&2, msg(50)).unwrap();
        registry.send(&2, msg(20)).unwrap();
        registry.send(&2, msg(10)).unwrap();

        assert_eq!(registry.queued_messages(), 3);
        assert_eq!(registry.queued_bytes(), 60);
        assert_eq!(registry.queuings(), 3);

        let stats = registry.stats();
        assert_eq!(stats.destinations, 2);
        assert_eq!(stats.queued_messages, 3);
        assert_eq!(stats.queued_bytes, 60);
        assert_eq!(stats.queuings, 3);

        let dest_stats = registry.destination_stats(&2).unwrap();
        assert_eq!(dest_stats.queued_messages, 2);
        assert_eq!(dest_stats.queued_bytes, 30);
        assert!(registry.destination_stats(&9).is_none());
    }

    #[test]
    fn test_reset_stats_spans_destinations() {
        let (_, registry) = make_registry(config(50, 1_000));

        registry.send(&1, msg(60)).unwrap();
        registry.send(&2, msg(60)).unwrap();
        assert_eq!(registry.stats().queuings, 2);

        registry.reset_stats();
        assert_eq!(registry.stats().queuings, 0);

        // Held messages are live state, not counters.
        assert_eq!(registry.queued_messages(), 2);
    }

    #[test]
    fn test_bytes_conserved_and_fifo_under_replenishment() {
        let (sender, registry) = make_registry(config(100, 10_000));

        let sizes = [40usize, 70, 30, 90, 10, 60];
        for size in sizes {
            registry.send(&1, (0..size).map(|b| b as u8).collect()).unwrap();
            registry.on_replenish(&1, 30);
        }
        // Top the credit up until everything has drained.
        while registry.is_queuing_to(&1) {
            registry.on_replenish(&1, 50);
        }

        let forwarded = sender.forwarded();
        let forwarded_sizes: Vec<usize> = forwarded.iter().map(|(_, m)| m.len()).collect();
        assert_eq!(forwarded_sizes, sizes.to_vec());

        // Every submitted byte came out, unchanged and in order.
        let total: usize = forwarded.iter().map(|(_, m)| m.len()).sum();
        assert_eq!(total, sizes.iter().sum::<usize>());
        for (_, message) in &forwarded {
            for (offset, byte) in message.iter().enumerate() {
                assert_eq!(*byte, offset as u8);
            }
        }
    }

    #[test]
    fn test_concurrent_senders_to_disjoint_destinations() {
        let (sender, registry) = make_registry(config(1_000, 10_000));

        std::thread::scope(|s| {
            for dest in 0u32..4 {
                let registry = &registry;
                s.spawn(move || {
                    for _ in 0..25 {
                        registry.send(&dest, msg(10)).unwrap();
                    }
                });
            }
        });

        // 250 bytes per destination fit each 1000-byte budget, so every
        // message was forwarded immediately.
        assert_eq!(sender.forwarded().len(), 100);
        assert_eq!(registry.queued_messages(), 0);
        for dest in 0u32..4 {
            assert_eq!(
                registry.destination_stats(&dest).unwrap().remaining_credit,
                750
            );
        }
    }

    #[test]
    fn test_overflow_policy_applies_per_destination() {
        for policy in [OverflowPolicy::RejectNew, OverflowPolicy::DropOldest] {
            let mut cfg = config(10, 100);
            cfg.overflow_policy = policy;
            let (_, registry) = make_registry(cfg);

            for _ in 0..5 {
                registry.send(&1, msg(20)).unwrap();
            }
            let result = registry.send(&1, msg(20));

            match policy {
                OverflowPolicy::RejectNew => {
                    assert!(result.is_err());
                    assert_eq!(registry.queued_bytes(), 100);
                }
                OverflowPolicy::DropOldest => {
                    assert_eq!(result.unwrap(), SendOutcome::Queued);
                    assert_eq!(registry.queued_bytes(), 100);
                    assert_eq!(registry.stats().dropped_messages, 1);
                }
            }
        }
    }
}
