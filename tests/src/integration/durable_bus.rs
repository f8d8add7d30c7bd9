//! # Durable Bus Flows
//!
//! Persistent buses journaled to a shared KV store survive a registry
//! restart with their retained history.

#[cfg(test)]
mod tests {
    use crate::fixtures::{DeployOutcome, NodeHealth};
    use keel_bus::{consumer, BusConfig, BusRegistry, FanInAggregator, PersistentBus};
    use keel_kv::{InMemoryKvStore, KeyValueStore};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn outcome(stage: u32, failed: bool) -> DeployOutcome {
        DeployOutcome {
            pipeline: "web".into(),
            stage,
            failed,
        }
    }

    fn registry(store: &Arc<InMemoryKvStore>, capacity: usize) -> BusRegistry {
        let config = BusConfig::default().with_history_capacity(capacity);
        BusRegistry::new(config).with_store(store.clone())
    }

    fn durable_deploys(registry: &BusRegistry) -> PersistentBus<DeployOutcome> {
        registry.create_durable("deploys", None).unwrap()
    }

    #[test]
    fn test_history_survives_restart() {
        let store = Arc::new(InMemoryKvStore::new());
        {
            let first = registry(&store, 4);
            let deploys = durable_deploys(&first);
            for stage in 0..10 {
                deploys.accept(outcome(stage, false));
            }
            first.close();
        }

        assert_eq!(store.list("keel/bus/deploys").unwrap().len(), 4);

        let second = registry(&store, 4);
        let deploys = durable_deploys(&second);
        let stages: Vec<u32> = deploys.history().iter().map(|o| o.stage).collect();
        assert_eq!(stages, vec![6, 7, 8, 9]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let view = second.subscriptions::<DeployOutcome>("deploys").unwrap();
        view.subscribe_with_history(
            &consumer(move |o: &DeployOutcome| {
                s.lock().push(o.stage);
                Ok(())
            }),
            2,
        );
        deploys.accept(outcome(10, true));
        assert_eq!(*seen.lock(), vec![8, 9, 10]);
    }

    #[test]
    fn test_aggregate_bus_is_durable_with_store() {
        let store = Arc::new(InMemoryKvStore::new());
        {
            let first = registry(&store, 16);
            let nodes = first.create_bus::<NodeHealth>("nodes").unwrap();
            let aggregator = FanInAggregator::start(&first).unwrap();
            nodes.accept(NodeHealth::new("n1", "ERROR", "down"));
            nodes.accept(NodeHealth::new("n1", "INFO", "up"));
            aggregator.close();
        }

        let second = registry(&store, 16);
        let aggregator = FanInAggregator::start(&second).unwrap();
        let history = aggregator.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["detail"], "down");
        assert!(aggregator.sources().is_empty());
    }

    #[test]
    fn test_partition_does_not_block_delivery() {
        let store = Arc::new(InMemoryKvStore::new());
        let registry = registry(&store, 8);
        let deploys = durable_deploys(&registry);

        let delivered = Arc::new(Mutex::new(0usize));
        let d = delivered.clone();
        deploys.subscribe(&consumer(move |_: &DeployOutcome| {
            *d.lock() += 1;
            Ok(())
        }));

        store.set_available(false);
        deploys.accept(outcome(1, true));
        deploys.accept(outcome(2, true));
        store.set_available(true);
        deploys.accept(outcome(3, false));

        assert_eq!(*delivered.lock(), 3);
        assert_eq!(deploys.len(), 3);
        // Only the write made while the store was reachable is journaled.
        let journaled = store.list("keel/bus/deploys").unwrap();
        assert_eq!(journaled.len(), 1);
        assert_eq!(
            journaled[0].key,
            "keel/bus/deploys/00000000000000000002"
        );
    }
}
