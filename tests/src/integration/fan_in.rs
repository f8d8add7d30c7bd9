//! # Fan-In Aggregation Flows
//!
//! Independent subsystems create their own buses on a shared registry; the
//! aggregator started afterwards republishes WARNING and ERROR messages onto
//! `bus.errors`.

#[cfg(test)]
mod tests {
    use crate::fixtures::{init_test_logging, DeployOutcome, ImageEvent, NodeHealth};
    use keel_bus::{
        consumer, BusRegistry, ExceptionInfo, ExceptionSink, FanInAggregator, Severity,
        SeverityEvent,
    };
    use parking_lot::Mutex;
    use std::sync::Arc;

    // =============================================================================
    // TEST FIXTURES
    // =============================================================================

    fn capturing_registry() -> (BusRegistry, Arc<Mutex<Vec<ExceptionInfo>>>) {
        init_test_logging();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink_reports = reports.clone();
        let sink = ExceptionSink::new(move |info| sink_reports.lock().push(info.clone()));
        let registry = BusRegistry::default().with_default_sink(sink);
        (registry, reports)
    }

    // =============================================================================
    // AGGREGATION
    // =============================================================================

    #[test]
    fn test_aggregates_across_subsystems() {
        let registry = BusRegistry::default();
        let nodes = registry.create_bus::<NodeHealth>("nodes").unwrap();
        let images = registry.create_bus::<ImageEvent>("images").unwrap();
        let deploys = registry
            .create_persistent::<DeployOutcome>("deploys", Some(64))
            .unwrap();

        let aggregator = FanInAggregator::start(&registry).unwrap();
        assert_eq!(aggregator.sources().len(), 3);

        nodes.accept(NodeHealth::new("n1", "INFO", "heartbeat"));
        nodes.accept(NodeHealth::new("n2", "warning", "disk 91%"));
        images.accept(ImageEvent {
            image: "nginx:1.27".into(),
            action: "pulled".into(),
        });
        deploys.accept(DeployOutcome {
            pipeline: "web".into(),
            stage: 1,
            failed: false,
        });
        deploys.accept(DeployOutcome {
            pipeline: "web".into(),
            stage: 2,
            failed: true,
        });
        nodes.accept(NodeHealth::new("n3", "FATAL", "unknown level is dropped"));

        let history = aggregator.history();
        let summary: Vec<(&str, Severity)> = history
            .iter()
            .map(|e| (e.source.as_str(), e.severity))
            .collect();
        assert_eq!(
            summary,
            vec![("nodes", Severity::Warning), ("deploys", Severity::Error)]
        );
        assert_eq!(history[0].payload["node"], "n2");
        assert_eq!(history[1].payload["stage"], 2);
        assert!(history[1].message_type.ends_with("DeployOutcome"));
    }

    #[test]
    fn test_close_stops_forwarding_and_releases_sources() {
        let registry = BusRegistry::default();
        let nodes = registry.create_bus::<NodeHealth>("nodes").unwrap();
        let deploys = registry.create_bus::<DeployOutcome>("deploys").unwrap();
        let aggregator = FanInAggregator::start(&registry).unwrap();

        nodes.accept(NodeHealth::new("n1", "ERROR", "down"));
        assert_eq!(aggregator.history().len(), 1);

        assert_eq!(aggregator.close(), 2);
        assert_eq!(nodes.subscriber_count(), 0);
        assert_eq!(deploys.subscriber_count(), 0);

        nodes.accept(NodeHealth::new("n1", "ERROR", "still down"));
        assert_eq!(aggregator.history().len(), 1);
        assert_eq!(aggregator.close(), 0);
    }

    #[test]
    fn test_downstream_failure_is_isolated() {
        let (registry, reports) = capturing_registry();
        let nodes = registry.create_bus::<NodeHealth>("nodes").unwrap();
        let aggregator = FanInAggregator::start(&registry).unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let local = nodes.clone();
        nodes.subscribe(&consumer(move |_: &NodeHealth| {
            *counter.lock() += 1;
            Ok(())
        }));
        let pager = consumer(|_: &SeverityEvent| anyhow::bail!("pager offline"));
        aggregator.subscriptions().subscribe(&pager);

        local.accept(NodeHealth::new("n1", "ERROR", "down"));
        local.accept(NodeHealth::new("n2", "ERROR", "down"));

        assert_eq!(*seen.lock(), 2);
        assert_eq!(aggregator.history().len(), 2);

        let reports = reports.lock();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.bus_id == "bus.errors"));
        assert_eq!(reports[0].message["source"], "nodes");
    }

    #[test]
    fn test_late_subscriber_replays_aggregate_history() {
        let registry = BusRegistry::default();
        let nodes = registry.create_bus::<NodeHealth>("nodes").unwrap();
        let aggregator = FanInAggregator::start(&registry).unwrap();

        for i in 0..5 {
            nodes.accept(NodeHealth::new(&format!("n{i}"), "WARNING", "slow"));
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let view = aggregator.subscriptions();
        let _handle = view.open_subscription_with_history(
            consumer(move |e: &SeverityEvent| {
                let node = e.payload["node"].as_str().unwrap_or_default();
                s.lock().push(node.to_string());
                Ok(())
            }),
            2,
        );
        nodes.accept(NodeHealth::new("n5", "ERROR", "down"));

        assert_eq!(*seen.lock(), vec!["n3", "n4", "n5"]);
    }
}
