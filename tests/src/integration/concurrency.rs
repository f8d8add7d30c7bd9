//! # Concurrency Flows
//!
//! Unrelated subsystems publishing from their own threads while consumers
//! come and go.

#[cfg(test)]
mod tests {
    use crate::fixtures::DeployOutcome;
    use keel_bus::{consumer, named, BusRegistry, ConsumerRef, MessageBus};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    const PUBLISHERS: u32 = 6;
    const PER_PUBLISHER: u32 = 400;

    fn outcome(publisher: u32, seq: u32) -> DeployOutcome {
        DeployOutcome {
            pipeline: format!("p{publisher}"),
            stage: seq,
            failed: seq % 7 == 0,
        }
    }

    fn recorder() -> (ConsumerRef<DeployOutcome>, Arc<Mutex<Vec<DeployOutcome>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let c = consumer(move |o: &DeployOutcome| {
            s.lock().push(o.clone());
            Ok(())
        });
        (c, seen)
    }

    fn assert_exactly_once_in_order(seen: &[DeployOutcome]) {
        assert_eq!(seen.len(), (PUBLISHERS * PER_PUBLISHER) as usize);
        let mut per_publisher: HashMap<&str, Vec<u32>> = HashMap::new();
        for o in seen {
            per_publisher
                .entry(o.pipeline.as_str())
                .or_default()
                .push(o.stage);
        }
        assert_eq!(per_publisher.len(), PUBLISHERS as usize);
        for stages in per_publisher.values() {
            let expected: Vec<u32> = (0..PER_PUBLISHER).collect();
            assert_eq!(stages, &expected);
        }
    }

    #[test]
    fn test_publishers_with_failing_subscriber() {
        let registry = BusRegistry::default();
        let capacity = (PUBLISHERS * PER_PUBLISHER) as usize;
        let bus = registry
            .create_persistent::<DeployOutcome>("deploys", Some(capacity))
            .unwrap();

        let (first, first_seen) = recorder();
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let calls = flaky_calls.clone();
        let flaky = named("flaky", move |o: &DeployOutcome| {
            calls.fetch_add(1, Ordering::SeqCst);
            if o.failed {
                anyhow::bail!("cannot handle failed stage {}", o.stage);
            }
            Ok(())
        });
        let (last, last_seen) = recorder();
        bus.subscribe(&first);
        bus.subscribe(&flaky);
        bus.subscribe(&last);

        thread::scope(|scope| {
            for publisher in 0..PUBLISHERS {
                let bus = bus.clone();
                scope.spawn(move || {
                    for seq in 0..PER_PUBLISHER {
                        bus.accept(outcome(publisher, seq));
                    }
                });
            }
        });

        assert_exactly_once_in_order(&first_seen.lock());
        assert_exactly_once_in_order(&last_seen.lock());
        assert_eq!(flaky_calls.load(Ordering::SeqCst), capacity);
        assert_exactly_once_in_order(&bus.history());
    }

    #[test]
    fn test_churning_subscribers_do_not_disturb_stable_one() {
        let bus = MessageBus::<DeployOutcome>::new("deploys", Default::default());
        let (stable, stable_seen) = recorder();
        bus.subscribe(&stable);

        thread::scope(|scope| {
            for publisher in 0..PUBLISHERS {
                let bus = bus.clone();
                scope.spawn(move || {
                    for seq in 0..PER_PUBLISHER {
                        bus.accept(outcome(publisher, seq));
                    }
                });
            }
            for _ in 0..3 {
                let bus = bus.clone();
                scope.spawn(move || {
                    for _ in 0..300 {
                        let (transient, _) = recorder();
                        let direct = transient.clone();
                        bus.subscribe(&direct);
                        let scoped = bus.open_subscription(transient);
                        bus.unsubscribe(&direct);
                        drop(scoped);
                    }
                });
            }
        });

        assert_exactly_once_in_order(&stable_seen.lock());
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_concurrent_creation_yields_one_bus() {
        let registry = BusRegistry::default();
        let delivered = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..8 {
                let registry = &registry;
                let delivered = delivered.clone();
                scope.spawn(move || {
                    let bus = registry.create_bus::<DeployOutcome>("deploys").unwrap();
                    bus.subscribe(&consumer(move |_: &DeployOutcome| {
                        delivered.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }));
                });
            }
        });

        assert_eq!(registry.len(), 1);
        let bus = registry.create_bus::<DeployOutcome>("deploys").unwrap();
        assert_eq!(bus.subscriber_count(), 8);
        bus.accept(outcome(0, 1));
        assert_eq!(delivered.load(Ordering::SeqCst), 8);
    }
}
