//! # Object Mapping Flows
//!
//! Pipeline definitions saved and loaded through the KV store, including
//! edits made by other manager instances.

#[cfg(test)]
mod tests {
    use crate::fixtures::{sample_pipeline, EnvVar, Pipeline};
    use keel_kv::{InMemoryKvStore, KeyValueStore, KvConfig, MapperError, ObjectMapper};
    use rand::seq::SliceRandom;
    use std::sync::Arc;

    fn pipelines(store: &Arc<InMemoryKvStore>) -> ObjectMapper<Pipeline> {
        ObjectMapper::new(store.clone(), KvConfig::default().namespace("pipelines")).unwrap()
    }

    fn key_count(store: &Arc<InMemoryKvStore>, prefix: &str) -> usize {
        store.list(prefix).unwrap().len()
    }

    // =============================================================================
    // ROUND TRIP
    // =============================================================================

    #[test]
    fn test_full_graph_round_trip() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        let pipeline = sample_pipeline("web");

        mapper.save("web", &pipeline).unwrap();
        assert_eq!(mapper.load("web").unwrap(), Some(pipeline));
        assert_eq!(mapper.load("never-saved").unwrap(), None);
    }

    #[test]
    fn test_second_instance_sees_saved_graph() {
        let store = Arc::new(InMemoryKvStore::new());
        let writer = pipelines(&store);
        writer.save("web", &sample_pipeline("web")).unwrap();

        let other_instance = pipelines(&store);
        assert_eq!(other_instance.list().unwrap(), vec!["web".to_string()]);
        let loaded = other_instance.load("web").unwrap();
        assert_eq!(loaded, Some(sample_pipeline("web")));
    }

    #[test]
    fn test_shuffled_stages_keep_their_order() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        let mut pipeline = sample_pipeline("web");
        for i in 0..12 {
            let mut stage = pipeline.stages[0].clone();
            stage.name = format!("extra-{i}");
            pipeline.stages.push(stage);
        }
        pipeline.stages.shuffle(&mut rand::thread_rng());

        mapper.save("web", &pipeline).unwrap();
        assert_eq!(mapper.load("web").unwrap().unwrap().stages, pipeline.stages);
    }

    // =============================================================================
    // EDITS
    // =============================================================================

    #[test]
    fn test_removing_middle_stage_compacts_indices() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        let mut pipeline = sample_pipeline("web");
        mapper.save("web", &pipeline).unwrap();
        let before = key_count(&store, "keel/pipelines/web/stages");

        pipeline.stages.remove(1);
        mapper.save("web", &pipeline).unwrap();

        let loaded = mapper.load("web").unwrap().unwrap();
        assert_eq!(loaded.stages.len(), 2);
        assert_eq!(loaded.stages[1].name, "ship");
        assert_eq!(key_count(&store, "keel/pipelines/web/stages/00000002"), 0);
        assert!(key_count(&store, "keel/pipelines/web/stages") < before);
    }

    #[test]
    fn test_clearing_optionals_removes_keys() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        let mut pipeline = sample_pipeline("web");
        mapper.save("web", &pipeline).unwrap();

        pipeline.notify = None;
        pipeline.description = None;
        pipeline.labels.clear();
        pipeline.stages[0].env.push(EnvVar {
            key: "CI".into(),
            value: "1".into(),
        });
        mapper.save("web", &pipeline).unwrap();

        let description = store.get("keel/pipelines/web/description").unwrap();
        assert!(description.is_none());
        assert!(store.list("keel/pipelines/web/notify").unwrap().is_empty());
        assert!(store.list("keel/pipelines/web/labels").unwrap().is_empty());
        assert_eq!(mapper.load("web").unwrap(), Some(pipeline));
    }

    #[test]
    fn test_concurrent_edit_loses_cas() {
        let store = Arc::new(InMemoryKvStore::new());
        let alice = pipelines(&store);
        let bob = pipelines(&store);
        alice.save("web", &sample_pipeline("web")).unwrap();

        let (mut a, version_a) = alice.load_versioned("web").unwrap().unwrap();
        let (mut b, version_b) = bob.load_versioned("web").unwrap().unwrap();
        assert_eq!(version_a, version_b);

        a.labels.push("alice".into());
        alice.save_versioned("web", &a, version_a).unwrap();

        b.labels.push("bob".into());
        let err = bob.save_versioned("web", &b, version_b).unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        let winner = bob.load("web").unwrap().unwrap();
        assert_eq!(winner.labels.last().map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_delete_removes_whole_subtree() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        mapper.save("web", &sample_pipeline("web")).unwrap();
        mapper.save("api", &sample_pipeline("api")).unwrap();

        assert!(mapper.delete("web").unwrap());
        assert_eq!(key_count(&store, "keel/pipelines/web"), 0);
        assert_eq!(mapper.list().unwrap(), vec!["api".to_string()]);
    }

    // =============================================================================
    // FAILURES
    // =============================================================================

    #[test]
    fn test_partition_is_retryable_not_missing() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        mapper.save("web", &sample_pipeline("web")).unwrap();

        store.set_available(false);
        let err = mapper.load("web").unwrap_err();
        assert!(err.is_retryable());

        store.set_available(true);
        assert!(mapper.load("web").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_leaf_is_malformed() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        mapper.save("web", &sample_pipeline("web")).unwrap();
        let timeout = "keel/pipelines/web/stages/00000000/timeout";
        store.put(timeout, b"\"ten minutes\"").unwrap();

        assert!(matches!(mapper.load("web"), Err(MapperError::Malformed { .. })));
    }

    #[test]
    fn test_missing_required_nested_is_error() {
        let store = Arc::new(InMemoryKvStore::new());
        let mapper = pipelines(&store);
        mapper.save("web", &sample_pipeline("web")).unwrap();
        store.delete_prefix("keel/pipelines/web/source").unwrap();

        assert!(matches!(
            mapper.load("web"),
            Err(MapperError::MissingField { field: "source", .. })
        ));
    }
}
