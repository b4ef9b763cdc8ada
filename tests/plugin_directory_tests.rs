
use std::sync::Arc;

use monet_worker::plugin::{Capability, PluginDescriptor, PluginError};
use test_harness::*;

fn descriptors(raw: &[&str]) -> Vec<PluginDescriptor> {
    raw.iter().map(|d| PluginDescriptor::parse(d).unwrap()).collect()
}

fn library_script() -> String {
    plugin_script(&[], "    exit 0")
}

#[tokio::test]
async fn test_resolve_installs_and_activates() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;

    let algorithm = directory
        .resolve(ALGORITHM, Capability::Algorithm)
        .await
        .unwrap();

    assert_eq!(algorithm.descriptor().to_string(), ALGORITHM);
    assert!(algorithm.provides(Capability::Algorithm));
    assert!(!algorithm.provides(Capability::Parser));
    assert_eq!(algorithm.program(), dirs.installed().join("tsp#1.0"));
    assert!(algorithm.program().exists());
    assert!(dirs.cache().join("tsp#1.0").exists());
    assert!(dirs.cache().join("tsp#1.0#manifest.json").exists());
    assert_eq!(directory.cached().await, descriptors(&[ALGORITHM]));
    assert_eq!(directory.active().await, descriptors(&[ALGORITHM]));
}

#[tokio::test]
async fn test_similar_descriptors_do_not_share_files() {
    let store = TestStore::new();
    store.publish_plugin("a-1#0", &algorithm_script(RUN_SUCCEEDS), &[]);
    store.publish_plugin("a#1-0", &parser_script(), &[]);
    let dirs = WorkerDirs::new();
    {
        let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
        directory.resolve("a-1#0", Capability::Algorithm).await.unwrap();
        directory.resolve("a#1-0", Capability::Parser).await.unwrap();
        assert_eq!(directory.installed().await, descriptors(&["a#1-0", "a-1#0"]));
        directory.reset_all().await;
    }

    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
    assert_eq!(directory.cached().await, descriptors(&["a#1-0", "a-1#0"]));
    let parser = directory.resolve("a#1-0", Capability::Parser).await.unwrap();
    assert!(parser.provides(Capability::Parser));
    let algorithm = directory.resolve("a-1#0", Capability::Algorithm).await.unwrap();
    assert!(algorithm.provides(Capability::Algorithm));
    assert_ne!(parser.program(), algorithm.program());
}

#[tokio::test]
async fn test_resolve_is_idempotent() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    let counting = Arc::new(CountingStore::new(store.fs_store()));
    let directory = open_directory(&dirs, counting.clone(), false).await;

    let first = directory
        .resolve(ALGORITHM, Capability::Algorithm)
        .await
        .unwrap();
    assert_eq!(counting.fetch_count(), 1);

    let second = directory
        .resolve(ALGORITHM, Capability::Algorithm)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(counting.fetch_count(), 1);
}

#[tokio::test]
async fn test_cached_plugin_is_used_without_the_store() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    {
        let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
        directory
            .resolve(PARSER, Capability::Parser)
            .await
            .unwrap();
        directory.reset_all().await;
    }

    store.remove_plugin(PARSER);
    let counting = Arc::new(CountingStore::new(store.fs_store()));
    let directory = open_directory(&dirs, counting.clone(), false).await;
    assert_eq!(directory.cached().await, descriptors(&[PARSER]));

    let parser = directory
        .resolve(PARSER, Capability::Parser)
        .await
        .unwrap();
    assert!(parser.provides(Capability::Parser));
    assert_eq!(counting.fetch_count(), 0);
}

#[tokio::test]
async fn test_development_mode_always_fetches() {
    let store = standard_store(RUN_SUCCEEDS);
    store.publish_plugin("graphlib#0.3", &library_script(), &[]);
    let algorithm = algorithm_script(RUN_SUCCEEDS);
    store.publish_plugin("mst#2.1", &algorithm, &["graphlib#0.3"]);

    let dirs = WorkerDirs::new();
    let counting = Arc::new(CountingStore::new(store.fs_store()));
    let directory = open_directory(&dirs, counting.clone(), true).await;

    directory
        .resolve("mst#2.1", Capability::Algorithm)
        .await
        .unwrap();
    assert_eq!(counting.fetch_count(), 2);

    directory.reset_all().await;
    directory
        .resolve("mst#2.1", Capability::Algorithm)
        .await
        .unwrap();
    assert_eq!(counting.fetch_count(), 4, "root and dependency are fetched again");
}

#[tokio::test]
async fn test_dependencies_are_installed_once() {
    let store = TestStore::new();
    store.publish_plugin("base#1.0", &library_script(), &[]);
    store.publish_plugin("left#1.0", &library_script(), &["base#1.0"]);
    store.publish_plugin("right#1.0", &library_script(), &["base#1.0"]);
    store.publish_plugin(
        "solver#1.0",
        &algorithm_script(RUN_SUCCEEDS),
        &["left#1.0", "right#1.0"],
    );

    let dirs = WorkerDirs::new();
    let counting = Arc::new(CountingStore::new(store.fs_store()));
    let directory = open_directory(&dirs, counting.clone(), false).await;

    let solver = directory
        .resolve("solver#1.0", Capability::Algorithm)
        .await
        .unwrap();
    assert_eq!(solver.plugin_path(), dirs.installed());
    assert_eq!(counting.fetch_count(), 4);
    assert_eq!(
        directory.installed().await,
        descriptors(&["base#1.0", "left#1.0", "right#1.0", "solver#1.0"])
    );
    for file in ["base#1.0", "left#1.0", "right#1.0", "solver#1.0"] {
        assert!(dirs.installed().join(file).exists(), "{file} not installed");
    }
    assert_eq!(directory.active().await, descriptors(&["solver#1.0"]));
}

#[tokio::test]
async fn test_dependency_cycle_is_not_found() {
    let store = TestStore::new();
    store.publish_plugin("chicken#1.0", &algorithm_script(RUN_SUCCEEDS), &["egg#1.0"]);
    store.publish_plugin("egg#1.0", &library_script(), &["chicken#1.0"]);

    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;

    let err = directory
        .resolve("chicken#1.0", Capability::Algorithm)
        .await
        .unwrap_err();
    match err {
        PluginError::NotFound { reason, .. } => assert!(reason.contains("cycle"), "{reason}"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(directory.installed().await.is_empty());
}

#[tokio::test]
async fn test_resolution_failures_are_not_found() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;

    for (descriptor, capability) in [
        ("tsp", Capability::Algorithm),
        ("tsp#1.0#beta", Capability::Algorithm),
        ("missing#1.0", Capability::Algorithm),
        (ALGORITHM, Capability::Parser),
    ] {
        let result = directory.resolve(descriptor, capability).await;
        assert!(
            matches!(result, Err(PluginError::NotFound { .. })),
            "{descriptor} as {capability}: {result:?}"
        );
    }
}

#[tokio::test]
async fn test_missing_dependency_fails_resolution() {
    let store = TestStore::new();
    store.publish_plugin("orphan#1.0", &algorithm_script(RUN_SUCCEEDS), &["gone#1.0"]);

    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
    let result = directory.resolve("orphan#1.0", Capability::Algorithm).await;
    assert!(matches!(result, Err(PluginError::NotFound { .. })));
}

#[tokio::test]
async fn test_reset_all_uninstalls_everything() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;

    let algorithm = directory
        .resolve(ALGORITHM, Capability::Algorithm)
        .await
        .unwrap();
    directory.resolve(PARSER, Capability::Parser).await.unwrap();
    assert_eq!(directory.installed().await.len(), 2);

    directory.reset_all().await;
    assert!(directory.active().await.is_empty());
    assert!(directory.installed().await.is_empty());
    assert!(!algorithm.program().exists());
    assert_eq!(directory.cached().await.len(), 2, "the cache survives a reset");

    let again = directory
        .resolve(ALGORITHM, Capability::Algorithm)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&algorithm, &again));
}

#[tokio::test]
async fn test_validate_cache_evicts_exactly_mismatches() {
    let store = TestStore::new();
    let good_hash = store.publish_plugin("good#1.0", &library_script(), &[]);
    store.publish_plugin("stale#1.0", &library_script(), &[]);
    store.publish_plugin("unlisted#1.0", &library_script(), &[]);
    store.publish_plugin("host#1.0", &algorithm_script(RUN_SUCCEEDS), &[
        "good#1.0",
        "stale#1.0",
        "unlisted#1.0",
    ]);

    let dirs = WorkerDirs::new();
    {
        let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
        directory
            .resolve("host#1.0", Capability::Algorithm)
            .await
            .unwrap();
        directory.reset_all().await;
    }

    store.set_recorded_hash("good#1.0", &good_hash.to_uppercase());
    store.set_recorded_hash("stale#1.0", &sha256_hex(b"a newer build"));
    store.remove_plugin("unlisted#1.0");

    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
    let evicted = directory.validate_cache().await;

    assert_eq!(evicted, descriptors(&["stale#1.0"]));
    assert_eq!(
        directory.cached().await,
        descriptors(&["good#1.0", "host#1.0", "unlisted#1.0"])
    );
    assert!(!dirs.cache().join("stale#1.0").exists());
    assert!(!dirs.cache().join("stale#1.0#manifest.json").exists());
    assert!(dirs.cache().join("good#1.0").exists());
}

#[tokio::test]
async fn test_validate_cache_keeps_entries_when_store_unreachable() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    {
        let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
        directory
            .resolve(ALGORITHM, Capability::Algorithm)
            .await
            .unwrap();
        directory.reset_all().await;
    }
    store.set_recorded_hash(ALGORITHM, &sha256_hex(b"would be stale"));

    let offline = Arc::new(CountingStore::offline(store.fs_store()));
    let directory = open_directory(&dirs, offline.clone(), false).await;
    assert!(directory.validate_cache().await.is_empty());
    assert_eq!(directory.cached().await, descriptors(&[ALGORITHM]));
    assert_eq!(offline.records.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_validate_cache_evicts_unreadable_artifacts() {
    let store = standard_store(RUN_SUCCEEDS);
    let dirs = WorkerDirs::new();
    let directory = open_directory(&dirs, Arc::new(store.fs_store()), false).await;
    directory.resolve(PARSER, Capability::Parser).await.unwrap();
    directory.reset_all().await;

    std::fs::remove_file(dirs.cache().join("dimacs-2.0")).unwrap();
    assert_eq!(directory.validate_cache().await, descriptors(&[PARSER]));
    assert!(directory.cached().await.is_empty());
}
