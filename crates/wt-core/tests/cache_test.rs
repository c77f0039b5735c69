use std::sync::Arc;

use chrono::Utc;
use wt_core::cache::{CacheError, LoadIntent, ProjectCache};
use wt_core::codec::Codec;
use wt_core::history::HistoryPolicy;
use wt_core::layout::Layout;
use wt_core::model::{Project, ProjectId, ProjectType, StringValue};
use wt_core::store::{ProjectStore, StoreError};

fn id(s: &str) -> ProjectId {
    ProjectId::new(s).unwrap()
}

fn create() -> LoadIntent {
    LoadIntent::CreateIfMissing {
        project_type: ProjectType::NewGrf,
        base_language: "en_GB".into(),
    }
}

fn new_cache(dir: &tempfile::TempDir, capacity: usize) -> ProjectCache {
    let store = ProjectStore::new(dir.path(), Layout::OneFile, Codec::Xml).with_backups(2);
    ProjectCache::new(store, capacity, HistoryPolicy::default())
}

fn text_of(project: &Project, language: &str, key: &str) -> Option<String> {
    project
        .language(language)
        .and_then(|table| table.get(key))
        .map(|entry| entry.value().text.clone())
}

#[tokio::test]
async fn capacity_one_evicts_and_flushes_the_previous_project() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 1);
    let (a, b) = (id("alpha"), id("beta"));

    cache.get(&a, create()).await.unwrap();
    cache
        .record_change(&a, "de_DE", "STR_HELLO", StringValue::new("Hallo"), "anne", Utc::now())
        .await
        .unwrap();

    cache.get(&b, create()).await.unwrap();
    assert_eq!(cache.resident().await, vec![b.clone()]);
    assert!(cache.store().exists(&a));

    let reloaded = cache.get(&a, LoadIntent::Existing).await.unwrap();
    let project = reloaded.read().await;
    assert_eq!(text_of(&project, "de_DE", "STR_HELLO").as_deref(), Some("Hallo"));
    assert!(!project.is_dirty());
    drop(project);

    assert_eq!(cache.resident().await, vec![a.clone()]);
    let stats = cache.stats().await;
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.flush_failures, 0);
}

#[tokio::test]
async fn least_recently_used_project_goes_first() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 2);
    let (a, b, c) = (id("a"), id("b"), id("c"));

    cache.get(&a, create()).await.unwrap();
    cache.get(&b, create()).await.unwrap();
    cache.get(&a, LoadIntent::Existing).await.unwrap();
    cache.get(&c, create()).await.unwrap();

    assert_eq!(cache.resident().await, vec![a, c]);
    assert!(cache.store().exists(&b));
}

#[tokio::test]
async fn held_handles_are_never_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 1);
    let (a, b) = (id("a"), id("b"));

    let held = cache.get(&a, create()).await.unwrap();
    cache.get(&b, create()).await.unwrap();

    // Capacity is exceeded rather than losing the held instance.
    assert_eq!(cache.resident().await, vec![a.clone(), b.clone()]);

    held.write()
        .await
        .record_change(
            cache.policy(),
            "nl_NL",
            "STR_X",
            StringValue::new("x"),
            "piet",
            Utc::now(),
        )
        .unwrap();
    // A hit on the held project lets the idle one go.
    let again = cache.get(&a, LoadIntent::Existing).await.unwrap();
    assert!(Arc::ptr_eq(&held, &again));
    drop(held);
    drop(again);
    assert_eq!(cache.resident().await, vec![a.clone()]);
    assert!(cache.store().exists(&b));

    assert_eq!(cache.flush_all().await.unwrap(), 1);
    let stored = cache.store().read(&a).unwrap();
    assert_eq!(text_of(&stored, "nl_NL", "STR_X").as_deref(), Some("x"));
}

#[tokio::test]
async fn failed_eviction_flush_keeps_project_resident_and_dirty() {
    let dir = tempfile::tempdir().unwrap();
    let store = ProjectStore::new(dir.path(), Layout::OneFile, Codec::Json).with_size_limit(10);
    let cache = ProjectCache::new(store, 1, HistoryPolicy::default());
    let (a, b) = (id("a"), id("b"));

    cache.get(&a, create()).await.unwrap();
    cache.get(&b, create()).await.unwrap();

    assert_eq!(cache.resident().await, vec![a.clone(), b.clone()]);
    assert!(!cache.store().exists(&a));
    let handle = cache.get(&a, LoadIntent::Existing).await.unwrap();
    assert!(handle.read().await.is_dirty());
    drop(handle);

    let stats = cache.stats().await;
    assert!(stats.flush_failures >= 1);
    assert_eq!(stats.evictions, 0);

    match cache.flush_all().await {
        Err(CacheError::FlushFailed(ids)) => assert_eq!(ids, vec![a, b]),
        other => panic!("expected FlushFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_project_is_not_cached_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 2);
    let late = id("late");

    let err = cache.get(&late, LoadIntent::Existing).await.unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::NotFound(_))));
    assert!(cache.resident().await.is_empty());

    let project = Project::new(late.clone(), ProjectType::GameScript, "en_US").unwrap();
    cache.store().write(&late, &project).unwrap();

    let handle = cache.get(&late, LoadIntent::Existing).await.unwrap();
    assert_eq!(handle.read().await.project_type(), ProjectType::GameScript);
}

#[tokio::test]
async fn rejected_change_leaves_project_clean() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 1);
    let a = id("a");
    cache.get(&a, create()).await.unwrap();
    cache.flush(&a).await.unwrap();

    let now = Utc::now();
    cache
        .record_change(&a, "de_DE", "K", StringValue::new("eins"), "x", now)
        .await
        .unwrap();
    cache.flush(&a).await.unwrap();

    let earlier = now - chrono::Duration::seconds(5);
    let err = cache
        .record_change(&a, "de_DE", "K", StringValue::new("zwei"), "x", earlier)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::History(_)));

    let handle = cache.get(&a, LoadIntent::Existing).await.unwrap();
    let project = handle.read().await;
    assert!(!project.is_dirty());
    assert_eq!(text_of(&project, "de_DE", "K").as_deref(), Some("eins"));
}

#[tokio::test]
async fn mark_dirty_forces_a_rewrite() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 1);
    let a = id("a");
    cache.get(&a, create()).await.unwrap();
    assert!(cache.flush(&a).await.unwrap());
    assert!(!cache.flush(&a).await.unwrap());

    cache.mark_dirty(&a).await.unwrap();
    cache.mark_dirty(&a).await.unwrap();
    assert!(cache.flush(&a).await.unwrap());
    assert_eq!(cache.stats().await.flushes, 2);
}

#[tokio::test]
async fn delete_drops_resident_copy_and_files() {
    let dir = tempfile::tempdir().unwrap();
    let cache = new_cache(&dir, 2);
    let a = id("a");
    cache.get(&a, create()).await.unwrap();
    cache.flush_all().await.unwrap();

    assert!(cache.delete(&a).await.unwrap());
    assert!(cache.resident().await.is_empty());
    assert!(!cache.store().exists(&a));
    assert!(!cache.delete(&a).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_gets_share_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(new_cache(&dir, 1));
    let shared = id("shared");
    let project = Project::new(shared.clone(), ProjectType::NewGrf, "en_GB").unwrap();
    cache.store().write(&shared, &project).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let cache = Arc::clone(&cache);
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            cache.get(&shared, LoadIntent::Existing).await.unwrap()
        }));
    }
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    for handle in &handles[1..] {
        assert!(Arc::ptr_eq(&handles[0], handle));
    }
    let stats = cache.stats().await;
    assert_eq!(stats.loads, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 15);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_edits_survive_eviction() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(new_cache(&dir, 2));
    let ids: Vec<ProjectId> = (0..8).map(|i| id(&format!("p{i}"))).collect();
    for pid in &ids {
        cache.get(pid, create()).await.unwrap();
    }

    let mut tasks = Vec::new();
    for round in 0..4 {
        for pid in ids.clone() {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache
                    .record_change(
                        &pid,
                        "de_DE",
                        &format!("STR_{round}"),
                        StringValue::new(format!("{pid}-{round}")),
                        "bot",
                        Utc::now(),
                    )
                    .await
                    .unwrap();
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    cache.flush_all().await.unwrap();

    for pid in &ids {
        let stored = cache.store().read(pid).unwrap();
        for round in 0..4 {
            assert_eq!(
                text_of(&stored, "de_DE", &format!("STR_{round}")),
                Some(format!("{pid}-{round}")),
            );
        }
    }
}
