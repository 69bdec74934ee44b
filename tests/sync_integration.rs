//! Integration tests for source group reconciliation.

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mirror_core::store::NewSourceGroup;
use mirror_core::{ManualClock, SourceGroup, SyncError};
use support::{Harness, PDF_BYTES, dir_url, epoch, write_file};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn create_group(harness: &Harness, url: &str, delete_unused: bool) -> SourceGroup {
    harness
        .mirror
        .store
        .create_group(&NewSourceGroup {
            name: "docs",
            url,
            credentials: None,
            delete_unused,
            interval_secs: 3600,
        })
        .await
        .expect("Failed to create group")
}

async fn group_uris(harness: &Harness, group_id: i64) -> BTreeSet<String> {
    harness
        .mirror
        .store
        .find_by_group(group_id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.source_uri)
        .collect()
}

#[tokio::test]
async fn test_sync_converges_on_remote_set() {
    let harness = Harness::new().await;
    let src = harness.source_dir("remote");
    let a = write_file(&src, "a.pdf", PDF_BYTES);
    let c = write_file(&src, "c.pdf", PDF_BYTES);
    let group = create_group(&harness, &dir_url(&src), true).await;

    let first = harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    assert!(first.is_complete());
    assert_eq!(first.imported, 2);
    assert_eq!(group_uris(&harness, group.id).await, BTreeSet::from([a.clone(), c.clone()]));

    std::fs::remove_file(src.join("c.pdf")).unwrap();
    let b = write_file(&src, "b.pdf", PDF_BYTES);
    let stale = harness.record(&c).await;
    let stale_file = stale.local_file().unwrap();
    assert!(stale_file.exists());

    let second = harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    assert!(second.is_complete());
    assert_eq!(second.deleted, vec![stale.id]);
    assert_eq!(group_uris(&harness, group.id).await, BTreeSet::from([a, b]));
    assert!(!stale_file.exists(), "library file of a stale record is removed");

    let touched = harness.mirror.store.find_group(group.id).await.unwrap().unwrap();
    assert!(touched.last_synced_at.is_some());
}

#[tokio::test]
async fn test_stale_deletion_waits_for_every_page() {
    let harness = Harness::with_config(
        |config| config.page_size = 1,
        Arc::new(ManualClock::new(epoch())),
    )
    .await;
    let src = harness.source_dir("remote");
    let kept: Vec<String> = ["a.pdf", "b.pdf", "c.pdf"]
        .iter()
        .map(|name| write_file(&src, name, PDF_BYTES))
        .collect();
    let z = write_file(&src, "z.pdf", PDF_BYTES);
    let group = create_group(&harness, &dir_url(&src), true).await;

    let first = harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    assert_eq!(first.pages, 4);
    assert_eq!(first.imported, 4);
    let mut ids_before = Vec::new();
    for url in &kept {
        ids_before.push(harness.record(url).await.id);
    }
    let stale = harness.record(&z).await;

    std::fs::remove_file(src.join("z.pdf")).unwrap();
    let second = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(second.is_complete());
    assert_eq!(second.pages, 3);
    assert_eq!(second.listed, 3);
    assert_eq!(second.deleted, vec![stale.id]);
    // No record was deleted and re-created between pages.
    let mut ids_after = Vec::new();
    for url in &kept {
        ids_after.push(harness.record(url).await.id);
    }
    assert_eq!(ids_after, ids_before);
    assert_eq!(group_uris(&harness, group.id).await, kept.into_iter().collect());
}

#[tokio::test]
async fn test_sync_keeps_records_when_deletion_disabled() {
    let harness = Harness::new().await;
    let src = harness.source_dir("remote");
    write_file(&src, "a.pdf", PDF_BYTES);
    let c = write_file(&src, "c.pdf", PDF_BYTES);
    let group = create_group(&harness, &dir_url(&src), false).await;
    harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    std::fs::remove_file(src.join("c.pdf")).unwrap();
    let outcome = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(outcome.deleted.is_empty());
    assert!(group_uris(&harness, group.id).await.contains(&c));
}

#[tokio::test]
async fn test_empty_listing_deletes_nothing() {
    let harness = Harness::new().await;
    let src = harness.source_dir("remote");
    write_file(&src, "a.pdf", PDF_BYTES);
    write_file(&src, "b.pdf", PDF_BYTES);
    let group = create_group(&harness, &dir_url(&src), true).await;
    harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    let before = harness.mirror.store.find_group(group.id).await.unwrap().unwrap();

    std::fs::remove_file(src.join("a.pdf")).unwrap();
    std::fs::remove_file(src.join("b.pdf")).unwrap();
    let outcome = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(outcome.aborted);
    assert!(!outcome.is_complete());
    assert!(outcome.deleted.is_empty());
    assert_eq!(group_uris(&harness, group.id).await.len(), 2);
    let after = harness.mirror.store.find_group(group.id).await.unwrap().unwrap();
    assert_eq!(before.last_synced_at, after.last_synced_at);
}

#[tokio::test]
async fn test_unreachable_source_deletes_nothing() {
    let harness = Harness::new().await;
    let src = harness.source_dir("remote");
    write_file(&src, "a.pdf", PDF_BYTES);
    let group = create_group(&harness, &dir_url(&src), true).await;
    harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    std::fs::remove_dir_all(&src).unwrap();
    let outcome = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(outcome.aborted);
    assert!(outcome.deleted.is_empty());
    assert_eq!(group_uris(&harness, group.id).await.len(), 1);
}

async fn mount_index(server: &MockServer, files: &[(&str, &str)]) {
    let links: String = files
        .iter()
        .map(|(name, _)| format!("<a href=\"{name}\">{name}</a>\n"))
        .collect();
    Mock::given(method("GET"))
        .and(path("/docs/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string(format!("<html><body>{links}</body></html>")),
        )
        .mount(server)
        .await;
    for (name, mime) in files {
        Mock::given(method("HEAD"))
            .and(path(format!("/docs/{name}")))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", *mime))
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_listed_but_failed_file_is_not_deleted() {
    let server = MockServer::start().await;
    mount_index(&server, &[("a.pdf", "application/pdf"), ("b.pdf", "application/pdf")]).await;
    let harness = Harness::new().await;
    let group = create_group(&harness, &format!("{}/docs/", server.uri()), true).await;
    harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    let b = format!("{}/docs/b.pdf", server.uri());
    let record = harness.record(&b).await;

    // b.pdf is still listed but now reports a type the policy rejects.
    server.reset().await;
    mount_index(
        &server,
        &[("a.pdf", "application/pdf"), ("b.pdf", "application/x-msdownload")],
    )
    .await;
    let outcome = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert_eq!(outcome.failed, 1);
    assert!(outcome.is_complete());
    assert!(outcome.deleted.is_empty());
    assert_eq!(harness.record(&b).await.id, record.id);
}

#[tokio::test]
async fn test_sync_unknown_group() {
    let harness = Harness::new().await;
    let result = harness.mirror.reconciler.sync_group(404).await;
    assert!(matches!(result, Err(SyncError::GroupNotFound(404))));
}

#[tokio::test]
async fn test_concurrent_pass_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/slow.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;
    let harness = Harness::new().await;
    let group = create_group(&harness, &format!("{}/slow.pdf", server.uri()), false).await;

    let reconciler = harness.mirror.reconciler.clone();
    let group_id = group.id;
    let first = tokio::spawn(async move { reconciler.sync_group(group_id).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(harness.mirror.reconciler.is_running(group.id));
    assert!(harness.mirror.reconciler.progress(group.id).is_some());
    let second = harness.mirror.reconciler.sync_group(group.id).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning(id)) if id == group.id));

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.imported, 1);
    assert!(!harness.mirror.reconciler.is_running(group.id), "guard is released when a pass ends");
}
