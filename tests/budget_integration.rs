//! Integration tests for the execution budget and the deferred queue.
//!
//! The manual clock advances one second per read. An import run reads it
//! once to start and once before each descriptor, so with a 10s ceiling and a
//! 5s margin the fifth check fires. A sync pass reads it twice before its
//! first descriptor (start and marker), so the fourth check fires there.

mod support;

use std::sync::Arc;
use std::time::Duration;

use mirror_core::import::{DeferredQueue, DeferredStatus};
use mirror_core::protocol::{DEFAULT_PAGE_SIZE, ListCursor};
use mirror_core::store::NewSourceGroup;
use mirror_core::{ImportContext, ManualClock};
use support::{Harness, PDF_BYTES, dir_url, write_file};

async fn metered_harness() -> Harness {
    metered_harness_with_pages(DEFAULT_PAGE_SIZE).await
}

async fn metered_harness_with_pages(page_size: usize) -> Harness {
    Harness::with_config(
        |config| {
            config.execution_ceiling = Some(Duration::from_secs(10));
            config.safety_margin = Duration::from_secs(5);
            config.page_size = page_size;
        },
        Arc::new(ManualClock::stepping(support::epoch(), Duration::from_secs(1))),
    )
    .await
}

#[tokio::test]
async fn test_budget_hands_tail_to_deferred_queue() {
    let harness = metered_harness().await;
    let src = harness.source_dir("src");
    let urls: Vec<String> = (0..6)
        .map(|i| write_file(&src, &format!("f{i}.pdf"), PDF_BYTES))
        .collect();

    let mut ctx = ImportContext::user();
    let summary = harness
        .mirror
        .pipeline
        .import_with_context(&dir_url(&src), None, &mut ctx)
        .await
        .unwrap();

    let handoff = summary.deferred.expect("batch should be deferred");
    assert_eq!(summary.imported_count(), 4);
    assert_eq!(handoff.remaining, 2);
    assert!(summary.load_more.is_none());
    assert!(ctx.cursor.is_none());
    assert_eq!(summary.listed.len(), 6, "the whole page counts as listed");
    assert!(harness.mirror.store.find_by_uri(&urls[4]).await.unwrap().is_none());

    let queue = &harness.mirror.deferred;
    assert_eq!(queue.count_by_status(DeferredStatus::Pending).await.unwrap(), 1);
    let batch = queue.get(handoff.batch_id).await.unwrap().unwrap();
    let queued: Vec<&str> = batch.descriptors.iter().map(|d| d.url.as_str()).collect();
    assert_eq!(queued, vec![urls[4].as_str(), urls[5].as_str()]);
}

#[tokio::test]
async fn test_resume_deferred_finishes_the_batch() {
    let harness = metered_harness().await;
    let src = harness.source_dir("src");
    let urls: Vec<String> = (0..6)
        .map(|i| write_file(&src, &format!("f{i}.pdf"), PDF_BYTES))
        .collect();
    let mut ctx = ImportContext::user();
    harness
        .mirror
        .pipeline
        .import_with_context(&dir_url(&src), None, &mut ctx)
        .await
        .unwrap();

    let mut resume_ctx = ImportContext::user();
    let resumed = harness
        .mirror
        .pipeline
        .resume_deferred(&mut resume_ctx)
        .await
        .unwrap()
        .expect("a batch was pending");
    assert_eq!(resumed.imported_count(), 2);
    assert!(!resumed.is_deferred());

    for url in &urls {
        harness.record(url).await;
    }
    let queue = &harness.mirror.deferred;
    assert_eq!(queue.count_by_status(DeferredStatus::Pending).await.unwrap(), 0);
    assert_eq!(queue.count_by_status(DeferredStatus::Completed).await.unwrap(), 1);

    let mut idle_ctx = ImportContext::user();
    let nothing = harness
        .mirror
        .pipeline
        .resume_deferred(&mut idle_ctx)
        .await
        .unwrap();
    assert!(nothing.is_none());
}

#[tokio::test]
async fn test_unmetered_batch_never_defers() {
    let harness = Harness::with_config(
        |_| {},
        Arc::new(ManualClock::stepping(support::epoch(), Duration::from_secs(3600))),
    )
    .await;
    let src = harness.source_dir("src");
    for i in 0..6 {
        write_file(&src, &format!("f{i}.pdf"), PDF_BYTES);
    }

    let mut ctx = ImportContext::user();
    let summary = harness
        .mirror
        .pipeline
        .import_with_context(&dir_url(&src), None, &mut ctx)
        .await
        .unwrap();
    assert!(!summary.is_deferred());
    assert_eq!(summary.imported_count(), 6);
}

#[tokio::test]
async fn test_deferred_sync_pass_skips_stale_deletion() {
    let harness = metered_harness().await;
    let src = harness.source_dir("remote");
    write_file(&src, "a.pdf", PDF_BYTES);
    let stale = write_file(&src, "z.pdf", PDF_BYTES);
    let group = harness
        .mirror
        .store
        .create_group(&NewSourceGroup {
            name: "docs",
            url: &dir_url(&src),
            credentials: None,
            delete_unused: true,
            interval_secs: 60,
        })
        .await
        .unwrap();

    let first = harness.mirror.reconciler.sync_group(group.id).await.unwrap();
    assert!(first.is_complete());
    let synced_at = harness
        .mirror
        .store
        .find_group(group.id)
        .await
        .unwrap()
        .unwrap()
        .last_synced_at;

    std::fs::remove_file(src.join("z.pdf")).unwrap();
    for i in 0..6 {
        write_file(&src, &format!("b{i}.pdf"), PDF_BYTES);
    }
    let second = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(second.deferred);
    assert!(!second.is_complete());
    assert!(second.deleted.is_empty());
    assert!(harness.mirror.store.find_by_uri(&stale).await.unwrap().is_some());
    let group_after = harness.mirror.store.find_group(group.id).await.unwrap().unwrap();
    assert_eq!(group_after.last_synced_at, synced_at);

    let mut ctx = ImportContext::user();
    let resumed = harness
        .mirror
        .pipeline
        .resume_deferred(&mut ctx)
        .await
        .unwrap()
        .unwrap();
    assert!(resumed.any_imported());
    let members = harness.mirror.store.find_by_group(group.id).await.unwrap();
    assert_eq!(members.len(), 8, "resumed files keep their group link");
}

#[tokio::test]
async fn test_budget_spans_every_page_of_a_user_run() {
    let harness = metered_harness_with_pages(1).await;
    let src = harness.source_dir("src");
    for i in 0..8 {
        write_file(&src, &format!("f{i}.pdf"), PDF_BYTES);
    }

    let mut ctx = ImportContext::user();
    let mut imported = 0;
    let mut calls = 0;
    let handoff = loop {
        let summary = harness
            .mirror
            .pipeline
            .import_with_context(&dir_url(&src), None, &mut ctx)
            .await
            .unwrap();
        calls += 1;
        imported += summary.imported_count();
        if let Some(handoff) = summary.deferred {
            break handoff;
        }
        assert!(ctx.cursor.is_some(), "the run must stop before the listing ends");
    };

    assert_eq!(imported, 4);
    assert_eq!(calls, 5);
    assert!(ctx.started_at.is_some());
    let batch = harness
        .mirror
        .deferred
        .get(handoff.batch_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.descriptors.len(), 1);
    assert_eq!(batch.list_cursor, Some(ListCursor { offset: 5 }));
}

#[tokio::test]
async fn test_budget_spans_a_paginated_sync_pass() {
    let harness = metered_harness_with_pages(1).await;
    let src = harness.source_dir("remote");
    for i in 0..20 {
        write_file(&src, &format!("f{i:02}.pdf"), PDF_BYTES);
    }
    let group = harness
        .mirror
        .store
        .create_group(&NewSourceGroup {
            name: "docs",
            url: &dir_url(&src),
            credentials: None,
            delete_unused: true,
            interval_secs: 60,
        })
        .await
        .unwrap();

    let outcome = harness.mirror.reconciler.sync_group(group.id).await.unwrap();

    assert!(outcome.deferred);
    assert!(!outcome.is_complete());
    assert_eq!(outcome.imported, 3);
    assert_eq!(outcome.pages, 4);
    assert!(outcome.deleted.is_empty());
    let group_after = harness.mirror.store.find_group(group.id).await.unwrap().unwrap();
    assert!(group_after.last_synced_at.is_none());

    let queue = &harness.mirror.deferred;
    assert_eq!(queue.count_by_status(DeferredStatus::Pending).await.unwrap(), 1);
}
