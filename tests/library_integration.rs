//! Integration tests for deletion, hosting switches and availability checks.

mod support;

use mirror_core::{Credentials, HostingError, StorageMode};
use support::{Harness, PDF_BYTES, write_file};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_delete_removes_record_and_library_file() {
    let harness = Harness::new().await;
    let src = harness.source_dir("src");
    let url = write_file(&src, "a.pdf", PDF_BYTES);
    harness.mirror.pipeline.import_from_url(&url, None).await.unwrap();
    let record = harness.record(&url).await;
    let stored = record.local_file().unwrap();

    assert!(harness.mirror.library.delete_resource(record.id).await.unwrap());
    assert!(!stored.exists());
    assert!(harness.mirror.store.find_by_id(record.id).await.unwrap().is_none());
    assert!(src.join("a.pdf").exists(), "the source is never touched");

    assert!(!harness.mirror.library.delete_resource(record.id).await.unwrap());
}

#[tokio::test]
async fn test_delete_referenced_removes_cache_entry() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/a.pdf"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "application/pdf"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(PDF_BYTES.to_vec()),
        )
        .mount(&server)
        .await;
    let harness = Harness::new().await;
    let url = format!("{}/a.pdf", server.uri());
    harness.mirror.pipeline.import_from_url(&url, None).await.unwrap();
    let record = harness.record(&url).await;
    harness.mirror.cache.resolve(&record).await.unwrap();
    let entry = harness.mirror.cache.entry_path(&record);
    assert!(entry.exists());

    assert!(harness.mirror.library.delete_resource(record.id).await.unwrap());
    assert!(!entry.exists());
}

#[tokio::test]
async fn test_switch_embedded_to_referenced_and_back() {
    let harness = Harness::new().await;
    let src = harness.source_dir("src");
    let url = write_file(&src, "a.pdf", PDF_BYTES);
    harness.mirror.pipeline.import_from_url(&url, None).await.unwrap();
    let record = harness.record(&url).await;
    let stored = record.local_file().unwrap();

    let referenced = harness
        .mirror
        .library
        .switch_hosting(record.id, StorageMode::Referenced)
        .await
        .unwrap();
    assert_eq!(referenced.storage_mode(), StorageMode::Referenced);
    assert!(referenced.local_path.is_none());
    assert!(!stored.exists());

    let embedded = harness
        .mirror
        .library
        .switch_hosting(record.id, StorageMode::Embedded)
        .await
        .unwrap();
    assert_eq!(embedded.storage_mode(), StorageMode::Embedded);
    let restored = embedded.local_file().unwrap();
    assert_eq!(std::fs::read(restored).unwrap(), PDF_BYTES);
    assert_eq!(harness.record(&url).await.storage_mode(), StorageMode::Embedded);
}

#[tokio::test]
async fn test_switch_to_current_mode_is_a_no_op() {
    let harness = Harness::new().await;
    let src = harness.source_dir("src");
    let url = write_file(&src, "a.pdf", PDF_BYTES);
    harness.mirror.pipeline.import_from_url(&url, None).await.unwrap();
    let record = harness.record(&url).await;

    let same = harness
        .mirror
        .library
        .switch_hosting(record.id, StorageMode::Embedded)
        .await
        .unwrap();
    assert_eq!(same.local_path, record.local_path);
}

#[tokio::test]
async fn test_authenticated_referenced_record_is_pinned() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/private.pdf"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "application/pdf"))
        .mount(&server)
        .await;
    let harness = Harness::new().await;
    let url = format!("{}/private.pdf", server.uri());
    let credentials = Credentials::new("alice", "s3cret");
    harness
        .mirror
        .pipeline
        .import_from_url(&url, Some(&credentials))
        .await
        .unwrap();
    let record = harness.record(&url).await;
    assert!(record.has_credentials());
    assert!(!record.credentials.as_deref().unwrap().windows(6).any(|w| w == b"s3cret"));

    let result = harness
        .mirror
        .library
        .switch_hosting(record.id, StorageMode::Embedded)
        .await;
    assert!(matches!(result, Err(HostingError::Pinned { id }) if id == record.id));
}

#[tokio::test]
async fn test_switch_unknown_record() {
    let harness = Harness::new().await;
    let result = harness
        .mirror
        .library
        .switch_hosting(77, StorageMode::Embedded)
        .await;
    assert!(matches!(result, Err(HostingError::NotFound(77))));
}

#[tokio::test]
async fn test_check_availability_tracks_source_presence() {
    let harness = Harness::new().await;
    let src = harness.source_dir("src");
    let url = write_file(&src, "a.pdf", PDF_BYTES);
    harness.mirror.pipeline.import_from_url(&url, None).await.unwrap();
    let record = harness.record(&url).await;
    harness
        .mirror
        .library
        .switch_hosting(record.id, StorageMode::Referenced)
        .await
        .unwrap();

    let report = harness.mirror.library.check_availability().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.available, 1);

    std::fs::remove_file(src.join("a.pdf")).unwrap();
    let report = harness.mirror.library.check_availability().await.unwrap();
    assert_eq!(report.unavailable, vec![record.id]);
    assert!(!harness.record(&url).await.available);

    let resolved = harness.mirror.cache.resolve(&harness.record(&url).await).await;
    assert!(resolved.is_err(), "unavailable records are not served");
}
