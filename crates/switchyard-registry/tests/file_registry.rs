//! File registry tests against a real directory

use futures::StreamExt;
use std::time::Duration;
use switchyard_core::{Error, Registry};
use switchyard_registry::FileRegistry;
use tempfile::TempDir;

fn setup() -> (TempDir, FileRegistry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = FileRegistry::new(
        dir.path().join("services.routes"),
        dir.path().join("manual"),
        "manual",
    )
    .unwrap();
    (dir, registry)
}

async fn next_program(stream: &mut switchyard_core::ProgramStream) -> String {
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("no registry update in time")
        .expect("registry stream ended")
}

#[tokio::test]
async fn test_missing_services_file_reads_empty() {
    let (_dir, registry) = setup();
    let mut services = registry.watch_services().await.unwrap();
    assert_eq!(next_program(&mut services).await, "");
}

#[tokio::test]
async fn test_services_file_changes_are_streamed() {
    let (dir, registry) = setup();
    let path = dir.path().join("services.routes");
    std::fs::write(&path, "route add a / http://a/").unwrap();

    let mut services = registry.watch_services().await.unwrap();
    assert_eq!(next_program(&mut services).await, "route add a / http://a/");

    std::fs::write(&path, "route add b / http://b/").unwrap();
    assert_eq!(next_program(&mut services).await, "route add b / http://b/");
}

#[tokio::test]
async fn test_truncate_then_write_is_read_once_settled() {
    use std::io::Write;

    let (dir, registry) = setup();
    let path = dir.path().join("services.routes");
    std::fs::write(&path, "route add a / http://a/").unwrap();

    let mut services = registry.watch_services().await.unwrap();
    assert_eq!(next_program(&mut services).await, "route add a / http://a/");

    let mut file = std::fs::File::create(&path).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    file.write_all(b"route add b / ").unwrap();
    file.flush().unwrap();
    std::thread::sleep(Duration::from_millis(5));
    file.write_all(b"http://b/").unwrap();
    file.sync_all().unwrap();
    drop(file);

    assert_eq!(next_program(&mut services).await, "route add b / http://b/");
}

#[tokio::test]
async fn test_burst_of_writes_yields_final_content() {
    let (dir, registry) = setup();
    let path = dir.path().join("services.routes");
    let mut services = registry.watch_services().await.unwrap();
    assert_eq!(next_program(&mut services).await, "");

    for n in 1..=3 {
        std::fs::write(&path, format!("route add s{} / http://s{}/", n, n)).unwrap();
    }
    assert_eq!(next_program(&mut services).await, "route add s3 / http://s3/");
}

#[tokio::test]
async fn test_manual_write_read_and_conflict() {
    let (_dir, registry) = setup();

    let missing = registry.read_manual("").await.unwrap();
    assert_eq!(missing.version, 0);
    assert!(missing.value.is_empty());

    let v1 = registry
        .write_manual("", "route weight s / weight 0.5 tags \"canary\"", 0)
        .await
        .unwrap();
    let entry = registry.read_manual("manual").await.unwrap();
    assert_eq!(entry.version, v1);
    assert_eq!(entry.value, "route weight s / weight 0.5 tags \"canary\"");

    let err = registry.write_manual("manual", "route del s", 0).await.unwrap_err();
    assert!(matches!(err, Error::VersionConflict { expected: 0, .. }));

    registry.write_manual("manual", "route del s", v1).await.unwrap();
    assert_eq!(registry.read_manual("manual").await.unwrap().value, "route del s");
}

#[tokio::test]
async fn test_external_edit_invalidates_version() {
    let (dir, registry) = setup();
    let v1 = registry.write_manual("manual", "route del a", 0).await.unwrap();

    std::fs::write(dir.path().join("manual").join("manual"), "route del b").unwrap();

    let err = registry.write_manual("manual", "route del c", v1).await.unwrap_err();
    assert!(matches!(err, Error::VersionConflict { .. }));
}

#[tokio::test]
async fn test_manual_paths_and_program() {
    let (_dir, registry) = setup();
    registry.write_manual("manual", "route del s0", 0).await.unwrap();
    registry.write_manual("canary/b", "route del s2", 0).await.unwrap();

    assert_eq!(
        registry.manual_paths().await.unwrap(),
        vec!["canary/b", "manual"]
    );

    let mut manual = registry.watch_manual().await.unwrap();
    assert_eq!(next_program(&mut manual).await, "route del s2\nroute del s0");
}

#[tokio::test]
async fn test_manual_stream_follows_writes() {
    let (_dir, registry) = setup();
    registry.write_manual("a", "route del s1", 0).await.unwrap();

    let mut manual = registry.watch_manual().await.unwrap();
    assert_eq!(next_program(&mut manual).await, "route del s1");

    registry.write_manual("b", "route del s2", 0).await.unwrap();
    let mut program = next_program(&mut manual).await;
    // a burst of events may surface an intermediate state first
    while program != "route del s1\nroute del s2" {
        program = next_program(&mut manual).await;
    }
}
