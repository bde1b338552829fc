//! Sync worker against a wiremock peer

use crate::common::{config_for, html, Workspace, SCHEMA};
use ampelopsis::storage::{SqliteStorage, Storage};
use ampelopsis::sync::SyncWorker;
use ampelopsis::volume::{Layout, Part};
use ampelopsis::AmpError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HEADER_BLOCK: &str = "HTTP/1.1 200 OK\r\ncontent-type: text/html\r\n\r\n";

/// Registers both instances and one document held by the peer
fn held_by_peer(storage: &mut SqliteStorage) -> (i64, i64, i64) {
    let own = storage.insert_instance("alpha").unwrap();
    let peer = storage.insert_instance("beta").unwrap();
    let (url_id, _) = storage.insert_url("http://example.com/page").unwrap();
    storage.mark_checked(url_id).unwrap();
    storage.set_locality(url_id, peer).unwrap();
    (own, peer, url_id)
}

async fn mount_peer(server: &MockServer, name: &str) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("[root]\ninstance={}\n", name)),
        )
        .mount(server)
        .await;
}

async fn mount_document(server: &MockServer, url_id: i64) {
    Mock::given(method("GET"))
        .and(path(format!("/{}/{}h", SCHEMA, url_id)))
        .respond_with(ResponseTemplate::new(200).set_body_string(HEADER_BLOCK))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/{}", SCHEMA, url_id)))
        .respond_with(html("<p>moved</p>"))
        .mount(server)
        .await;
}

async fn expect_deletes(server: &MockServer, url_id: i64, times: u64) {
    for name in [format!("{}", url_id), format!("{}h", url_id)] {
        Mock::given(method("DELETE"))
            .and(path(format!("/{}/{}", SCHEMA, name)))
            .respond_with(ResponseTemplate::new(200))
            .expect(times)
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_pull_then_delete_remotely() {
    let server = MockServer::start().await;
    let mut ws = Workspace::new();
    let mut storage = ws.storage();
    let (own, _, url_id) = held_by_peer(&mut storage);
    ws.config.instance.name = Some("alpha".to_string());

    mount_peer(&server, "beta").await;
    mount_document(&server, url_id).await;
    expect_deletes(&server, url_id, 1).await;

    let mut worker = SyncWorker::connect(storage, &ws.config, &server.uri())
        .await
        .unwrap();
    let stats = worker.run(true).await.unwrap();
    assert_eq!(stats.pulled, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(worker.storage().get_locality(url_id).unwrap(), Some(own));

    let layout = Layout::from_config(&ws.config);
    assert_eq!(
        std::fs::read(layout.loose_path(url_id, Part::Body)).unwrap(),
        b"<p>moved</p>"
    );
    assert_eq!(
        std::fs::read_to_string(layout.loose_path(url_id, Part::Headers)).unwrap(),
        HEADER_BLOCK
    );
}

#[tokio::test]
async fn test_failed_local_write_never_deletes() {
    let server = MockServer::start().await;
    let ws = Workspace::new();

    // A regular file where the storage root's parent should be
    let blocker = ws.dir.path().join("blocker");
    std::fs::write(&blocker, b"").unwrap();
    let mut config = config_for(
        std::path::Path::new(&ws.config.database.path),
        &blocker.join("store"),
    );
    config.instance.name = Some("alpha".to_string());

    let mut storage = ws.storage();
    let (_, peer, url_id) = held_by_peer(&mut storage);

    mount_peer(&server, "beta").await;
    mount_document(&server, url_id).await;
    expect_deletes(&server, url_id, 0).await;

    let mut worker = SyncWorker::connect(storage, &config, &server.uri())
        .await
        .unwrap();
    let stats = worker.run(true).await.unwrap();
    assert_eq!(stats.pulled, 0);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.released, 0);
    assert_eq!(worker.storage().get_locality(url_id).unwrap(), Some(peer));
}

#[tokio::test]
async fn test_missing_peer_document_is_skipped() {
    let server = MockServer::start().await;
    let mut ws = Workspace::new();
    let mut storage = ws.storage();
    let (_, peer, url_id) = held_by_peer(&mut storage);
    ws.config.instance.name = Some("alpha".to_string());

    mount_peer(&server, "beta").await;
    Mock::given(method("GET"))
        .and(path(format!("/{}/{}h", SCHEMA, url_id)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    expect_deletes(&server, url_id, 0).await;

    let mut worker = SyncWorker::connect(storage, &ws.config, &server.uri())
        .await
        .unwrap();
    let stats = worker.run(true).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(worker.storage().get_locality(url_id).unwrap(), Some(peer));
}

#[tokio::test]
async fn test_handshake_with_self_is_fatal() {
    let server = MockServer::start().await;
    let mut ws = Workspace::new();
    let mut storage = ws.storage();
    held_by_peer(&mut storage);
    ws.config.instance.name = Some("alpha".to_string());

    mount_peer(&server, "alpha").await;

    match SyncWorker::connect(storage, &ws.config, &server.uri()).await {
        Err(e @ AmpError::Handshake(_)) => assert!(e.is_fatal()),
        Err(e) => panic!("Expected a handshake failure, got {}", e),
        Ok(_) => panic!("Handshake with self must fail"),
    }
}

#[tokio::test]
async fn test_handshake_without_any_instance_is_fatal() {
    let server = MockServer::start().await;
    let ws = Workspace::new();
    mount_peer(&server, "").await;

    let result = SyncWorker::connect(ws.storage(), &ws.config, &server.uri()).await;
    assert!(matches!(result, Err(AmpError::Handshake(_))));
}

#[tokio::test]
async fn test_handshake_with_unregistered_peer() {
    let server = MockServer::start().await;
    let mut ws = Workspace::new();
    let mut storage = ws.storage();
    storage.insert_instance("alpha").unwrap();
    ws.config.instance.name = Some("alpha".to_string());

    mount_peer(&server, "gamma").await;

    let result = SyncWorker::connect(storage, &ws.config, &server.uri()).await;
    assert!(matches!(result, Err(AmpError::UnknownInstance(name)) if name == "gamma"));
}
