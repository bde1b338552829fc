//! Fetch and parse cycles against a wiremock host

use crate::common::{html, Workspace};
use ampelopsis::crawler::{seed, FetchStats, Fetcher, Parser};
use ampelopsis::storage::{SqliteStorage, Storage};
use ampelopsis::volume::{Layout, Part};
use ampelopsis::AmpError;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOST: &str = "127.0.0.1";

fn seed_urls(storage: &mut SqliteStorage, urls: &[String]) -> usize {
    seed(storage, &[HOST.to_string()], urls, None, false).expect("Failed to seed")
}

async fn fetch_once(
    ws: &Workspace,
    storage: SqliteStorage,
) -> (SqliteStorage, Result<FetchStats, AmpError>) {
    let mut fetcher = Fetcher::new(storage, &ws.config).expect("Failed to create fetcher");
    let result = fetcher.run(true).await;
    (fetcher.into_storage(), result)
}

#[tokio::test]
async fn test_fetch_parse_and_redirect() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(r#"<html><body><a href="/a">a</a></body></html>"#))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", format!("{}/a/", base)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/a/"))
        .respond_with(html("<p>leaf</p>"))
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    assert_eq!(seed_urls(&mut storage, &[format!("{}/", base)]), 1);

    let (storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().fetched, 1);

    let mut parser = Parser::new(storage, &ws.config).unwrap();
    let stats = parser.run(true).await.unwrap();
    assert_eq!(stats.parsed, 1);
    assert_eq!(stats.enqueued, 1);
    let storage = parser.into_storage();

    let (storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().fetched, 1);

    let a = storage.get_url_id(&format!("{}/a", base)).unwrap().unwrap();
    let a_slash = storage.get_url_id(&format!("{}/a/", base)).unwrap().unwrap();
    assert_eq!(storage.get_redirect(a).unwrap(), Some(a_slash));
    assert!(storage.is_checked(a).unwrap());
    assert!(storage.is_checked(a_slash).unwrap());

    let layout = Layout::from_config(&ws.config);
    let body = std::fs::read(layout.loose_path(a_slash, Part::Body)).unwrap();
    assert_eq!(body, b"<p>leaf</p>");
    let headers = std::fs::read_to_string(layout.loose_path(a_slash, Part::Headers)).unwrap();
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(!layout.loose_path(a, Part::Headers).exists());
}

#[tokio::test]
async fn test_redirect_onto_fetched_url_is_alias() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html("<p>home</p>"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/home"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", format!("{}/", base)))
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    seed_urls(&mut storage, &[format!("{}/", base)]);
    let (mut storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().fetched, 1);

    seed_urls(&mut storage, &[format!("{}/home", base)]);
    let (storage, result) = fetch_once(&ws, storage).await;
    let stats = result.unwrap();
    assert_eq!(stats.aliased, 1);
    assert_eq!(stats.fetched, 0);

    let home = storage.get_url_id(&format!("{}/home", base)).unwrap().unwrap();
    assert!(storage.is_checked(home).unwrap());
    assert_eq!(storage.get_redirect(home).unwrap(), None);
}

#[tokio::test]
async fn test_retry_after_holds_host() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy"))
        .respond_with(ResponseTemplate::new(503).insert_header("retry-after", "120"))
        .expect(1)
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    seed_urls(&mut storage, &[format!("{}/busy", server.uri())]);

    let before = chrono::Utc::now().timestamp();
    let (storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().failed, 1);

    let hosts = storage.load_hosts(None).unwrap();
    let hold = hosts[0].hold_until.expect("Host should be held");
    assert!(hold >= before + 119);

    let busy = storage
        .get_url_id(&format!("{}/busy", server.uri()))
        .unwrap()
        .unwrap();
    assert!(storage.has_download_error(busy).unwrap());
}

#[tokio::test]
async fn test_health_breach_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut ws = Workspace::new();
    ws.config.health.interval = 2;
    ws.config.health.threshold = 50;

    let mut storage = ws.storage();
    seed_urls(
        &mut storage,
        &[
            format!("{}/one", server.uri()),
            format!("{}/two", server.uri()),
        ],
    );

    let (_, result) = fetch_once(&ws, storage).await;
    match result {
        Err(e @ AmpError::HealthCheck { .. }) => assert!(e.is_fatal()),
        other => panic!("Expected a health check failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unlisted_content_type_keeps_headers_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/report"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(b"%PDF-1.4".to_vec(), "application/pdf"),
        )
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    seed_urls(&mut storage, &[format!("{}/report", server.uri())]);

    let (mut storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().rejected, 1);

    let id = storage
        .get_url_id(&format!("{}/report", server.uri()))
        .unwrap()
        .unwrap();
    let layout = Layout::from_config(&ws.config);
    assert!(layout.loose_path(id, Part::Headers).exists());
    assert!(!layout.loose_path(id, Part::Body).exists());
    assert_eq!(storage.dequeue_parse().unwrap(), None);
}

#[tokio::test]
async fn test_refetch_overwrites_stale_loose_files() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(html("<p>fresh</p>"))
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    let url = format!("{}/page", server.uri());
    seed_urls(&mut storage, &[url.clone()]);
    let id = storage.get_url_id(&url).unwrap().unwrap();

    // Left behind by a fetcher killed before it marked the URL checked
    let layout = Layout::from_config(&ws.config);
    let body_path = layout.loose_path(id, Part::Body);
    std::fs::create_dir_all(body_path.parent().unwrap()).unwrap();
    std::fs::write(&body_path, b"<p>stale and much longer than the new page</p>").unwrap();
    assert!(!storage.is_checked(id).unwrap());

    let (mut storage, result) = fetch_once(&ws, storage).await;
    assert_eq!(result.unwrap().fetched, 1);

    assert_eq!(std::fs::read(&body_path).unwrap(), b"<p>fresh</p>");
    assert!(storage.is_checked(id).unwrap());
    assert!(storage.get_content(id).unwrap().is_none());
    assert_eq!(storage.dequeue_parse().unwrap(), Some(id));
    assert_eq!(storage.dequeue_parse().unwrap(), None);
}

#[tokio::test]
async fn test_conflicting_redirect_is_fatal() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", format!("{}/y", base)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(html("<p>y</p>"))
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    seed_urls(&mut storage, &[format!("{}/a", base)]);
    let a = storage.get_url_id(&format!("{}/a", base)).unwrap().unwrap();
    let (x, _) = storage.insert_url(&format!("{}/x", base)).unwrap();
    assert_eq!(storage.insert_redirect(a, x).unwrap(), x);

    let (storage, result) = fetch_once(&ws, storage).await;
    match result {
        Err(e @ AmpError::DataIntegrity { .. }) => assert!(e.is_fatal()),
        other => panic!("Expected a redirect conflict, got {:?}", other),
    }
    assert_eq!(storage.get_redirect(a).unwrap(), Some(x));
}

#[tokio::test]
async fn test_shared_redirect_target_is_stored_once() {
    let server = MockServer::start().await;
    let base = server.uri();
    for source in ["/a", "/b"] {
        Mock::given(method("GET"))
            .and(path(source))
            .respond_with(
                ResponseTemplate::new(301).insert_header("location", format!("{}/c", base)),
            )
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(html("<p>shared</p>"))
        .mount(&server)
        .await;

    let ws = Workspace::new();
    let mut storage = ws.storage();
    let sources = [format!("{}/a", base), format!("{}/b", base)];
    assert_eq!(seed_urls(&mut storage, &sources), 2);

    let (mut storage, result) = fetch_once(&ws, storage).await;
    let stats = result.unwrap();
    assert_eq!(stats.fetched, 1);
    assert_eq!(stats.failed, 0);

    let c = storage.get_url_id(&format!("{}/c", base)).unwrap().unwrap();
    assert!(storage.is_checked(c).unwrap());
    for source in &sources {
        let id = storage.get_url_id(source).unwrap().unwrap();
        assert!(storage.is_checked(id).unwrap());
    }

    let layout = Layout::from_config(&ws.config);
    assert_eq!(
        std::fs::read(layout.loose_path(c, Part::Body)).unwrap(),
        b"<p>shared</p>"
    );
    assert_eq!(storage.dequeue_parse().unwrap(), Some(c));
    assert_eq!(storage.dequeue_parse().unwrap(), None);
}
