//! Storage server over a real listener

use crate::common::{Workspace, SCHEMA};
use ampelopsis::storage::Storage;
use ampelopsis::sync::{serve_on, AppState};
use ampelopsis::volume::{Compressor, Layout, Part};
use reqwest::{Method, StatusCode};
use tokio::net::TcpListener;

const HEADER_BLOCK: &[u8] = b"HTTP/1.1 200 OK\r\ncontent-type: text/html; charset=utf-8\r\n\r\n";

struct Fixture {
    ws: Workspace,
    base: String,
    own: i64,
    /// Held here, with a body
    local: i64,
    /// Held here, headers only
    headless: i64,
    /// Held by the other instance
    remote: i64,
}

fn write_loose(layout: &Layout, url_id: i64, body: Option<&[u8]>) {
    let header_path = layout.loose_path(url_id, Part::Headers);
    std::fs::create_dir_all(header_path.parent().unwrap()).unwrap();
    if let Some(body) = body {
        std::fs::write(layout.loose_path(url_id, Part::Body), body).unwrap();
    }
    std::fs::write(header_path, HEADER_BLOCK).unwrap();
}

async fn start() -> Fixture {
    let mut ws = Workspace::new();
    ws.config.instance.name = Some("alpha".to_string());
    let layout = Layout::from_config(&ws.config);

    let mut storage = ws.storage();
    let own = storage.insert_instance("alpha").unwrap();
    let other = storage.insert_instance("beta").unwrap();

    let mut add = |url: &str, owner: i64, body: Option<&[u8]>| {
        let (url_id, _) = storage.insert_url(url).unwrap();
        storage.mark_checked(url_id).unwrap();
        storage.set_locality(url_id, owner).unwrap();
        write_loose(&layout, url_id, body);
        url_id
    };
    let local = add("http://example.com/", own, Some(&b"<p>local</p>"[..]));
    let headless = add("http://example.com/file.bin", own, None);
    let remote = add("http://example.net/", other, Some(&b"<p>remote</p>"[..]));

    let state = AppState::new(&ws.config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(serve_on(listener, state));

    Fixture {
        ws,
        base,
        own,
        local,
        headless,
        remote,
    }
}

async fn call(method: Method, url: String) -> reqwest::Response {
    reqwest::Client::new()
        .request(method, url)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_root_announces_instance() {
    let fx = start().await;
    let response = call(Method::GET, format!("{}/", fx.base)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.text().await.unwrap().contains("instance=alpha"));
}

#[tokio::test]
async fn test_get_document_parts() {
    let fx = start().await;

    let response = call(Method::GET, format!("{}/{}/{}", fx.base, SCHEMA, fx.local)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/html; charset=utf-8"
    );
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"<p>local</p>");

    let response = call(Method::GET, format!("{}/{}h", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), HEADER_BLOCK);

    let response = call(Method::GET, format!("{}/{}", fx.base, fx.headless)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_unknown_and_foreign_documents_are_not_found() {
    let fx = start().await;

    let response = call(Method::GET, format!("{}/999", fx.base)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = call(Method::GET, format!("{}/{}", fx.base, fx.remote)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = call(Method::GET, format!("{}/other/{}", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_other_methods_are_rejected() {
    let fx = start().await;
    let response = call(Method::POST, format!("{}/{}", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_delete_requires_remote_owner() {
    let fx = start().await;
    let layout = Layout::from_config(&fx.ws.config);

    let response = call(Method::DELETE, format!("{}/{}", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(layout.loose_path(fx.local, Part::Body).exists());

    for part in ["", "h"] {
        let url = format!("{}/{}/{}{}", fx.base, SCHEMA, fx.remote, part);
        let response = call(Method::DELETE, url).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert!(!layout.loose_path(fx.remote, Part::Body).exists());
    assert!(!layout.loose_path(fx.remote, Part::Headers).exists());
}

#[tokio::test]
async fn test_archived_documents_are_served_but_never_deleted() {
    let fx = start().await;
    let layout = Layout::from_config(&fx.ws.config);
    let mut storage = fx.ws.storage();

    let volumes = Compressor::new(&mut storage, &layout, u64::MAX, Some(fx.own))
        .compress_all()
        .unwrap();
    assert_eq!(volumes.len(), 1);
    let volume_id = volumes[0].volume_id;

    let response = call(Method::GET, format!("{}/{}", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"<p>local</p>");

    let response = call(Method::GET, format!("{}/{}.zip", fx.base, volume_id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/zip");
    let archive = response.bytes().await.unwrap();
    assert_eq!(
        archive.len() as u64,
        std::fs::metadata(layout.volume_path(volume_id)).unwrap().len()
    );

    let response = call(Method::DELETE, format!("{}/{}", fx.base, fx.local)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // Only this instance holds the volume
    let response = call(Method::DELETE, format!("{}/{}.zip", fx.base, volume_id)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(layout.volume_path(volume_id).exists());
}
