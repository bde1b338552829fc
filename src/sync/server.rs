//! Storage HTTP server
//!
//! Serves documents and volumes held by this instance to sync peers:
//! - `GET /` answers the handshake with the configured instance name
//! - `GET`/`DELETE /[schema/]{id}` and `/[schema/]{id}h` for document bodies and headers
//! - `GET`/`DELETE /[schema/]{volume_id}.zip` for whole volumes
//!
//! Every request opens its own queue store connection on the blocking pool.

use crate::config::{Config, DatabaseConfig};
use crate::policy::resolve_instance;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::sync::bridge::{delete_storage, StorageBridge, VolumeBridge};
use crate::volume::{parse_member_name, Layout, Part, VolumeHolder};
use crate::AmpError;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const VOLUME_CHUNK_SIZE: usize = 64 * 1024;

/// Shared state for the storage server
#[derive(Clone)]
pub struct AppState {
    database: Arc<DatabaseConfig>,
    layout: Arc<Layout>,
    instance_name: Option<String>,
    instance_id: Option<i64>,
}

impl AppState {
    /// Resolves the instance once; an unregistered name is fatal
    pub fn new(config: &Config) -> Result<Self, AmpError> {
        let storage = SqliteStorage::open(&config.database)?;
        let instance_id = resolve_instance(&storage, config.instance.name.as_deref())?;

        Ok(Self {
            database: Arc::new(config.database.clone()),
            layout: Arc::new(Layout::from_config(config)),
            instance_name: config.instance.name.clone(),
            instance_id,
        })
    }
}

/// What a request path names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Document { url_id: i64, part: Part },
    Volume(i64),
}

/// Parses `/[schema/]name`; a schema prefix must match our own
pub fn parse_target(path: &str, schema: &str) -> Option<Target> {
    let path = path.strip_prefix('/')?;
    let name = match path.split_once('/') {
        Some((prefix, name)) if prefix == schema => name,
        Some(_) => return None,
        None => path,
    };

    if let Some(digits) = name.strip_suffix(".zip") {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return digits.parse().ok().map(Target::Volume);
    }

    parse_member_name(name).map(|(url_id, part)| Target::Document { url_id, part })
}

/// Builds the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .fallback(serve_target)
        .with_state(state)
}

/// Start the storage server on the configured port
pub async fn serve(config: &Config) -> Result<(), AmpError> {
    let state = AppState::new(config)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Storage server listening on http://{}", addr);
    serve_on(listener, state).await
}

/// Serves on an already bound listener
pub async fn serve_on(listener: TcpListener, state: AppState) -> Result<(), AmpError> {
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

async fn serve_root(State(state): State<AppState>) -> Response {
    let blob = format!(
        "[root]\ninstance={}\n",
        state.instance_name.as_deref().unwrap_or_default()
    );
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], blob).into_response()
}

async fn serve_target(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let target = match parse_target(uri.path(), state.layout.schema()) {
        Some(target) => target,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    if method != Method::GET && method != Method::DELETE {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let result = match target {
        Target::Volume(volume_id) if method == Method::GET => get_volume(&state, volume_id).await,
        _ => {
            let blocking = state.clone();
            tokio::task::spawn_blocking(move || handle_blocking(&blocking, &method, target))
                .await
                .map_err(AmpError::from)
                .and_then(|result| result)
        }
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::error!("{} {} failed: {}", uri.path(), target_label(target), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn target_label(target: Target) -> &'static str {
    match target {
        Target::Document { part: Part::Body, .. } => "body",
        Target::Document { .. } => "headers",
        Target::Volume(_) => "volume",
    }
}

fn handle_blocking(
    state: &AppState,
    method: &Method,
    target: Target,
) -> Result<Response, AmpError> {
    let storage = SqliteStorage::open(&state.database)?;
    match target {
        Target::Document { url_id, part } if *method == Method::GET => {
            get_document(state, &storage, url_id, part)
        }
        Target::Document { url_id, part } => delete_document(state, &storage, url_id, part),
        Target::Volume(volume_id) => delete_volume(state, &storage, volume_id),
    }
}

fn get_document(
    state: &AppState,
    storage: &SqliteStorage,
    url_id: i64,
    part: Part,
) -> Result<Response, AmpError> {
    if !known(storage, url_id)?
        || !StorageBridge::new(storage, state.instance_id).has_local_data(url_id)?
    {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let mut holder = VolumeHolder::new(state.layout.as_ref().clone());
    let content_type = match part {
        Part::Headers => "text/plain".to_string(),
        Part::Body => holder
            .content_type(storage, url_id)?
            .unwrap_or_else(|| "text/plain".to_string()),
    };

    match holder.read(storage, url_id, part)? {
        Some(bytes) => Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response()),
        // Rejected content types and alias sources have no body
        None if part == Part::Body => Ok(StatusCode::NO_CONTENT.into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

fn delete_document(
    state: &AppState,
    storage: &SqliteStorage,
    url_id: i64,
    part: Part,
) -> Result<Response, AmpError> {
    if !known(storage, url_id)? {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    // Archived data is shared, not owned by one replica
    if storage.get_content(url_id)?.is_some() {
        tracing::warn!("Refusing to delete archived URL {}", url_id);
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    if !StorageBridge::new(storage, state.instance_id).has_remote_instance(url_id)? {
        tracing::warn!("Refusing to delete URL {} not owned elsewhere", url_id);
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    let removed = delete_storage(&state.layout, url_id, part)?;
    tracing::info!("Deleted {:?} of URL {} (present: {})", part, url_id, removed);
    Ok(StatusCode::OK.into_response())
}

fn delete_volume(
    state: &AppState,
    storage: &SqliteStorage,
    volume_id: i64,
) -> Result<Response, AmpError> {
    if !storage.volume_exists(volume_id)? {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    if !VolumeBridge::new(storage, state.instance_id).has_remote_instance(volume_id)? {
        tracing::warn!("Refusing to delete volume {} not held elsewhere", volume_id);
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    match std::fs::remove_file(state.layout.volume_path(volume_id)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tracing::info!("Deleted volume {}", volume_id);
    Ok(StatusCode::OK.into_response())
}

/// Streams a whole volume file
async fn get_volume(state: &AppState, volume_id: i64) -> Result<Response, AmpError> {
    let check = state.clone();
    let local = tokio::task::spawn_blocking(move || -> Result<bool, AmpError> {
        let storage = SqliteStorage::open(&check.database)?;
        VolumeBridge::new(&storage, check.instance_id).has_local_volume(volume_id)
    })
    .await??;
    if !local {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let file = match tokio::fs::File::open(state.layout.volume_path(volume_id)).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StatusCode::NOT_FOUND.into_response())
        }
        Err(e) => return Err(e.into()),
    };

    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; VOLUME_CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((buf, file)))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/zip")],
        Body::from_stream(chunks),
    )
        .into_response())
}

fn known(storage: &SqliteStorage, url_id: i64) -> Result<bool, AmpError> {
    match storage.get_url(url_id) {
        Ok(_) => Ok(true),
        Err(StorageError::UrlNotFound(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
