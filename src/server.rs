//! HTTP/WebSocket front door (§6).
//!
//! `/` upgrades to the persistent duplex connection protocol handled by
//! [`crate::connection`] (C8); everything else is the ancillary HTTP
//! surface sketched in §6 as an external collaborator around the core -
//! a one-shot REST bridge for REQ/EVENT, the Blossom blob GET/HEAD/POST
//! endpoints, and a `/metrics` scrape target. None of this participates
//! in the subscription/fan-out engine; it only calls into it.
use crate::blossom;
use crate::config::Settings;
use crate::connection::{self, ConnectionContext};
use crate::db::Storage;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::filter::FilterSet;
use crate::metrics;
use crate::query::{self, QueryOutcome};
use crate::registry::Registry;
use crate::validator;
use crate::writer::{self, WriteOutcome};
use hyper::header::{self, HeaderMap};
use hyper::service::{make_service_fn, service_fn};
use hyper::server::conn::AddrStream;
use hyper::upgrade;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Registry as PromRegistry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tungstenite::handshake;
use tungstenite::protocol::{Role, WebSocketConfig};
use tracing::{debug, error, info, warn};

fn status_and_text(status: StatusCode, msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(msg))
        .expect("static response builds")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("json response builds")
}

fn get_header_string(name: &str, headers: &HeaderMap) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

/// Negotiate the `/` WebSocket upgrade, then hand the upgraded stream off
/// to [`connection::handle`] on its own task. The handshake response must
/// be returned synchronously; everything after the upgrade runs detached.
async fn handle_upgrade(mut request: Request<Body>, ctx: ConnectionContext, remote_addr: SocketAddr) -> Response<Body> {
    match handshake::server::create_response_with_body(&request, Body::empty) {
        Ok(response) => {
            tokio::spawn(async move {
                match upgrade::on(&mut request).await {
                    Ok(upgraded) => {
                        let config = WebSocketConfig {
                            max_send_queue: Some(1024),
                            max_message_size: ctx.settings.limits.max_ws_message_bytes,
                            max_frame_size: ctx.settings.limits.max_ws_frame_bytes,
                            ..Default::default()
                        };
                        let ws_stream =
                            WebSocketStream::from_raw_socket(upgraded, Role::Server, Some(config)).await;
                        debug!(%remote_addr, "connection upgraded to websocket");
                        connection::handle(ws_stream, ctx).await;
                    }
                    Err(e) => warn!(%remote_addr, "websocket upgrade failed: {e}"),
                }
            });
            response
        }
        Err(e) => {
            warn!("websocket handshake response failed: {e}");
            status_and_text(StatusCode::BAD_REQUEST, "failed to negotiate websocket upgrade")
        }
    }
}

/// `GET /` and `POST /` with a JSON body (§6): a one-shot bridge that
/// multiplexes REQ or EVENT over plain HTTP for clients that can't hold a
/// persistent connection open. A body carrying `id` and `sig` is treated
/// as an EVENT submission; anything else is treated as a single filter.
async fn rest_bridge(body: hyper::body::Bytes, ctx: &ConnectionContext) -> Response<Body> {
    let value: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, serde_json::json!({"error": e.to_string()})),
    };
    if value.get("id").is_some() && value.get("sig").is_some() {
        rest_event(value, ctx).await
    } else {
        rest_filter(value, ctx).await
    }
}

async fn rest_event(value: serde_json::Value, ctx: &ConnectionContext) -> Response<Body> {
    let event = match Event::from_json(&value.to_string()) {
        Ok(e) => e,
        Err(e) => {
            return json_response(
                StatusCode::OK,
                serde_json::json!(["OK", serde_json::Value::Null, false, e.to_string()]),
            )
        }
    };
    let id = event.id.clone();
    if let Err(e) = validator::validate(&event, &ctx.settings.authorization) {
        return json_response(StatusCode::OK, serde_json::json!(["OK", id, false, e.to_string()]));
    }

    let storage = ctx.storage.clone();
    let retry = ctx.settings.limits.write_retry_attempts;
    let write_event = event.clone();
    let outcome = match tokio::task::spawn_blocking(move || writer::write(&storage, &write_event, retry)).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            crate::error::abort_if_fatal(&e);
            return json_response(StatusCode::OK, serde_json::json!(["OK", id, false, e.to_string()]));
        }
        Err(e) => {
            error!("write task panicked: {e}");
            return status_and_text(StatusCode::INTERNAL_SERVER_ERROR, "write task failed");
        }
    };

    let (accepted, message) = match outcome {
        WriteOutcome::Stored => (true, String::new()),
        WriteOutcome::Duplicate => (true, "duplicate: already have this event".to_owned()),
    };
    if matches!(outcome, WriteOutcome::Stored) {
        let admitted = admitted_kinds(&ctx.settings);
        dispatch::fanout(
            &ctx.storage,
            &ctx.registry,
            &admitted,
            &event,
            ctx.settings.limits.fanout_pacing(),
            &ctx.metrics,
        )
        .await;
    }
    json_response(StatusCode::OK, serde_json::json!(["OK", id, accepted, message]))
}

async fn rest_filter(value: serde_json::Value, ctx: &ConnectionContext) -> Response<Body> {
    let filters = match FilterSet::from_values(std::slice::from_ref(&value)) {
        Ok(f) => f,
        Err(e) => return json_response(StatusCode::BAD_REQUEST, serde_json::json!({"error": e.to_string()})),
    };
    let admitted = admitted_kinds(&ctx.settings);
    let plan = match query::compile(&filters, &admitted) {
        QueryOutcome::Admitted(plan) => plan,
        QueryOutcome::Rejected => return json_response(StatusCode::OK, serde_json::json!([])),
    };
    let storage = ctx.storage.clone();
    match tokio::task::spawn_blocking(move || storage.query(&plan)).await {
        Ok(Ok(rows)) => json_response(StatusCode::OK, serde_json::json!(rows)),
        Ok(Err(e)) => {
            crate::error::abort_if_fatal(&e);
            json_response(StatusCode::OK, serde_json::json!({"error": e.to_string()}))
        }
        Err(e) => {
            error!("query task panicked: {e}");
            status_and_text(StatusCode::INTERNAL_SERVER_ERROR, "query task failed")
        }
    }
}

fn admitted_kinds(settings: &Settings) -> std::collections::HashSet<u16> {
    settings.authorization.admitted_kinds.iter().copied().collect()
}

/// `GET|HEAD /<64-hex>[.<ext>]` (§6): serve a stored blob by its SHA-256
/// hash, sniffing its content type from the file's bytes.
async fn serve_blob(path: &str, method: &Method, settings: &Settings) -> Response<Body> {
    let tail = path.trim_start_matches('/');
    let Some((hash, _ext)) = blossom::split_hash_and_ext(tail) else {
        return status_and_text(StatusCode::NOT_FOUND, "not found");
    };
    let directory = Path::new(&settings.blossom.directory);
    let Some(found) = blossom::locate(directory, hash) else {
        return status_and_text(StatusCode::NOT_FOUND, "not found");
    };
    let bytes = match tokio::fs::read(&found).await {
        Ok(b) => b,
        Err(e) => {
            error!("failed to read blob {}: {e}", found.display());
            return status_and_text(StatusCode::INTERNAL_SERVER_ERROR, "failed to read blob");
        }
    };
    let content_type = blossom::content_type_for(&found, &bytes);
    let body = if *method == Method::HEAD { Body::empty() } else { Body::from(bytes.clone()) };
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, bytes.len())
        .body(body)
        .expect("blob response builds")
}

/// `POST /upload` (§6): stream the body to the blob directory, named by
/// its SHA-256 hash, and report the result.
async fn handle_upload(request: Request<Body>, settings: &Settings) -> Response<Body> {
    let content_type = get_header_string(header::CONTENT_TYPE.as_str(), request.headers());
    let ext = content_type.as_deref().and_then(ext_for_content_type);
    let body = match hyper::body::to_bytes(request.into_body()).await {
        Ok(b) => b,
        Err(e) => {
            return json_response(StatusCode::BAD_REQUEST, serde_json::json!({"error": e.to_string()}))
        }
    };
    let directory = Path::new(&settings.blossom.directory);
    match blossom::store(directory, &body, ext.as_deref(), settings.blossom.max_upload_bytes).await {
        Ok(blob) => json_response(StatusCode::OK, serde_json::to_value(&blob).expect("blob serializes")),
        Err(e) => json_response(StatusCode::BAD_REQUEST, serde_json::json!({"error": e.to_string()})),
    }
}

fn ext_for_content_type(content_type: &str) -> Option<String> {
    let bare = content_type.split(';').next().unwrap_or(content_type).trim();
    mime_guess::get_mime_extensions_str(bare)
        .and_then(|exts| exts.first())
        .map(|ext| (*ext).to_owned())
}

async fn handle_web_request(
    mut request: Request<Body>,
    remote_addr: SocketAddr,
    ctx: ConnectionContext,
    prom_registry: PromRegistry,
) -> std::result::Result<Response<Body>, Infallible> {
    let is_upgrade = request.headers().contains_key(header::UPGRADE);
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let response = if path == "/" && is_upgrade {
        handle_upgrade(request, ctx, remote_addr).await
    } else if path == "/" && method == Method::POST {
        match hyper::body::to_bytes(request.into_body()).await {
            Ok(body) => rest_bridge(body, &ctx).await,
            Err(_) => status_and_text(StatusCode::BAD_REQUEST, "failed to read request body"),
        }
    } else if path == "/" {
        status_and_text(StatusCode::OK, "please use a Nostr client to connect")
    } else if path == "/metrics" {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&prom_registry.gather(), &mut buffer) {
            error!("failed to encode metrics: {e}");
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from(buffer))
            .expect("metrics response builds")
    } else if path == "/upload" && method == Method::POST {
        handle_upload(request, &ctx.settings).await
    } else if method == Method::GET || method == Method::HEAD {
        serve_blob(&path, &method, &ctx.settings).await
    } else {
        status_and_text(StatusCode::NOT_FOUND, "not found")
    };
    Ok(response)
}

async fn wait_for_shutdown_signal() {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down due to SIGINT"),
        _ = term.recv() => info!("shutting down due to SIGTERM"),
    }
}

/// Bind the relay's listening socket, open storage, and serve until a
/// shutdown signal arrives (§10.5). Builds its own multi-threaded runtime
/// so the binary's `main` stays a plain synchronous entrypoint.
pub fn start_server(settings: Settings) -> Result<()> {
    if !Path::new(&settings.database.data_directory).is_dir() {
        error!("configured database directory does not exist");
        return Err(Error::DatabaseDirError);
    }
    let addr = format!("{}:{}", settings.network.address.trim(), settings.network.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|_| Error::BadInput(format!("listening address {addr} is not valid")))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(settings.limits.max_blocking_threads)
        .build()
        .expect("failed to build the tokio runtime");

    rt.block_on(async move {
        let storage = Storage::open(Path::new(&settings.database.data_directory))?;
        let registry = Arc::new(Registry::new());
        let settings = Arc::new(settings);
        let (prom_registry, metrics) = metrics::create_metrics();
        let metrics = Arc::new(metrics);

        let ctx = ConnectionContext {
            storage,
            registry,
            settings,
            metrics,
        };

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            let _ = signal_tx.send(());
        });
        let mut shutdown_rx = shutdown_tx.subscribe();

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            let ctx = ctx.clone();
            let prom_registry = prom_registry.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                    handle_web_request(request, remote_addr, ctx.clone(), prom_registry.clone())
                }))
            }
        });

        info!(%socket_addr, "listening");
        let server = Server::bind(&socket_addr)
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });
        if let Err(e) = server.await {
            error!("server error: {e}");
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ext_for_content_type_strips_parameters_and_maps_known_types() {
        assert_eq!(ext_for_content_type("image/png"), Some("png".to_owned()));
        assert_eq!(ext_for_content_type("image/png; charset=binary"), Some("png".to_owned()));
        assert_eq!(ext_for_content_type("application/x-bogus-type"), None);
    }
}
