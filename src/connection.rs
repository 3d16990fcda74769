//! Per-connection protocol handling (C8): the `REQ`/`EVENT`/`CLOSE` state
//! machine described in §4.6, wired to the storage, validator, writer,
//! registry, and dispatcher modules.
use crate::config::Settings;
use crate::db::Storage;
use crate::dispatch;
use crate::error::{self, Error, Result};
use crate::event::{Event, ReplaceClass};
use crate::filter::FilterSet;
use crate::metrics::Metrics;
use crate::query::{self, QueryOutcome};
use crate::registry::{EventSink, Registry};
use crate::validator;
use crate::writer::{self, WriteOutcome};
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Shared state every connection task needs a handle to.
#[derive(Clone)]
pub struct ConnectionContext {
    pub storage: Storage,
    pub registry: Arc<Registry>,
    pub settings: Arc<Settings>,
    pub metrics: Arc<Metrics>,
}

enum ClientFrame {
    Event(Event),
    Req(String, FilterSet),
    Close(String),
}

fn parse_frame(raw: &str) -> Result<ClientFrame> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| Error::ProtocolViolation(e.to_string()))?;
    let arr = value
        .as_array()
        .ok_or_else(|| Error::ProtocolViolation("frame must be a JSON array".into()))?;
    let cmd = arr
        .first()
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::ProtocolViolation("frame missing a command string".into()))?;
    match cmd {
        "EVENT" => {
            let payload = arr
                .get(1)
                .ok_or_else(|| Error::ProtocolViolation("EVENT frame missing payload".into()))?;
            let raw_event = serde_json::to_string(payload)?;
            Ok(ClientFrame::Event(Event::from_json(&raw_event)?))
        }
        "REQ" => {
            let sub_id = arr
                .get(1)
                .and_then(|s| s.as_str())
                .ok_or_else(|| Error::ProtocolViolation("REQ missing subscription id".into()))?
                .to_owned();
            let filters = FilterSet::from_values(&arr[2.min(arr.len())..])?;
            Ok(ClientFrame::Req(sub_id, filters))
        }
        "CLOSE" => {
            let sub_id = arr
                .get(1)
                .and_then(|s| s.as_str())
                .ok_or_else(|| Error::ProtocolViolation("CLOSE missing subscription id".into()))?
                .to_owned();
            Ok(ClientFrame::Close(sub_id))
        }
        other => Err(Error::ProtocolViolation(format!("unknown frame command: {other}"))),
    }
}

fn event_frame(sub_id: &str, event: &Event) -> String {
    serde_json::json!(["EVENT", sub_id, event]).to_string()
}

fn eose_frame(sub_id: &str) -> String {
    serde_json::json!(["EOSE", sub_id]).to_string()
}

fn ok_frame(id: &str, accepted: bool, message: &str) -> String {
    serde_json::json!(["OK", id, accepted, message]).to_string()
}

fn closed_frame(sub_id: &str, reason: &str) -> String {
    serde_json::json!(["CLOSED", sub_id, reason]).to_string()
}

fn notice_frame(message: &str) -> String {
    serde_json::json!(["NOTICE", message]).to_string()
}

/// Delivers fan-out events for one connection over an unbounded channel.
/// Sending never fails from the caller's perspective: a disconnected
/// receiver just means this connection is already tearing down.
struct ConnectionSink {
    tx: mpsc::UnboundedSender<(String, Event)>,
}

#[async_trait]
impl EventSink for ConnectionSink {
    async fn send_event(&self, sub_id: &str, event: &Event) -> Result<()> {
        let _ = self.tx.send((sub_id.to_owned(), event.clone()));
        Ok(())
    }
}

/// Drive one accepted WebSocket connection to completion.
///
/// The inbound-frame and fan-out-delivery branches of the `select!` below
/// never run concurrently with each other, which is what gives `REQ` its
/// queue-until-`EOSE` property (§9 decision on fan-out ordering): a fan-out
/// event that arrives for a subscription while its `REQ`'s historical query
/// is still being answered simply sits in the unbounded channel - nothing
/// reads it until the loop comes back around after `EOSE` has already been
/// written. No separate buffer is needed.
pub async fn handle<S>(ws: WebSocketStream<S>, ctx: ConnectionContext)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = Uuid::new_v4();
    let (mut ws_sink, mut ws_stream) = ws.split();
    let (fanout_tx, mut fanout_rx) = mpsc::unbounded_channel::<(String, Event)>();
    let sink: Arc<dyn EventSink> = Arc::new(ConnectionSink { tx: fanout_tx });
    let admitted: HashSet<u16> = ctx.settings.authorization.admitted_kinds.iter().copied().collect();
    ctx.metrics.connections.inc();

    let disconnect_reason = loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_inbound(&text, connection_id, &ctx, &admitted, &sink, &mut ws_sink).await {
                            let _ = ws_sink.send(Message::Text(notice_frame(&e.to_string()))).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break "closed",
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("websocket error: {e}");
                        break "error";
                    }
                }
            }
            delivery = fanout_rx.recv() => {
                match delivery {
                    Some((sub_id, event)) => {
                        let frame = event_frame(&sub_id, &event);
                        if ws_sink.send(Message::Text(frame)).await.is_err() {
                            break "error";
                        }
                    }
                    None => break "error",
                }
            }
        }
    };

    ctx.metrics.disconnects.with_label_values(&[disconnect_reason]).inc();
    ctx.registry.remove_all_for_connection(connection_id);
    debug!(connection_id = %connection_id, "connection closed");
}

async fn handle_inbound<S>(
    text: &str,
    connection_id: Uuid,
    ctx: &ConnectionContext,
    admitted: &HashSet<u16>,
    sink: &Arc<dyn EventSink>,
    ws_sink: &mut SplitSink<WebSocketStream<S>, Message>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match parse_frame(text)? {
        ClientFrame::Event(event) => {
            ctx.metrics.cmd_event.inc();
            handle_event(event, ctx, admitted, ws_sink).await
        }
        ClientFrame::Req(sub_id, filters) => {
            ctx.metrics.cmd_req.inc();
            handle_req(sub_id, filters, connection_id, ctx, admitted, sink, ws_sink).await
        }
        ClientFrame::Close(sub_id) => {
            ctx.metrics.cmd_close.inc();
            ctx.registry.remove(connection_id, &sub_id);
            ws_sink
                .send(Message::Text(closed_frame(&sub_id, "")))
                .await
                .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
            Ok(())
        }
    }
}

async fn handle_event<S>(
    event: Event,
    ctx: &ConnectionContext,
    admitted: &HashSet<u16>,
    ws_sink: &mut SplitSink<WebSocketStream<S>, Message>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = event.id.clone();
    let write_timer = Instant::now();
    let stored = if let Err(e) = validator::validate(&event, &ctx.settings.authorization) {
        Err(e)
    } else {
        let storage = ctx.storage.clone();
        let retry = ctx.settings.limits.write_retry_attempts;
        let write_event = event.clone();
        tokio::task::spawn_blocking(move || writer::write(&storage, &write_event, retry)).await?
    };
    ctx.metrics.write_seconds.observe(write_timer.elapsed().as_secs_f64());

    if let Err(e) = &stored {
        error::abort_if_fatal(e);
    }
    let (accepted, message) = match &stored {
        Ok(WriteOutcome::Stored) => (true, String::new()),
        Ok(WriteOutcome::Duplicate) => (true, "duplicate: already have this event".to_owned()),
        Err(e) => (false, e.to_string()),
    };
    ws_sink
        .send(Message::Text(ok_frame(&id, accepted, &message)))
        .await
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;

    if matches!(stored, Ok(WriteOutcome::Stored)) {
        dispatch::fanout(
            &ctx.storage,
            &ctx.registry,
            admitted,
            &event,
            ctx.settings.limits.fanout_pacing(),
            &ctx.metrics,
        )
        .await;
    }
    Ok(())
}

async fn handle_req<S>(
    sub_id: String,
    filters: FilterSet,
    connection_id: Uuid,
    ctx: &ConnectionContext,
    admitted: &HashSet<u16>,
    sink: &Arc<dyn EventSink>,
    ws_sink: &mut SplitSink<WebSocketStream<S>, Message>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let plan = match query::compile(&filters, admitted) {
        QueryOutcome::Admitted(plan) => plan,
        QueryOutcome::Rejected => {
            ws_sink
                .send(Message::Text(closed_frame(&sub_id, "")))
                .await
                .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
            return Ok(());
        }
    };

    // Register before querying: an event committed while the historical
    // query runs must reach this subscription either in the historical
    // result set or via fan-out, never neither.
    ctx.registry.add(connection_id, sub_id.clone(), filters, sink.clone());

    let storage = ctx.storage.clone();
    let query_timer = Instant::now();
    let rows = match tokio::task::spawn_blocking(move || storage.query(&plan)).await? {
        Ok(rows) => rows,
        Err(e) => {
            error::abort_if_fatal(&e);
            return Err(e);
        }
    };
    ctx.metrics.query_seconds.observe(query_timer.elapsed().as_secs_f64());

    for row in &rows {
        ws_sink
            .send(Message::Text(event_frame(&sub_id, row)))
            .await
            .map_err(|e| Error::ProtocolViolation(e.to_string()))?;
    }
    ctx.metrics.sent_events.with_label_values(&["historical"]).inc_by(rows.len() as u64);
    ws_sink
        .send(Message::Text(eose_frame(&sub_id)))
        .await
        .map_err(|e| Error::ProtocolViolation(e.to_string()))?;

    let ephemeral_ids: Vec<String> = rows
        .iter()
        .filter(|e| e.replace_class() == ReplaceClass::Ephemeral)
        .map(|e| e.id.clone())
        .collect();
    if !ephemeral_ids.is_empty() {
        let storage = ctx.storage.clone();
        tokio::task::spawn_blocking(move || {
            for id in ephemeral_ids {
                let _ = storage.delete_by_id(&id);
            }
        })
        .await?;
    }
    Ok(())
}
