//! Operational metrics (§10.4): a `prometheus` registry exposed at
//! `GET /metrics`, shaped after the teacher's `create_metrics`/
//! `NostrMetrics`. Ambient observability, not a feature the spec's
//! non-goals exclude.
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Counters and histograms threaded through the connection and dispatch
/// modules. Cheap to clone: every field is itself a clonable handle into
/// the shared registry.
#[derive(Clone)]
pub struct Metrics {
    pub connections: IntCounter,
    pub disconnects: IntCounterVec,
    pub cmd_req: IntCounter,
    pub cmd_event: IntCounter,
    pub cmd_close: IntCounter,
    /// Events delivered to clients, labeled `historical` or `fanout`.
    pub sent_events: IntCounterVec,
    pub query_seconds: Histogram,
    pub write_seconds: Histogram,
}

/// Build a fresh registry and the metric handles registered into it.
pub fn create_metrics() -> (Registry, Metrics) {
    let registry = Registry::new();

    let connections =
        IntCounter::with_opts(Opts::new("nostr_connections_total", "New connections")).unwrap();
    let disconnects = IntCounterVec::new(
        Opts::new("nostr_disconnects_total", "Client disconnects"),
        &["reason"],
    )
    .unwrap();
    let cmd_req = IntCounter::with_opts(Opts::new("nostr_cmd_req_total", "REQ commands")).unwrap();
    let cmd_event =
        IntCounter::with_opts(Opts::new("nostr_cmd_event_total", "EVENT commands")).unwrap();
    let cmd_close =
        IntCounter::with_opts(Opts::new("nostr_cmd_close_total", "CLOSE commands")).unwrap();
    let sent_events = IntCounterVec::new(
        Opts::new("nostr_events_sent_total", "Events sent to clients"),
        &["source"],
    )
    .unwrap();
    let query_seconds = Histogram::with_opts(HistogramOpts::new(
        "nostr_query_seconds",
        "Historical filter query times",
    ))
    .unwrap();
    let write_seconds = Histogram::with_opts(HistogramOpts::new(
        "nostr_events_write_seconds",
        "Event write-path times",
    ))
    .unwrap();

    registry.register(Box::new(connections.clone())).unwrap();
    registry.register(Box::new(disconnects.clone())).unwrap();
    registry.register(Box::new(cmd_req.clone())).unwrap();
    registry.register(Box::new(cmd_event.clone())).unwrap();
    registry.register(Box::new(cmd_close.clone())).unwrap();
    registry.register(Box::new(sent_events.clone())).unwrap();
    registry.register(Box::new(query_seconds.clone())).unwrap();
    registry.register(Box::new(write_seconds.clone())).unwrap();

    (
        registry,
        Metrics {
            connections,
            disconnects,
            cmd_req,
            cmd_event,
            cmd_close,
            sent_events,
            query_seconds,
            write_seconds,
        },
    )
}
