//! Fan-out dispatcher (C7): after an event commits, decide which live
//! subscriptions it matches and deliver it to each (§4.7).
use crate::db::Storage;
use crate::error::Result;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::query::{self, QueryOutcome};
use crate::registry::Registry;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Re-evaluate `event` against every live subscription and deliver it to
/// the ones it matches.
///
/// Per §4.7, a subscription's filter set is re-checked by constraining it
/// to `ids = {event.id}` and compiling/running that constrained query
/// rather than matching in memory - this reuses the exact same admission
/// and filter semantics the historical query path uses, so fan-out can
/// never disagree with a `REQ` about what a filter matches. A short pace
/// delay between deliveries keeps one burst of fan-out from starving a
/// connection's ability to service new `REQ`/`CLOSE` frames (§5).
pub async fn fanout(
    storage: &Storage,
    registry: &Registry,
    admitted_kinds: &HashSet<u16>,
    event: &Event,
    pacing: Duration,
    metrics: &Metrics,
) {
    for sub in registry.snapshot() {
        let constrained = sub.filters.constrained_to_id(&event.id);
        let plan = match query::compile(&constrained, admitted_kinds) {
            QueryOutcome::Admitted(plan) => plan,
            QueryOutcome::Rejected => continue,
        };
        match matches(storage, plan).await {
            Ok(true) => {
                if let Err(e) = sub.sink.send_event(&sub.sub_id, event).await {
                    warn!(sub_id = %sub.sub_id, "fan-out delivery failed: {e}");
                    continue;
                }
                metrics.sent_events.with_label_values(&["fanout"]).inc();
                tokio::time::sleep(pacing).await;
            }
            Ok(false) => {}
            Err(e) => {
                crate::error::abort_if_fatal(&e);
                warn!(sub_id = %sub.sub_id, "fan-out re-query failed: {e}");
            }
        }
    }
    debug!(id = %event.id_prefix(), "fan-out complete");
}

async fn matches(storage: &Storage, plan: query::QueryPlan) -> Result<bool> {
    let storage = storage.clone();
    let rows = tokio::task::spawn_blocking(move || storage.query(&plan)).await??;
    Ok(!rows.is_empty())
}
