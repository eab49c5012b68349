//! Concurrent fan-out of one resolved query to every selected source.

use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::entities::ResolvedEntities;
use crate::intent::IntentKind;
use crate::sources::{NativeRecord, SourceError, SourceKind, SourceRegistry};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceQuerySpec {
    pub source: SourceKind,
    pub intent: IntentKind,
    pub resolved_entities: ResolvedEntities,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("query cancelled")]
pub struct Cancelled;

pub type SourceOutcome = (SourceKind, Result<Vec<NativeRecord>, SourceError>);

async fn query_one(
    spec: &SourceQuerySpec,
    registry: &SourceRegistry,
    per_source_timeout: Duration,
) -> SourceOutcome {
    let source = match registry.require(spec.source) {
        Ok(source) => source,
        Err(err) => return (spec.source, Err(SourceError::from(err))),
    };

    let call = source.query(&spec.resolved_entities, spec.intent);
    let result = match tokio::time::timeout(per_source_timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::timeout(per_source_timeout)),
    };

    match &result {
        Ok(records) => debug!(source = %spec.source, records = records.len(), "Source answered"),
        Err(err) => warn!(
            source = %spec.source,
            reason = %err.reason,
            "Source query failed: {}",
            err.detail
        ),
    }
    (spec.source, result)
}

/// Runs every source query concurrently and waits for all of them. A failure or
/// timeout in one source is reported in its slot and never affects the
/// others. Cancellation drops every in-flight call and returns no partial
/// results. Outcomes come back in `specs` order.
pub async fn dispatch(
    specs: &[SourceQuerySpec],
    registry: &SourceRegistry,
    per_source_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<SourceOutcome>, Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }

    let calls = specs
        .iter()
        .map(|spec| query_one(spec, registry, per_source_timeout));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(sources = specs.len(), "Dispatch cancelled");
            Err(Cancelled)
        }
        outcomes = join_all(calls) => Ok(outcomes),
    }
}
