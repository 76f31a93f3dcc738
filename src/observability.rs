//! Metric names. Emission is a no-op until a recorder is installed.

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::engine::ValidationError;
use crate::engine::patch::PatchOutcome;

/// Counter: patch computations on save. Labels: outcome.
pub const PATCHES_TOTAL: &str = "sesiones_patches_total";

/// Counter: saves refused by the planifiable gate.
pub const SAVES_GATED_TOTAL: &str = "sesiones_saves_gated_total";

/// Counter: persist calls rejected by the collaborator.
pub const SAVE_FAILURES_TOTAL: &str = "sesiones_save_failures_total";

/// Histogram: persist round-trip in seconds.
pub const SAVE_DURATION_SECONDS: &str = "sesiones_save_duration_seconds";

/// Counter: remote availability lookups that degraded to local-only.
/// Labels: reason.
pub const AVAILABILITY_FALLBACKS_TOTAL: &str = "sesiones_availability_fallbacks_total";

/// Histogram: remote availability lookup in seconds.
pub const AVAILABILITY_FETCH_DURATION_SECONDS: &str = "sesiones_availability_fetch_duration_seconds";

/// Counter: sibling snapshots rejected as older than the one held.
pub const STALE_SNAPSHOTS_TOTAL: &str = "sesiones_stale_snapshots_total";

/// Serve `/metrics` on `port`. Without a port nothing is installed.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a patch result to a short label for metrics.
pub fn outcome_label(outcome: &Result<PatchOutcome, ValidationError>) -> &'static str {
    match outcome {
        Ok(PatchOutcome::NoOp) => "noop",
        Ok(PatchOutcome::Patch(_)) => "patch",
        Err(ValidationError::InvalidStart) => "invalid_start",
        Err(ValidationError::InvalidEnd) => "invalid_end",
        Err(ValidationError::InvalidRange) => "invalid_range",
    }
}
