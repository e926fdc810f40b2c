use tracing::trace;

// Trace-level counters; the Prometheus recorder is installed in main and
// rendered on /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(target = "agent.metrics", route = route, "requests_total_inc");
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "agent.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}
