use tracing::trace;

// Lightweight metrics helpers; trace-based so they stay cheap and never
// panic when no recorder is installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "larder.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "larder.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn run_finished(store_id: i64, outcome: &'static str) {
    trace!(
        target = "larder.metrics",
        store_id = store_id,
        outcome = outcome,
        "run_finished"
    );
}

pub fn sweep_finished(processed: usize, failed: usize) {
    trace!(
        target = "larder.metrics",
        processed = processed as u64,
        failed = failed as u64,
        "sweep_finished"
    );
}
