//! Prometheus metrics for the election and relay protocol
//!
//! Metrics live in a dedicated registry; `gather()` renders the text
//! exposition format for whatever endpoint or log sink the host wires up.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_vec_with_registry, Encoder, IntCounter, IntCounterVec, IntGaugeVec, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Election rounds, labelled by outcome ("leader" or "follower")
pub static ELECTIONS_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "pushshare_elections_total",
        "Total number of leader elections run",
        &["outcome"],
        REGISTRY.clone()
    )
    .expect("Failed to register ELECTIONS_TOTAL")
});

/// 1 while the labelled process holds the leader role
///
/// Labelled by `process_id` so several façades in one OS process report
/// separately.
pub static IS_LEADER: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "pushshare_is_leader",
        "Whether this process currently owns the upstream stream",
        &["process_id"],
        REGISTRY.clone()
    )
    .expect("Failed to register IS_LEADER")
});

/// Live peers in the labelled process's membership view, self included
pub static MEMBERSHIP_SIZE: std::sync::LazyLock<IntGaugeVec> = std::sync::LazyLock::new(|| {
    register_int_gauge_vec_with_registry!(
        "pushshare_membership_size",
        "Number of live processes in the membership view",
        &["process_id"],
        REGISTRY.clone()
    )
    .expect("Failed to register MEMBERSHIP_SIZE")
});

/// Frames received from the push stream and forwarded on the bus
pub static FRAMES_RELAYED: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "pushshare_frames_relayed_total",
        "Total number of stream frames relayed onto the local bus",
        REGISTRY.clone()
    )
    .expect("Failed to register FRAMES_RELAYED")
});

/// Instances reported for removal, labelled by reason ("unknown" or "dead_peer")
pub static INSTANCES_COLLECTED: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "pushshare_instances_collected_total",
        "Total number of stale instances reported for removal",
        &["reason"],
        REGISTRY.clone()
    )
    .expect("Failed to register INSTANCES_COLLECTED")
});

/// Push stream failures
pub static STREAM_ERRORS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "pushshare_stream_errors_total",
        "Total number of push stream failures",
        REGISTRY.clone()
    )
    .expect("Failed to register STREAM_ERRORS")
});

/// Registration endpoint failures, labelled by operation
pub static REGISTRATION_FAILURES: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "pushshare_registration_failures_total",
        "Total number of failed registration calls",
        &["operation"],
        REGISTRY.clone()
    )
    .expect("Failed to register REGISTRATION_FAILURES")
});

/// Drop the per-process gauges of a process that left the group
pub fn forget_process(process_id: &str) {
    // Absent series are fine; the process may never have been counted
    let _ = IS_LEADER.remove_label_values(&[process_id]);
    let _ = MEMBERSHIP_SIZE.remove_label_values(&[process_id]);
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> crate::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| crate::Error::InvalidInput(e.to_string()))
}
