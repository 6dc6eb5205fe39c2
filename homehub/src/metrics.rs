use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tracing::{error, warn};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_messages_total",
        "Total messages received from MQTT"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "homehub_dropped_messages_total",
            "Inbound messages dropped, by reason"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref TELEMETRY_INGESTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_telemetry_ingested_total",
        "Telemetry readings written to the hot tier"
    ))
    .unwrap();
    pub static ref COMMANDS_ISSUED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_commands_issued_total",
        "Commands issued by the hub"
    ))
    .unwrap();
    pub static ref COMMANDS_RESOLVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "homehub_commands_resolved_total",
            "Commands resolved by an ack, by terminal status"
        ),
        &["status"]
    )
    .unwrap();
    pub static ref COMMANDS_EXPIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_commands_expired_total",
        "Commands expired by the sweep"
    ))
    .unwrap();
    pub static ref PROMOTION_RUNS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_promotion_runs_total",
        "Hot to cold promotion cycles"
    ))
    .unwrap();
    pub static ref PROMOTION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_promotion_failures_total",
        "Promotion cycles whose cold write failed"
    ))
    .unwrap();
    pub static ref READINGS_PROMOTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_readings_promoted_total",
        "Readings moved from the hot to the cold tier"
    ))
    .unwrap();
    pub static ref COLD_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_cold_failures_total",
        "Total cold tier write failures"
    ))
    .unwrap();
    pub static ref PROMOTION_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "homehub_promotion_latency_seconds",
            "Time taken to flush one promotion into the cold tier"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref HOT_TIER_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "homehub_hot_tier_size",
        "Readings currently resident in the hot tier"
    ))
    .unwrap();
    pub static ref SUBSCRIBERS: Gauge = Gauge::with_opts(Opts::new(
        "homehub_subscribers",
        "Connected real-time subscribers"
    ))
    .unwrap();
    pub static ref SUBSCRIBERS_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_subscribers_dropped_total",
        "Subscribers dropped after a failed delivery"
    ))
    .unwrap();
    pub static ref CHANNEL_FULL_TOTAL: Counter = Counter::with_opts(Opts::new(
        "homehub_channel_full_total",
        "Total number of times the router queue was full (backpressure events)"
    ))
    .unwrap();
}

pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(DROPPED_MESSAGES_TOTAL.clone()),
        Box::new(TELEMETRY_INGESTED_TOTAL.clone()),
        Box::new(COMMANDS_ISSUED_TOTAL.clone()),
        Box::new(COMMANDS_RESOLVED_TOTAL.clone()),
        Box::new(COMMANDS_EXPIRED_TOTAL.clone()),
        Box::new(PROMOTION_RUNS_TOTAL.clone()),
        Box::new(PROMOTION_FAILURES_TOTAL.clone()),
        Box::new(READINGS_PROMOTED_TOTAL.clone()),
        Box::new(COLD_FAILURES_TOTAL.clone()),
        Box::new(PROMOTION_LATENCY_SECONDS.clone()),
        Box::new(HOT_TIER_SIZE.clone()),
        Box::new(SUBSCRIBERS.clone()),
        Box::new(SUBSCRIBERS_DROPPED_TOTAL.clone()),
        Box::new(CHANNEL_FULL_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("Failed to register metric: {}", e);
        }
    }
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_after_init() {
        init_metrics();
        // A second init only logs duplicate registrations.
        init_metrics();
        MESSAGES_TOTAL.inc();
        DROPPED_MESSAGES_TOTAL.with_label_values(&["decode"]).inc();

        let text = gather_metrics();
        assert!(text.contains("homehub_messages_total"));
        assert!(text.contains("reason=\"decode\""));
    }
}
