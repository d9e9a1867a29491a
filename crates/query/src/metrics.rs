use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts};

static QUERY_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static QUERY_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static AUTHORIZATION_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DROPPED_SOURCES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = prometheus::default_registry().register(Box::new(collector.clone()));
    collector
}

fn query_outcomes_total() -> &'static IntCounterVec {
    QUERY_OUTCOMES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "docvault_query_outcomes_total",
                    "Access-gated query outcomes.",
                ),
                &["outcome"],
            )
            .expect("create docvault_query_outcomes_total"),
        )
    })
}

fn query_duration_seconds() -> &'static HistogramVec {
    QUERY_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "docvault_query_duration_seconds",
                    "Access-gated query duration in seconds.",
                )
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
                &["outcome"],
            )
            .expect("create docvault_query_duration_seconds"),
        )
    })
}

fn authorization_decisions_total() -> &'static IntCounterVec {
    AUTHORIZATION_DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "docvault_query_authorization_decisions_total",
                    "Per-candidate authorization decisions.",
                ),
                &["allow", "reason"],
            )
            .expect("create docvault_query_authorization_decisions_total"),
        )
    })
}

fn dropped_sources_total() -> &'static IntCounterVec {
    DROPPED_SOURCES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "docvault_query_dropped_sources_total",
                    "Candidates dropped after authorization or search failures.",
                ),
                &["reason"],
            )
            .expect("create docvault_query_dropped_sources_total"),
        )
    })
}

pub fn observe_outcome(outcome: &str, duration: Duration) {
    query_outcomes_total().with_label_values(&[outcome]).inc();
    query_duration_seconds()
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_authorization(allow: bool, reason: &str) {
    let allow = if allow { "true" } else { "false" };
    authorization_decisions_total()
        .with_label_values(&[allow, reason])
        .inc();
}

pub fn observe_dropped(reason: &str) {
    dropped_sources_total().with_label_values(&[reason]).inc();
}

pub fn register() {
    let _ = query_outcomes_total();
    let _ = query_duration_seconds();
    let _ = authorization_decisions_total();
    let _ = dropped_sources_total();
}
