use std::sync::OnceLock;

use prometheus::{IntCounterVec, Opts};

static RESOLVE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static TIER_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REPLICATION_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static INDEX_FALLBACKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LEASE_RENEWALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = prometheus::default_registry().register(Box::new(collector.clone()));
    collector
}

fn counter_vec(
    cell: &'static OnceLock<IntCounterVec>,
    name: &str,
    help: &str,
    labels: &[&str],
) -> &'static IntCounterVec {
    cell.get_or_init(|| {
        register_collector(
            IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|err| panic!("create {}: {}", name, err)),
        )
    })
}

fn resolve_total() -> &'static IntCounterVec {
    counter_vec(
        &RESOLVE_TOTAL,
        "docvault_registry_resolve_total",
        "Registry resolutions by answering tier (`miss` when no tier had the key).",
        &["purpose", "tier"],
    )
}

fn tier_failures_total() -> &'static IntCounterVec {
    counter_vec(
        &TIER_FAILURES_TOTAL,
        "docvault_registry_tier_failures_total",
        "Registry tier operations that failed and were treated as misses.",
        &["tier", "operation"],
    )
}

fn replication_total() -> &'static IntCounterVec {
    counter_vec(
        &REPLICATION_TOTAL,
        "docvault_registry_replication_total",
        "Ledger replication attempts after a local store.",
        &["purpose", "outcome"],
    )
}

fn index_fallbacks_total() -> &'static IntCounterVec {
    counter_vec(
        &INDEX_FALLBACKS_TOTAL,
        "docvault_index_fallbacks_total",
        "Index loads that fell back to an empty document.",
        &["kind", "reason"],
    )
}

fn lease_renewals_total() -> &'static IntCounterVec {
    counter_vec(
        &LEASE_RENEWALS_TOTAL,
        "docvault_lease_renewals_total",
        "Lazy lease renewal checks by outcome.",
        &["kind", "outcome"],
    )
}

pub fn observe_resolve(purpose: &str, tier: &str) {
    resolve_total().with_label_values(&[purpose, tier]).inc();
}

pub fn observe_tier_failure(tier: &str, operation: &str) {
    tier_failures_total()
        .with_label_values(&[tier, operation])
        .inc();
}

pub fn observe_replication(purpose: &str, outcome: &str) {
    replication_total()
        .with_label_values(&[purpose, outcome])
        .inc();
}

pub fn observe_index_fallback(kind: &str, reason: &str) {
    index_fallbacks_total()
        .with_label_values(&[kind, reason])
        .inc();
}

pub fn observe_lease_renewal(kind: &str, outcome: &str) {
    lease_renewals_total()
        .with_label_values(&[kind, outcome])
        .inc();
}

/// Forces registration so the families show up before the first event.
pub fn register() {
    let _ = resolve_total();
    let _ = tier_failures_total();
    let _ = replication_total();
    let _ = index_fallbacks_total();
    let _ = lease_renewals_total();
}
