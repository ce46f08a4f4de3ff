use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BUILDS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("sandcastle_builds_total", "finished build tasks by outcome"),
        &["outcome"],
    )
    .expect("builds counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "sandcastle_sessions_created_total",
        "sessions registered after a successful build",
    ))
    .expect("sessions counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SESSIONS_REAPED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandcastle_sessions_reaped_total",
            "sessions torn down by reason (stopped, expired)",
        ),
        &["reason"],
    )
    .expect("reaped counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SWEEP_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "sandcastle_sweep_failures_total",
        "per-session teardown failures during sweeps",
    ))
    .expect("sweep failures counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static ORPHANS_REAPED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "sandcastle_orphans_reaped_total",
        "managed containers removed with no session referencing them",
    ))
    .expect("orphans counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BRIDGE_BYTES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "sandcastle_bridge_bytes_total",
            "terminal bytes relayed by direction (in = client to shell)",
        ),
        &["direction"],
    )
    .expect("bridge bytes counter");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BRIDGES_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::with_opts(Opts::new(
        "sandcastle_bridges_active",
        "terminal bridges currently relaying",
    ))
    .expect("bridges gauge");
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Forces registration so every series shows up on the first scrape.
pub fn init() {
    Lazy::force(&BUILDS);
    Lazy::force(&SESSIONS_CREATED);
    Lazy::force(&SESSIONS_REAPED);
    Lazy::force(&SWEEP_FAILURES);
    Lazy::force(&ORPHANS_REAPED);
    Lazy::force(&BRIDGE_BYTES);
    Lazy::force(&BRIDGES_ACTIVE);
}

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
