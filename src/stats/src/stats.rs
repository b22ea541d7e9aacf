//! Per-operation timing samples. `ovn_stats.py` (referenced throughout
//! `ovn_workload.py` via the `@ovn_stats.timeit` decorator but not
//! retrieved) kept one process-global table keyed by operation name;
//! Rust has no zero-cost method decorator, so `timeit` is an explicit
//! wrapper called at each instrumented call site, writing into the same
//! kind of global table via a `once_cell::sync::Lazy` static — the one
//! place this workspace keeps global mutable state, mirroring the
//! original's module-level stats dict.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

#[derive(Debug, Default, Clone)]
struct Samples {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
}

impl Samples {
    fn record(&mut self, d: Duration) {
        self.count += 1;
        self.total += d;
        self.min = Some(self.min.map_or(d, |m| m.min(d)));
        self.max = Some(self.max.map_or(d, |m| m.max(d)));
    }

    fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

/// Samples grouped by `(phase, operation)`.
#[derive(Debug, Default)]
pub struct Stats {
    samples: RwLock<BTreeMap<(String, String), Samples>>,
}

impl Stats {
    pub fn new() -> Stats {
        Stats::default()
    }

    pub fn record(&self, phase: &str, op: &str, elapsed: Duration) {
        let mut samples = self.samples.write().unwrap();
        samples.entry((phase.to_string(), op.to_string())).or_default().record(elapsed);
    }

    /// A one-line-per-operation summary: count and mean latency.
    pub fn brief_report(&self) -> String {
        let samples = self.samples.read().unwrap();
        let mut out = String::new();
        for ((phase, op), s) in samples.iter() {
            out.push_str(&format!("{phase}/{op}: n={} mean={:?}\n", s.count, s.mean()));
        }
        out
    }

    /// Full report with min/max/total alongside count and mean.
    pub fn detailed_report(&self) -> String {
        let samples = self.samples.read().unwrap();
        let mut out = String::new();
        for ((phase, op), s) in samples.iter() {
            out.push_str(&format!(
                "{phase}/{op}: n={} mean={:?} min={:?} max={:?} total={:?}\n",
                s.count,
                s.mean(),
                s.min.unwrap_or_default(),
                s.max.unwrap_or_default(),
                s.total
            ));
        }
        out
    }

    pub fn clear(&self) {
        self.samples.write().unwrap().clear();
    }
}

/// The process-wide sample table. One driver process per run (spec.md
/// §1 Non-goals: no distributed scheduling of the harness itself), so a
/// single global table is sufficient and matches the original's module
/// global.
pub static GLOBAL_STATS: Lazy<Stats> = Lazy::new(Stats::new);

/// Times `fut`, records the elapsed duration against `(phase, op)` in
/// [`GLOBAL_STATS`], and returns `fut`'s output. Called at exactly the
/// sites the original marks `@ovn_stats.timeit`
/// (`WorkerNode.connect/wait/provision/provision_port/...`,
/// `Namespace.default_deny/allow_within_namespace/...`).
pub async fn timeit<F, T>(phase: &str, op: &str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let result = fut.await;
    GLOBAL_STATS.record(phase, op, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeit_records_one_sample_per_call() {
        let stats = Stats::new();
        for _ in 0..3 {
            let start = Instant::now();
            let () = async { 1 + 1 }.await;
            let _ = start;
            stats.record("bringup", "provision", Duration::from_millis(5));
        }
        let report = stats.brief_report();
        assert!(report.contains("bringup/provision: n=3"));
    }

    #[test]
    fn mean_is_total_over_count() {
        let mut s = Samples::default();
        s.record(Duration::from_millis(10));
        s.record(Duration::from_millis(20));
        assert_eq!(s.mean(), Duration::from_millis(15));
    }
}
