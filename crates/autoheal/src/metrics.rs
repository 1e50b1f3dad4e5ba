//! Healing metrics.
//!
//! The engine and the poller report through the [`MetricsSink`] trait; the service
//! wires in [`PrometheusMetrics`], which keeps the series in memory and renders them
//! in the Prometheus text format for `GET /metrics`.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name of the counter of requested actions.
pub const ACTIONS_REQUESTED: &str = "autoheal_actions_requested_total";
/// Name of the gauge of launched actions, by status.
pub const ACTIONS_LAUNCHED: &str = "autoheal_actions_launched";

/// Receiver of the healing metrics.
pub trait MetricsSink: Send + Sync {
    /// An activated rule asked for an action, whether or not it ends up running.
    fn action_requested(&self, kind: &str, rule: &str, alert: &str);

    /// An action was launched and is now running.
    fn action_started(&self, kind: &str, target: &str, rule: &str);

    /// A running action finished.
    fn action_completed(&self, kind: &str, target: &str, rule: &str);

    /// An action couldn't be launched.
    fn action_failed(&self, kind: &str, target: &str, rule: &str);
}

#[derive(Debug, Default)]
struct Series {
    requested: BTreeMap<(String, String, String), u64>,
    launched: BTreeMap<(String, String, String, String), i64>,
}

/// In-memory metrics registry with Prometheus text exposition.
#[derive(Debug, Default)]
pub struct PrometheusMetrics {
    series: Mutex<Series>,
}

impl PrometheusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Render every series in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let series = self.lock();
        let mut out = String::with_capacity(1024);

        let _ = writeln!(out, "# HELP {ACTIONS_REQUESTED} Number of healing actions requested by activated rules");
        let _ = writeln!(out, "# TYPE {ACTIONS_REQUESTED} counter");
        for ((kind, rule, alert), value) in &series.requested {
            let _ = writeln!(
                out,
                "{ACTIONS_REQUESTED}{{type=\"{}\",rule=\"{}\",alert=\"{}\"}} {value}",
                escape(kind),
                escape(rule),
                escape(alert),
            );
        }

        let _ = writeln!(out, "# HELP {ACTIONS_LAUNCHED} Number of healing actions by status");
        let _ = writeln!(out, "# TYPE {ACTIONS_LAUNCHED} gauge");
        for ((kind, template, rule, status), value) in &series.launched {
            let _ = writeln!(
                out,
                "{ACTIONS_LAUNCHED}{{type=\"{}\",template=\"{}\",rule=\"{}\",status=\"{}\"}} {value}",
                escape(kind),
                escape(template),
                escape(rule),
                escape(status),
            );
        }

        out
    }

    /// Current value of the requested counter for the given labels.
    #[must_use]
    pub fn requested(&self, kind: &str, rule: &str, alert: &str) -> u64 {
        let key = (kind.to_string(), rule.to_string(), alert.to_string());
        self.lock().requested.get(&key).copied().unwrap_or(0)
    }

    /// Current value of the launched gauge for the given labels.
    #[must_use]
    pub fn launched(&self, kind: &str, target: &str, rule: &str, status: &str) -> i64 {
        self.lock()
            .launched
            .get(&launched_key(kind, target, rule, status))
            .copied()
            .unwrap_or(0)
    }

    fn add_launched(&self, kind: &str, target: &str, rule: &str, status: &str, delta: i64) {
        *self
            .lock()
            .launched
            .entry(launched_key(kind, target, rule, status))
            .or_insert(0) += delta;
    }

    fn lock(&self) -> MutexGuard<'_, Series> {
        self.series.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn action_requested(&self, kind: &str, rule: &str, alert: &str) {
        let key = (kind.to_string(), rule.to_string(), alert.to_string());
        *self.lock().requested.entry(key).or_insert(0) += 1;
    }

    fn action_started(&self, kind: &str, target: &str, rule: &str) {
        self.add_launched(kind, target, rule, "running", 1);
    }

    fn action_completed(&self, kind: &str, target: &str, rule: &str) {
        self.add_launched(kind, target, rule, "running", -1);
        self.add_launched(kind, target, rule, "completed", 1);
    }

    fn action_failed(&self, kind: &str, target: &str, rule: &str) {
        self.add_launched(kind, target, rule, "failed", 1);
    }
}

fn launched_key(kind: &str, target: &str, rule: &str, status: &str) -> (String, String, String, String) {
    (
        kind.to_string(),
        target.to_string(),
        rule.to_string(),
        status.to_string(),
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
