//! Periodic reload of the rules from the configuration files.

use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::ConfigLoader;
use crate::error::ConfigError;
use crate::queue::WorkQueue;
use crate::rules::{HealingRule, RuleChange};

/// Re-reads the configuration files and turns rule differences into change events.
///
/// Only rules are reloaded. AWX and throttling settings keep the values they had when
/// the service started.
pub struct ConfigWatcher {
    loader: ConfigLoader,
    interval: Duration,
    changes: WorkQueue<RuleChange>,
    current: HashMap<String, HealingRule>,
}

impl ConfigWatcher {
    /// Create a watcher that knows about `initial` rules, the ones the service was
    /// started with.
    #[must_use]
    pub fn new(
        loader: ConfigLoader,
        interval: Duration,
        changes: WorkQueue<RuleChange>,
        initial: &[HealingRule],
    ) -> Self {
        let current = initial
            .iter()
            .map(|rule| (rule.name().to_string(), rule.clone()))
            .collect();
        Self {
            loader,
            interval,
            changes,
            current,
        }
    }

    /// Reload the files once and enqueue the resulting changes.
    pub fn reload(&mut self) -> Result<Vec<RuleChange>, ConfigError> {
        let config = self.loader.load_files()?;
        let changes = diff(&self.current, &config.rules);

        self.current = config
            .rules
            .into_iter()
            .map(|rule| (rule.name().to_string(), rule))
            .collect();
        for change in &changes {
            info!(rule = %change.rule.name(), kind = ?change.kind, "Rule changed in configuration");
            self.changes.add(change.clone());
        }
        Ok(changes)
    }

    /// Reload on every interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Configuration watcher started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately and the rules were just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.reload() {
                        Ok(changes) if changes.is_empty() => debug!("Configuration unchanged"),
                        Ok(changes) => info!(count = changes.len(), "Configuration reloaded"),
                        Err(e) => error!(error = %e, "Failed to reload configuration, keeping previous rules"),
                    }
                }
            }
        }
        info!("Configuration watcher stopped");
    }
}

/// Changes that turn `current` into `next`: added and modified rules in file order,
/// then deleted rules by name.
fn diff(current: &HashMap<String, HealingRule>, next: &[HealingRule]) -> Vec<RuleChange> {
    let mut changes = Vec::new();
    let mut seen = HashSet::new();

    for rule in next {
        seen.insert(rule.name());
        match current.get(rule.name()) {
            None => changes.push(RuleChange::added(rule.clone())),
            Some(existing) if existing != rule => changes.push(RuleChange::modified(rule.clone())),
            Some(_) => {}
        }
    }

    let mut deleted: Vec<&HealingRule> = current
        .values()
        .filter(|rule| !seen.contains(rule.name()))
        .collect();
    deleted.sort_by(|a, b| a.name().cmp(b.name()));
    changes.extend(deleted.into_iter().cloned().map(RuleChange::deleted));
    changes
}
