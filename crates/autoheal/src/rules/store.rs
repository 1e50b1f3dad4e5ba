//! In-memory rule cache.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ChangeKind, HealingRule, RuleChange};

/// Result of [`RuleStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No rule with that name existed
    Inserted,
    /// A rule with a different version was replaced
    Replaced,
    /// A rule with the same version is already stored
    Unchanged,
}

/// Concurrency-safe map from rule name to rule.
///
/// Rules are stored behind `Arc`, so a snapshot stays valid while the rules worker
/// keeps mutating the store.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: RwLock<HashMap<String, Arc<HealingRule>>>,
}

impl RuleStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the rule, or replace the stored one if its version differs.
    pub async fn upsert(&self, rule: HealingRule) -> UpsertOutcome {
        let version = rule.version();
        let name = rule.name().to_string();

        let mut rules = self.rules.write().await;
        let outcome = match rules.get(&name) {
            None => UpsertOutcome::Inserted,
            Some(existing) if existing.version() != version => UpsertOutcome::Replaced,
            Some(_) => UpsertOutcome::Unchanged,
        };

        match outcome {
            UpsertOutcome::Inserted => {
                rules.insert(name.clone(), Arc::new(rule));
                info!(rule = %name, "Rule was added");
            }
            UpsertOutcome::Replaced => {
                rules.insert(name.clone(), Arc::new(rule));
                info!(rule = %name, "Rule was updated");
            }
            UpsertOutcome::Unchanged => {
                debug!(rule = %name, %version, "Rule version unchanged, ignoring");
            }
        }
        outcome
    }

    /// Remove the rule with the given name. Returns whether it was present.
    pub async fn delete(&self, name: &str) -> bool {
        let removed = self.rules.write().await.remove(name).is_some();
        if removed {
            info!(rule = %name, "Rule was deleted");
        }
        removed
    }

    /// Apply a change event.
    pub async fn apply(&self, change: RuleChange) {
        match change.kind {
            ChangeKind::Added | ChangeKind::Modified => {
                self.upsert(change.rule).await;
            }
            ChangeKind::Deleted => {
                self.delete(change.rule.name()).await;
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<HealingRule>> {
        self.rules.read().await.get(name).cloned()
    }

    /// Point-in-time view of all the rules, in no particular order.
    pub async fn snapshot(&self) -> Vec<Arc<HealingRule>> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }
}
