//! Autoheal
//!
//! Receives Prometheus Alertmanager notifications, matches every alert against a set
//! of healing rules, and runs the remediation action of the rules that match: an AWX
//! job template or a Kubernetes batch job. Equal actions are throttled for a
//! configurable interval, and launched AWX jobs are tracked until they finish.

pub mod active_jobs;
pub mod alert;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod rules;
pub mod runner;
pub mod server;
pub mod service;
pub mod template;

pub use alert::{Alert, AlertStatus, AlertmanagerPayload};
pub use engine::{AlertReport, Engine, RuleOutcome};
pub use rules::{Action, HealingRule, JobAction, RuleChange, RuleStore};
pub use service::{Runners, Service, ServiceOptions};
