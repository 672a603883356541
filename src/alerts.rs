// ============================================================================
// ALERT MANAGER
// ============================================================================
// Every raised alert passes through a per-type gate:
//
//   raise ──► storm check ──► throttle check ──► enrich ──► record ──► dispatch
//                 │                 │
//             Suppressed         Throttled
//
// Storm counting covers every raise attempt of the type inside the storm
// window; throttling compares with the last delivered alert of the type.
// Subscribers are an explicit registry of sinks; each delivery is isolated
// by a timeout and a panic boundary.
// ============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::RandomState;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sysinfo::System;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::error::{AlertError, AlertResult};
use crate::types::{Severity, Timestamp};

// ----------------------------------------------------------------------------
// 10.1 Alert
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub component: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: Timestamp,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Alert {
    pub fn new(
        alert_type: impl Into<String>,
        component: impl Into<String>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: alert_type.into(),
            component: component.into(),
            severity,
            message: message.into(),
            timestamp: Timestamp::now(),
            context: HashMap::new(),
            correlation_id: None,
        }
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

// ----------------------------------------------------------------------------
// 10.2 Subscriptions
// ----------------------------------------------------------------------------

/// Which alerts a subscriber receives. Component and type filters accept a
/// leading and/or trailing `*` wildcard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(default)]
    pub minimum_severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_filter: Option<String>,
    #[serde(default = "default_include_context")]
    pub include_context: bool,
}

fn default_include_context() -> bool {
    true
}

impl Default for SubscriptionFilter {
    fn default() -> Self {
        Self {
            minimum_severity: Severity::Info,
            component_filter: None,
            type_filter: None,
            include_context: true,
        }
    }
}

impl SubscriptionFilter {
    pub fn min_severity(mut self, severity: Severity) -> Self {
        self.minimum_severity = severity;
        self
    }

    pub fn component(mut self, pattern: impl Into<String>) -> Self {
        self.component_filter = Some(pattern.into());
        self
    }

    pub fn alert_type(mut self, pattern: impl Into<String>) -> Self {
        self.type_filter = Some(pattern.into());
        self
    }

    pub fn without_context(mut self) -> Self {
        self.include_context = false;
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        alert.severity >= self.minimum_severity
            && self
                .component_filter
                .as_deref()
                .map_or(true, |p| pattern_matches(p, &alert.component))
            && self
                .type_filter
                .as_deref()
                .map_or(true, |p| pattern_matches(p, &alert.alert_type))
    }
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        _ if pattern == "*" => true,
        (Some(rest), _) if rest.ends_with('*') => value.contains(&rest[..rest.len() - 1]),
        (Some(suffix), _) => value.ends_with(suffix),
        (None, Some(prefix)) => value.starts_with(prefix),
        (None, None) => value == pattern,
    }
}

/// Receives delivered alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: Alert) -> AlertResult<()>;
}

/// Adapts a synchronous closure into a sink
pub struct CallbackSink<F> {
    callback: F,
}

impl<F> CallbackSink<F>
where
    F: Fn(&Alert) -> AlertResult<()> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> AlertSink for CallbackSink<F>
where
    F: Fn(&Alert) -> AlertResult<()> + Send + Sync,
{
    async fn deliver(&self, alert: Alert) -> AlertResult<()> {
        (self.callback)(&alert)
    }
}

/// Forwards alerts into a bounded channel
pub struct ChannelSink {
    name: String,
    sender: mpsc::Sender<Alert>,
}

impl ChannelSink {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<Alert>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

#[async_trait]
impl AlertSink for ChannelSink {
    async fn deliver(&self, alert: Alert) -> AlertResult<()> {
        self.sender
            .send(alert)
            .await
            .map_err(|_| AlertError::delivery_failed(self.name.clone(), "receiver dropped"))
    }
}

struct Subscription {
    id: String,
    filter: SubscriptionFilter,
    sink: Arc<dyn AlertSink>,
}

/// Returned by `subscribe`; pass back to `unsubscribe`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: String,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

// ----------------------------------------------------------------------------
// 10.3 Outcomes, Rollups & Stats
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AlertOutcome {
    /// Passed the gate; `recipients` subscribers accepted it
    Delivered { recipients: usize },
    Throttled,
    Suppressed,
}

impl AlertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertOutcome::Delivered { .. } => "delivered",
            AlertOutcome::Throttled => "throttled",
            AlertOutcome::Suppressed => "suppressed",
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, AlertOutcome::Delivered { .. })
    }
}

/// Summary of recent alerts for one (component, type) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRollup {
    pub component: String,
    pub alert_type: String,
    pub count: usize,
    pub first: Timestamp,
    pub last: Timestamp,
    pub max_severity: Severity,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertStats {
    pub raised: u64,
    pub delivered: u64,
    pub throttled: u64,
    pub suppressed: u64,
    pub storms: u64,
    pub delivery_failures: u64,
}

/// Per-type view for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertTypeState {
    pub occurrences: usize,
    pub attempts_in_window: usize,
    pub last_delivered: Option<Timestamp>,
    pub in_storm: bool,
}

#[derive(Debug, Default)]
struct TypeHistory {
    /// Raise attempts inside the storm window
    attempts: VecDeque<Timestamp>,
    /// Delivered alerts inside the retention period
    occurrences: VecDeque<Timestamp>,
    last_delivered: Option<Timestamp>,
    storm_started: Option<Timestamp>,
}

enum Gate {
    Deliver {
        prior_occurrences: usize,
        last_occurrence: Option<Timestamp>,
    },
    Throttled,
    Suppressed,
}

// ----------------------------------------------------------------------------
// 10.4 Manager
// ----------------------------------------------------------------------------

pub struct AlertManager {
    config: AlertConfig,
    subscriptions: DashMap<String, Arc<Subscription>, RandomState>,
    recent: Mutex<VecDeque<Alert>>,
    history: DashMap<String, TypeHistory, RandomState>,
    rollups: RwLock<Vec<AlertRollup>>,
    host: String,
    process_id: u32,
    raised: AtomicU64,
    delivered: AtomicU64,
    throttled: AtomicU64,
    suppressed: AtomicU64,
    storms: AtomicU64,
    delivery_failures: AtomicU64,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Self {
        let capacity = config.recent_capacity;
        Self {
            config,
            subscriptions: DashMap::with_hasher(RandomState::new()),
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            history: DashMap::with_hasher(RandomState::new()),
            rollups: RwLock::new(Vec::new()),
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            process_id: std::process::id(),
            raised: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            storms: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Subscription API
    // ------------------------------------------------------------------------

    pub fn subscribe(
        &self,
        id: impl Into<String>,
        filter: SubscriptionFilter,
        sink: Arc<dyn AlertSink>,
    ) -> AlertResult<SubscriptionHandle> {
        let id = id.into();
        match self.subscriptions.entry(id.clone()) {
            Entry::Occupied(_) => Err(AlertError::DuplicateSubscription { id }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Subscription {
                    id: id.clone(),
                    filter,
                    sink,
                }));
                debug!(target: "pulse::alerts", subscription = %id, "Subscriber registered");
                Ok(SubscriptionHandle { id })
            }
        }
    }

    pub fn subscribe_fn<F>(&self, id: impl Into<String>, filter: SubscriptionFilter, callback: F) -> AlertResult<SubscriptionHandle>
    where
        F: Fn(&Alert) -> AlertResult<()> + Send + Sync + 'static,
    {
        self.subscribe(id, filter, Arc::new(CallbackSink::new(callback)))
    }

    /// `false` when the handle was already removed
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.subscriptions.remove(&handle.id).is_some();
        if removed {
            debug!(target: "pulse::alerts", subscription = %handle.id, "Subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.len()
    }

    // ------------------------------------------------------------------------
    // Raise
    // ------------------------------------------------------------------------

    /// Gate, enrich, record and dispatch one alert. The alert's own
    /// timestamp is the reference time for throttling and storm windows.
    pub async fn raise_alert(&self, mut alert: Alert) -> AlertOutcome {
        self.raised.fetch_add(1, AtomicOrdering::Relaxed);
        let now = alert.timestamp;

        let (prior_occurrences, last_occurrence) = match self.gate(&alert.alert_type, now) {
            Gate::Suppressed => {
                self.suppressed.fetch_add(1, AtomicOrdering::Relaxed);
                return AlertOutcome::Suppressed;
            }
            Gate::Throttled => {
                self.throttled.fetch_add(1, AtomicOrdering::Relaxed);
                debug!(target: "pulse::alerts", alert_type = %alert.alert_type, "Alert throttled");
                return AlertOutcome::Throttled;
            }
            Gate::Deliver {
                prior_occurrences,
                last_occurrence,
            } => (prior_occurrences, last_occurrence),
        };

        self.enrich(&mut alert, prior_occurrences, last_occurrence);
        self.record_recent(alert.clone());

        let recipients = self.dispatch(&alert).await;
        self.delivered.fetch_add(1, AtomicOrdering::Relaxed);

        crate::log_alert!(
            alert.severity,
            alert.alert_type,
            alert.message,
            component = %alert.component,
            recipients
        );

        AlertOutcome::Delivered { recipients }
    }

    fn gate(&self, alert_type: &str, now: Timestamp) -> Gate {
        let mut entry = self.history.entry(alert_type.to_string()).or_default();
        let history = entry.value_mut();

        history.attempts.push_back(now);
        let window_start = now.sub_duration(self.config.storm_window);
        while history.attempts.front().is_some_and(|t| *t < window_start) {
            history.attempts.pop_front();
        }

        let count = history.attempts.len();
        let limit = self.config.max_alerts_per_interval;
        match history.storm_started {
            Some(started) => {
                if count <= limit && now.duration_since(started) >= self.config.cooldown {
                    history.storm_started = None;
                    info!(
                        target: "pulse::alerts",
                        alert_type,
                        attempts = count,
                        "Alert storm subsided"
                    );
                }
            }
            None if count > limit => {
                history.storm_started = Some(now);
                self.storms.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "pulse::alerts",
                    alert_type,
                    attempts = count,
                    limit,
                    window_secs = self.config.storm_window.as_secs(),
                    "Alert storm detected, suppressing"
                );
            }
            None => {}
        }

        if history.storm_started.is_some() {
            return Gate::Suppressed;
        }

        if let Some(last) = history.last_delivered {
            if now.duration_since(last) < self.config.throttle_interval {
                return Gate::Throttled;
            }
        }

        let prior_occurrences = history.occurrences.len();
        let last_occurrence = history.occurrences.back().copied();
        history.last_delivered = Some(now);
        history.occurrences.push_back(now);
        Gate::Deliver {
            prior_occurrences,
            last_occurrence,
        }
    }

    fn enrich(&self, alert: &mut Alert, prior_occurrences: usize, last_occurrence: Option<Timestamp>) {
        let context = &mut alert.context;
        context.insert("host".into(), Value::from(self.host.clone()));
        context.insert("process_id".into(), Value::from(self.process_id));
        context.insert("enriched_at".into(), Value::from(Timestamp::now().to_string()));
        context.insert("prior_occurrences".into(), Value::from(prior_occurrences));
        context.insert(
            "last_occurrence".into(),
            last_occurrence.map_or(Value::Null, |t| Value::from(t.to_string())),
        );
        if alert.correlation_id.is_none() {
            alert.correlation_id = Some(Uuid::new_v4().to_string());
        }
    }

    fn record_recent(&self, alert: Alert) {
        let mut recent = self.recent.lock();
        if recent.len() >= self.config.recent_capacity.max(1) {
            recent.pop_front();
        }
        recent.push_back(alert);
    }

    /// Deliver to every matching subscriber concurrently; returns how many
    /// accepted the alert.
    async fn dispatch(&self, alert: &Alert) -> usize {
        let targets: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|s| s.filter.matches(alert))
            .map(|s| Arc::clone(s.value()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let timeout = self.config.delivery_timeout;
        let deliveries = targets.into_iter().map(|subscription| {
            let payload = if subscription.filter.include_context {
                alert.clone()
            } else {
                Alert {
                    context: HashMap::new(),
                    ..alert.clone()
                }
            };
            async move {
                let delivery = AssertUnwindSafe(subscription.sink.deliver(payload)).catch_unwind();
                let result = match tokio::time::timeout(timeout, delivery).await {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(_)) => Err(AlertError::SubscriberPanicked {
                        subscriber: subscription.id.clone(),
                    }),
                    Err(_) => Err(AlertError::DeliveryTimeout {
                        subscriber: subscription.id.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
                (subscription.id.clone(), result)
            }
        });

        let mut recipients = 0;
        for (subscriber, result) in join_all(deliveries).await {
            match result {
                Ok(()) => recipients += 1,
                Err(e) => {
                    self.delivery_failures.fetch_add(1, AtomicOrdering::Relaxed);
                    warn!(
                        target: "pulse::alerts",
                        subscriber = %subscriber,
                        alert_type = %alert.alert_type,
                        error = %e,
                        "Alert delivery failed"
                    );
                }
            }
        }
        recipients
    }

    // ------------------------------------------------------------------------
    // Aggregation & Cleanup
    // ------------------------------------------------------------------------

    /// Roll recent alerts up by (component, type), largest groups first
    pub fn aggregate(&self) -> Vec<AlertRollup> {
        let mut groups: HashMap<(String, String), AlertRollup> = HashMap::new();
        {
            let recent = self.recent.lock();
            for alert in recent.iter() {
                let key = (alert.component.clone(), alert.alert_type.clone());
                groups
                    .entry(key)
                    .and_modify(|rollup| {
                        rollup.count += 1;
                        rollup.first = rollup.first.min(alert.timestamp);
                        rollup.last = rollup.last.max(alert.timestamp);
                        rollup.max_severity = rollup.max_severity.max(alert.severity);
                    })
                    .or_insert_with(|| AlertRollup {
                        component: alert.component.clone(),
                        alert_type: alert.alert_type.clone(),
                        count: 1,
                        first: alert.timestamp,
                        last: alert.timestamp,
                        max_severity: alert.severity,
                    });
            }
        }

        let mut rollups: Vec<AlertRollup> = groups.into_values().collect();
        rollups.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.component.cmp(&b.component))
                .then_with(|| a.alert_type.cmp(&b.alert_type))
        });
        *self.rollups.write() = rollups.clone();
        debug!(target: "pulse::alerts", groups = rollups.len(), "Alert rollups refreshed");
        rollups
    }

    /// Rollups from the last aggregation
    pub fn rollups(&self) -> Vec<AlertRollup> {
        self.rollups.read().clone()
    }

    /// Drop occurrence records and recent alerts older than the retention
    /// period; returns the number of records removed.
    pub fn cleanup(&self, now: Timestamp) -> usize {
        let cutoff = now.sub_duration(self.config.retention);
        let storm_start = now.sub_duration(self.config.storm_window);
        let mut removed = 0;

        for mut entry in self.history.iter_mut() {
            let history = entry.value_mut();
            while history.occurrences.front().is_some_and(|t| *t < cutoff) {
                history.occurrences.pop_front();
                removed += 1;
            }
            while history.attempts.front().is_some_and(|t| *t < storm_start) {
                history.attempts.pop_front();
            }
        }
        self.history.retain(|_, h| {
            !h.occurrences.is_empty() || !h.attempts.is_empty() || h.storm_started.is_some()
        });

        {
            let mut recent = self.recent.lock();
            while recent.front().is_some_and(|a| a.timestamp < cutoff) {
                recent.pop_front();
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(target: "pulse::alerts", removed, "Alert history cleaned");
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Up to `limit` most recent delivered alerts, newest first
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        self.recent.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn type_state(&self, alert_type: &str) -> Option<AlertTypeState> {
        self.history.get(alert_type).map(|h| AlertTypeState {
            occurrences: h.occurrences.len(),
            attempts_in_window: h.attempts.len(),
            last_delivered: h.last_delivered,
            in_storm: h.storm_started.is_some(),
        })
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            raised: self.raised.load(AtomicOrdering::Relaxed),
            delivered: self.delivered.load(AtomicOrdering::Relaxed),
            throttled: self.throttled.load(AtomicOrdering::Relaxed),
            suppressed: self.suppressed.load(AtomicOrdering::Relaxed),
            storms: self.storms.load(AtomicOrdering::Relaxed),
            delivery_failures: self.delivery_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> AlertConfig {
        AlertConfig {
            throttle_interval: Duration::from_secs(300),
            max_alerts_per_interval: 3,
            storm_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(600),
            delivery_timeout: Duration::from_millis(200),
            ..AlertConfig::default()
        }
    }

    fn alert(alert_type: &str, severity: Severity, secs: i64) -> Alert {
        Alert::new(alert_type, "cpu_usage", severity, "test alert").at(Timestamp::from_secs(secs))
    }

    fn counting(manager: &AlertManager, id: &str, filter: SubscriptionFilter) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        manager
            .subscribe_fn(id, filter, move |_| {
                seen.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
            .expect("subscribe");
        count
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("*", "anything"));
        assert!(pattern_matches("cpu*", "cpu_usage"));
        assert!(pattern_matches("*.anomaly", "cpu_usage.anomaly"));
        assert!(pattern_matches("*usage*", "cpu_usage.anomaly"));
        assert!(pattern_matches("exact", "exact"));
        assert!(!pattern_matches("exact", "exactly"));
        assert!(!pattern_matches("mem*", "cpu_usage"));
    }

    #[test]
    fn test_filter_matching() {
        let alert = alert("cpu_usage.anomaly", Severity::High, 0);
        assert!(SubscriptionFilter::default().matches(&alert));
        assert!(SubscriptionFilter::default().min_severity(Severity::High).matches(&alert));
        assert!(!SubscriptionFilter::default().min_severity(Severity::Critical).matches(&alert));
        assert!(SubscriptionFilter::default().component("cpu*").matches(&alert));
        assert!(!SubscriptionFilter::default().alert_type("*.trend").matches(&alert));
    }

    #[tokio::test]
    async fn test_throttle_delivers_once() {
        let manager = AlertManager::new(config());
        let count = counting(&manager, "ops", SubscriptionFilter::default());

        let first = manager.raise_alert(alert("cpu.anomaly", Severity::Critical, 1_000)).await;
        let second = manager.raise_alert(alert("cpu.anomaly", Severity::Critical, 1_060)).await;

        assert_eq!(first, AlertOutcome::Delivered { recipients: 1 });
        assert_eq!(second, AlertOutcome::Throttled);
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        // After the throttle interval the type is deliverable again.
        let third = manager.raise_alert(alert("cpu.anomaly", Severity::Critical, 1_301)).await;
        assert!(third.is_delivered());
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_types_not_throttled() {
        let manager = AlertManager::new(config());
        manager.raise_alert(alert("cpu.anomaly", Severity::High, 1_000)).await;
        let other = manager.raise_alert(alert("mem.anomaly", Severity::High, 1_001)).await;
        assert!(other.is_delivered());
    }

    #[tokio::test]
    async fn test_storm_suppression_and_recovery() {
        let manager = AlertManager::new(AlertConfig {
            throttle_interval: Duration::ZERO,
            ..config()
        });
        let count = counting(&manager, "ops", SubscriptionFilter::default());

        let mut outcomes = Vec::new();
        for i in 0..6 {
            outcomes.push(manager.raise_alert(alert("disk.threshold", Severity::Warning, 1_000 + i)).await);
        }
        assert!(outcomes[..3].iter().all(|o| o.is_delivered()));
        assert!(outcomes[3..].iter().all(|o| *o == AlertOutcome::Suppressed));
        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(manager.stats().storms, 1);
        assert!(manager.type_state("disk.threshold").expect("tracked").in_storm);

        // Quiet window has passed but cooldown has not.
        let early = manager.raise_alert(alert("disk.threshold", Severity::Warning, 1_400)).await;
        assert_eq!(early, AlertOutcome::Suppressed);

        let later = manager.raise_alert(alert("disk.threshold", Severity::Warning, 1_700)).await;
        assert!(later.is_delivered());
        assert_eq!(manager.stats().storms, 1);
    }

    #[tokio::test]
    async fn test_enrichment() {
        let manager = AlertManager::new(config());
        let (tx, mut rx) = mpsc::channel(4);
        manager
            .subscribe("channel", SubscriptionFilter::default(), Arc::new(ChannelSink::new("channel", tx)))
            .expect("subscribe");

        manager.raise_alert(alert("net.anomaly", Severity::High, 1_000)).await;
        manager.raise_alert(alert("net.anomaly", Severity::High, 2_000)).await;

        let first = rx.recv().await.expect("first alert");
        let second = rx.recv().await.expect("second alert");
        assert!(first.context.contains_key("host"));
        assert!(first.context.contains_key("process_id"));
        assert!(first.context.contains_key("enriched_at"));
        assert_eq!(first.context["prior_occurrences"], Value::from(0));
        assert_eq!(first.context["last_occurrence"], Value::Null);
        assert_eq!(second.context["prior_occurrences"], Value::from(1));
        assert_eq!(
            second.context["last_occurrence"],
            Value::from(Timestamp::from_secs(1_000).to_string())
        );
        assert!(first.correlation_id.is_some());
        assert_ne!(first.correlation_id, second.correlation_id);
    }

    #[tokio::test]
    async fn test_existing_correlation_id_kept_and_context_stripped() {
        let manager = AlertManager::new(config());
        let (tx, mut rx) = mpsc::channel(4);
        manager
            .subscribe(
                "bare",
                SubscriptionFilter::default().without_context(),
                Arc::new(ChannelSink::new("bare", tx)),
            )
            .expect("subscribe");

        manager
            .raise_alert(alert("x.trend", Severity::Info, 10).with_correlation_id("req-42"))
            .await;
        let received = rx.recv().await.expect("alert");
        assert_eq!(received.correlation_id.as_deref(), Some("req-42"));
        assert!(received.context.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscribers_are_isolated() {
        let manager = AlertManager::new(config());
        manager
            .subscribe_fn("failing", SubscriptionFilter::default(), |_| {
                Err(AlertError::delivery_failed("failing", "nope"))
            })
            .expect("subscribe");
        manager
            .subscribe_fn("panicking", SubscriptionFilter::default(), |_| panic!("subscriber bug"))
            .expect("subscribe");
        let count = counting(&manager, "healthy", SubscriptionFilter::default());

        let outcome = manager.raise_alert(alert("cpu.anomaly", Severity::High, 5)).await;
        assert_eq!(outcome, AlertOutcome::Delivered { recipients: 1 });
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(manager.stats().delivery_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_times_out() {
        struct Slow;

        #[async_trait]
        impl AlertSink for Slow {
            async fn deliver(&self, _alert: Alert) -> AlertResult<()> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        }

        let manager = AlertManager::new(config());
        manager
            .subscribe("slow", SubscriptionFilter::default(), Arc::new(Slow))
            .expect("subscribe");
        let outcome = manager.raise_alert(alert("cpu.anomaly", Severity::High, 5)).await;
        assert_eq!(outcome, AlertOutcome::Delivered { recipients: 0 });
        assert_eq!(manager.stats().delivery_failures, 1);
    }

    #[test]
    fn test_duplicate_subscription_and_unsubscribe() {
        let manager = AlertManager::new(config());
        let handle = manager
            .subscribe_fn("ops", SubscriptionFilter::default(), |_| Ok(()))
            .expect("subscribe");
        assert!(matches!(
            manager.subscribe_fn("ops", SubscriptionFilter::default(), |_| Ok(())),
            Err(AlertError::DuplicateSubscription { .. })
        ));
        assert!(manager.unsubscribe(&handle));
        assert!(!manager.unsubscribe(&handle));
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_aggregation() {
        let manager = AlertManager::new(AlertConfig {
            throttle_interval: Duration::ZERO,
            max_alerts_per_interval: 100,
            ..config()
        });
        manager.raise_alert(alert("cpu.anomaly", Severity::Warning, 10)).await;
        manager.raise_alert(alert("cpu.anomaly", Severity::Critical, 20)).await;
        manager.raise_alert(alert("cpu.anomaly", Severity::High, 30)).await;
        manager.raise_alert(alert("cpu.trend", Severity::Info, 40)).await;

        let rollups = manager.aggregate();
        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].alert_type, "cpu.anomaly");
        assert_eq!(rollups[0].count, 3);
        assert_eq!(rollups[0].first, Timestamp::from_secs(10));
        assert_eq!(rollups[0].last, Timestamp::from_secs(30));
        assert_eq!(rollups[0].max_severity, Severity::Critical);
        assert_eq!(manager.rollups(), rollups);
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let manager = AlertManager::new(AlertConfig {
            retention: Duration::from_secs(3_600),
            ..config()
        });
        manager.raise_alert(alert("old.anomaly", Severity::High, 0)).await;
        manager.raise_alert(alert("new.anomaly", Severity::High, 7_000)).await;

        // One occurrence record plus one recent alert.
        assert_eq!(manager.cleanup(Timestamp::from_secs(7_200)), 2);
        assert!(manager.type_state("old.anomaly").is_none());
        assert!(manager.type_state("new.anomaly").is_some());
        assert_eq!(manager.recent_alerts(10).len(), 1);
    }
}
