//! Durable outbound-email queue with retrying delivery.
//!
//! The outbox is a persisted list of not-yet-delivered messages, drained by
//! a periodic worker independent of the task/worker path. Failed deliveries
//! are rescheduled with exponential backoff up to a configurable ceiling and
//! a maximum-attempts cutoff; sent items become immutable. Persistence is
//! whole-file read-modify-write, so at most one delivery pass may be in
//! flight at a time - concurrent triggers serialize behind the pass lock.

pub mod transport;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use transport::Transport;

const PROVIDER_NOT_IMPLEMENTED: &str = "email provider not implemented";

/// One queued outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: Uuid,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default)]
    pub sent: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl OutboxItem {
    pub fn new(to: Vec<String>, subject: String, body: String, html: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            to,
            subject,
            body,
            html,
            sent: false,
            failed: false,
            attempts: 0,
            error: None,
            next_attempt_at: None,
            sent_at: None,
            failed_at: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Still awaiting delivery (neither sent nor hard-failed).
    pub fn is_pending(&self) -> bool {
        !self.sent && !self.failed
    }
}

/// Whole-file JSON persistence for the outbox queue.
pub struct OutboxStore {
    storage_path: PathBuf,
    file_lock: Mutex<()>,
}

impl OutboxStore {
    pub fn new(storage_path: PathBuf) -> Self {
        Self {
            storage_path,
            file_lock: Mutex::new(()),
        }
    }

    fn read_list(&self) -> Result<Vec<OutboxItem>, std::io::Error> {
        if !self.storage_path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.storage_path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn write_list(&self, items: &[OutboxItem]) -> Result<(), std::io::Error> {
        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(items)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.storage_path, contents)
    }

    /// Load the full queue in list order.
    pub async fn load(&self) -> Result<Vec<OutboxItem>, std::io::Error> {
        let _guard = self.file_lock.lock().await;
        self.read_list()
    }

    /// Append one item to the queue.
    pub async fn enqueue(&self, item: OutboxItem) -> Result<(), std::io::Error> {
        let _guard = self.file_lock.lock().await;
        let mut items = self.read_list()?;
        items.push(item);
        self.write_list(&items)
    }

    /// Write back a processed snapshot, merging by id so items enqueued
    /// while the pass ran are kept.
    pub async fn commit(&self, snapshot: &[OutboxItem]) -> Result<(), std::io::Error> {
        let _guard = self.file_lock.lock().await;
        let mut current = self.read_list()?;
        for updated in snapshot {
            match current.iter_mut().find(|i| i.id == updated.id) {
                Some(slot) => *slot = updated.clone(),
                None => current.push(updated.clone()),
            }
        }
        self.write_list(&current)
    }
}

/// Retry/backoff tuning for the delivery worker.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(60_000),
            max_backoff: Duration::from_millis(3_600_000),
        }
    }
}

/// Aggregate counts from one delivery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Exponential backoff with a ceiling: `min(base * 2^(attempts-1), max)`.
fn backoff_delay(config: &DeliveryConfig, attempts: u32) -> Duration {
    let shift = attempts.saturating_sub(1).min(31);
    let delay_ms = (config.base_backoff.as_millis() as u64).saturating_mul(1u64 << shift);
    Duration::from_millis(delay_ms).min(config.max_backoff)
}

/// Long-running consumer of the outbox queue.
pub struct DeliveryWorker {
    store: Arc<OutboxStore>,
    transport: Option<Arc<dyn Transport>>,
    sending_enabled: Arc<AtomicBool>,
    config: DeliveryConfig,
    // Whole-file read-modify-write persistence tolerates exactly one pass
    // at a time; concurrent triggers serialize here.
    pass_lock: Mutex<()>,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<OutboxStore>,
        transport: Option<Arc<dyn Transport>>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            sending_enabled: Arc::new(AtomicBool::new(true)),
            config,
            pass_lock: Mutex::new(()),
        }
    }

    /// Global sending switch; checked before every item in a pass.
    pub fn set_sending_enabled(&self, enabled: bool) {
        self.sending_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!("Outbox sending {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn sending_enabled(&self) -> bool {
        self.sending_enabled.load(Ordering::SeqCst)
    }

    /// Run one delivery pass over the whole queue.
    ///
    /// Both the timer loop and the administrative force-drain come through
    /// here; the pass lock guarantees they never overlap.
    pub async fn deliver_once(&self) -> Result<DeliveryReport, std::io::Error> {
        let _pass = self.pass_lock.lock().await;

        let mut items = self.store.load().await?;
        let mut report = DeliveryReport::default();
        let mut changed = false;
        let mut aborted_at = None;

        for index in 0..items.len() {
            let item = &mut items[index];
            if item.sent || item.failed {
                continue;
            }
            if let Some(at) = item.next_attempt_at {
                if at > chrono::Utc::now() {
                    report.skipped += 1;
                    continue;
                }
            }
            if !self.sending_enabled.load(Ordering::SeqCst) {
                aborted_at = Some(index);
                break;
            }

            let now = chrono::Utc::now();

            if item.attempts >= self.config.max_attempts {
                item.failed = true;
                item.failed_at = Some(now);
                changed = true;
                report.failed += 1;
                tracing::warn!(
                    item_id = %item.id,
                    attempts = item.attempts,
                    "Outbox item permanently failed after max attempts"
                );
                continue;
            }

            let Some(transport) = &self.transport else {
                // No recognized backend configured. Retrying cannot help, so
                // fail terminally on first encounter instead of letting the
                // attempt counter grow forever.
                item.failed = true;
                item.failed_at = Some(now);
                item.error = Some(PROVIDER_NOT_IMPLEMENTED.to_string());
                changed = true;
                report.failed += 1;
                tracing::error!(item_id = %item.id, "{}", PROVIDER_NOT_IMPLEMENTED);
                continue;
            };

            match transport.deliver(item).await {
                Ok(()) => {
                    item.sent = true;
                    item.sent_at = Some(now);
                    item.error = None;
                    changed = true;
                    report.sent += 1;
                    tracing::info!(item_id = %item.id, "Outbox item delivered");
                }
                Err(e) => {
                    item.attempts += 1;
                    let delay = backoff_delay(&self.config, item.attempts);
                    item.next_attempt_at = Some(
                        now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                    );
                    item.error = Some(e.to_string());
                    changed = true;
                    report.failed += 1;
                    tracing::warn!(
                        item_id = %item.id,
                        attempts = item.attempts,
                        retry_in_secs = delay.as_secs(),
                        "Outbox delivery failed: {}",
                        e
                    );
                }
            }
        }

        if let Some(index) = aborted_at {
            let remaining = items[index..].iter().filter(|i| i.is_pending()).count();
            report.skipped += remaining;
            tracing::warn!(
                remaining,
                "Sending disabled, aborting delivery pass"
            );
        }

        if changed {
            self.store.commit(&items).await?;
        }
        Ok(report)
    }

    /// Periodic delivery loop. Stops between passes when `shutdown` flips;
    /// a pass in progress always finishes.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Outbox delivery loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.deliver_once().await {
                        Ok(report) if report.sent + report.failed > 0 => {
                            tracing::info!(
                                sent = report.sent,
                                failed = report.failed,
                                skipped = report.skipped,
                                "Delivery pass finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!("Delivery pass failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    // A dropped sender stops the loop the same as an
                    // explicit shutdown signal.
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Outbox delivery loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
