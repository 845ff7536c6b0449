//! Per-business fan-out of display snapshots.
//!
//! Snapshots are rebuilt from the store on every publish rather than patched
//! incrementally, so observers can never drift from the persisted state.
//! Observers that lag or disconnect simply fall off their channel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::broadcast::{channel, Receiver, Sender};
use tokio::task::JoinHandle;

use crate::availability;
use crate::db;
use crate::error::Result;
use crate::models::DEFAULT_SERVICE_MINUTES;
use crate::state::AppState;

const CHANNEL_CAPACITY: usize = 16;

/// How often connected observers get a fresh snapshot even without
/// mutations.
pub const REFRESH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    WalkIn,
    Appointment,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotItem {
    pub name: String,
    pub kind: SnapshotKind,
    pub service: Option<String>,
    pub position: i64,
    pub estimated_duration_minutes: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub business_id: String,
    pub business_name: String,
    pub generated_at: DateTime<Utc>,
    pub estimated_wait_minutes: i64,
    pub items: Vec<SnapshotItem>,
}

/// Registry of observer channels keyed by business id. Lifecycle-scoped:
/// owned by `AppState`, not a module global.
pub struct Fanout {
    channels: Mutex<HashMap<String, Sender<QueueSnapshot>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Fanout {
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, business_id: &str) -> Receiver<QueueSnapshot> {
        let mut map = self.channels.lock().expect("fanout registry poisoned");
        map.entry(business_id.to_string())
            .or_insert_with(|| channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn observer_count(&self, business_id: &str) -> usize {
        let map = self.channels.lock().expect("fanout registry poisoned");
        map.get(business_id).map_or(0, Sender::receiver_count)
    }

    /// Businesses with at least one live observer; dead channels are pruned
    /// on the way.
    pub fn active_businesses(&self) -> Vec<String> {
        let mut map = self.channels.lock().expect("fanout registry poisoned");
        map.retain(|_, sender| sender.receiver_count() > 0);
        map.keys().cloned().collect()
    }

    fn send(&self, business_id: &str, snapshot: QueueSnapshot) {
        let mut map = self.channels.lock().expect("fanout registry poisoned");
        if let Some(sender) = map.get(business_id) {
            // A send error means every receiver is gone; drop the channel.
            if sender.send(snapshot).is_err() {
                map.remove(business_id);
            }
        }
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic projection of the live queue: walk-ins in line order merged
/// with today's remaining appointments by start time, renumbered across the
/// combined view.
pub async fn build_snapshot(pool: &SqlitePool, business_id: &str) -> Result<QueueSnapshot> {
    let business = db::fetch_business(pool, business_id).await?;
    let now = Utc::now();
    let average = business.average_wait_time;

    let mut keyed: Vec<(DateTime<Utc>, SnapshotItem)> = Vec::new();

    for entry in db::find_active_queue(pool, business_id).await? {
        let (service_name, duration) = match entry.service_id.as_deref() {
            Some(service_id) => {
                let service = db::fetch_service(pool, service_id).await?;
                (Some(service.name), service.duration_minutes)
            }
            None => (None, DEFAULT_SERVICE_MINUTES),
        };
        let sort_key = entry.estimated_start_at.unwrap_or_else(|| {
            now + Duration::minutes((average * entry.position as f64).round() as i64)
        });
        keyed.push((
            sort_key,
            SnapshotItem {
                name: entry.full_name,
                kind: SnapshotKind::WalkIn,
                service: service_name,
                position: entry.position,
                estimated_duration_minutes: duration,
                scheduled_for: None,
            },
        ));
    }

    for appointment in db::find_appointments_for_snapshot(pool, business_id, now).await? {
        let service_name = match appointment.service_id.as_deref() {
            Some(service_id) => Some(db::fetch_service(pool, service_id).await?.name),
            None => None,
        };
        let name = appointment
            .full_name
            .clone()
            .unwrap_or_else(|| "Appointment".to_string());
        keyed.push((
            appointment.starts_at,
            SnapshotItem {
                name,
                kind: SnapshotKind::Appointment,
                service: service_name,
                position: 0,
                estimated_duration_minutes: appointment.duration().num_minutes(),
                scheduled_for: Some(appointment.starts_at),
            },
        ));
    }

    // Stable by arrival estimate: walk-ins keep their queue order,
    // appointments slot in by start time.
    keyed.sort_by_key(|(key, _)| *key);
    let items = keyed
        .into_iter()
        .enumerate()
        .map(|(index, (_, mut item))| {
            item.position = index as i64 + 1;
            item
        })
        .collect();

    let estimated_wait_minutes = availability::estimated_wait(pool, &business, None).await?;

    Ok(QueueSnapshot {
        business_id: business.id,
        business_name: business.name,
        generated_at: now,
        estimated_wait_minutes,
        items,
    })
}

/// Rebuild and deliver the snapshot for a business. Best-effort: failures
/// are logged, never propagated into the mutation that triggered them.
pub async fn publish(state: &AppState, business_id: &str) {
    if state.fanout.observer_count(business_id) == 0 {
        return;
    }
    match build_snapshot(&state.db, business_id).await {
        Ok(snapshot) => state.fanout.send(business_id, snapshot),
        Err(err) => log::warn!("snapshot build failed for business {business_id}: {err}"),
    }
}

/// Periodic refresh for businesses with connected observers, so clients stay
/// current even across mutations they never triggered.
pub fn spawn_refresh_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(REFRESH_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for business_id in state.fanout.active_businesses() {
                match build_snapshot(&state.db, &business_id).await {
                    Ok(snapshot) => {
                        state.fanout.send(&business_id, snapshot);
                        log::debug!(
                            "refreshed snapshot for business {business_id} ({} observers)",
                            state.fanout.observer_count(&business_id)
                        );
                    }
                    Err(err) => {
                        log::warn!("periodic refresh failed for business {business_id}: {err}")
                    }
                }
            }
        }
    })
}
