//! The walk-in queue: ordered, re-orderable, renumbered on every retirement
//! so active positions always form a dense `1..N`.
//!
//! Every mutation here runs under the per-business lock and republishes the
//! display snapshot afterwards.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::auth::new_id;
use crate::broadcast;
use crate::db;
use crate::error::{Error, Result};
use crate::models::{
    BusinessRow, EmployeeRow, EmployeeStatus, QueueEntryRow, QueueStatus, DEFAULT_SERVICE_MINUTES,
};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct JoinQueue {
    pub full_name: String,
    pub phone_number: String,
    pub service_id: Option<String>,
}

/// Check a walk-in customer into the line. Assigns the next dense position
/// and eagerly pins an employee who is free right now, though the entry
/// stays `checked_in` until service actually starts.
pub async fn join(state: &AppState, business_id: &str, req: JoinQueue) -> Result<QueueEntryRow> {
    let full_name = req.full_name.trim().to_string();
    let phone_number = req.phone_number.trim().to_string();
    if full_name.is_empty() || phone_number.is_empty() {
        return Err(Error::validation("full name and phone number are required"));
    }

    let business = db::fetch_business(&state.db, business_id).await?;
    let lock = state.locks.business(business_id);
    let _guard = lock.lock().await;

    if db::find_active_entry_by_phone(&state.db, business_id, &phone_number)
        .await?
        .is_some()
    {
        return Err(Error::AlreadyInQueue);
    }

    let duration_minutes = match req.service_id.as_deref() {
        Some(service_id) => {
            let service = db::fetch_service(&state.db, service_id).await?;
            if service.business_id != business.id {
                return Err(Error::validation("service belongs to a different business"));
            }
            if !service.active {
                return Err(Error::validation("service is no longer offered"));
            }
            service.duration_minutes
        }
        None => DEFAULT_SERVICE_MINUTES,
    };

    let now = Utc::now();
    let position = db::count_active_queue(&state.db, business_id).await? + 1;
    let matched =
        match_free_employee(&state.db, &business, req.service_id.as_deref(), duration_minutes, now)
            .await?;
    let estimated_start_at = linear_estimate(now, business.average_wait_time, position - 1);

    let entry = QueueEntryRow {
        id: new_id(),
        business_id: business.id.clone(),
        service_id: req.service_id,
        employee_id: matched.as_ref().map(|e| e.id.clone()),
        full_name,
        phone_number,
        status: QueueStatus::CheckedIn,
        position,
        checked_in_at: now,
        service_started_at: None,
        service_ended_at: None,
        estimated_start_at: Some(estimated_start_at),
    };

    sqlx::query(
        "INSERT INTO queue_entries
         (id, business_id, service_id, employee_id, full_name, phone_number, status, position,
          checked_in_at, estimated_start_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.id)
    .bind(&entry.business_id)
    .bind(&entry.service_id)
    .bind(&entry.employee_id)
    .bind(&entry.full_name)
    .bind(&entry.phone_number)
    .bind(entry.status)
    .bind(entry.position)
    .bind(entry.checked_in_at)
    .bind(entry.estimated_start_at)
    .execute(&state.db)
    .await?;

    db::log_activity(
        &state.db,
        "queue_joined",
        &format!("{} joined the queue at position {}.", entry.full_name, entry.position),
        Some(business_id),
        Some(&entry.id),
    )
    .await;
    broadcast::publish(state, business_id).await;

    Ok(entry)
}

/// Move one active entry to `new_position` (1-based) and renumber the whole
/// active list. Waiting entries get a fresh linear wait estimate.
pub async fn reorder(
    state: &AppState,
    business_id: &str,
    entry_id: &str,
    new_position: i64,
) -> Result<Vec<QueueEntryRow>> {
    let business = db::fetch_business(&state.db, business_id).await?;
    let lock = state.locks.business(business_id);
    let _guard = lock.lock().await;

    let mut active = db::find_active_queue(&state.db, business_id).await?;
    let from = active
        .iter()
        .position(|entry| entry.id == entry_id)
        .ok_or(Error::NotFound("queue entry"))?;

    let count = active.len() as i64;
    if new_position < 1 || new_position > count {
        return Err(Error::validation(format!(
            "position must be between 1 and {count}"
        )));
    }

    let moved = active.remove(from);
    active.insert((new_position - 1) as usize, moved);

    let now = Utc::now();
    for (index, entry) in active.iter_mut().enumerate() {
        entry.position = index as i64 + 1;
        if entry.status == QueueStatus::CheckedIn {
            // Coarse pacing model: average wait per person ahead, not
            // per-service durations.
            entry.estimated_start_at =
                Some(linear_estimate(now, business.average_wait_time, index as i64));
        }
        sqlx::query("UPDATE queue_entries SET position = ?, estimated_start_at = ? WHERE id = ?")
            .bind(entry.position)
            .bind(entry.estimated_start_at)
            .bind(&entry.id)
            .execute(&state.db)
            .await?;
    }

    db::log_activity(
        &state.db,
        "queue_reordered",
        &format!("Queue entry {entry_id} moved to position {new_position}."),
        Some(business_id),
        Some(entry_id),
    )
    .await;
    broadcast::publish(state, business_id).await;

    Ok(active)
}

/// Drive a queue entry through its state machine. Illegal transitions are
/// rejected centrally by the transition table before any side effect runs.
pub async fn update_status(
    state: &AppState,
    entry_id: &str,
    next: QueueStatus,
) -> Result<QueueEntryRow> {
    let found = db::fetch_queue_entry(&state.db, entry_id).await?;
    let business_id = found.business_id.clone();
    let lock = state.locks.business(&business_id);
    let _guard = lock.lock().await;

    // Re-read under the lock; the entry may have moved since the first fetch.
    let entry = db::fetch_queue_entry(&state.db, entry_id).await?;
    entry.status.ensure_transition(next)?;

    let now = Utc::now();
    match next {
        QueueStatus::Arrived => {
            sqlx::query("UPDATE queue_entries SET status = ? WHERE id = ?")
                .bind(next)
                .bind(entry_id)
                .execute(&state.db)
                .await?;
        }
        QueueStatus::InService => {
            let employee_id = match entry.employee_id.clone() {
                Some(id) => id,
                None => {
                    let business = db::fetch_business(&state.db, &business_id).await?;
                    let duration = entry_duration_minutes(&state.db, &entry).await?;
                    match_free_employee(
                        &state.db,
                        &business,
                        entry.service_id.as_deref(),
                        duration,
                        now,
                    )
                    .await?
                    .map(|e| e.id)
                    .ok_or_else(|| {
                        Error::state_conflict("no available employee to start this service")
                    })?
                }
            };
            sqlx::query(
                "UPDATE queue_entries
                 SET status = ?, employee_id = ?, service_started_at = ?, position = 0
                 WHERE id = ?",
            )
            .bind(next)
            .bind(&employee_id)
            .bind(now)
            .bind(entry_id)
            .execute(&state.db)
            .await?;
            set_employee_status(&state.db, &employee_id, EmployeeStatus::InService).await?;
            renumber(&state.db, &business_id).await?;
        }
        QueueStatus::Completed => {
            sqlx::query(
                "UPDATE queue_entries SET status = ?, service_ended_at = ?, position = 0 WHERE id = ?",
            )
            .bind(next)
            .bind(now)
            .bind(entry_id)
            .execute(&state.db)
            .await?;
            if let Some(employee_id) = entry.employee_id.as_deref() {
                release_employee(&state.db, &business_id, employee_id).await?;
            }
            renumber(&state.db, &business_id).await?;
        }
        QueueStatus::Cancelled => {
            sqlx::query("UPDATE queue_entries SET status = ?, position = 0 WHERE id = ?")
                .bind(next)
                .bind(entry_id)
                .execute(&state.db)
                .await?;
            renumber(&state.db, &business_id).await?;
        }
        QueueStatus::CheckedIn => unreachable!("no transition re-enters checked_in"),
    }

    db::log_activity(
        &state.db,
        "queue_status",
        &format!("Queue entry {entry_id} moved to {next:?}."),
        Some(&business_id),
        Some(entry_id),
    )
    .await;
    broadcast::publish(state, &business_id).await;

    db::fetch_queue_entry(&state.db, entry_id).await
}

/// Repoint an entry at a different employee (or unassign it). Only allowed
/// before service starts.
pub async fn assign_employee(
    state: &AppState,
    entry_id: &str,
    employee_id: Option<String>,
) -> Result<QueueEntryRow> {
    let found = db::fetch_queue_entry(&state.db, entry_id).await?;
    let lock = state.locks.business(&found.business_id);
    let _guard = lock.lock().await;

    let entry = db::fetch_queue_entry(&state.db, entry_id).await?;
    if !entry.status.allows_reassignment() {
        return Err(Error::state_conflict(
            "employee can only change before service starts",
        ));
    }
    if let Some(id) = employee_id.as_deref() {
        let employee = db::fetch_employee(&state.db, id).await?;
        if employee.business_id != entry.business_id {
            return Err(Error::validation("employee belongs to a different business"));
        }
    }

    sqlx::query("UPDATE queue_entries SET employee_id = ? WHERE id = ?")
        .bind(&employee_id)
        .bind(entry_id)
        .execute(&state.db)
        .await?;
    broadcast::publish(state, &entry.business_id).await;

    db::fetch_queue_entry(&state.db, entry_id).await
}

/// Mark the employee available again and hand them the head-most unassigned
/// entry they can serve, if any.
pub async fn release_employee(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: &str,
) -> Result<Option<QueueEntryRow>> {
    set_employee_status(pool, employee_id, EmployeeStatus::Available).await?;

    let Some(head) = db::find_unassigned_head(pool, business_id, employee_id).await? else {
        return Ok(None);
    };
    sqlx::query("UPDATE queue_entries SET employee_id = ? WHERE id = ?")
        .bind(employee_id)
        .bind(&head.id)
        .execute(pool)
        .await?;
    log::info!("employee {employee_id} auto-assigned to queue entry {}", head.id);
    Ok(Some(head))
}

pub async fn set_employee_status(
    pool: &SqlitePool,
    employee_id: &str,
    status: EmployeeStatus,
) -> Result<()> {
    sqlx::query("UPDATE employees SET status = ? WHERE id = ?")
        .bind(status)
        .bind(employee_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Close the gap left by a retired entry: active positions become `1..N`
/// again, in the existing order.
async fn renumber(pool: &SqlitePool, business_id: &str) -> Result<()> {
    let active = db::find_active_queue(pool, business_id).await?;
    for (index, entry) in active.iter().enumerate() {
        let position = index as i64 + 1;
        if entry.position != position {
            sqlx::query("UPDATE queue_entries SET position = ? WHERE id = ?")
                .bind(position)
                .bind(&entry.id)
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// An employee who can take a walk-in immediately: available, capable of the
/// requested service, and with no scheduled appointment starting before the
/// walk-in would finish.
async fn match_free_employee(
    pool: &SqlitePool,
    business: &BusinessRow,
    service_id: Option<&str>,
    duration_minutes: i64,
    now: DateTime<Utc>,
) -> Result<Option<EmployeeRow>> {
    let horizon = now + Duration::hours(crate::availability::AVAILABILITY_HORIZON_HOURS);
    for employee in db::find_capable_employees(pool, &business.id, service_id).await? {
        if employee.status != EmployeeStatus::Available {
            continue;
        }
        if db::count_assigned_open_entries(pool, &employee.id).await? > 0 {
            continue;
        }
        let upcoming = db::find_scheduled_appointments(pool, &employee.id, now, horizon).await?;
        let free_until_done = upcoming
            .first()
            .map(|appt| appt.starts_at >= now + Duration::minutes(duration_minutes))
            .unwrap_or(true);
        if free_until_done {
            return Ok(Some(employee));
        }
    }
    Ok(None)
}

async fn entry_duration_minutes(pool: &SqlitePool, entry: &QueueEntryRow) -> Result<i64> {
    Ok(match entry.service_id.as_deref() {
        Some(service_id) => db::fetch_service(pool, service_id).await?.duration_minutes,
        None => DEFAULT_SERVICE_MINUTES,
    })
}

fn linear_estimate(now: DateTime<Utc>, average_wait_minutes: f64, people_ahead: i64) -> DateTime<Utc> {
    now + Duration::minutes((average_wait_minutes * people_ahead as f64).round() as i64)
}
