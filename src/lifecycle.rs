//! Appointment booking and the deferred start/end transitions.
//!
//! Each scheduled appointment arms two timers: one to move it into service at
//! its start time, one to complete it at start + duration. Timers are
//! in-process only; correctness does not depend on them surviving a restart.
//! Every firing re-fetches the appointment under the business lock and
//! no-ops unless it is still `scheduled`, and `rehydrate` re-arms the whole
//! set from persisted start times on boot.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::auth::new_id;
use crate::broadcast;
use crate::conflict;
use crate::db;
use crate::error::{Error, Result};
use crate::models::{
    validate_customer_identity, AppointmentRow, AppointmentStatus, DEFAULT_SERVICE_MINUTES,
};
use crate::queue;
use crate::state::AppState;

/// Pending deferred actions, keyed by appointment id. Disarming aborts the
/// sleeping tasks; a task that slips through anyway is rendered harmless by
/// the stale-status re-check at fire time.
pub struct TimerRegistry {
    inner: Mutex<HashMap<String, TimerPair>>,
}

struct TimerPair {
    start: JoinHandle<()>,
    end: JoinHandle<()>,
}

impl TimerPair {
    fn abort(&self) {
        self.start.abort();
        self.end.abort();
    }
}

impl TimerRegistry {
    pub fn new() -> Self {
        TimerRegistry {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, appointment_id: &str, start: JoinHandle<()>, end: JoinHandle<()>) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        if let Some(previous) = map.insert(appointment_id.to_string(), TimerPair { start, end }) {
            previous.abort();
        }
    }

    /// Cancel both pending actions for an appointment.
    pub fn disarm(&self, appointment_id: &str) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        if let Some(pair) = map.remove(appointment_id) {
            pair.abort();
        }
    }

    /// Drop the bookkeeping without aborting; used by the end action on
    /// itself after it has run.
    fn forget(&self, appointment_id: &str) {
        let mut map = self.inner.lock().expect("timer registry poisoned");
        map.remove(appointment_id);
    }

    pub fn is_armed(&self, appointment_id: &str) -> bool {
        let map = self.inner.lock().expect("timer registry poisoned");
        map.contains_key(appointment_id)
    }

    pub fn armed_count(&self) -> usize {
        let map = self.inner.lock().expect("timer registry poisoned");
        map.len()
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookAppointment {
    pub employee_id: String,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub full_name: Option<String>,
    pub phone_number: Option<String>,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAppointment {
    pub starts_at: Option<DateTime<Utc>>,
    pub employee_id: Option<String>,
    pub service_id: Option<String>,
}

/// Book an appointment: conflict-check under the employee lock, persist, arm
/// both deferred actions.
pub async fn book(
    state: &AppState,
    business_id: &str,
    req: BookAppointment,
) -> Result<AppointmentRow> {
    validate_customer_identity(
        req.user_id.as_deref(),
        req.full_name.as_deref(),
        req.phone_number.as_deref(),
    )?;

    let business = db::fetch_business(&state.db, business_id).await?;
    let employee = db::fetch_employee(&state.db, &req.employee_id).await?;
    if employee.business_id != business.id {
        return Err(Error::validation("employee belongs to a different business"));
    }

    let duration_minutes = match req.service_id.as_deref() {
        Some(service_id) => {
            let service = db::fetch_service(&state.db, service_id).await?;
            if service.business_id != business.id {
                return Err(Error::validation("service belongs to a different business"));
            }
            service.duration_minutes
        }
        None => DEFAULT_SERVICE_MINUTES,
    };
    let ends_at = req.starts_at + Duration::minutes(duration_minutes);

    // Serialize conflict check + commit per employee so two concurrent
    // bookings cannot both pass against the same stale snapshot.
    let lock = state.locks.employee(&employee.id);
    let _guard = lock.lock().await;

    let candidate = crate::recurrence::Interval::new(req.starts_at, ends_at);
    conflict::check_conflict(&state.db, &business, &employee.id, candidate, None).await?;

    let appointment = AppointmentRow {
        id: new_id(),
        business_id: business.id.clone(),
        employee_id: employee.id.clone(),
        service_id: req.service_id,
        user_id: req.user_id,
        full_name: req.full_name,
        phone_number: req.phone_number,
        starts_at: req.starts_at,
        ends_at,
        status: AppointmentStatus::Scheduled,
        actual_start_at: None,
        actual_end_at: None,
        created_at: Utc::now(),
    };

    sqlx::query(
        "INSERT INTO appointments
         (id, business_id, employee_id, service_id, user_id, full_name, phone_number,
          starts_at, ends_at, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&appointment.id)
    .bind(&appointment.business_id)
    .bind(&appointment.employee_id)
    .bind(&appointment.service_id)
    .bind(&appointment.user_id)
    .bind(&appointment.full_name)
    .bind(&appointment.phone_number)
    .bind(appointment.starts_at)
    .bind(appointment.ends_at)
    .bind(appointment.status)
    .bind(appointment.created_at)
    .execute(&state.db)
    .await?;

    arm_timers(state, &appointment);

    db::log_activity(
        &state.db,
        "appointment_booked",
        &format!(
            "Appointment booked with {} at {}.",
            employee.display_name, appointment.starts_at
        ),
        Some(business_id),
        Some(&appointment.id),
    )
    .await;
    broadcast::publish(state, business_id).await;

    Ok(appointment)
}

/// Edit a scheduled appointment's slot. Re-checks conflicts with the edited
/// appointment excluded and re-arms its timers.
pub async fn update(
    state: &AppState,
    appointment_id: &str,
    req: UpdateAppointment,
) -> Result<AppointmentRow> {
    let current = db::fetch_appointment(&state.db, appointment_id).await?;
    if current.status != AppointmentStatus::Scheduled {
        return Err(Error::state_conflict(format!(
            "cannot edit a {:?} appointment",
            current.status
        )));
    }
    let business = db::fetch_business(&state.db, &current.business_id).await?;

    let employee_id = req.employee_id.unwrap_or_else(|| current.employee_id.clone());
    let employee = db::fetch_employee(&state.db, &employee_id).await?;
    if employee.business_id != business.id {
        return Err(Error::validation("employee belongs to a different business"));
    }

    let service_id = req.service_id.or_else(|| current.service_id.clone());
    let duration_minutes = match service_id.as_deref() {
        Some(id) => db::fetch_service(&state.db, id).await?.duration_minutes,
        None => DEFAULT_SERVICE_MINUTES,
    };
    let starts_at = req.starts_at.unwrap_or(current.starts_at);
    let ends_at = starts_at + Duration::minutes(duration_minutes);

    let lock = state.locks.employee(&employee_id);
    let _guard = lock.lock().await;

    let candidate = crate::recurrence::Interval::new(starts_at, ends_at);
    conflict::check_conflict(
        &state.db,
        &business,
        &employee_id,
        candidate,
        Some(appointment_id),
    )
    .await?;

    sqlx::query(
        "UPDATE appointments SET employee_id = ?, service_id = ?, starts_at = ?, ends_at = ?
         WHERE id = ?",
    )
    .bind(&employee_id)
    .bind(&service_id)
    .bind(starts_at)
    .bind(ends_at)
    .bind(appointment_id)
    .execute(&state.db)
    .await?;

    let updated = db::fetch_appointment(&state.db, appointment_id).await?;
    arm_timers(state, &updated);

    db::log_activity(
        &state.db,
        "appointment_updated",
        &format!("Appointment {appointment_id} rescheduled to {starts_at}."),
        Some(&updated.business_id),
        Some(appointment_id),
    )
    .await;
    broadcast::publish(state, &updated.business_id).await;

    Ok(updated)
}

pub async fn cancel(state: &AppState, appointment_id: &str) -> Result<AppointmentRow> {
    set_status(state, appointment_id, AppointmentStatus::Cancelled).await
}

/// Manual status change (staff marks complete or cancelled early). Suppresses
/// the pending deferred actions and performs the same release side effects
/// the end timer would have.
pub async fn set_status(
    state: &AppState,
    appointment_id: &str,
    next: AppointmentStatus,
) -> Result<AppointmentRow> {
    let found = db::fetch_appointment(&state.db, appointment_id).await?;
    let lock = state.locks.business(&found.business_id);
    let _guard = lock.lock().await;

    let appointment = db::fetch_appointment(&state.db, appointment_id).await?;
    appointment.status.ensure_transition(next)?;

    state.timers.disarm(appointment_id);

    match next {
        AppointmentStatus::Completed => {
            sqlx::query(
                "UPDATE appointments SET status = ?, actual_end_at = ? WHERE id = ?",
            )
            .bind(next)
            .bind(Utc::now())
            .bind(appointment_id)
            .execute(&state.db)
            .await?;
            queue::release_employee(&state.db, &appointment.business_id, &appointment.employee_id)
                .await?;
        }
        AppointmentStatus::Cancelled => {
            sqlx::query("UPDATE appointments SET status = ? WHERE id = ?")
                .bind(next)
                .bind(appointment_id)
                .execute(&state.db)
                .await?;
        }
        AppointmentStatus::Scheduled => unreachable!("no transition re-enters scheduled"),
    }

    db::log_activity(
        &state.db,
        "appointment_status",
        &format!("Appointment {appointment_id} marked {next:?}."),
        Some(&appointment.business_id),
        Some(appointment_id),
    )
    .await;
    broadcast::publish(state, &appointment.business_id).await;

    db::fetch_appointment(&state.db, appointment_id).await
}

/// Arm (or re-arm) the start and end actions for a scheduled appointment.
pub fn arm_timers(state: &AppState, appointment: &AppointmentRow) {
    let start_state = state.clone();
    let start_id = appointment.id.clone();
    let starts_at = appointment.starts_at;
    let start = tokio::spawn(async move {
        sleep_until_instant(starts_at).await;
        start_due(start_state, start_id).await;
    });

    let end_state = state.clone();
    let end_id = appointment.id.clone();
    let ends_at = appointment.ends_at;
    let end = tokio::spawn(async move {
        sleep_until_instant(ends_at).await;
        end_due(end_state, end_id).await;
    });

    state.timers.register(&appointment.id, start, end);
}

/// Re-arm timers for every scheduled appointment after a restart. Past-due
/// appointments fire immediately through the normal stale-status path.
pub async fn rehydrate(state: &AppState) -> Result<usize> {
    let scheduled = db::find_all_scheduled_appointments(&state.db).await?;
    let count = scheduled.len();
    for appointment in &scheduled {
        arm_timers(state, appointment);
    }
    Ok(count)
}

async fn sleep_until_instant(target: DateTime<Utc>) {
    if let Ok(delay) = (target - Utc::now()).to_std() {
        tokio::time::sleep(delay).await;
    }
}

/// Deferred start action: the appointment's start time has arrived.
pub async fn start_due(state: AppState, appointment_id: String) {
    if let Err(err) = run_start_due(&state, &appointment_id).await {
        log::warn!("appointment start action failed for {appointment_id}: {err}");
    }
}

async fn run_start_due(state: &AppState, appointment_id: &str) -> Result<()> {
    let found = db::fetch_appointment(&state.db, appointment_id).await?;
    let lock = state.locks.business(&found.business_id);
    let _guard = lock.lock().await;

    let appointment = db::fetch_appointment(&state.db, appointment_id).await?;
    if appointment.status != AppointmentStatus::Scheduled {
        // Cancelled or completed while the timer slept; expected, not an error.
        log::info!(
            "start timer for appointment {appointment_id} fired on {:?} status, ignoring",
            appointment.status
        );
        return Ok(());
    }

    queue::set_employee_status(
        &state.db,
        &appointment.employee_id,
        crate::models::EmployeeStatus::InService,
    )
    .await?;
    sqlx::query("UPDATE appointments SET actual_start_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(appointment_id)
        .execute(&state.db)
        .await?;

    broadcast::publish(state, &appointment.business_id).await;
    Ok(())
}

/// Deferred end action: start + duration has passed.
pub async fn end_due(state: AppState, appointment_id: String) {
    if let Err(err) = run_end_due(&state, &appointment_id).await {
        log::warn!("appointment end action failed for {appointment_id}: {err}");
    }
}

async fn run_end_due(state: &AppState, appointment_id: &str) -> Result<()> {
    let found = db::fetch_appointment(&state.db, appointment_id).await?;
    let lock = state.locks.business(&found.business_id);
    let _guard = lock.lock().await;

    let appointment = db::fetch_appointment(&state.db, appointment_id).await?;
    if appointment.status != AppointmentStatus::Scheduled {
        log::info!(
            "end timer for appointment {appointment_id} fired on {:?} status, ignoring",
            appointment.status
        );
        state.timers.forget(appointment_id);
        return Ok(());
    }

    sqlx::query("UPDATE appointments SET status = ?, actual_end_at = ? WHERE id = ?")
        .bind(AppointmentStatus::Completed)
        .bind(Utc::now())
        .bind(appointment_id)
        .execute(&state.db)
        .await?;
    queue::release_employee(&state.db, &appointment.business_id, &appointment.employee_id).await?;
    state.timers.forget(appointment_id);

    broadcast::publish(state, &appointment.business_id).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmployeeStatus;
    use crate::test_utils::*;

    fn booking(employee_id: &str, starts_at: DateTime<Utc>) -> BookAppointment {
        BookAppointment {
            employee_id: employee_id.to_string(),
            service_id: None,
            user_id: None,
            full_name: Some("Ana".into()),
            phone_number: Some("555-0100".into()),
            starts_at,
        }
    }

    #[tokio::test]
    async fn booking_arms_both_timers_and_persists() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let starts_at = Utc::now() + Duration::hours(2);
        let appointment = book(&state, &business.id, booking(&employee.id, starts_at))
            .await
            .unwrap();

        assert_eq!(appointment.status, AppointmentStatus::Scheduled);
        assert_eq!(appointment.ends_at, starts_at + Duration::minutes(30));
        assert!(state.timers.is_armed(&appointment.id));
    }

    #[tokio::test]
    async fn booking_requires_a_customer_identity() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let mut req = booking(&employee.id, Utc::now() + Duration::hours(1));
        req.full_name = None;
        let err = book(&state, &business.id, req).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn double_booking_is_rejected() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let starts_at = Utc::now() + Duration::hours(2);
        book(&state, &business.id, booking(&employee.id, starts_at))
            .await
            .unwrap();

        let mut clash = booking(&employee.id, starts_at + Duration::minutes(15));
        clash.phone_number = Some("555-0101".into());
        let err = book(&state, &business.id, clash).await.unwrap_err();
        assert!(matches!(err, Error::DoubleBooked));
    }

    #[tokio::test]
    async fn cancellation_before_start_suppresses_the_timers() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let appointment = book(
            &state,
            &business.id,
            booking(&employee.id, Utc::now() + Duration::minutes(2)),
        )
        .await
        .unwrap();

        cancel(&state, &appointment.id).await.unwrap();
        assert!(!state.timers.is_armed(&appointment.id));

        // Even if the armed task had slipped through, the fire path no-ops on
        // the stale status and leaves the employee untouched.
        start_due(state.clone(), appointment.id.clone()).await;

        let after = db::fetch_appointment(&state.db, &appointment.id).await.unwrap();
        assert_eq!(after.status, AppointmentStatus::Cancelled);
        assert!(after.actual_start_at.is_none());
        let untouched = db::fetch_employee(&state.db, &employee.id).await.unwrap();
        assert_eq!(untouched.status, EmployeeStatus::Available);
    }

    #[tokio::test]
    async fn start_action_moves_the_employee_into_service() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let appointment = book(
            &state,
            &business.id,
            booking(&employee.id, Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();

        start_due(state.clone(), appointment.id.clone()).await;

        let after = db::fetch_appointment(&state.db, &appointment.id).await.unwrap();
        assert!(after.actual_start_at.is_some());
        assert_eq!(after.status, AppointmentStatus::Scheduled);
        let busy = db::fetch_employee(&state.db, &employee.id).await.unwrap();
        assert_eq!(busy.status, EmployeeStatus::InService);
    }

    #[tokio::test]
    async fn end_action_completes_and_reassigns_the_freed_employee() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let appointment = book(
            &state,
            &business.id,
            booking(&employee.id, Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();
        start_due(state.clone(), appointment.id.clone()).await;

        // A walk-in is waiting, unassigned, and serviceable by anyone.
        let mut waiting = queue_entry_template(&business.id);
        waiting.position = 1;
        insert_queue_entry(&state.db, &waiting).await;

        end_due(state.clone(), appointment.id.clone()).await;

        let after = db::fetch_appointment(&state.db, &appointment.id).await.unwrap();
        assert_eq!(after.status, AppointmentStatus::Completed);
        assert!(after.actual_end_at.is_some());
        let freed = db::fetch_employee(&state.db, &employee.id).await.unwrap();
        assert_eq!(freed.status, EmployeeStatus::Available);
        let head = db::fetch_queue_entry(&state.db, &waiting.id).await.unwrap();
        assert_eq!(head.employee_id.as_deref(), Some(employee.id.as_str()));
        assert!(!state.timers.is_armed(&appointment.id));
    }

    #[tokio::test]
    async fn manual_completion_disarms_and_releases() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let appointment = book(
            &state,
            &business.id,
            booking(&employee.id, Utc::now() + Duration::hours(1)),
        )
        .await
        .unwrap();
        start_due(state.clone(), appointment.id.clone()).await;

        let done = set_status(&state, &appointment.id, AppointmentStatus::Completed)
            .await
            .unwrap();
        assert_eq!(done.status, AppointmentStatus::Completed);
        assert!(!state.timers.is_armed(&appointment.id));
        let freed = db::fetch_employee(&state.db, &employee.id).await.unwrap();
        assert_eq!(freed.status, EmployeeStatus::Available);

        // Terminal now; a second manual update is a state conflict.
        let err = set_status(&state, &appointment.id, AppointmentStatus::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict(_)));
    }

    #[tokio::test]
    async fn editing_keeps_the_same_slot_conflict_free() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let starts_at = Utc::now() + Duration::hours(2);
        let appointment = book(&state, &business.id, booking(&employee.id, starts_at))
            .await
            .unwrap();

        // Nudging by 10 minutes overlaps the original slot, which must be
        // excluded from its own conflict check.
        let updated = update(
            &state,
            &appointment.id,
            UpdateAppointment {
                starts_at: Some(starts_at + Duration::minutes(10)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.starts_at, starts_at + Duration::minutes(10));
        assert!(state.timers.is_armed(&appointment.id));
    }

    #[tokio::test]
    async fn rehydrate_rearms_scheduled_appointments_only() {
        let state = test_state().await;
        let business = insert_business_24h(&state.db).await;
        let employee = insert_employee(&state.db, &business.id, EmployeeStatus::Available).await;

        let kept = book(
            &state,
            &business.id,
            booking(&employee.id, Utc::now() + Duration::hours(3)),
        )
        .await
        .unwrap();
        let mut other = booking(&employee.id, Utc::now() + Duration::hours(5));
        other.phone_number = Some("555-0102".into());
        let gone = book(&state, &business.id, other).await.unwrap();
        cancel(&state, &gone.id).await.unwrap();

        // Simulate a restart: empty registry, re-arm from the store.
        let restarted = test_state_with_pool(state.db.clone());
        assert_eq!(restarted.timers.armed_count(), 0);
        let armed = rehydrate(&restarted).await.unwrap();
        assert_eq!(armed, 1);
        assert!(restarted.timers.is_armed(&kept.id));
        assert!(!restarted.timers.is_armed(&gone.id));
    }
}
