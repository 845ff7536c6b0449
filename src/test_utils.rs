//! Shared fixtures for the in-crate test suites: an in-memory SQLite store
//! with the real migrations applied, plus minimal entity builders.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::auth::new_id;
use crate::db;
use crate::models::{
    AppointmentRow, AppointmentStatus, BusinessRow, EmployeeRow, EmployeeStatus, QueueEntryRow,
    QueueStatus,
};
use crate::state::AppState;

pub async fn setup_test_db() -> SqlitePool {
    // A single connection keeps every handle on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    db::run_migrations(&pool).await.expect("migrations");
    pool
}

pub async fn test_state() -> AppState {
    AppState::new(setup_test_db().await)
}

pub fn test_state_with_pool(pool: SqlitePool) -> AppState {
    AppState::new(pool)
}

pub async fn insert_business(pool: &SqlitePool, average_wait_time: f64) -> BusinessRow {
    let id = new_id();
    sqlx::query(
        "INSERT INTO businesses (id, name, address, timezone, average_wait_time, is_open_24_hours,
                                 created_at)
         VALUES (?, 'Fade Factory', '1 Main St', 'UTC', ?, 0, ?)",
    )
    .bind(&id)
    .bind(average_wait_time)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("insert business");
    db::fetch_business(pool, &id).await.expect("fetch business")
}

pub async fn insert_business_24h(pool: &SqlitePool) -> BusinessRow {
    let business = insert_business(pool, 20.0).await;
    sqlx::query("UPDATE businesses SET is_open_24_hours = 1 WHERE id = ?")
        .bind(&business.id)
        .execute(pool)
        .await
        .expect("set 24h flag");
    db::fetch_business(pool, &business.id).await.expect("fetch business")
}

pub async fn insert_employee(
    pool: &SqlitePool,
    business_id: &str,
    status: EmployeeStatus,
) -> EmployeeRow {
    let id = new_id();
    sqlx::query(
        "INSERT INTO employees (id, business_id, display_name, status) VALUES (?, ?, 'Sam', ?)",
    )
    .bind(&id)
    .bind(business_id)
    .bind(status)
    .execute(pool)
    .await
    .expect("insert employee");
    db::fetch_employee(pool, &id).await.expect("fetch employee")
}

pub async fn insert_appointment(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: &str,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> AppointmentRow {
    insert_appointment_named(pool, business_id, employee_id, "Client", starts_at, ends_at).await
}

pub async fn insert_appointment_named(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: &str,
    full_name: &str,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) -> AppointmentRow {
    let id = new_id();
    sqlx::query(
        "INSERT INTO appointments
         (id, business_id, employee_id, full_name, phone_number, starts_at, ends_at, status,
          created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(business_id)
    .bind(employee_id)
    .bind(full_name)
    .bind(format!("555-{}", &id[..8]))
    .bind(starts_at)
    .bind(ends_at)
    .bind(AppointmentStatus::Scheduled)
    .bind(Utc::now())
    .execute(pool)
    .await
    .expect("insert appointment");
    db::fetch_appointment(pool, &id).await.expect("fetch appointment")
}

/// An unassigned, unserviced walk-in entry; adjust fields before inserting.
pub fn queue_entry_template(business_id: &str) -> QueueEntryRow {
    let id = new_id();
    QueueEntryRow {
        phone_number: format!("555-{}", &id[..8]),
        id,
        business_id: business_id.to_string(),
        service_id: None,
        employee_id: None,
        full_name: "Walk-in".to_string(),
        status: QueueStatus::CheckedIn,
        position: 1,
        checked_in_at: Utc::now(),
        service_started_at: None,
        service_ended_at: None,
        estimated_start_at: None,
    }
}

pub async fn insert_queue_entry(pool: &SqlitePool, entry: &QueueEntryRow) {
    sqlx::query(
        "INSERT INTO queue_entries
         (id, business_id, service_id, employee_id, full_name, phone_number, status, position,
          checked_in_at, service_started_at, service_ended_at, estimated_start_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
    .bind(entry.service_started_at)
    .bind(entry.service_ended_at)
    .bind(entry.estimated_start_at)
    .execute(pool)
    .await
    .expect("insert queue entry");
}

pub async fn insert_schedule(
    pool: &SqlitePool,
    employee_id: &str,
    day_of_week: i64,
    start_time: &str,
    end_time: &str,
) {
    sqlx::query(
        "INSERT INTO work_schedules (id, employee_id, day_of_week, start_time, end_time, is_working)
         VALUES (?, ?, ?, ?, ?, 1)",
    )
    .bind(new_id())
    .bind(employee_id)
    .bind(day_of_week)
    .bind(start_time)
    .bind(end_time)
    .execute(pool)
    .await
    .expect("insert schedule");
}

pub async fn insert_closure(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: Option<&str>,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
) {
    sqlx::query(
        "INSERT INTO schedule_overrides
         (id, business_id, employee_id, starts_at, ends_at, repeat, kind)
         VALUES (?, ?, ?, ?, ?, 'none', 'closure')",
    )
    .bind(new_id())
    .bind(business_id)
    .bind(employee_id)
    .bind(starts_at)
    .bind(ends_at)
    .execute(pool)
    .await
    .expect("insert closure override");
}
