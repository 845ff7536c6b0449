use std::future::Future;
use std::{env, fs, path::Path};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::auth::{hash_password, new_id};
use crate::error::{Error, Result};
use crate::models::{
    AppointmentRow, BusinessRow, EmployeeRow, OverrideRow, QueueEntryRow, ServiceRow, UserRow,
    WorkScheduleRow, ROLE_OWNER,
};

pub async fn run_migrations(pool: &SqlitePool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

pub fn ensure_sqlite_dir(db_url: &str) -> std::io::Result<()> {
    let path = if let Some(path) = db_url.strip_prefix("sqlite://") {
        Some(path)
    } else if let Some(path) = db_url.strip_prefix("sqlite:") {
        Some(path)
    } else {
        None
    };

    let Some(path) = path else {
        return Ok(());
    };

    let path = path.split('?').next().unwrap_or(path);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }

    let path = path.strip_prefix("file:").unwrap_or(path);
    let db_path = Path::new(path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Idempotent reads are retried once on a transient storage error. Mutations
/// never are.
async fn retry_read<T, F, Fut>(op: F) -> std::result::Result<T, sqlx::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) => {
            log::warn!("read failed, retrying once: {first}");
            op().await
        }
    }
}

pub async fn fetch_business(pool: &SqlitePool, id: &str) -> Result<BusinessRow> {
    retry_read(|| {
        sqlx::query_as::<_, BusinessRow>(
            "SELECT id, name, address, timezone, average_wait_time, is_open_24_hours
             FROM businesses WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("business"))
}

pub async fn find_businesses(pool: &SqlitePool) -> Result<Vec<BusinessRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, BusinessRow>(
            "SELECT id, name, address, timezone, average_wait_time, is_open_24_hours
             FROM businesses ORDER BY name",
        )
        .fetch_all(pool)
    })
    .await?)
}

pub async fn fetch_employee(pool: &SqlitePool, id: &str) -> Result<EmployeeRow> {
    retry_read(|| {
        sqlx::query_as::<_, EmployeeRow>(
            "SELECT id, business_id, user_id, display_name, status FROM employees WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("employee"))
}

pub async fn fetch_employee_for_user(pool: &SqlitePool, user_id: &str) -> Result<EmployeeRow> {
    retry_read(|| {
        sqlx::query_as::<_, EmployeeRow>(
            "SELECT id, business_id, user_id, display_name, status FROM employees WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("employee"))
}

pub async fn find_employees(pool: &SqlitePool, business_id: &str) -> Result<Vec<EmployeeRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, EmployeeRow>(
            "SELECT id, business_id, user_id, display_name, status
             FROM employees WHERE business_id = ? ORDER BY display_name",
        )
        .bind(business_id)
        .fetch_all(pool)
    })
    .await?)
}

/// Employees of the business able to perform `service_id`, or every employee
/// when no service is requested.
pub async fn find_capable_employees(
    pool: &SqlitePool,
    business_id: &str,
    service_id: Option<&str>,
) -> Result<Vec<EmployeeRow>> {
    let rows = match service_id {
        Some(service_id) => {
            retry_read(|| {
                sqlx::query_as::<_, EmployeeRow>(
                    "SELECT e.id, e.business_id, e.user_id, e.display_name, e.status
                     FROM employees e
                     JOIN employee_services es ON es.employee_id = e.id
                     WHERE e.business_id = ? AND es.service_id = ?
                     ORDER BY e.display_name",
                )
                .bind(business_id)
                .bind(service_id)
                .fetch_all(pool)
            })
            .await?
        }
        None => find_employees(pool, business_id).await?,
    };
    Ok(rows)
}

pub async fn fetch_service(pool: &SqlitePool, id: &str) -> Result<ServiceRow> {
    retry_read(|| {
        sqlx::query_as::<_, ServiceRow>(
            "SELECT id, business_id, name, duration_minutes, price, active
             FROM services WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("service"))
}

pub async fn find_services(pool: &SqlitePool, business_id: &str) -> Result<Vec<ServiceRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, ServiceRow>(
            "SELECT id, business_id, name, duration_minutes, price, active
             FROM services WHERE business_id = ? AND active = 1 ORDER BY name",
        )
        .bind(business_id)
        .fetch_all(pool)
    })
    .await?)
}

pub async fn fetch_appointment(pool: &SqlitePool, id: &str) -> Result<AppointmentRow> {
    retry_read(|| {
        sqlx::query_as::<_, AppointmentRow>(
            "SELECT id, business_id, employee_id, service_id, user_id, full_name, phone_number,
                    starts_at, ends_at, status, actual_start_at, actual_end_at, created_at
             FROM appointments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("appointment"))
}

pub async fn find_scheduled_appointments(
    pool: &SqlitePool,
    employee_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<AppointmentRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, AppointmentRow>(
            "SELECT id, business_id, employee_id, service_id, user_id, full_name, phone_number,
                    starts_at, ends_at, status, actual_start_at, actual_end_at, created_at
             FROM appointments
             WHERE employee_id = ? AND status = 'scheduled' AND starts_at >= ? AND starts_at < ?
             ORDER BY starts_at",
        )
        .bind(employee_id)
        .bind(window_start)
        .bind(window_end)
        .fetch_all(pool)
    })
    .await?)
}

/// Scheduled appointments overlapping `[window_start, window_end)`, used by
/// the conflict detector (an appointment started before the window can still
/// collide with it).
pub async fn find_overlapping_appointments(
    pool: &SqlitePool,
    employee_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<Vec<AppointmentRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, AppointmentRow>(
            "SELECT id, business_id, employee_id, service_id, user_id, full_name, phone_number,
                    starts_at, ends_at, status, actual_start_at, actual_end_at, created_at
             FROM appointments
             WHERE employee_id = ? AND status = 'scheduled' AND starts_at < ? AND ends_at > ?
             ORDER BY starts_at",
        )
        .bind(employee_id)
        .bind(window_end)
        .bind(window_start)
        .fetch_all(pool)
    })
    .await?)
}

/// Every scheduled appointment in the store; used to re-arm timers on
/// startup.
pub async fn find_all_scheduled_appointments(pool: &SqlitePool) -> Result<Vec<AppointmentRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, AppointmentRow>(
            "SELECT id, business_id, employee_id, service_id, user_id, full_name, phone_number,
                    starts_at, ends_at, status, actual_start_at, actual_end_at, created_at
             FROM appointments WHERE status = 'scheduled' ORDER BY starts_at",
        )
        .fetch_all(pool)
    })
    .await?)
}

/// Today's remaining scheduled appointments for a business, for the display
/// snapshot.
pub async fn find_appointments_for_snapshot(
    pool: &SqlitePool,
    business_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<AppointmentRow>> {
    let day_end = (now + Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(now + Duration::days(1));
    Ok(retry_read(|| {
        sqlx::query_as::<_, AppointmentRow>(
            "SELECT id, business_id, employee_id, service_id, user_id, full_name, phone_number,
                    starts_at, ends_at, status, actual_start_at, actual_end_at, created_at
             FROM appointments
             WHERE business_id = ? AND status = 'scheduled' AND starts_at >= ? AND starts_at < ?
             ORDER BY starts_at",
        )
        .bind(business_id)
        .bind(now)
        .bind(day_end)
        .fetch_all(pool)
    })
    .await?)
}

pub async fn fetch_queue_entry(pool: &SqlitePool, id: &str) -> Result<QueueEntryRow> {
    retry_read(|| {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT id, business_id, service_id, employee_id, full_name, phone_number, status,
                    position, checked_in_at, service_started_at, service_ended_at, estimated_start_at
             FROM queue_entries WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
    })
    .await?
    .ok_or(Error::NotFound("queue entry"))
}

/// Active entries of a business in line order.
pub async fn find_active_queue(pool: &SqlitePool, business_id: &str) -> Result<Vec<QueueEntryRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT id, business_id, service_id, employee_id, full_name, phone_number, status,
                    position, checked_in_at, service_started_at, service_ended_at, estimated_start_at
             FROM queue_entries
             WHERE business_id = ? AND status IN ('checked_in', 'arrived')
             ORDER BY position",
        )
        .bind(business_id)
        .fetch_all(pool)
    })
    .await?)
}

pub async fn count_active_queue(pool: &SqlitePool, business_id: &str) -> Result<i64> {
    Ok(retry_read(|| {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_entries
             WHERE business_id = ? AND status IN ('checked_in', 'arrived')",
        )
        .bind(business_id)
        .fetch_one(pool)
    })
    .await?)
}

pub async fn find_active_entry_by_phone(
    pool: &SqlitePool,
    business_id: &str,
    phone_number: &str,
) -> Result<Option<QueueEntryRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT id, business_id, service_id, employee_id, full_name, phone_number, status,
                    position, checked_in_at, service_started_at, service_ended_at, estimated_start_at
             FROM queue_entries
             WHERE business_id = ? AND phone_number = ? AND status IN ('checked_in', 'arrived', 'in_service')
             LIMIT 1",
        )
        .bind(business_id)
        .bind(phone_number)
        .fetch_optional(pool)
    })
    .await?)
}

/// Queue work committed to an employee, oldest check-in first.
pub async fn find_assigned_queue_work(
    pool: &SqlitePool,
    employee_id: &str,
) -> Result<Vec<QueueEntryRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT id, business_id, service_id, employee_id, full_name, phone_number, status,
                    position, checked_in_at, service_started_at, service_ended_at, estimated_start_at
             FROM queue_entries
             WHERE employee_id = ? AND status IN ('in_service', 'checked_in')
             ORDER BY checked_in_at",
        )
        .bind(employee_id)
        .fetch_all(pool)
    })
    .await?)
}

/// The head-most active entry without an assigned employee whose requested
/// service (if any) the employee can perform.
pub async fn find_unassigned_head(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: &str,
) -> Result<Option<QueueEntryRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, QueueEntryRow>(
            "SELECT q.id, q.business_id, q.service_id, q.employee_id, q.full_name, q.phone_number,
                    q.status, q.position, q.checked_in_at, q.service_started_at, q.service_ended_at,
                    q.estimated_start_at
             FROM queue_entries q
             WHERE q.business_id = ? AND q.employee_id IS NULL
               AND q.status IN ('checked_in', 'arrived')
               AND (q.service_id IS NULL OR q.service_id IN
                    (SELECT service_id FROM employee_services WHERE employee_id = ?))
             ORDER BY q.position
             LIMIT 1",
        )
        .bind(business_id)
        .bind(employee_id)
        .fetch_optional(pool)
    })
    .await?)
}

/// Open walk-in entries already pointing at an employee, in any pre-terminal
/// state. A nonzero count means the employee is spoken for.
pub async fn count_assigned_open_entries(pool: &SqlitePool, employee_id: &str) -> Result<i64> {
    Ok(retry_read(|| {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queue_entries
             WHERE employee_id = ? AND status IN ('checked_in', 'arrived', 'in_service')",
        )
        .bind(employee_id)
        .fetch_one(pool)
    })
    .await?)
}

pub async fn find_work_schedules(
    pool: &SqlitePool,
    employee_id: &str,
) -> Result<Vec<WorkScheduleRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, WorkScheduleRow>(
            "SELECT id, employee_id, day_of_week, start_time, end_time, lunch_start, lunch_end,
                    is_working
             FROM work_schedules WHERE employee_id = ? ORDER BY day_of_week",
        )
        .bind(employee_id)
        .fetch_all(pool)
    })
    .await?)
}

/// Overrides that apply to an employee: their own plus business-wide ones.
pub async fn find_overrides(
    pool: &SqlitePool,
    business_id: &str,
    employee_id: &str,
) -> Result<Vec<OverrideRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, OverrideRow>(
            "SELECT id, business_id, employee_id, starts_at, ends_at, repeat, kind, reason
             FROM schedule_overrides
             WHERE business_id = ? AND (employee_id IS NULL OR employee_id = ?)",
        )
        .bind(business_id)
        .bind(employee_id)
        .fetch_all(pool)
    })
    .await?)
}

pub async fn fetch_user_by_username(
    pool: &SqlitePool,
    username: &str,
) -> Result<Option<UserRow>> {
    Ok(retry_read(|| {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, username, display_name, role, password_hash, active, created_at
             FROM users WHERE username = ? AND active = 1 LIMIT 1",
        )
        .bind(username)
        .fetch_optional(pool)
    })
    .await?)
}

/// Best-effort audit trail; failures are logged and never propagate.
pub async fn log_activity(
    pool: &SqlitePool,
    kind: &str,
    message: &str,
    business_id: Option<&str>,
    subject_id: Option<&str>,
) {
    let result = sqlx::query(
        "INSERT INTO activities (id, kind, message, business_id, subject_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(kind)
    .bind(message)
    .bind(business_id)
    .bind(subject_id)
    .bind(Utc::now())
    .execute(pool)
    .await;
    if let Err(err) = result {
        log::warn!("activity log write failed: {err}");
    }
}

pub async fn seed_defaults(pool: &SqlitePool) -> Result<()> {
    seed_owner(pool).await?;
    Ok(())
}

async fn seed_owner(pool: &SqlitePool) -> Result<()> {
    let existing = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE role = ? LIMIT 1")
        .bind(ROLE_OWNER)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let username = env::var("OWNER_USER").unwrap_or_else(|_| "owner".to_string());
    let password = env::var("OWNER_PASSWORD").unwrap_or_else(|_| "owner".to_string());
    let display_name = env::var("OWNER_DISPLAY_NAME").unwrap_or_else(|_| "Shop Owner".to_string());

    if password == "owner" {
        log::warn!("OWNER_PASSWORD not set. Using default password 'owner'. Set OWNER_PASSWORD in production.");
    }

    let password_hash = hash_password(&password)
        .map_err(|_| Error::validation("password hash failed"))?;

    sqlx::query(
        "INSERT INTO users (id, username, display_name, role, password_hash, active, created_at)
         VALUES (?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(new_id())
    .bind(username)
    .bind(display_name)
    .bind(ROLE_OWNER)
    .bind(password_hash)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// A new employee starts with the shop's standard week so availability and
/// conflict checks have something to work from.
pub async fn seed_default_schedules(pool: &SqlitePool, employee_id: &str) -> Result<()> {
    for day in 1..=6 {
        sqlx::query(
            "INSERT INTO work_schedules (id, employee_id, day_of_week, start_time, end_time, is_working)
             VALUES (?, ?, ?, '09:00:00', '17:00:00', 1)
             ON CONFLICT (employee_id, day_of_week) DO NOTHING",
        )
        .bind(new_id())
        .bind(employee_id)
        .bind(day)
        .execute(pool)
        .await?;
    }
    Ok(())
}
