//! Earliest-start computation for employees and the business-level wait
//! estimate.
//!
//! Read-only over the committed-work snapshot: callers re-run it after each
//! commit instead of caching results across commits.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::db;
use crate::error::Result;
use crate::models::{BusinessRow, EmployeeRow, EmployeeStatus};

/// Flat allowance added when the employee is on a break; break ends are not
/// tracked separately.
pub const BREAK_ALLOWANCE_MINUTES: i64 = 15;

/// Scheduled appointments beyond this horizon no longer push availability.
pub const AVAILABILITY_HORIZON_HOURS: i64 = 24;

/// The earliest instant the employee can start new work, given their current
/// status, assigned queue work, and scheduled appointments.
pub async fn next_available(
    pool: &SqlitePool,
    employee: &EmployeeRow,
    as_of: DateTime<Utc>,
    fallback_minutes: i64,
) -> Result<DateTime<Utc>> {
    let mut t = as_of;

    if employee.status == EmployeeStatus::OnBreak {
        t += Duration::minutes(BREAK_ALLOWANCE_MINUTES);
    }

    for entry in db::find_assigned_queue_work(pool, &employee.id).await? {
        let minutes = match entry.service_id.as_deref() {
            Some(service_id) => db::fetch_service(pool, service_id).await?.duration_minutes,
            None => fallback_minutes,
        };
        t += Duration::minutes(minutes);
    }

    let horizon = as_of + Duration::hours(AVAILABILITY_HORIZON_HOURS);
    for appointment in db::find_scheduled_appointments(pool, &employee.id, as_of, horizon).await? {
        let duration = appointment.duration();
        if appointment.starts_at > t {
            // Idle until the appointment; busy through it.
            t = appointment.starts_at + duration;
        } else {
            t += duration;
        }
    }

    Ok(t)
}

/// Business-level wait estimate in minutes: the soonest any capable employee
/// can take the requested service, falling back to the business's average
/// when nobody is eligible.
pub async fn estimated_wait(
    pool: &SqlitePool,
    business: &BusinessRow,
    service_id: Option<&str>,
) -> Result<i64> {
    let fallback_minutes = business.average_wait_time.round() as i64;
    let duration_minutes = match service_id {
        Some(id) => db::fetch_service(pool, id).await?.duration_minutes,
        None => fallback_minutes,
    };

    let employees = db::find_capable_employees(pool, &business.id, service_id).await?;
    if employees.is_empty() {
        return Ok(fallback_minutes);
    }

    let now = Utc::now();
    let mut best: Option<i64> = None;
    for employee in &employees {
        let available_at = next_available(pool, employee, now, duration_minutes).await?;
        let wait = (available_at - now).num_minutes().max(0);
        best = Some(match best {
            Some(current) => current.min(wait),
            None => wait,
        });
    }

    Ok(best.unwrap_or(fallback_minutes))
}
