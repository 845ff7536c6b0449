//! Pre-commit checks for candidate appointment slots: containment in the
//! employee's working hours and half-open overlap against existing bookings.

use chrono_tz::Tz;
use sqlx::SqlitePool;

use crate::db;
use crate::error::{Error, Result};
use crate::models::BusinessRow;
use crate::recurrence::{self, Interval};

/// Rejects a candidate slot with `OutsideWorkingHours` or `DoubleBooked`;
/// passes silently otherwise. `exclude_appointment_id` lets an edit ignore
/// the appointment being moved.
pub async fn check_conflict(
    pool: &SqlitePool,
    business: &BusinessRow,
    employee_id: &str,
    candidate: Interval,
    exclude_appointment_id: Option<&str>,
) -> Result<()> {
    if candidate.is_empty() {
        return Err(Error::validation("appointment end must be after its start"));
    }

    if !business.is_open_24_hours {
        let tz: Tz = business
            .timezone
            .parse()
            .map_err(|_| Error::validation(format!("unknown timezone {}", business.timezone)))?;

        // Pad the expansion window by a day on both sides so overnight
        // shifts and timezone offsets cannot clip the candidate's day.
        let window = Interval::new(
            candidate.start - chrono::Duration::days(1),
            candidate.end + chrono::Duration::days(1),
        );
        let schedules = db::find_work_schedules(pool, employee_id).await?;
        let overrides = db::find_overrides(pool, &business.id, employee_id).await?;
        let working = recurrence::working_intervals(&schedules, &overrides, tz, window);

        // `working` is merged and disjoint, so union containment reduces to
        // containment in a single interval.
        if !working.iter().any(|iv| iv.contains(&candidate)) {
            return Err(Error::OutsideWorkingHours);
        }
    }

    let existing =
        db::find_overlapping_appointments(pool, employee_id, candidate.start, candidate.end)
            .await?;
    let conflict = existing
        .iter()
        .any(|appt| Some(appt.id.as_str()) != exclude_appointment_id);
    if conflict {
        return Err(Error::DoubleBooked);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmployeeStatus;
    use crate::test_utils::*;
    use chrono::{TimeZone, Utc};

    // 2026-06-01 is a Monday.
    fn monday(h: u32, m: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn slot_inside_working_hours_passes() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;

        let candidate = Interval::new(monday(10, 0), monday(10, 30));
        assert!(check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn slot_outside_working_hours_is_rejected_distinctly() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;

        let candidate = Interval::new(monday(18, 0), monday(18, 30));
        let err = check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutsideWorkingHours));
    }

    #[tokio::test]
    async fn twenty_four_hour_businesses_skip_the_hours_check() {
        let pool = setup_test_db().await;
        let mut business = insert_business(&pool, 20.0).await;
        sqlx::query("UPDATE businesses SET is_open_24_hours = 1 WHERE id = ?")
            .bind(&business.id)
            .execute(&pool)
            .await
            .unwrap();
        business.is_open_24_hours = true;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;

        // No schedules at all; only the 24-hour flag makes this bookable.
        let candidate = Interval::new(monday(3, 0), monday(3, 30));
        assert!(check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn overlapping_booking_is_a_double_book() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;
        insert_appointment(&pool, &business.id, &employee.id, monday(10, 0), monday(10, 30)).await;

        let candidate = Interval::new(monday(10, 15), monday(10, 45));
        let err = check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoubleBooked));
    }

    #[tokio::test]
    async fn back_to_back_bookings_are_allowed() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;
        insert_appointment(&pool, &business.id, &employee.id, monday(10, 0), monday(10, 30)).await;

        let candidate = Interval::new(monday(10, 30), monday(11, 0));
        assert!(check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn excluding_the_conflicting_appointment_clears_the_conflict() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;
        let appointment =
            insert_appointment(&pool, &business.id, &employee.id, monday(10, 0), monday(10, 30))
                .await;

        let candidate = Interval::new(monday(10, 0), monday(10, 30));
        assert!(matches!(
            check_conflict(&pool, &business, &employee.id, candidate, None)
                .await
                .unwrap_err(),
            Error::DoubleBooked
        ));
        assert!(check_conflict(
            &pool,
            &business,
            &employee.id,
            candidate,
            Some(appointment.id.as_str())
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn closure_override_blocks_an_otherwise_valid_slot() {
        let pool = setup_test_db().await;
        let business = insert_business(&pool, 20.0).await;
        let employee = insert_employee(&pool, &business.id, EmployeeStatus::Available).await;
        insert_schedule(&pool, &employee.id, 1, "09:00:00", "17:00:00").await;
        insert_closure(&pool, &business.id, Some(&employee.id), monday(10, 0), monday(12, 0))
            .await;

        let candidate = Interval::new(monday(10, 30), monday(11, 0));
        let err = check_conflict(&pool, &business, &employee.id, candidate, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OutsideWorkingHours));
    }
}
