use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ROLE_OWNER: &str = "owner";
pub const ROLE_STAFF: &str = "staff";

/// Service length assumed when an appointment or queue entry has no service
/// attached.
pub const DEFAULT_SERVICE_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EmployeeStatus {
    Available,
    InService,
    OnBreak,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
}

impl AppointmentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Completed | AppointmentStatus::Cancelled)
    }

    pub fn can_transition(self, next: AppointmentStatus) -> bool {
        matches!(
            (self, next),
            (AppointmentStatus::Scheduled, AppointmentStatus::Completed)
                | (AppointmentStatus::Scheduled, AppointmentStatus::Cancelled)
        )
    }

    pub fn ensure_transition(self, next: AppointmentStatus) -> Result<()> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(Error::state_conflict(format!(
                "appointment cannot move from {self:?} to {next:?}"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum QueueStatus {
    CheckedIn,
    Arrived,
    InService,
    Completed,
    Cancelled,
}

impl QueueStatus {
    /// Active entries hold a position in the line; terminal and in-service
    /// entries do not count toward the waiting order.
    pub fn is_active(self) -> bool {
        matches!(self, QueueStatus::CheckedIn | QueueStatus::Arrived)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Cancelled)
    }

    pub fn can_transition(self, next: QueueStatus) -> bool {
        matches!(
            (self, next),
            (QueueStatus::CheckedIn, QueueStatus::Arrived)
                | (QueueStatus::CheckedIn, QueueStatus::Cancelled)
                | (QueueStatus::Arrived, QueueStatus::InService)
                | (QueueStatus::Arrived, QueueStatus::Cancelled)
                | (QueueStatus::InService, QueueStatus::Completed)
        )
    }

    pub fn ensure_transition(self, next: QueueStatus) -> Result<()> {
        if self.can_transition(next) {
            Ok(())
        } else {
            Err(Error::state_conflict(format!(
                "queue entry cannot move from {self:?} to {next:?}"
            )))
        }
    }

    /// Employee and service reassignment is only allowed before service
    /// starts.
    pub fn allows_reassignment(self) -> bool {
        self.is_active()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum RepeatFrequency {
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OverrideKind {
    /// Subtracts from working time (holidays, emergencies, sick leave).
    Closure,
    /// Adds working time outside the weekly template.
    ExtraHours,
}

#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub role: String,
    pub password_hash: String,
    pub active: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BusinessRow {
    pub id: String,
    pub name: String,
    pub address: String,
    pub timezone: String,
    pub average_wait_time: f64,
    pub is_open_24_hours: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EmployeeRow {
    pub id: String,
    pub business_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub status: EmployeeStatus,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ServiceRow {
    pub id: String,
    pub business_id: String,
    pub name: String,
    pub duration_minutes: i64,
    pub price: f64,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct WorkScheduleRow {
    pub id: String,
    pub employee_id: String,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: i64,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub lunch_start: Option<NaiveTime>,
    pub lunch_end: Option<NaiveTime>,
    pub is_working: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OverrideRow {
    pub id: String,
    pub business_id: String,
    pub employee_id: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub repeat: RepeatFrequency,
    pub kind: OverrideKind,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppointmentRow {
    pub id: String,
    pub business_id: String,
    pub employee_id: String,
    pub service_id: Option<String>,
    pub user_id: Option<String>,
    pub full_name: Option<String>,
    pub phone_number: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub actual_start_at: Option<DateTime<Utc>>,
    pub actual_end_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AppointmentRow {
    pub fn duration(&self) -> chrono::Duration {
        self.ends_at - self.starts_at
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct QueueEntryRow {
    pub id: String,
    pub business_id: String,
    pub service_id: Option<String>,
    pub employee_id: Option<String>,
    pub full_name: String,
    pub phone_number: String,
    pub status: QueueStatus,
    pub position: i64,
    pub checked_in_at: DateTime<Utc>,
    pub service_started_at: Option<DateTime<Utc>>,
    pub service_ended_at: Option<DateTime<Utc>>,
    pub estimated_start_at: Option<DateTime<Utc>>,
}

/// Either a registered user id or a bare name+phone pair must identify the
/// customer on an appointment.
pub fn validate_customer_identity(
    user_id: Option<&str>,
    full_name: Option<&str>,
    phone_number: Option<&str>,
) -> Result<()> {
    let named = full_name.map(str::trim).is_some_and(|v| !v.is_empty())
        && phone_number.map(str::trim).is_some_and(|v| !v.is_empty());
    match (user_id, named) {
        (Some(_), false) => Ok(()),
        (None, true) => Ok(()),
        (Some(_), true) => Err(Error::validation(
            "provide either a user id or a name and phone number, not both",
        )),
        (None, false) => Err(Error::validation(
            "either a user id or both full name and phone number are required",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_transitions_follow_the_table() {
        assert!(QueueStatus::CheckedIn.can_transition(QueueStatus::Arrived));
        assert!(QueueStatus::CheckedIn.can_transition(QueueStatus::Cancelled));
        assert!(QueueStatus::Arrived.can_transition(QueueStatus::InService));
        assert!(QueueStatus::InService.can_transition(QueueStatus::Completed));

        assert!(!QueueStatus::CheckedIn.can_transition(QueueStatus::InService));
        assert!(!QueueStatus::InService.can_transition(QueueStatus::Cancelled));
        assert!(!QueueStatus::Completed.can_transition(QueueStatus::CheckedIn));
        assert!(!QueueStatus::Cancelled.can_transition(QueueStatus::Arrived));
    }

    #[test]
    fn appointment_terminal_states_reject_updates() {
        assert!(AppointmentStatus::Scheduled.can_transition(AppointmentStatus::Completed));
        assert!(AppointmentStatus::Scheduled.can_transition(AppointmentStatus::Cancelled));
        assert!(!AppointmentStatus::Completed.can_transition(AppointmentStatus::Scheduled));
        assert!(AppointmentStatus::Cancelled
            .ensure_transition(AppointmentStatus::Completed)
            .is_err());
    }

    #[test]
    fn customer_identity_is_exactly_one_of_user_or_contact() {
        assert!(validate_customer_identity(Some("u1"), None, None).is_ok());
        assert!(validate_customer_identity(None, Some("Ana"), Some("555-0100")).is_ok());
        assert!(validate_customer_identity(None, Some("Ana"), None).is_err());
        assert!(validate_customer_identity(None, None, Some("555-0100")).is_err());
        assert!(validate_customer_identity(None, Some("  "), Some("555-0100")).is_err());
        assert!(validate_customer_identity(Some("u1"), Some("Ana"), Some("555-0100")).is_err());
    }
}
