use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("requested time is outside the employee's working hours")]
    OutsideWorkingHours,

    #[error("the employee already has an appointment in that time slot")]
    DoubleBooked,

    #[error("an active queue entry already exists for this phone number")]
    AlreadyInQueue,

    #[error("{0}")]
    StateConflict(String),

    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Error::StateConflict(msg.into())
    }

    /// Stable machine-readable kind, so callers can tell the two
    /// scheduling-conflict flavors apart.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Validation(_) => "validation",
            Error::OutsideWorkingHours => "outside_working_hours",
            Error::DoubleBooked => "double_booked",
            Error::AlreadyInQueue => "already_in_queue",
            Error::StateConflict(_) => "state_conflict",
            Error::Unavailable(_) => "unavailable",
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::OutsideWorkingHours
            | Error::DoubleBooked
            | Error::AlreadyInQueue
            | Error::StateConflict(_) => StatusCode::CONFLICT,
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Error::Unavailable(err) = self {
            log::error!("storage error: {err}");
        }
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
