//! Error types for the booking core.
//!
//! Each component reports its own error type; [`BookingError`] is the
//! taxonomy the orchestrator hands to callers.

use std::fmt;

use thiserror::Error;

/// Which exclusivity rule the admission gate refused a reservation under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The user already holds a live reservation marker.
    UserAlreadyBooked,
    /// Another reservation holds this table and slot.
    TableSlotTaken,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictKind::UserAlreadyBooked => f.write_str("user has already booked a table"),
            ConflictKind::TableSlotTaken => f.write_str("table is already booked"),
        }
    }
}

/// Saga position, used to report where a saga stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Start,
    GateReserved,
    LedgerCommitted,
    GateReleased,
    Notified,
    Done,
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SagaState::Start => "start",
            SagaState::GateReserved => "gate-reserved",
            SagaState::LedgerCommitted => "ledger-committed",
            SagaState::GateReleased => "gate-released",
            SagaState::Notified => "notified",
            SagaState::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode reservation marker: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("unexpected reserve script status {0}")]
    UnexpectedStatus(i64),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("booking is not found")]
    NotFound,

    #[error("an active booking already exists for this table and time")]
    Duplicate,

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("query: {0}")]
    Query(diesel::result::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("deadline passed before the write could run")]
    Timeout,
}

impl From<diesel::result::Error> for LedgerError {
    fn from(e: diesel::result::Error) -> Self {
        use diesel::result::{DatabaseErrorKind, Error};

        match e {
            Error::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => LedgerError::Duplicate,
            Error::NotFound => LedgerError::NotFound,
            other => LedgerError::Query(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("amqp: {0}")]
    Amqp(#[from] amqprs::error::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("timed out")]
    Timeout,

    #[error("broker refused the message")]
    Nacked,

    #[error("channel closed before the broker confirmed the message")]
    Unconfirmed,
}

/// Outcome taxonomy surfaced by the orchestrator.
///
/// A committed booking whose notification failed is not an error; see
/// [`crate::saga::Delivery`].
#[derive(Debug, Error)]
pub enum BookingError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(ConflictKind),

    #[error("booking is not found")]
    NotFound,

    #[error("deadline exceeded at saga state {state}")]
    Timeout { state: SagaState },

    #[error("admission gate unavailable: {0}")]
    Gate(#[from] GateError),

    #[error("ledger unavailable: {0}")]
    Ledger(LedgerError),
}

impl BookingError {
    /// True when retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BookingError::Timeout { .. } | BookingError::Gate(_) | BookingError::Ledger(_)
        )
    }
}

impl From<LedgerError> for BookingError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound => BookingError::NotFound,
            // The partial unique index only covers (table_id, booking_time).
            LedgerError::Duplicate => BookingError::Conflict(ConflictKind::TableSlotTaken),
            other => BookingError::Ledger(other),
        }
    }
}
