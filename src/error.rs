use thiserror::Error;

use crate::{
    status::{BookingStatus, Denied},
    types::{BookingId, RoomId, UserId},
};

pub type Result<T> = std::result::Result<T, BookingError>;

// Errors raised by a storage backend
#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("db error: {0}")]
    Database(#[from] sqlx::Error),

    // a storage-level uniqueness rule rejected the write
    #[error("conflicting row: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("transaction already finished")]
    TransactionClosed,
}

#[derive(Error, Debug)]
pub enum BookingError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("room {0} is full")]
    RoomFull(RoomId),

    #[error("student {student_id} already has an active booking for {semester}")]
    DuplicateActiveBooking { student_id: UserId, semester: String },

    #[error("booking not found: {0}")]
    BookingNotFound(BookingId),

    #[error("user {actor} may not set booking {booking_id} to {requested}")]
    Unauthorized {
        actor: UserId,
        booking_id: BookingId,
        requested: BookingStatus,
    },

    #[error("booking {booking_id} cannot move from {from} to {to}")]
    InvalidTransition {
        booking_id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("occupancy invariant violated for room {room_id}: {detail}")]
    InvariantViolation { room_id: RoomId, detail: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    pub(crate) fn denied(
        denied: Denied,
        actor: UserId,
        booking_id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    ) -> Self {
        match denied {
            Denied::Unauthorized => BookingError::Unauthorized {
                actor,
                booking_id,
                requested: to,
            },
            Denied::InvalidTransition => BookingError::InvalidTransition {
                booking_id,
                from,
                to,
            },
        }
    }

    // A violation means the atomicity contract broke somewhere; alert, don't just reject
    pub fn is_fatal(&self) -> bool {
        matches!(self, BookingError::InvariantViolation { .. })
    }

    /// HTTP status the routing layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            BookingError::RoomNotFound(_) | BookingError::BookingNotFound(_) => 404,
            BookingError::RoomFull(_)
            | BookingError::DuplicateActiveBooking { .. }
            | BookingError::InvalidTransition { .. } => 409,
            BookingError::InvalidInput(_) => 400,
            BookingError::Unauthorized { .. } => 403,
            BookingError::InvariantViolation { .. } | BookingError::Store(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_kind_maps_to_distinct_rejection() {
        assert_eq!(BookingError::RoomNotFound(RoomId(1)).status_code(), 404);
        assert_eq!(BookingError::RoomFull(RoomId(1)).status_code(), 409);
        assert_eq!(
            BookingError::Unauthorized {
                actor: UserId(2),
                booking_id: BookingId(3),
                requested: BookingStatus::Confirmed,
            }
            .status_code(),
            403
        );
        assert_eq!(
            BookingError::InvalidInput("semester is required".to_string()).status_code(),
            400
        );
        assert_eq!(
            BookingError::Store(StoreError::TransactionClosed).status_code(),
            500
        );
    }

    #[test]
    fn test_only_invariant_violation_is_fatal() {
        let violation = BookingError::InvariantViolation {
            room_id: RoomId(4),
            detail: "occupancy 0 would drop below zero".to_string(),
        };
        assert!(violation.is_fatal());
        assert_eq!(violation.status_code(), 500);

        assert!(!BookingError::RoomFull(RoomId(4)).is_fatal());
        assert!(!BookingError::DuplicateActiveBooking {
            student_id: UserId(1),
            semester: "2025-FALL".to_string(),
        }
        .is_fatal());
    }

    #[test]
    fn test_denied_maps_to_matching_error() {
        let err = BookingError::denied(
            Denied::InvalidTransition,
            UserId(1),
            BookingId(9),
            BookingStatus::Cancelled,
            BookingStatus::Cancelled,
        );
        assert_eq!(
            err.to_string(),
            "booking 9 cannot move from CANCELLED to CANCELLED"
        );
    }
}
