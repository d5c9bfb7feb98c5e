// Booking lifecycle: statuses and the transition table deciding who may move a
// booking where, and what that does to room occupancy.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    Cancelled,
}

impl BookingStatus {
    pub const ACTIVE: [BookingStatus; 2] = [BookingStatus::Pending, BookingStatus::Confirmed];

    // PENDING and CONFIRMED hold a place in the room
    pub fn is_active(self) -> bool {
        Self::ACTIVE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown booking status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for BookingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "REJECTED" => Ok(BookingStatus::Rejected),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

/// One unit of occupancy, taken or given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    Claim,
    Release,
}

impl Delta {
    pub fn amount(self) -> i64 {
        match self {
            Delta::Claim => 1,
            Delta::Release => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    // wrong actor for this booking or this target status
    Unauthorized,
    // target not reachable from the current status
    InvalidTransition,
}

/// Outcome of an allowed transition: the occupancy change to apply with it, if any.
pub type Transition = Result<Option<Delta>, Denied>;

/// The transition table.
///
/// Students may only cancel their own active bookings. Admins may move a
/// booking to any other status. Re-applying the current status is never a
/// transition, so a repeated cancel or reject cannot release twice.
pub fn plan_transition(
    from: BookingStatus,
    to: BookingStatus,
    role: Role,
    is_owner: bool,
) -> Transition {
    use BookingStatus::*;

    match role {
        Role::Student => {
            if !is_owner || to != Cancelled {
                return Err(Denied::Unauthorized);
            }
            match from {
                Pending | Confirmed => Ok(Some(Delta::Release)),
                Rejected | Cancelled => Err(Denied::InvalidTransition),
            }
        }
        Role::Admin => match (from, to) {
            (a, b) if a == b => Err(Denied::InvalidTransition),
            (Pending, Confirmed) | (Confirmed, Pending) => Ok(None),
            (Rejected, Cancelled) | (Cancelled, Rejected) => Ok(None),
            (Pending | Confirmed, Rejected | Cancelled) => Ok(Some(Delta::Release)),
            (Rejected | Cancelled, Pending | Confirmed) => Ok(Some(Delta::Claim)),
            // only the self pairs are left, already caught by the guard
            _ => Err(Denied::InvalidTransition),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const ALL: [BookingStatus; 4] = [Pending, Confirmed, Rejected, Cancelled];

    #[test]
    fn test_status_round_trips_through_text() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<BookingStatus>(), Ok(status));
        }
        assert_eq!("cancelled".parse::<BookingStatus>(), Ok(Cancelled));
        let err = "ARCHIVED".parse::<BookingStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("ARCHIVED".to_string()));
        assert_eq!(err.to_string(), "unknown booking status: ARCHIVED");
    }

    #[test]
    fn test_student_can_only_cancel_own_active_booking() {
        assert_eq!(
            plan_transition(Pending, Cancelled, Role::Student, true),
            Ok(Some(Delta::Release))
        );
        assert_eq!(
            plan_transition(Confirmed, Cancelled, Role::Student, true),
            Ok(Some(Delta::Release))
        );

        for to in [Pending, Confirmed, Rejected] {
            assert_eq!(
                plan_transition(Pending, to, Role::Student, true),
                Err(Denied::Unauthorized)
            );
        }

        for from in ALL {
            assert_eq!(
                plan_transition(from, Cancelled, Role::Student, false),
                Err(Denied::Unauthorized)
            );
        }
    }

    #[test]
    fn test_repeated_cancel_is_invalid() {
        assert_eq!(
            plan_transition(Cancelled, Cancelled, Role::Student, true),
            Err(Denied::InvalidTransition)
        );
        assert_eq!(
            plan_transition(Rejected, Cancelled, Role::Student, true),
            Err(Denied::InvalidTransition)
        );
    }

    #[test]
    fn test_admin_self_transitions_are_rejected() {
        for status in ALL {
            assert_eq!(
                plan_transition(status, status, Role::Admin, false),
                Err(Denied::InvalidTransition)
            );
        }
    }

    #[test]
    fn test_admin_occupancy_effects() {
        assert_eq!(plan_transition(Pending, Confirmed, Role::Admin, false), Ok(None));
        assert_eq!(plan_transition(Confirmed, Pending, Role::Admin, false), Ok(None));
        assert_eq!(
            plan_transition(Confirmed, Rejected, Role::Admin, false),
            Ok(Some(Delta::Release))
        );
        assert_eq!(
            plan_transition(Pending, Cancelled, Role::Admin, false),
            Ok(Some(Delta::Release))
        );
        assert_eq!(
            plan_transition(Rejected, Pending, Role::Admin, false),
            Ok(Some(Delta::Claim))
        );
        assert_eq!(plan_transition(Cancelled, Rejected, Role::Admin, false), Ok(None));
    }

    #[test]
    fn test_effects_follow_activity_change() {
        for from in ALL {
            for to in ALL {
                if let Ok(effect) = plan_transition(from, to, Role::Admin, false) {
                    let expected = match (from.is_active(), to.is_active()) {
                        (true, false) => Some(Delta::Release),
                        (false, true) => Some(Delta::Claim),
                        _ => None,
                    };
                    assert_eq!(effect, expected, "{from} -> {to}");
                }
            }
        }
    }
}
