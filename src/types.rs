// Core records shared by the registry, the ledger and the stores

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::BookingStatus;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Hostel room, assigned by the store.
    RoomId
);
id_type!(
    /// Hostel block (building) a room belongs to.
    BlockId
);
id_type!(BookingId);
id_type!(
    /// Student or staff account, as handed over by the session layer.
    UserId
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub block_id: BlockId,
    pub room_number: String,
    pub capacity: u32,
    pub current_occupancy: u32,
    pub price_per_semester: f64,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.current_occupancy >= self.capacity
    }

    pub fn free_places(&self) -> u32 {
        self.capacity.saturating_sub(self.current_occupancy)
    }
}

// Room as submitted by seed data or an admin, before the store assigns an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRoom {
    pub block_id: BlockId,
    pub room_number: String,
    pub capacity: u32,
    pub price_per_semester: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub student_id: UserId,
    pub room_id: RoomId,
    pub semester: String,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

// Bookings are always inserted as PENDING, so the status is not part of the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub student_id: UserId,
    pub room_id: RoomId,
    pub semester: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Admin,
}

/// Caller identity, trusted as supplied by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn student(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Student,
        }
    }

    pub fn admin(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }
}

// Filters for listing bookings; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingQuery {
    pub student_id: Option<UserId>,
    pub room_id: Option<RoomId>,
    pub semester: Option<String>,
    pub status: Option<BookingStatus>,
    pub active_only: bool,
}

impl BookingQuery {
    pub fn for_student(student_id: UserId) -> Self {
        Self {
            student_id: Some(student_id),
            ..Default::default()
        }
    }

    pub fn for_room(room_id: RoomId) -> Self {
        Self {
            room_id: Some(room_id),
            ..Default::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        self.student_id.map_or(true, |id| booking.student_id == id)
            && self.room_id.map_or(true, |id| booking.room_id == id)
            && self
                .semester
                .as_deref()
                .map_or(true, |s| booking.semester == s)
            && self.status.map_or(true, |s| booking.status == s)
            && (!self.active_only || booking.is_active())
    }
}
