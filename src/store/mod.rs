// Persistence seam. The ledger never touches rows directly: it opens a
// transaction, runs the conditional updates below and commits.

use async_trait::async_trait;

use crate::{
    error::StoreError,
    status::BookingStatus,
    types::{Booking, BookingId, BookingQuery, NewBooking, NewRoom, Room, RoomId, UserId},
};

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// A room together with how many PENDING/CONFIRMED bookings point at it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomOccupancy {
    pub room: Room,
    pub active_bookings: u32,
}

#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    // Start a write transaction. Dropping it without commit discards every write.
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>>;

    async fn insert_room(&self, room: NewRoom) -> StoreResult<Room>;

    async fn room(&self, id: RoomId) -> StoreResult<Option<Room>>;

    // All rooms, ordered by id
    async fn rooms(&self) -> StoreResult<Vec<Room>>;

    /// Every room with its active booking count, ordered by id. Counters and
    /// counts come from one consistent read, never from two separate queries.
    async fn occupancy_snapshot(&self) -> StoreResult<Vec<RoomOccupancy>>;

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>>;

    // Matching bookings, ordered by id
    async fn bookings(&self, query: &BookingQuery) -> StoreResult<Vec<Booking>>;
}

/// Writes that must land together.
///
/// While a transaction is open its owner must not call back into the
/// [`BookingStore`]: both backends hand out a single writer at a time.
#[async_trait]
pub trait StoreTx: Send {
    async fn room(&mut self, id: RoomId) -> StoreResult<Option<Room>>;

    /// Add `delta` to the room's occupancy only if the result stays within
    /// `[0, capacity]`. Returns false when the row was left untouched
    /// (room missing or bound hit).
    async fn adjust_occupancy(&mut self, id: RoomId, delta: i64) -> StoreResult<bool>;

    // The student's PENDING/CONFIRMED booking for the semester, ignoring `except`
    async fn active_booking(
        &mut self,
        student_id: UserId,
        semester: &str,
        except: Option<BookingId>,
    ) -> StoreResult<Option<Booking>>;

    async fn insert_booking(&mut self, booking: NewBooking) -> StoreResult<Booking>;

    /// Compare-and-swap on the status column. `None` when the booking no
    /// longer has status `from`.
    async fn swap_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>>;

    async fn commit(&mut self) -> StoreResult<()>;
}
