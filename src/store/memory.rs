// In-process store. One async mutex guards all tables, so a transaction is the
// guard itself plus an undo log replayed on drop when the caller never commits.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{BookingStore, RoomOccupancy, StoreResult, StoreTx};
use crate::{
    error::StoreError,
    status::BookingStatus,
    types::{Booking, BookingId, BookingQuery, NewBooking, NewRoom, Room, RoomId, UserId},
};

#[derive(Debug, Default)]
struct Tables {
    rooms: BTreeMap<RoomId, Room>,
    bookings: BTreeMap<BookingId, Booking>,
    last_room_id: i64,
    last_booking_id: i64,
}

impl Tables {
    fn active_booking(
        &self,
        student_id: UserId,
        semester: &str,
        except: Option<BookingId>,
    ) -> Option<&Booking> {
        self.bookings.values().find(|b| {
            b.student_id == student_id
                && b.semester == semester
                && b.is_active()
                && Some(b.id) != except
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            tables,
            undo: Vec::new(),
            finished: false,
        }))
    }

    async fn insert_room(&self, room: NewRoom) -> StoreResult<Room> {
        let mut tables = self.tables.lock().await;
        tables.last_room_id += 1;
        let room = Room {
            id: RoomId(tables.last_room_id),
            block_id: room.block_id,
            room_number: room.room_number,
            capacity: room.capacity,
            current_occupancy: 0,
            price_per_semester: room.price_per_semester,
        };
        tables.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    async fn room(&self, id: RoomId) -> StoreResult<Option<Room>> {
        Ok(self.tables.lock().await.rooms.get(&id).cloned())
    }

    async fn rooms(&self) -> StoreResult<Vec<Room>> {
        Ok(self.tables.lock().await.rooms.values().cloned().collect())
    }

    async fn occupancy_snapshot(&self) -> StoreResult<Vec<RoomOccupancy>> {
        let tables = self.tables.lock().await;
        let mut active: BTreeMap<RoomId, u32> = BTreeMap::new();
        for booking in tables.bookings.values().filter(|b| b.is_active()) {
            *active.entry(booking.room_id).or_default() += 1;
        }
        Ok(tables
            .rooms
            .values()
            .map(|room| RoomOccupancy {
                active_bookings: active.get(&room.id).copied().unwrap_or(0),
                room: room.clone(),
            })
            .collect())
    }

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>> {
        Ok(self.tables.lock().await.bookings.get(&id).cloned())
    }

    async fn bookings(&self, query: &BookingQuery) -> StoreResult<Vec<Booking>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .bookings
            .values()
            .filter(|b| query.matches(b))
            .cloned()
            .collect())
    }
}

enum Undo {
    Occupancy { room_id: RoomId, delta: i64 },
    Inserted { booking_id: BookingId },
    Status { booking_id: BookingId, previous: BookingStatus },
}

struct MemoryTx {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
    finished: bool,
}

impl MemoryTx {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Occupancy { room_id, delta } => {
                    if let Some(room) = self.tables.rooms.get_mut(&room_id) {
                        room.current_occupancy = (room.current_occupancy as i64 - delta) as u32;
                    }
                }
                Undo::Inserted { booking_id } => {
                    self.tables.bookings.remove(&booking_id);
                }
                Undo::Status {
                    booking_id,
                    previous,
                } => {
                    if let Some(booking) = self.tables.bookings.get_mut(&booking_id) {
                        booking.status = previous;
                    }
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
        }
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn room(&mut self, id: RoomId) -> StoreResult<Option<Room>> {
        self.ensure_open()?;
        Ok(self.tables.rooms.get(&id).cloned())
    }

    async fn adjust_occupancy(&mut self, id: RoomId, delta: i64) -> StoreResult<bool> {
        self.ensure_open()?;
        let Some(room) = self.tables.rooms.get_mut(&id) else {
            return Ok(false);
        };

        let next = room.current_occupancy as i64 + delta;
        if next < 0 || next > room.capacity as i64 {
            return Ok(false);
        }

        room.current_occupancy = next as u32;
        self.undo.push(Undo::Occupancy { room_id: id, delta });
        Ok(true)
    }

    async fn active_booking(
        &mut self,
        student_id: UserId,
        semester: &str,
        except: Option<BookingId>,
    ) -> StoreResult<Option<Booking>> {
        self.ensure_open()?;
        Ok(self
            .tables
            .active_booking(student_id, semester, except)
            .cloned())
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> StoreResult<Booking> {
        self.ensure_open()?;
        if let Some(existing) = self
            .tables
            .active_booking(booking.student_id, &booking.semester, None)
        {
            return Err(StoreError::Conflict(format!(
                "booking {} is already active for student {} in {}",
                existing.id, booking.student_id, booking.semester
            )));
        }

        self.tables.last_booking_id += 1;
        let booking = Booking {
            id: BookingId(self.tables.last_booking_id),
            student_id: booking.student_id,
            room_id: booking.room_id,
            semester: booking.semester,
            status: BookingStatus::Pending,
            created_at: Utc::now(),
        };
        self.tables.bookings.insert(booking.id, booking.clone());
        self.undo.push(Undo::Inserted {
            booking_id: booking.id,
        });
        Ok(booking)
    }

    async fn swap_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>> {
        self.ensure_open()?;
        let (student_id, semester) = match self.tables.bookings.get(&id) {
            Some(b) if b.status == from => (b.student_id, b.semester.clone()),
            _ => return Ok(None),
        };

        if to.is_active() && !from.is_active() {
            if let Some(existing) = self.tables.active_booking(student_id, &semester, Some(id)) {
                return Err(StoreError::Conflict(format!(
                    "booking {} is already active for student {} in {}",
                    existing.id, student_id, semester
                )));
            }
        }

        let Some(booking) = self.tables.bookings.get_mut(&id) else {
            return Ok(None);
        };
        booking.status = to;
        let updated = booking.clone();
        self.undo.push(Undo::Status {
            booking_id: id,
            previous: from,
        });
        Ok(Some(updated))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.undo.clear();
        self.finished = true;
        Ok(())
    }
}
