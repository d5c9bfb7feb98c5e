// Room Registry: room capacity and occupancy as seen by callers. Occupancy
// changes are handed to the reconciler.

use std::sync::Arc;

use tracing::info;

use crate::{
    error::{BookingError, Result},
    reconciler::OccupancyReconciler,
    status::Delta,
    store::BookingStore,
    types::{NewRoom, Room, RoomId},
};

#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn BookingStore>,
    reconciler: OccupancyReconciler,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn BookingStore>) -> Self {
        Self {
            store,
            reconciler: OccupancyReconciler::new(),
        }
    }

    pub async fn add_room(&self, room: NewRoom) -> Result<Room> {
        if room.capacity == 0 {
            return Err(BookingError::InvalidInput(
                "room capacity must be at least 1".to_string(),
            ));
        }
        if room.room_number.trim().is_empty() {
            return Err(BookingError::InvalidInput(
                "room number is required".to_string(),
            ));
        }
        if !room.price_per_semester.is_finite() || room.price_per_semester < 0.0 {
            return Err(BookingError::InvalidInput(format!(
                "invalid price per semester: {}",
                room.price_per_semester
            )));
        }

        let room = self
            .store
            .insert_room(NewRoom {
                room_number: room.room_number.trim().to_string(),
                ..room
            })
            .await?;
        info!(room = %room.id, number = %room.room_number, capacity = room.capacity, "room added");
        Ok(room)
    }

    pub async fn get_room(&self, room_id: RoomId) -> Result<Room> {
        self.store
            .room(room_id)
            .await?
            .ok_or(BookingError::RoomNotFound(room_id))
    }

    pub async fn rooms(&self) -> Result<Vec<Room>> {
        Ok(self.store.rooms().await?)
    }

    // Rooms with at least one free place
    pub async fn available_rooms(&self) -> Result<Vec<Room>> {
        let mut rooms = self.store.rooms().await?;
        rooms.retain(|r| !r.is_full());
        Ok(rooms)
    }

    pub async fn increment_occupancy(&self, room_id: RoomId) -> Result<Room> {
        self.adjust(room_id, Delta::Claim).await
    }

    pub async fn decrement_occupancy(&self, room_id: RoomId) -> Result<Room> {
        self.adjust(room_id, Delta::Release).await
    }

    async fn adjust(&self, room_id: RoomId, delta: Delta) -> Result<Room> {
        let mut tx = self.store.begin().await?;
        let room = self
            .reconciler
            .apply_delta(tx.as_mut(), room_id, delta)
            .await?;
        tx.commit().await?;
        Ok(room)
    }
}
