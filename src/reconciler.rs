// Occupancy Reconciler: the only code path that changes a room's occupancy
// counter. Every change is a single conditional update inside the caller's
// transaction, so the bound check and the write cannot be split.

use serde::Serialize;
use tracing::{debug, error};

use crate::{
    error::{BookingError, Result},
    status::Delta,
    store::{BookingStore, StoreTx},
    types::{Room, RoomId},
};

const INVARIANT_TARGET: &str = "hostel_ledger::invariant";

/// A room whose cached counter disagrees with its active bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancyDrift {
    pub room_id: RoomId,
    pub recorded: u32,
    pub derived: u32,
    pub capacity: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OccupancyReconciler;

impl OccupancyReconciler {
    pub fn new() -> Self {
        Self
    }

    pub async fn apply_delta(
        &self,
        tx: &mut dyn StoreTx,
        room_id: RoomId,
        delta: Delta,
    ) -> Result<Room> {
        if tx.adjust_occupancy(room_id, delta.amount()).await? {
            return tx
                .room(room_id)
                .await?
                .ok_or(BookingError::RoomNotFound(room_id));
        }

        // nothing was written; find out which bound stopped us
        let room = tx
            .room(room_id)
            .await?
            .ok_or(BookingError::RoomNotFound(room_id))?;

        if room.current_occupancy > room.capacity {
            return Err(violation(
                &room,
                format!(
                    "stored occupancy {} already exceeds capacity {}",
                    room.current_occupancy, room.capacity
                ),
            ));
        }

        match delta {
            Delta::Claim => {
                debug!(room = %room_id, capacity = room.capacity, "room full");
                Err(BookingError::RoomFull(room_id))
            }
            Delta::Release => Err(violation(
                &room,
                format!(
                    "release would take occupancy {} below zero",
                    room.current_occupancy
                ),
            )),
        }
    }

    /// Recount active bookings for every room and report the rooms whose
    /// counter has drifted. An empty result means the ledger is consistent.
    ///
    /// Counters and counts are read in one snapshot, so writes committing
    /// while the audit runs never show up as drift.
    pub async fn audit(&self, store: &dyn BookingStore) -> Result<Vec<OccupancyDrift>> {
        let drift: Vec<OccupancyDrift> = store
            .occupancy_snapshot()
            .await?
            .into_iter()
            .filter(|o| o.room.current_occupancy != o.active_bookings)
            .map(|o| OccupancyDrift {
                room_id: o.room.id,
                recorded: o.room.current_occupancy,
                derived: o.active_bookings,
                capacity: o.room.capacity,
            })
            .collect();

        for d in &drift {
            error!(
                target: INVARIANT_TARGET,
                room = %d.room_id,
                recorded = d.recorded,
                derived = d.derived,
                "occupancy counter out of sync with bookings"
            );
        }
        Ok(drift)
    }
}

fn violation(room: &Room, detail: String) -> BookingError {
    error!(
        target: INVARIANT_TARGET,
        room = %room.id,
        occupancy = room.current_occupancy,
        capacity = room.capacity,
        "{detail}"
    );
    BookingError::InvariantViolation {
        room_id: room.id,
        detail,
    }
}
