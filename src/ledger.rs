// Booking Ledger: creates bookings and moves them through their lifecycle.
// Each write runs in one store transaction together with the matching
// occupancy change; notifications go out only after commit.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    config::{Config, StoreConfig},
    error::{BookingError, Result, StoreError},
    notify::{sink_from_config, NotificationSink, Notification},
    reconciler::{OccupancyDrift, OccupancyReconciler},
    registry::RoomRegistry,
    status::{plan_transition, BookingStatus, Delta},
    store::{BookingStore, MemoryStore},
    types::{Actor, Booking, BookingId, BookingQuery, NewBooking, RoomId, UserId},
};

#[derive(Clone)]
pub struct BookingLedger {
    store: Arc<dyn BookingStore>,
    registry: RoomRegistry,
    reconciler: OccupancyReconciler,
    notifier: Arc<dyn NotificationSink>,
}

impl BookingLedger {
    pub fn new(store: Arc<dyn BookingStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            registry: RoomRegistry::new(store.clone()),
            reconciler: OccupancyReconciler::new(),
            store,
            notifier,
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn BookingStore> = match &config.store {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            #[cfg(feature = "sqlite")]
            StoreConfig::Sqlite(sqlite) => {
                use anyhow::Context;
                let store = crate::store::SqliteStore::connect(sqlite)
                    .await
                    .with_context(|| format!("failed to open booking database {}", sqlite.url))?;
                Arc::new(store)
            }
            #[cfg(not(feature = "sqlite"))]
            StoreConfig::Sqlite(_) => {
                anyhow::bail!("sqlite store requested but the `sqlite` feature is disabled")
            }
        };
        let notifier = sink_from_config(&config.notifier)?;
        Ok(Self::new(store, notifier))
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub async fn create_booking(
        &self,
        student_id: UserId,
        room_id: RoomId,
        semester: &str,
    ) -> Result<Booking> {
        let semester = normalize_semester(semester)?;

        let room = self.registry.get_room(room_id).await?;
        // cheap early exit; the conditional update below is what actually decides
        if room.is_full() {
            debug!(room = %room_id, student = %student_id, "booking rejected, room full");
            return Err(BookingError::RoomFull(room_id));
        }

        let mut tx = self.store.begin().await?;
        let room = self
            .reconciler
            .apply_delta(tx.as_mut(), room_id, Delta::Claim)
            .await?;

        if tx.active_booking(student_id, &semester, None).await?.is_some() {
            debug!(student = %student_id, %semester, "booking rejected, already active");
            return Err(duplicate(student_id, semester));
        }

        let booking = tx
            .insert_booking(NewBooking {
                student_id,
                room_id,
                semester: semester.clone(),
            })
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => duplicate(student_id, semester.clone()),
                e => e.into(),
            })?;
        tx.commit().await?;

        info!(
            booking = %booking.id,
            student = %student_id,
            room = %room_id,
            occupancy = room.current_occupancy,
            capacity = room.capacity,
            "booking created"
        );
        self.notifier.notify(Notification::booking_created(&booking, &room));
        Ok(booking)
    }

    pub async fn transition_booking(
        &self,
        booking_id: BookingId,
        new_status: BookingStatus,
        actor: Actor,
    ) -> Result<Booking> {
        let current = self.get_booking(booking_id).await?;
        let from = current.status;

        let delta = plan_transition(
            from,
            new_status,
            actor.role,
            current.student_id == actor.user_id,
        )
        .map_err(|denied| {
            debug!(
                booking = %booking_id,
                actor = %actor.user_id,
                %from,
                to = %new_status,
                "transition denied"
            );
            BookingError::denied(denied, actor.user_id, booking_id, from, new_status)
        })?;

        let mut tx = self.store.begin().await?;
        let updated = tx
            .swap_status(booking_id, from, new_status)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => {
                    duplicate(current.student_id, current.semester.clone())
                }
                e => e.into(),
            })?
            // another request moved the booking since we read it
            .ok_or(BookingError::InvalidTransition {
                booking_id,
                from,
                to: new_status,
            })?;

        if delta == Some(Delta::Claim)
            && tx
                .active_booking(updated.student_id, &updated.semester, Some(booking_id))
                .await?
                .is_some()
        {
            return Err(duplicate(updated.student_id, updated.semester));
        }

        if let Some(delta) = delta {
            self.reconciler
                .apply_delta(tx.as_mut(), updated.room_id, delta)
                .await?;
        }
        tx.commit().await?;

        info!(
            booking = %booking_id,
            actor = %actor.user_id,
            %from,
            to = %new_status,
            "booking status changed"
        );
        self.notifier.notify(Notification::status_changed(&updated, from));
        Ok(updated)
    }

    pub async fn get_booking(&self, booking_id: BookingId) -> Result<Booking> {
        self.store
            .booking(booking_id)
            .await?
            .ok_or(BookingError::BookingNotFound(booking_id))
    }

    pub async fn list_bookings(&self, query: &BookingQuery) -> Result<Vec<Booking>> {
        Ok(self.store.bookings(query).await?)
    }

    pub async fn bookings_for_student(&self, student_id: UserId) -> Result<Vec<Booking>> {
        self.list_bookings(&BookingQuery::for_student(student_id)).await
    }

    pub async fn bookings_for_room(&self, room_id: RoomId) -> Result<Vec<Booking>> {
        self.list_bookings(&BookingQuery::for_room(room_id)).await
    }

    // Rooms whose occupancy counter disagrees with their active bookings
    pub async fn audit(&self) -> Result<Vec<OccupancyDrift>> {
        self.reconciler.audit(self.store.as_ref()).await
    }
}

fn normalize_semester(semester: &str) -> Result<String> {
    let semester = semester.trim();
    if semester.is_empty() {
        return Err(BookingError::InvalidInput("semester is required".to_string()));
    }
    Ok(semester.to_string())
}

fn duplicate(student_id: UserId, semester: String) -> BookingError {
    BookingError::DuplicateActiveBooking {
        student_id,
        semester,
    }
}
