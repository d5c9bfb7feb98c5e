// Hostel room booking ledger: room capacity, booking lifecycle and the
// occupancy counter that ties them together

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod reconciler;
pub mod registry;
pub mod status;
pub mod store;
pub mod types;

// Re-export key types for convenience
pub use config::{Config, NotifierConfig, SqliteConfig, StoreConfig, WebhookConfig};
pub use error::{BookingError, Result, StoreError};
pub use ledger::BookingLedger;
pub use notify::{InboxNotifier, Notification, NotificationSink, Severity, WebhookNotifier};
pub use reconciler::{OccupancyDrift, OccupancyReconciler};
pub use registry::RoomRegistry;
pub use status::{BookingStatus, Delta};
pub use store::{BookingStore, MemoryStore, StoreTx};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use types::{
    Actor, BlockId, Booking, BookingId, BookingQuery, NewRoom, Role, Room, RoomId, UserId,
};
