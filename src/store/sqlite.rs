// SQLite store on sqlx. Each ledger transaction opens with a write statement,
// so SQLite takes the write lock before any check is read.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    FromRow, QueryBuilder, Sqlite, SqlitePool, Transaction,
};
use tracing::info;

use super::{BookingStore, RoomOccupancy, StoreResult, StoreTx};
use crate::{
    config::SqliteConfig,
    error::StoreError,
    status::BookingStatus,
    types::{
        BlockId, Booking, BookingId, BookingQuery, NewBooking, NewRoom, Room, RoomId, UserId,
    },
};

const ROOM_COLUMNS: &str =
    "id, block_id, room_number, capacity, current_occupancy, price_per_semester";
const BOOKING_COLUMNS: &str = "id, student_id, room_id, semester, status, created_at";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(config: &SqliteConfig) -> StoreResult<Self> {
        let in_memory = config.url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every connection to an in-memory url gets its own database, so keep exactly one alive
        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if in_memory {
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        let store = Self::new(pool).await?;
        info!("Opened booking database: {}", config.url);
        Ok(store)
    }

    pub async fn new(pool: SqlitePool) -> StoreResult<Self> {
        init_schema(&pool).await?;
        Ok(Self { pool })
    }
}

async fn init_schema(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rooms (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            block_id INTEGER NOT NULL,
            room_number TEXT NOT NULL,
            capacity INTEGER NOT NULL CHECK (capacity > 0),
            current_occupancy INTEGER NOT NULL DEFAULT 0
                CHECK (current_occupancy BETWEEN 0 AND capacity),
            price_per_semester REAL NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bookings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            room_id INTEGER NOT NULL REFERENCES rooms(id),
            semester TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('PENDING', 'CONFIRMED', 'REJECTED', 'CANCELLED')),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // storage backstop for one active booking per student and semester
    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS bookings_one_active \
         ON bookings (student_id, semester) WHERE status IN ({})",
        active_statuses()
    ))
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS bookings_room ON bookings (room_id)")
        .execute(pool)
        .await?;

    Ok(())
}

#[derive(Debug, FromRow)]
struct RoomRow {
    id: i64,
    block_id: i64,
    room_number: String,
    capacity: i64,
    current_occupancy: i64,
    price_per_semester: f64,
}

impl TryFrom<RoomRow> for Room {
    type Error = StoreError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        let counter = |name: &str, value: i64| {
            u32::try_from(value)
                .map_err(|_| StoreError::Corrupt(format!("room {}: {name} = {value}", row.id)))
        };
        Ok(Room {
            id: RoomId(row.id),
            block_id: BlockId(row.block_id),
            capacity: counter("capacity", row.capacity)?,
            current_occupancy: counter("current_occupancy", row.current_occupancy)?,
            room_number: row.room_number,
            price_per_semester: row.price_per_semester,
        })
    }
}

#[derive(Debug, FromRow)]
struct RoomOccupancyRow {
    #[sqlx(flatten)]
    room: RoomRow,
    active_bookings: i64,
}

impl TryFrom<RoomOccupancyRow> for RoomOccupancy {
    type Error = StoreError;

    fn try_from(row: RoomOccupancyRow) -> Result<Self, Self::Error> {
        let active_bookings = u32::try_from(row.active_bookings).map_err(|_| {
            StoreError::Corrupt(format!(
                "room {}: active bookings = {}",
                row.room.id, row.active_bookings
            ))
        })?;
        Ok(RoomOccupancy {
            room: row.room.try_into()?,
            active_bookings,
        })
    }
}

#[derive(Debug, FromRow)]
struct BookingRow {
    id: i64,
    student_id: i64,
    room_id: i64,
    semester: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = StoreError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<BookingStatus>()
            .map_err(|e| StoreError::Corrupt(format!("booking {}: {e}", row.id)))?;
        Ok(Booking {
            id: BookingId(row.id),
            student_id: UserId(row.student_id),
            room_id: RoomId(row.room_id),
            semester: row.semester,
            status,
            created_at: row.created_at,
        })
    }
}

fn room_select() -> String {
    format!("SELECT {ROOM_COLUMNS} FROM rooms")
}

fn booking_select() -> String {
    format!("SELECT {BOOKING_COLUMNS} FROM bookings")
}

// 'PENDING', 'CONFIRMED'
fn active_statuses() -> String {
    BookingStatus::ACTIVE
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn conflict_or(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    let unique = matches!(&err, sqlx::Error::Database(db) if db.is_unique_violation());
    if unique {
        StoreError::Conflict(what())
    } else {
        StoreError::Database(err)
    }
}

#[async_trait]
impl BookingStore for SqliteStore {
    async fn begin(&self) -> StoreResult<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTx { tx: Some(tx) }))
    }

    async fn insert_room(&self, room: NewRoom) -> StoreResult<Room> {
        let row: RoomRow = sqlx::query_as(&format!(
            "INSERT INTO rooms (block_id, room_number, capacity, current_occupancy, price_per_semester) \
             VALUES (?1, ?2, ?3, 0, ?4) RETURNING {ROOM_COLUMNS}"
        ))
        .bind(room.block_id.0)
        .bind(&room.room_number)
        .bind(room.capacity as i64)
        .bind(room.price_per_semester)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn room(&self, id: RoomId) -> StoreResult<Option<Room>> {
        let row: Option<RoomRow> = sqlx::query_as(&format!("{} WHERE id = ?1", room_select()))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Room::try_from).transpose()
    }

    async fn rooms(&self) -> StoreResult<Vec<Room>> {
        let rows: Vec<RoomRow> = sqlx::query_as(&format!("{} ORDER BY id", room_select()))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Room::try_from).collect()
    }

    async fn occupancy_snapshot(&self) -> StoreResult<Vec<RoomOccupancy>> {
        // one statement, so rooms and counts come from the same read snapshot
        let rows: Vec<RoomOccupancyRow> = sqlx::query_as(&format!(
            "SELECT r.id, r.block_id, r.room_number, r.capacity, r.current_occupancy, \
             r.price_per_semester, \
             (SELECT COUNT(*) FROM bookings b WHERE b.room_id = r.id AND b.status IN ({})) \
             AS active_bookings \
             FROM rooms r ORDER BY r.id",
            active_statuses()
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(RoomOccupancy::try_from).collect()
    }

    async fn booking(&self, id: BookingId) -> StoreResult<Option<Booking>> {
        let row: Option<BookingRow> =
            sqlx::query_as(&format!("{} WHERE id = ?1", booking_select()))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn bookings(&self, query: &BookingQuery) -> StoreResult<Vec<Booking>> {
        let mut builder = QueryBuilder::<Sqlite>::new(booking_select());
        builder.push(" WHERE 1 = 1");
        if let Some(student_id) = query.student_id {
            builder.push(" AND student_id = ").push_bind(student_id.0);
        }
        if let Some(room_id) = query.room_id {
            builder.push(" AND room_id = ").push_bind(room_id.0);
        }
        if let Some(semester) = &query.semester {
            builder.push(" AND semester = ").push_bind(semester.clone());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if query.active_only {
            builder.push(format!(" AND status IN ({})", active_statuses()));
        }
        builder.push(" ORDER BY id");

        let rows = builder
            .build_query_as::<BookingRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Booking::try_from).collect()
    }
}

struct SqliteTx {
    // taken on commit; dropping a live transaction rolls it back
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTx {
    fn conn(&mut self) -> StoreResult<&mut Transaction<'static, Sqlite>> {
        self.tx.as_mut().ok_or(StoreError::TransactionClosed)
    }
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn room(&mut self, id: RoomId) -> StoreResult<Option<Room>> {
        let tx = self.conn()?;
        let row: Option<RoomRow> = sqlx::query_as(&format!("{} WHERE id = ?1", room_select()))
            .bind(id.0)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(Room::try_from).transpose()
    }

    async fn adjust_occupancy(&mut self, id: RoomId, delta: i64) -> StoreResult<bool> {
        let tx = self.conn()?;
        let result = sqlx::query(
            "UPDATE rooms SET current_occupancy = current_occupancy + ?1 \
             WHERE id = ?2 AND current_occupancy + ?1 BETWEEN 0 AND capacity",
        )
        .bind(delta)
        .bind(id.0)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_booking(
        &mut self,
        student_id: UserId,
        semester: &str,
        except: Option<BookingId>,
    ) -> StoreResult<Option<Booking>> {
        let tx = self.conn()?;
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "{} WHERE student_id = ?1 AND semester = ?2 \
             AND status IN ({}) AND id != ?3 LIMIT 1",
            booking_select(),
            active_statuses()
        ))
        .bind(student_id.0)
        .bind(semester)
        .bind(except.map_or(0, |id| id.0))
        .fetch_optional(&mut **tx)
        .await?;
        row.map(Booking::try_from).transpose()
    }

    async fn insert_booking(&mut self, booking: NewBooking) -> StoreResult<Booking> {
        let tx = self.conn()?;
        let row: BookingRow = sqlx::query_as(&format!(
            "INSERT INTO bookings (student_id, room_id, semester, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(booking.student_id.0)
        .bind(booking.room_id.0)
        .bind(&booking.semester)
        .bind(BookingStatus::Pending.as_str())
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| {
            conflict_or(e, || {
                format!(
                    "student {} already has an active booking in {}",
                    booking.student_id, booking.semester
                )
            })
        })?;
        row.try_into()
    }

    async fn swap_status(
        &mut self,
        id: BookingId,
        from: BookingStatus,
        to: BookingStatus,
    ) -> StoreResult<Option<Booking>> {
        let tx = self.conn()?;
        let row: Option<BookingRow> = sqlx::query_as(&format!(
            "UPDATE bookings SET status = ?1 WHERE id = ?2 AND status = ?3 \
             RETURNING {BOOKING_COLUMNS}"
        ))
        .bind(to.as_str())
        .bind(id.0)
        .bind(from.as_str())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| conflict_or(e, || format!("booking {id} would duplicate an active booking")))?;
        row.map(Booking::try_from).transpose()
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let tx = self.tx.take().ok_or(StoreError::TransactionClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect(&SqliteConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            busy_timeout_ms: 1000,
        })
        .await
        .unwrap()
    }

    async fn add_room(store: &SqliteStore, capacity: u32) -> Room {
        store
            .insert_room(NewRoom {
                block_id: BlockId(2),
                room_number: "C-310".to_string(),
                capacity,
                price_per_semester: 1100.5,
            })
            .await
            .unwrap()
    }

    fn new_booking(student: i64, room: RoomId) -> NewBooking {
        NewBooking {
            student_id: UserId(student),
            room_id: room,
            semester: "2025-FALL".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_room_starts_empty() {
        let store = memory_store().await;
        let room = add_room(&store, 3).await;

        assert_eq!(room.current_occupancy, 0);
        assert_eq!(store.room(room.id).await.unwrap(), Some(room.clone()));
        assert_eq!(store.rooms().await.unwrap(), vec![room]);
    }

    #[tokio::test]
    async fn test_conditional_update_stops_at_bounds() {
        let store = memory_store().await;
        let room = add_room(&store, 1).await;

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.adjust_occupancy(room.id, -1).await.unwrap());
        assert!(tx.adjust_occupancy(room.id, 1).await.unwrap());
        assert!(!tx.adjust_occupancy(room.id, 1).await.unwrap());
        tx.commit().await.unwrap();

        assert_eq!(store.room(room.id).await.unwrap().unwrap().current_occupancy, 1);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_discarded() {
        let store = memory_store().await;
        let room = add_room(&store, 2).await;
        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.adjust_occupancy(room.id, 1).await.unwrap());
            tx.insert_booking(new_booking(1, room.id)).await.unwrap();
        }

        assert_eq!(store.room(room.id).await.unwrap().unwrap().current_occupancy, 0);
        assert!(store.bookings(&BookingQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_index_rejects_second_active_booking() {
        let store = memory_store().await;
        let room = add_room(&store, 3).await;

        let mut tx = store.begin().await.unwrap();
        let first = tx.insert_booking(new_booking(4, room.id)).await.unwrap();
        let err = tx.insert_booking(new_booking(4, room.id)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // once the first is terminal the student may book again
        tx.swap_status(first.id, BookingStatus::Pending, BookingStatus::Cancelled)
            .await
            .unwrap()
            .unwrap();
        tx.insert_booking(new_booking(4, room.id)).await.unwrap();
        tx.commit().await.unwrap();

        let active = store
            .bookings(&BookingQuery::for_student(UserId(4)).active())
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_swap_status_checks_current_value() {
        let store = memory_store().await;
        let room = add_room(&store, 2).await;

        let mut tx = store.begin().await.unwrap();
        let booking = tx.insert_booking(new_booking(8, room.id)).await.unwrap();
        let confirmed = tx
            .swap_status(booking.id, BookingStatus::Pending, BookingStatus::Confirmed)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert!(tx
            .swap_status(booking.id, BookingStatus::Pending, BookingStatus::Rejected)
            .await
            .unwrap()
            .is_none());
        tx.commit().await.unwrap();

        let stored = store.booking(booking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BookingStatus::Confirmed);
        assert_eq!(stored.semester, "2025-FALL");
    }

    #[tokio::test]
    async fn test_query_builder_filters() {
        let store = memory_store().await;
        let room = add_room(&store, 5).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_booking(new_booking(1, room.id)).await.unwrap();
        let second = tx.insert_booking(new_booking(2, room.id)).await.unwrap();
        tx.swap_status(second.id, BookingStatus::Pending, BookingStatus::Rejected)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let all = store.bookings(&BookingQuery::for_room(room.id)).await.unwrap();
        assert_eq!(all.len(), 2);

        let active = store
            .bookings(&BookingQuery::for_room(room.id).active())
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].student_id, UserId(1));

        let rejected = store
            .bookings(&BookingQuery {
                status: Some(BookingStatus::Rejected),
                semester: Some("2025-FALL".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].id, second.id);
    }

    #[tokio::test]
    async fn test_occupancy_snapshot_counts_active_bookings() {
        let store = memory_store().await;
        let busy = add_room(&store, 4).await;
        let empty = add_room(&store, 2).await;

        let mut tx = store.begin().await.unwrap();
        assert!(tx.adjust_occupancy(busy.id, 1).await.unwrap());
        tx.insert_booking(new_booking(1, busy.id)).await.unwrap();
        let cancelled = tx.insert_booking(new_booking(2, busy.id)).await.unwrap();
        tx.swap_status(cancelled.id, BookingStatus::Pending, BookingStatus::Cancelled)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let snapshot = store.occupancy_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].room.id, busy.id);
        assert_eq!(snapshot[0].room.current_occupancy, 1);
        assert_eq!(snapshot[0].active_bookings, 1);
        assert_eq!(snapshot[1].room.id, empty.id);
        assert_eq!(snapshot[1].active_bookings, 0);
    }
}
