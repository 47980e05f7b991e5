use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::LedgerError;
use crate::models::{Booking, BookingStatus, BookingView, ListMode, NewBooking};

pub type DbPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Authoritative booking store.
///
/// Writes take the caller's deadline and must either finish or fail without
/// committing by then: a write that commits after its caller gave up would
/// leave a row nobody knows about.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert an active booking and return its id.
    async fn save(&self, booking: &NewBooking, deadline: Instant) -> Result<i64, LedgerError>;

    /// Mark the active booking at `(table_id, booking_time)` cancelled and
    /// return it. With `owner` set, only that user's booking matches.
    async fn soft_delete(
        &self,
        table_id: i16,
        booking_time: DateTime<Utc>,
        owner: Option<i64>,
        deadline: Instant,
    ) -> Result<Booking, LedgerError>;

    async fn is_owner(&self, table_id: i16, booking_time: DateTime<Utc>, user_id: i64) -> Result<bool, LedgerError>;

    async fn list(&self, mode: ListMode) -> Result<Vec<BookingView>, LedgerError>;
}

pub fn initialize_db_pool(url: &str, max_size: u32, connection_timeout: Duration) -> Result<DbPool, LedgerError> {
    let manager = ConnectionManager::<PgConnection>::new(url);
    let pool = r2d2::Pool::builder()
        .max_size(max_size)
        .connection_timeout(connection_timeout)
        .build(manager)?;

    Ok(pool)
}

pub fn insert_booking(conn: &mut PgConnection, booking: &NewBooking) -> Result<i64, LedgerError> {
    use crate::schema::bookings::dsl::{bookings, id};

    let new_id = diesel::insert_into(bookings)
        .values(booking)
        .returning(id)
        .get_result::<i64>(conn)?;

    Ok(new_id)
}

pub fn cancel_booking(
    conn: &mut PgConnection,
    tid: i16,
    at: DateTime<Utc>,
    owner: Option<i64>,
) -> Result<Booking, LedgerError> {
    use crate::schema::bookings::dsl::{bookings, booking_time, cancelled_at, status, table_id, user_id};

    // Cancelled rows never match, so a second cancel reports NotFound.
    let mut target = diesel::update(bookings)
        .filter(table_id.eq(tid))
        .filter(booking_time.eq(at))
        .filter(status.eq(BookingStatus::Active))
        .into_boxed();
    if let Some(uid) = owner {
        target = target.filter(user_id.eq(uid));
    }

    let cancelled = target
        .set((
            status.eq(BookingStatus::Cancelled),
            cancelled_at.eq(Some(Utc::now())),
        ))
        .returning(Booking::as_returning())
        .get_result::<Booking>(conn)
        .optional()?;

    cancelled.ok_or(LedgerError::NotFound)
}

/// Run `op` in a transaction whose statements are cancelled server side once
/// `budget` runs out, so a timed-out write rolls back instead of landing late.
pub fn within_budget<T, F>(conn: &mut PgConnection, budget: Duration, op: F) -> Result<T, LedgerError>
where
    F: FnOnce(&mut PgConnection) -> Result<T, LedgerError>,
{
    if budget.is_zero() {
        return Err(LedgerError::Timeout);
    }

    conn.transaction(|conn| {
        diesel::sql_query(format!("SET LOCAL statement_timeout = {}", budget.as_millis().max(1)))
            .execute(conn)?;
        op(conn)
    })
}

pub fn check_booking_owner(conn: &mut PgConnection, tid: i16, at: DateTime<Utc>, uid: i64) -> Result<bool, LedgerError> {
    use crate::schema::bookings::dsl::{bookings, booking_time, status, table_id, user_id};

    let owned = diesel::select(diesel::dsl::exists(
        bookings
            .filter(table_id.eq(tid))
            .filter(booking_time.eq(at))
            .filter(user_id.eq(uid))
            .filter(status.eq(BookingStatus::Active)),
    ))
    .get_result::<bool>(conn)?;

    Ok(owned)
}

pub fn load_bookings(conn: &mut PgConnection, mode: ListMode) -> Result<Vec<BookingView>, LedgerError> {
    use crate::schema::{bookings, users};

    let mut query = bookings::table
        .left_join(users::table)
        .select((
            bookings::id,
            bookings::user_id,
            bookings::table_id,
            bookings::booking_time,
            bookings::status,
            users::email.nullable(),
            users::first_name.nullable(),
            users::last_name.nullable(),
        ))
        .order((bookings::booking_time.asc(), bookings::id.asc()))
        .into_boxed();

    if mode == ListMode::Active {
        query = query.filter(bookings::status.eq(BookingStatus::Active));
    }

    Ok(query.load::<BookingView>(conn)?)
}

#[derive(Clone)]
pub struct PgLedger {
    pool: DbPool,
}

impl PgLedger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, LedgerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        })
        .await?
    }

    async fn write<T, F>(&self, deadline: Instant, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, LedgerError> + Send + 'static,
    {
        let deadline = deadline.into_std();
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let wait = deadline.saturating_duration_since(std::time::Instant::now());
            if wait.is_zero() {
                return Err(LedgerError::Timeout);
            }
            let mut conn = pool.get_timeout(wait)?;
            let budget = deadline.saturating_duration_since(std::time::Instant::now());
            within_budget(&mut conn, budget, op)
        })
        .await?
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn save(&self, booking: &NewBooking, deadline: Instant) -> Result<i64, LedgerError> {
        let booking = booking.clone();
        self.write(deadline, move |conn| insert_booking(conn, &booking)).await
    }

    async fn soft_delete(
        &self,
        table_id: i16,
        booking_time: DateTime<Utc>,
        owner: Option<i64>,
        deadline: Instant,
    ) -> Result<Booking, LedgerError> {
        self.write(deadline, move |conn| cancel_booking(conn, table_id, booking_time, owner))
            .await
    }

    async fn is_owner(&self, table_id: i16, booking_time: DateTime<Utc>, user_id: i64) -> Result<bool, LedgerError> {
        self.run(move |conn| check_booking_owner(conn, table_id, booking_time, user_id)).await
    }

    async fn list(&self, mode: ListMode) -> Result<Vec<BookingView>, LedgerError> {
        self.run(move |conn| load_bookings(conn, mode)).await
    }
}
