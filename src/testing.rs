//! In-memory stand-ins for the gate, ledger and notifier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ConflictKind, GateError, LedgerError, NotifyError};
use crate::gate::{Admission, AdmissionGate, GateKeys};
use crate::ledger::Ledger;
use crate::models::{Booking, BookingEvent, BookingStatus, BookingView, ListMode, NewBooking};
use crate::queue::Notifier;

#[derive(Default)]
pub struct FakeGate {
    pub keys: Mutex<HashSet<String>>,
    pub reserves: AtomicUsize,
    pub releases: AtomicUsize,
    pub fail_release: bool,
    pub stall: Option<Duration>,
}

#[async_trait]
impl AdmissionGate for FakeGate {
    async fn reserve(&self, keys: &GateKeys, _marker: &NewBooking, _ttl: Duration) -> Result<Admission, GateError> {
        self.reserves.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::time::sleep(stall).await;
        }
        let mut held = self.keys.lock().unwrap();
        if held.contains(&keys.user) {
            return Ok(Admission::Conflict(ConflictKind::UserAlreadyBooked));
        }
        if held.contains(&keys.table_slot) {
            return Ok(Admission::Conflict(ConflictKind::TableSlotTaken));
        }
        held.insert(keys.user.clone());
        held.insert(keys.table_slot.clone());
        Ok(Admission::Admitted)
    }

    async fn release(&self, keys: &GateKeys) -> Result<(), GateError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            return Err(GateError::UnexpectedStatus(-1));
        }
        let mut held = self.keys.lock().unwrap();
        held.remove(&keys.user);
        held.remove(&keys.table_slot);
        Ok(())
    }
}

/// Enforces one active row per `(table_id, booking_time)` like the
/// partial unique index does.
#[derive(Default)]
pub struct FakeLedger {
    pub rows: Mutex<Vec<Booking>>,
    pub fail_save: bool,
    /// Writes take this long; past the deadline they roll back.
    pub stall: Option<Duration>,
    /// Writes take this long on the blocking pool and commit regardless of
    /// the deadline.
    pub overrun: Option<Duration>,
}

impl FakeLedger {
    fn is_active_at(b: &Booking, table_id: i16, booking_time: DateTime<Utc>) -> bool {
        b.status == BookingStatus::Active && b.table_id == table_id && b.booking_time == booking_time
    }

    async fn pace(&self, deadline: Instant) -> Result<(), LedgerError> {
        if let Some(overrun) = self.overrun {
            tokio::task::spawn_blocking(move || std::thread::sleep(overrun)).await?;
        }
        if let Some(stall) = self.stall {
            if Instant::now() + stall > deadline {
                tokio::time::sleep_until(deadline).await;
                return Err(LedgerError::Timeout);
            }
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn save(&self, booking: &NewBooking, deadline: Instant) -> Result<i64, LedgerError> {
        self.pace(deadline).await?;
        if self.fail_save {
            return Err(LedgerError::Query(diesel::result::Error::BrokenTransactionManager));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|b| Self::is_active_at(b, booking.table_id, booking.booking_time)) {
            return Err(LedgerError::Duplicate);
        }
        let id = rows.len() as i64 + 1;
        rows.push(Booking {
            id,
            user_id: booking.user_id,
            table_id: booking.table_id,
            booking_time: booking.booking_time,
            status: BookingStatus::Active,
            created_at: Utc::now(),
            cancelled_at: None,
        });
        Ok(id)
    }

    async fn soft_delete(
        &self,
        table_id: i16,
        booking_time: DateTime<Utc>,
        owner: Option<i64>,
        deadline: Instant,
    ) -> Result<Booking, LedgerError> {
        self.pace(deadline).await?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .iter_mut()
            .find(|b| Self::is_active_at(b, table_id, booking_time) && owner.map_or(true, |uid| b.user_id == uid))
            .ok_or(LedgerError::NotFound)?;
        row.status = BookingStatus::Cancelled;
        row.cancelled_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn is_owner(&self, table_id: i16, booking_time: DateTime<Utc>, user_id: i64) -> Result<bool, LedgerError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .any(|b| Self::is_active_at(b, table_id, booking_time) && b.user_id == user_id))
    }

    async fn list(&self, mode: ListMode) -> Result<Vec<BookingView>, LedgerError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .filter(|b| mode == ListMode::All || b.status == BookingStatus::Active)
            .map(|b| BookingView {
                id: b.id,
                user_id: b.user_id,
                table_id: b.table_id,
                booking_time: b.booking_time,
                status: b.status,
                email: None,
                first_name: None,
                last_name: None,
            })
            .collect())
    }
}

/// The broker refuses the first `failures_left` publishes; later ones are
/// recorded.
#[derive(Default)]
pub struct FakeNotifier {
    pub sent: Mutex<Vec<BookingEvent>>,
    pub failures_left: AtomicUsize,
}

impl FakeNotifier {
    pub fn failing(times: usize) -> Self {
        Self { failures_left: AtomicUsize::new(times), ..Default::default() }
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn publish(&self, event: &BookingEvent) -> Result<(), NotifyError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(NotifyError::Nacked);
        }
        self.sent.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// 19:00 (or `hour`) UTC two days out: always bookable with a 5h lead time.
pub fn evening(hour: u32) -> DateTime<Utc> {
    let day = Utc::now() + chrono::Duration::days(2);
    day.date_naive().and_hms_opt(hour, 0, 0).unwrap().and_utc()
}
