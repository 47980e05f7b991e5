//! Booking orchestrator: the create and cancel sagas.
//!
//! | step                | create on failure                          | cancel on failure                    |
//! |---------------------|--------------------------------------------|--------------------------------------|
//! | validate slot       | reject, nothing touched                    | n/a                                  |
//! | gate reserve        | conflict/error surfaced, nothing to undo   | n/a                                  |
//! | ledger save/cancel  | error surfaced, gate marker expires by TTL | error surfaced, nothing else runs    |
//! | gate release        | n/a                                        | marker lingers until TTL, reported   |
//! | publish             | booking stands, reported as partial        | cancellation stands, reported        |
//!
//! The ledger write is the commit point of both sagas. Nothing before it is
//! compensated and nothing after it can fail the request. Once dispatched,
//! the write is awaited to its real outcome: the ledger bounds it by the
//! deadline itself, so an abandoned write can never commit behind our back.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use crate::auth::Principal;
use crate::error::{BookingError, LedgerError, NotifyError, SagaState};
use crate::gate::{lease_ttl, Admission, AdmissionGate, GateKeys};
use crate::ledger::Ledger;
use crate::models::{Booking, BookingEvent, BookingView, ListMode, NewBooking};
use crate::queue::Notifier;

const NOTIFY_BACKOFF: Duration = Duration::from_millis(25);

/// Minimum time left for release and publish once the ledger has committed.
pub const POST_COMMIT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SagaPolicy {
    pub min_lead_time: chrono::Duration,
    pub notify_attempts: u32,
}

/// Which bookings a cancel may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelScope {
    /// Only the principal's own booking.
    Own,
    /// Any active booking at the key.
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The change is committed but the consumer may never hear of it.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerRelease {
    Released,
    /// Release failed; the marker blocks the slot until its TTL runs out.
    Lingering(String),
}

#[derive(Debug, Clone)]
pub struct Created {
    pub id: i64,
    pub booking: NewBooking,
    pub notification: Delivery,
}

impl Created {
    pub fn is_partial(&self) -> bool {
        self.notification != Delivery::Sent
    }
}

#[derive(Debug, Clone)]
pub struct Cancelled {
    pub booking: Booking,
    pub marker: MarkerRelease,
    pub notification: Delivery,
}

impl Cancelled {
    pub fn is_partial(&self) -> bool {
        self.notification != Delivery::Sent || self.marker != MarkerRelease::Released
    }
}

/// Stateless coordinator shared by all request workers.
pub struct BookingService<G, L, N> {
    gate: G,
    ledger: L,
    notifier: N,
    policy: SagaPolicy,
}

async fn within<F: Future>(deadline: Instant, state: SagaState, fut: F) -> Result<F::Output, BookingError> {
    timeout_at(deadline, fut)
        .await
        .map_err(|_| BookingError::Timeout { state })
}

/// A failed ledger write did not commit. Past the deadline it is reported as
/// a timeout at the step the saga was on.
fn ledger_failure(e: LedgerError, state: SagaState, deadline: Instant) -> BookingError {
    if let LedgerError::Timeout = e {
        return BookingError::Timeout { state };
    }

    let e = BookingError::from(e);
    if e.is_transient() && Instant::now() >= deadline {
        BookingError::Timeout { state }
    } else {
        e
    }
}

fn advance(saga: &str, from: SagaState, to: SagaState) -> SagaState {
    debug!("Saga {}: {} -> {}", saga, from, to);
    to
}

impl<G, L, N> BookingService<G, L, N>
where
    G: AdmissionGate,
    L: Ledger,
    N: Notifier,
{
    pub fn new(gate: G, ledger: L, notifier: N, policy: SagaPolicy) -> Self {
        Self { gate, ledger, notifier, policy }
    }

    /// Check the slot against the clock and work out the marker lifetime.
    fn admit(&self, booking: &NewBooking, now: DateTime<Utc>) -> Result<Duration, BookingError> {
        if booking.table_id <= 0 {
            return Err(BookingError::Validation("table id must be positive".to_string()));
        }

        if booking.booking_time <= now {
            return Err(BookingError::Validation("cannot create booking for a past date".to_string()));
        }

        if booking.booking_time - now < self.policy.min_lead_time {
            return Err(BookingError::Validation(format!(
                "you can only book at least {} minutes in advance",
                self.policy.min_lead_time.num_minutes()
            )));
        }

        lease_ttl(booking.booking_time, now)
            .ok_or_else(|| BookingError::Validation("cannot create booking for a past date".to_string()))
    }

    pub async fn create(
        &self,
        principal: &Principal,
        table_id: i16,
        slot: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Created, BookingError> {
        let booking = NewBooking {
            user_id: principal.user_id,
            table_id,
            booking_time: slot,
        };
        let ttl = self.admit(&booking, Utc::now())?;
        let keys = GateKeys::for_booking(&booking);

        let mut state = SagaState::Start;
        match within(deadline, state, self.gate.reserve(&keys, &booking, ttl)).await?? {
            Admission::Admitted => {}
            Admission::Conflict(kind) => {
                warn!("⚠️ User {} refused table {} at {}: {}", booking.user_id, table_id, slot, kind);
                return Err(BookingError::Conflict(kind));
            }
        }
        state = advance("create", state, SagaState::GateReserved);

        let id = match self.ledger.save(&booking, deadline).await {
            Ok(id) => id,
            Err(e) => {
                let e = ledger_failure(e, state, deadline);
                // Accepted anomaly: the marker stays until its lease runs out.
                error!(
                    "❌ Ledger write failed for user {} table {} at {}, gate marker {} expires in {:?}: {}",
                    booking.user_id, table_id, slot, keys.table_slot, ttl, e
                );
                return Err(e);
            }
        };
        state = advance("create", state, SagaState::LedgerCommitted);
        let settle_by = deadline.max(Instant::now() + POST_COMMIT_GRACE);

        let notification = self.announce(&BookingEvent::created(&booking), settle_by).await;
        if notification == Delivery::Sent {
            state = advance("create", state, SagaState::Notified);
        }
        advance("create", state, SagaState::Done);

        info!("✅ Booking {} created: user {} table {} at {}", id, booking.user_id, table_id, slot);
        Ok(Created { id, booking, notification })
    }

    /// Cancel the active booking at `(table_id, slot)`. Whether `principal`
    /// may cancel other users' bookings is decided by the caller through
    /// `scope`; the ledger enforces it in the same statement that cancels.
    pub async fn cancel(
        &self,
        principal: &Principal,
        scope: CancelScope,
        table_id: i16,
        slot: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<Cancelled, BookingError> {
        let state = SagaState::Start;
        let owner = match scope {
            CancelScope::Own => Some(principal.user_id),
            CancelScope::Any => None,
        };

        let booking = match self.ledger.soft_delete(table_id, slot, owner, deadline).await {
            Ok(booking) => booking,
            Err(e) => {
                let e = ledger_failure(e, state, deadline);
                warn!("⚠️ User {} could not cancel table {} at {}: {}", principal.user_id, table_id, slot, e);
                return Err(e);
            }
        };
        let mut state = advance("cancel", state, SagaState::LedgerCommitted);
        let settle_by = deadline.max(Instant::now() + POST_COMMIT_GRACE);

        let keys = GateKeys::new(booking.user_id, booking.table_id, booking.booking_time);
        let marker = match within(settle_by, state, self.gate.release(&keys)).await {
            Ok(Ok(())) => {
                state = advance("cancel", state, SagaState::GateReleased);
                MarkerRelease::Released
            }
            Ok(Err(e)) => {
                warn!("⚠️ Gate release failed for {} / {}, markers expire on their own: {}", keys.user, keys.table_slot, e);
                MarkerRelease::Lingering(e.to_string())
            }
            Err(e) => {
                warn!("⚠️ Gate release for {} / {}: {}", keys.user, keys.table_slot, e);
                MarkerRelease::Lingering(e.to_string())
            }
        };

        let event = BookingEvent::cancelled(booking.table_id, booking.booking_time);
        let notification = self.announce(&event, settle_by).await;
        if notification == Delivery::Sent {
            state = advance("cancel", state, SagaState::Notified);
        }
        advance("cancel", state, SagaState::Done);

        info!(
            "✅ Booking {} cancelled by user {}: table {} at {}",
            booking.id, principal.user_id, booking.table_id, booking.booking_time
        );
        Ok(Cancelled { booking, marker, notification })
    }

    pub async fn list(&self, mode: ListMode, deadline: Instant) -> Result<Vec<BookingView>, BookingError> {
        Ok(within(deadline, SagaState::Start, self.ledger.list(mode)).await??)
    }

    pub async fn is_owner(
        &self,
        principal: &Principal,
        table_id: i16,
        slot: DateTime<Utc>,
        deadline: Instant,
    ) -> Result<bool, BookingError> {
        Ok(within(deadline, SagaState::Start, self.ledger.is_owner(table_id, slot, principal.user_id)).await??)
    }

    /// Publish with bounded retries. Never fails the saga: by the time this
    /// runs the ledger has committed.
    async fn announce(&self, event: &BookingEvent, deadline: Instant) -> Delivery {
        let max_attempts = self.policy.notify_attempts.max(1);
        let mut delay = NOTIFY_BACKOFF;
        let mut attempt = 1;

        loop {
            let err = match timeout_at(deadline, self.notifier.publish(event)).await {
                Ok(Ok(())) => return Delivery::Sent,
                Ok(Err(e)) => e,
                Err(_) => NotifyError::Timeout,
            };

            let out_of_time = Instant::now() + delay >= deadline;
            if attempt >= max_attempts || out_of_time || matches!(err, NotifyError::Timeout) {
                error!("❌ Notification failed after {} attempt(s), giving up: {:?}", attempt, err);
                return Delivery::Failed(err.to_string());
            }

            warn!("Notification failed (attempt {}/{}), retrying: {:?}", attempt, max_attempts, err);
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }
}
