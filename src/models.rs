use serde::{Deserialize, Serialize};
use crate::schema::bookings;
use chrono::{DateTime, Utc};
use diesel::{deserialize::{self, FromSql}, pg::{Pg, PgValue}, serialize::{self, Output, ToSql}, sql_types::Text, Insertable, Selectable};

/// `user_id` carried by a notification that announces a cancellation.
pub const CANCELLATION_SENTINEL: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = crate::schema::sql_types::BookingStatus)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

impl ToSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let s = match *self {
            BookingStatus::Active => "ACTIVE",
            BookingStatus::Cancelled => "CANCELLED",
        };
        <str as ToSql<Text, Pg>>::to_sql(s, out)
    }
}

impl FromSql<crate::schema::sql_types::BookingStatus, Pg> for BookingStatus {
    fn from_sql(bytes: PgValue) -> deserialize::Result<Self> {
        match <String as FromSql<Text, Pg>>::from_sql(bytes)?.as_str() {
            "ACTIVE" => Ok(BookingStatus::Active),
            "CANCELLED" => Ok(BookingStatus::Cancelled),
            s => Err(format!("Unrecognized booking status: {}", s).into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = bookings)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Booking {
    pub id: i64,
    pub user_id: i64,
    pub table_id: i16,
    pub booking_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// A reservation request on its way into the ledger. Also the payload stored
/// under both admission gate keys.
#[derive(Debug, Clone, PartialEq, Eq, Insertable, Serialize, Deserialize)]
#[diesel(table_name = bookings)]
pub struct NewBooking {
    pub user_id: i64,
    pub table_id: i16,
    pub booking_time: DateTime<Utc>,
}

/// Row returned by ledger listings, joined with the owner's profile when the
/// auth service knows the user.
#[derive(Debug, Clone, PartialEq, Queryable, Serialize)]
pub struct BookingView {
    pub id: i64,
    pub user_id: i64,
    pub table_id: i16,
    pub booking_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListMode {
    All,
    Active,
}

/// Message handed to the notification consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEvent {
    pub user_id: i64,
    pub table_id: i16,
    pub booking_time: DateTime<Utc>,
}

impl BookingEvent {
    pub fn created(booking: &NewBooking) -> Self {
        Self {
            user_id: booking.user_id,
            table_id: booking.table_id,
            booking_time: booking.booking_time,
        }
    }

    pub fn cancelled(table_id: i16, booking_time: DateTime<Utc>) -> Self {
        Self {
            user_id: CANCELLATION_SENTINEL,
            table_id,
            booking_time,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        self.user_id == CANCELLATION_SENTINEL
    }
}

// Request/Response models for API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTableRequest {
    pub table_id: i16,
    pub booking_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBookingRequest {
    pub table_id: i16,
    pub booking_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct BookingsQuery {
    pub mode: ListMode,
}

#[derive(Debug, Serialize)]
pub struct BookTableResponse {
    pub booking_id: i64,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn slot() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 19, 0, 0).unwrap()
    }

    #[test]
    fn created_event_matches_wire_contract() {
        let booking = NewBooking { user_id: 1, table_id: 5, booking_time: slot() };
        let body = serde_json::to_string(&BookingEvent::created(&booking)).unwrap();

        assert_eq!(body, r#"{"user_id":1,"table_id":5,"booking_time":"2024-06-01T19:00:00Z"}"#);
    }

    #[test]
    fn cancelled_event_carries_sentinel() {
        let event = BookingEvent::cancelled(5, slot());
        let body = serde_json::to_string(&event).unwrap();

        assert!(event.is_cancellation());
        assert_eq!(body, r#"{"user_id":-1,"table_id":5,"booking_time":"2024-06-01T19:00:00Z"}"#);
    }

    #[test]
    fn list_mode_rejects_unknown_values() {
        let mode: ListMode = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(mode, ListMode::Active);
        assert!(serde_json::from_str::<ListMode>("\"pending\"").is_err());
    }

    #[test]
    fn book_request_uses_camel_case() {
        let req: BookTableRequest =
            serde_json::from_str(r#"{"tableId":5,"bookingAt":"2024-06-01T19:00:00Z"}"#).unwrap();
        assert_eq!(req.table_id, 5);
        assert_eq!(req.booking_at, slot());
    }
}
