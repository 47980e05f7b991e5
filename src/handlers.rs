use actix_web::{error, web, HttpResponse};
use std::time::Duration;
use tokio::time::Instant;

use crate::auth::{AdminDirectory, Principal};
use crate::error::BookingError;
use crate::gate::AdmissionGate;
use crate::ledger::Ledger;
use crate::models::{ApiResponse, BookTableRequest, BookTableResponse, BookingsQuery, CancelBookingRequest};
use crate::queue::Notifier;
use crate::saga::{BookingService, CancelScope};

/// Shared across all HTTP workers.
pub struct AppState<G, L, N> {
    pub service: BookingService<G, L, N>,
    pub admins: AdminDirectory,
    pub request_timeout: Duration,
}

impl<G, L, N> AppState<G, L, N> {
    fn deadline(&self) -> Instant {
        Instant::now() + self.request_timeout
    }
}

fn message(text: impl Into<String>) -> ApiResponse {
    ApiResponse { message: text.into() }
}

fn booking_error(e: BookingError) -> actix_web::Error {
    let response = match &e {
        BookingError::Validation(detail) => HttpResponse::BadRequest().json(message(detail.clone())),
        BookingError::Conflict(kind) => HttpResponse::Conflict().json(message(kind.to_string())),
        BookingError::NotFound => HttpResponse::NotFound().json(message("booking is not found")),
        BookingError::Timeout { .. } => HttpResponse::GatewayTimeout().json(message("request timed out")),
        BookingError::Gate(_) | BookingError::Ledger(_) => {
            log::error!("❌ Booking infrastructure failure: {:?}", e);
            HttpResponse::ServiceUnavailable().json(message("service temporarily unavailable"))
        }
    };
    error::InternalError::from_response(e, response).into()
}

fn forbidden(detail: &str) -> HttpResponse {
    HttpResponse::Forbidden().json(message(detail))
}

async fn book_table<G, L, N>(
    state: web::Data<AppState<G, L, N>>,
    principal: Principal,
    form: web::Json<BookTableRequest>,
) -> actix_web::Result<HttpResponse>
where
    G: AdmissionGate + 'static,
    L: Ledger + 'static,
    N: Notifier + 'static,
{
    if state.admins.is_admin(&principal) {
        return Ok(forbidden("admin can't book tables"));
    }

    let created = state
        .service
        .create(&principal, form.table_id, form.booking_at, state.deadline())
        .await
        .map_err(booking_error)?;

    if created.is_partial() {
        return Ok(HttpResponse::Accepted().json(BookTableResponse {
            booking_id: created.id,
            message: "table booked, confirmation will be delayed".to_string(),
        }));
    }

    Ok(HttpResponse::Created().json(BookTableResponse {
        booking_id: created.id,
        message: "table booked successfully".to_string(),
    }))
}

async fn cancel_booking<G, L, N>(
    state: web::Data<AppState<G, L, N>>,
    principal: Principal,
    form: web::Json<CancelBookingRequest>,
) -> actix_web::Result<HttpResponse>
where
    G: AdmissionGate + 'static,
    L: Ledger + 'static,
    N: Notifier + 'static,
{
    let deadline = state.deadline();
    let scope = if state.admins.is_admin(&principal) {
        CancelScope::Any
    } else {
        CancelScope::Own
    };

    // Early check for a clear 403; the ledger enforces ownership again when
    // it cancels.
    if scope == CancelScope::Own {
        let owner = state
            .service
            .is_owner(&principal, form.table_id, form.booking_time, deadline)
            .await
            .map_err(booking_error)?;
        if !owner {
            return Ok(forbidden("you are not the owner of this booking"));
        }
    }

    let cancelled = state
        .service
        .cancel(&principal, scope, form.table_id, form.booking_time, deadline)
        .await
        .map_err(booking_error)?;

    if cancelled.is_partial() {
        return Ok(HttpResponse::Accepted().json(message("booking cancelled, follow-up steps are pending")));
    }

    Ok(HttpResponse::Ok().json(message("booking cancelled successfully")))
}

async fn list_bookings<G, L, N>(
    state: web::Data<AppState<G, L, N>>,
    principal: Principal,
    query: web::Query<BookingsQuery>,
) -> actix_web::Result<HttpResponse>
where
    G: AdmissionGate + 'static,
    L: Ledger + 'static,
    N: Notifier + 'static,
{
    if !state.admins.is_admin(&principal) {
        return Ok(forbidden("admin access required"));
    }

    let bookings = state
        .service
        .list(query.mode, state.deadline())
        .await
        .map_err(booking_error)?;

    Ok(HttpResponse::Ok().json(bookings))
}

/// Register the booking routes plus JSON and query error handlers.
pub fn configure<G, L, N>(cfg: &mut web::ServiceConfig)
where
    G: AdmissionGate + 'static,
    L: Ledger + 'static,
    N: Notifier + 'static,
{
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        let detail = err.to_string();
        let response = match err {
            error::JsonPayloadError::ContentType => {
                HttpResponse::UnsupportedMediaType().body("Unsupported Media Type")
            }
            error::JsonPayloadError::Deserialize(ref err) => {
                HttpResponse::BadRequest().json(message(err.to_string()))
            }
            _ => HttpResponse::BadRequest().json(message(detail)),
        };
        error::InternalError::from_response(err, response).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
        let response = HttpResponse::BadRequest().json(message("mode must be one of: all, active"));
        error::InternalError::from_response(err, response).into()
    }))
    .route("/book", web::post().to(book_table::<G, L, N>))
    .route("/cancel", web::post().to(cancel_booking::<G, L, N>))
    .route("/bookings", web::get().to(list_bookings::<G, L, N>));
}
