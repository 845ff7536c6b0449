use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::availability;
use crate::db;
use crate::error::{Error, Result};
use crate::lifecycle::{self, BookAppointment};
use crate::models::QueueStatus;
use crate::queue::{self, JoinQueue};
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/businesses").route(web::get().to(list_businesses)))
        .service(web::resource("/businesses/{id}").route(web::get().to(business_detail)))
        .service(web::resource("/businesses/{id}/wait").route(web::get().to(wait_estimate)))
        .service(
            web::resource("/businesses/{id}/queue").route(web::post().to(join_queue)),
        )
        .service(
            web::resource("/businesses/{id}/queue/{entry_id}")
                .route(web::get().to(queue_entry_status))
                .route(web::delete().to(leave_queue)),
        )
        .service(
            web::resource("/businesses/{id}/appointments").route(web::post().to(book_appointment)),
        )
        .service(
            web::resource("/appointments/{id}")
                .route(web::get().to(appointment_status))
                .route(web::delete().to(cancel_appointment)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("ok")
}

async fn list_businesses(state: web::Data<AppState>) -> Result<HttpResponse> {
    let businesses = db::find_businesses(&state.db).await?;
    Ok(HttpResponse::Ok().json(businesses))
}

async fn business_detail(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    let business = db::fetch_business(&state.db, &business_id).await?;
    let services = db::find_services(&state.db, &business_id).await?;
    let employees = db::find_employees(&state.db, &business_id).await?;
    let wait_minutes = availability::estimated_wait(&state.db, &business, None).await?;

    Ok(HttpResponse::Ok().json(json!({
        "business": business,
        "services": services,
        "employees": employees,
        "estimated_wait_minutes": wait_minutes,
    })))
}

#[derive(Deserialize)]
struct WaitQuery {
    service_id: Option<String>,
}

async fn wait_estimate(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<WaitQuery>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    let business = db::fetch_business(&state.db, &business_id).await?;
    let wait_minutes =
        availability::estimated_wait(&state.db, &business, query.service_id.as_deref()).await?;

    Ok(HttpResponse::Ok().json(json!({
        "business_id": business_id,
        "estimated_wait_minutes": wait_minutes,
    })))
}

async fn join_queue(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<JoinQueue>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    let entry = queue::join(&state, &business_id, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(entry))
}

async fn queue_entry_status(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (business_id, entry_id) = path.into_inner();
    let entry = db::fetch_queue_entry(&state.db, &entry_id).await?;
    if entry.business_id != business_id {
        return Err(Error::NotFound("queue entry"));
    }
    Ok(HttpResponse::Ok().json(entry))
}

async fn leave_queue(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse> {
    let (business_id, entry_id) = path.into_inner();
    let entry = db::fetch_queue_entry(&state.db, &entry_id).await?;
    if entry.business_id != business_id {
        return Err(Error::NotFound("queue entry"));
    }
    let cancelled = queue::update_status(&state, &entry_id, QueueStatus::Cancelled).await?;
    Ok(HttpResponse::Ok().json(cancelled))
}

async fn book_appointment(
    state: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<BookAppointment>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    let appointment = lifecycle::book(&state, &business_id, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(appointment))
}

async fn appointment_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let appointment = db::fetch_appointment(&state.db, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn cancel_appointment(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let cancelled = lifecycle::cancel(&state, &path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(cancelled))
}
