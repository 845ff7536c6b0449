use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::auth::{staff_validator, AuthUser};
use crate::db;
use crate::error::Result;
use crate::lifecycle;
use crate::models::{AppointmentStatus, EmployeeStatus, QueueStatus};
use crate::queue;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/staff")
            .wrap(HttpAuthentication::basic(staff_validator))
            .service(web::resource("/appointments").route(web::get().to(my_appointments)))
            .service(
                web::resource("/appointments/{id}/status")
                    .route(web::post().to(update_appointment_status)),
            )
            .service(web::resource("/queue").route(web::get().to(my_queue)))
            .service(
                web::resource("/queue/{entry_id}/status")
                    .route(web::post().to(update_queue_status)),
            )
            .service(web::resource("/status").route(web::post().to(set_my_status))),
    );
}

async fn my_appointments(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
) -> Result<HttpResponse> {
    let employee = db::fetch_employee_for_user(&state.db, &auth.id).await?;
    let now = Utc::now();
    let appointments =
        db::find_scheduled_appointments(&state.db, &employee.id, now, now + Duration::days(7))
            .await?;
    Ok(HttpResponse::Ok().json(appointments))
}

#[derive(Deserialize)]
struct AppointmentStatusForm {
    status: AppointmentStatus,
}

async fn update_appointment_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<AppointmentStatusForm>,
) -> Result<HttpResponse> {
    let appointment = lifecycle::set_status(&state, &path.into_inner(), form.status).await?;
    Ok(HttpResponse::Ok().json(appointment))
}

async fn my_queue(state: web::Data<AppState>, auth: web::ReqData<AuthUser>) -> Result<HttpResponse> {
    let employee = db::fetch_employee_for_user(&state.db, &auth.id).await?;
    let queue = db::find_active_queue(&state.db, &employee.business_id).await?;
    Ok(HttpResponse::Ok().json(queue))
}

#[derive(Deserialize)]
struct QueueStatusForm {
    status: QueueStatus,
}

async fn update_queue_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<QueueStatusForm>,
) -> Result<HttpResponse> {
    let entry = queue::update_status(&state, &path.into_inner(), form.status).await?;
    Ok(HttpResponse::Ok().json(entry))
}

#[derive(Deserialize)]
struct EmployeeStatusForm {
    status: EmployeeStatus,
}

async fn set_my_status(
    state: web::Data<AppState>,
    auth: web::ReqData<AuthUser>,
    form: web::Json<EmployeeStatusForm>,
) -> Result<HttpResponse> {
    let employee = db::fetch_employee_for_user(&state.db, &auth.id).await?;
    queue::set_employee_status(&state.db, &employee.id, form.status).await?;
    db::log_activity(
        &state.db,
        "employee_status",
        &format!("{} set their status to {:?}.", employee.display_name, form.status),
        Some(&employee.business_id),
        Some(&employee.id),
    )
    .await;
    crate::broadcast::publish(&state, &employee.business_id).await;

    let updated = db::fetch_employee(&state.db, &employee.id).await?;
    Ok(HttpResponse::Ok().json(updated))
}
