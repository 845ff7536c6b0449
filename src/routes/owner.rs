use actix_web::{web, HttpResponse};
use actix_web_httpauth::middleware::HttpAuthentication;
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;

use crate::auth::{new_id, owner_validator};
use crate::db;
use crate::error::{Error, Result};
use crate::lifecycle::{self, UpdateAppointment};
use crate::models::{EmployeeStatus, OverrideKind, RepeatFrequency};
use crate::queue;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/owner")
            .wrap(HttpAuthentication::basic(owner_validator))
            .service(web::resource("/businesses").route(web::post().to(create_business)))
            .service(
                web::resource("/businesses/{id}/queue").route(web::get().to(business_queue)),
            )
            .service(
                web::resource("/businesses/{id}/queue/reorder")
                    .route(web::post().to(reorder_queue)),
            )
            .service(
                web::resource("/businesses/{id}/queue/{entry_id}/employee")
                    .route(web::post().to(reassign_entry)),
            )
            .service(
                web::resource("/businesses/{id}/employees").route(web::post().to(create_employee)),
            )
            .service(
                web::resource("/businesses/{id}/services").route(web::post().to(create_service)),
            )
            .service(
                web::resource("/businesses/{id}/overrides")
                    .route(web::get().to(list_overrides))
                    .route(web::post().to(create_override)),
            )
            .service(web::resource("/overrides/{id}").route(web::delete().to(delete_override)))
            .service(
                web::resource("/employees/{id}/services").route(web::post().to(grant_service)),
            )
            .service(
                web::resource("/employees/{id}/schedule").route(web::get().to(employee_schedule)),
            )
            .service(
                web::resource("/employees/{id}/schedule/{day}")
                    .route(web::put().to(upsert_schedule)),
            )
            .service(
                web::resource("/employees/{id}/status").route(web::post().to(set_employee_status)),
            )
            .service(
                web::resource("/appointments/{id}").route(web::post().to(edit_appointment)),
            ),
    );
}

#[derive(Deserialize)]
struct BusinessForm {
    name: String,
    address: String,
    timezone: Option<String>,
    average_wait_time: Option<f64>,
    is_open_24_hours: Option<bool>,
}

async fn create_business(
    state: web::Data<AppState>,
    auth: web::ReqData<crate::auth::AuthUser>,
    form: web::Json<BusinessForm>,
) -> Result<HttpResponse> {
    let form = form.into_inner();
    if form.name.trim().is_empty() {
        return Err(Error::validation("business name is required"));
    }
    let timezone = form.timezone.unwrap_or_else(|| "America/Los_Angeles".to_string());
    if timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(Error::validation(format!("unknown timezone {timezone}")));
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO businesses (id, name, address, timezone, average_wait_time, is_open_24_hours,
                                 owner_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(form.name.trim())
    .bind(form.address.trim())
    .bind(&timezone)
    .bind(form.average_wait_time.unwrap_or(20.0))
    .bind(form.is_open_24_hours.unwrap_or(false))
    .bind(&auth.id)
    .bind(Utc::now())
    .execute(&state.db)
    .await?;

    let business = db::fetch_business(&state.db, &id).await?;
    Ok(HttpResponse::Created().json(business))
}

async fn business_queue(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    db::fetch_business(&state.db, &business_id).await?;
    let active = db::find_active_queue(&state.db, &business_id).await?;
    Ok(HttpResponse::Ok().json(active))
}

#[derive(Deserialize)]
struct ReorderForm {
    entry_id: String,
    new_position: i64,
}

async fn reorder_queue(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<ReorderForm>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    let reordered =
        queue::reorder(&state, &business_id, &form.entry_id, form.new_position).await?;
    Ok(HttpResponse::Ok().json(reordered))
}

#[derive(Deserialize)]
struct ReassignForm {
    employee_id: Option<String>,
}

async fn reassign_entry(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    form: web::Json<ReassignForm>,
) -> Result<HttpResponse> {
    let (business_id, entry_id) = path.into_inner();
    let entry = db::fetch_queue_entry(&state.db, &entry_id).await?;
    if entry.business_id != business_id {
        return Err(Error::NotFound("queue entry"));
    }
    let updated = queue::assign_employee(&state, &entry_id, form.into_inner().employee_id).await?;
    Ok(HttpResponse::Ok().json(updated))
}

#[derive(Deserialize)]
struct EmployeeForm {
    display_name: String,
}

async fn create_employee(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<EmployeeForm>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    db::fetch_business(&state.db, &business_id).await?;
    if form.display_name.trim().is_empty() {
        return Err(Error::validation("display name is required"));
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO employees (id, business_id, display_name, status) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&business_id)
    .bind(form.display_name.trim())
    .bind(EmployeeStatus::Available)
    .execute(&state.db)
    .await?;
    db::seed_default_schedules(&state.db, &id).await?;

    db::log_activity(
        &state.db,
        "employee_added",
        &format!("{} joined the team.", form.display_name.trim()),
        Some(&business_id),
        Some(&id),
    )
    .await;

    let employee = db::fetch_employee(&state.db, &id).await?;
    Ok(HttpResponse::Created().json(employee))
}

#[derive(Deserialize)]
struct ServiceForm {
    name: String,
    duration_minutes: i64,
    price: f64,
}

async fn create_service(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<ServiceForm>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    db::fetch_business(&state.db, &business_id).await?;
    if form.duration_minutes <= 0 {
        return Err(Error::validation("service duration must be positive"));
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO services (id, business_id, name, duration_minutes, price, active)
         VALUES (?, ?, ?, ?, ?, 1)",
    )
    .bind(&id)
    .bind(&business_id)
    .bind(form.name.trim())
    .bind(form.duration_minutes)
    .bind(form.price)
    .execute(&state.db)
    .await?;

    let service = db::fetch_service(&state.db, &id).await?;
    Ok(HttpResponse::Created().json(service))
}

#[derive(Deserialize)]
struct GrantServiceForm {
    service_id: String,
}

async fn grant_service(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<GrantServiceForm>,
) -> Result<HttpResponse> {
    let employee_id = path.into_inner();
    let employee = db::fetch_employee(&state.db, &employee_id).await?;
    let service = db::fetch_service(&state.db, &form.service_id).await?;
    if service.business_id != employee.business_id {
        return Err(Error::validation("service belongs to a different business"));
    }

    sqlx::query(
        "INSERT INTO employee_services (employee_id, service_id) VALUES (?, ?)
         ON CONFLICT DO NOTHING",
    )
    .bind(&employee_id)
    .bind(&service.id)
    .execute(&state.db)
    .await?;

    Ok(HttpResponse::NoContent().finish())
}

async fn employee_schedule(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let employee_id = path.into_inner();
    db::fetch_employee(&state.db, &employee_id).await?;
    let schedules = db::find_work_schedules(&state.db, &employee_id).await?;
    Ok(HttpResponse::Ok().json(schedules))
}

#[derive(Deserialize)]
struct ScheduleForm {
    start_time: Option<String>,
    end_time: Option<String>,
    lunch_start: Option<String>,
    lunch_end: Option<String>,
    is_working: bool,
}

fn parse_time(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .map_err(|_| Error::validation(format!("invalid time of day: {value}")))
}

/// Upsert the weekly template entry for one day. At most one entry per
/// (employee, day) ever exists.
async fn upsert_schedule(
    state: web::Data<AppState>,
    path: web::Path<(String, i64)>,
    form: web::Json<ScheduleForm>,
) -> Result<HttpResponse> {
    let (employee_id, day) = path.into_inner();
    if !(0..=6).contains(&day) {
        return Err(Error::validation("day of week must be 0 (Sunday) through 6"));
    }
    db::fetch_employee(&state.db, &employee_id).await?;

    let form = form.into_inner();
    let start_time = form.start_time.as_deref().map(parse_time).transpose()?;
    let end_time = form.end_time.as_deref().map(parse_time).transpose()?;
    let lunch_start = form.lunch_start.as_deref().map(parse_time).transpose()?;
    let lunch_end = form.lunch_end.as_deref().map(parse_time).transpose()?;
    if form.is_working && (start_time.is_none() || end_time.is_none()) {
        return Err(Error::validation("working days need start and end times"));
    }

    sqlx::query(
        "INSERT INTO work_schedules
         (id, employee_id, day_of_week, start_time, end_time, lunch_start, lunch_end, is_working)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (employee_id, day_of_week) DO UPDATE SET
           start_time = excluded.start_time,
           end_time = excluded.end_time,
           lunch_start = excluded.lunch_start,
           lunch_end = excluded.lunch_end,
           is_working = excluded.is_working",
    )
    .bind(new_id())
    .bind(&employee_id)
    .bind(day)
    .bind(start_time)
    .bind(end_time)
    .bind(lunch_start)
    .bind(lunch_end)
    .bind(form.is_working)
    .execute(&state.db)
    .await?;

    let schedules = db::find_work_schedules(&state.db, &employee_id).await?;
    Ok(HttpResponse::Ok().json(schedules))
}

async fn list_overrides(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    db::fetch_business(&state.db, &business_id).await?;
    let overrides = sqlx::query_as::<_, crate::models::OverrideRow>(
        "SELECT id, business_id, employee_id, starts_at, ends_at, repeat, kind, reason
         FROM schedule_overrides WHERE business_id = ? ORDER BY starts_at",
    )
    .bind(&business_id)
    .fetch_all(&state.db)
    .await?;
    Ok(HttpResponse::Ok().json(overrides))
}

#[derive(Deserialize)]
struct OverrideForm {
    employee_id: Option<String>,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    repeat: Option<RepeatFrequency>,
    kind: OverrideKind,
    reason: Option<String>,
}

async fn create_override(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<OverrideForm>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();
    db::fetch_business(&state.db, &business_id).await?;
    let form = form.into_inner();
    if form.ends_at <= form.starts_at {
        return Err(Error::validation("override end must be after its start"));
    }
    if let Some(employee_id) = form.employee_id.as_deref() {
        let employee = db::fetch_employee(&state.db, employee_id).await?;
        if employee.business_id != business_id {
            return Err(Error::validation("employee belongs to a different business"));
        }
    }

    let id = new_id();
    sqlx::query(
        "INSERT INTO schedule_overrides
         (id, business_id, employee_id, starts_at, ends_at, repeat, kind, reason)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(&business_id)
    .bind(&form.employee_id)
    .bind(form.starts_at)
    .bind(form.ends_at)
    .bind(form.repeat.unwrap_or(RepeatFrequency::None))
    .bind(form.kind)
    .bind(&form.reason)
    .execute(&state.db)
    .await?;

    db::log_activity(
        &state.db,
        "override_created",
        &format!("Schedule override added ({:?}).", form.kind),
        Some(&business_id),
        Some(&id),
    )
    .await;

    Ok(HttpResponse::Created().json(serde_json::json!({ "id": id })))
}

async fn delete_override(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let id = path.into_inner();
    let affected = sqlx::query("DELETE FROM schedule_overrides WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if affected == 0 {
        return Err(Error::NotFound("schedule override"));
    }
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Deserialize)]
struct EmployeeStatusForm {
    status: EmployeeStatus,
}

async fn set_employee_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<EmployeeStatusForm>,
) -> Result<HttpResponse> {
    let employee_id = path.into_inner();
    let employee = db::fetch_employee(&state.db, &employee_id).await?;
    queue::set_employee_status(&state.db, &employee_id, form.status).await?;
    crate::broadcast::publish(&state, &employee.business_id).await;
    let updated = db::fetch_employee(&state.db, &employee_id).await?;
    Ok(HttpResponse::Ok().json(updated))
}

async fn edit_appointment(
    state: web::Data<AppState>,
    path: web::Path<String>,
    form: web::Json<UpdateAppointment>,
) -> Result<HttpResponse> {
    let updated = lifecycle::update(&state, &path.into_inner(), form.into_inner()).await?;
    Ok(HttpResponse::Ok().json(updated))
}
