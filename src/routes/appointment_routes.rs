// src/routes/appointment_routes.rs

use axum::{
    body::Bytes,
    extract::State,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::ApiError,
    extract::{ApiJson, ApiPath, ApiQuery},
    middleware::auth_context::AuthContext,
    models::{param_id_sql, param_type, ApiOk, AppState, AppointmentStatus, Role},
    pagination::{PageRequest, Paginated},
    routes::user_routes::fetch_active_user_with_role,
    scheduling::{
        build_calendar, ensure_time_order, is_terminal, overlaps, parse_date, parse_time,
        required_text, resolve_participants, transition, transition_to, CalendarDay, DateRange,
        Participants, StatusAction,
    },
};

pub fn router() -> Router<AppState> {
    // static segments first so they win over `{cita_id}`
    Router::new()
        .route("/citas", get(list_appointments).post(create_appointment))
        .route("/citas/paciente", get(list_my_appointments))
        .route("/citas/semana", get(get_week))
        .route("/citas/dia", get(get_day))
        .route("/citas/paciente/{cita_id}", patch(patch_own_appointment))
        .route("/citas/paciente/{cita_id}/cancelar", post(cancel_own_appointment))
        .route(
            "/citas/{cita_id}",
            get(get_appointment).patch(patch_appointment),
        )
        .route("/citas/{cita_id}/cancelar", post(cancel_appointment))
        .route("/citas/{cita_id}/confirmar", post(confirm_appointment))
        .route("/citas/{cita_id}/completar", post(complete_appointment))
}

/* ============================================================
   Rows
   ============================================================ */

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AppointmentRow {
    pub id: Uuid,
    pub paciente_id: Uuid,
    pub paciente_nombre: String,
    pub doctor_id: Uuid,
    pub doctor_nombre: String,
    pub auxiliar_id: Option<Uuid>,
    pub fecha: NaiveDate,
    pub hora_inicio: NaiveTime,
    pub hora_fin: NaiveTime,
    pub motivo: String,
    pub observaciones: String,
    #[sqlx(try_from = "String")]
    pub estado: AppointmentStatus,
    pub tratamiento_id: Option<Uuid>,
    pub tratamiento_nombre: Option<String>,
    pub valor: i64,
    pub motivo_cancelacion: Option<String>,
    pub creado_por: Uuid,
    pub creado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

const APPOINTMENT_SELECT: &str = r#"
    SELECT c.id,
           c.paciente_id, (pu.nombres || ' ' || pu.apellidos) AS paciente_nombre,
           c.doctor_id, (du.nombres || ' ' || du.apellidos) AS doctor_nombre,
           c.auxiliar_id, c.fecha, c.hora_inicio, c.hora_fin, c.motivo, c.observaciones,
           e.codigo AS estado,
           c.tratamiento_id, t.nombre AS tratamiento_nombre,
           c.valor, c.motivo_cancelacion, c.creado_por, c.creado_en, c.actualizado_en
    FROM citas c
    JOIN usuarios pu ON pu.id = c.paciente_id
    JOIN usuarios du ON du.id = c.doctor_id
    JOIN parametros e ON e.id = c.estado_id
    LEFT JOIN tratamientos t ON t.id = c.tratamiento_id
"#;

const ORDER_CHRONOLOGICAL: &str = " ORDER BY c.fecha ASC, c.hora_inicio ASC, c.id ASC ";

async fn fetch_appointment(state: &AppState, cita_id: Uuid) -> Result<AppointmentRow, ApiError> {
    sqlx::query_as::<_, AppointmentRow>(&format!("{APPOINTMENT_SELECT} WHERE c.id = $1"))
        .bind(cita_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))
}

/* ============================================================
   Visibility
   ============================================================ */

/// Filters a caller is allowed to apply. Patients are pinned to themselves,
/// doctors to their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct ListScope {
    paciente_id: Option<Uuid>,
    doctor_id: Option<Uuid>,
}

fn list_scope(
    auth: &AuthContext,
    paciente_id: Option<Uuid>,
    doctor_id: Option<Uuid>,
) -> Result<ListScope, ApiError> {
    match auth.role {
        Role::Patient => {
            if paciente_id.is_some_and(|p| p != auth.user_id) {
                return Err(ApiError::forbidden(
                    "Patients can only view their own appointments",
                ));
            }
            Ok(ListScope {
                paciente_id: Some(auth.user_id),
                doctor_id,
            })
        }
        Role::Doctor => {
            if doctor_id.is_some_and(|d| d != auth.user_id) {
                return Err(ApiError::forbidden("Doctor can only view their own schedule"));
            }
            Ok(ListScope {
                paciente_id,
                doctor_id: Some(auth.user_id),
            })
        }
        Role::Auxiliary | Role::Admin => Ok(ListScope {
            paciente_id,
            doctor_id,
        }),
    }
}

fn can_view(auth: &AuthContext, row: &AppointmentRow) -> bool {
    match auth.role {
        Role::Patient => row.paciente_id == auth.user_id,
        Role::Doctor => row.doctor_id == auth.user_id,
        Role::Auxiliary | Role::Admin => true,
    }
}

/// Hidden appointments look missing, not forbidden.
fn ensure_visible(auth: &AuthContext, row: &AppointmentRow) -> Result<(), ApiError> {
    if can_view(auth, row) {
        Ok(())
    } else {
        Err(ApiError::not_found("appointment"))
    }
}

fn ensure_patient(auth: &AuthContext) -> Result<(), ApiError> {
    if auth.role == Role::Patient {
        Ok(())
    } else {
        Err(ApiError::forbidden("This route is for patients"))
    }
}

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: ListScope) {
    if let Some(p) = scope.paciente_id {
        qb.push(" AND c.paciente_id = ");
        qb.push_bind(p);
    }
    if let Some(d) = scope.doctor_id {
        qb.push(" AND c.doctor_id = ");
        qb.push_bind(d);
    }
}

fn push_range(qb: &mut QueryBuilder<'_, Postgres>, range: DateRange) {
    qb.push(" AND c.fecha >= ");
    qb.push_bind(range.start);
    qb.push(" AND c.fecha <= ");
    qb.push_bind(range.end);
}

/* ============================================================
   Double booking
   ============================================================ */

/// Only checked when the clinic turns `ENFORCE_DOCTOR_OVERLAP` on.
async fn ensure_doctor_free(
    state: &AppState,
    doctor_id: Uuid,
    fecha: NaiveDate,
    slot: (NaiveTime, NaiveTime),
    except: Option<Uuid>,
) -> Result<(), ApiError> {
    if !state.enforce_doctor_overlap {
        return Ok(());
    }

    let taken: Vec<(Uuid, NaiveTime, NaiveTime)> = sqlx::query_as(&format!(
        r#"
        SELECT c.id, c.hora_inicio, c.hora_fin
        FROM citas c
        WHERE c.doctor_id = $1
          AND c.fecha = $2
          AND c.estado_id IN ({pending}, {confirmed})
        "#,
        pending = param_id_sql("$3", "$4"),
        confirmed = param_id_sql("$3", "$5"),
    ))
    .bind(doctor_id)
    .bind(fecha)
    .bind(param_type::APPOINTMENT_STATUS)
    .bind(AppointmentStatus::Pending.code())
    .bind(AppointmentStatus::Confirmed.code())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let clash = taken
        .iter()
        .filter(|(id, _, _)| Some(*id) != except)
        .any(|(_, s, e)| overlaps(slot, (*s, *e)));

    if clash {
        return Err(ApiError::Conflict(
            "SCHEDULE_CONFLICT",
            "The doctor already has an appointment in that time slot".into(),
        ));
    }
    Ok(())
}

/* ============================================================
   POST /citas
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub paciente_id: Option<Uuid>,
    pub doctor_id: Option<Uuid>,
    pub auxiliar_id: Option<Uuid>,
    pub fecha: Option<String>,
    pub hora_inicio: Option<String>,
    pub hora_fin: Option<String>,
    pub motivo: Option<String>,
    pub observaciones: Option<String>,
    pub tratamiento_id: Option<Uuid>,
}

#[derive(Debug, PartialEq)]
struct NewAppointment {
    who: Participants,
    fecha: NaiveDate,
    hora_inicio: NaiveTime,
    hora_fin: NaiveTime,
    motivo: String,
    observaciones: String,
    tratamiento_id: Option<Uuid>,
}

fn validate_new_appointment(
    auth: &AuthContext,
    req: CreateAppointmentRequest,
) -> Result<NewAppointment, ApiError> {
    let fecha = parse_date("fecha", &required_text("fecha", req.fecha.as_deref())?)?;
    let hora_inicio = parse_time(
        "hora_inicio",
        &required_text("hora_inicio", req.hora_inicio.as_deref())?,
    )?;
    let hora_fin = parse_time("hora_fin", &required_text("hora_fin", req.hora_fin.as_deref())?)?;
    ensure_time_order(hora_inicio, hora_fin)?;

    let motivo = required_text("motivo", req.motivo.as_deref())?;
    let observaciones = required_text("observaciones", req.observaciones.as_deref())?;

    let who = resolve_participants(
        auth.user_id,
        auth.role,
        req.paciente_id,
        req.doctor_id,
        req.auxiliar_id,
    )?;

    Ok(NewAppointment {
        who,
        fecha,
        hora_inicio,
        hora_fin,
        motivo,
        observaciones,
        tratamiento_id: req.tratamiento_id,
    })
}

pub async fn create_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<CreateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    let new = validate_new_appointment(&auth, req)?;

    fetch_active_user_with_role(&state, new.who.paciente_id, Role::Patient).await?;
    fetch_active_user_with_role(&state, new.who.doctor_id, Role::Doctor).await?;
    if let Some(aux) = new.who.auxiliar_id {
        fetch_active_user_with_role(&state, aux, Role::Auxiliary).await?;
    }

    let valor: i64 = match new.tratamiento_id {
        Some(tid) => sqlx::query_scalar(
            "SELECT precio_estimado FROM tratamientos WHERE id = $1 AND eliminado = -1",
        )
        .bind(tid)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("treatment"))?,
        None => 0,
    };

    ensure_doctor_free(
        &state,
        new.who.doctor_id,
        new.fecha,
        (new.hora_inicio, new.hora_fin),
        None,
    )
    .await?;

    let cita_id: Uuid = sqlx::query_scalar(&format!(
        r#"
        INSERT INTO citas (
            paciente_id, doctor_id, auxiliar_id, fecha, hora_inicio, hora_fin,
            motivo, observaciones, estado_id, tratamiento_id, valor, creado_por
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, {estado}, $11, $12, $13)
        RETURNING id
        "#,
        estado = param_id_sql("$9", "$10"),
    ))
    .bind(new.who.paciente_id)
    .bind(new.who.doctor_id)
    .bind(new.who.auxiliar_id)
    .bind(new.fecha)
    .bind(new.hora_inicio)
    .bind(new.hora_fin)
    .bind(&new.motivo)
    .bind(&new.observaciones)
    .bind(param_type::APPOINTMENT_STATUS)
    .bind(AppointmentStatus::Pending.code())
    .bind(new.tratamiento_id)
    .bind(valor)
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(
        cita_id = %cita_id,
        paciente_id = %new.who.paciente_id,
        doctor_id = %new.who.doctor_id,
        fecha = %new.fecha,
        creado_por = %auth.user_id,
        "appointment booked"
    );

    let row = fetch_appointment(&state, cita_id).await?;
    Ok(Json(ApiOk::with_message("Appointment created", row)))
}

/* ============================================================
   GET /citas
   ============================================================ */

#[derive(Debug, Default, Deserialize)]
pub struct AppointmentListQuery {
    pub fecha_inicio: Option<String>,
    pub fecha_fin: Option<String>,
    pub doctor_id: Option<Uuid>,
    pub paciente_id: Option<Uuid>,
    pub estado: Option<String>,
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
}

#[derive(Debug, PartialEq)]
struct ListFilters {
    range: Option<DateRange>,
    scope: ListScope,
    estado: Option<AppointmentStatus>,
    page: PageRequest,
}

fn list_filters(auth: &AuthContext, q: &AppointmentListQuery) -> Result<ListFilters, ApiError> {
    let range = match (q.fecha_inicio.as_deref(), q.fecha_fin.as_deref()) {
        (Some(s), Some(e)) => Some(DateRange::parse(s, e)?),
        (None, None) => None,
        _ => {
            return Err(ApiError::validation(
                "fecha_inicio and fecha_fin must be given together",
            ))
        }
    };

    let estado = match q.estado.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(code) => Some(AppointmentStatus::from_code(code).ok_or_else(|| {
            ApiError::validation(format!("unknown estado: {code}"))
        })?),
        None => None,
    };

    Ok(ListFilters {
        range,
        scope: list_scope(auth, q.paciente_id, q.doctor_id)?,
        estado,
        page: PageRequest::new(q.pagina, q.cantidad_por_pagina),
    })
}

fn push_list_filters(qb: &mut QueryBuilder<'_, Postgres>, f: &ListFilters) {
    qb.push(" WHERE 1 = 1 ");
    push_scope(qb, f.scope);
    if let Some(r) = f.range {
        push_range(qb, r);
    }
    if let Some(estado) = f.estado {
        qb.push(" AND e.codigo = ");
        qb.push_bind(estado.code());
    }
}

async fn run_list(
    state: &AppState,
    f: ListFilters,
) -> Result<Paginated<AppointmentRow>, ApiError> {
    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT COUNT(*) FROM citas c JOIN parametros e ON e.id = c.estado_id",
    );
    push_list_filters(&mut count_qb, &f);
    let total: i64 = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(APPOINTMENT_SELECT);
    push_list_filters(&mut qb, &f);
    qb.push(ORDER_CHRONOLOGICAL);
    qb.push(" LIMIT ");
    qb.push_bind(f.page.limit());
    qb.push(" OFFSET ");
    qb.push_bind(f.page.offset());

    let rows: Vec<AppointmentRow> = qb
        .build_query_as::<AppointmentRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Paginated::new(rows, total, f.page))
}

pub async fn list_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<AppointmentListQuery>,
) -> Result<Json<ApiOk<Paginated<AppointmentRow>>>, ApiError> {
    let f = list_filters(&auth, &q)?;
    Ok(Json(ApiOk::new(run_list(&state, f).await?)))
}

pub async fn list_my_appointments(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<AppointmentListQuery>,
) -> Result<Json<ApiOk<Paginated<AppointmentRow>>>, ApiError> {
    ensure_patient(&auth)?;
    let f = list_filters(&auth, &q)?;
    Ok(Json(ApiOk::new(run_list(&state, f).await?)))
}

/* ============================================================
   Calendar views
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct WeekQuery {
    pub inicio: Option<String>,
    pub dias: Option<i64>,
    pub doctor_id: Option<Uuid>,
    pub paciente_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    pub fecha: Option<String>,
    pub doctor_id: Option<Uuid>,
    pub paciente_id: Option<Uuid>,
}

async fn calendar(
    state: &AppState,
    range: DateRange,
    scope: ListScope,
) -> Result<Vec<CalendarDay<AppointmentRow>>, ApiError> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(APPOINTMENT_SELECT);
    qb.push(" WHERE 1 = 1 ");
    push_scope(&mut qb, scope);
    push_range(&mut qb, range);
    qb.push(ORDER_CHRONOLOGICAL);

    let rows: Vec<AppointmentRow> = qb
        .build_query_as::<AppointmentRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(build_calendar(range, rows, |r| r.fecha))
}

pub async fn get_week(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<WeekQuery>,
) -> Result<Json<ApiOk<Vec<CalendarDay<AppointmentRow>>>>, ApiError> {
    let start = parse_date("inicio", &required_text("inicio", q.inicio.as_deref())?)?;
    let range = DateRange::calendar(start, q.dias.unwrap_or(7))?;
    let scope = list_scope(&auth, q.paciente_id, q.doctor_id)?;
    Ok(Json(ApiOk::new(calendar(&state, range, scope).await?)))
}

pub async fn get_day(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<DayQuery>,
) -> Result<Json<ApiOk<Vec<CalendarDay<AppointmentRow>>>>, ApiError> {
    let day = parse_date("fecha", &required_text("fecha", q.fecha.as_deref())?)?;
    let range = DateRange::calendar(day, 1)?;
    let scope = list_scope(&auth, q.paciente_id, q.doctor_id)?;
    Ok(Json(ApiOk::new(calendar(&state, range, scope).await?)))
}

/* ============================================================
   GET /citas/{id}
   ============================================================ */

pub async fn get_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    let row = fetch_appointment(&state, cita_id).await?;
    ensure_visible(&auth, &row)?;
    Ok(Json(ApiOk::new(row)))
}

/* ============================================================
   Updates
   ============================================================ */

#[derive(Debug, Default, Deserialize)]
pub struct SchedulePatch {
    pub fecha: Option<String>,
    pub hora_inicio: Option<String>,
    pub hora_fin: Option<String>,
    pub motivo: Option<String>,
    pub observaciones: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAppointmentRequest {
    #[serde(flatten)]
    pub schedule: SchedulePatch,
    pub estado: Option<AppointmentStatus>,
    pub motivo_cancelacion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Schedule {
    fecha: NaiveDate,
    hora_inicio: NaiveTime,
    hora_fin: NaiveTime,
    motivo: String,
    observaciones: String,
}

impl Schedule {
    fn of(row: &AppointmentRow) -> Self {
        Schedule {
            fecha: row.fecha,
            hora_inicio: row.hora_inicio,
            hora_fin: row.hora_fin,
            motivo: row.motivo.clone(),
            observaciones: row.observaciones.clone(),
        }
    }
}

/// Applies a partial schedule over the stored one and re-checks the result.
fn merge_schedule(current: Schedule, patch: &SchedulePatch) -> Result<Schedule, ApiError> {
    let fecha = match patch.fecha.as_deref() {
        Some(raw) => parse_date("fecha", raw)?,
        None => current.fecha,
    };
    let hora_inicio = match patch.hora_inicio.as_deref() {
        Some(raw) => parse_time("hora_inicio", raw)?,
        None => current.hora_inicio,
    };
    let hora_fin = match patch.hora_fin.as_deref() {
        Some(raw) => parse_time("hora_fin", raw)?,
        None => current.hora_fin,
    };
    ensure_time_order(hora_inicio, hora_fin)?;

    let motivo = match patch.motivo.as_deref() {
        Some(raw) => required_text("motivo", Some(raw))?,
        None => current.motivo,
    };
    let observaciones = match patch.observaciones.as_deref() {
        Some(raw) => required_text("observaciones", Some(raw))?,
        None => current.observaciones,
    };

    Ok(Schedule {
        fecha,
        hora_inicio,
        hora_fin,
        motivo,
        observaciones,
    })
}

fn clean_reason(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Payments are immutable, so an appointment that carries one cannot leave the ledger.
fn ensure_cancellable(pagado: i64) -> Result<(), ApiError> {
    if pagado > 0 {
        return Err(ApiError::Conflict(
            "APPOINTMENT_PAID",
            "appointment has registered payments and cannot be cancelled".into(),
        ));
    }
    Ok(())
}

/// Completed and cancelled appointments keep the schedule they ended with.
fn ensure_schedule_editable(
    current: AppointmentStatus,
    before: &Schedule,
    after: &Schedule,
) -> Result<(), ApiError> {
    if before != after && is_terminal(current) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("a {current} appointment can no longer be rescheduled"),
        ));
    }
    Ok(())
}

/// Writes schedule and status in one statement under a row lock. The status
/// guard makes a concurrent change surface as INVALID_TRANSITION instead of
/// being overwritten.
async fn write_appointment(
    state: &AppState,
    row: &AppointmentRow,
    schedule: &Schedule,
    next: AppointmentStatus,
    motivo_cancelacion: Option<String>,
) -> Result<AppointmentRow, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // Serializes with register_payment, which locks the same rows.
    sqlx::query("SELECT id FROM citas WHERE id = $1 FOR UPDATE")
        .bind(row.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(ApiError::db)?
        .ok_or_else(|| ApiError::not_found("appointment"))?;

    if next == AppointmentStatus::Cancelled && row.estado != AppointmentStatus::Cancelled {
        let pagado: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(monto_aplicado), 0)::BIGINT FROM pagos_citas WHERE cita_id = $1",
        )
        .bind(row.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(ApiError::db)?;
        ensure_cancellable(pagado)?;
    }

    let res = sqlx::query(&format!(
        r#"
        UPDATE citas
        SET fecha = $2,
            hora_inicio = $3,
            hora_fin = $4,
            motivo = $5,
            observaciones = $6,
            estado_id = {next},
            motivo_cancelacion = COALESCE($9, motivo_cancelacion),
            actualizado_en = now()
        WHERE id = $1
          AND estado_id = {current}
        "#,
        next = param_id_sql("$7", "$8"),
        current = param_id_sql("$7", "$10"),
    ))
    .bind(row.id)
    .bind(schedule.fecha)
    .bind(schedule.hora_inicio)
    .bind(schedule.hora_fin)
    .bind(&schedule.motivo)
    .bind(&schedule.observaciones)
    .bind(param_type::APPOINTMENT_STATUS)
    .bind(next.code())
    .bind(motivo_cancelacion)
    .bind(row.estado.code())
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            "appointment changed while updating, reload and retry".into(),
        ));
    }

    tx.commit().await.map_err(ApiError::db)?;

    if next != row.estado {
        tracing::info!(cita_id = %row.id, from = %row.estado, to = %next, "appointment status changed");
    }

    fetch_appointment(state, row.id).await
}

async fn reschedule(
    state: &AppState,
    row: &AppointmentRow,
    schedule: &Schedule,
    next: AppointmentStatus,
) -> Result<(), ApiError> {
    let moved = schedule.fecha != row.fecha
        || schedule.hora_inicio != row.hora_inicio
        || schedule.hora_fin != row.hora_fin;
    if moved && !is_terminal(next) {
        ensure_doctor_free(
            state,
            row.doctor_id,
            schedule.fecha,
            (schedule.hora_inicio, schedule.hora_fin),
            Some(row.id),
        )
        .await?;
    }
    Ok(())
}

pub async fn patch_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateAppointmentRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    auth.ensure_staff()?;

    let row = fetch_appointment(&state, cita_id).await?;
    ensure_visible(&auth, &row)?;

    let next = match req.estado {
        Some(target) => transition_to(row.estado, target, auth.role)?,
        None => row.estado,
    };
    let current = Schedule::of(&row);
    let schedule = merge_schedule(current.clone(), &req.schedule)?;
    ensure_schedule_editable(row.estado, &current, &schedule)?;
    reschedule(&state, &row, &schedule, next).await?;

    let reason = if next == AppointmentStatus::Cancelled {
        clean_reason(req.motivo_cancelacion.as_deref())
    } else {
        None
    };

    let updated = write_appointment(&state, &row, &schedule, next, reason).await?;
    Ok(Json(ApiOk::with_message("Appointment updated", updated)))
}

pub async fn patch_own_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SchedulePatch>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_patient(&auth)?;

    let row = fetch_appointment(&state, cita_id).await?;
    ensure_visible(&auth, &row)?;
    if is_terminal(row.estado) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("a {} appointment can no longer be changed", row.estado),
        ));
    }

    let schedule = merge_schedule(Schedule::of(&row), &req)?;
    reschedule(&state, &row, &schedule, row.estado).await?;

    let updated = write_appointment(&state, &row, &schedule, row.estado, None).await?;
    Ok(Json(ApiOk::with_message("Appointment updated", updated)))
}

/* ============================================================
   Status actions
   ============================================================ */

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub motivo_cancelacion: Option<String>,
}

async fn apply_action(
    state: &AppState,
    auth: &AuthContext,
    cita_id: Uuid,
    action: StatusAction,
    reason: Option<String>,
) -> Result<AppointmentRow, ApiError> {
    let row = fetch_appointment(state, cita_id).await?;
    ensure_visible(auth, &row)?;

    let next = transition(row.estado, action, auth.role)?;
    let schedule = Schedule::of(&row);
    write_appointment(state, &row, &schedule, next, reason).await
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
    body: Bytes,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    auth.ensure_staff()?;
    // the body is optional here
    let req: CancelRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::validation(format!("invalid body: {e}")))?
    };
    let reason = clean_reason(req.motivo_cancelacion.as_deref());
    let row = apply_action(&state, &auth, cita_id, StatusAction::Cancel, reason).await?;
    Ok(Json(ApiOk::with_message("Appointment cancelled", row)))
}

pub async fn cancel_own_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<CancelRequest>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    ensure_patient(&auth)?;
    let reason = required_text("motivo_cancelacion", req.motivo_cancelacion.as_deref())?;
    let row = apply_action(&state, &auth, cita_id, StatusAction::Cancel, Some(reason)).await?;
    Ok(Json(ApiOk::with_message("Appointment cancelled", row)))
}

pub async fn confirm_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    auth.ensure_staff()?;
    let row = apply_action(&state, &auth, cita_id, StatusAction::Confirm, None).await?;
    Ok(Json(ApiOk::with_message("Appointment confirmed", row)))
}

pub async fn complete_appointment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(cita_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<AppointmentRow>>, ApiError> {
    auth.ensure_staff()?;
    let row = apply_action(&state, &auth, cita_id, StatusAction::Complete, None).await?;
    Ok(Json(ApiOk::with_message("Appointment completed", row)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(role: Role) -> AuthContext {
        AuthContext {
            user_id: Uuid::new_v4(),
            role,
        }
    }

    fn row_for(paciente_id: Uuid, doctor_id: Uuid) -> AppointmentRow {
        AppointmentRow {
            id: Uuid::new_v4(),
            paciente_id,
            paciente_nombre: "Ana Pérez".into(),
            doctor_id,
            doctor_nombre: "Luis Gómez".into(),
            auxiliar_id: None,
            fecha: NaiveDate::from_ymd_opt(2025, 12, 1).unwrap(),
            hora_inicio: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            hora_fin: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            motivo: "Control".into(),
            observaciones: "Ninguna".into(),
            estado: AppointmentStatus::Pending,
            tratamiento_id: None,
            tratamiento_nombre: None,
            valor: 0,
            motivo_cancelacion: None,
            creado_por: paciente_id,
            creado_en: Utc::now(),
            actualizado_en: Utc::now(),
        }
    }

    fn booking(doctor_id: Option<Uuid>) -> CreateAppointmentRequest {
        CreateAppointmentRequest {
            paciente_id: None,
            doctor_id,
            auxiliar_id: None,
            fecha: Some("2025-12-01".into()),
            hora_inicio: Some("09:00".into()),
            hora_fin: Some("10:00".into()),
            motivo: Some("Limpieza".into()),
            observaciones: Some("Primera visita".into()),
            tratamiento_id: None,
        }
    }

    #[test]
    fn patient_booking_resolves_to_self() {
        let me = ctx(Role::Patient);
        let doctor = Uuid::new_v4();
        let new = validate_new_appointment(&me, booking(Some(doctor))).unwrap();
        assert_eq!(new.who.paciente_id, me.user_id);
        assert_eq!(new.who.doctor_id, doctor);
        assert_eq!(new.hora_inicio, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn booking_validation() {
        let me = ctx(Role::Patient);

        let mut req = booking(Some(Uuid::new_v4()));
        req.hora_fin = Some("08:30".into());
        assert_eq!(
            validate_new_appointment(&me, req).unwrap_err().code(),
            "VALIDATION_ERROR"
        );

        let mut req = booking(Some(Uuid::new_v4()));
        req.observaciones = Some("   ".into());
        assert!(validate_new_appointment(&me, req).is_err());

        let mut req = booking(Some(Uuid::new_v4()));
        req.fecha = Some("01/12/2025".into());
        assert!(validate_new_appointment(&me, req).is_err());

        // patient without a doctor
        assert!(validate_new_appointment(&me, booking(None)).is_err());
    }

    #[test]
    fn list_scope_pins_patients_and_doctors() {
        let patient = ctx(Role::Patient);
        let s = list_scope(&patient, None, None).unwrap();
        assert_eq!(s.paciente_id, Some(patient.user_id));
        assert!(list_scope(&patient, Some(Uuid::new_v4()), None).is_err());

        let doctor = ctx(Role::Doctor);
        let s = list_scope(&doctor, None, None).unwrap();
        assert_eq!(s.doctor_id, Some(doctor.user_id));
        assert_eq!(
            list_scope(&doctor, None, Some(Uuid::new_v4())).unwrap_err().code(),
            "FORBIDDEN"
        );

        let aux = ctx(Role::Auxiliary);
        let d = Uuid::new_v4();
        assert_eq!(
            list_scope(&aux, None, Some(d)).unwrap(),
            ListScope {
                paciente_id: None,
                doctor_id: Some(d)
            }
        );
    }

    #[test]
    fn list_filters_validate_before_querying() {
        let admin = ctx(Role::Admin);
        let q = AppointmentListQuery {
            fecha_inicio: Some("2025-12-01".into()),
            fecha_fin: Some("2025-12-01".into()),
            estado: Some("pendiente".into()),
            ..Default::default()
        };
        let f = list_filters(&admin, &q).unwrap();
        assert_eq!(f.estado, Some(AppointmentStatus::Pending));
        assert_eq!(f.range.unwrap().days().count(), 1);

        let q = AppointmentListQuery {
            fecha_inicio: Some("2025-13-01".into()),
            fecha_fin: Some("2025-12-01".into()),
            ..Default::default()
        };
        assert!(list_filters(&admin, &q).is_err());

        let q = AppointmentListQuery {
            fecha_inicio: Some("2025-12-01".into()),
            ..Default::default()
        };
        assert!(list_filters(&admin, &q).is_err());

        let q = AppointmentListQuery {
            estado: Some("perdida".into()),
            ..Default::default()
        };
        assert!(list_filters(&admin, &q).is_err());
    }

    #[test]
    fn visibility_follows_role() {
        let patient = ctx(Role::Patient);
        let doctor = ctx(Role::Doctor);
        let row = row_for(patient.user_id, doctor.user_id);

        assert!(can_view(&patient, &row));
        assert!(can_view(&doctor, &row));
        assert!(can_view(&ctx(Role::Auxiliary), &row));
        assert!(!can_view(&ctx(Role::Patient), &row));
        assert_eq!(
            ensure_visible(&ctx(Role::Doctor), &row).unwrap_err().code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn merge_keeps_untouched_fields_and_rechecks_order() {
        let row = row_for(Uuid::new_v4(), Uuid::new_v4());

        let patch = SchedulePatch {
            hora_fin: Some("11:30".into()),
            ..Default::default()
        };
        let s = merge_schedule(Schedule::of(&row), &patch).unwrap();
        assert_eq!(s.hora_inicio, row.hora_inicio);
        assert_eq!(s.hora_fin, NaiveTime::from_hms_opt(11, 30, 0).unwrap());
        assert_eq!(s.motivo, "Control");

        // moving only the start past the stored end
        let patch = SchedulePatch {
            hora_inicio: Some("10:30".into()),
            ..Default::default()
        };
        assert!(merge_schedule(Schedule::of(&row), &patch).is_err());

        let patch = SchedulePatch {
            motivo: Some("".into()),
            ..Default::default()
        };
        assert!(merge_schedule(Schedule::of(&row), &patch).is_err());
    }

    #[test]
    fn cancel_reason_is_trimmed() {
        assert_eq!(clean_reason(Some("  viaje ")), Some("viaje".into()));
        assert_eq!(clean_reason(Some("   ")), None);
        assert_eq!(clean_reason(None), None);
    }

    #[test]
    fn terminal_appointments_keep_their_schedule() {
        let row = row_for(Uuid::new_v4(), Uuid::new_v4());
        let before = Schedule::of(&row);
        let patch = SchedulePatch {
            fecha: Some("2026-01-15".into()),
            ..Default::default()
        };
        let after = merge_schedule(before.clone(), &patch).unwrap();

        for estado in [AppointmentStatus::Completed, AppointmentStatus::Cancelled] {
            let err = ensure_schedule_editable(estado, &before, &after).unwrap_err();
            assert_eq!(err.code(), "INVALID_TRANSITION");
            assert!(ensure_schedule_editable(estado, &before, &before).is_ok());
        }
        assert!(ensure_schedule_editable(AppointmentStatus::Confirmed, &before, &after).is_ok());
    }

    #[test]
    fn paid_appointments_cannot_be_cancelled() {
        assert!(ensure_cancellable(0).is_ok());
        let err = ensure_cancellable(300_000).unwrap_err();
        assert_eq!(err.code(), "APPOINTMENT_PAID");
        assert_eq!(err.status(), axum::http::StatusCode::CONFLICT);
    }
}
