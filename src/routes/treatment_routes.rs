// src/routes/treatment_routes.rs

use std::collections::HashSet;

use axum::{
    extract::State,
    routing::{get, patch},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::ApiError,
    extract::{ApiJson, ApiPath, ApiQuery},
    middleware::auth_context::AuthContext,
    models::{param_id_sql, param_type, ApiOk, AppState, AssignmentStatus, Role, SoftDelete},
    pagination::{PageRequest, Paginated},
    routes::user_routes::fetch_active_user_with_role,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tratamientos", get(list_treatments).post(create_treatment))
        .route(
            "/tratamientos/{tratamiento_id}",
            get(get_treatment)
                .patch(update_treatment)
                .delete(delete_treatment),
        )
        .route(
            "/tratamientos-usuarios",
            get(list_assignments).post(assign_treatments),
        )
        .route(
            "/tratamientos-usuarios/{asignacion_id}",
            patch(update_assignment_status).delete(remove_assignment),
        )
}

/* ============================================================
   Catalog
   ============================================================ */

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TreatmentRow {
    pub id: Uuid,
    pub nombre: String,
    pub descripcion: Option<String>,
    pub precio_estimado: i64,
    pub duracion_minutos: i32,
    pub imagen_url: Option<String>,
    pub ruta_filtro_ar: Option<String>,
    pub eliminado: SoftDelete,
    pub creado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

const TREATMENT_COLUMNS: &str = r#"
    id, nombre, descripcion, precio_estimado, duracion_minutos, imagen_url,
    ruta_filtro_ar, eliminado, creado_en, actualizado_en
"#;

pub const MAX_DURATION_MIN: i32 = 8 * 60;

#[derive(Debug, Deserialize)]
pub struct TreatmentListQuery {
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
    pub busqueda: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TreatmentRequest {
    pub nombre: Option<String>,
    pub descripcion: Option<String>,
    pub precio_estimado: Option<i64>,
    pub duracion_minutos: Option<i32>,
    pub imagen_url: Option<String>,
    pub ruta_filtro_ar: Option<String>,
}

/// Fully-resolved treatment fields after merging a request over defaults or an existing row.
#[derive(Debug, PartialEq)]
struct TreatmentFields {
    nombre: String,
    descripcion: Option<String>,
    precio_estimado: i64,
    duracion_minutos: i32,
    imagen_url: Option<String>,
    ruta_filtro_ar: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn validate_treatment(req: TreatmentRequest, existing: Option<&TreatmentRow>) -> Result<TreatmentFields, ApiError> {
    let nombre = match (non_empty(req.nombre), existing) {
        (Some(n), _) => n,
        (None, Some(e)) => e.nombre.clone(),
        (None, None) => return Err(ApiError::validation("nombre is required")),
    };
    if nombre.len() > 150 {
        return Err(ApiError::validation("nombre is too long (max 150)"));
    }

    let precio_estimado = match (req.precio_estimado, existing) {
        (Some(p), _) => p,
        (None, Some(e)) => e.precio_estimado,
        (None, None) => return Err(ApiError::validation("precio_estimado is required")),
    };
    if precio_estimado < 0 {
        return Err(ApiError::validation("precio_estimado must be >= 0"));
    }

    let duracion_minutos = match (req.duracion_minutos, existing) {
        (Some(d), _) => d,
        (None, Some(e)) => e.duracion_minutos,
        (None, None) => return Err(ApiError::validation("duracion_minutos is required")),
    };
    if !(1..=MAX_DURATION_MIN).contains(&duracion_minutos) {
        return Err(ApiError::validation(format!(
            "duracion_minutos must be between 1 and {MAX_DURATION_MIN}"
        )));
    }

    let ruta_filtro_ar = match req.ruta_filtro_ar {
        Some(r) => non_empty(Some(r)),
        None => existing.and_then(|e| e.ruta_filtro_ar.clone()),
    };
    if let Some(r) = &ruta_filtro_ar {
        if !(r.starts_with('/') || r.starts_with("https://") || r.starts_with("http://")) {
            return Err(ApiError::validation(
                "ruta_filtro_ar must be an absolute path or URL",
            ));
        }
    }

    Ok(TreatmentFields {
        nombre,
        descripcion: match req.descripcion {
            Some(d) => non_empty(Some(d)),
            None => existing.and_then(|e| e.descripcion.clone()),
        },
        precio_estimado,
        duracion_minutos,
        imagen_url: match req.imagen_url {
            Some(u) => non_empty(Some(u)),
            None => existing.and_then(|e| e.imagen_url.clone()),
        },
        ruta_filtro_ar,
    })
}

async fn fetch_active_treatment(state: &AppState, id: Uuid) -> Result<TreatmentRow, ApiError> {
    sqlx::query_as::<_, TreatmentRow>(&format!(
        "SELECT {TREATMENT_COLUMNS} FROM tratamientos WHERE id = $1 AND eliminado = -1"
    ))
    .bind(id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("treatment"))
}

fn push_treatment_filters(qb: &mut QueryBuilder<'_, Postgres>, like: Option<&str>) {
    qb.push(" WHERE eliminado = -1 ");
    if let Some(like) = like {
        qb.push(" AND (nombre ILIKE ");
        qb.push_bind(like.to_string());
        qb.push(" OR descripcion ILIKE ");
        qb.push_bind(like.to_string());
        qb.push(") ");
    }
}

pub async fn list_treatments(
    State(state): State<AppState>,
    _auth: AuthContext,
    ApiQuery(q): ApiQuery<TreatmentListQuery>,
) -> Result<Json<ApiOk<Paginated<TreatmentRow>>>, ApiError> {
    let page = PageRequest::new(q.pagina, q.cantidad_por_pagina);
    let like = q
        .busqueda
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{s}%"));

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM tratamientos");
    push_treatment_filters(&mut count_qb, like.as_deref());
    let total: i64 = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("SELECT {TREATMENT_COLUMNS} FROM tratamientos"));
    push_treatment_filters(&mut qb, like.as_deref());
    qb.push(" ORDER BY nombre ASC, id ASC LIMIT ");
    qb.push_bind(page.limit());
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<TreatmentRow> = qb
        .build_query_as::<TreatmentRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(Paginated::new(rows, total, page))))
}

pub async fn get_treatment(
    State(state): State<AppState>,
    _auth: AuthContext,
    ApiPath(tratamiento_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    let row = fetch_active_treatment(&state, tratamiento_id).await?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn create_treatment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<TreatmentRequest>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    auth.ensure_staff()?;
    let f = validate_treatment(req, None)?;

    let row: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        INSERT INTO tratamientos (nombre, descripcion, precio_estimado, duracion_minutos, imagen_url, ruta_filtro_ar)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {TREATMENT_COLUMNS}
        "#
    ))
    .bind(&f.nombre)
    .bind(&f.descripcion)
    .bind(f.precio_estimado)
    .bind(f.duracion_minutos)
    .bind(&f.imagen_url)
    .bind(&f.ruta_filtro_ar)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    tracing::info!(tratamiento_id = %row.id, "treatment created");
    Ok(Json(ApiOk::with_message("Treatment created", row)))
}

pub async fn update_treatment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(tratamiento_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TreatmentRequest>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    auth.ensure_staff()?;
    let existing = fetch_active_treatment(&state, tratamiento_id).await?;
    let f = validate_treatment(req, Some(&existing))?;

    let row: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        UPDATE tratamientos
        SET nombre = $2,
            descripcion = $3,
            precio_estimado = $4,
            duracion_minutos = $5,
            imagen_url = $6,
            ruta_filtro_ar = $7,
            actualizado_en = now()
        WHERE id = $1
        RETURNING {TREATMENT_COLUMNS}
        "#
    ))
    .bind(tratamiento_id)
    .bind(&f.nombre)
    .bind(&f.descripcion)
    .bind(f.precio_estimado)
    .bind(f.duracion_minutos)
    .bind(&f.imagen_url)
    .bind(&f.ruta_filtro_ar)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::with_message("Treatment updated", row)))
}

pub async fn delete_treatment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(tratamiento_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<TreatmentRow>>, ApiError> {
    auth.ensure_staff()?;

    let row: TreatmentRow = sqlx::query_as::<_, TreatmentRow>(&format!(
        r#"
        UPDATE tratamientos
        SET eliminado = 1, actualizado_en = now()
        WHERE id = $1 AND eliminado = -1
        RETURNING {TREATMENT_COLUMNS}
        "#
    ))
    .bind(tratamiento_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("treatment"))?;

    tracing::info!(tratamiento_id = %tratamiento_id, "treatment deleted");
    Ok(Json(ApiOk::with_message("Treatment deleted", row)))
}

/* ============================================================
   Patient assignments
   ============================================================ */

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AssignmentRow {
    pub id: Uuid,
    pub paciente_id: Uuid,
    pub tratamiento_id: Uuid,
    pub tratamiento_nombre: String,
    pub precio: i64,
    #[sqlx(try_from = "String")]
    pub estado: AssignmentStatus,
    pub asignado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

const ASSIGNMENT_SELECT: &str = r#"
    SELECT a.id, a.paciente_id, a.tratamiento_id, t.nombre AS tratamiento_nombre,
           a.precio, p.codigo AS estado, a.asignado_en, a.actualizado_en
    FROM tratamientos_usuarios a
    JOIN tratamientos t ON t.id = a.tratamiento_id
    JOIN parametros p ON p.id = a.estado_id
"#;

#[derive(Debug, Deserialize)]
pub struct AssignmentListQuery {
    pub paciente_id: Option<Uuid>,
}

pub async fn list_assignments(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<AssignmentListQuery>,
) -> Result<Json<ApiOk<Vec<AssignmentRow>>>, ApiError> {
    let paciente_id = match (auth.role, q.paciente_id) {
        (Role::Patient, None) => auth.user_id,
        (_, Some(id)) => id,
        (_, None) => return Err(ApiError::validation("paciente_id is required")),
    };
    auth.ensure_self_or_staff(paciente_id)?;

    let rows: Vec<AssignmentRow> = sqlx::query_as::<_, AssignmentRow>(&format!(
        "{ASSIGNMENT_SELECT} WHERE a.paciente_id = $1 AND a.eliminado = -1 ORDER BY a.asignado_en ASC, a.id ASC"
    ))
    .bind(paciente_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub paciente_id: Uuid,
    pub tratamiento_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct AssignFailure {
    pub tratamiento_id: Uuid,
    pub motivo: String,
}

#[derive(Debug, Serialize)]
pub struct AssignResult {
    pub exitosos: usize,
    pub fallidos: usize,
    pub asignaciones: Vec<AssignmentRow>,
    pub errores: Vec<AssignFailure>,
}

/// First occurrence of each id wins; repeats are reported as failures.
fn dedupe_ids(ids: &[Uuid]) -> (Vec<Uuid>, Vec<AssignFailure>) {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(ids.len());
    let mut repeats = Vec::new();
    for id in ids {
        if seen.insert(*id) {
            unique.push(*id);
        } else {
            repeats.push(AssignFailure {
                tratamiento_id: *id,
                motivo: "repeated in request".into(),
            });
        }
    }
    (unique, repeats)
}

/// Bulk assignment. Each treatment succeeds or fails on its own.
pub async fn assign_treatments(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<AssignRequest>,
) -> Result<Json<ApiOk<AssignResult>>, ApiError> {
    auth.ensure_staff()?;
    if req.tratamiento_ids.is_empty() {
        return Err(ApiError::validation("tratamiento_ids must not be empty"));
    }
    fetch_active_user_with_role(&state, req.paciente_id, Role::Patient).await?;

    let (unique, mut errores) = dedupe_ids(&req.tratamiento_ids);
    let mut asignaciones = Vec::with_capacity(unique.len());

    for tratamiento_id in unique {
        let inserted: Option<Uuid> = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO tratamientos_usuarios (paciente_id, tratamiento_id, estado_id, precio)
            SELECT $1, t.id, {estado}, t.precio_estimado
            FROM tratamientos t
            WHERE t.id = $2 AND t.eliminado = -1
            ON CONFLICT (paciente_id, tratamiento_id) WHERE eliminado = -1 DO NOTHING
            RETURNING id
            "#,
            estado = param_id_sql("$3", "$4"),
        ))
        .bind(req.paciente_id)
        .bind(tratamiento_id)
        .bind(param_type::ASSIGNMENT_STATUS)
        .bind(AssignmentStatus::InProgress.code())
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)?;

        let Some(id) = inserted else {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM tratamientos WHERE id = $1 AND eliminado = -1)",
            )
            .bind(tratamiento_id)
            .fetch_one(&state.db)
            .await
            .map_err(ApiError::db)?;

            errores.push(AssignFailure {
                tratamiento_id,
                motivo: if exists {
                    "already assigned to this patient".into()
                } else {
                    "treatment not found".into()
                },
            });
            continue;
        };

        let row = sqlx::query_as::<_, AssignmentRow>(&format!("{ASSIGNMENT_SELECT} WHERE a.id = $1"))
            .bind(id)
            .fetch_one(&state.db)
            .await
            .map_err(ApiError::db)?;
        asignaciones.push(row);
    }

    tracing::info!(
        paciente_id = %req.paciente_id,
        exitosos = asignaciones.len(),
        fallidos = errores.len(),
        "treatments assigned"
    );

    let result = AssignResult {
        exitosos: asignaciones.len(),
        fallidos: errores.len(),
        asignaciones,
        errores,
    };
    let message = format!("{} assigned, {} failed", result.exitosos, result.fallidos);
    Ok(Json(ApiOk::with_message(message, result)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAssignmentRequest {
    pub estado: AssignmentStatus,
}

pub async fn update_assignment_status(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(asignacion_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateAssignmentRequest>,
) -> Result<Json<ApiOk<AssignmentRow>>, ApiError> {
    auth.ensure_staff()?;

    let res = sqlx::query(&format!(
        r#"
        UPDATE tratamientos_usuarios
        SET estado_id = {estado}, actualizado_en = now()
        WHERE id = $1 AND eliminado = -1
        "#,
        estado = param_id_sql("$2", "$3"),
    ))
    .bind(asignacion_id)
    .bind(param_type::ASSIGNMENT_STATUS)
    .bind(req.estado.code())
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("treatment assignment"));
    }

    let row = sqlx::query_as::<_, AssignmentRow>(&format!("{ASSIGNMENT_SELECT} WHERE a.id = $1"))
        .bind(asignacion_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;
    Ok(Json(ApiOk::new(row)))
}

pub async fn remove_assignment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(asignacion_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<Uuid>>, ApiError> {
    auth.ensure_staff()?;

    let res = sqlx::query(
        r#"
        UPDATE tratamientos_usuarios
        SET eliminado = 1, actualizado_en = now()
        WHERE id = $1 AND eliminado = -1
        "#,
    )
    .bind(asignacion_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("treatment assignment"));
    }
    Ok(Json(ApiOk::with_message("Treatment assignment removed", asignacion_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> TreatmentRequest {
        TreatmentRequest {
            nombre: Some(" Limpieza ".into()),
            descripcion: None,
            precio_estimado: Some(80_000),
            duracion_minutos: Some(45),
            imagen_url: None,
            ruta_filtro_ar: None,
        }
    }

    fn existing() -> TreatmentRow {
        TreatmentRow {
            id: Uuid::new_v4(),
            nombre: "Blanqueamiento".into(),
            descripcion: Some("Sesión de blanqueamiento".into()),
            precio_estimado: 300_000,
            duracion_minutos: 60,
            imagen_url: None,
            ruta_filtro_ar: Some("/ar/blanqueamiento".into()),
            eliminado: SoftDelete::Active,
            creado_en: Utc::now(),
            actualizado_en: Utc::now(),
        }
    }

    #[test]
    fn create_requires_core_fields() {
        let f = validate_treatment(req(), None).unwrap();
        assert_eq!(f.nombre, "Limpieza");

        let mut r = req();
        r.nombre = Some("  ".into());
        assert!(validate_treatment(r, None).is_err());

        let mut r = req();
        r.precio_estimado = None;
        assert!(validate_treatment(r, None).is_err());

        let mut r = req();
        r.precio_estimado = Some(-1);
        assert!(validate_treatment(r, None).is_err());

        let mut r = req();
        r.duracion_minutos = Some(0);
        assert!(validate_treatment(r, None).is_err());
    }

    #[test]
    fn update_merges_over_existing() {
        let e = existing();
        let patch = TreatmentRequest {
            nombre: None,
            descripcion: None,
            precio_estimado: Some(350_000),
            duracion_minutos: None,
            imagen_url: None,
            ruta_filtro_ar: Some("".into()),
        };
        let f = validate_treatment(patch, Some(&e)).unwrap();
        assert_eq!(f.nombre, "Blanqueamiento");
        assert_eq!(f.precio_estimado, 350_000);
        assert_eq!(f.duracion_minutos, 60);
        assert_eq!(f.descripcion.as_deref(), Some("Sesión de blanqueamiento"));
        assert_eq!(f.ruta_filtro_ar, None);
    }

    #[test]
    fn ar_route_must_be_absolute() {
        let mut r = req();
        r.ruta_filtro_ar = Some("filtros/sonrisa".into());
        assert!(validate_treatment(r, None).is_err());

        let mut r = req();
        r.ruta_filtro_ar = Some("https://ar.clinic.test/sonrisa".into());
        assert!(validate_treatment(r, None).is_ok());
    }

    #[test]
    fn repeated_ids_are_reported() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let (unique, repeats) = dedupe_ids(&[a, b, a, a]);
        assert_eq!(unique, vec![a, b]);
        assert_eq!(repeats.len(), 2);
        assert!(repeats.iter().all(|r| r.tratamiento_id == a));
    }
}
