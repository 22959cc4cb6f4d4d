// src/routes/parameter_routes.rs

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiError,
    extract::ApiQuery,
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/parametros", get(list_parameters))
        .route("/parametros/tipos", get(list_parameter_types))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ParameterTypeRow {
    pub id: i32,
    pub codigo: String,
    pub nombre: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ParameterRow {
    pub id: i32,
    pub tipo: String,
    pub codigo: String,
    pub nombre: String,
}

#[derive(Debug, Deserialize)]
pub struct ParameterQuery {
    pub tipo: Option<String>,
}

pub async fn list_parameter_types(
    State(state): State<AppState>,
    _auth: AuthContext,
) -> Result<Json<ApiOk<Vec<ParameterTypeRow>>>, ApiError> {
    let rows: Vec<ParameterTypeRow> = sqlx::query_as::<_, ParameterTypeRow>(
        r#"
        SELECT id, codigo, nombre
        FROM tipos_parametros
        ORDER BY codigo ASC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(rows)))
}

pub async fn list_parameters(
    State(state): State<AppState>,
    _auth: AuthContext,
    ApiQuery(q): ApiQuery<ParameterQuery>,
) -> Result<Json<ApiOk<Vec<ParameterRow>>>, ApiError> {
    let tipo = q.tipo.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let rows: Vec<ParameterRow> = sqlx::query_as::<_, ParameterRow>(
        r#"
        SELECT p.id, t.codigo AS tipo, p.codigo, p.nombre
        FROM parametros p
        JOIN tipos_parametros t ON t.id = p.tipo_parametro_id
        WHERE ($1::text IS NULL OR t.codigo = $1)
        ORDER BY t.codigo ASC, p.id ASC
        "#,
    )
    .bind(tipo)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    if tipo.is_some() && rows.is_empty() {
        return Err(ApiError::not_found("parameter type"));
    }

    Ok(Json(ApiOk::new(rows)))
}
