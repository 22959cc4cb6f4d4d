// src/routes/user_routes.rs

use axum::{
    extract::State,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Deserializer;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    auth::hash_password,
    error::ApiError,
    extract::{ApiJson, ApiPath, ApiQuery},
    middleware::auth_context::AuthContext,
    models::{param_id_sql, param_type, ApiOk, AppState, Role, SoftDelete},
    pagination::{PageRequest, Paginated},
    scheduling::parse_date,
};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    #[sqlx(try_from = "String")]
    pub rol: Role,
    pub nombres: String,
    pub apellidos: String,
    pub identificacion: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub foto_perfil: Option<String>,
    pub eliminado: SoftDelete,
    pub creado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    #[serde(flatten)]
    pub user: UserRow,
    pub foto_url: Option<String>,
}

impl UserDto {
    fn from_row(state: &AppState, user: UserRow) -> Self {
        let foto_url = user
            .foto_perfil
            .as_deref()
            .map(|p| public_file_url(&state.file_server_base_url, p));
        Self { user, foto_url }
    }
}

const USER_SELECT: &str = r#"
    SELECT u.id, u.email, p.codigo AS rol, u.nombres, u.apellidos, u.identificacion,
           u.telefono, u.direccion, u.fecha_nacimiento, u.foto_perfil, u.eliminado,
           u.creado_en, u.actualizado_en
    FROM usuarios u
    JOIN parametros p ON p.id = u.rol_id
"#;

/* ============================================================
   Router
   ============================================================ */

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/pacientes", role_router(Role::Patient))
        .nest("/odontologos", role_router(Role::Doctor))
        .nest("/auxiliares", role_router(Role::Auxiliary))
        .route("/usuarios", post(create_any_user))
        .route("/usuarios/me", get(get_me))
        .route("/usuarios/{user_id}", get(get_any_user))
        .route("/usuarios/{user_id}/foto", patch(set_profile_photo))
}

/// CRUD for one role: `/pacientes`, `/odontologos`, `/auxiliares`.
fn role_router(role: Role) -> Router<AppState> {
    Router::new()
        .route(
            "/",
            get(move |state: State<AppState>, auth: AuthContext, q: ApiQuery<UserListQuery>| {
                list_users(state, auth, q, role)
            })
            .post(move |state: State<AppState>, auth: AuthContext, req: ApiJson<CreateUserRequest>| {
                create_user(state, auth, req, role)
            }),
        )
        .route(
            "/{user_id}",
            get(move |state: State<AppState>, auth: AuthContext, id: ApiPath<Uuid>| {
                get_user(state, auth, id, role)
            })
            .patch(
                move |state: State<AppState>,
                      auth: AuthContext,
                      id: ApiPath<Uuid>,
                      req: ApiJson<UpdateUserRequest>| {
                    update_user(state, auth, id, req, role)
                },
            )
            .delete(move |state: State<AppState>, auth: AuthContext, id: ApiPath<Uuid>| {
                set_soft_delete(state, auth, id, role, SoftDelete::Deleted)
            }),
        )
        .route(
            "/{user_id}/reactivar",
            post(move |state: State<AppState>, auth: AuthContext, id: ApiPath<Uuid>| {
                set_soft_delete(state, auth, id, role, SoftDelete::Active)
            }),
        )
}

/* ============================================================
   Guards + validation
   ============================================================ */

/// Staff manage patients; only admins manage staff accounts.
fn ensure_can_manage(auth: &AuthContext, target: Role) -> Result<(), ApiError> {
    match target {
        Role::Patient => auth.ensure_staff(),
        _ => auth.ensure_admin(),
    }
}

/// Trim, drop inner whitespace, lowercase. Rejects obviously malformed addresses.
pub fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ApiError::validation("email is not valid"));
    };
    if local.is_empty() || domain.len() < 3 || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(ApiError::validation("email is not valid"));
    }
    Ok(email)
}

fn validate_password(pw: &str) -> Result<(), ApiError> {
    if pw.trim().len() < 8 {
        return Err(ApiError::validation("password must be at least 8 characters"));
    }
    Ok(())
}

fn validate_name(field: &str, value: &str) -> Result<String, ApiError> {
    let v = value.trim();
    if v.is_empty() {
        return Err(ApiError::validation(format!("{field} is required")));
    }
    if v.len() > 120 {
        return Err(ApiError::validation(format!("{field} is too long (max 120)")));
    }
    Ok(v.to_string())
}

fn clean_optional(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Stored upload path: `/<destination>/<name>.<ext>`.
fn validate_file_path(path: &str) -> Result<String, ApiError> {
    let p = path.trim();
    let segments: Vec<&str> = p.trim_start_matches('/').split('/').collect();
    let well_formed = p.starts_with('/')
        && segments.len() >= 2
        && segments.iter().all(|s| !s.is_empty() && *s != "." && *s != "..")
        && segments
            .last()
            .and_then(|name| name.rsplit_once('.'))
            .is_some_and(|(stem, ext)| !stem.is_empty() && !ext.is_empty());
    if !well_formed {
        return Err(ApiError::validation(
            "ruta must look like /<destination>/<name>.<ext>",
        ));
    }
    Ok(p.to_string())
}

pub fn public_file_url(base: &str, path: &str) -> String {
    format!("{base}{path}")
}

fn deserialize_double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    // present-but-null => Some(None); absent is handled by #[serde(default)]
    let inner = Option::<T>::deserialize(deserializer)?;
    Ok(Some(inner))
}

async fn email_taken(state: &AppState, email: &str, except: Option<Uuid>) -> Result<bool, ApiError> {
    sqlx::query_scalar::<_, bool>(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM usuarios
            WHERE lower(btrim(email)) = $1
              AND ($2::uuid IS NULL OR id <> $2)
        )
        "#,
    )
    .bind(email)
    .bind(except)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)
}

pub(crate) async fn fetch_user(state: &AppState, user_id: Uuid) -> Result<Option<UserRow>, ApiError> {
    sqlx::query_as::<_, UserRow>(&format!("{USER_SELECT} WHERE u.id = $1"))
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::db)
}

/// Active user with the given role, or a role-specific 404.
pub(crate) async fn fetch_active_user_with_role(
    state: &AppState,
    user_id: Uuid,
    role: Role,
) -> Result<UserRow, ApiError> {
    fetch_user(state, user_id)
        .await?
        .filter(|u| u.rol == role && u.eliminado.is_active())
        .ok_or_else(|| ApiError::not_found(role_label(role)))
}

pub(crate) fn role_label(role: Role) -> &'static str {
    match role {
        Role::Patient => "patient",
        Role::Doctor => "doctor",
        Role::Auxiliary => "auxiliary",
        Role::Admin => "admin",
    }
}

/* ============================================================
   List
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
    pub busqueda: Option<String>,
}

fn push_user_filters(qb: &mut QueryBuilder<'_, Postgres>, role: Role, search: Option<&str>) {
    qb.push(" WHERE p.codigo = ");
    qb.push_bind(role.code().to_string());
    qb.push(" AND u.eliminado = ");
    qb.push_bind(SoftDelete::Active.as_i16());

    if let Some(term) = search {
        let like = format!("%{term}%");
        qb.push(" AND (u.nombres ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR u.apellidos ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR u.email ILIKE ");
        qb.push_bind(like.clone());
        qb.push(" OR u.identificacion ILIKE ");
        qb.push_bind(like);
        qb.push(") ");
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<UserListQuery>,
    role: Role,
) -> Result<Json<ApiOk<Paginated<UserDto>>>, ApiError> {
    auth.ensure_staff()?;

    let page = PageRequest::new(q.pagina, q.cantidad_por_pagina);
    let search = q.busqueda.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT COUNT(*) FROM usuarios u JOIN parametros p ON p.id = u.rol_id",
    );
    push_user_filters(&mut count_qb, role, search);
    let total: i64 = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(USER_SELECT);
    push_user_filters(&mut qb, role, search);
    qb.push(" ORDER BY u.apellidos ASC, u.nombres ASC, u.id ASC LIMIT ");
    qb.push_bind(page.limit());
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<UserRow> = qb
        .build_query_as::<UserRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    let items = rows.into_iter().map(|u| UserDto::from_row(&state, u)).collect();
    Ok(Json(ApiOk::new(Paginated::new(items, total, page))))
}

/* ============================================================
   Get
   ============================================================ */

pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    role: Role,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    if !(auth.is_staff() || auth.user_id == user_id) {
        return Err(ApiError::forbidden("You can only view your own profile"));
    }
    let user = fetch_active_user_with_role(&state, user_id, role).await?;
    Ok(Json(ApiOk::new(UserDto::from_row(&state, user))))
}

pub async fn get_any_user(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    auth.ensure_admin()?;
    let user = fetch_user(&state, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(ApiOk::new(UserDto::from_row(&state, user))))
}

pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    let user = fetch_user(&state, auth.user_id)
        .await?
        .filter(|u| u.eliminado.is_active())
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(ApiOk::new(UserDto::from_row(&state, user))))
}

/* ============================================================
   Create
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub nombres: String,
    pub apellidos: String,
    pub identificacion: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
    pub fecha_nacimiento: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAnyUserRequest {
    pub rol: Role,
    #[serde(flatten)]
    pub user: CreateUserRequest,
}

/// Validated insert payload.
struct NewUser {
    email: String,
    nombres: String,
    apellidos: String,
    identificacion: Option<String>,
    telefono: Option<String>,
    direccion: Option<String>,
    fecha_nacimiento: Option<NaiveDate>,
}

fn validate_new_user(req: CreateUserRequest) -> Result<(NewUser, String), ApiError> {
    let email = normalize_email(&req.email)?;
    validate_password(&req.password)?;
    let nombres = validate_name("nombres", &req.nombres)?;
    let apellidos = validate_name("apellidos", &req.apellidos)?;
    let fecha_nacimiento = clean_optional(req.fecha_nacimiento)
        .map(|s| parse_date("fecha_nacimiento", &s))
        .transpose()?;

    Ok((
        NewUser {
            email,
            nombres,
            apellidos,
            identificacion: clean_optional(req.identificacion),
            telefono: clean_optional(req.telefono),
            direccion: clean_optional(req.direccion),
            fecha_nacimiento,
        },
        req.password,
    ))
}

async fn insert_user(state: &AppState, role: Role, req: CreateUserRequest) -> Result<UserRow, ApiError> {
    let (new_user, password) = validate_new_user(req)?;

    if email_taken(state, &new_user.email, None).await? {
        return Err(ApiError::Conflict(
            "EMAIL_TAKEN",
            "a user with this email already exists".into(),
        ));
    }

    let password_hash = hash_password(password.trim()).map_err(ApiError::Internal)?;

    let id: Uuid = sqlx::query_scalar(&format!(
        r#"
        INSERT INTO usuarios (email, password_hash, rol_id, nombres, apellidos,
                              identificacion, telefono, direccion, fecha_nacimiento, eliminado)
        VALUES ($1, $2, {rol}, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id
        "#,
        rol = param_id_sql("$3", "$4"),
    ))
    .bind(&new_user.email)
    .bind(&password_hash)
    .bind(param_type::ROLE)
    .bind(role.code())
    .bind(&new_user.nombres)
    .bind(&new_user.apellidos)
    .bind(&new_user.identificacion)
    .bind(&new_user.telefono)
    .bind(&new_user.direccion)
    .bind(new_user.fecha_nacimiento)
    .bind(SoftDelete::Active)
    .fetch_one(&state.db)
    .await
    .map_err(|e| ApiError::db_or_conflict(e, "EMAIL_TAKEN", "a user with this email already exists"))?;

    tracing::info!(user_id = %id, rol = %role, "user created");

    fetch_user(state, id)
        .await?
        .ok_or_else(|| ApiError::Internal("created user vanished".into()))
}

pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<CreateUserRequest>,
    role: Role,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    ensure_can_manage(&auth, role)?;
    let user = insert_user(&state, role, req).await?;
    Ok(Json(ApiOk::with_message("User created", UserDto::from_row(&state, user))))
}

pub async fn create_any_user(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<CreateAnyUserRequest>,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    auth.ensure_admin()?;
    let user = insert_user(&state, req.rol, req.user).await?;
    Ok(Json(ApiOk::with_message("User created", UserDto::from_row(&state, user))))
}

/* ============================================================
   Update
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub nombres: Option<String>,
    pub apellidos: Option<String>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub identificacion: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub telefono: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub direccion: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_double_option")]
    pub fecha_nacimiento: Option<Option<String>>,
}

fn merge_nullable(incoming: Option<Option<String>>, existing: Option<String>) -> Option<String> {
    match incoming {
        None => existing,
        Some(v) => clean_optional(v),
    }
}

pub async fn update_user(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateUserRequest>,
    role: Role,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    if auth.user_id != user_id {
        ensure_can_manage(&auth, role)?;
    }

    let existing = fetch_active_user_with_role(&state, user_id, role).await?;

    let email = match req.email.as_deref() {
        Some(raw) => {
            let email = normalize_email(raw)?;
            if email != existing.email && email_taken(&state, &email, Some(user_id)).await? {
                return Err(ApiError::Conflict(
                    "EMAIL_TAKEN",
                    "a user with this email already exists".into(),
                ));
            }
            email
        }
        None => existing.email.clone(),
    };

    let nombres = match req.nombres.as_deref() {
        Some(v) => validate_name("nombres", v)?,
        None => existing.nombres.clone(),
    };
    let apellidos = match req.apellidos.as_deref() {
        Some(v) => validate_name("apellidos", v)?,
        None => existing.apellidos.clone(),
    };

    let fecha_nacimiento = match req.fecha_nacimiento {
        None => existing.fecha_nacimiento,
        Some(v) => clean_optional(v)
            .map(|s| parse_date("fecha_nacimiento", &s))
            .transpose()?,
    };

    let password_hash = match req.password.as_deref() {
        Some(pw) => {
            validate_password(pw)?;
            Some(hash_password(pw.trim()).map_err(ApiError::Internal)?)
        }
        None => None,
    };

    sqlx::query(
        r#"
        UPDATE usuarios
        SET email = $2,
            nombres = $3,
            apellidos = $4,
            identificacion = $5,
            telefono = $6,
            direccion = $7,
            fecha_nacimiento = $8,
            password_hash = COALESCE($9, password_hash),
            actualizado_en = now()
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(&email)
    .bind(&nombres)
    .bind(&apellidos)
    .bind(merge_nullable(req.identificacion, existing.identificacion))
    .bind(merge_nullable(req.telefono, existing.telefono))
    .bind(merge_nullable(req.direccion, existing.direccion))
    .bind(fecha_nacimiento)
    .bind(password_hash)
    .execute(&state.db)
    .await
    .map_err(|e| ApiError::db_or_conflict(e, "EMAIL_TAKEN", "a user with this email already exists"))?;

    let user = fetch_active_user_with_role(&state, user_id, role).await?;
    Ok(Json(ApiOk::with_message("User updated", UserDto::from_row(&state, user))))
}

/* ============================================================
   Soft delete / reactivate
   ============================================================ */

pub async fn set_soft_delete(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    role: Role,
    target: SoftDelete,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    ensure_can_manage(&auth, role)?;
    if target == SoftDelete::Deleted && auth.user_id == user_id {
        return Err(ApiError::validation("you cannot delete your own account"));
    }

    let res = sqlx::query(
        r#"
        UPDATE usuarios u
        SET eliminado = $2, actualizado_en = now()
        FROM parametros p
        WHERE u.id = $1
          AND p.id = u.rol_id
          AND p.codigo = $3
        "#,
    )
    .bind(user_id)
    .bind(target)
    .bind(role.code())
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found(role_label(role)));
    }

    tracing::info!(user_id = %user_id, eliminado = target.as_i16(), "user soft-delete state changed");

    let user = fetch_user(&state, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(role_label(role)))?;
    let message = if target.is_active() { "User reactivated" } else { "User deleted" };
    Ok(Json(ApiOk::with_message(message, UserDto::from_row(&state, user))))
}

/* ============================================================
   Profile photo
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct SetPhotoRequest {
    pub ruta: String,
}

pub async fn set_profile_photo(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(user_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<SetPhotoRequest>,
) -> Result<Json<ApiOk<UserDto>>, ApiError> {
    if auth.user_id != user_id {
        auth.ensure_admin()?;
    }
    let ruta = validate_file_path(&req.ruta)?;

    let res = sqlx::query(
        r#"
        UPDATE usuarios
        SET foto_perfil = $2, actualizado_en = now()
        WHERE id = $1 AND eliminado = -1
        "#,
    )
    .bind(user_id)
    .bind(&ruta)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    if res.rows_affected() == 0 {
        return Err(ApiError::not_found("user"));
    }

    let user = fetch_user(&state, user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("user"))?;
    Ok(Json(ApiOk::new(UserDto::from_row(&state, user))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_is_normalized() {
        assert_eq!(normalize_email("  A@Test.com ").unwrap(), "a@test.com");
        assert_eq!(normalize_email("a @test.com").unwrap(), "a@test.com");
        assert_eq!(
            normalize_email("a@test.com").unwrap(),
            normalize_email(" A@TEST.COM").unwrap()
        );
    }

    #[test]
    fn malformed_emails_are_rejected() {
        for bad in ["", "a", "a@", "@test.com", "a@b@c.com", "a@test", "a@.com", "a@test."] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_validate_password() {
        assert!(validate_password("password123").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password("        ").is_err());
    }

    #[test]
    fn names_are_trimmed_and_required() {
        assert_eq!(validate_name("nombres", "  Ana ").unwrap(), "Ana");
        assert!(validate_name("nombres", "  ").is_err());
        assert!(validate_name("nombres", &"x".repeat(121)).is_err());
    }

    #[test]
    fn new_user_payload_is_validated() {
        let req = CreateUserRequest {
            email: " Ana@Test.com".into(),
            password: "secret-123".into(),
            nombres: "Ana".into(),
            apellidos: "Ruiz".into(),
            identificacion: Some("  ".into()),
            telefono: Some(" 3001234567 ".into()),
            direccion: None,
            fecha_nacimiento: Some("1990-04-12".into()),
        };
        let (u, pw) = validate_new_user(req).unwrap();
        assert_eq!(u.email, "ana@test.com");
        assert_eq!(pw, "secret-123");
        assert_eq!(u.identificacion, None);
        assert_eq!(u.telefono.as_deref(), Some("3001234567"));
        assert_eq!(u.fecha_nacimiento, NaiveDate::from_ymd_opt(1990, 4, 12));

        let bad_date = CreateUserRequest {
            email: "b@test.com".into(),
            password: "secret-123".into(),
            nombres: "B".into(),
            apellidos: "C".into(),
            identificacion: None,
            telefono: None,
            direccion: None,
            fecha_nacimiento: Some("12/04/1990".into()),
        };
        assert!(validate_new_user(bad_date).is_err());
    }

    #[test]
    fn update_request_distinguishes_null_from_absent() {
        let req: UpdateUserRequest =
            serde_json::from_str(r#"{"telefono": null, "nombres": "Ana"}"#).unwrap();
        assert_eq!(req.telefono, Some(None));
        assert_eq!(req.direccion, None);
        assert_eq!(merge_nullable(req.telefono, Some("300".into())), None);
        assert_eq!(merge_nullable(req.direccion, Some("Calle 1".into())).as_deref(), Some("Calle 1"));
    }

    #[test]
    fn file_paths_follow_upload_layout() {
        assert_eq!(validate_file_path("/perfiles/ana.png").unwrap(), "/perfiles/ana.png");
        assert!(validate_file_path("perfiles/ana.png").is_err());
        assert!(validate_file_path("/ana.png").is_err());
        assert!(validate_file_path("/perfiles/../etc.png").is_err());
        assert!(validate_file_path("/perfiles/ana").is_err());
        assert_eq!(
            public_file_url("https://files.clinic.test", "/perfiles/ana.png"),
            "https://files.clinic.test/perfiles/ana.png"
        );
    }

    #[test]
    fn only_admins_manage_staff_accounts() {
        let aux = AuthContext { user_id: Uuid::new_v4(), role: Role::Auxiliary };
        assert!(ensure_can_manage(&aux, Role::Patient).is_ok());
        assert!(ensure_can_manage(&aux, Role::Doctor).is_err());
        let admin = AuthContext { user_id: Uuid::new_v4(), role: Role::Admin };
        assert!(ensure_can_manage(&admin, Role::Auxiliary).is_ok());
    }
}
