// src/routes/support_routes.rs

use axum::{
    extract::State,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    error::{is_unique_violation, ApiError},
    extract::{ApiJson, ApiPath, ApiQuery},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, TicketPriority, TicketStatus},
    pagination::{PageRequest, Paginated},
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/soporte/tickets", get(list_tickets).post(open_ticket))
        .route("/soporte/tickets/activo", get(get_active_ticket))
        .route(
            "/soporte/tickets/{ticket_id}/mensajes",
            get(list_messages).post(post_message),
        )
        .route("/soporte/tickets/{ticket_id}/leido", post(mark_read))
        .route("/soporte/tickets/{ticket_id}/estado", patch(update_ticket_status))
}

pub const MAX_MESSAGE_LEN: usize = 2000;
pub const DEFAULT_SUBJECT: &str = "Consulta general";
pub const BOT_GREETING: &str =
    "¡Hola! Recibimos tu mensaje. Un miembro de nuestro equipo te responderá pronto.";

/* ============================================================
   Rows
   ============================================================ */

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TicketRow {
    pub id: Uuid,
    pub usuario_id: Uuid,
    pub asunto: String,
    #[sqlx(try_from = "String")]
    pub estado: TicketStatus,
    #[sqlx(try_from = "String")]
    pub prioridad: TicketPriority,
    pub creado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

const TICKET_COLUMNS: &str =
    "id, usuario_id, asunto, estado, prioridad, creado_en, actualizado_en";

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub autor_id: Option<Uuid>,
    pub contenido: String,
    pub es_bot: bool,
    pub leido: bool,
    pub creado_en: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct TicketThread {
    pub ticket: TicketRow,
    pub mensajes: Vec<MessageRow>,
}

fn message_text(raw: &str) -> Result<String, ApiError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(ApiError::validation("message content must not be empty"));
    }
    if s.chars().count() > MAX_MESSAGE_LEN {
        return Err(ApiError::validation(format!(
            "message content is too long (max {MAX_MESSAGE_LEN})"
        )));
    }
    Ok(s.to_string())
}

async fn fetch_ticket(state: &AppState, ticket_id: Uuid) -> Result<TicketRow, ApiError> {
    sqlx::query_as::<_, TicketRow>(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets_soporte WHERE id = $1"
    ))
    .bind(ticket_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(|| ApiError::not_found("ticket"))
}

/// Owners and staff see a ticket; anyone else gets a 404.
async fn fetch_visible_ticket(
    state: &AppState,
    auth: &AuthContext,
    ticket_id: Uuid,
) -> Result<TicketRow, ApiError> {
    let ticket = fetch_ticket(state, ticket_id).await?;
    if ticket.usuario_id != auth.user_id && !auth.is_staff() {
        return Err(ApiError::not_found("ticket"));
    }
    Ok(ticket)
}

async fn fetch_active_for(state: &AppState, usuario_id: Uuid) -> Result<Option<TicketRow>, ApiError> {
    sqlx::query_as::<_, TicketRow>(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets_soporte WHERE usuario_id = $1 AND estado <> 'cerrado'"
    ))
    .bind(usuario_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)
}

async fn fetch_messages(state: &AppState, ticket_id: Uuid) -> Result<Vec<MessageRow>, ApiError> {
    sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT id, ticket_id, autor_id, contenido, es_bot, leido, creado_en
        FROM mensajes_soporte
        WHERE ticket_id = $1
        ORDER BY creado_en ASC, id ASC
        "#,
    )
    .bind(ticket_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)
}

/* ============================================================
   POST /soporte/tickets
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct OpenTicketRequest {
    pub asunto: Option<String>,
    pub mensaje: String,
    pub prioridad: Option<TicketPriority>,
}

/// Returns the caller's open ticket, or opens one seeded with the caller's
/// message and a bot greeting. On an existing ticket the message is appended.
pub async fn open_ticket(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<OpenTicketRequest>,
) -> Result<Json<ApiOk<TicketThread>>, ApiError> {
    let mensaje = message_text(&req.mensaje)?;
    let asunto = req
        .asunto
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SUBJECT)
        .to_string();

    if let Some(ticket) = fetch_active_for(&state, auth.user_id).await? {
        insert_message(&state, ticket.id, Some(auth.user_id), &mensaje, false).await?;
        let mensajes = fetch_messages(&state, ticket.id).await?;
        return Ok(Json(ApiOk::new(TicketThread { ticket, mensajes })));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let created = sqlx::query_as::<_, TicketRow>(&format!(
        r#"
        INSERT INTO tickets_soporte (usuario_id, asunto, prioridad)
        VALUES ($1, $2, $3)
        RETURNING {TICKET_COLUMNS}
        "#
    ))
    .bind(auth.user_id)
    .bind(&asunto)
    .bind(req.prioridad.unwrap_or(TicketPriority::Medium).code())
    .fetch_one(&mut *tx)
    .await;

    let ticket = match created {
        Ok(t) => t,
        Err(e) if is_unique_violation(&e) => {
            // another request opened it first
            tx.rollback().await.map_err(ApiError::db)?;
            let ticket = fetch_active_for(&state, auth.user_id)
                .await?
                .ok_or_else(|| ApiError::not_found("ticket"))?;
            insert_message(&state, ticket.id, Some(auth.user_id), &mensaje, false).await?;
            let mensajes = fetch_messages(&state, ticket.id).await?;
            return Ok(Json(ApiOk::new(TicketThread { ticket, mensajes })));
        }
        Err(e) => return Err(ApiError::db(e)),
    };

    sqlx::query(
        r#"
        INSERT INTO mensajes_soporte (ticket_id, autor_id, contenido, es_bot)
        VALUES ($1, $2, $3, false), ($1, NULL, $4, true)
        "#,
    )
    .bind(ticket.id)
    .bind(auth.user_id)
    .bind(&mensaje)
    .bind(BOT_GREETING)
    .execute(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(ticket_id = %ticket.id, usuario_id = %auth.user_id, "support ticket opened");

    let mensajes = fetch_messages(&state, ticket.id).await?;
    Ok(Json(ApiOk::with_message(
        "Ticket created",
        TicketThread { ticket, mensajes },
    )))
}

pub async fn get_active_ticket(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<TicketThread>>, ApiError> {
    let ticket = fetch_active_for(&state, auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("active ticket"))?;
    let mensajes = fetch_messages(&state, ticket.id).await?;
    Ok(Json(ApiOk::new(TicketThread { ticket, mensajes })))
}

/* ============================================================
   Messages
   ============================================================ */

pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(ticket_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<Vec<MessageRow>>>, ApiError> {
    let ticket = fetch_visible_ticket(&state, &auth, ticket_id).await?;
    Ok(Json(ApiOk::new(fetch_messages(&state, ticket.id).await?)))
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub contenido: String,
    #[serde(default)]
    pub es_bot: bool,
}

fn ensure_open(estado: TicketStatus) -> Result<(), ApiError> {
    if estado == TicketStatus::Closed {
        return Err(ApiError::Conflict(
            "TICKET_CLOSED",
            "This ticket is closed".into(),
        ));
    }
    Ok(())
}

/// Appends a message under a lock on the ticket row, so a concurrent close
/// either lands first and rejects the message or waits for it.
async fn insert_message(
    state: &AppState,
    ticket_id: Uuid,
    autor_id: Option<Uuid>,
    contenido: &str,
    es_bot: bool,
) -> Result<MessageRow, ApiError> {
    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    let estado: String =
        sqlx::query_scalar("SELECT estado FROM tickets_soporte WHERE id = $1 FOR UPDATE")
            .bind(ticket_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(ApiError::db)?
            .ok_or_else(|| ApiError::not_found("ticket"))?;
    let estado = TicketStatus::from_code(&estado)
        .ok_or_else(|| ApiError::Internal(format!("unknown ticket estado: {estado}")))?;
    ensure_open(estado)?;

    let row = sqlx::query_as::<_, MessageRow>(
        r#"
        INSERT INTO mensajes_soporte (ticket_id, autor_id, contenido, es_bot)
        VALUES ($1, $2, $3, $4)
        RETURNING id, ticket_id, autor_id, contenido, es_bot, leido, creado_en
        "#,
    )
    .bind(ticket_id)
    .bind(autor_id)
    .bind(contenido)
    .bind(es_bot)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    sqlx::query("UPDATE tickets_soporte SET actualizado_en = now() WHERE id = $1")
        .bind(ticket_id)
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;
    Ok(row)
}

pub async fn post_message(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(ticket_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<PostMessageRequest>,
) -> Result<Json<ApiOk<MessageRow>>, ApiError> {
    let contenido = message_text(&req.contenido)?;
    if req.es_bot && !auth.is_staff() {
        return Err(ApiError::forbidden("Only clinic staff can post bot messages"));
    }

    let ticket = fetch_visible_ticket(&state, &auth, ticket_id).await?;
    ensure_open(ticket.estado)?;

    let autor_id = (!req.es_bot).then_some(auth.user_id);
    let row = insert_message(&state, ticket.id, autor_id, &contenido, req.es_bot).await?;
    Ok(Json(ApiOk::new(row)))
}

/* ============================================================
   Read receipts
   ============================================================ */

/// The side of the conversation the caller reads from. The owner reads
/// staff and bot messages; staff read the owner's messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reader {
    Owner,
    Staff,
}

fn reader_side(ticket: &TicketRow, auth: &AuthContext) -> Reader {
    if ticket.usuario_id == auth.user_id {
        Reader::Owner
    } else {
        Reader::Staff
    }
}

/// SQL predicate selecting the messages `reader` has yet to read. Binds the owner id as `$2`.
fn unread_predicate(reader: Reader) -> &'static str {
    match reader {
        Reader::Owner => "ticket_id = $1 AND leido = false AND autor_id IS DISTINCT FROM $2",
        Reader::Staff => "ticket_id = $1 AND leido = false AND autor_id = $2",
    }
}

#[derive(Debug, Serialize)]
pub struct ReadReceipt {
    pub marcados: u64,
    pub no_leidos: i64,
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(ticket_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<ReadReceipt>>, ApiError> {
    let ticket = fetch_visible_ticket(&state, &auth, ticket_id).await?;
    let predicate = unread_predicate(reader_side(&ticket, &auth));

    let res = sqlx::query(&format!(
        "UPDATE mensajes_soporte SET leido = true WHERE {predicate}"
    ))
    .bind(ticket.id)
    .bind(ticket.usuario_id)
    .execute(&state.db)
    .await
    .map_err(ApiError::db)?;

    let no_leidos: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(*) FROM mensajes_soporte WHERE {predicate}"
    ))
    .bind(ticket.id)
    .bind(ticket.usuario_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(ReadReceipt {
        marcados: res.rows_affected(),
        no_leidos,
    })))
}

/* ============================================================
   Staff inbox
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct TicketListQuery {
    pub estado: Option<TicketStatus>,
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct TicketSummaryRow {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub ticket: TicketRow,
    pub usuario_nombre: String,
    pub no_leidos: i64,
    pub ultimo_mensaje: Option<String>,
}

fn push_ticket_filter(qb: &mut QueryBuilder<'_, Postgres>, estado: Option<TicketStatus>) {
    qb.push(" WHERE 1 = 1 ");
    if let Some(e) = estado {
        qb.push(" AND t.estado = ");
        qb.push_bind(e.code());
    }
}

pub async fn list_tickets(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<TicketListQuery>,
) -> Result<Json<ApiOk<Paginated<TicketSummaryRow>>>, ApiError> {
    auth.ensure_staff()?;
    let page = PageRequest::new(q.pagina, q.cantidad_por_pagina);

    let mut count_qb: QueryBuilder<Postgres> =
        QueryBuilder::new("SELECT COUNT(*) FROM tickets_soporte t");
    push_ticket_filter(&mut count_qb, q.estado);
    let total: i64 = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        r#"
        SELECT t.id, t.usuario_id, t.asunto, t.estado, t.prioridad, t.creado_en, t.actualizado_en,
               (u.nombres || ' ' || u.apellidos) AS usuario_nombre,
               (SELECT COUNT(*) FROM mensajes_soporte m
                 WHERE m.ticket_id = t.id AND m.leido = false AND m.autor_id = t.usuario_id) AS no_leidos,
               (SELECT m.contenido FROM mensajes_soporte m
                 WHERE m.ticket_id = t.id
                 ORDER BY m.creado_en DESC, m.id DESC LIMIT 1) AS ultimo_mensaje
        FROM tickets_soporte t
        JOIN usuarios u ON u.id = t.usuario_id
        "#,
    );
    push_ticket_filter(&mut qb, q.estado);
    qb.push(" ORDER BY t.actualizado_en DESC, t.id ASC LIMIT ");
    qb.push_bind(page.limit());
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<TicketSummaryRow> = qb
        .build_query_as::<TicketSummaryRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(Paginated::new(rows, total, page))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateTicketRequest {
    pub estado: TicketStatus,
    pub prioridad: Option<TicketPriority>,
}

fn status_rank(s: TicketStatus) -> u8 {
    match s {
        TicketStatus::Open => 0,
        TicketStatus::InProgress => 1,
        TicketStatus::Closed => 2,
    }
}

/// Tickets only move forward: abierto -> en_proceso -> cerrado.
fn ticket_transition(current: TicketStatus, target: TicketStatus) -> Result<TicketStatus, ApiError> {
    if status_rank(target) < status_rank(current) {
        return Err(ApiError::Conflict(
            "INVALID_TRANSITION",
            format!("cannot move ticket from {current} back to {target}"),
        ));
    }
    Ok(target)
}

pub async fn update_ticket_status(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(ticket_id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateTicketRequest>,
) -> Result<Json<ApiOk<TicketRow>>, ApiError> {
    auth.ensure_staff()?;

    let ticket = fetch_ticket(&state, ticket_id).await?;
    let next = ticket_transition(ticket.estado, req.estado)?;
    let prioridad = req.prioridad.unwrap_or(ticket.prioridad);

    let row = sqlx::query_as::<_, TicketRow>(&format!(
        r#"
        UPDATE tickets_soporte
        SET estado = $2, prioridad = $3, actualizado_en = now()
        WHERE id = $1 AND estado = $4
        RETURNING {TICKET_COLUMNS}
        "#
    ))
    .bind(ticket.id)
    .bind(next.code())
    .bind(prioridad.code())
    .bind(ticket.estado.code())
    .fetch_optional(&state.db)
    .await
    .map_err(|e| ApiError::db_or_conflict(e, "TICKET_ACTIVE", "the user already has an open ticket"))?
    .ok_or_else(|| {
        ApiError::Conflict(
            "INVALID_TRANSITION",
            "ticket changed while updating, reload and retry".into(),
        )
    })?;

    if next != ticket.estado {
        tracing::info!(ticket_id = %ticket.id, from = %ticket.estado, to = %next, por = %auth.user_id, "ticket status changed");
    }
    Ok(Json(ApiOk::new(row)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    fn ticket(owner: Uuid, estado: TicketStatus) -> TicketRow {
        TicketRow {
            id: Uuid::new_v4(),
            usuario_id: owner,
            asunto: DEFAULT_SUBJECT.into(),
            estado,
            prioridad: TicketPriority::Medium,
            creado_en: Utc::now(),
            actualizado_en: Utc::now(),
        }
    }

    #[test]
    fn message_text_is_trimmed_and_bounded() {
        assert_eq!(message_text("  hola  ").unwrap(), "hola");
        assert!(message_text("   ").is_err());
        assert!(message_text(&"a".repeat(MAX_MESSAGE_LEN + 1)).is_err());
        assert!(message_text(&"ñ".repeat(MAX_MESSAGE_LEN)).is_ok());
    }

    #[test]
    fn tickets_only_move_forward() {
        use TicketStatus::*;
        assert_eq!(ticket_transition(Open, InProgress).unwrap(), InProgress);
        assert_eq!(ticket_transition(InProgress, Closed).unwrap(), Closed);
        assert_eq!(ticket_transition(Open, Closed).unwrap(), Closed);
        assert_eq!(ticket_transition(InProgress, InProgress).unwrap(), InProgress);
        assert_eq!(
            ticket_transition(Closed, Open).unwrap_err().code(),
            "INVALID_TRANSITION"
        );
        assert!(ticket_transition(InProgress, Open).is_err());
    }

    #[test]
    fn closed_tickets_take_no_messages() {
        assert!(ensure_open(TicketStatus::Open).is_ok());
        assert!(ensure_open(TicketStatus::InProgress).is_ok());
        assert_eq!(ensure_open(TicketStatus::Closed).unwrap_err().code(), "TICKET_CLOSED");
    }

    #[test]
    fn each_side_reads_the_other() {
        let owner = AuthContext {
            user_id: Uuid::new_v4(),
            role: Role::Patient,
        };
        let staff = AuthContext {
            user_id: Uuid::new_v4(),
            role: Role::Auxiliary,
        };
        let t = ticket(owner.user_id, TicketStatus::Open);

        assert_eq!(reader_side(&t, &owner), Reader::Owner);
        assert_eq!(reader_side(&t, &staff), Reader::Staff);
        assert!(unread_predicate(Reader::Owner).contains("IS DISTINCT FROM"));
        assert!(unread_predicate(Reader::Staff).contains("autor_id = $2"));
    }
}
