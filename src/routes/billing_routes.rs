// src/routes/billing_routes.rs

use std::collections::HashSet;

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json as Jsonb, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::{
    billing::{allocate_payment, build_invoice, BillingSummary, ChargeLine, Invoice, InvoicePatient, InvoiceTreatment},
    error::ApiError,
    extract::{ApiJson, ApiPath, ApiQuery},
    middleware::auth_context::AuthContext,
    models::{param_id_sql, param_type, ApiOk, AppState, AppointmentStatus, PaymentStatus, Role},
    pagination::{PageRequest, Paginated},
    routes::user_routes::fetch_user,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/facturacion/resumen", get(get_billing_summary))
        .route("/facturacion/pacientes", get(list_patient_balances))
        .route("/facturacion/pacientes/{paciente_id}", get(get_patient_billing))
        .route("/facturacion/pacientes/{paciente_id}/factura", get(get_invoice))
        .route("/pagos", get(list_payments).post(register_payment))
}

/// Opens `cargos(cita_id, paciente_id, fecha, hora_inicio, motivo, tratamiento, valor, pagado)`:
/// every appointment that is not cancelled, with what has been applied to it.
/// The caller binds the cancelled status code right after this text and closes with `)`.
const CHARGES_CTE_OPEN: &str = r#"
    WITH aplicados AS (
        SELECT cita_id, SUM(monto_aplicado) AS pagado
        FROM pagos_citas
        GROUP BY cita_id
    ),
    cargos AS (
        SELECT c.id AS cita_id, c.paciente_id, c.fecha, c.hora_inicio, c.motivo,
               t.nombre AS tratamiento, c.valor, COALESCE(a.pagado, 0)::BIGINT AS pagado
        FROM citas c
        JOIN parametros e ON e.id = c.estado_id
        LEFT JOIN tratamientos t ON t.id = c.tratamiento_id
        LEFT JOIN aplicados a ON a.cita_id = c.id
        WHERE e.codigo <> "#;

fn charges_cte(qb: &mut QueryBuilder<'_, Postgres>) {
    qb.push(CHARGES_CTE_OPEN);
    qb.push_bind(AppointmentStatus::Cancelled.code());
    qb.push(" ) ");
}

async fn charge_lines_for_patient(state: &AppState, paciente_id: Uuid) -> Result<Vec<ChargeLine>, ApiError> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("");
    charges_cte(&mut qb);
    qb.push(
        r#"
        SELECT cita_id, fecha, hora_inicio, motivo, tratamiento, valor, pagado
        FROM cargos
        WHERE valor > 0 AND paciente_id = "#,
    );
    qb.push_bind(paciente_id);
    qb.push(" ORDER BY fecha ASC, hora_inicio ASC, cita_id ASC");

    qb.build_query_as::<ChargeLine>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)
}

/// Patient header for billing views. Soft-deleted patients keep their history.
async fn billing_patient(state: &AppState, paciente_id: Uuid) -> Result<InvoicePatient, ApiError> {
    let user = fetch_user(state, paciente_id)
        .await?
        .filter(|u| u.rol == Role::Patient)
        .ok_or_else(|| ApiError::not_found("patient"))?;

    Ok(InvoicePatient {
        id: user.id,
        nombre: format!("{} {}", user.nombres, user.apellidos),
        email: user.email,
        identificacion: user.identificacion,
        telefono: user.telefono,
        direccion: user.direccion,
    })
}

/* ============================================================
   GET /facturacion/resumen
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct BillingOverview {
    #[serde(flatten)]
    pub resumen: BillingSummary,
    pub pacientes_con_saldo: i64,
}

pub async fn get_billing_summary(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<ApiOk<BillingOverview>>, ApiError> {
    auth.ensure_staff()?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("");
    charges_cte(&mut qb);
    qb.push(
        r#"
        SELECT COALESCE(SUM(valor), 0)::BIGINT,
               COALESCE(SUM(pagado), 0)::BIGINT,
               (SELECT COUNT(*) FROM (
                    SELECT paciente_id FROM cargos
                    GROUP BY paciente_id
                    HAVING SUM(valor) > SUM(pagado)
               ) con_saldo)
        FROM cargos
        "#,
    );

    let (facturado, pagado, pacientes_con_saldo): (i64, i64, i64) = qb
        .build_query_as()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(BillingOverview {
        resumen: BillingSummary::from_totals(facturado, pagado),
        pacientes_con_saldo,
    })))
}

/* ============================================================
   GET /facturacion/pacientes
   ============================================================ */

#[derive(Debug, Deserialize)]
pub struct BalanceListQuery {
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
    pub busqueda: Option<String>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PatientBalanceRow {
    pub paciente_id: Uuid,
    pub nombre: String,
    pub email: String,
    pub identificacion: Option<String>,
    pub total_facturado: i64,
    pub total_pagado: i64,
    pub saldo_pendiente: i64,
}

fn push_patient_filter(qb: &mut QueryBuilder<'_, Postgres>, search: Option<&str>) {
    qb.push(" WHERE u.eliminado = -1 AND r.codigo = ");
    qb.push_bind(Role::Patient.code());
    if let Some(s) = search {
        let like = format!("%{s}%");
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

pub async fn list_patient_balances(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<BalanceListQuery>,
) -> Result<Json<ApiOk<Paginated<PatientBalanceRow>>>, ApiError> {
    auth.ensure_staff()?;
    let page = PageRequest::new(q.pagina, q.cantidad_por_pagina);
    let search = q.busqueda.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT COUNT(*) FROM usuarios u JOIN parametros r ON r.id = u.rol_id",
    );
    push_patient_filter(&mut count_qb, search);
    let total: i64 = count_qb
        .build_query_scalar::<i64>()
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("");
    charges_cte(&mut qb);
    qb.push(
        r#"
        , saldos AS (
            SELECT paciente_id, SUM(valor) AS facturado, SUM(pagado) AS pagado
            FROM cargos
            GROUP BY paciente_id
        )
        SELECT u.id AS paciente_id,
               (u.nombres || ' ' || u.apellidos) AS nombre,
               u.email,
               u.identificacion,
               COALESCE(s.facturado, 0)::BIGINT AS total_facturado,
               COALESCE(s.pagado, 0)::BIGINT AS total_pagado,
               GREATEST(COALESCE(s.facturado, 0) - COALESCE(s.pagado, 0), 0)::BIGINT AS saldo_pendiente
        FROM usuarios u
        JOIN parametros r ON r.id = u.rol_id
        LEFT JOIN saldos s ON s.paciente_id = u.id
        "#,
    );
    push_patient_filter(&mut qb, search);
    qb.push(" ORDER BY saldo_pendiente DESC, nombre ASC, u.id ASC LIMIT ");
    qb.push_bind(page.limit());
    qb.push(" OFFSET ");
    qb.push_bind(page.offset());

    let rows: Vec<PatientBalanceRow> = qb
        .build_query_as::<PatientBalanceRow>()
        .fetch_all(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(Paginated::new(rows, total, page))))
}

/* ============================================================
   GET /facturacion/pacientes/{id}[/factura]
   ============================================================ */

#[derive(Debug, Serialize)]
pub struct PatientBilling {
    pub paciente: InvoicePatient,
    pub resumen: BillingSummary,
    pub citas: Vec<ChargeLine>,
}

pub async fn get_patient_billing(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(paciente_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<PatientBilling>>, ApiError> {
    auth.ensure_self_or_staff(paciente_id)?;

    let paciente = billing_patient(&state, paciente_id).await?;
    let citas = charge_lines_for_patient(&state, paciente_id).await?;

    Ok(Json(ApiOk::new(PatientBilling {
        paciente,
        resumen: BillingSummary::from_lines(&citas),
        citas,
    })))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(paciente_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<Invoice>>, ApiError> {
    auth.ensure_self_or_staff(paciente_id)?;

    let paciente = billing_patient(&state, paciente_id).await?;
    let lines = charge_lines_for_patient(&state, paciente_id).await?;

    let tratamientos: Vec<InvoiceTreatment> = sqlx::query_as::<_, InvoiceTreatment>(
        r#"
        SELECT a.tratamiento_id, t.nombre, a.precio, p.nombre AS estado
        FROM tratamientos_usuarios a
        JOIN tratamientos t ON t.id = a.tratamiento_id
        JOIN parametros p ON p.id = a.estado_id
        WHERE a.paciente_id = $1 AND a.eliminado = -1
        ORDER BY a.asignado_en ASC, a.id ASC
        "#,
    )
    .bind(paciente_id)
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    let invoice = build_invoice(Utc::now().date_naive(), paciente, lines, tratamientos);
    Ok(Json(ApiOk::new(invoice)))
}

/* ============================================================
   Payments
   ============================================================ */

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedAmount {
    pub cita_id: Uuid,
    pub monto_aplicado: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PaymentRow {
    pub id: Uuid,
    pub paciente_id: Uuid,
    pub paciente_nombre: String,
    pub monto: i64,
    pub fecha: DateTime<Utc>,
    pub metodo_pago_id: i32,
    pub metodo_pago: String,
    #[sqlx(try_from = "String")]
    pub estado: PaymentStatus,
    pub observaciones: Option<String>,
    pub registrado_por: Uuid,
    pub citas: Jsonb<Vec<AppliedAmount>>,
}

const PAYMENT_SELECT: &str = r#"
    SELECT p.id, p.paciente_id, (u.nombres || ' ' || u.apellidos) AS paciente_nombre,
           p.monto, p.fecha, p.metodo_pago_id, m.nombre AS metodo_pago, e.codigo AS estado,
           p.observaciones, p.registrado_por,
           COALESCE((
               SELECT jsonb_agg(jsonb_build_object('cita_id', pc.cita_id, 'monto_aplicado', pc.monto_aplicado)
                                ORDER BY pc.cita_id)
               FROM pagos_citas pc
               WHERE pc.pago_id = p.id
           ), '[]'::jsonb) AS citas
    FROM pagos p
    JOIN usuarios u ON u.id = p.paciente_id
    JOIN parametros m ON m.id = p.metodo_pago_id
    JOIN parametros e ON e.id = p.estado_id
"#;

#[derive(Debug, Deserialize)]
pub struct PaymentListQuery {
    pub paciente_id: Option<Uuid>,
    pub pagina: Option<i64>,
    pub cantidad_por_pagina: Option<i64>,
}

pub async fn list_payments(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiQuery(q): ApiQuery<PaymentListQuery>,
) -> Result<Json<ApiOk<Paginated<PaymentRow>>>, ApiError> {
    let paciente_id = match auth.role {
        Role::Patient => {
            let me = auth.user_id;
            auth.ensure_self_or_staff(q.paciente_id.unwrap_or(me))?;
            Some(me)
        }
        _ => q.paciente_id,
    };
    let page = PageRequest::new(q.pagina, q.cantidad_por_pagina);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pagos WHERE ($1::uuid IS NULL OR paciente_id = $1)",
    )
    .bind(paciente_id)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;

    let rows: Vec<PaymentRow> = sqlx::query_as::<_, PaymentRow>(&format!(
        r#"
        {PAYMENT_SELECT}
        WHERE ($1::uuid IS NULL OR p.paciente_id = $1)
        ORDER BY p.fecha DESC, p.id ASC
        LIMIT $2 OFFSET $3
        "#
    ))
    .bind(paciente_id)
    .bind(page.limit())
    .bind(page.offset())
    .fetch_all(&state.db)
    .await
    .map_err(ApiError::db)?;

    Ok(Json(ApiOk::new(Paginated::new(rows, total, page))))
}

#[derive(Debug, Deserialize)]
pub struct RegisterPaymentRequest {
    #[serde(default)]
    pub cita_ids: Vec<Uuid>,
    pub metodo_pago_id: Option<i32>,
    pub observaciones: Option<String>,
    pub monto: Option<i64>,
}

#[derive(Debug, PartialEq)]
struct PaymentInput {
    cita_ids: Vec<Uuid>,
    metodo_pago_id: i32,
    observaciones: Option<String>,
    monto: Option<i64>,
}

fn validate_payment(req: RegisterPaymentRequest) -> Result<PaymentInput, ApiError> {
    if req.cita_ids.is_empty() {
        return Err(ApiError::validation("at least one appointment must be selected"));
    }
    let metodo_pago_id = req
        .metodo_pago_id
        .ok_or_else(|| ApiError::validation("metodo_pago_id is required"))?;
    if req.monto.is_some_and(|m| m <= 0) {
        return Err(ApiError::validation("monto must be greater than 0"));
    }

    let mut seen = HashSet::new();
    let cita_ids: Vec<Uuid> = req.cita_ids.into_iter().filter(|id| seen.insert(*id)).collect();

    Ok(PaymentInput {
        cita_ids,
        metodo_pago_id,
        observaciones: req
            .observaciones
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        monto: req.monto,
    })
}

/// The selected appointments must all exist, belong to one patient and not be cancelled.
fn single_patient(
    requested: &[Uuid],
    found: &[(Uuid, Uuid, String)],
) -> Result<Uuid, ApiError> {
    if let Some(missing) = requested.iter().find(|id| !found.iter().any(|(c, _, _)| c == *id)) {
        return Err(ApiError::NotFound(
            "NOT_FOUND",
            format!("appointment {missing} not found"),
        ));
    }
    if let Some((c, _, _)) = found
        .iter()
        .find(|(_, _, estado)| estado == AppointmentStatus::Cancelled.code())
    {
        return Err(ApiError::validation(format!(
            "appointment {c} is cancelled and cannot be paid"
        )));
    }

    let mut patients = found.iter().map(|(_, p, _)| *p);
    let first = patients
        .next()
        .ok_or_else(|| ApiError::validation("at least one appointment must be selected"))?;
    if patients.any(|p| p != first) {
        return Err(ApiError::validation(
            "all appointments in a payment must belong to the same patient",
        ));
    }
    Ok(first)
}

pub async fn register_payment(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(req): ApiJson<RegisterPaymentRequest>,
) -> Result<Json<ApiOk<PaymentRow>>, ApiError> {
    auth.ensure_staff()?;
    let input = validate_payment(req)?;

    let method_ok: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM parametros p
            JOIN tipos_parametros t ON t.id = p.tipo_parametro_id
            WHERE p.id = $1 AND t.codigo = $2
        )
        "#,
    )
    .bind(input.metodo_pago_id)
    .bind(param_type::PAYMENT_METHOD)
    .fetch_one(&state.db)
    .await
    .map_err(ApiError::db)?;
    if !method_ok {
        return Err(ApiError::validation("metodo_pago_id is not a payment method"));
    }

    let mut tx = state.db.begin().await.map_err(ApiError::db)?;

    // row locks keep two cashiers from paying the same balance twice
    let found: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
        r#"
        SELECT c.id, c.paciente_id, e.codigo
        FROM citas c
        JOIN parametros e ON e.id = c.estado_id
        WHERE c.id = ANY($1)
        FOR UPDATE OF c
        "#,
    )
    .bind(&input.cita_ids)
    .fetch_all(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let paciente_id = single_patient(&input.cita_ids, &found)?;

    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("");
    charges_cte(&mut qb);
    qb.push("SELECT cita_id, fecha, hora_inicio, motivo, tratamiento, valor, pagado FROM cargos WHERE cita_id = ANY(");
    qb.push_bind(input.cita_ids.clone());
    qb.push(")");
    let lines: Vec<ChargeLine> = qb
        .build_query_as::<ChargeLine>()
        .fetch_all(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    let alloc = allocate_payment(&lines, input.monto)?;

    let pago_id: Uuid = sqlx::query_scalar(&format!(
        r#"
        INSERT INTO pagos (paciente_id, monto, metodo_pago_id, estado_id, observaciones, registrado_por)
        VALUES ($1, $2, $3, {estado}, $6, $7)
        RETURNING id
        "#,
        estado = param_id_sql("$4", "$5"),
    ))
    .bind(paciente_id)
    .bind(alloc.monto)
    .bind(input.metodo_pago_id)
    .bind(param_type::PAYMENT_STATUS)
    .bind(alloc.estado.code())
    .bind(&input.observaciones)
    .bind(auth.user_id)
    .fetch_one(&mut *tx)
    .await
    .map_err(ApiError::db)?;

    let mut insert: QueryBuilder<Postgres> =
        QueryBuilder::new("INSERT INTO pagos_citas (pago_id, cita_id, monto_aplicado) ");
    insert.push_values(&alloc.por_cita, |mut b, (cita_id, monto)| {
        b.push_bind(pago_id).push_bind(*cita_id).push_bind(*monto);
    });
    insert
        .build()
        .execute(&mut *tx)
        .await
        .map_err(ApiError::db)?;

    tx.commit().await.map_err(ApiError::db)?;

    tracing::info!(
        pago_id = %pago_id,
        paciente_id = %paciente_id,
        monto = alloc.monto,
        estado = %alloc.estado,
        citas = alloc.por_cita.len(),
        registrado_por = %auth.user_id,
        "payment registered"
    );

    let row = sqlx::query_as::<_, PaymentRow>(&format!("{PAYMENT_SELECT} WHERE p.id = $1"))
        .bind(pago_id)
        .fetch_one(&state.db)
        .await
        .map_err(ApiError::db)?;

    Ok(Json(ApiOk::with_message("Payment registered", row)))
}
