//! Ledger arithmetic: balances, payment allocation and the invoice projection.

use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::PaymentStatus;

/// One billable appointment with what has been paid against it so far.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChargeLine {
    pub cita_id: Uuid,
    pub fecha: NaiveDate,
    pub hora_inicio: NaiveTime,
    pub motivo: String,
    pub tratamiento: Option<String>,
    pub valor: i64,
    pub pagado: i64,
}

impl ChargeLine {
    pub fn pendiente(&self) -> i64 {
        (self.valor - self.pagado).max(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BillingSummary {
    pub total_facturado: i64,
    pub total_pagado: i64,
    pub saldo_pendiente: i64,
}

impl BillingSummary {
    pub fn from_totals(total_facturado: i64, total_pagado: i64) -> Self {
        Self {
            total_facturado,
            total_pagado,
            saldo_pendiente: (total_facturado - total_pagado).max(0),
        }
    }

    pub fn from_lines(lines: &[ChargeLine]) -> Self {
        let facturado = lines.iter().map(|l| l.valor).sum();
        let pagado = lines.iter().map(|l| l.pagado).sum();
        Self::from_totals(facturado, pagado)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub monto: i64,
    pub estado: PaymentStatus,
    /// `(cita_id, monto_aplicado)`, only non-zero entries.
    pub por_cita: Vec<(Uuid, i64)>,
}

/// Split a payment over the selected appointments, oldest first.
///
/// Without `monto` every selected appointment is settled in full. With a
/// `monto` smaller than the outstanding total the remainder stays pending on
/// the most recent appointments.
pub fn allocate_payment(lines: &[ChargeLine], monto: Option<i64>) -> Result<Allocation, ApiError> {
    if lines.is_empty() {
        return Err(ApiError::validation("at least one appointment must be selected"));
    }
    if let Some(paid) = lines.iter().find(|l| l.pendiente() == 0) {
        return Err(ApiError::Conflict(
            "ALREADY_PAID",
            format!("appointment {} has no pending balance", paid.cita_id),
        ));
    }

    let mut ordered: Vec<&ChargeLine> = lines.iter().collect();
    ordered.sort_by_key(|l| (l.fecha, l.hora_inicio, l.cita_id));

    let outstanding: i64 = ordered.iter().map(|l| l.pendiente()).sum();
    let monto = match monto {
        None => outstanding,
        Some(m) if m <= 0 => {
            return Err(ApiError::validation("monto must be greater than 0"));
        }
        Some(m) if m > outstanding => {
            return Err(ApiError::validation(format!(
                "monto {m} exceeds the pending balance {outstanding}"
            )));
        }
        Some(m) => m,
    };

    let mut remaining = monto;
    let mut por_cita = Vec::with_capacity(ordered.len());
    for line in ordered {
        if remaining == 0 {
            break;
        }
        let applied = line.pendiente().min(remaining);
        por_cita.push((line.cita_id, applied));
        remaining -= applied;
    }

    let estado = if monto == outstanding {
        PaymentStatus::Completed
    } else {
        PaymentStatus::Partial
    };

    Ok(Allocation {
        monto,
        estado,
        por_cita,
    })
}

/* ============================================================
   Invoice
   ============================================================ */

#[derive(Debug, Clone, Serialize)]
pub struct InvoicePatient {
    pub id: Uuid,
    pub nombre: String,
    pub email: String,
    pub identificacion: Option<String>,
    pub telefono: Option<String>,
    pub direccion: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceTreatment {
    pub tratamiento_id: Uuid,
    pub nombre: String,
    pub precio: i64,
    pub estado: String,
}

#[derive(Debug, Serialize)]
pub struct InvoiceLine {
    pub cita_id: Uuid,
    pub fecha: NaiveDate,
    pub descripcion: String,
    pub valor: i64,
    pub pagado: i64,
    pub pendiente: i64,
}

#[derive(Debug, Serialize)]
pub struct Invoice {
    pub numero: String,
    pub emitida: NaiveDate,
    pub paciente: InvoicePatient,
    pub lineas: Vec<InvoiceLine>,
    pub tratamientos: Vec<InvoiceTreatment>,
    pub resumen: BillingSummary,
}

pub fn build_invoice(
    emitida: NaiveDate,
    paciente: InvoicePatient,
    mut lines: Vec<ChargeLine>,
    tratamientos: Vec<InvoiceTreatment>,
) -> Invoice {
    lines.sort_by_key(|l| (l.fecha, l.hora_inicio));
    let resumen = BillingSummary::from_lines(&lines);
    let short_id: String = paciente.id.simple().to_string().chars().take(8).collect();

    Invoice {
        numero: format!("FAC-{}-{}", emitida.format("%Y%m%d"), short_id.to_uppercase()),
        emitida,
        lineas: lines
            .into_iter()
            .map(|l| InvoiceLine {
                cita_id: l.cita_id,
                fecha: l.fecha,
                descripcion: match &l.tratamiento {
                    Some(t) => format!("{} ({t})", l.motivo),
                    None => l.motivo.clone(),
                },
                valor: l.valor,
                pagado: l.pagado,
                pendiente: l.pendiente(),
            })
            .collect(),
        paciente,
        tratamientos,
        resumen,
    }
}
