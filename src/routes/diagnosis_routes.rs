// src/routes/diagnosis_routes.rs

use std::collections::BTreeMap;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::types::Json as Jsonb;
use uuid::Uuid;

use crate::{
    diagnosis::{AnamnesisAnswer, DiagnosisSections, ExamFinding, TextSection},
    error::{is_unique_violation, ApiError},
    extract::{ApiJson, ApiPath},
    middleware::auth_context::AuthContext,
    models::{ApiOk, AppState, Role},
    routes::user_routes::fetch_active_user_with_role,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/diagnosticos", post(create_diagnosis))
        .route(
            "/diagnosticos/{paciente_id}",
            get(get_diagnosis).put(update_diagnosis),
        )
}

#[derive(Debug, sqlx::FromRow)]
struct DiagnosisRow {
    id: Uuid,
    paciente_id: Uuid,
    informacion_personal: Jsonb<TextSection>,
    informacion_acudiente: Jsonb<TextSection>,
    antecedentes_medicos: Jsonb<TextSection>,
    informacion_tratamiento: Jsonb<TextSection>,
    anamnesis: Jsonb<BTreeMap<String, AnamnesisAnswer>>,
    examen_fisico: Jsonb<BTreeMap<String, ExamFinding>>,
    odontograma_superior: Jsonb<TextSection>,
    odontograma_inferior: Jsonb<TextSection>,
    plan_tratamiento: Jsonb<TextSection>,
    resumen: Jsonb<TextSection>,
    creado_por: Option<Uuid>,
    creado_en: DateTime<Utc>,
    actualizado_en: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosisRecord {
    pub id: Uuid,
    pub paciente_id: Uuid,
    #[serde(flatten)]
    pub secciones: DiagnosisSections,
    pub creado_por: Option<Uuid>,
    pub creado_en: DateTime<Utc>,
    pub actualizado_en: DateTime<Utc>,
}

impl From<DiagnosisRow> for DiagnosisRecord {
    fn from(r: DiagnosisRow) -> Self {
        DiagnosisRecord {
            id: r.id,
            paciente_id: r.paciente_id,
            secciones: DiagnosisSections {
                informacion_personal: r.informacion_personal.0,
                informacion_acudiente: r.informacion_acudiente.0,
                antecedentes_medicos: r.antecedentes_medicos.0,
                informacion_tratamiento: r.informacion_tratamiento.0,
                anamnesis: r.anamnesis.0,
                examen_fisico: r.examen_fisico.0,
                odontograma_superior: r.odontograma_superior.0,
                odontograma_inferior: r.odontograma_inferior.0,
                plan_tratamiento: r.plan_tratamiento.0,
                resumen: r.resumen.0,
            },
            creado_por: r.creado_por,
            creado_en: r.creado_en,
            actualizado_en: r.actualizado_en,
        }
    }
}

const DIAGNOSIS_COLUMNS: &str = r#"
    id, paciente_id, informacion_personal, informacion_acudiente, antecedentes_medicos,
    informacion_tratamiento, anamnesis, examen_fisico, odontograma_superior,
    odontograma_inferior, plan_tratamiento, resumen, creado_por, creado_en, actualizado_en
"#;

fn diagnosis_not_found() -> ApiError {
    ApiError::NotFound("DIAGNOSIS_NOT_FOUND", "diagnosis not found".into())
}

/// Parses a payload of the ten sections. `paciente_id` is accepted and
/// removed first so the sections themselves stay strict about unknown keys.
fn parse_sections(mut body: Value) -> Result<(Option<Uuid>, DiagnosisSections), ApiError> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| ApiError::validation("body must be a JSON object"))?;

    let paciente_id = match obj.remove("paciente_id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            serde_json::from_value::<Uuid>(v)
                .map_err(|_| ApiError::validation("paciente_id must be a UUID"))?,
        ),
    };

    let sections: DiagnosisSections = serde_json::from_value(body)
        .map_err(|e| ApiError::validation(format!("invalid diagnosis payload: {e}")))?;
    sections.validate()?;
    Ok((paciente_id, sections))
}

pub async fn get_diagnosis(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(paciente_id): ApiPath<Uuid>,
) -> Result<Json<ApiOk<DiagnosisRecord>>, ApiError> {
    auth.ensure_self_or_staff(paciente_id)?;

    let row = sqlx::query_as::<_, DiagnosisRow>(&format!(
        "SELECT {DIAGNOSIS_COLUMNS} FROM diagnosticos WHERE paciente_id = $1"
    ))
    .bind(paciente_id)
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(diagnosis_not_found)?;

    Ok(Json(ApiOk::new(row.into())))
}

pub async fn create_diagnosis(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiJson(body): ApiJson<Value>,
) -> Result<Json<ApiOk<DiagnosisRecord>>, ApiError> {
    auth.ensure_staff()?;
    let (paciente_id, s) = parse_sections(body)?;
    let paciente_id = paciente_id.ok_or_else(|| ApiError::validation("paciente_id is required"))?;

    fetch_active_user_with_role(&state, paciente_id, Role::Patient).await?;

    let row = sqlx::query_as::<_, DiagnosisRow>(&format!(
        r#"
        INSERT INTO diagnosticos (
            paciente_id, informacion_personal, informacion_acudiente, antecedentes_medicos,
            informacion_tratamiento, anamnesis, examen_fisico, odontograma_superior,
            odontograma_inferior, plan_tratamiento, resumen, creado_por
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        RETURNING {DIAGNOSIS_COLUMNS}
        "#
    ))
    .bind(paciente_id)
    .bind(Jsonb(&s.informacion_personal))
    .bind(Jsonb(&s.informacion_acudiente))
    .bind(Jsonb(&s.antecedentes_medicos))
    .bind(Jsonb(&s.informacion_tratamiento))
    .bind(Jsonb(&s.anamnesis))
    .bind(Jsonb(&s.examen_fisico))
    .bind(Jsonb(&s.odontograma_superior))
    .bind(Jsonb(&s.odontograma_inferior))
    .bind(Jsonb(&s.plan_tratamiento))
    .bind(Jsonb(&s.resumen))
    .bind(auth.user_id)
    .fetch_one(&state.db)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            ApiError::Conflict(
                "DIAGNOSIS_EXISTS",
                "a diagnosis already exists for this patient".into(),
            )
        } else {
            ApiError::db(e)
        }
    })?;

    tracing::info!(paciente_id = %paciente_id, autor = %auth.user_id, "diagnosis created");
    Ok(Json(ApiOk::with_message("Diagnosis created", row.into())))
}

pub async fn update_diagnosis(
    State(state): State<AppState>,
    auth: AuthContext,
    ApiPath(paciente_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<Value>,
) -> Result<Json<ApiOk<DiagnosisRecord>>, ApiError> {
    auth.ensure_staff()?;
    let (body_patient, s) = parse_sections(body)?;
    if body_patient.is_some_and(|id| id != paciente_id) {
        return Err(ApiError::validation("paciente_id does not match the path"));
    }

    let row = sqlx::query_as::<_, DiagnosisRow>(&format!(
        r#"
        UPDATE diagnosticos
        SET informacion_personal = $2,
            informacion_acudiente = $3,
            antecedentes_medicos = $4,
            informacion_tratamiento = $5,
            anamnesis = $6,
            examen_fisico = $7,
            odontograma_superior = $8,
            odontograma_inferior = $9,
            plan_tratamiento = $10,
            resumen = $11,
            actualizado_en = now()
        WHERE paciente_id = $1
        RETURNING {DIAGNOSIS_COLUMNS}
        "#
    ))
    .bind(paciente_id)
    .bind(Jsonb(&s.informacion_personal))
    .bind(Jsonb(&s.informacion_acudiente))
    .bind(Jsonb(&s.antecedentes_medicos))
    .bind(Jsonb(&s.informacion_tratamiento))
    .bind(Jsonb(&s.anamnesis))
    .bind(Jsonb(&s.examen_fisico))
    .bind(Jsonb(&s.odontograma_superior))
    .bind(Jsonb(&s.odontograma_inferior))
    .bind(Jsonb(&s.plan_tratamiento))
    .bind(Jsonb(&s.resumen))
    .fetch_optional(&state.db)
    .await
    .map_err(ApiError::db)?
    .ok_or_else(diagnosis_not_found)?;

    tracing::info!(paciente_id = %paciente_id, autor = %auth.user_id, "diagnosis replaced");
    Ok(Json(ApiOk::with_message("Diagnosis updated", row.into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> Value {
        json!({
            "paciente_id": "7d6f1a52-9b1e-4a55-8d33-2f1f0c6a9e10",
            "informacion_personal": { "ocupacion": "Ingeniero" },
            "informacion_acudiente": {},
            "antecedentes_medicos": {},
            "informacion_tratamiento": {},
            "anamnesis": { "asma": { "respuesta": "No" } },
            "examen_fisico": { "lengua": { "resultado": "Normal" } },
            "odontograma_superior": {},
            "odontograma_inferior": {},
            "plan_tratamiento": {},
            "resumen": {}
        })
    }

    #[test]
    fn patient_id_is_split_from_sections() {
        let (id, s) = parse_sections(payload()).unwrap();
        assert_eq!(
            id,
            Some(Uuid::parse_str("7d6f1a52-9b1e-4a55-8d33-2f1f0c6a9e10").unwrap())
        );
        assert_eq!(s.informacion_personal["ocupacion"], "Ingeniero");
    }

    #[test]
    fn malformed_payloads_are_validation_errors() {
        let mut bad_id = payload();
        bad_id["paciente_id"] = json!("no-es-uuid");
        assert_eq!(parse_sections(bad_id).unwrap_err().code(), "VALIDATION_ERROR");

        let mut extra = payload();
        extra["notas_sueltas"] = json!("x");
        assert_eq!(parse_sections(extra).unwrap_err().code(), "VALIDATION_ERROR");

        assert!(parse_sections(json!([1, 2])).is_err());
    }

    #[test]
    fn record_flattens_sections() {
        let (_, s) = parse_sections(payload()).unwrap();
        let record = DiagnosisRecord {
            id: Uuid::new_v4(),
            paciente_id: Uuid::new_v4(),
            secciones: s,
            creado_por: None,
            creado_en: Utc::now(),
            actualizado_en: Utc::now(),
        };
        let v = serde_json::to_value(&record).unwrap();
        assert_eq!(v["anamnesis"]["asma"]["respuesta"], "No");
        assert!(v.get("secciones").is_none());
    }
}
