//! Clinical intake record: ten fixed sections saved as one document per patient.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const MAX_FIELD_KEY: usize = 120;
pub const MAX_FIELD_VALUE: usize = 4000;

/// Free-text section: field name -> value.
pub type TextSection = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    #[serde(rename = "Sí")]
    Yes,
    #[serde(rename = "No")]
    No,
    #[serde(rename = "No sabe")]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Finding {
    Normal,
    Anormal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnamnesisAnswer {
    pub respuesta: Answer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observacion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamFinding {
    pub resultado: Finding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observacion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiagnosisSections {
    pub informacion_personal: TextSection,
    pub informacion_acudiente: TextSection,
    pub antecedentes_medicos: TextSection,
    pub informacion_tratamiento: TextSection,
    pub anamnesis: BTreeMap<String, AnamnesisAnswer>,
    pub examen_fisico: BTreeMap<String, ExamFinding>,
    pub odontograma_superior: TextSection,
    pub odontograma_inferior: TextSection,
    pub plan_tratamiento: TextSection,
    pub resumen: TextSection,
}

fn check_key(section: &str, key: &str) -> Result<(), ApiError> {
    if key.trim().is_empty() {
        return Err(ApiError::validation(format!("{section}: empty field name")));
    }
    if key.len() > MAX_FIELD_KEY {
        return Err(ApiError::validation(format!("{section}: field name too long")));
    }
    Ok(())
}

fn check_value(section: &str, key: &str, value: &str) -> Result<(), ApiError> {
    if value.len() > MAX_FIELD_VALUE {
        return Err(ApiError::validation(format!(
            "{section}.{key} is too long (max {MAX_FIELD_VALUE})"
        )));
    }
    Ok(())
}

fn check_text(section: &str, fields: &TextSection) -> Result<(), ApiError> {
    for (k, v) in fields {
        check_key(section, k)?;
        check_value(section, k, v)?;
    }
    Ok(())
}

impl DiagnosisSections {
    /// Field-level checks. Values are stored exactly as submitted.
    pub fn validate(&self) -> Result<(), ApiError> {
        check_text("informacion_personal", &self.informacion_personal)?;
        check_text("informacion_acudiente", &self.informacion_acudiente)?;
        check_text("antecedentes_medicos", &self.antecedentes_medicos)?;
        check_text("informacion_tratamiento", &self.informacion_tratamiento)?;
        for (k, a) in &self.anamnesis {
            check_key("anamnesis", k)?;
            if let Some(obs) = &a.observacion {
                check_value("anamnesis", k, obs)?;
            }
        }
        for (k, f) in &self.examen_fisico {
            check_key("examen_fisico", k)?;
            if let Some(obs) = &f.observacion {
                check_value("examen_fisico", k, obs)?;
            }
        }
        check_text("odontograma_superior", &self.odontograma_superior)?;
        check_text("odontograma_inferior", &self.odontograma_inferior)?;
        check_text("plan_tratamiento", &self.plan_tratamiento)?;
        check_text("resumen", &self.resumen)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_json() -> serde_json::Value {
        json!({
            "informacion_personal": { "ocupacion": "Docente", "estado_civil": "Soltera" },
            "informacion_acudiente": {},
            "antecedentes_medicos": { "alergias": "Penicilina" },
            "informacion_tratamiento": { "motivo_consulta": "Dolor molar" },
            "anamnesis": {
                "hipertension": { "respuesta": "No" },
                "diabetes": { "respuesta": "No sabe" },
                "embarazo": { "respuesta": "Sí", "observacion": "12 semanas" }
            },
            "examen_fisico": {
                "labios": { "resultado": "Normal" },
                "encias": { "resultado": "Anormal", "observacion": "inflamación" }
            },
            "odontograma_superior": { "16": "caries oclusal" },
            "odontograma_inferior": { "36": "obturado" },
            "plan_tratamiento": { "fase_1": "Profilaxis" },
            "resumen": { "notas": "Control en 6 meses" }
        })
    }

    #[test]
    fn sections_round_trip_unchanged() {
        let input = sample_json();
        let parsed: DiagnosisSections = serde_json::from_value(input.clone()).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.anamnesis["embarazo"].respuesta, Answer::Yes);
        assert_eq!(parsed.examen_fisico["encias"].resultado, Finding::Anormal);
        assert_eq!(serde_json::to_value(&parsed).unwrap(), input);
    }

    #[test]
    fn unknown_answers_and_sections_are_rejected() {
        let mut bad = sample_json();
        bad["anamnesis"]["diabetes"]["respuesta"] = json!("Tal vez");
        assert!(serde_json::from_value::<DiagnosisSections>(bad).is_err());

        let mut extra = sample_json();
        extra["seccion_extra"] = json!({});
        assert!(serde_json::from_value::<DiagnosisSections>(extra).is_err());

        let mut missing = sample_json();
        missing.as_object_mut().unwrap().remove("resumen");
        assert!(serde_json::from_value::<DiagnosisSections>(missing).is_err());
    }

    #[test]
    fn validate_checks_keys_and_lengths() {
        let mut s: DiagnosisSections = serde_json::from_value(sample_json()).unwrap();
        s.resumen.insert(" ".into(), "x".into());
        assert!(s.validate().is_err());

        let mut s: DiagnosisSections = serde_json::from_value(sample_json()).unwrap();
        s.plan_tratamiento
            .insert("fase_2".into(), "x".repeat(MAX_FIELD_VALUE + 1));
        assert!(s.validate().is_err());
    }
}
