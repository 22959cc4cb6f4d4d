use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub jwt_secret: Arc<str>,
    pub file_server_base_url: Arc<str>,
    pub enforce_doctor_overlap: bool,
}

/* -------------------------
   Response envelope
--------------------------*/

#[derive(Debug, Serialize)]
pub struct ApiOk<T> {
    pub success: bool,
    pub message: String,
    pub data: T,
}

impl<T> ApiOk<T> {
    pub fn new(data: T) -> Self {
        Self::with_message("OK", data)
    }

    pub fn with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }
}

/* -------------------------
   Parameter-backed enums
--------------------------*/

/// A stored code that does not match any known variant.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} code: {code}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: String,
}

macro_rules! coded_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $code:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> &'static str {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownCode;

            fn try_from(code: String) -> Result<Self, Self::Error> {
                $name::from_code(&code).ok_or(UnknownCode { kind: $kind, code })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.code())
            }
        }
    };
}

coded_enum!(Role, "rol_de_usuario", {
    Patient => "paciente",
    Doctor => "odontologo",
    Auxiliary => "auxiliar",
    Admin => "administrador",
});

coded_enum!(AppointmentStatus, "estado_de_cita", {
    Pending => "pendiente",
    Confirmed => "confirmada",
    Completed => "completada",
    Cancelled => "cancelada",
});

coded_enum!(PaymentStatus, "estado_pago", {
    Completed => "completado",
    Partial => "parcial",
});

coded_enum!(AssignmentStatus, "estado_tratamiento_usuario", {
    InProgress => "en_progreso",
    Completed => "completado",
});

coded_enum!(TicketStatus, "estado_ticket", {
    Open => "abierto",
    InProgress => "en_proceso",
    Closed => "cerrado",
});

coded_enum!(TicketPriority, "prioridad_ticket", {
    Low => "baja",
    Medium => "media",
    High => "alta",
});

/// Parameter category codes in `tipos_parametros`.
pub mod param_type {
    pub const ROLE: &str = "rol_de_usuario";
    pub const APPOINTMENT_STATUS: &str = "estado_de_cita";
    pub const PAYMENT_METHOD: &str = "metodo_pago";
    pub const PAYMENT_STATUS: &str = "estado_pago";
    pub const ASSIGNMENT_STATUS: &str = "estado_tratamiento_usuario";
}

impl Role {
    pub fn is_staff(self) -> bool {
        !matches!(self, Role::Patient)
    }
}

/// Soft-delete state. Stored as the legacy `eliminado` sentinel: -1 active, 1 deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(i16)]
pub enum SoftDelete {
    Active = -1,
    Deleted = 1,
}

impl SoftDelete {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn is_active(self) -> bool {
        self == SoftDelete::Active
    }
}

impl Serialize for SoftDelete {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i16(self.as_i16())
    }
}

/// SQL that resolves a parameter id from `(category, code)` bound at `$n` / `$m`.
pub fn param_id_sql(type_placeholder: &str, code_placeholder: &str) -> String {
    format!(
        "(SELECT p.id FROM parametros p \
         JOIN tipos_parametros t ON t.id = p.tipo_parametro_id \
         WHERE t.codigo = {type_placeholder} AND p.codigo = {code_placeholder})"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for s in AppointmentStatus::ALL {
            assert_eq!(AppointmentStatus::from_code(s.code()), Some(*s));
        }
        for r in Role::ALL {
            assert_eq!(Role::try_from(r.code().to_string()).unwrap(), *r);
        }
        assert!(TicketStatus::try_from("archivado".to_string()).is_err());
    }

    #[test]
    fn serde_uses_parameter_codes() {
        let json = serde_json::to_string(&AppointmentStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelada\"");
        let parsed: TicketStatus = serde_json::from_str("\"en_proceso\"").unwrap();
        assert_eq!(parsed, TicketStatus::InProgress);
    }

    #[test]
    fn soft_delete_keeps_sentinel_values() {
        assert_eq!(SoftDelete::Active.as_i16(), -1);
        assert_eq!(SoftDelete::Deleted.as_i16(), 1);
        assert!(SoftDelete::Active.is_active());
        assert!(!SoftDelete::Deleted.is_active());
        assert_eq!(serde_json::to_string(&SoftDelete::Deleted).unwrap(), "1");
    }

    #[test]
    fn only_patients_are_not_staff() {
        assert!(!Role::Patient.is_staff());
        assert!(Role::Doctor.is_staff());
        assert!(Role::Auxiliary.is_staff());
        assert!(Role::Admin.is_staff());
    }

    #[test]
    fn param_id_sql_embeds_placeholders() {
        let sql = param_id_sql("$1", "$2");
        assert!(sql.contains("t.codigo = $1"));
        assert!(sql.contains("p.codigo = $2"));
    }
}
