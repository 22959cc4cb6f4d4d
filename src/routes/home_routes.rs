use axum::{Json, Router, routing::get};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::auth_context::AuthContext;
use crate::models::{ApiOk, AppState, Role};

/// What the client shell needs to pick a dashboard for the token it holds.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HomeData {
    pub usuario_id: Uuid,
    pub rol: Role,
    pub vista: &'static str,
    pub permisos: Permissions,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Permissions {
    pub gestionar_citas: bool,
    pub gestionar_pacientes: bool,
    pub gestionar_personal: bool,
    pub gestionar_tratamientos: bool,
    pub registrar_pagos: bool,
    pub atender_soporte: bool,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/inicio", get(home))
}

fn home_for(auth: &AuthContext) -> HomeData {
    let vista = match auth.role {
        Role::Patient => "paciente",
        Role::Doctor => "odontologo",
        Role::Auxiliary => "auxiliar",
        Role::Admin => "admin",
    };
    let staff = auth.is_staff();

    HomeData {
        usuario_id: auth.user_id,
        rol: auth.role,
        vista,
        permisos: Permissions {
            gestionar_citas: staff,
            gestionar_pacientes: staff,
            gestionar_personal: auth.role == Role::Admin,
            gestionar_tratamientos: staff,
            registrar_pagos: staff,
            atender_soporte: staff,
        },
    }
}

pub async fn home(auth: AuthContext) -> Result<Json<ApiOk<HomeData>>, ApiError> {
    Ok(Json(ApiOk::new(home_for(&auth))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_follows_role() {
        let patient = AuthContext {
            user_id: Uuid::new_v4(),
            role: Role::Patient,
        };
        let h = home_for(&patient);
        assert_eq!(h.vista, "paciente");
        assert!(!h.permisos.gestionar_citas);

        let doctor = AuthContext {
            user_id: Uuid::new_v4(),
            role: Role::Doctor,
        };
        let h = home_for(&doctor);
        assert_eq!(h.vista, "odontologo");
        assert!(h.permisos.registrar_pagos);
        assert!(h.permisos.gestionar_pacientes);
        assert!(!h.permisos.gestionar_personal);
    }
}
