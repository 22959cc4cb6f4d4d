use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use uuid::Uuid;

use crate::auth::decode_access_token;
use crate::error::ApiError;
use crate::models::{AppState, Role};

/// Caller identity for one request, taken from the bearer token.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }

    pub fn ensure_staff(&self) -> Result<(), ApiError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(ApiError::forbidden("Only clinic staff can perform this action"))
        }
    }

    pub fn ensure_admin(&self) -> Result<(), ApiError> {
        if self.role == Role::Admin {
            Ok(())
        } else {
            Err(ApiError::forbidden("admin only"))
        }
    }

    /// Staff may act on any patient; a patient only on themselves.
    pub fn ensure_self_or_staff(&self, patient_id: Uuid) -> Result<(), ApiError> {
        if self.is_staff() || self.user_id == patient_id {
            Ok(())
        } else {
            Err(ApiError::forbidden("Patients can only access their own records"))
        }
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::invalid_token())?;

            let (user_id, role) = decode_access_token(authz.token(), &state.jwt_secret)
                .map_err(|e| {
                    tracing::debug!(error = %e, "rejected access token");
                    ApiError::invalid_token()
                })?;

            Ok(AuthContext { user_id, role })
        }
    }
}
