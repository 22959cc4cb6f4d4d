use argon2::{
    Argon2,
    PasswordHasher,
};
use argon2::password_hash::{SaltString, rand_core::OsRng};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Role;

/// Hash a new password using Argon2id with a random salt.
/// Store the returned string in usuarios.password_hash.
pub fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|phc| phc.to_string())
        .map_err(|e| format!("argon2 hash error: {e}"))
}

/// Claims issued by the identity service. Older tokens carry `rol`, newer ones `role`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token rejected: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token has no role claim")]
    MissingRole,
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// Verify an HS256 access token and extract `(user_id, role)`.
pub fn decode_access_token(token: &str, secret: &str) -> Result<(Uuid, Role), TokenError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    let raw = data
        .claims
        .role
        .or(data.claims.rol)
        .ok_or(TokenError::MissingRole)?;
    let role = normalize_role_claim(&raw).ok_or(TokenError::UnknownRole(raw))?;
    Ok((data.claims.sub, role))
}

/// Lowercase, drop accents, then apply the historical aliases
/// (`odontologo -> doctor`, `administrador -> admin`).
pub fn normalize_role_claim(raw: &str) -> Option<Role> {
    let folded: String = raw.trim().to_lowercase().chars().map(strip_accent).collect();
    match folded.as_str() {
        "paciente" | "patient" => Some(Role::Patient),
        "odontologo" | "doctor" => Some(Role::Doctor),
        "auxiliar" | "auxiliary" | "assistant" => Some(Role::Auxiliary),
        "administrador" | "admin" => Some(Role::Admin),
        _ => None,
    }
}

fn strip_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'ä' | 'â' => 'a',
        'é' | 'è' | 'ë' | 'ê' => 'e',
        'í' | 'ì' | 'ï' | 'î' => 'i',
        'ó' | 'ò' | 'ö' | 'ô' => 'o',
        'ú' | 'ù' | 'ü' | 'û' => 'u',
        'ñ' => 'n',
        other => other,
    }
}

#[cfg(test)]
pub(crate) fn token_for_tests(user_id: Uuid, role: &str, secret: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header};

    let claims = AccessClaims {
        sub: user_id,
        rol: None,
        role: Some(role.to_string()),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("encode test token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn role_claims_are_normalized() {
        assert_eq!(normalize_role_claim("Odontólogo"), Some(Role::Doctor));
        assert_eq!(normalize_role_claim("ADMINISTRADOR"), Some(Role::Admin));
        assert_eq!(normalize_role_claim(" paciente "), Some(Role::Patient));
        assert_eq!(normalize_role_claim("Auxiliar"), Some(Role::Auxiliary));
        assert_eq!(normalize_role_claim("doctor"), Some(Role::Doctor));
        assert_eq!(normalize_role_claim("recepcionista"), None);
    }

    #[test]
    fn decodes_valid_token() {
        let id = Uuid::new_v4();
        let token = token_for_tests(id, "Odontólogo", SECRET);
        let (sub, role) = decode_access_token(&token, SECRET).unwrap();
        assert_eq!(sub, id);
        assert_eq!(role, Role::Doctor);
    }

    #[test]
    fn legacy_rol_claim_is_accepted() {
        let claims = AccessClaims {
            sub: Uuid::new_v4(),
            rol: Some("administrador".into()),
            role: None,
            exp: (chrono::Utc::now().timestamp() + 60) as usize,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        let (_, role) = decode_access_token(&token, SECRET).unwrap();
        assert_eq!(role, Role::Admin);
    }

    #[test]
    fn rejects_wrong_secret_and_expired_tokens() {
        let token = token_for_tests(Uuid::new_v4(), "paciente", SECRET);
        assert!(matches!(
            decode_access_token(&token, "other-secret"),
            Err(TokenError::Invalid(_))
        ));

        let claims = AccessClaims {
            sub: Uuid::new_v4(),
            rol: None,
            role: Some("paciente".into()),
            exp: (chrono::Utc::now().timestamp() - 3600) as usize,
        };
        let expired = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(decode_access_token(&expired, SECRET).is_err());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let token = token_for_tests(Uuid::new_v4(), "recepcionista", SECRET);
        assert!(matches!(
            decode_access_token(&token, SECRET),
            Err(TokenError::UnknownRole(_))
        ));
    }

    #[test]
    fn hash_password_produces_argon2_phc() {
        let phc = hash_password("correct horse").unwrap();
        assert!(phc.starts_with("$argon2"));
    }
}
