use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    pub exp: Option<u64>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub app_metadata: Option<serde_json::Value>,
    pub user_metadata: Option<serde_json::Value>,
    pub aud: Option<String>,
    pub iat: Option<u64>,
}

impl JwtClaims {
    /// Tenant the token was issued for, taken from `app_metadata.company_id`.
    /// Users cannot edit app metadata themselves, so it is safe to trust.
    pub fn company_id(&self) -> Option<Uuid> {
        self.app_metadata
            .as_ref()
            .and_then(|meta| meta.get("company_id"))
            .and_then(|value| value.as_str())
            .and_then(|raw| Uuid::parse_str(raw).ok())
    }
}

/// Authenticated staff member or patient, inserted into request extensions
/// by the auth middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub company_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn user_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.id).ok()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.role.as_deref() == Some(role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_company_id_from_app_metadata() {
        let company = Uuid::new_v4();
        let claims = JwtClaims {
            sub: Uuid::new_v4().to_string(),
            exp: None,
            email: None,
            role: Some("receptionist".to_string()),
            app_metadata: Some(json!({ "company_id": company.to_string() })),
            user_metadata: None,
            aud: None,
            iat: None,
        };

        assert_eq!(claims.company_id(), Some(company));
    }

    #[test]
    fn test_company_id_missing_or_malformed() {
        let claims = JwtClaims {
            sub: "user".to_string(),
            exp: None,
            email: None,
            role: None,
            app_metadata: Some(json!({ "company_id": "not-a-uuid" })),
            user_metadata: None,
            aud: None,
            iat: None,
        };

        assert_eq!(claims.company_id(), None);
    }
}
