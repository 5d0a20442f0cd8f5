use std::sync::Arc;

use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use uuid::Uuid;

use shared_config::{AppConfig, SchedulingSettings};
use shared_models::auth::User;

pub struct TestConfig {
    pub jwt_secret: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "test-secret-key-for-jwt-validation-must-be-long-enough".to_string(),
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
        }
    }
}

impl TestConfig {
    /// Config pointed at a mock PostgREST server, e.g. `wiremock::MockServer::uri()`.
    pub fn with_supabase_url(url: &str) -> Self {
        Self {
            supabase_url: url.to_string(),
            ..Self::default()
        }
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            supabase_service_role_key: Some("test-service-role-key".to_string()),
            supabase_jwt_secret: self.jwt_secret.clone(),
            redis_url: None,
            communications_webhook_url: None,
            port: 0,
            scheduling: SchedulingSettings::default(),
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestUser {
    pub id: String,
    pub email: String,
    pub role: String,
    pub company_id: Option<Uuid>,
}

impl Default for TestUser {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: "test@example.com".to_string(),
            role: "receptionist".to_string(),
            company_id: Some(Uuid::new_v4()),
        }
    }
}

impl TestUser {
    pub fn new(email: &str, role: &str, company_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            role: role.to_string(),
            company_id: Some(company_id),
        }
    }

    pub fn receptionist(email: &str, company_id: Uuid) -> Self {
        Self::new(email, "receptionist", company_id)
    }

    pub fn optometrist(email: &str, company_id: Uuid) -> Self {
        Self::new(email, "optometrist", company_id)
    }

    pub fn dispenser(email: &str, company_id: Uuid) -> Self {
        Self::new(email, "dispenser", company_id)
    }

    /// A user whose token carries no tenant.
    pub fn without_company(email: &str) -> Self {
        Self {
            company_id: None,
            ..Self::new(email, "receptionist", Uuid::nil())
        }
    }

    pub fn to_user(&self) -> User {
        User {
            id: self.id.clone(),
            email: Some(self.email.clone()),
            role: Some(self.role.clone()),
            company_id: self.company_id,
            metadata: None,
            created_at: Some(Utc::now()),
        }
    }
}

pub struct JwtTestUtils;

impl JwtTestUtils {
    pub fn create_test_token(user: &TestUser, secret: &str, exp_hours: Option<i64>) -> String {
        let now = Utc::now();
        let exp = now + Duration::hours(exp_hours.unwrap_or(24));

        let header = json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let app_metadata = match user.company_id {
            Some(company_id) => json!({ "company_id": company_id }),
            None => json!({}),
        };

        let payload = json!({
            "sub": user.id,
            "email": user.email,
            "role": user.role,
            "app_metadata": app_metadata,
            "iat": now.timestamp(),
            "exp": exp.timestamp()
        });

        let header_encoded = general_purpose::URL_SAFE_NO_PAD.encode(header.to_string());
        let payload_encoded = general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string());

        let signing_input = format!("{}.{}", header_encoded, payload_encoded);

        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(signing_input.as_bytes());
        let signature = mac.finalize().into_bytes();
        let signature_encoded = general_purpose::URL_SAFE_NO_PAD.encode(signature);

        format!("{}.{}", signing_input, signature_encoded)
    }

    pub fn create_expired_token(user: &TestUser, secret: &str) -> String {
        Self::create_test_token(user, secret, Some(-1))
    }

    pub fn create_invalid_signature_token(user: &TestUser) -> String {
        Self::create_test_token(user, "wrong-secret", Some(24))
    }

    pub fn create_malformed_token() -> String {
        "invalid.token.format".to_string()
    }
}

/// PostgREST row fixtures.
pub struct MockSupabaseResponses;

impl MockSupabaseResponses {
    pub fn appointment_row(
        id: Uuid,
        company_id: Uuid,
        practitioner_id: Uuid,
        start_time: &str,
        end_time: &str,
        duration_minutes: i64,
        status: &str,
    ) -> serde_json::Value {
        json!({
            "id": id,
            "company_id": company_id,
            "patient_id": Uuid::new_v4(),
            "practitioner_id": practitioner_id,
            "appointment_type": "examination",
            "start_time": start_time,
            "end_time": end_time,
            "duration_minutes": duration_minutes,
            "status": status,
            "location": "Room 1",
            "is_virtual": false,
            "allow_overlap": false,
            "notes": [],
            "checked_in_at": null,
            "created_by": Uuid::new_v4(),
            "updated_by": null,
            "version": 1,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        })
    }

    pub fn waitlist_row(company_id: Uuid, priority: i32, created_at: &str) -> serde_json::Value {
        json!({
            "id": Uuid::new_v4(),
            "company_id": company_id,
            "patient_id": Uuid::new_v4(),
            "appointment_type": "examination",
            "preferred_date": null,
            "preferred_time_range": null,
            "flexibility_days": 3,
            "contact_method": "email",
            "contact_value": "patient@example.com",
            "priority": priority,
            "notes": null,
            "created_at": created_at,
            "fulfilled_appointment_id": null,
            "fulfilled_at": null
        })
    }

    pub fn error_response(message: &str, code: &str) -> serde_json::Value {
        json!({
            "message": message,
            "code": code
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = TestConfig::default();
        let app_config = config.to_app_config();

        assert_eq!(app_config.supabase_url, "http://localhost:54321");
        assert_eq!(app_config.supabase_anon_key, "test-anon-key");
        assert!(!app_config.supabase_jwt_secret.is_empty());
        assert!(app_config.redis_url.is_none());
    }

    #[test]
    fn test_user_creation() {
        let company = Uuid::new_v4();
        let user = TestUser::optometrist("optom@example.com", company);
        assert_eq!(user.role, "optometrist");

        let user_model = user.to_user();
        assert_eq!(user_model.email, Some(user.email.clone()));
        assert_eq!(user_model.company_id, Some(company));
        assert_eq!(user_model.id, user.id);
    }

    #[test]
    fn test_jwt_token_creation() {
        let user = TestUser::default();
        let token = JwtTestUtils::create_test_token(&user, "test-secret", Some(1));

        assert_eq!(token.split('.').count(), 3);
    }
}
