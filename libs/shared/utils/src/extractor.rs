use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use headers::{authorization::Bearer, Authorization};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::jwt::validate_token;

/// Validates the bearer token and stores the resulting `User` in the request
/// extensions for the handlers.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    auth: Option<TypedHeader<Authorization<Bearer>>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(auth) =
        auth.ok_or_else(|| AppError::Auth("Missing authorization header".to_string()))?;

    let user = validate_token(auth.token(), &config.supabase_jwt_secret).map_err(AppError::Auth)?;

    request.extensions_mut().insert(user);

    Ok(next.run(request).await)
}

/// Resolve the tenant of the caller. Every scheduling read and write is
/// scoped by it.
pub fn require_company(user: &User) -> Result<Uuid, AppError> {
    user.company_id
        .ok_or_else(|| AppError::Auth("User is not attached to a company".to_string()))
}

/// Resolve the caller's own id as a UUID, for `created_by` / `updated_by`.
pub fn require_user_id(user: &User) -> Result<Uuid, AppError> {
    user.user_uuid()
        .ok_or_else(|| AppError::Auth("User id is not a valid UUID".to_string()))
}
