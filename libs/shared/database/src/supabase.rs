use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Non-2xx answer from PostgREST. Callers recover it with
/// `anyhow::Error::downcast_ref` when the status code matters.
#[derive(Debug, thiserror::Error)]
#[error("API error ({status}): {message}")]
pub struct SupabaseApiError {
    pub status: u16,
    pub message: String,
}

impl SupabaseApiError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_key: Option<String>,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            service_key: config.supabase_service_role_key.clone(),
        }
    }

    fn get_headers(&self, auth_token: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        // Server-side callers without a user token fall back to the service key.
        if let Some(token) = auth_token.or(self.service_key.as_deref()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        Ok(headers)
    }

    pub async fn request<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.request_with_headers(method, path, auth_token, body, None).await
    }

    /// Same as [`request`](Self::request) with extra headers layered on top,
    /// typically `Prefer: return=representation` for writes.
    pub async fn request_with_headers<T>(
        &self,
        method: Method,
        path: &str,
        auth_token: Option<&str>,
        body: Option<Value>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut headers = self.get_headers(auth_token)?;
        if let Some(extra) = extra_headers {
            headers.extend(extra);
        }

        let mut req = self.client.request(method, &url).headers(headers);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("API error ({}): {}", status, error_text);

            return Err(anyhow!(SupabaseApiError {
                status: status.as_u16(),
                message: error_text,
            }));
        }

        // DELETE and minimal-return writes come back with an empty body.
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_value(Value::Null)?);
        }

        let data = serde_json::from_slice::<T>(&bytes)?;
        Ok(data)
    }

    pub fn representation_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));
        headers
    }

    /// Headers asking PostgREST for an exact row count in `Content-Range`.
    pub fn count_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Prefer", HeaderValue::from_static("count=exact"));
        headers
    }

    /// GET returning the rows plus the total from `Content-Range: 0-9/42`.
    pub async fn select_with_count<T>(
        &self,
        path: &str,
        auth_token: Option<&str>,
    ) -> Result<(Vec<T>, Option<u64>)>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making counted GET request to {}", url);

        let mut headers = self.get_headers(auth_token)?;
        headers.extend(Self::count_headers());

        let response = self.client.get(&url).headers(headers).send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("API error ({}): {}", status, error_text);
            return Err(anyhow!(SupabaseApiError {
                status: status.as_u16(),
                message: error_text,
            }));
        }

        let total = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_content_range_total);

        let rows = response.json::<Vec<T>>().await?;
        Ok((rows, total))
    }

    pub fn get_base_url(&self) -> &str {
        &self.base_url
    }
}

fn parse_content_range_total(raw: &str) -> Option<u64> {
    raw.rsplit('/').next().and_then(|total| total.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(url: &str) -> AppConfig {
        AppConfig {
            supabase_url: url.to_string(),
            supabase_anon_key: "anon".to_string(),
            supabase_service_role_key: Some("service".to_string()),
            supabase_jwt_secret: "secret".to_string(),
            redis_url: None,
            communications_webhook_url: None,
            port: 0,
            scheduling: Default::default(),
        }
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("0-9/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
    }

    #[tokio::test]
    async fn test_request_uses_service_key_without_user_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/appointments"))
            .and(header("authorization", "Bearer service"))
            .and(header("apikey", "anon"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server.uri()));
        let rows: Vec<Value> = client
            .request(Method::GET, "/rest/v1/appointments", None, None)
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_error_status_is_recoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/appointments"))
            .respond_with(ResponseTemplate::new(409).set_body_string("duplicate key"))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server.uri()));
        let err = client
            .request_with_headers::<Vec<Value>>(
                Method::POST,
                "/rest/v1/appointments",
                Some("user-token"),
                Some(json!({})),
                Some(SupabaseClient::representation_headers()),
            )
            .await
            .unwrap_err();

        assert_matches!(err.downcast_ref::<SupabaseApiError>(), Some(api) if api.is_conflict());
    }

    #[tokio::test]
    async fn test_empty_body_decodes_as_unit() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/waitlist_entries"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server.uri()));
        let result: Result<()> = client
            .request(Method::DELETE, "/rest/v1/waitlist_entries", None, None)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_select_with_count_reads_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/appointments"))
            .and(header("prefer", "count=exact"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-range", "0-0/7")
                    .set_body_json(json!([{ "id": 1 }])),
            )
            .mount(&server)
            .await;

        let client = SupabaseClient::new(&config_for(&server.uri()));
        let (rows, total) = client
            .select_with_count::<Value>("/rest/v1/appointments", None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(total, Some(7));
    }
}
