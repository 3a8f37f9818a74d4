//! HTTP implementation of the instance API.

use super::{CreateInstanceRequest, InstanceApi, InstanceInfo};
use crate::core::RawValueMap;
use crate::error::{ConfigError, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// Header carrying the access token.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Instance API over HTTP and JSON.
///
/// # Examples
///
/// ```rust,no_run
/// use confsync::api::{HttpInstanceApi, InstanceApi};
/// use std::time::Duration;
///
/// # async fn example() -> confsync::error::Result<()> {
/// let api = HttpInstanceApi::builder()
///     .with_base_url("https://config.example.com/api")
///     .with_access_token("ak_live_123")
///     .with_timeout(Duration::from_secs(5))
///     .build()?;
///
/// let values = api.get_instance_configuration("inst_1").await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpInstanceApi {
    base_url: String,
    client: Client,
}

impl HttpInstanceApi {
    /// Create a new builder.
    pub fn builder() -> HttpInstanceApiBuilder {
        HttpInstanceApiBuilder::new()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl InstanceApi for HttpInstanceApi {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceInfo> {
        debug!(
            application_name = %request.application_name,
            environment_name = %request.environment_name,
            raw_config_content_length = request.raw_config_template_content.len(),
            "Creating instance"
        );

        let response = self
            .client
            .post(self.url("instances"))
            .json(request)
            .send()
            .await
            .map_err(|e| ConfigError::Api(format!("Unable to create instance: {}", e)))?;

        let body = read_json(response, "Unable to create instance").await?;
        parse_instance(&body)
    }

    async fn get_instance_configuration(&self, instance_id: &str) -> Result<RawValueMap> {
        debug!(instance_id, "Getting instance configuration");

        let response = self
            .client
            .get(self.url(&format!("instances/{}/configuration", instance_id)))
            .send()
            .await
            .map_err(|e| {
                ConfigError::Api(format!("Unable to get instance configuration: {}", e))
            })?;

        let body = read_json(response, "Unable to get instance configuration").await?;
        json_to_raw_map(body.get("configuration").unwrap_or(&JsonValue::Null))
    }

    async fn send_heartbeat(&self, instance_id: &str) -> Result<()> {
        debug!(instance_id, "Sending heartbeat");

        let response = self
            .client
            .post(self.url(&format!("instances/{}/heartbeat", instance_id)))
            .send()
            .await
            .map_err(|e| ConfigError::Api(format!("Unable to send heartbeat: {}", e)))?;

        ensure_success(response, "Unable to send heartbeat").await?;
        Ok(())
    }
}

async fn ensure_success(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body).unwrap_or_else(|| {
        format!(
            "status {} {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
    });
    Err(ConfigError::Api(format!("{}: {}", context, message)))
}

async fn read_json(response: Response, context: &str) -> Result<JsonValue> {
    ensure_success(response, context)
        .await?
        .json()
        .await
        .map_err(|e| ConfigError::InvalidResponse(format!("{}: {}", context, e)))
}

/// The server message of an error body shaped like `{"error": {"message": ...}}`.
fn error_message(body: &str) -> Option<String> {
    let json: JsonValue = serde_json::from_str(body).ok()?;
    json.get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}

fn parse_instance(body: &JsonValue) -> Result<InstanceInfo> {
    let attribute = |name: &str| {
        body.get(name)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ConfigError::InvalidResponse(format!(
                    "instance attribute '{}' is missing from the response",
                    name
                ))
            })
    };

    Ok(InstanceInfo {
        id: attribute("id")?,
        name: attribute("name")?,
        url: attribute("url")?,
    })
}

/// Flatten a JSON object of raw values into strings.
///
/// Strings are kept as they are, `null` becomes an empty string and any other
/// value is rendered as JSON.
fn json_to_raw_map(json: &JsonValue) -> Result<RawValueMap> {
    match json {
        JsonValue::Object(obj) => Ok(obj
            .iter()
            .map(|(id, value)| {
                let raw = match value {
                    JsonValue::String(s) => s.clone(),
                    JsonValue::Null => String::new(),
                    other => other.to_string(),
                };
                (id.clone(), raw)
            })
            .collect()),
        JsonValue::Null => Ok(RawValueMap::new()),
        _ => Err(ConfigError::InvalidResponse(
            "instance configuration must be a JSON object".to_string(),
        )),
    }
}

/// Builder for [`HttpInstanceApi`].
pub struct HttpInstanceApiBuilder {
    base_url: Option<String>,
    access_token: Option<String>,
    timeout: Duration,
}

impl HttpInstanceApiBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            access_token: None,
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the API base URL, e.g. `https://config.example.com/api`.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the access token sent with every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the request timeout.
    ///
    /// Default is 5 seconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the API client.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No base URL is provided
    /// - The access token is not a valid header value
    /// - The HTTP client cannot be constructed
    pub fn build(self) -> Result<HttpInstanceApi> {
        let base_url = self
            .base_url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                ConfigError::SettingsError("a base URL is required for the instance API".into())
            })?;

        let mut headers = HeaderMap::new();
        if let Some(token) = self.access_token.filter(|t| !t.is_empty()) {
            let mut value = HeaderValue::from_str(&token).map_err(|e| {
                ConfigError::SettingsError(format!("Invalid access token: {}", e))
            })?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(HttpInstanceApi {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl Default for HttpInstanceApiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_requires_base_url() {
        let result = HttpInstanceApi::builder().with_access_token("t").build();
        assert!(matches!(result, Err(ConfigError::SettingsError(_))));
    }

    #[test]
    fn test_builder_rejects_invalid_token() {
        let result = HttpInstanceApi::builder()
            .with_base_url("https://svc")
            .with_access_token("line\nbreak")
            .build();
        assert!(matches!(result, Err(ConfigError::SettingsError(_))));
    }

    #[test]
    fn test_urls_are_joined_without_double_slash() {
        let api = HttpInstanceApi::builder()
            .with_base_url("https://svc/api/")
            .with_access_token("ak_123")
            .build()
            .unwrap();
        assert_eq!(
            api.url("instances/i/heartbeat"),
            "https://svc/api/instances/i/heartbeat"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"message":"Application not found"}}"#).as_deref(),
            Some("Application not found")
        );
        assert_eq!(error_message("<html>oops</html>"), None);
        assert_eq!(error_message(r#"{"error":"flat"}"#), None);
    }

    #[test]
    fn test_parse_instance_requires_all_attributes() {
        let body = json!({ "id": "i", "name": "brave-otter", "url": "https://svc/i" });
        assert_eq!(
            parse_instance(&body).unwrap(),
            InstanceInfo {
                id: "i".into(),
                name: "brave-otter".into(),
                url: "https://svc/i".into(),
            }
        );

        let err = parse_instance(&json!({ "id": "i", "name": "n" })).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResponse(_)));
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_configuration_values_are_stringified() {
        let map = json_to_raw_map(&json!({
            "app.port": "4000",
            "app.ratio": 0.5,
            "feature.enabled": true,
            "app.motd": null,
        }))
        .unwrap();

        assert_eq!(map["app.port"], "4000");
        assert_eq!(map["app.ratio"], "0.5");
        assert_eq!(map["feature.enabled"], "true");
        assert_eq!(map["app.motd"], "");
        assert!(json_to_raw_map(&JsonValue::Null).unwrap().is_empty());
        assert!(json_to_raw_map(&json!([1, 2])).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_api_error() {
        let api = HttpInstanceApi::builder()
            .with_base_url("http://127.0.0.1:9")
            .with_timeout(Duration::from_millis(500))
            .build()
            .unwrap();

        let result = api.send_heartbeat("i").await;
        assert!(matches!(result, Err(ConfigError::Api(_))));
    }
}
