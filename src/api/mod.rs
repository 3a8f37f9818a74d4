//! The configuration service's instance API.
//!
//! [`InstanceApi`] is what the client needs from the service: register an
//! instance, fetch its configuration and report liveness. [`HttpInstanceApi`]
//! implements it over HTTP (feature `http`).

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpInstanceApi, HttpInstanceApiBuilder};

use crate::core::{ConfigTemplate, RawValueMap};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name reported to the service on instance creation.
pub const SDK_NAME: &str = "confsync-rust";

/// Version reported to the service on instance creation.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Free-form annotations attached to an instance.
pub type Tags = BTreeMap<String, serde_json::Value>;

/// A registered instance, as returned by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Instance id
    pub id: String,
    /// Human readable instance name
    pub name: String,
    /// Dashboard URL of the instance
    pub url: String,
}

/// Body of an instance registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateInstanceRequest {
    /// Application the instance belongs to
    pub application_name: String,
    /// Environment the instance runs in
    pub environment_name: String,
    /// The template exactly as written
    pub raw_config_template_content: String,
    /// The normalized template, as JSON
    pub config_template_content: String,
    /// Content type of `config_template_content`
    pub config_template_content_type: String,
    /// Client library name
    pub sdk_name: String,
    /// Client library version
    pub sdk_version: String,
    /// Instance annotations
    pub tags: Tags,
}

impl CreateInstanceRequest {
    /// Build a registration for an application's template.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be serialized.
    pub fn new(
        application_name: impl Into<String>,
        environment_name: impl Into<String>,
        template: &ConfigTemplate,
        tags: Tags,
    ) -> Result<Self> {
        Ok(Self {
            application_name: application_name.into(),
            environment_name: environment_name.into(),
            raw_config_template_content: template.raw_content().to_string(),
            config_template_content: template.to_json()?,
            config_template_content_type: "application/json".to_string(),
            sdk_name: SDK_NAME.to_string(),
            sdk_version: SDK_VERSION.to_string(),
            tags,
        })
    }
}

/// Remote operations on instances.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// Register a new instance.
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<InstanceInfo>;

    /// Fetch the raw configuration values of an instance.
    async fn get_instance_configuration(&self, instance_id: &str) -> Result<RawValueMap>;

    /// Report that an instance is alive.
    async fn send_heartbeat(&self, instance_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_instance_request() {
        let template = ConfigTemplate::parse(
            "version: v1\nconfiguration:\n  - id: app\n    properties:\n      - id: port\n        type: number\n        default: 3000\n",
        )
        .unwrap();
        let mut tags = Tags::new();
        tags.insert("region".into(), "eu-west-1".into());

        let request = CreateInstanceRequest::new("shop", "production", &template, tags).unwrap();
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["application_name"], "shop");
        assert_eq!(body["environment_name"], "production");
        assert_eq!(body["config_template_content_type"], "application/json");
        assert_eq!(body["sdk_name"], SDK_NAME);
        assert_eq!(body["tags"]["region"], "eu-west-1");
        assert_eq!(
            body["raw_config_template_content"].as_str(),
            Some(template.raw_content())
        );

        let normalized: serde_json::Value =
            serde_json::from_str(body["config_template_content"].as_str().unwrap()).unwrap();
        assert_eq!(normalized["configuration"][0]["id"], "app");
    }
}
