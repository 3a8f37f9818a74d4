//! Config template definitions.
//!
//! A template declares every property the application exposes for remote
//! configuration, grouped by configuration id:
//!
//! ```yaml
//! version: v1
//! configuration:
//!   - id: app
//!     name: App config
//!     properties:
//!       - id: port
//!         type: number
//!         default: 3000
//!       - id: new_header
//!         type: boolean
//!         default: false
//! ```
//!
//! Each property is addressed by its qualified id, `"<group>.<property>"`
//! (`app.port` above).

use crate::core::value::{PropertyType, TypedValue};
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// The version field of a template (`v1`, `1`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateVersion {
    /// A numeric version
    Number(f64),
    /// A textual version such as `v1`
    Text(String),
}

/// A declared default value as written in the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    /// `true` / `false`
    Boolean(bool),
    /// Whole number, rendered without a fractional part
    Integer(i64),
    /// Any other number
    Float(f64),
    /// Text
    String(String),
}

impl DefaultValue {
    /// Render the default the way it is stored and transmitted.
    pub fn to_raw(&self) -> String {
        match self {
            DefaultValue::Boolean(b) => b.to_string(),
            DefaultValue::Integer(i) => i.to_string(),
            DefaultValue::Float(f) => f.to_string(),
            DefaultValue::String(s) => s.clone(),
        }
    }
}

/// A single property as declared in the template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    /// Property id, unique within its group
    pub id: String,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared type
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    /// Declared default (`null` or absent renders as an empty string)
    #[serde(default)]
    pub default: Option<DefaultValue>,
}

/// A group of related properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigGroup {
    /// Group id, the first half of a qualified property id
    pub id: String,
    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Longer description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Properties in this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<PropertyDefinition>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TemplateDocument {
    version: TemplateVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    configuration: Option<Vec<ConfigGroup>>,
}

/// Immutable description of one declared property.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDescriptor {
    /// Qualified id, `"<group>.<property>"`
    pub id: String,
    /// Id of the owning group
    pub group_id: String,
    /// Declared type
    pub property_type: PropertyType,
    /// Declared default, as a raw string
    pub default_raw: String,
    /// Human readable name, if declared
    pub name: Option<String>,
    /// Description, if declared
    pub description: Option<String>,
}

impl PropertyDescriptor {
    /// Coerce a raw value according to this property's type.
    pub fn coerce(&self, raw: &str) -> TypedValue {
        TypedValue::coerce(raw, self.property_type)
    }
}

/// A parsed config template.
///
/// # Examples
///
/// ```rust
/// use confsync::core::ConfigTemplate;
///
/// let template = ConfigTemplate::parse(r#"
/// version: v1
/// configuration:
///   - id: app
///     properties:
///       - id: port
///         type: number
///         default: 3000
/// "#)?;
///
/// assert_eq!(template.properties()[0].id, "app.port");
/// assert_eq!(template.properties()[0].default_raw, "3000");
/// # Ok::<(), confsync::error::ConfigError>(())
/// ```
#[derive(Debug, Clone)]
pub struct ConfigTemplate {
    document: TemplateDocument,
    raw_content: String,
    properties: Vec<PropertyDescriptor>,
}

impl ConfigTemplate {
    /// Parse a template from its YAML source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidTemplate`] if the document is not valid
    /// YAML, does not match the template shape, declares an id containing `.`,
    /// or declares the same qualified id twice.
    pub fn parse(yaml: &str) -> Result<Self> {
        let document: TemplateDocument =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidTemplate(e.to_string()))?;

        let properties = describe(&document)?;

        Ok(Self {
            document,
            raw_content: yaml.to_string(),
            properties,
        })
    }

    /// Read and parse a template file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingTemplate`] if the file does not exist,
    /// and the same errors as [`ConfigTemplate::parse`] otherwise.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::MissingTemplate(path.display().to_string()),
            _ => ConfigError::IoError(e),
        })?;
        Self::parse(&content)
    }

    /// The template exactly as it was provided.
    pub fn raw_content(&self) -> &str {
        &self.raw_content
    }

    /// The normalized template serialized as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.document)?)
    }

    /// The template version.
    pub fn version(&self) -> &TemplateVersion {
        &self.document.version
    }

    /// The declared groups.
    pub fn groups(&self) -> &[ConfigGroup] {
        self.document.configuration.as_deref().unwrap_or_default()
    }

    /// Every declared property, in declaration order.
    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }
}

fn describe(document: &TemplateDocument) -> Result<Vec<PropertyDescriptor>> {
    let mut seen = HashSet::new();
    let mut properties = Vec::new();

    for group in document.configuration.iter().flatten() {
        check_id_segment(&group.id, "configuration")?;

        for property in group.properties.iter().flatten() {
            check_id_segment(&property.id, "property")?;

            let id = format!("{}.{}", group.id, property.id);
            if !seen.insert(id.clone()) {
                return Err(ConfigError::InvalidTemplate(format!(
                    "property '{}' is declared more than once",
                    id
                )));
            }

            properties.push(PropertyDescriptor {
                id,
                group_id: group.id.clone(),
                property_type: property.property_type,
                default_raw: property
                    .default
                    .as_ref()
                    .map(DefaultValue::to_raw)
                    .unwrap_or_default(),
                name: property.name.clone(),
                description: property.description.clone(),
            });
        }
    }

    Ok(properties)
}

fn check_id_segment(id: &str, what: &str) -> Result<()> {
    if id.is_empty() || id.contains('.') {
        return Err(ConfigError::InvalidTemplate(format!(
            "{} id '{}' must be non-empty and must not contain '.'",
            what, id
        )));
    }
    Ok(())
}
