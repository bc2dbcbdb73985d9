//! Usage configuration: which viewports and resolutions a stack gets.
//!
//! A usage is the business context (e.g. a product line) selecting one resize
//! configuration. The engine reads it through [`UsageConfigProvider`];
//! [`StaticUsageProvider`] serves configurations loaded at startup.

use crate::error::{Result, StackError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Target pixel dimensions of one resolution-version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Resize configuration for one usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Viewport name -> resolution-version name -> target dimensions.
    pub viewports: BTreeMap<String, BTreeMap<String, Dimensions>>,
    /// Implicit preview resolution shared by all viewports.
    #[serde(default = "default_preview")]
    pub preview: Dimensions,
    /// Minimum accepted source dimensions.
    #[serde(default)]
    pub min_resolution: Option<Dimensions>,
    /// Maximum accepted source dimensions.
    #[serde(default)]
    pub max_resolution: Option<Dimensions>,
    /// Image content types that expand into stacks.
    #[serde(default = "default_supported_image_types")]
    pub supported_image_types: Vec<String>,
    /// Resource types this usage may be attached to.
    #[serde(default)]
    pub resource_types: Vec<String>,
    /// Default entity fields applied to roots created under this usage.
    #[serde(default)]
    pub entity_data: serde_json::Value,
}

fn default_preview() -> Dimensions {
    Dimensions {
        width: 160,
        height: 120,
    }
}

fn default_supported_image_types() -> Vec<String> {
    vec![
        "image/jpeg".to_string(),
        "image/png".to_string(),
        "image/webp".to_string(),
    ]
}

impl UsageConfig {
    /// Whether this content type is an image at all.
    pub fn is_image(content_type: &str) -> bool {
        content_type.starts_with("image/")
    }

    /// Whether this content type expands into a stack.
    pub fn is_supported_image(&self, content_type: &str) -> bool {
        self.supported_image_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(content_type))
    }

    /// Validate source dimensions against the min/max resolution bounds.
    pub fn validate_dimensions(&self, width: u32, height: u32) -> Result<()> {
        if let Some(min) = self.min_resolution {
            if width < min.width || height < min.height {
                return Err(StackError::validation(
                    "dimension_bounds",
                    format!(
                        "image {width}x{height} below minimum {}x{}",
                        min.width, min.height
                    ),
                ));
            }
        }
        if let Some(max) = self.max_resolution {
            if width > max.width || height > max.height {
                return Err(StackError::validation(
                    "dimension_bounds",
                    format!(
                        "image {width}x{height} above maximum {}x{}",
                        max.width, max.height
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Total number of resize units one stack needs: every resolution-version
    /// plus one preview per viewport.
    pub fn resize_unit_count(&self) -> usize {
        self.viewports.values().map(|v| v.len() + 1).sum()
    }
}

/// Provider of usage configurations.
#[async_trait]
pub trait UsageConfigProvider: Send + Sync {
    /// Resolve the configuration for a usage; `None` selects the default.
    async fn get_config(&self, usage: Option<&str>) -> Result<UsageConfig>;
}

/// Provider backed by a fixed map, loaded from configuration at startup.
pub struct StaticUsageProvider {
    default: UsageConfig,
    by_usage: HashMap<String, UsageConfig>,
}

impl StaticUsageProvider {
    pub fn new(default: UsageConfig) -> Self {
        Self {
            default,
            by_usage: HashMap::new(),
        }
    }

    pub fn with_usage(mut self, usage: impl Into<String>, config: UsageConfig) -> Self {
        self.by_usage.insert(usage.into(), config);
        self
    }
}

#[async_trait]
impl UsageConfigProvider for StaticUsageProvider {
    async fn get_config(&self, usage: Option<&str>) -> Result<UsageConfig> {
        match usage {
            None => Ok(self.default.clone()),
            Some(name) => self
                .by_usage
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    StackError::not_found("usage_missing", format!("unknown usage: {name}"))
                })
                .or_else(|err| {
                    if self.by_usage.is_empty() {
                        Ok(self.default.clone())
                    } else {
                        Err(err)
                    }
                }),
        }
    }
}

/// Builder for creating a UsageConfig with custom settings
pub struct UsageConfigBuilder {
    config: UsageConfig,
}

impl UsageConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: UsageConfig {
                viewports: BTreeMap::new(),
                preview: default_preview(),
                min_resolution: None,
                max_resolution: None,
                supported_image_types: default_supported_image_types(),
                resource_types: vec![],
                entity_data: serde_json::Value::Null,
            },
        }
    }

    pub fn viewport(mut self, viewport: &str, version: &str, width: u32, height: u32) -> Self {
        self.config
            .viewports
            .entry(viewport.to_string())
            .or_default()
            .insert(version.to_string(), Dimensions { width, height });
        self
    }

    pub fn preview(mut self, width: u32, height: u32) -> Self {
        self.config.preview = Dimensions { width, height };
        self
    }

    pub fn min_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.min_resolution = Some(Dimensions { width, height });
        self
    }

    pub fn max_resolution(mut self, width: u32, height: u32) -> Self {
        self.config.max_resolution = Some(Dimensions { width, height });
        self
    }

    pub fn supported_image_types(mut self, types: Vec<String>) -> Self {
        self.config.supported_image_types = types;
        self
    }

    pub fn resource_types(mut self, types: Vec<String>) -> Self {
        self.config.resource_types = types;
        self
    }

    pub fn build(self) -> UsageConfig {
        self.config
    }
}

impl Default for UsageConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
