//! Layered configuration
//!
//! Three layers feed every operation: library defaults (set once at library
//! initialization), session defaults (set at session init or via the set
//! configuration call), and an optional per-call override document. Merging
//! is rightmost-non-absent-wins per key and never mutates the stored layers.
//!
//! Known keys are typed fields; anything else is preserved verbatim in an
//! overflow map so newer collaborators can consume keys this core does not
//! recognize.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FacegateError, Result};

/// One configuration layer. Every field is optional; an absent field falls
/// through to the layer below during resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_antispoof: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mf_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_scan_barcode_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_score_thr_doc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_doc_x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_doc_y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_auto_rotation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_thresholds_med: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_face_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_hard_cap: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_timeout_ms: Option<u64>,
    /// Unknown keys, preserved through merge for forward compatibility.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ConfigLayer {
    /// Parse a configuration document. The document must be a JSON object;
    /// anything else (including an empty string) is `InvalidConfiguration`.
    pub fn parse(document: &str) -> Result<Self> {
        if document.trim().is_empty() {
            return Err(FacegateError::InvalidConfiguration(
                "empty document".into(),
            ));
        }
        serde_json::from_str(document)
            .map_err(|e| FacegateError::InvalidConfiguration(e.to_string()))
    }

    /// Parse a per-call override. `None` and an empty document both mean
    /// "no override", not "reset to library defaults".
    pub fn parse_override(document: Option<&str>) -> Result<Self> {
        match document {
            None => Ok(Self::default()),
            Some(doc) if doc.trim().is_empty() => Ok(Self::default()),
            Some(doc) => Self::parse(doc),
        }
    }

    /// Overlay `other` onto `self`: only keys present in `other` change.
    pub fn merge_from(&mut self, other: &ConfigLayer) {
        macro_rules! take {
            ($field:ident) => {
                if other.$field.is_some() {
                    self.$field = other.$field.clone();
                }
            };
        }
        take!(input_image_format);
        take!(skip_antispoof);
        take!(mf_token);
        take!(document_scan_barcode_only);
        take!(conf_score_thr_doc);
        take!(threshold_doc_x);
        take!(threshold_doc_y);
        take!(document_auto_rotation);
        take!(face_thresholds_med);
        take!(min_face_size);
        take!(billing_hard_cap);
        take!(inference_timeout_ms);
        for (k, v) in &other.extra {
            self.extra.insert(k.clone(), v.clone());
        }
    }

    /// Process-wide defaults established at library initialization.
    pub fn library_defaults() -> Self {
        ConfigLayer {
            input_image_format: Some("rgba".into()),
            skip_antispoof: Some(true),
            conf_score_thr_doc: Some(0.3),
            threshold_doc_x: Some(0.02),
            threshold_doc_y: Some(0.02),
            document_auto_rotation: Some(true),
            face_thresholds_med: Some(1.24),
            ..ConfigLayer::default()
        }
    }
}

/// Merge the three layers into the configuration one operation runs with.
/// Pure: the inputs are untouched and equal inputs give equal output.
pub fn resolve(
    library: &ConfigLayer,
    session: &ConfigLayer,
    call_override: &ConfigLayer,
) -> EffectiveConfig {
    let mut merged = library.clone();
    merged.merge_from(session);
    merged.merge_from(call_override);
    EffectiveConfig(merged)
}

/// The merged configuration handed to the billing check and the inference
/// collaborator for a single call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig(pub ConfigLayer);

impl EffectiveConfig {
    pub fn layer(&self) -> &ConfigLayer {
        &self.0
    }

    pub fn min_face_size(&self) -> Option<u32> {
        self.0.min_face_size
    }

    pub fn skip_antispoof(&self) -> bool {
        self.0.skip_antispoof.unwrap_or(true)
    }

    /// Lifetime per-operation-kind call cap; absent means billing never
    /// gates dispatch.
    pub fn billing_hard_cap(&self) -> Option<u64> {
        self.0.billing_hard_cap
    }

    /// Deadline for the collaborator call; absent means run to completion.
    pub fn inference_timeout_ms(&self) -> Option<u64> {
        self.0.inference_timeout_ms
    }
}

/// Named configuration presets applied via the set-default-configuration
/// call. Codes follow the original contract (1 = web).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPreset {
    Web,
}

impl ConfigPreset {
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            1 => Ok(ConfigPreset::Web),
            other => Err(FacegateError::InvalidConfiguration(format!(
                "unknown configuration preset code {other}"
            ))),
        }
    }

    /// The layer the preset overlays onto the session defaults. Web
    /// captures come in as rgba bitmaps and run the anti-spoof check.
    pub fn layer(&self) -> ConfigLayer {
        match self {
            ConfigPreset::Web => ConfigLayer {
                input_image_format: Some("rgba".into()),
                skip_antispoof: Some(false),
                ..ConfigLayer::default()
            },
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_debug_level() -> u8 {
    3
}

/// Session creation settings. `api_key` and `base_url` are required; a
/// session is never partially constructed from an incomplete document.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    pub api_key: String,
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_debug_level")]
    pub debug_level: u8,
    /// Optional initial session-default configuration layer.
    #[serde(default)]
    pub configuration: Option<ConfigLayer>,
}

impl SessionSettings {
    pub fn parse(document: &str) -> Result<Self> {
        if document.trim().is_empty() {
            return Err(FacegateError::InvalidSettings("empty document".into()));
        }
        let settings: SessionSettings = serde_json::from_str(document)
            .map_err(|e| FacegateError::InvalidSettings(e.to_string()))?;
        if settings.api_key.is_empty() {
            return Err(FacegateError::InvalidSettings("api_key is empty".into()));
        }
        if settings.base_url.is_empty() {
            return Err(FacegateError::InvalidSettings("base_url is empty".into()));
        }
        Ok(settings)
    }
}
