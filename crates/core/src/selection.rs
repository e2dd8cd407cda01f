//! Model names a job asks for, before catalog resolution.
//!
//! Each field holds whatever the user typed (possibly partial or
//! misspelled). `None` and `""` both mean "no preference"; the literal
//! [`UNLOAD_QUERY`] asks the backend to unload that slot.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Query value that requests an explicit unload instead of a lookup.
pub const UNLOAD_QUERY: &str = "None";

/// Longest query accepted for a single model field.
const MAX_QUERY_LEN: usize = 256;

/// Desired checkpoint / VAE / hypernetwork for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    #[serde(default)]
    pub checkpoint: Option<String>,
    #[serde(default)]
    pub vae: Option<String>,
    #[serde(default)]
    pub hypernetwork: Option<String>,
}

impl ModelSelection {
    /// True when no field expresses a preference.
    pub fn is_empty(&self) -> bool {
        [&self.checkpoint, &self.vae, &self.hypernetwork]
            .iter()
            .all(|field| field.as_deref().map_or(true, str::is_empty))
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, field) in [
            ("checkpoint", &self.checkpoint),
            ("vae", &self.vae),
            ("hypernetwork", &self.hypernetwork),
        ] {
            validate_query(name, field.as_deref())?;
        }
        Ok(())
    }
}

/// An auxiliary conditioning model (ControlNet unit) requested by a job.
///
/// When `enabled`, both `control_type` and `model` must resolve against
/// their catalogs or the job fails before dispatch. `module` is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub control_type: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl AuxiliaryRequest {
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_query("control_type", self.control_type.as_deref())?;
        validate_query("module", self.module.as_deref())?;
        validate_query("model", self.model.as_deref())?;
        if self.enabled && self.model.as_deref().map_or(true, str::is_empty) {
            return Err(CoreError::Validation(
                "An enabled auxiliary model needs a model name".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_query(field: &str, value: Option<&str>) -> Result<(), CoreError> {
    if let Some(value) = value {
        if value.len() > MAX_QUERY_LEN {
            return Err(CoreError::Validation(format!(
                "{field} must not exceed {MAX_QUERY_LEN} characters"
            )));
        }
        if value.chars().any(char::is_control) {
            return Err(CoreError::Validation(format!(
                "{field} must not contain control characters"
            )));
        }
    }
    Ok(())
}
