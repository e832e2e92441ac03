//! Startup loading of pre-parsed collection schemes from a local JSON file.
//!
//! The cloud ingestion codec lives outside this daemon; what arrives here is
//! already the in-memory form. For bench setups and field debugging the same
//! structures can be loaded from a file named in the configuration.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::fetch::FetchMatrix;
use crate::inspection::matrix::InspectionMatrix;
use crate::lks::StateTemplateList;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemeBundle {
    #[serde(default)]
    pub inspection: Option<InspectionMatrix>,
    #[serde(default)]
    pub fetch: Option<FetchMatrix>,
    #[serde(default)]
    pub state_templates: Option<StateTemplateList>,
}

pub fn load_scheme_bundle(path: &Path) -> anyhow::Result<SchemeBundle> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scheme file {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse scheme file {}", path.display()))
}
