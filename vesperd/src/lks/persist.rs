//! Persistence of state-template activation metadata.
//!
//! One JSON blob on disk keeps which templates are activated and their
//! auto-deactivation deadlines, so activations survive a restart. Unreadable
//! or missing content is never an error: everything starts deactivated.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde_json::{json, Value};

const METADATA_FILE_NAME: &str = "state_template_list_metadata.json";

/// Top-level key of the persisted blob.
pub const STATE_TEMPLATES_KEY: &str = "stateTemplates";

pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(METADATA_FILE_NAME),
        }
    }

    /// Read the persisted metadata, falling back to an empty template map on
    /// any failure.
    pub fn read(&self) -> Value {
        let empty = json!({ STATE_TEMPLATES_KEY: {} });
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => {
                info!(
                    "no state template metadata at {}; all templates start deactivated",
                    self.path.display()
                );
                return empty;
            }
        };
        match serde_json::from_str::<Value>(&contents) {
            Ok(value) if value.get(STATE_TEMPLATES_KEY).map_or(false, Value::is_object) => value,
            Ok(_) => {
                warn!(
                    "state template metadata at {} has an unexpected shape; ignoring it",
                    self.path.display()
                );
                empty
            }
            Err(error) => {
                warn!(
                    "failed to parse state template metadata at {}: {}",
                    self.path.display(),
                    error
                );
                empty
            }
        }
    }

    pub fn write(&self, value: &Value) {
        if let Some(parent) = self.path.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                warn!(
                    "cannot create persistence directory {}: {}",
                    parent.display(),
                    error
                );
                return;
            }
        }
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                if let Err(error) = fs::write(&self.path, bytes) {
                    warn!(
                        "failed to write state template metadata to {}: {}",
                        self.path.display(),
                        error
                    );
                }
            }
            Err(error) => warn!("failed to serialize state template metadata: {}", error),
        }
    }
}
