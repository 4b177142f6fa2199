//! Persona Context Document
//!
//! A small JSON document per persona carrying current mood/state, the last
//! conversation timestamp, favorites, active promise/goal, anniversaries and
//! a physical-sensations snapshot. Writes are atomic (temp file + rename)
//! with a single backup of the last good file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::record::PhysicalSensations;
use crate::store::{Result, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PartyInfo {
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub preferred_address: Option<String>,
}

/// The context document schema. Unknown fields from older files are
/// preserved in `extra` so an upgrade never drops data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextDocument {
    pub user_info: PartyInfo,
    pub persona_info: PartyInfo,
    pub last_conversation_time: Option<String>,
    pub current_emotion: String,
    pub current_emotion_intensity: Option<f64>,
    pub physical_state: String,
    pub mental_state: String,
    pub environment: String,
    pub relationship_status: String,
    pub current_action_tag: Option<String>,
    pub physical_sensations: PhysicalSensations,
    pub favorites: Vec<String>,
    pub active_promise: Option<String>,
    pub current_goal: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for ContextDocument {
    fn default() -> Self {
        Self {
            user_info: PartyInfo {
                name: Some("User".to_string()),
                ..PartyInfo::default()
            },
            persona_info: PartyInfo::default(),
            last_conversation_time: None,
            current_emotion: "neutral".to_string(),
            current_emotion_intensity: None,
            physical_state: "normal".to_string(),
            mental_state: "calm".to_string(),
            environment: "unknown".to_string(),
            relationship_status: "normal".to_string(),
            current_action_tag: None,
            physical_sensations: PhysicalSensations::default(),
            favorites: Vec::new(),
            active_promise: None,
            current_goal: None,
            extra: HashMap::new(),
        }
    }
}

impl ContextDocument {
    fn with_persona(persona: &str) -> Self {
        let mut doc = Self::default();
        doc.persona_info.name = Some(persona.to_string());
        doc
    }
}

/// File-backed context store for one persona. The write lock prevents
/// concurrent JSON corruption for the same persona within the process.
pub struct PersonaContext {
    persona: String,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl PersonaContext {
    pub fn new(persona: &str, path: PathBuf) -> Self {
        Self {
            persona: persona.to_string(),
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, creating it with schema defaults on first access.
    pub fn load(&self) -> ContextDocument {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!("Corrupt persona context {}: {}", self.path.display(), e);
                    ContextDocument::with_persona(&self.persona)
                }
            },
            Err(_) => {
                let doc = ContextDocument::with_persona(&self.persona);
                if let Err(e) = self.save(&doc) {
                    tracing::warn!("Failed to create persona context: {}", e);
                }
                doc
            }
        }
    }

    /// Atomic write: serialize to a temp file, keep one backup of the last
    /// good file, then rename into place.
    pub fn save(&self, doc: &ContextDocument) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Init("Context lock poisoned".into()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Init(format!("Context serialization failed: {}", e)))?;
        std::fs::write(&tmp_path, text)?;

        if self.path.exists() {
            let backup = self.path.with_extension("json.backup");
            if let Err(e) = std::fs::copy(&self.path, &backup) {
                tracing::warn!("Failed to write context backup: {}", e);
            }
        }

        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Refresh `last_conversation_time`. Called at the start of every tool
    /// operation; failures are logged, never surfaced.
    pub fn touch(&self, now: chrono::DateTime<chrono::FixedOffset>) {
        let mut doc = self.load();
        doc.last_conversation_time = Some(now.to_rfc3339());
        if let Err(e) = self.save(&doc) {
            tracing::warn!("Failed to update last conversation time: {}", e);
        }
    }

    /// Apply a closure to the document and persist the result.
    pub fn update<F: FnOnce(&mut ContextDocument)>(&self, mutate: F) -> Result<ContextDocument> {
        let mut doc = self.load();
        mutate(&mut doc);
        self.save(&doc)?;
        Ok(doc)
    }
}
