//! Layered Configuration
//!
//! Resolution order: built-in defaults < resource-profile preset < environment
//! overrides < on-disk JSON (`<data>/config.json`). Environment keys use the
//! `KIOKU_` prefix; `__` separates nested path segments, and the known
//! two-level sections accept a friendly single-underscore form
//! (`KIOKU_VECTOR_REBUILD_MODE`). The resolved config is cached and
//! invalidated on (file mtime, environment signature) changes.
//!
//! Resource profiles (`normal`, `low`, `minimal`) apply their presets only
//! where the user has not explicitly overridden a leaf.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const ENV_PREFIX: &str = "KIOKU_";
const DATA_DIR_ENV: &str = "KIOKU_DATA_DIR";

// ============================================================================
// CONFIG TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationConfig {
    pub enabled: bool,
    /// false: statistical template summary, true: LLM back-end
    pub use_llm: bool,
    pub frequency_days: u64,
    pub min_importance: f64,
    pub idle_minutes: u64,
    pub check_interval_seconds: u64,
    pub llm_api_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_max_tokens: u32,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_llm: false,
            frequency_days: 1,
            min_importance: 0.3,
            idle_minutes: 30,
            check_interval_seconds: 3600,
            llm_api_url: None,
            llm_api_key: None,
            llm_model: "anthropic/claude-3.5-sonnet".to_string(),
            llm_max_tokens: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorRebuildConfig {
    /// "idle" rebuilds during inactivity; "manual" disables the loop.
    pub mode: String,
    pub idle_seconds: u64,
    pub min_interval: u64,
}

impl Default for VectorRebuildConfig {
    fn default() -> Self {
        Self {
            mode: "idle".to_string(),
            idle_seconds: 30,
            min_interval: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoCleanupConfig {
    pub enabled: bool,
    pub idle_minutes: u64,
    pub check_interval_seconds: u64,
    pub duplicate_threshold: f64,
    pub min_similarity_to_report: f64,
    pub max_suggestions_per_run: usize,
}

impl Default for AutoCleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_minutes: 30,
            check_interval_seconds: 300,
            duplicate_threshold: 0.90,
            min_similarity_to_report: 0.85,
            max_suggestions_per_run: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressiveSearchConfig {
    pub enabled: bool,
    /// Try keyword/tag search before semantic.
    pub keyword_first: bool,
    /// Minimum keyword hits before skipping semantic.
    pub keyword_threshold: usize,
    pub semantic_fallback: bool,
    /// Cap on semantic results for resource saving.
    pub max_semantic_top_k: usize,
}

impl Default for ProgressiveSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keyword_first: true,
            keyword_threshold: 3,
            semantic_fallback: true,
            max_semantic_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Default privacy for new memories.
    pub default_level: String,
    pub auto_redact_pii: bool,
    /// Max privacy level returned in search.
    pub search_max_level: String,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            default_level: "internal".to_string(),
            auto_redact_pii: false,
            search_max_level: "private".to_string(),
        }
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embeddings_model: String,
    pub embeddings_device: String,
    pub reranker_model: String,
    pub reranker_top_n: usize,
    pub server_host: String,
    pub server_port: u16,
    pub timezone: String,
    /// Number of recent memories shown in get_context.
    pub recent_memories_count: usize,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub qdrant_collection_prefix: String,
    pub summarization: SummarizationConfig,
    pub vector_rebuild: VectorRebuildConfig,
    pub auto_cleanup: AutoCleanupConfig,
    pub progressive_search: ProgressiveSearchConfig,
    pub privacy: PrivacyConfig,
    /// "normal", "low" (NAS-class hosts), or "minimal".
    pub resource_profile: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embeddings_model: "nomic-ai/nomic-embed-text-v1.5".to_string(),
            embeddings_device: "cpu".to_string(),
            reranker_model: "jinaai/jina-reranker-v1-turbo-en".to_string(),
            reranker_top_n: 10,
            server_host: "0.0.0.0".to_string(),
            server_port: 26262,
            timezone: "Asia/Tokyo".to_string(),
            recent_memories_count: 5,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            qdrant_collection_prefix: "memory_".to_string(),
            summarization: SummarizationConfig::default(),
            vector_rebuild: VectorRebuildConfig::default(),
            auto_cleanup: AutoCleanupConfig::default(),
            progressive_search: ProgressiveSearchConfig::default(),
            privacy: PrivacyConfig::default(),
            resource_profile: "normal".to_string(),
        }
    }
}

impl Config {
    pub fn default_privacy_level(&self) -> crate::record::PrivacyLevel {
        crate::record::PrivacyLevel::parse(&self.privacy.default_level).unwrap_or_default()
    }

    pub fn search_max_level(&self) -> crate::record::PrivacyLevel {
        crate::record::PrivacyLevel::parse(&self.privacy.search_max_level)
            .unwrap_or(crate::record::PrivacyLevel::Private)
    }
}

// ============================================================================
// VALUE-TREE MERGING
// ============================================================================

fn deep_update(target: &mut Value, updates: &Value) {
    match (target, updates) {
        (Value::Object(t), Value::Object(u)) => {
            for (key, value) in u {
                match t.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_update(existing, value)
                    }
                    _ => {
                        t.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (t, u) => *t = u.clone(),
    }
}

/// Apply `updates` only where `target` still equals `defaults`.
fn deep_update_defaults_only(target: &mut Value, updates: &Value, defaults: &Value) {
    if let (Value::Object(t), Value::Object(u)) = (target, updates) {
        for (key, value) in u {
            let default_leaf = defaults.get(key).cloned().unwrap_or(Value::Null);
            match t.get_mut(key) {
                Some(existing) if existing.is_object() && value.is_object() => {
                    deep_update_defaults_only(existing, value, &default_leaf);
                }
                Some(existing) => {
                    if *existing == default_leaf {
                        *existing = value.clone();
                    }
                }
                None => {
                    t.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

fn assign_nested(target: &mut Value, path: &[&str], value: Value) {
    if path.is_empty() {
        return;
    }
    let mut current = target;
    for segment in &path[..path.len() - 1] {
        let obj = current.as_object_mut().expect("config tree is an object");
        let entry = obj
            .entry(segment.to_string())
            .or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
        current = entry;
    }
    if let Some(obj) = current.as_object_mut() {
        obj.insert(path[path.len() - 1].to_string(), value);
    }
}

/// Parse an env value as bool / integer / float / JSON / string, in order.
fn parse_env_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return json!(n);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        return json!(f);
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return v;
    }
    Value::String(trimmed.to_string())
}

fn load_env_overrides(env: &BTreeMap<String, String>) -> Value {
    let mut overrides = json!({});
    for (key, raw) in env {
        if !key.starts_with(ENV_PREFIX) || key == DATA_DIR_ENV {
            continue;
        }
        let suffix = &key[ENV_PREFIX.len()..];
        if suffix.is_empty() {
            continue;
        }
        let lower = suffix.to_lowercase();
        let value = parse_env_value(raw);

        // Preferred explicit nesting (e.g. KIOKU_VECTOR_REBUILD__MODE)
        if lower.contains("__") {
            let parts: Vec<&str> = lower.split("__").filter(|s| !s.is_empty()).collect();
            if !parts.is_empty() {
                assign_nested(&mut overrides, &parts, value);
            }
            continue;
        }

        // Friendly one-underscore mapping for the known 2-level sections
        let mut matched = false;
        for section in ["summarization", "vector_rebuild", "auto_cleanup"] {
            let prefix = format!("{}_", section);
            if let Some(leaf) = lower.strip_prefix(&prefix) {
                assign_nested(&mut overrides, &[section, leaf], value.clone());
                matched = true;
                break;
            }
        }
        if matched {
            continue;
        }

        assign_nested(&mut overrides, &[lower.as_str()], value);
    }
    overrides
}

// ============================================================================
// RESOURCE PROFILES
// ============================================================================

fn profile_preset(profile: &str) -> Option<Value> {
    match profile {
        // CPU-constrained but memory-rich NAS hosts
        "low" => Some(json!({
            "embeddings_device": "cpu",
            "reranker_top_n": 6,
            "summarization": {
                "check_interval_seconds": 5400,
                "idle_minutes": 45,
            },
            "vector_rebuild": {
                "mode": "idle",
                "idle_seconds": 90,
                "min_interval": 300,
            },
            "auto_cleanup": {
                "check_interval_seconds": 450,
                "max_suggestions_per_run": 15,
            },
            "progressive_search": {
                "enabled": true,
                "keyword_first": true,
                "keyword_threshold": 2,
                "semantic_fallback": true,
                "max_semantic_top_k": 5,
            },
        })),
        // Very constrained environments
        "minimal" => Some(json!({
            "embeddings_device": "cpu",
            "reranker_model": "",
            "reranker_top_n": 0,
            "summarization": { "enabled": false },
            "vector_rebuild": {
                "mode": "manual",
                "min_interval": 3600,
            },
            "auto_cleanup": { "enabled": false },
            "progressive_search": {
                "enabled": true,
                "keyword_first": true,
                "keyword_threshold": 1,
                "semantic_fallback": false,
                "max_semantic_top_k": 2,
            },
        })),
        _ => None,
    }
}

fn apply_resource_profile(merged: &mut Value, defaults: &Value) {
    let profile = merged
        .get("resource_profile")
        .and_then(Value::as_str)
        .unwrap_or("normal")
        .to_string();
    if let Some(preset) = profile_preset(&profile) {
        deep_update_defaults_only(merged, &preset, defaults);
    }
}

// ============================================================================
// RESOLUTION & CACHE
// ============================================================================

fn resolve(file_config: &Value, env: &BTreeMap<String, String>) -> Config {
    let defaults = serde_json::to_value(Config::default()).unwrap_or_else(|_| json!({}));
    let mut merged = defaults.clone();

    let env_overrides = load_env_overrides(env);
    deep_update(&mut merged, &env_overrides);
    deep_update(&mut merged, file_config);

    // Env always wins for host/port so container port management never
    // requires editing config files.
    if let Some(host) = env_overrides.get("server_host") {
        assign_nested(&mut merged, &["server_host"], host.clone());
    }
    if let Some(port) = env_overrides.get("server_port") {
        assign_nested(&mut merged, &["server_port"], port.clone());
    }

    apply_resource_profile(&mut merged, &defaults);

    serde_json::from_value(merged).unwrap_or_default()
}

struct CacheState {
    mtime: Option<SystemTime>,
    env_signature: String,
    config: Arc<Config>,
}

/// Resolves and caches configuration for a data directory.
pub struct ConfigManager {
    data_dir: PathBuf,
    cache: Mutex<Option<CacheState>>,
}

impl ConfigManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            cache: Mutex::new(None),
        }
    }

    /// Data directory from `KIOKU_DATA_DIR` or the platform data dir.
    pub fn default_data_dir() -> PathBuf {
        if let Ok(path) = std::env::var(DATA_DIR_ENV) {
            return PathBuf::from(path);
        }
        directories::ProjectDirs::from("dev", "kioku", "kioku")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.json")
    }

    pub fn memory_root(&self) -> PathBuf {
        self.data_dir.join("memory")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    fn env_map() -> BTreeMap<String, String> {
        std::env::vars()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX))
            .collect()
    }

    fn env_signature(env: &BTreeMap<String, String>) -> String {
        serde_json::to_string(env).unwrap_or_default()
    }

    fn load_file_config(path: &Path) -> Value {
        match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Unreadable config file {}: {} - using defaults", path.display(), e);
                    json!({})
                }
            },
            Err(_) => json!({}),
        }
    }

    /// Load the resolved configuration, reusing the cache while the config
    /// file mtime and the environment signature are unchanged.
    pub fn load(&self) -> Arc<Config> {
        self.load_inner(false)
    }

    /// Force a re-resolution regardless of cache state.
    pub fn reload(&self) -> Arc<Config> {
        self.load_inner(true)
    }

    fn load_inner(&self, force: bool) -> Arc<Config> {
        let env = Self::env_map();
        let signature = Self::env_signature(&env);
        let config_path = self.config_path();
        let mtime = std::fs::metadata(&config_path)
            .and_then(|m| m.modified())
            .ok();

        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !force {
            if let Some(state) = cache.as_ref() {
                if state.mtime == mtime && state.env_signature == signature {
                    return Arc::clone(&state.config);
                }
            }
        }

        let file_config = Self::load_file_config(&config_path);
        let config = Arc::new(resolve(&file_config, &env));
        *cache = Some(CacheState {
            mtime,
            env_signature: signature,
            config: Arc::clone(&config),
        });
        config
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server_port, 26262);
        assert_eq!(config.timezone, "Asia/Tokyo");
        assert_eq!(config.qdrant_collection_prefix, "memory_");
        assert_eq!(config.vector_rebuild.idle_seconds, 30);
        assert_eq!(config.vector_rebuild.min_interval, 120);
        assert_eq!(config.auto_cleanup.duplicate_threshold, 0.90);
        assert_eq!(config.summarization.min_importance, 0.3);
        assert_eq!(config.resource_profile, "normal");
    }

    #[test]
    fn test_parse_env_value_ordering() {
        assert_eq!(parse_env_value("true"), Value::Bool(true));
        assert_eq!(parse_env_value("42"), json!(42));
        assert_eq!(parse_env_value("0.25"), json!(0.25));
        assert_eq!(parse_env_value("[1,2]"), json!([1, 2]));
        assert_eq!(parse_env_value("hello"), json!("hello"));
    }

    #[test]
    fn test_env_double_underscore_nesting() {
        let mut env = BTreeMap::new();
        env.insert("KIOKU_VECTOR_REBUILD__IDLE_SECONDS".to_string(), "90".to_string());
        let overrides = load_env_overrides(&env);
        assert_eq!(overrides["vector_rebuild"]["idle_seconds"], json!(90));
    }

    #[test]
    fn test_env_single_underscore_sections() {
        let mut env = BTreeMap::new();
        env.insert("KIOKU_SUMMARIZATION_ENABLED".to_string(), "false".to_string());
        env.insert("KIOKU_AUTO_CLEANUP_IDLE_MINUTES".to_string(), "10".to_string());
        let overrides = load_env_overrides(&env);
        assert_eq!(overrides["summarization"]["enabled"], json!(false));
        assert_eq!(overrides["auto_cleanup"]["idle_minutes"], json!(10));
    }

    #[test]
    fn test_env_top_level_fallback() {
        let mut env = BTreeMap::new();
        env.insert("KIOKU_SERVER_PORT".to_string(), "9000".to_string());
        let overrides = load_env_overrides(&env);
        assert_eq!(overrides["server_port"], json!(9000));
    }

    #[test]
    fn test_data_dir_env_reserved() {
        let mut env = BTreeMap::new();
        env.insert(DATA_DIR_ENV.to_string(), "/tmp/x".to_string());
        let overrides = load_env_overrides(&env);
        assert_eq!(overrides, json!({}));
    }

    #[test]
    fn test_file_overrides_env_except_host_port() {
        let mut env = BTreeMap::new();
        env.insert("KIOKU_TIMEZONE".to_string(), "UTC".to_string());
        env.insert("KIOKU_SERVER_PORT".to_string(), "9000".to_string());
        let file = json!({ "timezone": "Europe/Berlin", "server_port": 1234 });
        let config = resolve(&file, &env);
        // File wins for ordinary keys...
        assert_eq!(config.timezone, "Europe/Berlin");
        // ...but env wins for server_port.
        assert_eq!(config.server_port, 9000);
    }

    #[test]
    fn test_low_profile_applies_defaults_only() {
        let env = BTreeMap::new();
        let file = json!({
            "resource_profile": "low",
            // Explicit override: must survive the profile preset
            "vector_rebuild": { "idle_seconds": 7 },
        });
        let config = resolve(&file, &env);
        assert_eq!(config.vector_rebuild.idle_seconds, 7);
        // Untouched leaves pick up the preset
        assert_eq!(config.vector_rebuild.min_interval, 300);
        assert_eq!(config.reranker_top_n, 6);
    }

    #[test]
    fn test_minimal_profile_disables_reranker_and_workers() {
        let env = BTreeMap::new();
        let file = json!({ "resource_profile": "minimal" });
        let config = resolve(&file, &env);
        assert_eq!(config.reranker_model, "");
        assert_eq!(config.reranker_top_n, 0);
        assert!(!config.summarization.enabled);
        assert!(!config.auto_cleanup.enabled);
        assert_eq!(config.vector_rebuild.mode, "manual");
    }

    #[test]
    fn test_cache_refresh_picks_up_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().to_path_buf());
        let first = manager.load();
        assert_eq!(first.server_port, 26262);

        std::fs::write(manager.config_path(), r#"{"server_port": 7777}"#).unwrap();
        // A fresh file mtime invalidates the cache; reload() forces it even
        // on filesystems with coarse mtime granularity.
        let second = manager.reload();
        assert_eq!(second.server_port, 7777);

        // The cached value is served while nothing changed
        let third = manager.load();
        assert_eq!(third.server_port, 7777);
    }
}
