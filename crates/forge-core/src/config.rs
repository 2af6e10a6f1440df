use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

pub use forge_providers::ProviderConfig;

/// Knobs for planning and execution runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub planning_temperature: f32,
    pub generation_temperature: f32,
    /// Capacity of the per-run event channel.
    pub event_buffer: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            planning_temperature: 0.3,
            generation_temperature: 0.3,
            event_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// JSON config merged from, lowest precedence first: global file, project
/// file, environment, CLI overrides.
#[derive(Clone)]
pub struct ConfigStore {
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path().await?;
        Self::with_paths(path, global_path, cli_overrides).await
    }

    pub async fn with_paths(
        project_path: impl AsRef<Path>,
        global_path: impl AsRef<Path>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        let global_path = global_path.as_ref();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut global = read_json_file(global_path)
            .await
            .unwrap_or_else(|_| empty_object());
        let mut project = read_json_file(&project_path)
            .await
            .unwrap_or_else(|_| empty_object());

        scrub_persisted_secrets(&mut global, global_path).await?;
        scrub_persisted_secrets(&mut project, &project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };

        Ok(Self {
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> AppConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid config, falling back to defaults: {err}");
                AppConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut to_write = value.clone();
    strip_persisted_secrets(&mut to_write);
    let raw = serde_json::to_string_pretty(&to_write)?;
    fs::write(path, raw).await?;
    Ok(())
}

// Provider keys only ever come from the environment or the command line.
fn strip_persisted_secrets(value: &mut Value) {
    let Some(provider) = value
        .as_object_mut()
        .and_then(|root| root.get_mut("provider"))
        .and_then(Value::as_object_mut)
    else {
        return;
    };
    provider.remove("api_key");
    provider.remove("apiKey");
}

async fn scrub_persisted_secrets(value: &mut Value, path: &Path) -> anyhow::Result<()> {
    let before = value.clone();
    strip_persisted_secrets(value);
    if *value != before {
        tracing::warn!("removed persisted api key from {}", path.display());
        write_json_file(path, value).await?;
    }
    Ok(())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FORGE_GLOBAL_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("forge").join("config.json"));
    }
    Ok(PathBuf::from(".forge/global_config.json"))
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    let mut root = empty_object();

    if let Some(api_key) = non_empty("FORGE_API_KEY").or_else(|| non_empty("OPENROUTER_API_KEY")) {
        deep_merge(&mut root, &json!({ "provider": { "api_key": api_key } }));
    }
    if let Some(url) = non_empty("FORGE_BASE_URL") {
        deep_merge(&mut root, &json!({ "provider": { "base_url": url } }));
    }
    if let Some(model) = non_empty("FORGE_MODEL") {
        deep_merge(&mut root, &json!({ "provider": { "model": model } }));
    }
    if let Some(max_tokens) = non_empty("FORGE_MAX_TOKENS") {
        match max_tokens.trim().parse::<u32>() {
            Ok(v) => deep_merge(&mut root, &json!({ "provider": { "max_tokens": v } })),
            Err(_) => tracing::warn!("ignoring FORGE_MAX_TOKENS={max_tokens}: not a number"),
        }
    }

    root
}

pub fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn deep_merge_overlays_nested_keys_and_skips_nulls() {
        let mut base = json!({ "provider": { "model": "a", "max_tokens": 100 } });
        deep_merge(
            &mut base,
            &json!({ "provider": { "model": "b", "base_url": null } }),
        );
        assert_eq!(base, json!({ "provider": { "model": "b", "max_tokens": 100 } }));
    }

    #[test]
    fn env_layer_prefers_forge_key_and_parses_numbers() {
        let vars = HashMap::from([
            ("FORGE_API_KEY", "forge-key"),
            ("OPENROUTER_API_KEY", "router-key"),
            ("FORGE_MODEL", "some/model"),
            ("FORGE_MAX_TOKENS", "2048"),
            ("FORGE_BASE_URL", "  "),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            layer,
            json!({
                "provider": {
                    "api_key": "forge-key",
                    "model": "some/model",
                    "max_tokens": 2048
                }
            })
        );
    }

    #[test]
    fn env_layer_ignores_unparseable_max_tokens() {
        let layer = env_layer_from(|key| (key == "FORGE_MAX_TOKENS").then(|| "lots".to_string()));
        assert_eq!(layer, empty_object());
    }

    #[tokio::test]
    async fn layers_merge_in_precedence_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global.json");
        let project_path = dir.path().join("state").join("config.json");
        std::fs::write(
            &global_path,
            json!({
                "provider": { "model": "global/model", "max_tokens": 1000 },
                "generation": { "event_buffer": 8 }
            })
            .to_string(),
        )
        .expect("write global");
        std::fs::create_dir_all(project_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(
            &project_path,
            json!({ "provider": { "model": "project/model" } }).to_string(),
        )
        .expect("write project");

        let store = ConfigStore::with_paths(
            &project_path,
            &global_path,
            Some(json!({ "generation": { "planning_temperature": 0.1 } })),
        )
        .await
        .expect("store");
        let config = store.get().await;

        assert_eq!(config.provider.model, "project/model");
        assert_eq!(config.provider.max_tokens, 1000);
        assert_eq!(config.generation.event_buffer, 8);
        assert!((config.generation.planning_temperature - 0.1).abs() < f32::EPSILON);
        assert!((config.generation.generation_temperature - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn api_keys_are_never_written_to_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let global_path = dir.path().join("global.json");
        let project_path = dir.path().join("config.json");
        std::fs::write(
            &global_path,
            json!({ "provider": { "api_key": "leaked", "model": "m" } }).to_string(),
        )
        .expect("write global");

        std::fs::write(
            &project_path,
            json!({ "provider": { "apiKey": "also-secret", "max_tokens": 512 } }).to_string(),
        )
        .expect("write project");

        let store = ConfigStore::with_paths(&project_path, &global_path, None)
            .await
            .expect("store");
        let scrubbed: Value =
            serde_json::from_str(&std::fs::read_to_string(&global_path).expect("read global"))
                .expect("parse");
        assert_eq!(scrubbed, json!({ "provider": { "model": "m" } }));

        let persisted: Value =
            serde_json::from_str(&std::fs::read_to_string(&project_path).expect("read project"))
                .expect("parse");
        assert_eq!(persisted, json!({ "provider": { "max_tokens": 512 } }));
        assert_eq!(store.get().await.provider.max_tokens, 512);
    }

    #[tokio::test]
    async fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ConfigStore::with_paths(
            dir.path().join("config.json"),
            dir.path().join("global.json"),
            None,
        )
        .await
        .expect("store");
        let value = store.get_effective_value().await;
        let config: AppConfig = serde_json::from_value(value).expect("decode");
        assert_eq!(config.generation.event_buffer, 64);
    }
}
