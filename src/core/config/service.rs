use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::defaults::default_config;
use super::paths::AppPaths;
use super::validation::validate_config;
use crate::core::errors::ChatError;

/// Loads and persists process-wide settings.
///
/// Settings live in a single YAML file in the data directory; reads merge the
/// file over the built-in defaults, writes validate first and persist only the
/// user's view (defaults are never written back).
#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("HEARTH_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        self.paths.user_data_dir.join("config.yml")
    }

    pub fn load_config(&self) -> Result<Value, ChatError> {
        let file_config = load_yaml_file(&self.config_path());
        Ok(deep_merge(&default_config(), &file_config))
    }

    pub fn update_config(&self, config_data: Value, merge: bool) -> Result<(), ChatError> {
        let current = load_yaml_file(&self.config_path());
        let to_save = if merge {
            deep_merge(&current, &config_data)
        } else {
            config_data
        };

        validate_config(&deep_merge(&default_config(), &to_save))?;
        self.save(&to_save)
    }

    /// Set a single dotted key, e.g. `app.first_run`.
    pub fn set_value(&self, dotted_key: &str, value: Value) -> Result<(), ChatError> {
        let mut patch = value;
        for part in dotted_key.rsplit('.') {
            let mut map = Map::new();
            map.insert(part.to_string(), patch);
            patch = Value::Object(map);
        }
        self.update_config(patch, true)
    }

    fn save(&self, config: &Value) -> Result<(), ChatError> {
        let path = self.config_path();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let yaml = serde_yaml::to_string(config).map_err(ChatError::storage)?;
        fs::write(&path, yaml).map_err(ChatError::storage)?;
        Ok(())
    }
}

fn load_yaml_file(path: &Path) -> Value {
    if !path.exists() {
        return Value::Object(Map::new());
    }

    match fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Value>(&contents) {
            Ok(value) => match value {
                Value::Object(_) => value,
                _ => Value::Object(Map::new()),
            },
            Err(_) => Value::Object(Map::new()),
        },
        Err(_) => Value::Object(Map::new()),
    }
}

pub fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_merges_objects_and_overrides_scalars() {
        let base = json!({
            "a": 1,
            "b": { "c": 2, "d": 3 },
            "arr": [1, 2]
        });
        let override_value = json!({
            "b": { "c": 99 },
            "arr": [3],
            "e": "x"
        });

        let merged = deep_merge(&base, &override_value);

        assert_eq!(
            merged,
            json!({
                "a": 1,
                "b": { "c": 99, "d": 3 },
                "arr": [3],
                "e": "x"
            })
        );
    }

    #[test]
    fn load_config_without_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().to_path_buf());
        let service = ConfigService::new(Arc::new(paths));

        let config = service.load_config().unwrap();
        assert_eq!(
            config["generation"]["context_size"],
            default_config()["generation"]["context_size"]
        );
        assert_eq!(config["app"]["first_run"], json!(true));
    }

    #[test]
    fn set_value_persists_a_dotted_key() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().to_path_buf());
        let service = ConfigService::new(Arc::new(paths));

        service.set_value("app.first_run", json!(false)).unwrap();

        let config = service.load_config().unwrap();
        assert_eq!(config["app"]["first_run"], json!(false));
        assert_eq!(config["app"]["theme"], json!("dark"));
    }
}
