use std::path::PathBuf;

use serde_json::Value;

/// Typed view over the generation-relevant configuration keys.
///
/// Extracted from the merged config document at the start of each operation
/// that needs it; missing or malformed keys fall back to the built-in
/// defaults so a partially-edited config file never breaks assembly.
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    pub context_size: usize,
    pub summary_budget: usize,
    pub memory_budget: usize,
    pub lorebook_budget: usize,
    pub example_dialogue_budget: usize,
    pub response_reserve: usize,
    pub model_path: Option<PathBuf>,
    pub gpu_layers: i32,
    pub sidecar_port: u16,
    pub health_timeout_secs: u64,
    pub max_message_length: usize,
}

impl GenerationSettings {
    pub fn from_config(config: &Value) -> Self {
        let generation = config.get("generation");
        let model = config.get("model");
        let sidecar = config.get("sidecar");
        let app = config.get("app");

        GenerationSettings {
            temperature: read_f64(generation, "temperature", 0.8),
            top_p: read_f64(generation, "top_p", 0.95),
            max_tokens: read_u64(generation, "max_tokens", 512) as u32,
            context_size: read_u64(generation, "context_size", 8192) as usize,
            summary_budget: read_u64(generation, "summary_budget", 512) as usize,
            memory_budget: read_u64(generation, "memory_budget", 512) as usize,
            lorebook_budget: read_u64(generation, "lorebook_budget", 768) as usize,
            example_dialogue_budget: read_u64(generation, "example_dialogue_budget", 768) as usize,
            response_reserve: read_u64(generation, "response_reserve", 512) as usize,
            model_path: model
                .and_then(|m| m.get("path"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            gpu_layers: model
                .and_then(|m| m.get("gpu_layers"))
                .and_then(|v| v.as_i64())
                .unwrap_or(-1) as i32,
            sidecar_port: read_u64(sidecar, "port", 0) as u16,
            health_timeout_secs: read_u64(sidecar, "health_timeout_secs", 30),
            max_message_length: read_u64(app, "max_message_length", 8000) as usize,
        }
    }

    /// Tokens available for prompt input: `context_size - response_reserve`.
    pub fn input_budget(&self) -> usize {
        self.context_size.saturating_sub(self.response_reserve)
    }
}

fn read_f64(section: Option<&Value>, key: &str, default: f64) -> f64 {
    section
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

fn read_u64(section: Option<&Value>, key: &str, default: u64) -> u64 {
    section
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_u64())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::defaults::default_config;
    use serde_json::json;

    #[test]
    fn settings_from_defaults() {
        let settings = GenerationSettings::from_config(&default_config());
        assert_eq!(settings.context_size, 8192);
        assert_eq!(settings.response_reserve, 512);
        assert_eq!(settings.input_budget(), 8192 - 512);
        assert!(settings.model_path.is_none());
    }

    #[test]
    fn blank_model_path_reads_as_none() {
        let mut config = default_config();
        config["model"]["path"] = json!("   ");
        let settings = GenerationSettings::from_config(&config);
        assert!(settings.model_path.is_none());
    }
}
