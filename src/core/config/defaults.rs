use serde_json::{json, Value};

/// Built-in configuration. The on-disk `config.yml` is deep-merged over this,
/// so a fresh install works with no file present and user files only need to
/// name the keys they change.
pub fn default_config() -> Value {
    json!({
        "generation": {
            "temperature": 0.8,
            "top_p": 0.95,
            "max_tokens": 512,
            "context_size": 8192,
            "summary_budget": 512,
            "memory_budget": 512,
            "lorebook_budget": 768,
            "example_dialogue_budget": 768,
            "response_reserve": 512,
        },
        "model": {
            "path": null,
            "gpu_layers": -1,
        },
        "sidecar": {
            "port": 0,
            "health_timeout_secs": 30,
        },
        "app": {
            "first_run": true,
            "theme": "dark",
            "max_message_length": 8000,
        },
    })
}
