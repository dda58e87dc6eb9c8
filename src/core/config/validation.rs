use serde_json::Value;

use crate::core::errors::ChatError;

/// Validate a fully-merged configuration document before it is persisted.
pub fn validate_config(config: &Value) -> Result<(), ChatError> {
    let generation = config.get("generation").and_then(|v| v.as_object());
    let Some(generation) = generation else {
        return Err(ChatError::validation("generation section missing"));
    };

    check_range_f64(generation.get("temperature"), "generation.temperature", 0.0, 2.0)?;
    check_range_f64(generation.get("top_p"), "generation.top_p", 0.0, 1.0)?;

    for key in [
        "max_tokens",
        "context_size",
        "summary_budget",
        "memory_budget",
        "lorebook_budget",
        "example_dialogue_budget",
        "response_reserve",
    ] {
        check_nonnegative_int(generation.get(key), &format!("generation.{key}"))?;
    }

    let context_size = generation
        .get("context_size")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let response_reserve = generation
        .get("response_reserve")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    if context_size <= response_reserve {
        return Err(ChatError::validation(
            "generation.context_size must exceed generation.response_reserve",
        ));
    }

    if let Some(model) = config.get("model").and_then(|v| v.as_object()) {
        if let Some(path) = model.get("path") {
            if !path.is_null() && !path.is_string() {
                return Err(ChatError::validation("model.path must be a string"));
            }
        }
        if let Some(layers) = model.get("gpu_layers") {
            if !layers.is_i64() {
                return Err(ChatError::validation("model.gpu_layers must be an integer"));
            }
        }
    }

    Ok(())
}

fn check_range_f64(value: Option<&Value>, key: &str, min: f64, max: f64) -> Result<(), ChatError> {
    let Some(value) = value else {
        return Ok(());
    };
    let Some(num) = value.as_f64() else {
        return Err(ChatError::validation(format!("{key} must be a number")));
    };
    if !(min..=max).contains(&num) {
        return Err(ChatError::validation(format!(
            "{key} must be within {min}..{max}"
        )));
    }
    Ok(())
}

fn check_nonnegative_int(value: Option<&Value>, key: &str) -> Result<(), ChatError> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.as_u64().is_none() {
        return Err(ChatError::validation(format!(
            "{key} must be a non-negative integer"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::defaults::default_config;
    use serde_json::json;

    #[test]
    fn default_config_validates() {
        assert!(validate_config(&default_config()).is_ok());
    }

    #[test]
    fn rejects_out_of_range_temperature() {
        let mut config = default_config();
        config["generation"]["temperature"] = json!(3.5);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_reserve_swallowing_the_window() {
        let mut config = default_config();
        config["generation"]["context_size"] = json!(512);
        config["generation"]["response_reserve"] = json!(512);
        assert!(validate_config(&config).is_err());
    }
}
