use std::path::Path;

use serde::Serialize;

use crate::core::config::{AppPaths, GenerationSettings};

/// Inference binary variant recommended for this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVariant {
    Cpu,
    Cuda,
    Rocm,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupStatus {
    pub is_complete: bool,
    pub missing_binary: bool,
    pub missing_model: bool,
    pub recommended_variant: GpuVariant,
    pub detected_gpu: Option<String>,
}

/// Pure hardware probe: recommend a binary variant from what the host
/// exposes. The downloader uses the recommendation to pick a URL; nothing in
/// the core dispatches on it at runtime.
pub fn probe_gpu() -> (GpuVariant, Option<String>) {
    if which::which("nvidia-smi").is_ok() || Path::new("/proc/driver/nvidia/version").exists() {
        let detail = std::fs::read_to_string("/proc/driver/nvidia/version")
            .ok()
            .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
            .unwrap_or_else(|| "NVIDIA GPU".to_string());
        return (GpuVariant::Cuda, Some(detail));
    }

    if which::which("rocm-smi").is_ok() || Path::new("/opt/rocm").exists() {
        return (GpuVariant::Rocm, Some("AMD ROCm".to_string()));
    }

    (GpuVariant::Cpu, None)
}

/// Combined onboarding state for the view's setup flow.
pub fn setup_status(paths: &AppPaths, settings: &GenerationSettings) -> SetupStatus {
    let missing_binary = crate::sidecar::resolve_binary(paths).is_none();
    let missing_model = match &settings.model_path {
        Some(path) => !path.exists(),
        None => !has_any_model(paths),
    };
    let (recommended_variant, detected_gpu) = probe_gpu();

    SetupStatus {
        is_complete: !missing_binary && !missing_model,
        missing_binary,
        missing_model,
        recommended_variant,
        detected_gpu,
    }
}

fn has_any_model(paths: &AppPaths) -> bool {
    std::fs::read_dir(&paths.models_dir)
        .map(|entries| {
            entries.flatten().any(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("gguf"))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::defaults::default_config;

    #[test]
    fn missing_everything_reports_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().to_path_buf());
        let settings = GenerationSettings::from_config(&default_config());

        // No model configured and no gguf files present.
        let status = setup_status(&paths, &settings);
        assert!(status.missing_model);
        assert!(!status.is_complete);
    }

    #[test]
    fn model_in_models_dir_counts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(dir.path().to_path_buf());
        std::fs::write(paths.models_dir.join("tiny.gguf"), b"gguf").unwrap();

        let settings = GenerationSettings::from_config(&default_config());
        let status = setup_status(&paths, &settings);
        assert!(!status.missing_model);
    }
}
