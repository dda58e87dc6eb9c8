use std::env;
use std::fs;
use std::path::PathBuf;

/// Filesystem layout of the application data directory.
///
/// One directory holds everything durable: the relational store, downloaded
/// model files, the inference binary, in-progress downloads, and logs.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub user_data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
}

impl AppPaths {
    pub fn new() -> Self {
        let user_data_dir = discover_user_data_dir();
        Self::at(user_data_dir)
    }

    /// Build the layout rooted at an explicit directory. Used by tests.
    pub fn at(user_data_dir: PathBuf) -> Self {
        let models_dir = user_data_dir.join("models");
        let bin_dir = user_data_dir.join("bin");
        let downloads_dir = user_data_dir.join("downloads");
        let log_dir = user_data_dir.join("logs");
        let db_path = user_data_dir.join("hearth.db");

        for dir in [
            &user_data_dir,
            &models_dir,
            &bin_dir,
            &downloads_dir,
            &log_dir,
        ] {
            let _ = fs::create_dir_all(dir);
        }

        AppPaths {
            user_data_dir,
            models_dir,
            bin_dir,
            downloads_dir,
            log_dir,
            db_path,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

fn discover_user_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("HEARTH_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if cfg!(target_os = "windows") {
        let base = env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string()));
        return PathBuf::from(base).join("Hearth");
    }

    if cfg!(target_os = "macos") {
        return home_dir()
            .join("Library")
            .join("Application Support")
            .join("Hearth");
    }

    let xdg = env::var("XDG_DATA_HOME").unwrap_or_else(|_| {
        home_dir()
            .join(".local/share")
            .to_string_lossy()
            .to_string()
    });
    PathBuf::from(xdg).join("hearth")
}

fn home_dir() -> PathBuf {
    env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}
