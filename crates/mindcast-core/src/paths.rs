//! Path configuration for the training pipeline.
//!
//! Resolves the three directories every run needs:
//! - **Data directory**: stimulus archive, captions, voxel/behavior arrays
//! - **Cache directory**: precomputed embedding and latent tables
//! - **Output directory**: checkpoints and metric logs
//!
//! Resolution priority: CLI arguments, then environment variables, then a
//! TOML config file (`~/.config/mindcast/config.toml`), then OS defaults.

use clap::Parser;
use directories::ProjectDirs;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

static GLOBAL_CONFIG: OnceCell<PathConfig> = OnceCell::new();

/// CLI arguments for path configuration. Flatten into a larger parser with
/// `#[command(flatten)]`.
#[derive(Parser, Debug, Clone, Default)]
pub struct PathArgs {
    /// Directory holding the dataset (images, captions, voxels, behavior)
    #[arg(long, env = "MINDCAST_DATA_DIR")]
    pub data_path: Option<PathBuf>,

    /// Directory holding precomputed embedding/latent tables
    #[arg(long, env = "MINDCAST_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Directory for checkpoints and metric logs
    #[arg(long, env = "MINDCAST_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Base directory for all mindcast files (overrides individual paths)
    #[arg(long, env = "MINDCAST_BASE_DIR")]
    pub base_dir: Option<PathBuf>,
}

/// Path configuration from a TOML config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathConfigFile {
    pub data_path: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub base_dir: Option<PathBuf>,
}

/// Resolved path configuration.
#[derive(Debug, Clone)]
pub struct PathConfig {
    data_path: PathBuf,
    cache_dir: PathBuf,
    output_dir: PathBuf,
}

impl PathConfig {
    /// Create configuration from parsed `PathArgs`.
    pub fn from_path_args(args: PathArgs) -> Self {
        let file_config = Self::load_config_file(None);

        let base_dir = args
            .base_dir
            .or(file_config.base_dir.clone())
            .or_else(|| env::var("MINDCAST_BASE_DIR").ok().map(PathBuf::from));

        let defaults = Self::default_dirs();

        let data_path = args
            .data_path
            .or_else(|| base_dir.as_ref().map(|b| b.join("data")))
            .or(file_config.data_path)
            .unwrap_or(defaults.0);

        let cache_dir = args
            .cache_dir
            .or_else(|| base_dir.as_ref().map(|b| b.join("cache")))
            .or(file_config.cache_dir)
            .unwrap_or(defaults.1);

        let output_dir = args
            .output_dir
            .or_else(|| base_dir.as_ref().map(|b| b.join("train_logs")))
            .or(file_config.output_dir)
            .unwrap_or(defaults.2);

        PathConfig {
            data_path,
            cache_dir,
            output_dir,
        }
    }

    pub fn builder() -> PathConfigBuilder {
        PathConfigBuilder::default()
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Checkpoint/log directory for a named model under the output dir.
    pub fn model_dir(&self, model_name: &str) -> PathBuf {
        self.output_dir.join(model_name)
    }

    /// Ensure all directories exist, creating them if necessary.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_path)?;
        fs::create_dir_all(&self.cache_dir)?;
        fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }

    /// Get the global configuration instance.
    pub fn global() -> &'static PathConfig {
        GLOBAL_CONFIG.get_or_init(|| PathConfig::from_path_args(PathArgs::default()))
    }

    /// Set the global configuration. Returns Err if already initialized.
    pub fn set_global(config: PathConfig) -> Result<(), PathConfig> {
        GLOBAL_CONFIG.set(config)
    }

    pub fn print_summary(&self) {
        println!("Mindcast paths:");
        println!("  Data:   {:?}", self.data_path);
        println!("  Cache:  {:?}", self.cache_dir);
        println!("  Output: {:?}", self.output_dir);
    }

    fn default_dirs() -> (PathBuf, PathBuf, PathBuf) {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "mindcast") {
            (
                proj_dirs.data_dir().to_path_buf(),
                proj_dirs.cache_dir().to_path_buf(),
                proj_dirs.data_dir().join("train_logs"),
            )
        } else {
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            (
                cwd.join(".mindcast/data"),
                cwd.join(".mindcast/cache"),
                cwd.join("train_logs"),
            )
        }
    }

    fn load_config_file(path: Option<&Path>) -> PathConfigFile {
        let config_path = path.map(PathBuf::from).or_else(|| {
            ProjectDirs::from("", "", "mindcast").map(|dirs| dirs.config_dir().join("config.toml"))
        });

        if let Some(path) = config_path {
            if path.exists() {
                if let Ok(contents) = fs::read_to_string(&path) {
                    if let Ok(config) = toml::from_str::<PathConfigFile>(&contents) {
                        return config;
                    }
                }
            }
        }
        PathConfigFile::default()
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let (data, cache, output) = Self::default_dirs();
        PathConfig {
            data_path: data,
            cache_dir: cache,
            output_dir: output,
        }
    }
}

/// Builder for `PathConfig`.
#[derive(Debug, Clone, Default)]
pub struct PathConfigBuilder {
    data_path: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    base_dir: Option<PathBuf>,
}

impl PathConfigBuilder {
    pub fn data_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn cache_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    pub fn output_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    pub fn base_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_dir = Some(path.into());
        self
    }

    pub fn build(self) -> PathConfig {
        let (data_default, cache_default, output_default) = if let Some(base) = &self.base_dir {
            (
                base.join("data"),
                base.join("cache"),
                base.join("train_logs"),
            )
        } else {
            PathConfig::default_dirs()
        };

        PathConfig {
            data_path: self.data_path.unwrap_or(data_default),
            cache_dir: self.cache_dir.unwrap_or(cache_default),
            output_dir: self.output_dir.unwrap_or(output_default),
        }
    }
}
