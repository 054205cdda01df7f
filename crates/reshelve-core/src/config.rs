use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ignore_patterns: Vec<String>,
    pub ignore_folders: Vec<String>,
    pub skip_hidden: bool,
    pub min_size: u64,
    pub ext_include: Option<Vec<String>>,
    pub ext_exclude: Option<Vec<String>>,
    pub catch_all_template: String,
    pub case_insensitive: bool,
    pub allow_cross_device: bool,
    /// Executor worker threads; 0 lets rayon pick.
    pub workers: usize,
    pub cluster: ClusterConfig,
    pub advisor: AdvisorConfig,
    pub summary: SummaryConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub min_cluster_size: usize,
    pub gap_hours: i64,
    pub min_stem_len: usize,
    pub sample_files: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub command: Option<String>,
    pub retries: u32,
    pub batch_size: usize,
    pub delay_secs: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub sample_size: usize,
    pub folder_samples: usize,
    pub max_folders: usize,
}

pub const DEFAULT_CATCH_ALL_TEMPLATE: &str = "Uncategorized/{original_name}";

pub const SYSTEM_FOLDERS: &[&str] = &[
    "System Volume Information",
    "$RECYCLE.BIN",
    ".fseventsd",
    ".Spotlight-V100",
    ".Trashes",
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            ignore_folders: SYSTEM_FOLDERS.iter().map(|s| s.to_string()).collect(),
            skip_hidden: true,
            min_size: 0,
            ext_include: None,
            ext_exclude: None,
            catch_all_template: DEFAULT_CATCH_ALL_TEMPLATE.to_string(),
            case_insensitive: cfg!(any(target_os = "macos", target_os = "windows")),
            allow_cross_device: false,
            workers: 0,
            cluster: ClusterConfig::default(),
            advisor: AdvisorConfig {
                command: None,
                retries: 2,
                batch_size: 500,
                delay_secs: 0.0,
            },
            summary: SummaryConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 10,
            gap_hours: 24,
            min_stem_len: 4,
            sample_files: 5,
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            sample_size: 5000,
            folder_samples: 30,
            max_folders: 500,
        }
    }
}

/// Load `Reshelve.toml` (optional) with `RESHELVE_*` environment overrides.
/// Nested keys use a double underscore, e.g. `RESHELVE_CLUSTER__GAP_HOURS=12`.
pub fn load_configuration() -> Result<AppConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Reshelve").required(false))
        .add_source(Environment::with_prefix("RESHELVE").separator("__"))
        .build()?;
    builder.try_deserialize::<AppConfig>()
}

/// Normalize a user-supplied extension list to lowercase, dot-less entries.
pub fn normalize_extensions(exts: &[String]) -> Vec<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}
