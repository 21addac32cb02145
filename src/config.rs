use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub recording: RecordingConfig,
    pub upload: UploadConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    pub capture: Option<CaptureConfig>,
    pub archive: Option<ArchiveConfig>,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:5173".to_string()]
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    pub folder: PathBuf,
    pub data_file: Option<String>,
    pub tracker_type: String,
    pub index_html: PathBuf,
}

impl RecordingConfig {
    /// Trajectory array location, `{folder}/output_data/{tracker}_body_3d_xyz.npy` unless overridden.
    pub fn get_data_path(&self) -> PathBuf {
        let file_name = self
            .data_file
            .clone()
            .unwrap_or_else(|| format!("{}_body_3d_xyz.npy", self.tracker_type));
        self.folder.join("output_data").join(file_name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    pub output_dir: PathBuf,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fourcc")]
    pub fourcc: String,
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_status_retention")]
    pub status_retention: usize,
    pub composite: Option<CompositeConfig>,
}

impl UploadConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}

fn default_fps() -> f64 {
    30.0
}

fn default_batch_size() -> usize {
    500
}

fn default_fourcc() -> String {
    "mp4v".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_max_body_bytes() -> usize {
    1 << 30
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_status_retention() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompositeConfig {
    pub recorded_video: PathBuf,
    pub layout: CompositeLayout,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompositeLayout {
    SideBySide,
    Overlay,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EncodingConfig {
    #[serde(default = "default_quality")]
    pub quality: i32,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
        }
    }
}

fn default_quality() -> i32 {
    70
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    pub video: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    pub sources: Vec<PathBuf>,
    #[serde(default = "default_archive_workers")]
    pub workers: usize,
    #[serde(default = "default_quality")]
    pub quality: i32,
}

fn default_archive_workers() -> usize {
    10
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

fn require_file(path: &Path, what: &str) -> Result<(), String> {
    if !path.is_file() {
        return Err(format!("{} not found: {:?}", what, path));
    }
    Ok(())
}

impl Validatable for RecordingConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.folder.is_dir() {
            return Err(format!("Recording folder not found: {:?}", self.folder));
        }
        if !self.get_data_path().exists() {
            tracing::warn!(
                "Trajectory file {:?} does not exist yet, /data will fail until it does",
                self.get_data_path()
            );
        }
        Ok(())
    }
}

impl Validatable for UploadConfig {
    fn validate(&self) -> Result<(), String> {
        if self.fps <= 0.0 {
            return Err(format!("Upload fps must be positive, got {}", self.fps));
        }
        if self.batch_size == 0 {
            return Err("Upload batch size must be positive".to_string());
        }
        if self.fourcc.chars().count() != 4 {
            return Err(format!("Invalid fourcc code: {:?}", self.fourcc));
        }
        if self.container.is_empty()
            || !self.container.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(format!("Invalid container extension: {:?}", self.container));
        }
        if self.session_timeout_secs == 0 {
            return Err("Upload session timeout must be positive".to_string());
        }
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            format!(
                "Failed to create output directory {:?}: {}",
                self.output_dir, e
            )
        })?;
        if let Some(composite) = &self.composite {
            require_file(&composite.recorded_video, "Composite recorded video")?;
        }
        Ok(())
    }
}

impl Validatable for CaptureConfig {
    fn validate(&self) -> Result<(), String> {
        require_file(&self.video, "Capture video")
    }
}

impl Validatable for ArchiveConfig {
    fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("Archive worker count must be positive".to_string());
        }
        for source in &self.sources {
            require_file(source, "Archive source video")?;
        }
        Ok(())
    }
}

impl Validatable for Config {
    fn validate(&self) -> Result<(), String> {
        self.recording.validate()?;
        self.upload.validate()?;
        if let Some(capture) = &self.capture {
            capture.validate()?;
        }
        if let Some(archive) = &self.archive {
            archive.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

/// Loads `configuration/base.yaml`, the environment overlay and `MOCAP_*` variables.
///
/// Paths are checked here so a misconfigured server never binds its listener.
pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("MOCAP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
