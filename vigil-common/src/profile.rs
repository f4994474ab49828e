//! Profile-driven sizing configuration.
//!
//! A profile file enumerates deployment profiles as TOML tables under
//! `[profiles.<name>]`. Services select one profile (flag or
//! `CONFIG_PROFILE`), optionally point at an alternate file (`CONFIG_PATH`),
//! and may override any nested field through the environment:
//! `CFG__section__subsection=value`, with bool/int/float/string inference.
//!
//! Derived sizing (total pipelines, total client capacity) is computed once
//! at load time; the rate-limiter admission bound is floored by the derived
//! capacity so a profile can never admit more clients than its pipelines
//! carry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Environment variable selecting the profile name.
pub const ENV_PROFILE: &str = "CONFIG_PROFILE";
/// Environment variable overriding the profile file path.
pub const ENV_CONFIG_PATH: &str = "CONFIG_PATH";
/// Prefix for nested field overrides.
pub const ENV_OVERRIDE_PREFIX: &str = "CFG__";

/// Profile name used when neither flag nor environment selects one.
pub const DEFAULT_PROFILE: &str = "prod-1gpu-24gb";

/// Errors raised while loading a profile.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The profile file could not be read.
    #[error("cannot read profile file {path}: {source}")]
    Io {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying io error.
        source: std::io::Error,
    },
    /// The profile file is not valid TOML.
    #[error("invalid profile file: {0}")]
    Parse(#[from] toml::de::Error),
    /// The requested profile is not defined.
    #[error("profile '{0}' is not defined")]
    UnknownProfile(String),
}

#[derive(Debug, Deserialize)]
struct ProfilesFile {
    profiles: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    #[serde(default)]
    description: Option<String>,
    hardware: HardwareProfile,
    pipeline: RawPipeline,
    #[serde(default)]
    capacity: RawCapacity,
    #[serde(default)]
    rate_limiter: RawRateLimiter,
    #[serde(default)]
    storage: StorageSettings,
    #[serde(default)]
    services: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    pipelines_per_server: u32,
    #[serde(default)]
    pipelines_per_gpu: Option<u32>,
    max_clients_per_pipeline: u32,
}

#[derive(Debug, Default, Deserialize)]
struct RawCapacity {
    #[serde(default)]
    hard_limit_clients: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRateLimiter {
    #[serde(default)]
    max_clients: Option<u32>,
    #[serde(default)]
    window_ms: Option<u64>,
    #[serde(default)]
    cleanup_ms: Option<u64>,
}

/// Physical sizing of the deployment.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HardwareProfile {
    /// Number of servers in the deployment.
    pub servers: u32,
    /// GPUs per server.
    pub gpus_per_server: u32,
    /// Total GPUs across all servers.
    pub total_gpus: u32,
    /// Memory per GPU.
    pub gpu_memory_gb: u32,
}

/// Pipeline sizing, with derived totals.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// Pipeline workers per server.
    pub pipelines_per_server: u32,
    /// Pipeline workers per GPU.
    pub pipelines_per_gpu: u32,
    /// Queue-length bound (and informational capacity) per pipeline.
    pub max_clients_per_pipeline: u32,
    /// `pipelines_per_server * servers`.
    pub total_pipelines: u32,
    /// Designed client capacity, capped by `capacity.hard_limit_clients`.
    pub total_capacity: u32,
}

/// Sliding-window admission settings.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    /// Maximum distinct active clients per window.
    pub max_clients: u32,
    /// Window length.
    pub window: Duration,
    /// Sweep interval for stale entries.
    pub cleanup_interval: Duration,
}

/// Object-storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Storage backend identifier, carried in frame envelopes.
    pub provider: String,
    /// Bucket holding frame and action objects.
    pub frames_bucket: String,
    /// Retention of the `frames/` prefix, in hours.
    pub retention_hours: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            provider: "s3".to_owned(),
            frames_bucket: "face-frames".to_owned(),
            retention_hours: 24,
        }
    }
}

/// One fully-resolved deployment profile.
#[derive(Debug, Clone)]
pub struct ConfigProfile {
    /// Name of the profile this was loaded from.
    pub name: String,
    /// Free-form description from the profile file.
    pub description: Option<String>,
    /// Physical sizing.
    pub hardware: HardwareProfile,
    /// Pipeline sizing with derived totals.
    pub pipeline: PipelineConfig,
    /// Storage settings.
    pub storage: StorageSettings,
    rate_limiter: RateLimiterConfig,
    services: BTreeMap<String, toml::Value>,
}

impl ConfigProfile {
    /// Loads `profile_name` from the file at `path`, applying `CFG__`
    /// environment overrides.
    ///
    /// Both arguments fall back to the environment (`CONFIG_PROFILE`,
    /// `CONFIG_PATH`) and then to built-in defaults.
    pub fn load(
        path: Option<&Path>,
        profile_name: Option<&str>,
    ) -> Result<Self, ProfileError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_PATH).ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/profiles.toml"));
        let raw = std::fs::read_to_string(&path)
            .map_err(|source| ProfileError::Io { path: path.clone(), source })?;
        let env_profile = std::env::var(ENV_PROFILE).ok();
        let name = profile_name
            .map(str::to_owned)
            .or(env_profile)
            .unwrap_or_else(|| DEFAULT_PROFILE.to_owned());
        Self::from_toml(&raw, &name, std::env::vars())
    }

    /// Parses a profile out of raw TOML, applying overrides from the given
    /// environment iterator. Split out of [`ConfigProfile::load`] so tests
    /// can drive it without touching the process environment.
    pub fn from_toml(
        raw: &str,
        profile_name: &str,
        env: impl Iterator<Item = (String, String)>,
    ) -> Result<Self, ProfileError> {
        let file: ProfilesFile = toml::from_str(raw)?;
        let mut profile = file
            .profiles
            .get(profile_name)
            .cloned()
            .ok_or_else(|| ProfileError::UnknownProfile(profile_name.to_owned()))?;
        for (key, value) in env {
            if let Some(path) = key.strip_prefix(ENV_OVERRIDE_PREFIX) {
                apply_override(&mut profile, path, &value);
            }
        }
        let raw: RawProfile = profile.try_into()?;

        let total_pipelines = raw.pipeline.pipelines_per_server * raw.hardware.servers;
        let mut total_capacity = total_pipelines * raw.pipeline.max_clients_per_pipeline;
        if let Some(hard_limit) = raw.capacity.hard_limit_clients {
            total_capacity = total_capacity.min(hard_limit);
        }
        let pipeline = PipelineConfig {
            pipelines_per_server: raw.pipeline.pipelines_per_server,
            pipelines_per_gpu: raw
                .pipeline
                .pipelines_per_gpu
                .unwrap_or(raw.pipeline.pipelines_per_server),
            max_clients_per_pipeline: raw.pipeline.max_clients_per_pipeline,
            total_pipelines,
            total_capacity,
        };
        let window_ms = raw.rate_limiter.window_ms.unwrap_or(6000);
        let rate_limiter = RateLimiterConfig {
            max_clients: raw.rate_limiter.max_clients.unwrap_or(total_capacity),
            window: Duration::from_millis(window_ms),
            cleanup_interval: Duration::from_millis(
                raw.rate_limiter.cleanup_ms.unwrap_or(window_ms),
            ),
        };
        Ok(Self {
            name: profile_name.to_owned(),
            description: raw.description,
            hardware: raw.hardware,
            pipeline,
            storage: raw.storage,
            rate_limiter,
            services: raw.services,
        })
    }

    /// Rate-limiter settings, floored by the profile's designed capacity.
    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_clients: self
                .rate_limiter
                .max_clients
                .max(self.pipeline.total_capacity),
            ..self.rate_limiter
        }
    }

    /// Free-form per-service settings table, if the profile defines one.
    pub fn service_settings(&self, service: &str) -> Option<&toml::Value> {
        self.services.get(&service.to_lowercase())
    }
}

/// Writes `raw_value` at the `__`-separated `path` inside `target`,
/// creating intermediate tables as needed. Scalars are inferred in the
/// order bool, integer, float, string.
fn apply_override(target: &mut toml::Value, path: &str, raw_value: &str) {
    let segments: Vec<String> = path
        .split("__")
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = target;
    for segment in parents {
        let table = match cursor {
            toml::Value::Table(table) => table,
            _ => return,
        };
        cursor = table
            .entry(segment.clone())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }
    if let toml::Value::Table(table) = cursor {
        table.insert(last.clone(), infer_scalar(raw_value));
    }
}

fn infer_scalar(raw: &str) -> toml::Value {
    let normalised = raw.trim();
    match normalised.to_lowercase().as_str() {
        "true" => return toml::Value::Boolean(true),
        "false" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(int) = normalised.parse::<i64>() {
        return toml::Value::Integer(int);
    }
    if let Ok(float) = normalised.parse::<f64>() {
        return toml::Value::Float(float);
    }
    toml::Value::String(raw.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"
        [profiles.test]
        description = "two pipelines on one box"

        [profiles.test.hardware]
        servers = 1
        gpus_per_server = 1
        total_gpus = 1
        gpu_memory_gb = 24

        [profiles.test.pipeline]
        pipelines_per_server = 2
        max_clients_per_pipeline = 50

        [profiles.test.capacity]
        hard_limit_clients = 80

        [profiles.test.rate_limiter]
        window_ms = 6000

        [profiles.test.services.gateway]
        bind = "0.0.0.0:8765"
    "#;

    fn no_env() -> impl Iterator<Item = (String, String)> {
        std::iter::empty()
    }

    #[test]
    fn derives_capacity_and_floors_rate_limit() {
        let profile = ConfigProfile::from_toml(PROFILES, "test", no_env()).unwrap();
        assert_eq!(profile.pipeline.total_pipelines, 2);
        // 2 * 50, capped by the hard limit
        assert_eq!(profile.pipeline.total_capacity, 80);
        let rl = profile.rate_limiter();
        assert_eq!(rl.max_clients, 80);
        assert_eq!(rl.window, Duration::from_millis(6000));
        assert_eq!(rl.cleanup_interval, Duration::from_millis(6000));
    }

    #[test]
    fn env_overrides_nested_fields_with_type_inference() {
        let env = [
            ("CFG__PIPELINE__MAX_CLIENTS_PER_PIPELINE", "10"),
            ("CFG__STORAGE__PROVIDER", "minio"),
            ("CFG__RATE_LIMITER__WINDOW_MS", "250"),
            ("UNRELATED", "ignored"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()));
        let profile = ConfigProfile::from_toml(PROFILES, "test", env).unwrap();
        assert_eq!(profile.pipeline.max_clients_per_pipeline, 10);
        assert_eq!(profile.storage.provider, "minio");
        assert_eq!(
            profile.rate_limiter().window,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let err = ConfigProfile::from_toml(PROFILES, "nope", no_env()).unwrap_err();
        assert!(matches!(err, ProfileError::UnknownProfile(name) if name == "nope"));
    }

    #[test]
    fn service_settings_are_exposed() {
        let profile = ConfigProfile::from_toml(PROFILES, "test", no_env()).unwrap();
        let gateway = profile.service_settings("Gateway").unwrap();
        assert_eq!(
            gateway.get("bind").and_then(|v| v.as_str()),
            Some("0.0.0.0:8765")
        );
    }
}
