//! Configuration resolution for spk-sa
//!
//! Each setting resolves with priority ENV → TOML → compiled default. Stage timeouts
//! have one more tier above all of these: overrides stored in the `settings` table,
//! merged at the start of every pipeline run.

use spk_common::config::TomlConfig;
use spk_common::events::StageName;
use spk_common::{Error, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::upload::UploadPolicy;

pub const DEFAULT_PORT: u16 = 5741;
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_ML_SERVICE_URL: &str = "http://127.0.0.1:8000";

/// Resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub port: u16,
    pub ml_service_url: String,
    /// Connection setup bound for ML service calls
    pub ml_connect_timeout: Duration,
    pub stage_timeouts: HashMap<StageName, Duration>,
    /// Interval between SSE keepalive comments
    pub keepalive_interval: Duration,
    /// Buffered events per session channel before slow subscribers lag
    pub event_channel_capacity: usize,
    pub max_subscribers_per_session: usize,
    pub upload: UploadPolicy,
    /// Start analysis as soon as audio is uploaded
    pub auto_start_on_upload: bool,
    /// Resume sessions left `processing` by a previous process
    pub resume_interrupted_on_startup: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            ml_service_url: DEFAULT_ML_SERVICE_URL.to_string(),
            ml_connect_timeout: Duration::from_secs(5),
            stage_timeouts: default_stage_timeouts(),
            keepalive_interval: Duration::from_secs(15),
            event_channel_capacity: 256,
            max_subscribers_per_session: 8,
            upload: UploadPolicy::default(),
            auto_start_on_upload: false,
            resume_interrupted_on_startup: true,
        }
    }
}

fn default_stage_timeouts() -> HashMap<StageName, Duration> {
    StageName::ALL
        .iter()
        .map(|stage| {
            let secs = match stage {
                StageName::Transcription => 120,
                StageName::Metrics => 30,
                StageName::PitchEvaluation | StageName::Questions | StageName::Feedback => 60,
            };
            (*stage, Duration::from_secs(secs))
        })
        .collect()
}

/// Environment variable carrying the timeout override for one stage
pub fn stage_timeout_env_var(stage: StageName) -> String {
    format!("SPK_SA_STAGE_TIMEOUT_MS_{}", stage.as_str().to_uppercase())
}

impl ServiceConfig {
    /// Resolve from environment and TOML, falling back to defaults
    pub fn resolve(toml_config: &TomlConfig) -> Result<Self> {
        let defaults = ServiceConfig::default();

        let bind_address = env_value::<String>("SPK_SA_BIND_ADDRESS")?
            .or_else(|| toml_config.bind_address.clone())
            .unwrap_or(defaults.bind_address);
        let port = env_value("SPK_SA_PORT")?
            .or(toml_config.port)
            .unwrap_or(defaults.port);
        let ml_service_url = env_value::<String>("SPK_ML_SERVICE_URL")?
            .or_else(|| toml_config.ml_service_url.clone())
            .unwrap_or(defaults.ml_service_url);
        let keepalive_secs = env_value("SPK_SA_KEEPALIVE_SECS")?
            .or(toml_config.keepalive_secs)
            .unwrap_or(defaults.keepalive_interval.as_secs());
        let event_channel_capacity = env_value("SPK_SA_EVENT_CHANNEL_CAPACITY")?
            .or(toml_config.event_channel_capacity)
            .unwrap_or(defaults.event_channel_capacity);
        let max_subscribers_per_session = env_value("SPK_SA_MAX_SUBSCRIBERS")?
            .or(toml_config.max_subscribers_per_session)
            .unwrap_or(defaults.max_subscribers_per_session);
        let max_upload_bytes = env_value("SPK_SA_MAX_UPLOAD_BYTES")?
            .or(toml_config.max_upload_bytes)
            .unwrap_or(defaults.upload.max_bytes);
        let auto_start_on_upload = env_value("SPK_SA_AUTO_START_ON_UPLOAD")?
            .or(toml_config.auto_start_on_upload)
            .unwrap_or(defaults.auto_start_on_upload);
        let resume_interrupted_on_startup = env_value("SPK_SA_RESUME_INTERRUPTED")?
            .or(toml_config.resume_interrupted_on_startup)
            .unwrap_or(defaults.resume_interrupted_on_startup);

        let mut stage_timeouts = defaults.stage_timeouts;
        for (name, ms) in &toml_config.stage_timeouts_ms {
            match name.parse::<StageName>() {
                Ok(stage) => {
                    stage_timeouts.insert(stage, Duration::from_millis(*ms));
                }
                Err(_) => warn!("Ignoring timeout for unknown stage '{}' in TOML config", name),
            }
        }
        for stage in StageName::ALL {
            if let Some(ms) = env_value::<u64>(&stage_timeout_env_var(stage))? {
                stage_timeouts.insert(stage, Duration::from_millis(ms));
            }
        }

        if event_channel_capacity == 0 {
            return Err(Error::Config("event_channel_capacity must be at least 1".to_string()));
        }
        if max_subscribers_per_session == 0 {
            return Err(Error::Config(
                "max_subscribers_per_session must be at least 1".to_string(),
            ));
        }

        let config = ServiceConfig {
            bind_address,
            port,
            ml_service_url,
            ml_connect_timeout: defaults.ml_connect_timeout,
            stage_timeouts,
            keepalive_interval: Duration::from_secs(keepalive_secs.max(1)),
            event_channel_capacity,
            max_subscribers_per_session,
            upload: UploadPolicy {
                max_bytes: max_upload_bytes,
                ..defaults.upload
            },
            auto_start_on_upload,
            resume_interrupted_on_startup,
        };

        info!(
            bind = %config.bind_address,
            port = config.port,
            ml_service_url = %config.ml_service_url,
            auto_start_on_upload = config.auto_start_on_upload,
            "Service configuration resolved"
        );

        Ok(config)
    }

    /// Timeout for one stage call
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        self.stage_timeouts
            .get(&stage)
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    /// Stage timeouts with database overrides applied on top
    pub fn stage_timeouts_with(&self, overrides: &HashMap<StageName, Duration>) -> HashMap<StageName, Duration> {
        let mut timeouts = self.stage_timeouts.clone();
        timeouts.extend(overrides.iter().map(|(stage, timeout)| (*stage, *timeout)));
        timeouts
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Read and parse an environment variable; empty values count as unset
fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e))),
        _ => Ok(None),
    }
}
