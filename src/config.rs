use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_JOB_CONCURRENCY: usize = 1;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 30_000;
const DEFAULT_RECOVERY_GRACE_MS: u64 = 5_000;
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Resource ceilings for one sandboxed program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    /// 0 leaves the operation count unbounded; the deadline still applies.
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
    pub max_log_lines: usize,
    pub max_program_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_operations: 0,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 10_000,
            max_call_levels: 64,
            max_expr_depth: 128,
            max_log_lines: 10_000,
            max_program_bytes: 256 * 1024,
        }
    }
}

impl SandboxLimits {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_operations: optional_setting_u64(
                settings,
                "SANDBOX_MAX_OPERATIONS",
                defaults.max_operations,
                0,
            )?,
            max_string_size: optional_setting_usize(
                settings,
                "SANDBOX_MAX_STRING_SIZE",
                defaults.max_string_size,
                1,
            )?,
            max_array_size: optional_setting_usize(
                settings,
                "SANDBOX_MAX_ARRAY_SIZE",
                defaults.max_array_size,
                1,
            )?,
            max_map_size: optional_setting_usize(
                settings,
                "SANDBOX_MAX_MAP_SIZE",
                defaults.max_map_size,
                1,
            )?,
            max_call_levels: optional_setting_usize(
                settings,
                "SANDBOX_MAX_CALL_LEVELS",
                defaults.max_call_levels,
                1,
            )?,
            max_expr_depth: optional_setting_usize(
                settings,
                "SANDBOX_MAX_EXPR_DEPTH",
                defaults.max_expr_depth,
                1,
            )?,
            max_log_lines: optional_setting_usize(
                settings,
                "SANDBOX_MAX_LOG_LINES",
                defaults.max_log_lines,
                1,
            )?,
            max_program_bytes: optional_setting_usize(
                settings,
                "SANDBOX_MAX_PROGRAM_BYTES",
                defaults.max_program_bytes,
                1,
            )?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub job_concurrency: usize,
    pub job_timeout: Duration,
    pub poll_interval: Duration,
    pub recovery_interval: Duration,
    /// How long past its deadline a running record must be before the
    /// recovery sweep treats its worker as dead.
    pub recovery_grace: Duration,
    pub sandbox: SandboxLimits,
    pub prelude_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            job_concurrency: DEFAULT_JOB_CONCURRENCY,
            job_timeout: Duration::from_millis(DEFAULT_JOB_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            recovery_interval: Duration::from_millis(DEFAULT_RECOVERY_INTERVAL_MS),
            recovery_grace: Duration::from_millis(DEFAULT_RECOVERY_GRACE_MS),
            sandbox: SandboxLimits::default(),
            prelude_path: None,
        }
    }
}

impl SchedulerConfig {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let job_concurrency = optional_setting_usize(
            settings,
            "JOB_CONCURRENCY",
            DEFAULT_JOB_CONCURRENCY,
            1,
        )?;
        let job_timeout_ms =
            optional_setting_u64(settings, "JOB_TIMEOUT_MS", DEFAULT_JOB_TIMEOUT_MS, 1)?;
        let poll_interval_ms = optional_setting_u64(
            settings,
            "JOB_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
            1,
        )?;
        let recovery_interval_ms = optional_setting_u64(
            settings,
            "JOB_RECOVERY_INTERVAL_MS",
            DEFAULT_RECOVERY_INTERVAL_MS,
            1,
        )?;
        let recovery_grace_ms = optional_setting_u64(
            settings,
            "JOB_RECOVERY_GRACE_MS",
            DEFAULT_RECOVERY_GRACE_MS,
            0,
        )?;
        let prelude_path = optional_setting(settings, "SANDBOX_PRELUDE_PATH").map(PathBuf::from);

        Ok(Self {
            job_concurrency,
            job_timeout: Duration::from_millis(job_timeout_ms),
            poll_interval: Duration::from_millis(poll_interval_ms),
            recovery_interval: Duration::from_millis(recovery_interval_ms),
            recovery_grace: Duration::from_millis(recovery_grace_ms),
            sandbox: SandboxLimits::from_settings_map(settings)?,
            prelude_path,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub scheduler: SchedulerConfig,
}

impl ServiceConfig {
    /// Reads the process environment, after loading `.env` when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let settings: HashMap<String, String> = std::env::vars().collect();
        Self::from_settings_map(&settings)
    }

    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        Ok(Self {
            bind_addr: optional_setting(settings, "BIND_ADDR")
                .unwrap_or(DEFAULT_BIND_ADDR)
                .to_string(),
            database_url: optional_setting(settings, "DATABASE_URL").map(str::to_string),
            scheduler: SchedulerConfig::from_settings_map(settings)?,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_u64(
    settings: &HashMap<String, String>,
    key: &str,
    default: u64,
    min: u64,
) -> Result<u64> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a non-negative integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let value = optional_setting_u64(settings, key, default as u64, min as u64)?;
    usize::try_from(value).map_err(|_| anyhow!("Setting {} is too large (value: {})", key, value))
}
