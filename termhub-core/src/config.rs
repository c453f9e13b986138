// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::user;

/// Reads a [`Config`] from an explicit path if given, else from the
/// default location under the user's config directory, else falls back
/// to all-default configuration if no file is present at all.
#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let raw = if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path)
            .with_context(|| format!("reading config toml at '{config_path}'"))?;
        toml::from_str::<RawConfig>(&config_str)
            .with_context(|| format!("parsing config file '{config_path}'"))?
    } else {
        let mut config_path = default_config_path()?;
        if config_path.exists() {
            let config_str = fs::read_to_string(&config_path)
                .with_context(|| format!("reading config toml at '{}'", config_path.display()))?;
            toml::from_str::<RawConfig>(&config_str).with_context(|| {
                format!("parsing config file '{}'", config_path.display())
            })?
        } else {
            config_path.pop();
            RawConfig::default()
        }
    };

    raw.resolve()
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let info = user::info()?;
    let mut path = PathBuf::from(info.home_dir);
    path.push(".config");
    path.push("termhub");
    path.push("config.toml");
    Ok(path)
}

/// The as-parsed, all-optional configuration file shape. Every field
/// defaults when absent and is bounds-checked by [`RawConfig::resolve`].
#[derive(Deserialize, Default, Debug, Clone)]
pub struct RawConfig {
    pub enabled: Option<bool>,
    pub max_sessions_per_client: Option<usize>,
    pub max_buffer_bytes: Option<usize>,
    pub max_input_bytes: Option<usize>,
    pub max_output_chunk_bytes: Option<usize>,
    pub idle_timeout_ms: Option<u64>,
    pub hard_kill_timeout_ms: Option<u64>,
    pub exited_session_ttl_ms: Option<u64>,
    pub default_cols: Option<u16>,
    pub default_rows: Option<u16>,
    pub max_incoming_message_bytes: Option<usize>,
    pub queue_high_watermark_bytes: Option<usize>,
    pub queue_low_watermark_bytes: Option<usize>,
    pub max_queued_outbound_bytes: Option<usize>,
    pub allowed_root: Option<PathBuf>,
}

impl RawConfig {
    fn resolve(self) -> anyhow::Result<Config> {
        let max_buffer_bytes =
            bounded("max_buffer_bytes", self.max_buffer_bytes, 2 * MIB, 64 * KIB, 64 * MIB)?;
        let max_input_bytes =
            bounded("max_input_bytes", self.max_input_bytes, 256 * KIB, 256, 4 * MIB)?;
        let max_output_chunk_bytes = bounded(
            "max_output_chunk_bytes",
            self.max_output_chunk_bytes,
            128 * KIB,
            KIB,
            4 * MIB,
        )?;
        let queue_high_watermark_bytes = bounded(
            "queue_high_watermark_bytes",
            self.queue_high_watermark_bytes,
            256 * KIB,
            16 * KIB,
            16 * MIB,
        )?;
        let queue_low_watermark_bytes = bounded(
            "queue_low_watermark_bytes",
            self.queue_low_watermark_bytes,
            96 * KIB,
            8 * KIB,
            queue_high_watermark_bytes,
        )?;
        if queue_low_watermark_bytes > queue_high_watermark_bytes {
            return Err(anyhow!(
                "queue_low_watermark_bytes ({}) must not exceed queue_high_watermark_bytes ({})",
                queue_low_watermark_bytes,
                queue_high_watermark_bytes
            ));
        }

        Ok(Config {
            enabled: self.enabled.unwrap_or(true),
            max_sessions_per_client: bounded_usize(
                "max_sessions_per_client",
                self.max_sessions_per_client,
                6,
                1,
                100,
            )?,
            max_buffer_bytes,
            max_input_bytes,
            max_output_chunk_bytes,
            idle_timeout: bounded_duration_ms(
                "idle_timeout_ms",
                self.idle_timeout_ms,
                30 * 60_000,
                10_000,
                24 * 60 * 60_000,
            )?,
            hard_kill_timeout: bounded_duration_ms(
                "hard_kill_timeout_ms",
                self.hard_kill_timeout_ms,
                10_000,
                1_000,
                60_000,
            )?,
            exited_session_ttl: bounded_duration_ms(
                "exited_session_ttl_ms",
                self.exited_session_ttl_ms,
                5 * 60_000,
                10_000,
                24 * 60 * 60_000,
            )?,
            default_cols: bounded_u16("default_cols", self.default_cols, 120, 40, 500)?,
            default_rows: bounded_u16("default_rows", self.default_rows, 34, 10, 300)?,
            max_incoming_message_bytes: bounded(
                "max_incoming_message_bytes",
                self.max_incoming_message_bytes,
                128 * KIB,
                512,
                2 * MIB,
            )?,
            queue_high_watermark_bytes,
            queue_low_watermark_bytes,
            max_queued_outbound_bytes: bounded(
                "max_queued_outbound_bytes",
                self.max_queued_outbound_bytes,
                2 * MIB,
                64 * KIB,
                64 * MIB,
            )?,
            allowed_root: self.allowed_root,
        })
    }
}

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

fn bounded(
    name: &str,
    value: Option<usize>,
    default: usize,
    min: usize,
    max: usize,
) -> anyhow::Result<usize> {
    let v = value.unwrap_or(default);
    if v < min || v > max {
        return Err(anyhow!("{name} = {v} is out of bounds [{min}, {max}]"));
    }
    Ok(v)
}

fn bounded_usize(
    name: &str,
    value: Option<usize>,
    default: usize,
    min: usize,
    max: usize,
) -> anyhow::Result<usize> {
    bounded(name, value, default, min, max)
}

fn bounded_u16(name: &str, value: Option<u16>, default: u16, min: u16, max: u16) -> anyhow::Result<u16> {
    let v = value.unwrap_or(default);
    if v < min || v > max {
        return Err(anyhow!("{name} = {v} is out of bounds [{min}, {max}]"));
    }
    Ok(v)
}

fn bounded_duration_ms(
    name: &str,
    value: Option<u64>,
    default_ms: u64,
    min_ms: u64,
    max_ms: u64,
) -> anyhow::Result<Duration> {
    let v = value.unwrap_or(default_ms);
    if v < min_ms || v > max_ms {
        return Err(anyhow!("{name} = {v} is out of bounds [{min_ms}, {max_ms}]"));
    }
    Ok(Duration::from_millis(v))
}

/// Fully resolved, bounds-validated configuration consumed by the rest
/// of the crate. See spec §6.2 for the option table this mirrors.
#[derive(Debug, Clone)]
pub struct Config {
    pub enabled: bool,
    pub max_sessions_per_client: usize,
    pub max_buffer_bytes: usize,
    pub max_input_bytes: usize,
    pub max_output_chunk_bytes: usize,
    pub idle_timeout: Duration,
    pub hard_kill_timeout: Duration,
    pub exited_session_ttl: Duration,
    pub default_cols: u16,
    pub default_rows: u16,
    pub max_incoming_message_bytes: usize,
    pub queue_high_watermark_bytes: usize,
    pub queue_low_watermark_bytes: usize,
    pub max_queued_outbound_bytes: usize,
    pub allowed_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().resolve().expect("default config always resolves")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ntest::timeout;

    #[test]
    #[timeout(30000)]
    fn parse_empty() -> anyhow::Result<()> {
        let raw: RawConfig = toml::from_str("")?;
        let cfg = raw.resolve()?;
        assert_eq!(cfg.max_sessions_per_client, 6);
        assert_eq!(cfg.max_buffer_bytes, 2 * MIB);
        Ok(())
    }

    #[test]
    #[timeout(30000)]
    fn parse_overrides() -> anyhow::Result<()> {
        let raw: RawConfig = toml::from_str(
            r#"
            max_sessions_per_client = 10
            idle_timeout_ms = 60000
            allowed_root = "/home/dev/workspace"
            "#,
        )?;
        let cfg = raw.resolve()?;
        assert_eq!(cfg.max_sessions_per_client, 10);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert_eq!(cfg.allowed_root, Some(PathBuf::from("/home/dev/workspace")));
        Ok(())
    }

    #[test]
    fn out_of_bounds_rejected() {
        let raw: RawConfig = toml::from_str("max_sessions_per_client = 0").unwrap();
        assert!(raw.resolve().is_err());
    }

    #[test]
    fn low_watermark_above_high_rejected() {
        let raw: RawConfig = toml::from_str(
            r#"
            queue_high_watermark_bytes = 20000
            queue_low_watermark_bytes = 900000
            "#,
        )
        .unwrap();
        assert!(raw.resolve().is_err());
    }
}
