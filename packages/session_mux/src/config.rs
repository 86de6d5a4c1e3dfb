use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::link::DEFAULT_MAX_PENDING;

/// Longest delay any core timer accepts. Placeholder TTLs and re-fit delays
/// above it are clamped down to it.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub(crate) fn clamp_delay(delay: Duration) -> Duration {
    if delay > MAX_TIMER_DELAY {
        tracing::warn!(
            requested_ms = delay.as_millis() as u64,
            max_ms = MAX_TIMER_DELAY.as_millis() as u64,
            "timer delay clamped"
        );
        MAX_TIMER_DELAY
    } else {
        delay
    }
}

// =============================================================================
// Unified config (figment-deserialized from defaults / smux.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   smux.toml:       [placeholders]
//                    ttl_ms = 15000
//
//   env var:         SMUX_PLACEHOLDERS__TTL_MS=15000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub placeholders: PlaceholderFileConfig,
    #[serde(default)]
    pub surface: SurfaceFileConfig,
    #[serde(default)]
    pub link: LinkFileConfig,
    #[serde(default)]
    pub connection: ConnectionFileConfig,
}

/// Lives under `[placeholders]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaceholderFileConfig {
    #[serde(default = "default_placeholder_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for PlaceholderFileConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_placeholder_ttl_ms(),
        }
    }
}

/// Lives under `[surface]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurfaceFileConfig {
    /// Re-fit delays after a surface is shown, on top of the immediate fit.
    /// Container layout settles asynchronously, so one fit is not enough.
    #[serde(default = "default_refit_delays_ms")]
    pub refit_delays_ms: Vec<u64>,
}

impl Default for SurfaceFileConfig {
    fn default() -> Self {
        Self {
            refit_delays_ms: default_refit_delays_ms(),
        }
    }
}

/// Lives under `[link]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for LinkFileConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
        }
    }
}

/// Lives under `[connection]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionFileConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ConnectionFileConfig {
    fn default() -> Self {
        Self {
            url: None,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_placeholder_ttl_ms() -> u64 {
    10_000
}
fn default_refit_delays_ms() -> Vec<u64> {
    // next frame, then two short settles
    vec![16, 50, 150]
}
fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Build a figment that layers: defaults → `smux.toml` → `SMUX_*` env vars.
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("SMUX_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Core tuning (runtime view).
#[derive(Clone, Debug, PartialEq)]
pub struct MuxConfig {
    pub placeholder_ttl: Duration,
    pub refit_delays: Vec<Duration>,
    pub max_pending: usize,
}

impl MuxConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            placeholder_ttl: clamp_delay(Duration::from_millis(fc.placeholders.ttl_ms)),
            refit_delays: fc
                .surface
                .refit_delays_ms
                .iter()
                .map(|ms| clamp_delay(Duration::from_millis(*ms)))
                .collect(),
            max_pending: fc.link.max_pending.max(1),
        }
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

/// Connection retry policy (runtime view).
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub url: Option<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl ConnectionConfig {
    pub fn from_file(fc: &ConnectionFileConfig) -> Self {
        let initial_backoff = Duration::from_millis(fc.initial_backoff_ms.max(1));
        Self {
            url: fc.url.clone(),
            initial_backoff,
            max_backoff: Duration::from_millis(fc.max_backoff_ms).max(initial_backoff),
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}
