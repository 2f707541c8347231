//! Environment-driven configuration.
//!
//! Every knob has a default; the service boots with zero configuration and a
//! locally launched browser. Setting `BROWSER_WS_URL` switches the driver to
//! attach mode without touching anything else.

use std::time::Duration;

/// Navigation strategy timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct NavConfig {
    /// Budget for the primary (wait-for-network-quiet) strategy.
    pub primary_timeout: Duration,
    /// Budget for the fallback (DOM-content) strategy.
    pub fallback_timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

/// Defaults for fabric-wrapped browser operations.
#[derive(Debug, Clone)]
pub struct OpConfig {
    pub default_timeout: Duration,
    pub default_retries: u32,
}

/// Circuit breaker defaults.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub threshold: u32,
    pub reset_timeout: Duration,
}

/// Session lifecycle knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle threshold for the stale-session sweep.
    pub session_timeout: Duration,
    pub health_check_interval: Duration,
    /// Per-step budget inside a health probe.
    pub health_probe_timeout: Duration,
    /// Consecutive probe failures before recovery kicks in.
    pub max_health_failures: u32,
    /// Attempts for session creation (1s * attempt backoff between them).
    pub max_create_retries: u32,
}

/// Memory governor knobs.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// RSS ceiling the usage percentage is computed against.
    pub limit_mb: u64,
    pub sample_interval: Duration,
    /// Percent at which frame queues are trimmed.
    pub cleanup_percent: f64,
    /// Percent at which queues are dropped and screencasts degraded.
    pub emergency_percent: f64,
}

/// Browser launch/attach selection.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// Remote CDP WebSocket endpoint. `None` means launch locally.
    pub remote_ws_url: Option<String>,
    pub headless: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub nav: NavConfig,
    pub ops: OpConfig,
    pub circuit: CircuitConfig,
    pub session: SessionConfig,
    pub memory: MemoryConfig,
    pub browser: BrowserConfig,
}

impl Config {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            port: parse_or(env("PERISCOPE_PORT"), 8080),
            nav: NavConfig {
                primary_timeout: millis(env("NAV_PRIMARY_TIMEOUT_MS"), 20_000),
                fallback_timeout: millis(env("NAV_FALLBACK_TIMEOUT_MS"), 15_000),
                retries: parse_or(env("NAV_RETRIES"), 3),
                backoff: millis(env("NAV_BACKOFF_MS"), 2_000),
            },
            ops: OpConfig {
                default_timeout: millis(env("OP_TIMEOUT_MS"), 10_000),
                default_retries: parse_or(env("OP_RETRIES"), 2),
            },
            circuit: CircuitConfig {
                threshold: parse_or(env("CIRCUIT_THRESHOLD"), 5),
                reset_timeout: millis(env("CIRCUIT_RESET_MS"), 60_000),
            },
            session: SessionConfig {
                session_timeout: millis(env("SESSION_TIMEOUT_MS"), 600_000),
                health_check_interval: millis(env("HEALTH_CHECK_INTERVAL_MS"), 15_000),
                health_probe_timeout: millis(env("HEALTH_PROBE_TIMEOUT_MS"), 5_000),
                max_health_failures: parse_or(env("MAX_HEALTH_FAILURES"), 3),
                max_create_retries: parse_or(env("SESSION_MAX_RETRIES"), 3),
            },
            memory: MemoryConfig {
                limit_mb: parse_or(env("MEMORY_LIMIT_MB"), 2048),
                sample_interval: millis(env("MEMORY_SAMPLE_INTERVAL_MS"), 10_000),
                cleanup_percent: 85.0,
                emergency_percent: 95.0,
            },
            browser: BrowserConfig {
                remote_ws_url: env("BROWSER_WS_URL").filter(|s| !s.is_empty()),
                headless: parse_or(env("HEADLESS"), true),
            },
        }
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn millis(raw: Option<String>, default: u64) -> Duration {
    Duration::from_millis(parse_or(raw, default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_or_uses_default_when_unset() {
        assert_eq!(parse_or::<u16>(None, 8080), 8080);
    }

    #[test]
    fn parse_or_uses_default_when_unparseable() {
        assert_eq!(parse_or::<u32>(Some("not a number".into()), 3), 3);
    }

    #[test]
    fn parse_or_honors_override() {
        assert_eq!(parse_or::<u64>(Some("42".into()), 7), 42);
        assert!(!parse_or::<bool>(Some("false".into()), true));
    }

    #[test]
    fn millis_converts() {
        assert_eq!(millis(Some("2500".into()), 0), Duration::from_millis(2500));
        assert_eq!(millis(None, 1000), Duration::from_secs(1));
    }

    #[test]
    fn defaults_match_documented_table() {
        // from_env with a clean environment should produce the documented
        // defaults; only assert fields no test environment is likely to set.
        let cfg = Config::from_env();
        assert_eq!(cfg.nav.retries, 3);
        assert_eq!(cfg.ops.default_retries, 2);
        assert_eq!(cfg.circuit.threshold, 5);
        assert_eq!(cfg.memory.cleanup_percent, 85.0);
        assert_eq!(cfg.memory.emergency_percent, 95.0);
    }
}
