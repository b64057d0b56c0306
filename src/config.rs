use anyhow::{Result, bail};
use clap::Parser;
use reqwest::Url;
use std::net::SocketAddr;
use std::time::Duration;

/// Runtime configuration. Every flag can also come from the environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(name = "agent", about = "Voice-guided screen assistant")]
pub struct Config {
    /// Endpoint of the remote planner.
    #[arg(long, env = "PLANNER_URL", default_value = "http://127.0.0.1:8080/plan")]
    pub planner_url: String,

    /// Optional bearer token sent to the planner.
    #[arg(long, env = "PLANNER_API_KEY")]
    pub planner_api_key: Option<String>,

    #[arg(long, env = "PLANNER_TIMEOUT_MS", default_value_t = 20_000)]
    pub planner_timeout_ms: u64,

    /// Screen stabilization delay before a snapshot is taken.
    #[arg(long, env = "DEBOUNCE_MS", default_value_t = 500)]
    pub debounce_ms: u64,

    /// Delay between an executed action and the forced re-capture.
    #[arg(long, env = "FORCED_CAPTURE_MS", default_value_t = 2_000)]
    pub forced_capture_ms: u64,

    #[arg(long, env = "FOLLOW_UP_WINDOW_MS", default_value_t = 60_000)]
    pub follow_up_window_ms: u64,

    /// Planner round trips allowed per task before it is abandoned.
    #[arg(long, env = "MAX_TASK_STEPS", default_value_t = 5)]
    pub max_task_steps: u32,

    /// Consecutive misses on one selector before giving up.
    #[arg(long, env = "STRIKE_LIMIT", default_value_t = 3)]
    pub strike_limit: u32,

    #[arg(long, env = "LISTEN_TIMEOUT_MS", default_value_t = 8_000)]
    pub listen_timeout_ms: u64,

    #[arg(long, env = "WATCHDOG_BUFFER_MS", default_value_t = 2_000)]
    pub watchdog_buffer_ms: u64,

    /// Characters of flattened snapshot text that feed the screen hash.
    #[arg(long, env = "SNAPSHOT_HASH_PREFIX", default_value_t = 4_000)]
    pub snapshot_hash_prefix: usize,

    /// Address for the command/event HTTP surface.
    #[arg(long, env = "BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// Attach to an already running Chrome instead of launching one.
    #[arg(long, env = "CHROME_DEBUG_URL")]
    pub chrome_debug_url: Option<String>,

    #[arg(long, env = "START_URL", default_value = "about:blank")]
    pub start_url: String,

    /// Launchable shortcuts as `label=url`, repeatable.
    #[arg(long = "app", value_name = "LABEL=URL")]
    pub apps: Vec<String>,

    #[arg(long, env = "LOCALE", default_value = "en-US")]
    pub locale: String,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// The timing and ceiling knobs the engine actually consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTimings {
    pub debounce: Duration,
    pub forced_capture: Duration,
    pub follow_up_window: Duration,
    pub listen_watchdog: Duration,
    pub max_task_steps: u32,
    pub strike_limit: u32,
    pub snapshot_hash_prefix: usize,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            forced_capture: Duration::from_secs(2),
            follow_up_window: Duration::from_secs(60),
            listen_watchdog: Duration::from_secs(10),
            max_task_steps: 5,
            strike_limit: 3,
            snapshot_hash_prefix: 4_000,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("planner-timeout-ms", self.planner_timeout_ms),
            ("debounce-ms", self.debounce_ms),
            ("forced-capture-ms", self.forced_capture_ms),
            ("follow-up-window-ms", self.follow_up_window_ms),
            ("listen-timeout-ms", self.listen_timeout_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                bail!("--{name} must be greater than zero");
            }
        }
        if self.max_task_steps == 0 {
            bail!("--max-task-steps must be at least 1");
        }
        if self.strike_limit == 0 {
            bail!("--strike-limit must be at least 1");
        }
        if self.snapshot_hash_prefix == 0 {
            bail!("--snapshot-hash-prefix must be greater than zero");
        }
        let url = Url::parse(&self.planner_url)
            .map_err(|e| anyhow::anyhow!("invalid --planner-url '{}': {e}", self.planner_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("--planner-url must be http or https, got '{}'", url.scheme());
        }
        for app in &self.apps {
            if parse_app_shortcut(app).is_none() {
                bail!("--app expects LABEL=URL, got '{app}'");
            }
        }
        Ok(())
    }

    pub fn timings(&self) -> EngineTimings {
        EngineTimings {
            debounce: Duration::from_millis(self.debounce_ms),
            forced_capture: Duration::from_millis(self.forced_capture_ms),
            follow_up_window: Duration::from_millis(self.follow_up_window_ms),
            listen_watchdog: Duration::from_millis(
                self.listen_timeout_ms.saturating_add(self.watchdog_buffer_ms),
            ),
            max_task_steps: self.max_task_steps,
            strike_limit: self.strike_limit,
            snapshot_hash_prefix: self.snapshot_hash_prefix,
        }
    }

    pub fn planner_timeout(&self) -> Duration {
        Duration::from_millis(self.planner_timeout_ms)
    }

    /// `--app` values split into `(label, url)` pairs.
    pub fn app_shortcuts(&self) -> Vec<(String, String)> {
        self.apps.iter().filter_map(|s| parse_app_shortcut(s)).collect()
    }
}

fn parse_app_shortcut(raw: &str) -> Option<(String, String)> {
    let (label, url) = raw.split_once('=')?;
    let (label, url) = (label.trim(), url.trim());
    if label.is_empty() || url.is_empty() {
        return None;
    }
    Some((label.to_string(), url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::parse_from(["agent"]);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.timings().max_task_steps, 5);
        assert_eq!(cfg.timings().debounce, Duration::from_millis(500));
    }

    #[test]
    fn watchdog_spans_listen_timeout_plus_buffer() {
        let cfg = Config::parse_from([
            "agent",
            "--listen-timeout-ms",
            "5000",
            "--watchdog-buffer-ms",
            "1500",
        ]);
        assert_eq!(cfg.timings().listen_watchdog, Duration::from_millis(6500));
    }

    #[test]
    fn rejects_zero_ceilings() {
        let cfg = Config::parse_from(["agent", "--max-task-steps", "0"]);
        assert!(cfg.validate().is_err());
        let cfg = Config::parse_from(["agent", "--strike-limit", "0"]);
        assert!(cfg.validate().is_err());
        let cfg = Config::parse_from(["agent", "--debounce-ms", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_http_planner() {
        let cfg = Config::parse_from(["agent", "--planner-url", "ftp://example.com"]);
        assert!(cfg.validate().is_err());
        let cfg = Config::parse_from(["agent", "--planner-url", "not a url"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_app_shortcuts() {
        let cfg = Config::parse_from([
            "agent",
            "--app",
            "Maps=https://maps.example.com",
            "--app",
            " Mail = https://mail.example.com ",
        ]);
        assert!(cfg.validate().is_ok());
        assert_eq!(
            cfg.app_shortcuts(),
            vec![
                ("Maps".to_string(), "https://maps.example.com".to_string()),
                ("Mail".to_string(), "https://mail.example.com".to_string()),
            ]
        );

        let cfg = Config::parse_from(["agent", "--app", "broken"]);
        assert!(cfg.validate().is_err());
    }
}
