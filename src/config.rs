//! Session configuration
//!
//! Configuration is plain serde data so it can be embedded in the host
//! application's own settings or loaded from a standalone YAML file:
//!
//! ```rust
//! use jpipflow::config::{NotifyPolicy, StreamConfig};
//!
//! let config = StreamConfig::from_yaml_str(
//!     "session:\n  notify: on_new_data\nbandwidth:\n  max_reduction: 0.9\n",
//! )?;
//! assert_eq!(config.session.notify, NotifyPolicy::OnNewData);
//! assert_eq!(config.render.max_render_samples, 50_000);
//! # Ok::<(), jpipflow::StreamError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::{Result, StreamError};

/// Default port of JPIP servers when the endpoint uses the `jpip` scheme.
pub const DEFAULT_JPIP_PORT: u16 = 8090;

/// When the reader wakes the render worker after receiving data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyPolicy {
    /// After every data segment (progressive refinement on screen)
    OnNewData,
    /// Only once the pending request has been satisfied
    #[default]
    OnComplete,
}

/// Which running error drives the growth branch of the bandwidth controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrowthSignal {
    /// Symmetric relative error between measured and smoothed rate
    #[default]
    Relative,
    /// Error accumulated while the measurement exceeded the estimate
    OverEstimated,
    /// Error accumulated while the estimate exceeded the measurement
    UnderEstimated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep the connection open even when nothing changed
    pub persistent: bool,
    /// This view drives the movie and negotiates the bandwidth
    pub primary: bool,
    /// Never talk to the server, render from whatever is cached
    pub offline: bool,
    pub notify: NotifyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { persistent: true, primary: true, offline: false, notify: NotifyPolicy::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Samples decoded per codec call before yielding
    pub max_render_samples: usize,
    /// Frame rate used until the application sets one
    pub initial_fps: u32,
    /// Upper bound for waiting on the accessible frame to catch up
    pub accessible_wait_ms: u64,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { max_render_samples: 50_000, initial_fps: 20, accessible_wait_ms: 200 }
    }
}

impl RenderConfig {
    pub fn accessible_wait(&self) -> Duration {
        Duration::from_millis(self.accessible_wait_ms)
    }
}

/// Coefficients of the bandwidth estimator and its feedback controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Minimum observation window
    pub window_ms: u64,
    /// Weight of the newest sample in the moving average
    pub smoothing: f64,
    /// Reduction applied when no frame is buffered ahead
    pub max_reduction: f64,
    /// Reduction applied when the buffer is just below the setpoint
    pub min_reduction: f64,
    pub growth: GrowthSignal,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            window_ms: 100,
            smoothing: 0.1,
            max_reduction: 0.99,
            min_reduction: 0.01,
            growth: GrowthSignal::default(),
        }
    }
}

impl BandwidthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_exponent: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { base_delay_ms: 50, max_exponent: 5 }
    }
}

impl RetryConfig {
    /// Exponential back-off: base, 2*base, 4*base ... capped at `2^max_exponent`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_exponent).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1 << exponent))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    pub join_poll_ms: u64,
    pub join_attempts: u32,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self { join_poll_ms: 100, join_attempts: 20 }
    }
}

impl TeardownConfig {
    pub fn join_poll(&self) -> Duration {
        Duration::from_millis(self.join_poll_ms)
    }
}

/// Complete configuration of one streaming session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub session: SessionConfig,
    pub render: RenderConfig,
    pub bandwidth: BandwidthConfig,
    pub retry: RetryConfig,
    pub teardown: TeardownConfig,
}

impl StreamConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: StreamConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|source| StreamError::ConfigFile { path: path.to_path_buf(), source })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml_ng::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        let bw = &self.bandwidth;
        if bw.window_ms == 0 {
            return Err(StreamError::config("bandwidth.window_ms must be positive"));
        }
        if !(bw.smoothing > 0.0 && bw.smoothing <= 1.0) {
            return Err(StreamError::config(format!(
                "bandwidth.smoothing must be in (0, 1], got {}",
                bw.smoothing
            )));
        }
        if !(0.0..1.0).contains(&bw.min_reduction)
            || !(0.0..1.0).contains(&bw.max_reduction)
            || bw.min_reduction > bw.max_reduction
        {
            return Err(StreamError::config(format!(
                "bandwidth reductions must satisfy 0 <= min ({}) <= max ({}) < 1",
                bw.min_reduction, bw.max_reduction
            )));
        }
        if self.render.max_render_samples == 0 {
            return Err(StreamError::config("render.max_render_samples must be positive"));
        }
        if self.render.initial_fps == 0 {
            return Err(StreamError::config("render.initial_fps must be positive"));
        }
        if self.teardown.join_attempts == 0 || self.teardown.join_poll_ms == 0 {
            return Err(StreamError::config("teardown join poll and attempts must be positive"));
        }
        Ok(())
    }
}

/// Address of a JPIP target on a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Request path, e.g. `/jpip`
    pub path: String,
    /// Value of the `target` field
    pub target: String,
}

impl Endpoint {
    /// Parse `jpip://host[:port]/path?target` or `http://host[:port]/path?target=...`.
    ///
    /// For `jpip` URLs without a `target=` pair, the whole query string is the target.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| StreamError::config(format!("invalid endpoint '{}': {}", input, e)))?;

        let port = match url.scheme() {
            "jpip" => url.port().unwrap_or(DEFAULT_JPIP_PORT),
            "http" => url.port_or_known_default().unwrap_or(80),
            other => {
                return Err(StreamError::config(format!(
                    "unsupported endpoint scheme '{}' (expected jpip or http)",
                    other
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| StreamError::config(format!("endpoint '{}' has no host", input)))?
            .to_string();

        let target = url
            .query_pairs()
            .find(|(key, _)| key == "target")
            .map(|(_, value)| value.into_owned())
            .or_else(|| url.query().filter(|q| !q.contains('=')).map(str::to_string))
            .ok_or_else(|| StreamError::config(format!("endpoint '{}' names no target", input)))?;

        let path = if url.path().is_empty() { "/".to_string() } else { url.path().to_string() };

        Ok(Self { host, port, path, target })
    }

    /// `host:port` for socket connection.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StreamConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bandwidth.window(), Duration::from_millis(100));
        assert_eq!(config.session.notify, NotifyPolicy::OnComplete);
    }

    #[test]
    fn yaml_round_trip_keeps_values() {
        let mut config = StreamConfig::default();
        config.bandwidth.growth = GrowthSignal::UnderEstimated;
        config.session.primary = false;
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(StreamConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn invalid_coefficients_are_rejected() {
        let err = StreamConfig::from_yaml_str("bandwidth:\n  min_reduction: 0.5\n  max_reduction: 0.2\n")
            .unwrap_err();
        assert!(matches!(err, StreamError::Config { .. }));

        let err = StreamConfig::from_yaml_str("bandwidth:\n  smoothing: 0.0\n").unwrap_err();
        assert!(err.to_string().contains("smoothing"));

        assert!(StreamConfig::from_yaml_str("render: [1, 2]").is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = StreamConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, StreamError::ConfigFile { .. }));
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(50));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(40), Duration::from_millis(50 * 32));
    }

    #[test]
    fn endpoints_parse_both_schemes() {
        let jpip = Endpoint::parse("jpip://helio.example.org/jpip?movie_2014.jpx").unwrap();
        assert_eq!(jpip.port, DEFAULT_JPIP_PORT);
        assert_eq!(jpip.path, "/jpip");
        assert_eq!(jpip.target, "movie_2014.jpx");
        assert_eq!(jpip.authority(), "helio.example.org:8090");

        let http = Endpoint::parse("http://localhost:9000/srv?target=aia.jp2").unwrap();
        assert_eq!(http.port, 9000);
        assert_eq!(http.target, "aia.jp2");

        assert!(Endpoint::parse("ftp://host/file?x").is_err());
        assert!(Endpoint::parse("jpip://host/jpip").is_err());
    }
}
