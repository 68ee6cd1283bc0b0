use std::time::Duration;

use tracing::warn;

/// Tunables for the capture engine. Every knob can come from the
/// environment so deployments never hard-code the detector endpoint or the
/// gesture timings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Detection service websocket endpoint.
    pub detector_url: String,
    /// Hard cap on one capture session; progress reaches 100% here.
    pub max_session: Duration,
    /// Held shorter than this: releasing stops the session. Held longer:
    /// the session locks.
    pub long_press: Duration,
    /// Frame sampling cadence (~10 fps by default).
    pub sample_interval: Duration,
    /// Progress indicator update cadence.
    pub progress_tick: Duration,
    /// Frames are stretched to this square edge before encoding.
    pub frame_edge: u32,
    /// How long to wait for outstanding frames after a session ends before
    /// presuming them lost and force-clearing the in-flight counter.
    pub drain_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            detector_url: "ws://127.0.0.1:8765/ws".to_string(),
            max_session: Duration::from_millis(30_000),
            long_press: Duration::from_millis(1_000),
            sample_interval: Duration::from_millis(100),
            progress_tick: Duration::from_millis(100),
            frame_edge: 640,
            drain_timeout: Duration::from_millis(10_000),
        }
    }
}

impl CaptureConfig {
    /// Reads `SCANPOS_*` overrides on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            detector_url: env_string("SCANPOS_DETECTOR_URL", defaults.detector_url),
            max_session: env_duration_ms("SCANPOS_MAX_SESSION_MS", defaults.max_session),
            long_press: env_duration_ms("SCANPOS_LONG_PRESS_MS", defaults.long_press),
            sample_interval: env_duration_ms("SCANPOS_SAMPLE_INTERVAL_MS", defaults.sample_interval),
            progress_tick: env_duration_ms("SCANPOS_PROGRESS_TICK_MS", defaults.progress_tick),
            frame_edge: env_u32("SCANPOS_FRAME_EDGE", defaults.frame_edge),
            drain_timeout: env_duration_ms("SCANPOS_DRAIN_TIMEOUT_MS", defaults.drain_timeout),
        }
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_duration_ms(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(%key, value = %raw, "ignoring unparsable duration override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u32>() {
            Ok(value) => value,
            Err(_) => {
                warn!(%key, value = %raw, "ignoring unparsable override");
                default
            }
        },
        Err(_) => default,
    }
}
