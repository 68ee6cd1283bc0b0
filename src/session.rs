use serde::Serialize;
use std::time::Duration;

/// Phase of one capture gesture, from press to finalization.
///
/// A single tagged state rather than independent flags, so invalid
/// combinations (locked while finished, capturing while idle) cannot be
/// represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    /// No session running; a press starts one.
    Idle,
    /// Press registered, session resources being armed.
    Priming,
    /// Frames are being sampled; releasing now stops the session.
    Capturing,
    /// Held past the short-press threshold: release is a no-op, the session
    /// runs until max duration or a second press.
    LockedCapturing,
    /// Sampling stopped, session items handed to the cart merge.
    Finished,
}

/// Everything that can drive a phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInput {
    Press,
    Release,
    SamplingStarted,
    LongPressElapsed,
    MaxDurationElapsed,
}

/// The single transition function. Inputs that make no sense in the current
/// phase leave it unchanged.
pub fn transition(phase: SessionPhase, input: SessionInput) -> SessionPhase {
    use SessionInput::*;
    use SessionPhase::*;

    match (phase, input) {
        (Idle, Press) => Priming,
        (Priming, SamplingStarted) => Capturing,
        (Priming | Capturing, Release) => Finished,
        (Priming | Capturing, LongPressElapsed) => LockedCapturing,
        (LockedCapturing, Press) => Finished,
        (Priming | Capturing | LockedCapturing, MaxDurationElapsed) => Finished,
        (current, _) => current,
    }
}

/// Linear progress over the session's maximum duration, clamped at 100.
pub fn progress_percent(elapsed: Duration, max: Duration) -> f64 {
    if max.is_zero() {
        return 100.0;
    }
    (elapsed.as_secs_f64() / max.as_secs_f64() * 100.0).min(100.0)
}
