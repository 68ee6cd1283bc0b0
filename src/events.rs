use serde::Serialize;

use crate::session::SessionPhase;

/// Events the controller surfaces to the embedding page. Rendering,
/// sounds, and vibration are the embedder's job; the controller only says
/// what happened.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    PhaseChanged { phase: SessionPhase },
    /// Progress through the maximum session duration, 0.0 to 100.0.
    Progress { percent: f64 },
    /// A batch introduced a new key or changed a quantity; cue the
    /// scanner beep. At most one per batch.
    DetectionCue,
    /// Long-press lock engaged; cue the haptic pulse.
    LockEngaged,
    /// Latest average-FPS figure reported by the detector.
    AverageFps { fps: f64 },
    /// A finished session was merged into the accumulated cart.
    SessionMerged { line_items: usize },
    /// Every sent frame has been answered (or presumed lost); the final
    /// cart may be revealed.
    ProcessingComplete,
    /// Hard reset: the embedder should discard all session state.
    ResetRequested,
    SessionError { message: String },
}
