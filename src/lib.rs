//! Capture engine for camera-based product detection at the point of sale.
//!
//! The engine manages one capture page's lifecycle: a press-and-hold
//! gesture starts a session, frames stream to an external detector over a
//! websocket, detection batches resolve into priced line items, and
//! finished sessions merge into one running cart that is finally submitted
//! as a transaction.
//!
//! The crates underneath split the pipeline the same way the data flows:
//! `pos-capture` (frames) → `pos-detect` (detector channel) → `pos-cart`
//! (line items and merge), with `pos-catalog` as the product/transaction
//! service boundary.

pub use config::CaptureConfig;
pub use controller::CaptureController;
pub use events::SessionEvent;
pub use session::{progress_percent, transition, SessionInput, SessionPhase};

pub mod config;
pub mod controller;
pub mod events;
pub mod session;

/// Initializes tracing for binaries and examples embedding the engine.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scanpos=debug,pos_capture=debug,pos_detect=debug".into()),
        )
        .try_init();
}
