//! Client side of the product-detection service: wire protocol, the
//! websocket channel frames travel over, and the in-flight frame counter
//! that tells the session layer when every sent frame has been answered.

pub use channel::{ChannelError, ChannelState, DetectionChannel};
pub use inflight::InFlight;
pub use protocol::{decode_batch, encode_frame_message, Detection, DetectionBatch, STATUS_SUCCESS};

mod channel;
mod inflight;
mod protocol;
