use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::inflight::InFlight;
use crate::protocol::{self, DetectionBatch};

const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to detector: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("detection channel is not open")]
    NotOpen,
    #[error("detection channel backpressure, frame dropped")]
    Backpressure,
}

/// One logical connection to the detection service.
///
/// A channel is owned by exactly one capture page and is recreated, never
/// reconnected in place, whenever a fresh detection pass is requested.
/// Decoded batches are forwarded to the consumer handed to [`connect`];
/// batches are not guaranteed to arrive in frame-send order, so the most
/// recent arrival is authoritative.
///
/// [`connect`]: DetectionChannel::connect
pub struct DetectionChannel {
    outbound: mpsc::Sender<Message>,
    state: Arc<watch::Sender<ChannelState>>,
    in_flight: Arc<InFlight>,
    average_fps: Arc<watch::Sender<f64>>,
    closed: AtomicBool,
}

impl DetectionChannel {
    /// Establishes the websocket connection and spawns the reader/writer
    /// tasks. Handled batches go to `batch_tx`; everything else is treated
    /// as a no-op heartbeat and dropped before it reaches the consumer.
    pub async fn connect(
        url: &str,
        batch_tx: mpsc::Sender<DetectionBatch>,
        in_flight: Arc<InFlight>,
    ) -> Result<Self, ChannelError> {
        let (state_tx, _) = watch::channel(ChannelState::Connecting);
        let state = Arc::new(state_tx);
        let (fps_tx, _) = watch::channel(0.0);
        let average_fps = Arc::new(fps_tx);

        let (socket, _) = connect_async(url).await?;
        let _ = state.send(ChannelState::Open);
        info!(%url, "detection channel open");

        let (mut write, mut read) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let writer_state = state.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = write.send(message).await {
                    warn!("detection channel send failed: {err}");
                    let _ = writer_state.send(ChannelState::Closed);
                    break;
                }
                if closing {
                    let _ = writer_state.send(ChannelState::Closed);
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let reader_fps = average_fps.clone();
        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(batch) = protocol::decode_batch(&text) {
                            let _ = reader_fps.send(batch.average_fps);
                            if batch_tx.send(batch).await.is_err() {
                                // Consumer is gone, nothing left to feed.
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!("detection channel closed by peer");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("detection channel receive failed: {err}");
                        break;
                    }
                }
            }
            let _ = reader_state.send(ChannelState::Closed);
        });

        Ok(Self {
            outbound: out_tx,
            state,
            in_flight,
            average_fps,
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueues one encoded JPEG frame without waiting for a response.
    /// The in-flight counter is incremented before transmission and rolled
    /// back if the frame never makes it onto the queue.
    pub fn send_frame(&self, jpeg: &[u8]) -> Result<(), ChannelError> {
        if self.state() != ChannelState::Open {
            return Err(ChannelError::NotOpen);
        }

        self.in_flight.increment();
        let text = protocol::encode_frame_message(jpeg);
        if let Err(err) = self.outbound.try_send(Message::Text(text)) {
            self.in_flight.settle();
            return match err {
                mpsc::error::TrySendError::Full(_) => Err(ChannelError::Backpressure),
                mpsc::error::TrySendError::Closed(_) => Err(ChannelError::NotOpen),
            };
        }
        Ok(())
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn in_flight(&self) -> &Arc<InFlight> {
        &self.in_flight
    }

    /// Most recent average-FPS figure reported by the detector.
    pub fn average_fps(&self) -> f64 {
        *self.average_fps.borrow()
    }

    /// Terminates the connection. Idempotent; repeated calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.outbound.try_send(Message::Close(None));
        let _ = self.state.send(ChannelState::Closed);
        debug!("detection channel close requested");
    }
}

impl Drop for DetectionChannel {
    fn drop(&mut self) {
        self.close();
    }
}
