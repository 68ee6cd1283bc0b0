//! End-to-end session flows against a loopback fake detector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

use pos_capture::SyntheticBackend;
use pos_catalog::{CatalogError, ProductCatalog, ProductPage, ProductQuery, ProductRecord};
use scanpos::{CaptureConfig, CaptureController, SessionEvent, SessionPhase};

struct MemoryCatalog(HashMap<String, ProductRecord>);

impl MemoryCatalog {
    fn with_p1() -> Self {
        let record = ProductRecord {
            id: "p1".to_string(),
            name: "Bottled Water".to_string(),
            price: 1000,
            stock: 20,
            variants: Vec::new(),
        };
        Self(HashMap::from([(record.id.clone(), record)]))
    }
}

#[async_trait]
impl ProductCatalog for MemoryCatalog {
    async fn product_detail(&self, id: &str) -> Result<ProductRecord, CatalogError> {
        self.0
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    async fn products(&self, _query: &ProductQuery) -> Result<ProductPage, CatalogError> {
        Ok(ProductPage {
            data: self.0.values().cloned().collect(),
            total: self.0.len() as u64,
        })
    }
}

/// Websocket server that answers every frame with the same detection batch.
async fn spawn_fake_detector() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    match message {
                        Message::Text(_) => {
                            let reply = r#"{"status":200,"data":[{"id":"p1","quantity":2}],"averageFPS":8.0}"#;
                            if socket.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    format!("ws://{addr}")
}

fn test_config(detector_url: String) -> CaptureConfig {
    CaptureConfig {
        detector_url,
        max_session: Duration::from_secs(30),
        long_press: Duration::from_secs(5),
        sample_interval: Duration::from_millis(30),
        progress_tick: Duration::from_millis(20),
        frame_edge: 64,
        drain_timeout: Duration::from_secs(3),
    }
}

async fn wait_for<F>(events: &mut UnboundedReceiver<SessionEvent>, mut predicate: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn short_press_session_accumulates_and_merges() {
    let url = spawn_fake_detector().await;
    let (controller, mut events) = CaptureController::new(
        test_config(url),
        Arc::new(SyntheticBackend::single("Back Camera")),
        Arc::new(MemoryCatalog::with_p1()),
    );

    controller.press().await.unwrap();
    assert_eq!(controller.phase().await, SessionPhase::Capturing);

    // First batch with a new key raises the cue exactly once.
    wait_for(&mut events, |e| matches!(e, SessionEvent::DetectionCue)).await;

    controller.release().await.unwrap();
    assert_eq!(controller.phase().await, SessionPhase::Finished);

    wait_for(&mut events, |e| matches!(e, SessionEvent::ProcessingComplete)).await;

    let cart = controller.accumulated_cart().await;
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].key(), "p1");
    assert_eq!(cart[0].quantity, 2);
    assert_eq!(cart[0].subtotal, 2000);

    // "Add more products": a second session over the same scene doubles
    // the accumulated quantities.
    controller.rearm().await.unwrap();
    assert_eq!(controller.phase().await, SessionPhase::Idle);

    controller.press().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::DetectionCue)).await;
    controller.release().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::ProcessingComplete)).await;

    let cart = controller.accumulated_cart().await;
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].quantity, 4);
    assert_eq!(cart[0].subtotal, 4000);
    assert_eq!(controller.cart_total().await, 4000);

    controller.dispose().await;
}

#[tokio::test]
async fn long_press_locks_and_runs_to_max_duration() {
    let url = spawn_fake_detector().await;
    let config = CaptureConfig {
        long_press: Duration::from_millis(60),
        max_session: Duration::from_millis(400),
        ..test_config(url)
    };
    let (controller, mut events) = CaptureController::new(
        config,
        Arc::new(SyntheticBackend::single("Back Camera")),
        Arc::new(MemoryCatalog::with_p1()),
    );

    controller.press().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::LockEngaged)).await;
    assert_eq!(controller.phase().await, SessionPhase::LockedCapturing);

    // Releasing a locked session changes nothing.
    controller.release().await.unwrap();
    assert_eq!(controller.phase().await, SessionPhase::LockedCapturing);

    // The max-duration cutoff finishes the session on its own; progress
    // tops out at exactly 100 on the way there.
    let mut reached_full = false;
    let mut finished = false;
    wait_for(&mut events, |e| {
        match e {
            SessionEvent::Progress { percent } => {
                assert!(*percent <= 100.0, "progress must never exceed 100");
                if *percent == 100.0 {
                    reached_full = true;
                }
            }
            SessionEvent::PhaseChanged {
                phase: SessionPhase::Finished,
            } => finished = true,
            _ => {}
        }
        matches!(e, SessionEvent::ProcessingComplete)
    })
    .await;
    assert!(reached_full, "progress should reach exactly 100%");
    assert!(finished, "max duration should finish the session");

    let cart = controller.accumulated_cart().await;
    assert_eq!(cart.len(), 1);
    assert_eq!(cart[0].quantity, 2);

    controller.dispose().await;
}

#[tokio::test]
async fn second_press_stops_a_locked_session() {
    let url = spawn_fake_detector().await;
    let config = CaptureConfig {
        long_press: Duration::from_millis(60),
        ..test_config(url)
    };
    let (controller, mut events) = CaptureController::new(
        config,
        Arc::new(SyntheticBackend::single("Back Camera")),
        Arc::new(MemoryCatalog::with_p1()),
    );

    controller.press().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::LockEngaged)).await;

    controller.press().await.unwrap();
    assert_eq!(controller.phase().await, SessionPhase::Finished);

    wait_for(&mut events, |e| matches!(e, SessionEvent::ProcessingComplete)).await;
    controller.dispose().await;
}

#[tokio::test]
async fn unreachable_detector_surfaces_error_and_stays_idle() {
    let (controller, mut events) = CaptureController::new(
        test_config("ws://127.0.0.1:1".to_string()),
        Arc::new(SyntheticBackend::single("Back Camera")),
        Arc::new(MemoryCatalog::with_p1()),
    );

    assert!(controller.press().await.is_err());
    assert_eq!(controller.phase().await, SessionPhase::Idle);

    wait_for(&mut events, |e| matches!(e, SessionEvent::SessionError { .. })).await;
}

#[tokio::test]
async fn hard_reset_discards_accumulated_cart() {
    let url = spawn_fake_detector().await;
    let (controller, mut events) = CaptureController::new(
        test_config(url),
        Arc::new(SyntheticBackend::single("Back Camera")),
        Arc::new(MemoryCatalog::with_p1()),
    );

    controller.press().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::DetectionCue)).await;
    controller.release().await.unwrap();
    wait_for(&mut events, |e| matches!(e, SessionEvent::ProcessingComplete)).await;
    assert!(!controller.accumulated_cart().await.is_empty());

    controller.hard_reset().await;
    assert!(controller.accumulated_cart().await.is_empty());
    assert_eq!(controller.phase().await, SessionPhase::Idle);
    wait_for(&mut events, |e| matches!(e, SessionEvent::ResetRequested)).await;
}
