use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use pos_capture::{
    acquire_with_fallback, sampling_loop, CameraBackend, CameraDevice, FrameSink, SamplerStatus,
};
use pos_cart::{draft_from_cart, merge_session, LineItem, SessionAccumulator};
use pos_catalog::{CatalogCache, ProductCatalog, TransactionGateway};
use pos_detect::{DetectionChannel, InFlight};

use crate::config::CaptureConfig;
use crate::events::SessionEvent;
use crate::session::{progress_percent, transition, SessionInput, SessionPhase};

/// Adapts the detection channel to the sampler's sink interface.
struct ChannelSink(Arc<DetectionChannel>);

impl FrameSink for ChannelSink {
    fn submit(&self, jpeg: Vec<u8>) -> Result<()> {
        self.0.send_frame(&jpeg)?;
        Ok(())
    }
}

/// Everything owned by one running capture gesture.
struct ActiveSession {
    channel: Arc<DetectionChannel>,
    accumulator: Arc<Mutex<SessionAccumulator>>,
    in_flight: Arc<InFlight>,
    started: Instant,
    stop: Arc<AtomicBool>,
    status_rx: watch::Receiver<SamplerStatus>,
    sampler: JoinHandle<()>,
    progress_ticker: JoinHandle<()>,
    long_press_timer: JoinHandle<()>,
    batch_worker: JoinHandle<()>,
}

/// A finished session whose channel stays open for frames still in flight.
struct LingeringSession {
    channel: Arc<DetectionChannel>,
    batch_worker: JoinHandle<()>,
}

struct Inner {
    phase: SessionPhase,
    cart: Vec<LineItem>,
    selected_device: Option<String>,
    session: Option<ActiveSession>,
    lingering: Option<LingeringSession>,
    drain_watcher: Option<JoinHandle<()>>,
}

/// Owns one capture page's session state: the camera, the detection
/// channel, the gesture state machine, and the cart accumulated across
/// sessions.
///
/// Lifecycle: `new → press/release (repeated via rearm) → submit →
/// dispose`. All collaborator state lives in explicit fields injected at
/// construction, so tests can substitute the catalog, the camera backend,
/// and the transaction gateway.
#[derive(Clone)]
pub struct CaptureController {
    config: CaptureConfig,
    backend: Arc<dyn CameraBackend>,
    catalog: Arc<dyn ProductCatalog>,
    cache: CatalogCache,
    events: mpsc::UnboundedSender<SessionEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl CaptureController {
    pub fn new(
        config: CaptureConfig,
        backend: Arc<dyn CameraBackend>,
        catalog: Arc<dyn ProductCatalog>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            config,
            backend,
            catalog,
            cache: CatalogCache::new(),
            events,
            inner: Arc::new(Mutex::new(Inner {
                phase: SessionPhase::Idle,
                cart: Vec::new(),
                selected_device: None,
                session: None,
                lingering: None,
                drain_watcher: None,
            })),
        };
        (controller, events_rx)
    }

    /// The capture control was pressed. Starts a session from idle, stops a
    /// locked one, and is a no-op anywhere else.
    pub async fn press(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            SessionPhase::Idle => self.start_session(&mut inner).await,
            SessionPhase::LockedCapturing => {
                self.finish_session(&mut inner, SessionInput::Press, "stopped by press")
                    .await;
                Ok(())
            }
            phase => {
                debug!(?phase, "press ignored");
                Ok(())
            }
        }
    }

    /// The capture control was released. Before the long-press threshold
    /// this ends the session; once locked it has no effect.
    pub async fn release(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.phase {
            SessionPhase::Priming | SessionPhase::Capturing => {
                self.finish_session(&mut inner, SessionInput::Release, "short press")
                    .await;
            }
            SessionPhase::LockedCapturing => debug!("release ignored while locked"),
            phase => debug!(?phase, "release ignored"),
        }
        Ok(())
    }

    async fn start_session(&self, inner: &mut Inner) -> Result<()> {
        // A fresh detection pass always gets a fresh channel.
        self.teardown_lingering(inner);
        self.advance(inner, SessionInput::Press);

        let in_flight = Arc::new(InFlight::new());
        let (batch_tx, mut batch_rx) = mpsc::channel(32);

        let channel = match DetectionChannel::connect(
            &self.config.detector_url,
            batch_tx,
            in_flight.clone(),
        )
        .await
        {
            Ok(channel) => Arc::new(channel),
            Err(err) => {
                self.fail_session_start(inner, format!("detector connection failed: {err}"));
                return Err(err).context("could not open detection channel");
            }
        };

        let source = match acquire_with_fallback(
            self.backend.as_ref(),
            inner.selected_device.as_deref(),
        ) {
            Ok(source) => source,
            Err(err) => {
                channel.close();
                self.fail_session_start(inner, format!("camera unavailable: {err}"));
                return Err(err).context("could not acquire a camera");
            }
        };
        info!(device = %source.device().label, "capture session starting");

        let accumulator = Arc::new(Mutex::new(SessionAccumulator::new(
            self.catalog.clone(),
            self.cache.clone(),
        )));

        // Batches are applied one at a time, in arrival order, so a slow
        // catalog resolution for an older batch can never overwrite a
        // newer snapshot.
        let batch_worker = tokio::spawn({
            let accumulator = accumulator.clone();
            let events = self.events.clone();
            let in_flight = in_flight.clone();
            async move {
                while let Some(batch) = batch_rx.recv().await {
                    let outcome = accumulator
                        .lock()
                        .await
                        .apply_detections(&batch.detections)
                        .await;
                    if outcome.changed {
                        let _ = events.send(SessionEvent::DetectionCue);
                    }
                    let _ = events.send(SessionEvent::AverageFps {
                        fps: batch.average_fps,
                    });
                    in_flight.settle();
                }
            }
        });

        let stop = Arc::new(AtomicBool::new(false));
        let (status_tx, status_rx) = watch::channel(SamplerStatus::default());
        let sampler = tokio::spawn(sampling_loop(
            source,
            Arc::new(ChannelSink(channel.clone())),
            status_tx,
            self.config.sample_interval,
            self.config.frame_edge,
            stop.clone(),
        ));
        self.advance(inner, SessionInput::SamplingStarted);

        let started = Instant::now();

        // Progress and the max-duration cutoff run off the monotonic clock,
        // independent of frame send/receive timing.
        let progress_ticker = tokio::spawn({
            let controller = self.clone();
            let max = self.config.max_session;
            let tick = self.config.progress_tick;
            async move {
                let mut interval = tokio::time::interval(tick);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    let elapsed = started.elapsed();
                    controller.emit(SessionEvent::Progress {
                        percent: progress_percent(elapsed, max),
                    });
                    if elapsed >= max {
                        // Finishing aborts this ticker, so it must happen on
                        // its own task.
                        let controller = controller.clone();
                        tokio::spawn(async move { controller.expire_session().await });
                        break;
                    }
                }
            }
        });

        let long_press_timer = tokio::spawn({
            let controller = self.clone();
            let threshold = self.config.long_press;
            async move {
                tokio::time::sleep(threshold).await;
                controller.engage_lock().await;
            }
        });

        inner.session = Some(ActiveSession {
            channel,
            accumulator,
            in_flight,
            started,
            stop,
            status_rx,
            sampler,
            progress_ticker,
            long_press_timer,
            batch_worker,
        });
        Ok(())
    }

    fn fail_session_start(&self, inner: &mut Inner, message: String) {
        warn!("{message}");
        self.emit(SessionEvent::SessionError { message });
        inner.phase = SessionPhase::Idle;
        self.emit(SessionEvent::PhaseChanged {
            phase: SessionPhase::Idle,
        });
    }

    /// Still held once the short-press threshold elapses: lock the session.
    async fn engage_lock(&self) {
        let mut inner = self.inner.lock().await;
        if !matches!(
            inner.phase,
            SessionPhase::Priming | SessionPhase::Capturing
        ) {
            return;
        }
        self.advance(&mut inner, SessionInput::LongPressElapsed);
        self.emit(SessionEvent::LockEngaged);
    }

    async fn expire_session(&self) {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            self.finish_session(&mut inner, SessionInput::MaxDurationElapsed, "max duration")
                .await;
        }
    }

    async fn finish_session(&self, inner: &mut Inner, input: SessionInput, reason: &str) {
        let Some(session) = inner.session.take() else {
            return;
        };
        info!(
            reason,
            elapsed_ms = session.started.elapsed().as_millis() as u64,
            "capture session finishing"
        );

        // Sampling and timers stop immediately; aborting the sampler drops
        // the frame source, which releases the camera.
        session.stop.store(true, Ordering::Relaxed);
        session.sampler.abort();
        session.progress_ticker.abort();
        session.long_press_timer.abort();

        self.advance(inner, input);
        self.emit(SessionEvent::Progress { percent: 0.0 });

        let items = session.accumulator.lock().await.take_session_items();
        if !items.is_empty() {
            merge_session(&mut inner.cart, &items);
            self.emit(SessionEvent::SessionMerged {
                line_items: inner.cart.len(),
            });
        }

        // Frames already sent keep getting processed until the counter
        // drains, so the channel and its worker outlive the session.
        inner.lingering = Some(LingeringSession {
            channel: session.channel,
            batch_worker: session.batch_worker,
        });

        let drain_watcher = tokio::spawn({
            let events = self.events.clone();
            let in_flight = session.in_flight;
            let timeout = self.config.drain_timeout;
            async move {
                if tokio::time::timeout(timeout, in_flight.drained())
                    .await
                    .is_err()
                {
                    warn!(
                        outstanding = in_flight.current(),
                        "in-flight frames unanswered after {:?}, presuming lost", timeout
                    );
                    in_flight.force_clear();
                }
                let _ = events.send(SessionEvent::ProcessingComplete);
            }
        });
        inner.drain_watcher = Some(drain_watcher);
    }

    /// "Add more products": back to idle for another capture gesture. The
    /// accumulated cart is kept; the next press builds a fresh channel and
    /// fresh session snapshots.
    pub async fn rearm(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            bail!("cannot re-arm while a session is active");
        }
        self.teardown_lingering(&mut inner);
        if inner.phase != SessionPhase::Idle {
            inner.phase = SessionPhase::Idle;
            self.emit(SessionEvent::PhaseChanged {
                phase: SessionPhase::Idle,
            });
        }
        Ok(())
    }

    /// Discards everything: active session, accumulated cart, catalog
    /// cache. The embedder is told to drop its session state too.
    pub async fn hard_reset(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown_session(&mut inner);
        self.teardown_lingering(&mut inner);
        inner.cart.clear();
        self.cache.clear().await;
        inner.phase = SessionPhase::Idle;
        self.emit(SessionEvent::ResetRequested);
        self.emit(SessionEvent::PhaseChanged {
            phase: SessionPhase::Idle,
        });
    }

    /// Unconditional teardown for page unmount: releases the camera and
    /// closes the channel no matter which phase the session was in.
    pub async fn dispose(&self) {
        let mut inner = self.inner.lock().await;
        self.teardown_session(&mut inner);
        self.teardown_lingering(&mut inner);
        inner.phase = SessionPhase::Idle;
        debug!("capture controller disposed");
    }

    fn teardown_session(&self, inner: &mut Inner) {
        if let Some(session) = inner.session.take() {
            session.stop.store(true, Ordering::Relaxed);
            session.sampler.abort();
            session.progress_ticker.abort();
            session.long_press_timer.abort();
            session.batch_worker.abort();
            session.channel.close();
        }
    }

    fn teardown_lingering(&self, inner: &mut Inner) {
        if let Some(lingering) = inner.lingering.take() {
            lingering.channel.close();
            lingering.batch_worker.abort();
        }
        if let Some(watcher) = inner.drain_watcher.take() {
            watcher.abort();
        }
    }

    /// Sends the accumulated cart to the transaction service. On failure
    /// the cart is preserved so the user can retry without re-capturing.
    pub async fn submit(&self, gateway: &dyn TransactionGateway) -> Result<()> {
        let draft = {
            let inner = self.inner.lock().await;
            if inner.cart.is_empty() {
                bail!("select at least one product before submitting");
            }
            draft_from_cart(&inner.cart)
        };

        match gateway.create_transaction(&draft).await {
            Ok(()) => {
                self.inner.lock().await.cart.clear();
                info!(items = draft.data.len(), "transaction submitted");
                Ok(())
            }
            Err(err) => {
                self.emit(SessionEvent::SessionError {
                    message: format!("transaction failed: {err}"),
                });
                Err(err).context("transaction submission failed; cart preserved for retry")
            }
        }
    }

    pub fn devices(&self) -> Result<Vec<CameraDevice>> {
        self.backend.enumerate()
    }

    /// Selects the camera for the next session. Rejected while a session is
    /// running: the device may not change mid-capture.
    pub async fn select_device(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.is_some() {
            bail!("cannot change camera during an active session");
        }
        inner.selected_device = Some(id.to_string());
        Ok(())
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    pub async fn accumulated_cart(&self) -> Vec<LineItem> {
        self.inner.lock().await.cart.clone()
    }

    pub async fn cart_total(&self) -> i64 {
        pos_cart::cart_total(&self.inner.lock().await.cart)
    }

    pub async fn sampler_status(&self) -> Option<SamplerStatus> {
        let inner = self.inner.lock().await;
        inner
            .session
            .as_ref()
            .map(|session| session.status_rx.borrow().clone())
    }

    /// Manual cart edits, clamped the way the transaction form clamps them.
    pub async fn set_item_quantity(&self, key: &str, quantity: u32) -> Result<()> {
        self.edit_item(key, |item| item.set_quantity(quantity)).await
    }

    pub async fn increase_item(&self, key: &str) -> Result<()> {
        self.edit_item(key, LineItem::increase).await
    }

    pub async fn decrease_item(&self, key: &str) -> Result<()> {
        self.edit_item(key, LineItem::decrease).await
    }

    pub async fn remove_item(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let before = inner.cart.len();
        pos_cart::remove_item(&mut inner.cart, key);
        if inner.cart.len() == before {
            bail!("no cart item with key {key}");
        }
        Ok(())
    }

    async fn edit_item(&self, key: &str, edit: impl FnOnce(&mut LineItem)) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let item = inner
            .cart
            .iter_mut()
            .find(|item| item.key() == key)
            .with_context(|| format!("no cart item with key {key}"))?;
        edit(item);
        Ok(())
    }

    fn advance(&self, inner: &mut Inner, input: SessionInput) {
        let next = transition(inner.phase, input);
        if next != inner.phase {
            inner.phase = next;
            self.emit(SessionEvent::PhaseChanged { phase: next });
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pos_capture::SyntheticBackend;
    use pos_catalog::{
        CatalogError, ProductPage, ProductQuery, ProductRecord, TransactionDraft,
        TransactionError,
    };
    use std::sync::Mutex as StdMutex;

    struct EmptyCatalog;

    #[async_trait]
    impl ProductCatalog for EmptyCatalog {
        async fn product_detail(&self, id: &str) -> Result<ProductRecord, CatalogError> {
            Err(CatalogError::NotFound(id.to_string()))
        }

        async fn products(&self, _query: &ProductQuery) -> Result<ProductPage, CatalogError> {
            Ok(ProductPage::default())
        }
    }

    struct RecordingGateway {
        drafts: StdMutex<Vec<TransactionDraft>>,
        fail: bool,
    }

    impl RecordingGateway {
        fn new(fail: bool) -> Self {
            Self {
                drafts: StdMutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl TransactionGateway for RecordingGateway {
        async fn create_transaction(&self, draft: &TransactionDraft) -> Result<(), TransactionError> {
            if self.fail {
                return Err(TransactionError::Rejected(500));
            }
            self.drafts.lock().unwrap().push(draft.clone());
            Ok(())
        }
    }

    fn controller() -> CaptureController {
        let (controller, _events) = CaptureController::new(
            CaptureConfig::default(),
            Arc::new(SyntheticBackend::single("Test Camera")),
            Arc::new(EmptyCatalog),
        );
        controller
    }

    fn item(id: &str, price: i64, stock: u32, quantity: u32) -> LineItem {
        LineItem {
            product_id: id.to_string(),
            name: format!("Product {id}"),
            unit_price: price,
            stock,
            variant_name: None,
            quantity,
            subtotal: price * i64::from(quantity),
        }
    }

    #[tokio::test]
    async fn submit_clears_cart_on_success() {
        let controller = controller();
        controller.inner.lock().await.cart = vec![item("p1", 1000, 10, 2)];

        let gateway = RecordingGateway::new(false);
        controller.submit(&gateway).await.unwrap();

        assert!(controller.accumulated_cart().await.is_empty());
        let drafts = gateway.drafts.lock().unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].data[0].product_id, "p1");
    }

    #[tokio::test]
    async fn submit_failure_preserves_cart_for_retry() {
        let controller = controller();
        controller.inner.lock().await.cart = vec![item("p1", 1000, 10, 2)];

        let gateway = RecordingGateway::new(true);
        assert!(controller.submit(&gateway).await.is_err());

        let cart = controller.accumulated_cart().await;
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].quantity, 2);
    }

    #[tokio::test]
    async fn submit_rejects_empty_cart() {
        let controller = controller();
        let gateway = RecordingGateway::new(false);
        assert!(controller.submit(&gateway).await.is_err());
    }

    #[tokio::test]
    async fn manual_edits_keep_subtotal_consistent() {
        let controller = controller();
        controller.inner.lock().await.cart = vec![item("p1", 250, 8, 2)];

        controller.increase_item("p1").await.unwrap();
        controller.set_item_quantity("p1", 5).await.unwrap();
        controller.decrease_item("p1").await.unwrap();

        let cart = controller.accumulated_cart().await;
        assert_eq!(cart[0].quantity, 4);
        assert_eq!(cart[0].subtotal, 1000);

        controller.remove_item("p1").await.unwrap();
        assert!(controller.accumulated_cart().await.is_empty());
        assert!(controller.remove_item("p1").await.is_err());
    }

    #[tokio::test]
    async fn device_selection_only_outside_sessions() {
        let controller = controller();
        controller.select_device("cam0").await.unwrap();
        assert_eq!(
            controller.inner.lock().await.selected_device.as_deref(),
            Some("cam0")
        );
    }

    #[tokio::test]
    async fn hard_reset_clears_cart_and_notifies() {
        let (controller, mut events) = CaptureController::new(
            CaptureConfig::default(),
            Arc::new(SyntheticBackend::single("Test Camera")),
            Arc::new(EmptyCatalog),
        );
        controller.inner.lock().await.cart = vec![item("p1", 1000, 10, 2)];

        controller.hard_reset().await;

        assert!(controller.accumulated_cart().await.is_empty());
        let mut saw_reset = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::ResetRequested) {
                saw_reset = true;
            }
        }
        assert!(saw_reset);
    }
}
