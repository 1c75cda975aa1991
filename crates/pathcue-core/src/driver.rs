//! Per-client orchestration: owns the session store, the shared capture
//! device, and spawns the detection and navigation loops.

use std::sync::Arc;

use model::{Coordinate, Detection, Inbound, Outbound, SessionId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alerts::ObstaclePolicy;
use crate::capture::{CaptureRead, SharedCapture};
use crate::navigation::{NavState, Navigation};
use crate::session::{Session, SessionStore};
use crate::{CameraFactory, Detector, DirectionsSource, EngineConfig, Envelope, EventTx, Geolocator};

/// The external systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub directions: Arc<dyn DirectionsSource>,
    pub geolocator: Arc<dyn Geolocator>,
    pub detector: Arc<dyn Detector>,
    pub cameras: Arc<dyn CameraFactory>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: EngineConfig,
    store: SessionStore,
    capture: SharedCapture,
    directions: Arc<dyn DirectionsSource>,
    geolocator: Arc<dyn Geolocator>,
    detector: Arc<dyn Detector>,
    tx: EventTx,
}

impl Engine {
    pub fn new(cfg: EngineConfig, collab: Collaborators, tx: EventTx) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                store: SessionStore::new(),
                capture: SharedCapture::new(collab.cameras),
                directions: collab.directions,
                geolocator: collab.geolocator,
                detector: collab.detector,
                tx,
            }),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn capture_acquired(&self) -> bool {
        self.inner.capture.is_acquired()
    }

    /// Dispatch one transport request. Requests for unknown sessions are ignored.
    pub async fn handle(&self, id: SessionId, request: Inbound) {
        match request {
            Inbound::Connect => {
                self.connect(id);
            }
            Inbound::Disconnect => self.disconnect(&id),
            Inbound::SetInitialPosition { lat, lng } => self.set_initial_position(&id, Coordinate::new(lat, lng)).await,
            Inbound::RealtimePosition { lat, lng } => self.update_position(&id, Coordinate::new(lat, lng)),
            Inbound::PositionFallback => self.position_fallback(&id).await,
            Inbound::StartNavigation { destination } => {
                self.start_navigation(&id, &destination);
            }
        }
    }

    /// Register the session and start its detection loop.
    pub fn connect(&self, id: SessionId) -> JoinHandle<()> {
        info!(session = %id, "client connected");
        let session = self.inner.store.create(id);
        self.inner.capture.acquire();
        tokio::spawn(detection_loop(self.clone(), session))
    }

    pub fn disconnect(&self, id: &SessionId) {
        info!(session = %id, "client disconnected");
        self.inner.store.stop(id);
        self.inner.store.destroy(id);
        let store = &self.inner.store;
        if self.inner.capture.release_when(|| store.is_empty()) {
            info!("all clients disconnected");
        }
    }

    /// Disconnect every session.
    pub fn shutdown(&self) {
        for id in self.inner.store.ids() {
            self.disconnect(&id);
        }
    }

    pub fn update_position(&self, id: &SessionId, at: Coordinate) {
        self.inner.store.set_position(id, at);
    }

    /// Store a browser-supplied first fix and answer with its street address.
    pub async fn set_initial_position(&self, id: &SessionId, at: Coordinate) {
        let Some(session) = self.inner.store.get(id) else { return };
        info!(session = %id, lat = at.lat, lng = at.lng, "initial location received");
        session.set_position(at);

        let address = match self.inner.geolocator.reverse(at).await {
            Ok(Some(address)) => address,
            Ok(None) => "Address not found".to_string(),
            Err(e) => {
                warn!(session = %id, error = %e, "reverse geocoding failed");
                "Could not reverse geocode address".to_string()
            }
        };
        self.emit(id, Outbound::InitialLocation { lat: at.lat, lng: at.lng, address });
    }

    /// Fall back to network geolocation when the client has no fix.
    pub async fn position_fallback(&self, id: &SessionId) {
        let Some(session) = self.inner.store.get(id) else { return };
        info!(session = %id, "falling back to network location");

        match self.inner.geolocator.locate_by_network().await {
            Ok(Some((at, address))) => {
                session.set_position(at);
                self.emit(id, Outbound::InitialLocation { lat: at.lat, lng: at.lng, address });
            }
            Ok(None) => self.emit(id, Outbound::LocationError { message: "Could not fetch location via IP.".into() }),
            Err(e) => {
                warn!(session = %id, error = %e, "network geolocation failed");
                self.emit(
                    id,
                    Outbound::LocationError { message: format!("An error occurred during IP geolocation: {e}") },
                );
            }
        }
    }

    /// Start guidance toward `destination`, superseding any navigation the
    /// session already runs. Returns `None` for an unknown session or an
    /// empty destination.
    pub fn start_navigation(&self, id: &SessionId, destination: &str) -> Option<JoinHandle<NavState>> {
        let destination = destination.trim();
        if destination.is_empty() {
            return None;
        }
        let session = self.inner.store.get(id)?;
        let cancel = session.begin_navigation();
        let nav = Navigation::new(
            session,
            self.inner.directions.clone(),
            self.inner.tx.clone(),
            self.inner.cfg.navigation.clone(),
            cancel,
        );
        let destination = destination.to_string();
        Some(tokio::spawn(async move { nav.run(&destination).await }))
    }

    fn emit(&self, id: &SessionId, event: Outbound) {
        let _ = self.inner.tx.send(Envelope::new(id.clone(), event));
    }
}

async fn detection_loop(engine: Engine, session: Arc<Session>) {
    let cfg = engine.inner.cfg.capture.clone();
    let mut policy = ObstaclePolicy::new(engine.inner.cfg.obstacle.clone());
    info!(session = %session.id(), "obstacle detection started");

    while session.detection_active() {
        let grabbed = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || grab_and_detect(&engine.inner)).await
        };
        let (frame, detections) = match grabbed {
            Ok((CaptureRead::Frame(frame), detections)) => (frame, detections),
            Ok((CaptureRead::Dropped, _)) => {
                tokio::time::sleep(cfg.read_retry()).await;
                continue;
            }
            Ok((CaptureRead::Unavailable, _)) => {
                warn!(session = %session.id(), "capture device unavailable");
                tokio::time::sleep(cfg.device_retry()).await;
                if session.detection_active() {
                    engine.inner.capture.acquire();
                }
                continue;
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "frame worker failed");
                break;
            }
        };

        debug!(session = %session.id(), frame = frame.index, bytes = frame.data.len(), "frame analysed");
        let assessment = policy.assess(&detections, tokio::time::Instant::now().into_std());
        for message in assessment.alerts {
            engine.emit(session.id(), Outbound::SpeakAlert { message });
        }
        engine.emit(
            session.id(),
            Outbound::Update { frame: frame.index, obstacles: assessment.obstacles, status: assessment.status },
        );
        tokio::time::sleep(cfg.frame_pause()).await;
    }
    info!(session = %session.id(), "obstacle detection stopped");
}

/// Blocking half of one detection iteration: device read and inference.
fn grab_and_detect(inner: &Inner) -> (CaptureRead, Vec<Detection>) {
    match inner.capture.read() {
        CaptureRead::Frame(frame) => {
            let detections = inner.detector.detect(&frame);
            (CaptureRead::Frame(frame), detections)
        }
        other => (other, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::navigation::FailReason;
    use crate::testing::{drain, CountingFactory, FakeDirections, FakeGeo, FixedDetector};
    use crate::{channel, EventRx};
    use model::{BoundingBox, Detection, FrameStatus};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn chair() -> Detection {
        Detection { class_label: "chair".into(), bbox: BoundingBox::new(100, 50, 420, 300) }
    }

    struct Rig {
        engine: Engine,
        rx: EventRx,
        cameras: Arc<CountingFactory>,
        directions: Arc<FakeDirections>,
    }

    fn rig(detections: Vec<Detection>, geo: FakeGeo, device_ok: bool) -> Rig {
        let (tx, rx) = channel();
        let cameras = CountingFactory::new(device_ok);
        let directions = FakeDirections::ok(json!({ "status": "ZERO_RESULTS", "routes": [] }));
        let collab = Collaborators {
            directions: directions.clone(),
            geolocator: Arc::new(geo),
            detector: Arc::new(FixedDetector(detections)),
            cameras: cameras.clone(),
        };
        Rig { engine: Engine::new(EngineConfig::default(), collab, tx), rx, cameras, directions }
    }

    fn quiet_geo() -> FakeGeo {
        FakeGeo { address: Ok(None), network: Ok(None) }
    }

    fn events_for(rx: &EventRx, id: &str) -> Vec<Outbound> {
        rx.try_iter().filter(|e| e.session.as_str() == id).map(|e| e.event).collect()
    }

    fn alerts(events: &[Outbound]) -> usize {
        events.iter().filter(|e| matches!(e, Outbound::SpeakAlert { .. })).count()
    }

    #[tokio::test(start_paused = true)]
    async fn near_chair_alerts_once_per_cooldown() {
        let r = rig(vec![chair()], quiet_geo(), true);
        let id = SessionId::from("s1");
        let handle = r.engine.connect(id.clone());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let first = events_for(&r.rx, "s1");
        let frames: Vec<_> = first.iter().filter(|e| matches!(e, Outbound::Update { .. })).collect();
        assert!(frames.len() >= 3, "only {} frames", frames.len());
        for f in &frames {
            assert!(matches!(f, Outbound::Update { status: FrameStatus::ObstacleNear, .. }));
        }
        assert_eq!(alerts(&first), 1);
        assert!(matches!(
            first.iter().find(|e| matches!(e, Outbound::SpeakAlert { .. })),
            Some(Outbound::SpeakAlert { message }) if message == "Warning: chair detected 1.0 meters ahead."
        ));

        // one more once the 5 s cooldown has passed
        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(alerts(&events_for(&r.rx, "s1")), 1);

        r.engine.disconnect(&id);
        handle.await.unwrap();
        assert!(!r.engine.capture_acquired());
        assert_eq!(r.cameras.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn alert_throttle_is_per_session() {
        let r = rig(vec![chair()], quiet_geo(), true);
        let a = r.engine.connect(SessionId::from("a"));
        let b = r.engine.connect(SessionId::from("b"));

        tokio::time::sleep(Duration::from_millis(500)).await;
        let events: Vec<_> = r.rx.try_iter().collect();
        for id in ["a", "b"] {
            let n = events
                .iter()
                .filter(|e| e.session.as_str() == id && matches!(e.event, Outbound::SpeakAlert { .. }))
                .count();
            assert_eq!(n, 1, "session {id}");
        }
        assert_eq!(r.cameras.opened.load(Ordering::SeqCst), 1);

        r.engine.disconnect(&SessionId::from("a"));
        a.await.unwrap();
        // b still holds the device
        assert!(r.engine.capture_acquired());
        r.engine.shutdown();
        b.await.unwrap();
        assert!(!r.engine.capture_acquired());
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_device_keeps_retrying() {
        let r = rig(vec![chair()], quiet_geo(), false);
        let id = SessionId::from("s1");
        let handle = r.engine.connect(id.clone());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!handle.is_finished());
        assert!(drain(&r.rx).is_empty());
        assert!(r.cameras.opened.load(Ordering::SeqCst) >= 3);

        r.engine.disconnect(&id);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn initial_location_reports_address() {
        let geo = FakeGeo { address: Ok(Some("1 Main St".into())), network: Ok(None) };
        let r = rig(vec![], geo, true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());

        r.engine.handle(id.clone(), Inbound::SetInitialPosition { lat: 1.5, lng: 2.5 }).await;

        assert_eq!(r.engine.sessions().get_position(&id), Some(Coordinate::new(1.5, 2.5)));
        let events = events_for(&r.rx, "s1");
        assert!(events.contains(&Outbound::InitialLocation { lat: 1.5, lng: 2.5, address: "1 Main St".into() }));
        r.engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn initial_location_address_fallbacks() {
        for (reply, expected) in [
            (Ok(None), "Address not found"),
            (Err("quota".to_string()), "Could not reverse geocode address"),
        ] {
            let r = rig(vec![], FakeGeo { address: reply, network: Ok(None) }, true);
            let id = SessionId::from("s1");
            r.engine.connect(id.clone());
            r.engine.set_initial_position(&id, Coordinate::new(3.0, 4.0)).await;
            let events = events_for(&r.rx, "s1");
            assert!(
                events.contains(&Outbound::InitialLocation { lat: 3.0, lng: 4.0, address: expected.into() }),
                "{events:?}"
            );
            r.engine.shutdown();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_fallback_sets_position() {
        let at = Coordinate::new(48.85, 2.35);
        let geo = FakeGeo { address: Ok(None), network: Ok(Some((at, "Paris, FR".into()))) };
        let r = rig(vec![], geo, true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());

        r.engine.handle(id.clone(), Inbound::PositionFallback).await;

        assert_eq!(r.engine.sessions().get_position(&id), Some(at));
        assert!(events_for(&r.rx, "s1").contains(&Outbound::InitialLocation {
            lat: 48.85,
            lng: 2.35,
            address: "Paris, FR".into()
        }));
        r.engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn network_fallback_errors() {
        for (reply, expected) in [
            (Ok(None), "Could not fetch location via IP.".to_string()),
            (Err("boom".to_string()), "An error occurred during IP geolocation: boom".to_string()),
        ] {
            let r = rig(vec![], FakeGeo { address: Ok(None), network: reply }, true);
            let id = SessionId::from("s1");
            r.engine.connect(id.clone());
            r.engine.position_fallback(&id).await;
            assert_eq!(r.engine.sessions().get_position(&id), None);
            assert!(events_for(&r.rx, "s1").contains(&Outbound::LocationError { message: expected }));
            r.engine.shutdown();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_session_requests_are_ignored() {
        let geo = FakeGeo { address: Ok(Some("x".into())), network: Ok(None) };
        let r = rig(vec![], geo, true);
        let ghost = SessionId::from("ghost");

        r.engine.handle(ghost.clone(), Inbound::SetInitialPosition { lat: 1.0, lng: 1.0 }).await;
        r.engine.handle(ghost.clone(), Inbound::RealtimePosition { lat: 1.0, lng: 1.0 }).await;
        r.engine.handle(ghost.clone(), Inbound::PositionFallback).await;
        assert!(r.engine.start_navigation(&ghost, "somewhere").is_none());
        r.engine.handle(ghost.clone(), Inbound::Disconnect).await;

        assert!(drain(&r.rx).is_empty());
        assert_eq!(r.directions.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn navigation_before_any_fix_fails_once() {
        let r = rig(vec![], quiet_geo(), true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());

        assert!(r.engine.start_navigation(&id, "   ").is_none());
        let state = r.engine.start_navigation(&id, "Central Station").unwrap().await.unwrap();

        assert!(matches!(state, NavState::Failed(_)));
        assert_eq!(r.directions.calls(), 0);
        let errors = events_for(&r.rx, "s1").into_iter().filter(|e| e.name() == "nav_error").count();
        assert_eq!(errors, 1);
        r.engine.shutdown();
    }

    /// Blocks inside `detect` until the gate is opened or dropped.
    struct GatedDetector {
        gate: crossbeam_channel::Receiver<()>,
        entered: crossbeam_channel::Sender<()>,
    }

    impl Detector for GatedDetector {
        fn detect(&self, _frame: &crate::Frame) -> Vec<Detection> {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            vec![]
        }
    }

    #[tokio::test]
    async fn slow_detector_does_not_stall_requests() {
        let (tx, rx) = channel();
        let (open, gate) = crossbeam_channel::unbounded();
        let (entered_tx, entered) = crossbeam_channel::unbounded();
        let collab = Collaborators {
            directions: FakeDirections::ok(json!({})),
            geolocator: Arc::new(FakeGeo { address: Ok(Some("Here".into())), network: Ok(None) }),
            detector: Arc::new(GatedDetector { gate, entered: entered_tx }),
            cameras: CountingFactory::new(true),
        };
        let engine = Engine::new(EngineConfig::default(), collab, tx);
        let id = SessionId::from("s1");
        let handle = engine.connect(id.clone());

        // inference is now in progress on the first frame
        tokio::task::spawn_blocking(move || entered.recv()).await.unwrap().unwrap();
        engine.handle(id.clone(), Inbound::SetInitialPosition { lat: 1.0, lng: 2.0 }).await;
        assert!(events_for(&rx, "s1").contains(&Outbound::InitialLocation {
            lat: 1.0,
            lng: 2.0,
            address: "Here".into()
        }));

        engine.disconnect(&id);
        drop(open);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_navigation_without_fix_reports_once() {
        let r = rig(vec![], quiet_geo(), true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());

        let first = r.engine.start_navigation(&id, "A").unwrap();
        let second = r.engine.start_navigation(&id, "B").unwrap();

        assert_eq!(first.await.unwrap(), NavState::Cancelled);
        assert_eq!(second.await.unwrap(), NavState::Failed(FailReason::NoLocation));
        let events = events_for(&r.rx, "s1");
        assert_eq!(events.iter().filter(|e| e.name() == "nav_error").count(), 1);
        assert_eq!(events.iter().filter(|e| e.name() == "nav_update").count(), 1);
        r.engine.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_right_after_start_is_silent() {
        let r = rig(vec![], quiet_geo(), true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());

        let nav = r.engine.start_navigation(&id, "Central Station").unwrap();
        r.engine.disconnect(&id);

        assert_eq!(nav.await.unwrap(), NavState::Cancelled);
        let names: Vec<_> = events_for(&r.rx, "s1").iter().map(Outbound::name).collect();
        assert!(names.iter().all(|n| !n.starts_with("nav_")), "{names:?}");
        assert_eq!(r.directions.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_navigation() {
        let (tx, rx) = channel();
        let w1 = geodesy::offset(Coordinate::new(10.0, 10.0), 300.0, 0.0);
        let payload = json!({
            "status": "OK",
            "routes": [{
                "summary": "Long Rd",
                "overview_polyline": { "points": "abc" },
                "legs": [{ "distance": { "text": "300 m" }, "steps": [{
                    "end_location": { "lat": w1.lat, "lng": w1.lng },
                    "html_instructions": "Walk",
                    "distance": { "text": "300 m" }
                }]}]
            }]
        });
        let collab = Collaborators {
            directions: FakeDirections::ok(payload),
            geolocator: Arc::new(quiet_geo()),
            detector: Arc::new(FixedDetector(vec![])),
            cameras: CountingFactory::new(true),
        };
        let engine = Engine::new(EngineConfig::default(), collab, tx);
        let id = SessionId::from("s1");
        engine.connect(id.clone());
        engine.update_position(&id, Coordinate::new(10.0, 10.0));

        let nav = engine.start_navigation(&id, "Long Rd").unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        engine.disconnect(&id);

        assert_eq!(nav.await.unwrap(), NavState::Cancelled);
        let names: Vec<_> = rx.try_iter().map(|e| e.event.name()).collect();
        assert!(names.contains(&"nav_step"));
        assert!(!names.contains(&"nav_complete"));
        assert!(!names.contains(&"nav_error"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_navigation_supersedes_old() {
        let r = rig(vec![], quiet_geo(), true);
        let id = SessionId::from("s1");
        r.engine.connect(id.clone());
        r.engine.update_position(&id, Coordinate::new(0.0, 0.0));

        // both fail upstream, but the first is cancelled before it can report
        let first = r.engine.start_navigation(&id, "A").unwrap();
        let second = r.engine.start_navigation(&id, "B").unwrap();
        assert_eq!(first.await.unwrap(), NavState::Cancelled);
        assert!(matches!(second.await.unwrap(), NavState::Failed(_)));
        r.engine.shutdown();
    }
}
