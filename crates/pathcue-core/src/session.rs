//! Per-client state and the registry that owns it.
//!
//! A session's position is written by inbound fixes and read concurrently by
//! the detection and navigation loops, so it lives behind its own lock. The
//! two activity flags are cancellation tokens: loops poll them once per
//! iteration and exit on their own after `stop`.

use std::collections::HashMap;
use std::sync::Arc;

use model::{Coordinate, SessionId};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Session {
    id: SessionId,
    position: Mutex<Option<Coordinate>>,
    detection: CancellationToken,
    tracking: CancellationToken,
    // token of the navigation currently running, if any
    navigation: Mutex<Option<CancellationToken>>,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            position: Mutex::new(None),
            detection: CancellationToken::new(),
            tracking: CancellationToken::new(),
            navigation: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn position(&self) -> Option<Coordinate> {
        *self.position.lock()
    }

    pub fn set_position(&self, at: Coordinate) {
        *self.position.lock() = Some(at);
    }

    pub fn detection_active(&self) -> bool {
        !self.detection.is_cancelled()
    }

    pub fn tracking_active(&self) -> bool {
        !self.tracking.is_cancelled()
    }

    /// Hand out a token for a new navigation run, cancelling the previous one.
    ///
    /// The token is a child of the tracking token, so stopping the session
    /// also stops the navigation.
    pub fn begin_navigation(&self) -> CancellationToken {
        let token = self.tracking.child_token();
        if let Some(prev) = self.navigation.lock().replace(token.clone()) {
            debug!(session = %self.id, "superseding running navigation");
            prev.cancel();
        }
        token
    }

    pub fn stop(&self) {
        self.detection.cancel();
        self.tracking.cancel();
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh session. A live session under the same id is stopped
    /// and replaced.
    pub fn create(&self, id: SessionId) -> Arc<Session> {
        let session = Arc::new(Session::new(id.clone()));
        if let Some(old) = self.sessions.write().insert(id.clone(), session.clone()) {
            old.stop();
        }
        info!(session = %id, "session created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Silently ignored when the session is gone.
    pub fn set_position(&self, id: &SessionId, at: Coordinate) {
        match self.get(id) {
            Some(s) => s.set_position(at),
            None => debug!(session = %id, "position for unknown session dropped"),
        }
    }

    pub fn get_position(&self, id: &SessionId) -> Option<Coordinate> {
        self.get(id).and_then(|s| s.position())
    }

    /// Flip both activity flags off. Safe to call any number of times.
    pub fn stop(&self, id: &SessionId) {
        if let Some(s) = self.get(id) {
            s.stop();
        }
    }

    pub fn destroy(&self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(id);
        if removed.is_some() {
            info!(session = %id, "session destroyed");
        }
        removed
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::from(s)
    }

    #[test]
    fn new_session_is_active_without_position() {
        let store = SessionStore::new();
        let s = store.create(sid("a"));
        assert!(s.detection_active());
        assert!(s.tracking_active());
        assert_eq!(store.get_position(&sid("a")), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn position_roundtrip_and_overwrite() {
        let store = SessionStore::new();
        store.create(sid("a"));
        store.set_position(&sid("a"), Coordinate::new(1.0, 2.0));
        store.set_position(&sid("a"), Coordinate::new(3.0, 4.0));
        assert_eq!(store.get_position(&sid("a")), Some(Coordinate::new(3.0, 4.0)));
    }

    #[test]
    fn unknown_session_is_a_noop() {
        let store = SessionStore::new();
        store.set_position(&sid("ghost"), Coordinate::new(1.0, 2.0));
        store.stop(&sid("ghost"));
        assert!(store.destroy(&sid("ghost")).is_none());
        assert_eq!(store.get_position(&sid("ghost")), None);
        assert!(store.is_empty());
    }

    #[test]
    fn stop_is_idempotent() {
        let store = SessionStore::new();
        let s = store.create(sid("a"));
        store.stop(&sid("a"));
        store.stop(&sid("a"));
        assert!(!s.detection_active());
        assert!(!s.tracking_active());
        // still registered until destroyed
        assert_eq!(store.len(), 1);
        store.destroy(&sid("a"));
        store.stop(&sid("a"));
        assert!(store.is_empty());
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SessionStore::new();
        let a = store.create(sid("a"));
        let b = store.create(sid("b"));
        store.set_position(&sid("a"), Coordinate::new(1.0, 1.0));
        store.stop(&sid("a"));
        assert!(!a.tracking_active());
        assert!(b.tracking_active());
        assert_eq!(b.position(), None);
    }

    #[test]
    fn recreate_stops_previous_instance() {
        let store = SessionStore::new();
        let first = store.create(sid("a"));
        let second = store.create(sid("a"));
        assert!(!first.tracking_active());
        assert!(second.tracking_active());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn new_navigation_cancels_previous_one() {
        let store = SessionStore::new();
        let s = store.create(sid("a"));
        let first = s.begin_navigation();
        let second = s.begin_navigation();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        s.stop();
        assert!(second.is_cancelled());
    }

    #[test]
    fn concurrent_writers_never_tear_coordinates() {
        let store = Arc::new(SessionStore::new());
        store.create(sid("a"));
        let writers: Vec<_> = (0..4)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for k in 0..1000 {
                        let v = (i * 1000 + k) as f64;
                        store.set_position(&sid("a"), Coordinate::new(v, v));
                    }
                })
            })
            .collect();
        for _ in 0..1000 {
            if let Some(p) = store.get_position(&sid("a")) {
                assert_eq!(p.lat, p.lng);
            }
        }
        for w in writers {
            w.join().unwrap();
        }
    }
}
