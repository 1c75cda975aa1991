//! Session-scoped navigation and obstacle alerting engine used by pathcue

pub mod alerts;
pub mod capture;
pub mod config;
pub mod driver;
pub mod navigation;
pub mod route;
pub mod session;
mod speech;

use bytes::Bytes;
use model::{Coordinate, Detection, Outbound, SessionId};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use config::EngineConfig;
pub use driver::{Collaborators, Engine};
pub use session::{Session, SessionStore};
pub use speech::strip_markup;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One outbound event addressed to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub session: SessionId,
    pub at: String,
    #[serde(flatten)]
    pub event: Outbound,
}

impl Envelope {
    pub fn new(session: SessionId, event: Outbound) -> Self {
        let at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        Self { session, at, event }
    }
}

pub type EventTx = crossbeam_channel::Sender<Envelope>;
pub type EventRx = crossbeam_channel::Receiver<Envelope>;

pub fn channel() -> (EventTx, EventRx) {
    crossbeam_channel::unbounded()
}

/// A captured video frame.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub index: u64,
    /// Encoded image handed to the `Detector`. The engine itself only logs
    /// its size.
    pub data: Bytes,
}

/// Object detector run against each captured frame.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<Detection>;
}

/// A video capture device. Reads block for at most one frame interval.
pub trait Camera: Send {
    fn is_opened(&self) -> bool;
    fn read(&mut self) -> Option<Frame>;
    fn release(&mut self) {}
}

pub trait CameraFactory: Send + Sync {
    fn open(&self) -> Box<dyn Camera>;
}

/// Trait for any directions provider. Returns the raw, untrusted payload.
#[async_trait::async_trait]
pub trait DirectionsSource: Send + Sync {
    async fn directions(&self, origin: Coordinate, destination: &str) -> Result<serde_json::Value, SourceError>;
}

/// Reverse and network-based geolocation.
#[async_trait::async_trait]
pub trait Geolocator: Send + Sync {
    /// `Ok(None)` when the provider answered but knows no address.
    async fn reverse(&self, at: Coordinate) -> Result<Option<String>, SourceError>;
    async fn locate_by_network(&self) -> Result<Option<(Coordinate, String)>, SourceError>;
}
