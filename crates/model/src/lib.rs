use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Opaque per-client identifier handed out by the transport.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---- obstacle detection ----

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Horizontal extent in pixels, never below 1.
    pub fn pixel_width(&self) -> i32 {
        if self.x2 > self.x1 { self.x2 - self.x1 } else { 1 }
    }

    pub fn as_array(&self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Detection {
    pub class_label: String,
    pub bbox: BoundingBox,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct AnnotatedDetection {
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub class_label: String,
    pub label: String,   // "chair: 1.0m"
    pub distance_m: f64,
    pub is_near: bool,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    #[serde(rename = "OBSTACLE NEAR!")]
    ObstacleNear,
    #[serde(rename = "SCANNING")]
    Scanning,
}

// ---- routing ----

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Step {
    pub end_waypoint: Coordinate,
    pub instruction_html: String,
    pub instruction_spoken: String,
    pub distance_text: String,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Route {
    pub summary: String,
    pub total_distance_text: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    pub overview_polyline: String,
}

// ---- transport ----

/// Requests accepted from the transport layer.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Inbound {
    Connect,
    Disconnect,
    SetInitialPosition { lat: f64, lng: f64 },
    RealtimePosition { lat: f64, lng: f64 },
    PositionFallback,
    StartNavigation { destination: String },
}

/// Events produced for the transport/presentation layer.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Outbound {
    Update {
        frame: u64,
        obstacles: Vec<AnnotatedDetection>,
        status: FrameStatus,
    },
    SpeakAlert {
        message: String,
    },
    InitialLocation {
        lat: f64,
        lng: f64,
        address: String,
    },
    LocationError {
        message: String,
    },
    NavUpdate {
        message: String,
        spoken: String,
    },
    NavRouteData {
        polyline: String,
    },
    NavRouteSummary {
        message: String,
        spoken: String,
    },
    NavStep {
        index: usize,
        message: String,
        spoken: String,
    },
    NavDistanceUpdate {
        meters: f64,
        message: String,
    },
    NavComplete {
        message: String,
        spoken: String,
    },
    NavError {
        message: String,
        spoken: String,
    },
}

impl Outbound {
    pub fn name(&self) -> &'static str {
        match self {
            Outbound::Update { .. } => "update",
            Outbound::SpeakAlert { .. } => "speak_alert",
            Outbound::InitialLocation { .. } => "initial_location",
            Outbound::LocationError { .. } => "location_error",
            Outbound::NavUpdate { .. } => "nav_update",
            Outbound::NavRouteData { .. } => "nav_route_data",
            Outbound::NavRouteSummary { .. } => "nav_route_summary",
            Outbound::NavStep { .. } => "nav_step",
            Outbound::NavDistanceUpdate { .. } => "nav_distance_update",
            Outbound::NavComplete { .. } => "nav_complete",
            Outbound::NavError { .. } => "nav_error",
        }
    }
}
