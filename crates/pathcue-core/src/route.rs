//! Turning an untrusted directions payload into a [`Route`].
//!
//! The payload follows the Google Directions JSON shape. Only the first
//! route is used; its legs are flattened into one ordered step list.

use model::{Coordinate, Route, Step};
use serde::Deserialize;
use serde_json::Value;

use crate::speech::strip_markup;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RouteError {
    /// Provider answered with a non-OK status, kept verbatim.
    #[error("{0}")]
    Status(String),
    #[error("no routes returned")]
    NoRoutes,
    #[error("{0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct WireRoute {
    summary: String,
    legs: Vec<WireLeg>,
    overview_polyline: WirePolyline,
}

#[derive(Deserialize)]
struct WirePolyline {
    points: String,
}

#[derive(Deserialize)]
struct WireLeg {
    distance: WireText,
    steps: Vec<WireStep>,
}

#[derive(Deserialize)]
struct WireText {
    text: String,
}

#[derive(Deserialize)]
struct WireStep {
    end_location: WireLatLng,
    html_instructions: String,
    distance: WireText,
}

#[derive(Deserialize)]
struct WireLatLng {
    lat: f64,
    lng: f64,
}

pub fn parse_directions(payload: &Value) -> Result<Route, RouteError> {
    let status = payload.get("status").and_then(Value::as_str).unwrap_or("Unknown");
    if status != "OK" {
        return Err(RouteError::Status(status.to_string()));
    }

    let routes = payload
        .get("routes")
        .and_then(Value::as_array)
        .ok_or_else(|| RouteError::Malformed("missing field `routes`".into()))?;
    let first = routes.first().ok_or(RouteError::NoRoutes)?;

    let wire: WireRoute = serde_json::from_value(first.clone()).map_err(|e| RouteError::Malformed(e.to_string()))?;
    if wire.legs.is_empty() {
        return Err(RouteError::Malformed("route has no legs".into()));
    }

    let total_distance_text = wire
        .legs
        .iter()
        .map(|l| l.distance.text.as_str())
        .collect::<Vec<_>>()
        .join(" + ");

    let steps = wire
        .legs
        .into_iter()
        .flat_map(|leg| leg.steps)
        .map(|s| Step {
            end_waypoint: Coordinate::new(s.end_location.lat, s.end_location.lng),
            instruction_spoken: strip_markup(&s.html_instructions),
            instruction_html: s.html_instructions,
            distance_text: s.distance.text,
        })
        .collect();

    Ok(Route {
        summary: wire.summary,
        total_distance_text,
        steps,
        overview_polyline: wire.overview_polyline.points,
    })
}
