use std::time::Duration;

use anyhow::Context;
use model::Coordinate;
use pathcue_core::{DirectionsSource, Geolocator, SourceError};
use serde_json::Value;
use tracing::debug;

const KEY_MISSING: &str = "Google Maps API key is not configured on the server.";

#[derive(Clone, Debug)]
pub struct GoogleConfig {
    pub api_key: Option<String>,
    pub directions_url: String, // Directions API JSON endpoint
    pub geocode_url: String,
    /// IP geolocation endpoint answering `{"loc": "lat,lng", "city": ..}`
    pub ip_lookup_url: String,
    pub travel_mode: String,
    pub language: String,
    pub timeout: Duration,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            directions_url: "https://maps.googleapis.com/maps/api/directions/json".into(),
            geocode_url: "https://maps.googleapis.com/maps/api/geocode/json".into(),
            ip_lookup_url: "https://ipinfo.io/json".into(),
            travel_mode: "walking".into(),
            language: "en".into(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct GoogleMaps {
    cfg: GoogleConfig,
    http: reqwest::Client,
}

impl GoogleMaps {
    pub fn new(cfg: GoogleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building http client")?;
        Ok(Self { cfg, http })
    }

    fn key(&self) -> Result<&str, SourceError> {
        match self.cfg.api_key.as_deref() {
            Some(k) if !k.trim().is_empty() => Ok(k),
            _ => Err(SourceError::NotConfigured(KEY_MISSING.into())),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, SourceError> {
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Msg(format!("API request error: {e}")))?;
        resp.json::<Value>()
            .await
            .map_err(|e| SourceError::Msg(format!("API request error: {e}")))
    }
}

#[async_trait::async_trait]
impl DirectionsSource for GoogleMaps {
    async fn directions(&self, origin: Coordinate, destination: &str) -> Result<Value, SourceError> {
        let key = self.key()?;
        debug!(destination, "requesting directions");
        let query = [
            ("origin", format!("{},{}", origin.lat, origin.lng)),
            ("destination", destination.to_string()),
            ("key", key.to_string()),
            ("mode", self.cfg.travel_mode.clone()),
        ];
        self.get_json(&self.cfg.directions_url, &query).await
    }
}

#[async_trait::async_trait]
impl Geolocator for GoogleMaps {
    async fn reverse(&self, at: Coordinate) -> Result<Option<String>, SourceError> {
        let key = self.key()?;
        let query = [
            ("latlng", format!("{},{}", at.lat, at.lng)),
            ("key", key.to_string()),
            ("language", self.cfg.language.clone()),
        ];
        let body = self.get_json(&self.cfg.geocode_url, &query).await?;
        Ok(parse_reverse(&body))
    }

    async fn locate_by_network(&self) -> Result<Option<(Coordinate, String)>, SourceError> {
        let body = self.get_json(&self.cfg.ip_lookup_url, &[]).await?;
        Ok(parse_ip_location(&body))
    }
}

/// First formatted address of an OK geocoding answer.
fn parse_reverse(body: &Value) -> Option<String> {
    if body.get("status").and_then(Value::as_str) != Some("OK") {
        return None;
    }
    body.get("results")?
        .as_array()?
        .first()?
        .get("formatted_address")?
        .as_str()
        .map(str::to_string)
}

fn parse_ip_location(body: &Value) -> Option<(Coordinate, String)> {
    let loc = body.get("loc")?.as_str()?;
    let (lat, lng) = loc.split_once(',')?;
    let at = Coordinate::new(lat.trim().parse().ok()?, lng.trim().parse().ok()?);

    let address = ["city", "region", "country"]
        .iter()
        .filter_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ");
    Some((at, address))
}
