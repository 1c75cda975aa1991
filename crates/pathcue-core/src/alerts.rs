//! Obstacle proximity policy: range estimation, near/far classification and
//! per-class alert throttling.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use model::{AnnotatedDetection, Detection, FrameStatus};

use crate::config::ObstacleConfig;

/// Pinhole range estimate from an object's apparent width.
pub fn estimate_range(known_width_m: f64, focal_length_px: f64, pixel_width: i32) -> f64 {
    (known_width_m * focal_length_px) / f64::from(pixel_width.max(1))
}

/// Last alert instant per class label.
#[derive(Debug)]
pub struct AlertThrottle {
    cooldown: Duration,
    last: HashMap<String, Instant>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown, last: HashMap::new() }
    }

    /// True when an alert for `label` may go out at `now`; records it if so.
    pub fn permit(&mut self, label: &str, now: Instant) -> bool {
        let allowed = match self.last.get(label) {
            None => true,
            Some(prev) => now.saturating_duration_since(*prev) > self.cooldown,
        };
        if allowed {
            self.last.insert(label.to_string(), now);
        }
        allowed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameAssessment {
    pub obstacles: Vec<AnnotatedDetection>,
    pub status: FrameStatus,
    /// Alert texts that survived throttling, in detection order.
    pub alerts: Vec<String>,
}

pub struct ObstaclePolicy {
    cfg: ObstacleConfig,
    throttle: AlertThrottle,
}

impl ObstaclePolicy {
    pub fn new(cfg: ObstacleConfig) -> Self {
        let throttle = AlertThrottle::new(cfg.alert_cooldown());
        Self { cfg, throttle }
    }

    pub fn assess(&mut self, detections: &[Detection], now: Instant) -> FrameAssessment {
        let mut obstacles = Vec::with_capacity(detections.len());
        let mut alerts = Vec::new();
        let mut any_near = false;

        for det in detections {
            let distance = estimate_range(self.cfg.known_width_m, self.cfg.focal_length_px, det.bbox.pixel_width());
            let is_near = distance < self.cfg.alert_distance_m;
            if is_near {
                any_near = true;
                if self.throttle.permit(&det.class_label, now) {
                    alerts.push(format!("Warning: {} detected {:.1} meters ahead.", det.class_label, distance));
                }
            }
            obstacles.push(AnnotatedDetection {
                bbox: det.bbox.as_array(),
                class_label: det.class_label.clone(),
                label: format!("{}: {:.1}m", det.class_label, distance),
                distance_m: distance,
                is_near,
            });
        }

        FrameAssessment {
            obstacles,
            status: if any_near { FrameStatus::ObstacleNear } else { FrameStatus::Scanning },
            alerts,
        }
    }
}
