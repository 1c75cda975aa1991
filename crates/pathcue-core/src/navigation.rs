//! Turn-by-turn guidance for one session.
//!
//! ```text
//! AwaitingPosition -> RouteRequested -> Guiding -> Arrived
//!        |                  |              |
//!        +------------------+--------------+--> Failed(reason) / Cancelled
//! ```
//!
//! Steps are walked strictly in order: the cursor only moves when the
//! tracked position is strictly inside the proximity radius of the current
//! step's end waypoint, and never skips ahead.

use std::fmt;
use std::sync::Arc;

use model::{Outbound, Route};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NavigationConfig;
use crate::route::{parse_directions, RouteError};
use crate::session::Session;
use crate::speech::strip_markup;
use crate::{DirectionsSource, Envelope, EventTx};

#[derive(Debug, Clone, PartialEq)]
pub enum FailReason {
    NoLocation,
    /// Directions provider error or non-OK status, verbatim.
    Upstream(String),
    Malformed(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::NoLocation => f.write_str("no current location"),
            FailReason::Upstream(r) => f.write_str(r),
            FailReason::Malformed(r) => write!(f, "malformed route: {r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavState {
    AwaitingPosition,
    RouteRequested,
    Guiding,
    Arrived,
    Cancelled,
    Failed(FailReason),
}

impl NavState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NavState::Arrived | NavState::Cancelled | NavState::Failed(_))
    }
}

/// Cursor over route steps. `0 <= current <= total`, moves by one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NavProgress {
    current: usize,
    total: usize,
}

impl NavProgress {
    pub fn new(total: usize) -> Self {
        Self { current: 0, total }
    }

    pub fn current_step_index(&self) -> usize {
        self.current
    }

    pub fn is_complete(&self) -> bool {
        self.current >= self.total
    }

    /// Feed the distance to the current waypoint; advances when it is
    /// strictly below `threshold_m`. Returns whether the cursor moved.
    pub fn observe(&mut self, distance_m: f64, threshold_m: f64) -> bool {
        if self.is_complete() || !(distance_m < threshold_m) {
            return false;
        }
        self.current += 1;
        true
    }
}

pub struct Navigation {
    session: Arc<Session>,
    directions: Arc<dyn DirectionsSource>,
    tx: EventTx,
    cfg: NavigationConfig,
    cancel: CancellationToken,
    state: NavState,
}

impl Navigation {
    pub fn new(
        session: Arc<Session>,
        directions: Arc<dyn DirectionsSource>,
        tx: EventTx,
        cfg: NavigationConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self { session, directions, tx, cfg, cancel, state: NavState::AwaitingPosition }
    }

    pub fn state(&self) -> &NavState {
        &self.state
    }

    /// Drive the machine to a terminal state.
    pub async fn run(mut self, destination: &str) -> NavState {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        info!(session = %self.session.id(), destination, "navigation requested");
        self.say(Outbound::NavUpdate { message: "Starting navigation process.".into(), spoken: String::new() });

        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        let Some(start) = self.session.position() else {
            return self.fail(FailReason::NoLocation, "Could not get your current location to start navigation.".into());
        };

        self.transition(NavState::RouteRequested);
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        let payload = self.directions.directions(start, destination).await;
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }

        let route = match payload.map_err(|e| RouteError::Status(e.to_string())).and_then(|p| parse_directions(&p)) {
            Ok(route) => route,
            Err(RouteError::Malformed(reason)) => {
                let message = format!("Error parsing the route directions: {reason}");
                return self.fail(FailReason::Malformed(reason), message);
            }
            Err(other) => {
                let reason = other.to_string();
                let message = format!("Could not find a route. Reason: {reason}");
                return self.fail(FailReason::Upstream(reason), message);
            }
        };

        self.say(Outbound::NavUpdate { message: "Route found! Starting guidance.".into(), spoken: String::new() });
        self.emit(Outbound::NavRouteData { polyline: route.overview_polyline.clone() });
        self.say(Outbound::NavRouteSummary {
            message: format!("Route to {}. Total distance: {}.", route.summary, route.total_distance_text),
            spoken: String::new(),
        });

        self.transition(NavState::Guiding);
        self.guide(&route).await;

        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        info!(session = %self.session.id(), "arrived");
        self.say(Outbound::NavComplete { message: "You have arrived at your destination.".into(), spoken: String::new() });
        self.transition(NavState::Arrived);
        self.state
    }

    async fn guide(&mut self, route: &Route) {
        let threshold = self.cfg.waypoint_proximity_m;
        let mut progress = NavProgress::new(route.steps.len());

        while !self.cancel.is_cancelled() && !progress.is_complete() {
            let index = progress.current_step_index();
            let step = &route.steps[index];
            self.emit(Outbound::NavStep {
                index,
                message: format!("Step {}: {} ({})", index + 1, step.instruction_html, step.distance_text),
                spoken: format!("In {}, {}", step.distance_text, step.instruction_spoken),
            });

            while !self.cancel.is_cancelled() {
                let Some(here) = self.session.position() else {
                    tokio::time::sleep(self.cfg.missing_fix_retry()).await;
                    continue;
                };

                let meters = geodesy::distance(here, step.end_waypoint);
                self.emit(Outbound::NavDistanceUpdate { meters, message: format!("{meters:.0}m to next turn") });

                if progress.observe(meters, threshold) {
                    debug!(session = %self.session.id(), step = index, "waypoint reached");
                    break;
                }
                tokio::time::sleep(self.cfg.poll_interval()).await;
            }
        }
    }

    fn fail(&mut self, reason: FailReason, message: String) -> NavState {
        warn!(session = %self.session.id(), %reason, "navigation failed");
        self.say(Outbound::NavError { message, spoken: String::new() });
        self.transition(NavState::Failed(reason));
        self.state.clone()
    }

    fn cancelled(&mut self) -> NavState {
        info!(session = %self.session.id(), "navigation cancelled");
        self.transition(NavState::Cancelled);
        NavState::Cancelled
    }

    fn transition(&mut self, next: NavState) {
        debug!(session = %self.session.id(), from = ?self.state, to = ?next, "navigation state");
        self.state = next;
    }

    /// Emit an event whose spoken form is derived from its display text.
    fn say(&self, mut event: Outbound) {
        match &mut event {
            Outbound::NavUpdate { message, spoken }
            | Outbound::NavRouteSummary { message, spoken }
            | Outbound::NavComplete { message, spoken }
            | Outbound::NavError { message, spoken } => *spoken = strip_markup(message),
            _ => {}
        }
        self.emit(event);
    }

    fn emit(&self, event: Outbound) {
        let _ = self.tx.send(Envelope::new(self.session.id().clone(), event));
    }
}
