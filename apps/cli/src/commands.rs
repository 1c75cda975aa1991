use std::time::Duration;

use anyhow::Result;
use model::{Inbound, SessionId};
use pathcue_core::Engine;
use iox::TraceFix;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// One line of an input script.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ScriptLine {
    Pause {
        pause_ms: u64,
    },
    Request {
        #[serde(default)]
        session: Option<String>,
        #[serde(flatten)]
        request: Inbound,
    },
}

/// `None` for blank lines and `#` comments.
pub fn parse_line(line: &str) -> Result<Option<ScriptLine>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

pub struct Script {
    engine: Engine,
    current: Option<SessionId>,
    trace: Option<Vec<TraceFix>>,
    trace_session: Option<SessionId>,
    replays: Vec<JoinHandle<()>>,
}

impl Script {
    pub fn new(engine: Engine, trace: Option<Vec<TraceFix>>, trace_session: Option<SessionId>) -> Self {
        Self { engine, current: None, trace, trace_session, replays: Vec::new() }
    }

    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, rdr: R) -> Result<()> {
        let mut lines = rdr.lines();
        let mut n = 0usize;
        while let Some(line) = lines.next_line().await? {
            n += 1;
            match parse_line(&line) {
                Ok(Some(cmd)) => self.execute(cmd).await,
                Ok(None) => {}
                Err(e) => warn!(line = n, error = %e, "skipping unreadable request"),
            }
        }
        info!(lines = n, "input exhausted");
        Ok(())
    }

    async fn execute(&mut self, cmd: ScriptLine) {
        match cmd {
            ScriptLine::Pause { pause_ms } => tokio::time::sleep(Duration::from_millis(pause_ms)).await,
            ScriptLine::Request { session, request } => {
                let id = match (session, &request) {
                    (Some(s), _) => SessionId::from(s),
                    (None, Inbound::Connect) => SessionId::from(Uuid::new_v4().simple().to_string()),
                    (None, _) => match &self.current {
                        Some(id) => id.clone(),
                        None => {
                            warn!(?request, "no session to address, connect first");
                            return;
                        }
                    },
                };
                let connecting = request == Inbound::Connect;
                self.engine.handle(id.clone(), request).await;
                if connecting {
                    self.current = Some(id.clone());
                    self.start_trace(&id);
                }
            }
        }
    }

    /// Replay the position trace into `id` if it is the trace's target.
    fn start_trace(&mut self, id: &SessionId) {
        if self.trace_session.as_ref().is_some_and(|t| t != id) {
            return;
        }
        let Some(fixes) = self.trace.take() else { return };
        info!(session = %id, fixes = fixes.len(), "replaying position trace");

        let engine = self.engine.clone();
        let id = id.clone();
        self.replays.push(tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for fix in fixes {
                tokio::time::sleep_until(start + Duration::from_millis(fix.t_ms)).await;
                if engine.sessions().get(&id).is_none() {
                    break;
                }
                engine.update_position(&id, fix.coordinate());
            }
        }));
    }

    pub fn current(&self) -> Option<&SessionId> {
        self.current.as_ref()
    }

    pub fn abort_replays(&mut self) {
        for r in self.replays.drain(..) {
            r.abort();
        }
    }
}
