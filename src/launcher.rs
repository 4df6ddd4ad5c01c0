//! Fight launcher: hands a task and its gathered context to the arena server
//! and looks up the winning output once the fight is judged.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::LauncherSettings;

/// Server-assigned fight identifier.
pub type FightId = String;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("fight server unreachable at {url}: {detail}")]
    Unreachable { url: String, detail: String },

    #[error("fight server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid fight server response: {0}")]
    InvalidResponse(String),
}

/// Winning output of a judged fight.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub task: String,
    pub output: String,
}

pub trait FightLauncher: Send + Sync {
    fn launch(&self, task: &str, context: Option<&str>) -> Result<FightId, LaunchError>;

    /// The winner of `fight_id`, or `None` while the fight is still running.
    fn winner(&self, fight_id: &str) -> Result<Option<Solution>, LaunchError>;
}

#[derive(Debug, Serialize)]
struct FightRequest<'a> {
    task: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct FightResponse {
    #[serde(rename = "fightId")]
    fight_id: FightId,
}

#[derive(Debug, Deserialize)]
struct FighterOutput {
    output: String,
}

/// One judged fight as listed by `/api/history`.
#[derive(Debug, Deserialize)]
struct FightRecord {
    id: FightId,
    task: String,
    winner: u8,
    fighter1: FighterOutput,
    fighter2: FighterOutput,
}

impl FightRecord {
    fn into_solution(self) -> Solution {
        let output = if self.winner == 2 {
            self.fighter2.output
        } else {
            self.fighter1.output
        };
        Solution {
            task: self.task,
            output,
        }
    }
}

/// POSTs fights to `<server_url>/api/fight` and reads verdicts from
/// `<server_url>/api/history`.
pub struct HttpLauncher {
    endpoint: String,
    history_endpoint: String,
    agent: ureq::Agent,
}

impl HttpLauncher {
    pub fn new(server_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            endpoint: fight_endpoint(server_url),
            history_endpoint: history_endpoint(server_url),
            agent,
        }
    }

    pub fn from_settings(settings: &LauncherSettings) -> Self {
        Self::new(
            &settings.server_url,
            Duration::from_secs(settings.timeout_secs),
        )
    }
}

impl FightLauncher for HttpLauncher {
    fn launch(&self, task: &str, context: Option<&str>) -> Result<FightId, LaunchError> {
        debug!(
            endpoint = %self.endpoint,
            context_chars = context.map_or(0, |c| c.chars().count()),
            "posting fight"
        );
        let response = self
            .agent
            .post(&self.endpoint)
            .send_json(FightRequest { task, context })
            .map_err(|e| request_error(&self.endpoint, e))?;

        let body: FightResponse = response
            .into_json()
            .map_err(|e| LaunchError::InvalidResponse(e.to_string()))?;
        info!(fight_id = %body.fight_id, task = %task, "fight started");
        Ok(body.fight_id)
    }

    fn winner(&self, fight_id: &str) -> Result<Option<Solution>, LaunchError> {
        debug!(endpoint = %self.history_endpoint, fight_id, "looking up fight verdict");
        let records: Vec<FightRecord> = self
            .agent
            .get(&self.history_endpoint)
            .call()
            .map_err(|e| request_error(&self.history_endpoint, e))?
            .into_json()
            .map_err(|e| LaunchError::InvalidResponse(e.to_string()))?;
        Ok(records
            .into_iter()
            .find(|r| r.id == fight_id)
            .map(FightRecord::into_solution))
    }
}

fn request_error(url: &str, e: ureq::Error) -> LaunchError {
    match e {
        ureq::Error::Status(status, response) => LaunchError::Status {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => LaunchError::Unreachable {
            url: url.to_string(),
            detail: transport.to_string(),
        },
    }
}

fn fight_endpoint(server_url: &str) -> String {
    format!("{}/api/fight", server_url.trim_end_matches('/'))
}

fn history_endpoint(server_url: &str) -> String {
    format!("{}/api/history", server_url.trim_end_matches('/'))
}
