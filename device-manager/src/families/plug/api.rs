use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status document served at a plug's location URL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlugStatus {
    pub mac: String,
    pub name: String,
    /// True when the relay is closed (load powered)
    pub relay: bool,
    pub watts: f64,
}

#[derive(Debug, Serialize)]
struct RelayRequest {
    closed: bool,
}

/// Plug request failures, split the way command results need them.
#[derive(Debug)]
pub enum PlugError {
    /// Connect, timeout or other transport failure
    Transport(reqwest::Error),
    /// The plug answered with a non-2xx status
    Status(StatusCode),
    /// The plug answered with something that is not a status document
    Decode(reqwest::Error),
}

impl fmt::Display for PlugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlugError::Transport(e) => write!(f, "plug unreachable: {}", e),
            PlugError::Status(status) => write!(f, "plug returned {}", status),
            PlugError::Decode(e) => write!(f, "invalid plug response: {}", e),
        }
    }
}

impl std::error::Error for PlugError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlugError::Transport(e) | PlugError::Decode(e) => Some(e),
            PlugError::Status(_) => None,
        }
    }
}

/// HTTP client for one plug.
///
/// `GET {location}` returns the status; `POST {location}/relay` with
/// `{"closed": bool}` switches the relay and returns the new status.
#[derive(Clone)]
pub struct PlugClient {
    http_client: Client,
    location: String,
}

impl PlugClient {
    pub fn new(location: impl Into<String>, timeout: Duration) -> Result<Self, PlugError> {
        let http_client = Client::builder()
            .user_agent("devgate/0.1")
            .timeout(timeout)
            .build()
            .map_err(PlugError::Transport)?;
        Ok(Self {
            http_client,
            location: location.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub async fn status(&self) -> Result<PlugStatus, PlugError> {
        let response = self
            .http_client
            .get(&self.location)
            .send()
            .await
            .map_err(PlugError::Transport)?;
        read_status(response).await
    }

    pub async fn set_relay(&self, closed: bool) -> Result<PlugStatus, PlugError> {
        let url = format!("{}/relay", self.location);
        let response = self
            .http_client
            .post(&url)
            .json(&RelayRequest { closed })
            .send()
            .await
            .map_err(PlugError::Transport)?;
        read_status(response).await
    }
}

async fn read_status(response: reqwest::Response) -> Result<PlugStatus, PlugError> {
    let status = response.status();
    if !status.is_success() {
        return Err(PlugError::Status(status));
    }
    response.json::<PlugStatus>().await.map_err(PlugError::Decode)
}
