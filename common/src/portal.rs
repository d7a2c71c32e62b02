//! Configuration portal served while the device runs its own access point.
//!
//! HTTP parsing belongs to the transport; this module only routes already
//! parsed requests and builds responses.

use thiserror::Error;

use crate::types::NetworkCredentials;

pub const PORTAL_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><title>WiFi Configuration</title></head>
<body>
  <h1>WiFi Configuration</h1>
  <form action="/connect" method="POST">
    <label for="ssid">SSID:</label><br>
    <input type="text" id="ssid" name="ssid"><br><br>
    <label for="password">Password:</label><br>
    <input type="password" id="password" name="password"><br><br>
    <input type="submit" value="Connect">
  </form>
</body>
</html>
"#;

pub const RESTART_ACK_HTML: &str = "<h1>WiFi configured. Restarting...</h1>";

const CONTENT_TYPE_HTML: &str = "text/html";
const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("malformed form body: {0}")]
    MalformedForm(String),
    #[error("portal failed to start: {0}")]
    StartFailed(String),
    #[error("portal client for request {0} is gone")]
    ClientGone(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalMethod {
    Get,
    Post,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalRequest {
    pub id: u64,
    pub method: PortalMethod,
    pub path: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl PortalResponse {
    pub fn html(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_TYPE_HTML,
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: CONTENT_TYPE_TEXT,
            body: "Not found".to_string(),
        }
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            content_type: CONTENT_TYPE_TEXT,
            body: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: 400,
            content_type: CONTENT_TYPE_TEXT,
            body: message.into(),
        }
    }
}

/// Hands requests received by the HTTP collaborator to the control loop.
pub trait PortalTransport {
    /// Begins accepting requests. Called once, when the access point is up.
    fn start(&mut self) -> Result<(), PortalError>;

    /// Drains every request that arrived since the previous call.
    fn pending(&mut self) -> Vec<PortalRequest>;

    fn respond(&mut self, request_id: u64, response: PortalResponse) -> Result<(), PortalError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PortalRoute {
    Form,
    Connect(NetworkCredentials),
    NotFound,
}

pub fn route(request: &PortalRequest) -> Result<PortalRoute, PortalError> {
    let path = request
        .path
        .split_once('?')
        .map_or(request.path.as_str(), |(path, _)| path);

    match (request.method, path) {
        (PortalMethod::Get, "/") => Ok(PortalRoute::Form),
        (PortalMethod::Post, "/connect") => {
            decode_connect_form(&request.body).map(PortalRoute::Connect)
        }
        _ => Ok(PortalRoute::NotFound),
    }
}

/// Missing fields decode as empty text. A repeated field keeps its first
/// value; unknown fields are ignored.
pub fn decode_connect_form(body: &[u8]) -> Result<NetworkCredentials, PortalError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body)
        .map_err(|err| PortalError::MalformedForm(err.to_string()))?;

    let first = |field: &str| {
        pairs
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    };

    Ok(NetworkCredentials {
        ssid: first("ssid"),
        password: first("password"),
    })
}
