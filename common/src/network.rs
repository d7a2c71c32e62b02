use std::net::Ipv4Addr;

use thiserror::Error;

use crate::types::NetworkCredentials;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("access point `{ssid}` failed to start: {details}")]
    AccessPoint { ssid: String, details: String },
    #[error("association with `{ssid}` failed: {details}")]
    Association { ssid: String, details: String },
    /// The previous association request for `ssid` has not finished yet.
    #[error("association with `{ssid}` already in progress")]
    InProgress { ssid: String },
}

/// Radio/network-stack collaborator. Every call returns without waiting for
/// the link to come up; the provisioning machine polls `is_up`.
pub trait NetworkLink {
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError>;
    /// Re-requesting while an attempt is still running returns
    /// [`LinkError::InProgress`].
    fn associate(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError>;
    fn is_up(&mut self) -> bool;
    fn ip_address(&self) -> Option<Ipv4Addr>;
}
