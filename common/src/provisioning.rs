use crate::{
    config::{ProvisioningConfig, TimingConfig},
    types::{NetworkCredentials, ProvisioningState},
};

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningAction {
    /// Bring up the open configuration network.
    StartAccessPoint { ssid: String },
    StartPortal,
    /// Request (or re-request) station association.
    Associate(NetworkCredentials),
    PersistCredentials(NetworkCredentials),
    Restart,
}

/// Access-point / station state machine.
///
/// Driven from the main tick loop: `boot` once, then `poll` every iteration.
/// Station association is retried forever at a fixed interval; there is no
/// attempt ceiling and no fallback to the portal, so a stale pair keeps the
/// device in `Connecting` until it is reset.
#[derive(Debug, Clone)]
pub struct ProvisioningMachine {
    ap_ssid: String,
    retry_interval_ms: u64,
    restart_ack_delay_ms: u64,

    state: ProvisioningState,
    credentials: Option<NetworkCredentials>,
    connect_attempts: u32,
    last_attempt_ms: Option<u64>,
    connected_at_ms: Option<u64>,

    restart_at_ms: Option<u64>,
    restart_issued: bool,
}

impl ProvisioningMachine {
    pub fn new(provisioning: &ProvisioningConfig, timing: &TimingConfig) -> Self {
        Self {
            ap_ssid: provisioning.ap_ssid.clone(),
            retry_interval_ms: timing.connect_retry_interval_ms,
            restart_ack_delay_ms: timing.restart_ack_delay_ms,
            state: ProvisioningState::Unconfigured,
            credentials: None,
            connect_attempts: 0,
            last_attempt_ms: None,
            connected_at_ms: None,
            restart_at_ms: None,
            restart_issued: false,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub fn credentials(&self) -> Option<&NetworkCredentials> {
        self.credentials.as_ref()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts
    }

    pub fn connected_at_ms(&self) -> Option<u64> {
        self.connected_at_ms
    }

    pub fn restart_pending(&self) -> bool {
        self.restart_at_ms.is_some()
    }

    pub fn boot(
        &mut self,
        stored: Option<NetworkCredentials>,
        now_ms: u64,
    ) -> Vec<ProvisioningAction> {
        if self.state != ProvisioningState::Unconfigured {
            return Vec::new();
        }

        match stored.filter(NetworkCredentials::is_complete) {
            None => {
                self.state = ProvisioningState::AccessPointActive;
                vec![
                    ProvisioningAction::StartAccessPoint {
                        ssid: self.ap_ssid.clone(),
                    },
                    ProvisioningAction::StartPortal,
                ]
            }
            Some(credentials) => {
                self.state = ProvisioningState::Connecting;
                self.credentials = Some(credentials);
                let mut actions = Vec::new();
                self.attempt_association(now_ms, &mut actions);
                actions
            }
        }
    }

    pub fn poll(&mut self, now_ms: u64, link_up: bool) -> Vec<ProvisioningAction> {
        let mut actions = Vec::new();

        match self.state {
            ProvisioningState::Connecting => {
                if link_up {
                    self.state = ProvisioningState::Connected;
                    self.connected_at_ms = Some(now_ms);
                } else if self.retry_due(now_ms) {
                    self.attempt_association(now_ms, &mut actions);
                }
            }
            ProvisioningState::AccessPointActive => {
                if let Some(restart_at) = self.restart_at_ms {
                    if !self.restart_issued && now_ms >= restart_at {
                        self.restart_issued = true;
                        actions.push(ProvisioningAction::Restart);
                    }
                }
            }
            ProvisioningState::Unconfigured
            | ProvisioningState::Connected
            | ProvisioningState::ConnectionFailed => {}
        }

        actions
    }

    /// Accepts a portal submission as-is. Blank fields are persisted too; the
    /// next boot's absence check routes the device back to the portal.
    pub fn submit(
        &mut self,
        credentials: NetworkCredentials,
        now_ms: u64,
    ) -> Vec<ProvisioningAction> {
        if self.state != ProvisioningState::AccessPointActive || self.restart_pending() {
            return Vec::new();
        }

        self.restart_at_ms = Some(now_ms.saturating_add(self.restart_ack_delay_ms));
        vec![ProvisioningAction::PersistCredentials(credentials)]
    }

    fn retry_due(&self, now_ms: u64) -> bool {
        match self.last_attempt_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.retry_interval_ms,
            None => true,
        }
    }

    fn attempt_association(&mut self, now_ms: u64, actions: &mut Vec<ProvisioningAction>) {
        let Some(credentials) = self.credentials.clone() else {
            return;
        };
        self.connect_attempts = self.connect_attempts.saturating_add(1);
        self.last_attempt_ms = Some(now_ms);
        actions.push(ProvisioningAction::Associate(credentials));
    }
}
