use thiserror::Error;

use crate::{
    address_space::{AddressSpace, DataServer, ServerError},
    config::NodeConfig,
    credentials::{CredentialStore, KeyValueStore, StoreError},
    network::{LinkError, NetworkLink},
    portal::{self, PortalError, PortalResponse, PortalRoute, PortalTransport, RESTART_ACK_HTML},
    provisioning::{ProvisioningAction, ProvisioningMachine},
    sensing::{AnalogInput, MotionSensor, SensorSuite},
    sync::{Cadence, SyncEngine, TickReport},
    types::ProvisioningState,
};

/// Concrete collaborators for one build flavor.
pub trait Platform {
    type Store: KeyValueStore;
    type Analog: AnalogInput;
    type Motion: MotionSensor;
    type Server: DataServer;
    type Portal: PortalTransport;
    type Link: NetworkLink;
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Portal(#[from] PortalError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

#[derive(Debug)]
pub struct StepReport {
    pub state: ProvisioningState,
    pub previous_state: ProvisioningState,
    /// Association requests issued during this step.
    pub associations: u32,
    pub restart_requested: bool,
    pub tick: Option<TickReport>,
    pub errors: Vec<DeviceError>,
}

impl StepReport {
    fn new(state: ProvisioningState) -> Self {
        Self {
            state,
            previous_state: state,
            associations: 0,
            restart_requested: false,
            tick: None,
            errors: Vec::new(),
        }
    }

    pub fn transitioned(&self) -> bool {
        self.state != self.previous_state
    }
}

pub struct DevicePeripherals<P: Platform> {
    pub store: P::Store,
    pub sensors: SensorSuite<P::Analog, P::Motion>,
    pub server: P::Server,
    pub portal: P::Portal,
    pub link: P::Link,
}

/// Everything the control loop touches, owned in one place and driven from a
/// single thread.
pub struct DeviceContext<P: Platform> {
    config: NodeConfig,
    credentials: CredentialStore<P::Store>,
    provisioning: ProvisioningMachine,
    sensors: SensorSuite<P::Analog, P::Motion>,
    address_space: AddressSpace,
    server: P::Server,
    portal: P::Portal,
    link: P::Link,
    sync: SyncEngine,
    cadence: Cadence,
}

impl<P: Platform> DeviceContext<P> {
    pub fn new(config: NodeConfig, peripherals: DevicePeripherals<P>) -> Self {
        let provisioning = ProvisioningMachine::new(&config.provisioning, &config.timing);
        let address_space = AddressSpace::populate(config.server.namespace_index);
        let sync = SyncEngine::new(&address_space);
        let cadence = Cadence::new(config.timing.tick_interval_ms);

        Self {
            config,
            credentials: CredentialStore::new(peripherals.store),
            provisioning,
            sensors: peripherals.sensors,
            address_space,
            server: peripherals.server,
            portal: peripherals.portal,
            link: peripherals.link,
            sync,
            cadence,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> ProvisioningState {
        self.provisioning.state()
    }

    pub fn provisioning(&self) -> &ProvisioningMachine {
        &self.provisioning
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.address_space
    }

    pub fn credentials(&self) -> &CredentialStore<P::Store> {
        &self.credentials
    }

    pub fn server(&self) -> &P::Server {
        &self.server
    }

    pub fn link(&self) -> &P::Link {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut P::Link {
        &mut self.link
    }

    pub fn portal_mut(&mut self) -> &mut P::Portal {
        &mut self.portal
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Reads stored credentials once and enters AP or station mode. An
    /// unreadable store counts as empty.
    pub fn boot(&mut self, now_ms: u64) -> StepReport {
        let mut report = StepReport::new(self.provisioning.state());

        let stored = match self.credentials.load() {
            Ok(stored) => stored,
            Err(err) => {
                report.errors.push(err.into());
                None
            }
        };

        let actions = self.provisioning.boot(stored, now_ms);
        self.execute(actions, &mut report);
        report.state = self.provisioning.state();
        report
    }

    /// Registers the telemetry variables with the data server.
    pub fn start_server(&mut self) -> Result<(), ServerError> {
        self.address_space.register(&mut self.server)
    }

    /// One control-loop iteration: connectivity poll, telemetry tick, and
    /// portal servicing while the access point is up.
    pub fn step(&mut self, now_ms: u64) -> StepReport {
        let mut report = StepReport::new(self.provisioning.state());

        let link_up = match self.provisioning.state() {
            ProvisioningState::Connecting => self.link.is_up(),
            _ => false,
        };
        let actions = self.provisioning.poll(now_ms, link_up);
        self.execute(actions, &mut report);

        let mut tick = self
            .sync
            .tick(&mut self.sensors, &mut self.address_space, &mut self.server);

        if self.provisioning.state().serves_portal() {
            tick.portal_requests = self.service_portal(now_ms, &mut report);
        }

        report.tick = Some(tick);
        report.state = self.provisioning.state();
        report
    }

    fn service_portal(&mut self, now_ms: u64, report: &mut StepReport) -> usize {
        let requests = self.portal.pending();
        let count = requests.len();

        for request in requests {
            let response = match portal::route(&request) {
                Ok(PortalRoute::Form) => PortalResponse::html(portal::PORTAL_HTML),
                Ok(PortalRoute::Connect(credentials)) => {
                    let actions = self.provisioning.submit(credentials, now_ms);
                    let failures = report.errors.len();
                    self.execute(actions, report);
                    if report.errors.len() > failures {
                        PortalResponse::server_error("Failed to store credentials")
                    } else {
                        PortalResponse::html(RESTART_ACK_HTML)
                    }
                }
                Ok(PortalRoute::NotFound) => PortalResponse::not_found(),
                Err(err) => {
                    let response = PortalResponse::bad_request(err.to_string());
                    report.errors.push(err.into());
                    response
                }
            };

            if let Err(err) = self.portal.respond(request.id, response) {
                report.errors.push(err.into());
            }
        }

        count
    }

    fn execute(&mut self, actions: Vec<ProvisioningAction>, report: &mut StepReport) {
        for action in actions {
            let result: Result<(), DeviceError> = match action {
                ProvisioningAction::StartAccessPoint { ssid } => self
                    .link
                    .start_access_point(&ssid)
                    .map_err(DeviceError::from),
                ProvisioningAction::StartPortal => self.portal.start().map_err(DeviceError::from),
                ProvisioningAction::Associate(credentials) => {
                    report.associations += 1;
                    match self.link.associate(&credentials) {
                        Err(LinkError::InProgress { .. }) => Ok(()),
                        result => result.map_err(DeviceError::from),
                    }
                }
                ProvisioningAction::PersistCredentials(credentials) => self
                    .credentials
                    .save(&credentials)
                    .map_err(DeviceError::from),
                ProvisioningAction::Restart => {
                    report.restart_requested = true;
                    Ok(())
                }
            };

            if let Err(err) = result {
                report.errors.push(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::CREDENTIALS_SSID_KEY,
        credentials::MemoryKvStore,
        portal::{PortalMethod, PortalRequest},
        testing::{device, device_with_store, TestPlatform},
        types::NetworkCredentials,
    };
    use pretty_assertions::assert_eq;

    fn get(id: u64, path: &str) -> PortalRequest {
        PortalRequest {
            id,
            method: PortalMethod::Get,
            path: path.to_string(),
            body: Vec::new(),
        }
    }

    fn post(id: u64, path: &str, body: &str) -> PortalRequest {
        PortalRequest {
            id,
            method: PortalMethod::Post,
            path: path.to_string(),
            body: body.as_bytes().to_vec(),
        }
    }

    fn stored(ssid: &str, password: &str) -> MemoryKvStore {
        let mut store = CredentialStore::new(MemoryKvStore::new());
        store
            .save(&NetworkCredentials::new(ssid, password))
            .unwrap();
        store.backend().clone()
    }

    #[test]
    fn empty_store_boots_into_portal_and_never_associates() {
        let mut ctx = device();
        let report = ctx.boot(0);

        assert_eq!(report.state, ProvisioningState::AccessPointActive);
        assert_eq!(ctx.link().access_points, vec!["ESP32_Config".to_string()]);
        assert!(ctx.portal_mut().started);

        for now in (1_000..30_000).step_by(1_000) {
            ctx.step(now);
        }
        assert!(ctx.link().associations.is_empty());
    }

    #[test]
    fn stored_credentials_associate_and_never_serve_portal() {
        let mut ctx = device_with_store(stored("home", "secret"));
        ctx.portal_mut().push(get(1, "/"));

        let report = ctx.boot(0);
        assert_eq!(report.state, ProvisioningState::Connecting);
        assert_eq!(report.associations, 1);

        for now in (1_000..5_000).step_by(1_000) {
            let report = ctx.step(now);
            assert_eq!(report.tick.unwrap().portal_requests, 0);
        }

        assert!(!ctx.portal_mut().started);
        assert!(ctx.portal_mut().responses.is_empty());
        assert!(ctx.link().access_points.is_empty());
        assert_eq!(
            ctx.link().associations,
            vec![NetworkCredentials::new("home", "secret"); 5]
        );
    }

    #[test]
    fn link_up_moves_to_connected_and_stops_retrying() {
        let mut ctx = device_with_store(stored("home", "secret"));
        ctx.boot(0);
        ctx.link_mut().up_after_polls = Some(2);

        let first = ctx.step(1_000);
        assert_eq!(first.state, ProvisioningState::Connecting);

        let second = ctx.step(2_000);
        assert!(second.transitioned());
        assert_eq!(second.state, ProvisioningState::Connected);
        assert_eq!(second.associations, 0);

        ctx.step(3_000);
        assert_eq!(ctx.link().associations.len(), 2);
    }

    #[test]
    fn retry_during_pending_association_is_not_an_error() {
        let mut ctx = device_with_store(stored("home", "secret"));
        ctx.boot(0);
        ctx.link_mut().busy = true;

        for now in (1_000..=5_000).step_by(1_000) {
            let report = ctx.step(now);
            assert_eq!(report.associations, 1);
            assert!(report.errors.is_empty());
        }
        assert_eq!(ctx.state(), ProvisioningState::Connecting);
    }

    #[test]
    fn failed_association_is_reported() {
        let mut ctx = device_with_store(stored("home", "secret"));
        ctx.boot(0);
        ctx.link_mut().refuse = true;

        let report = ctx.step(1_000);
        assert!(matches!(
            report.errors.as_slice(),
            [DeviceError::Link(LinkError::Association { .. })]
        ));
    }

    #[test]
    fn telemetry_runs_while_connecting() {
        let mut ctx = device_with_store(stored("home", "secret"));
        ctx.boot(0);

        for now in (1_000..=10_000).step_by(1_000) {
            let report = ctx.step(now);
            assert_eq!(report.tick.unwrap().points_written, 4);
        }
        assert_eq!(ctx.server().writes.len(), 40);
    }

    #[test]
    fn connect_submission_stores_credentials_and_schedules_restart() {
        let mut ctx = device();
        ctx.boot(0);
        ctx.portal_mut()
            .push(post(7, "/connect", "ssid=home&password=secret"));

        let report = ctx.step(1_000);
        assert_eq!(report.tick.unwrap().portal_requests, 1);
        assert!(!report.restart_requested);
        assert_eq!(
            ctx.credentials().load().unwrap(),
            Some(NetworkCredentials::new("home", "secret"))
        );
        assert_eq!(
            ctx.portal_mut().responses,
            vec![(7, PortalResponse::html(RESTART_ACK_HTML))]
        );
        assert!(ctx.provisioning().restart_pending());

        assert!(!ctx.step(2_000).restart_requested);
        assert!(ctx.step(3_000).restart_requested);
    }

    #[test]
    fn repeated_form_field_is_accepted_with_first_value() {
        let mut ctx = device();
        ctx.boot(0);
        ctx.portal_mut().push(post(
            3,
            "/connect",
            "ssid=home&password=secret&ssid=other",
        ));

        let report = ctx.step(1_000);

        assert!(report.errors.is_empty());
        assert_eq!(
            ctx.portal_mut().responses,
            vec![(3, PortalResponse::html(RESTART_ACK_HTML))]
        );
        assert_eq!(
            ctx.credentials().load().unwrap(),
            Some(NetworkCredentials::new("home", "secret"))
        );
        assert!(ctx.provisioning().restart_pending());
    }

    #[test]
    fn blank_submission_is_persisted_and_reads_back_absent() {
        let mut ctx = device();
        ctx.boot(0);
        ctx.portal_mut().push(post(1, "/connect", "ssid=&password="));

        ctx.step(1_000);

        assert_eq!(
            ctx.credentials().backend().get_str(CREDENTIALS_SSID_KEY).unwrap(),
            Some(String::new())
        );
        assert_eq!(ctx.credentials().load().unwrap(), None);
        assert!(ctx.provisioning().restart_pending());
    }

    #[test]
    fn portal_batch_answers_every_pending_request() {
        let mut ctx = device();
        ctx.boot(0);
        ctx.portal_mut().push(get(1, "/"));
        ctx.portal_mut().push(get(2, "/favicon.ico"));

        let report = ctx.step(1_000);

        assert_eq!(report.tick.unwrap().portal_requests, 2);
        let responses = &ctx.portal_mut().responses;
        assert_eq!(responses[0].0, 1);
        assert_eq!(responses[0].1.status, 200);
        assert_eq!(responses[0].1.body, portal::PORTAL_HTML);
        assert_eq!(responses[1], (2, PortalResponse::not_found()));
    }

    #[test]
    fn server_registration_covers_all_points() {
        let mut ctx = device();
        ctx.start_server().unwrap();
        assert_eq!(ctx.server().added.len(), 4);
    }

    #[test]
    fn context_follows_configured_namespace() {
        let mut config = NodeConfig::default();
        config.server.namespace_index = 3;
        let ctx: DeviceContext<TestPlatform> =
            DeviceContext::new(config, crate::testing::peripherals(MemoryKvStore::new()));

        assert!(ctx
            .address_space()
            .points()
            .iter()
            .all(|point| point.node_id.namespace == 3));
    }
}
