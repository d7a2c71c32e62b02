use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::OnceLock,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use sensor_node_common::{
    config::{CREDENTIALS_NAMESPACE, MotionBusConfig},
    Acceleration, AnalogInput, DataServer, DeviceContext, DevicePeripherals, KeyValueStore,
    LinkError, MotionSensor, NetworkCredentials, NetworkLink, NodeConfig, NodeId, Platform,
    PortalError, PortalMethod, PortalRequest, PortalResponse, PortalTransport, ProvisioningState,
    SensorError, SensorSuite, ServerError, StepReport, StoreError, TelemetryPoint,
};

const SIMULATED_LINK_DELAY_MS: u64 = 3_000;

struct HostPlatform;

impl Platform for HostPlatform {
    type Store = FileKvStore;
    type Analog = SimulatedTmp36;
    type Motion = SimulatedMotion;
    type Server = LoggingDataServer;
    type Portal = HttpPortal;
    type Link = SimulatedLink;
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SENSOR_NODE_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.sensor-node"));

    let config = load_config(&data_dir).unwrap_or_else(|err| {
        warn!("failed to load node config: {err:#}");
        NodeConfig::default()
    });

    let motion = match SimulatedMotion::probe(&config.motion) {
        Ok(motion) => motion,
        Err(err) => {
            error!("motion sensor not found, check wiring: {err}");
            return Err(err).context("motion sensor initialization failed");
        }
    };
    info!("motion sensor initialized");

    let peripherals = DevicePeripherals::<HostPlatform> {
        store: FileKvStore::new(&data_dir, CREDENTIALS_NAMESPACE),
        sensors: SensorSuite::new(config.adc, SimulatedTmp36::default(), motion),
        server: LoggingDataServer::new(config.server.port),
        portal: HttpPortal::new(config.provisioning.portal_port),
        link: SimulatedLink::new(),
    };
    let mut ctx = DeviceContext::new(config, peripherals);

    let boot = ctx.boot(monotonic_ms());
    log_step(&ctx, &boot);

    ctx.start_server()
        .context("failed to register telemetry variables")?;
    info!(
        "data server initialized with {} variables",
        ctx.address_space().len()
    );

    let cadence = ctx.cadence();
    loop {
        let started = monotonic_ms();
        let report = ctx.step(started);
        log_step(&ctx, &report);

        if report.restart_requested {
            info!("restart requested after provisioning; exiting for supervisor restart");
            return Ok(());
        }

        let remaining = cadence.remaining(started, monotonic_ms());
        tokio::time::sleep(Duration::from_millis(remaining)).await;
    }
}

fn load_config(data_dir: &std::path::Path) -> anyhow::Result<NodeConfig> {
    let path = data_dir.join("config.json");
    let mut config = match std::fs::read(&path) {
        Ok(raw) => NodeConfig::from_json(&raw)
            .with_context(|| format!("invalid config at {}", path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => NodeConfig::default(),
        Err(err) => return Err(err.into()),
    };

    if let Some(port) = std::env::var("SENSOR_NODE_PORTAL_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.provisioning.portal_port = port;
    }
    if let Some(tick_ms) = std::env::var("SENSOR_NODE_TICK_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
    {
        config.timing.tick_interval_ms = tick_ms;
    }

    config.sanitize();
    Ok(config)
}

fn log_step(ctx: &DeviceContext<HostPlatform>, report: &StepReport) {
    for err in &report.errors {
        warn!("{err}");
    }

    if report.associations > 0 {
        info!(
            "Connecting to WiFi... (attempt {})",
            ctx.provisioning().connect_attempts()
        );
    }

    if report.transitioned() {
        info!(
            "provisioning state {} -> {}",
            report.previous_state.as_str(),
            report.state.as_str()
        );
        match report.state {
            ProvisioningState::AccessPointActive => info!(
                "Started Access Point: {} (portal on port {})",
                ctx.config().provisioning.ap_ssid,
                ctx.config().provisioning.portal_port
            ),
            ProvisioningState::Connected => {
                let ip = ctx
                    .link()
                    .ip_address()
                    .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
                info!("WiFi connected! IP Address: {ip}");
            }
            _ => {}
        }
    }

    let Some(tick) = &report.tick else {
        return;
    };
    match (&tick.reading, &tick.sensor_error) {
        (Some(reading), _) => info!(
            "Temperature: {:.2}°C, AccelerationX: {:.2}, AccelerationY: {:.2}, AccelerationZ: {:.2}",
            reading.temperature_c,
            reading.acceleration.x,
            reading.acceleration.y,
            reading.acceleration.z
        ),
        (None, Some(err)) => warn!("tick {} skipped: {err}", tick.tick),
        (None, None) => {}
    }
    if tick.server_errors > 0 {
        debug!("{} data server writes rejected", tick.server_errors);
    }
    if tick.portal_requests > 0 {
        debug!("served {} portal request(s)", tick.portal_requests);
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// One JSON document per namespace under the data directory.
struct FileKvStore {
    path: PathBuf,
}

impl FileKvStore {
    fn new(data_dir: &std::path::Path, namespace: &str) -> Self {
        Self {
            path: data_dir.join(format!("{namespace}.json")),
        }
    }

    fn read_all(&self) -> Result<HashMap<String, String>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|err| StoreError::Unavailable(format!("{}: {err}", self.path.display()))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(StoreError::Unavailable(err.to_string())),
        }
    }
}

impl KeyValueStore for FileKvStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
        let write_err = |details: String| StoreError::Write { key, details };

        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| write_err(err.to_string()))?;
        }
        let payload =
            serde_json::to_vec_pretty(&entries).map_err(|err| write_err(err.to_string()))?;
        std::fs::write(&self.path, payload).map_err(|err| write_err(err.to_string()))
    }
}

/// Raw counts drifting slowly around room temperature.
#[derive(Default)]
struct SimulatedTmp36 {
    tick: u64,
}

impl AnalogInput for SimulatedTmp36 {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        self.tick = self.tick.saturating_add(1);
        // ~0.75 V on a 3.3 V / 12-bit converter, stepping ~0.2 °C.
        Ok(931 + (self.tick % 8) as u16 * 3)
    }
}

struct SimulatedMotion {
    tick: u64,
}

impl SimulatedMotion {
    fn probe(bus: &MotionBusConfig) -> Result<Self, SensorError> {
        if std::env::var_os("SENSOR_NODE_NO_MOTION").is_some() {
            return Err(SensorError::InitFailed {
                sensor: "MPU6050",
                details: format!("no device at 0x{:02x}", bus.address),
            });
        }
        Ok(Self { tick: 0 })
    }
}

impl MotionSensor for SimulatedMotion {
    fn read_acceleration(&mut self) -> Result<Acceleration, SensorError> {
        self.tick = self.tick.saturating_add(1);
        let wobble = (self.tick % 6) as f32 * 0.02;
        Ok(Acceleration {
            x: 0.05 + wobble,
            y: -0.03 - wobble,
            z: 9.81,
        })
    }
}

/// Keeps the latest value per node. The protocol stack itself is outside this
/// binary; the mirror stands in for it on the host.
struct LoggingDataServer {
    port: u16,
    values: HashMap<NodeId, f32>,
    iterations: u64,
}

impl LoggingDataServer {
    fn new(port: u16) -> Self {
        Self {
            port,
            values: HashMap::new(),
            iterations: 0,
        }
    }
}

impl DataServer for LoggingDataServer {
    fn add_variable(&mut self, point: &TelemetryPoint) -> Result<(), ServerError> {
        if self.values.contains_key(&point.node_id) {
            return Err(ServerError::AddNode {
                node_id: point.node_id.to_string(),
                details: "node already exists".to_string(),
            });
        }
        debug!(
            "add variable {} ({}) under {} on port {}",
            point.node_id, point.display_name, point.parent, self.port
        );
        self.values.insert(point.node_id.clone(), point.value);
        Ok(())
    }

    fn write_value(&mut self, node_id: &NodeId, value: f32) -> Result<(), ServerError> {
        match self.values.get_mut(node_id) {
            Some(slot) => {
                *slot = value;
                trace!("{node_id} = {value}");
                Ok(())
            }
            None => Err(ServerError::Write {
                node_id: node_id.to_string(),
                details: "unknown node".to_string(),
            }),
        }
    }

    fn run_iterate(&mut self) {
        self.iterations = self.iterations.saturating_add(1);
    }
}

struct SimulatedLink {
    associating_since: Option<Instant>,
    up: bool,
}

impl SimulatedLink {
    fn new() -> Self {
        Self {
            associating_since: None,
            up: false,
        }
    }
}

impl NetworkLink for SimulatedLink {
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        info!("simulated access point `{ssid}` up (open network)");
        Ok(())
    }

    fn associate(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        if std::env::var_os("SENSOR_NODE_LINK_DOWN").is_some() {
            return Err(LinkError::Association {
                ssid: credentials.ssid.clone(),
                details: "network not in range".to_string(),
            });
        }
        if self.associating_since.is_some() {
            return Err(LinkError::InProgress {
                ssid: credentials.ssid.clone(),
            });
        }
        self.associating_since = Some(Instant::now());
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        if let Some(since) = self.associating_since {
            if since.elapsed() >= Duration::from_millis(SIMULATED_LINK_DELAY_MS) {
                self.up = true;
            }
        }
        self.up
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        self.up.then_some(Ipv4Addr::LOCALHOST)
    }
}

type PendingReply = (PortalRequest, oneshot::Sender<PortalResponse>);

/// Axum front end that forwards every request to the control loop and waits
/// for its answer.
struct HttpPortal {
    port: u16,
    next_id: u64,
    inbox: Option<mpsc::UnboundedReceiver<PendingReply>>,
    waiting: HashMap<u64, oneshot::Sender<PortalResponse>>,
}

#[derive(Clone)]
struct PortalBridge {
    outbox: mpsc::UnboundedSender<PendingReply>,
}

impl HttpPortal {
    fn new(port: u16) -> Self {
        Self {
            port,
            next_id: 0,
            inbox: None,
            waiting: HashMap::new(),
        }
    }
}

impl PortalTransport for HttpPortal {
    fn start(&mut self) -> Result<(), PortalError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = std::net::TcpListener::bind(addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                tokio::net::TcpListener::from_std(listener)
            })
            .map_err(|err| PortalError::StartFailed(format!("{addr}: {err}")))?;

        let (outbox, inbox) = mpsc::unbounded_channel();
        self.inbox = Some(inbox);

        let app = Router::new()
            .fallback(handle_portal)
            .with_state(PortalBridge { outbox });

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                error!("portal server stopped: {err}");
            }
        });
        info!("configuration portal listening on http://{addr}");
        Ok(())
    }

    fn pending(&mut self) -> Vec<PortalRequest> {
        let Some(inbox) = self.inbox.as_mut() else {
            return Vec::new();
        };

        let mut requests = Vec::new();
        while let Ok((mut request, reply)) = inbox.try_recv() {
            self.next_id = self.next_id.wrapping_add(1);
            request.id = self.next_id;
            self.waiting.insert(request.id, reply);
            requests.push(request);
        }
        requests
    }

    fn respond(&mut self, request_id: u64, response: PortalResponse) -> Result<(), PortalError> {
        self.waiting
            .remove(&request_id)
            .ok_or(PortalError::ClientGone(request_id))?
            .send(response)
            .map_err(|_| PortalError::ClientGone(request_id))
    }
}

async fn handle_portal(
    State(bridge): State<PortalBridge>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> axum::response::Response {
    let method = match method {
        Method::GET => PortalMethod::Get,
        Method::POST => PortalMethod::Post,
        _ => PortalMethod::Other,
    };
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), |value| value.as_str().to_string());

    let (reply, answer) = oneshot::channel();
    let request = PortalRequest {
        id: 0,
        method,
        path,
        body: body.to_vec(),
    };

    if bridge.outbox.send((request, reply)).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "portal closed").into_response();
    }

    match answer.await {
        Ok(response) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            [(header::CONTENT_TYPE, response.content_type)],
            response.body,
        )
            .into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "portal closed").into_response(),
    }
}
