use core::convert::TryInto;
use std::{
    collections::HashMap,
    net::Ipv4Addr,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::FreeRtos,
    gpio::Gpio34,
    i2c::{I2cConfig, I2cDriver},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    wifi::EspWifi,
};
use log::{error, info, warn};
use mpu6050::Mpu6050;

use sensor_node_common::{
    config::{MotionBusConfig, CREDENTIALS_NAMESPACE},
    Acceleration, AnalogInput, DataServer, DeviceContext, DevicePeripherals, KeyValueStore,
    LinkError, MotionSensor, NetworkCredentials, NetworkLink, NodeConfig, NodeId, Platform,
    PortalError, PortalMethod, PortalRequest, PortalResponse, PortalTransport, ProvisioningState,
    SensorError, SensorSuite, ServerError, StepReport, StoreError, TelemetryPoint,
};

const STANDARD_GRAVITY: f32 = 9.806_65;
const MAX_FORM_BODY: usize = 512;
const NVS_VALUE_BUFFER: usize = 128;
const PORTAL_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct EspPlatform;

impl Platform for EspPlatform {
    type Store = NvsKvStore;
    type Analog = Tmp36Input;
    type Motion = Mpu6050Sensor;
    type Server = MirrorDataServer;
    type Portal = EspPortal;
    type Link = EspLink;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = NodeConfig::default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem,
        pins,
        adc1,
        i2c0,
        ..
    } = Peripherals::take()?;

    let adc = AdcDriver::new(adc1).context("failed to initialize ADC1")?;
    let temperature = Tmp36Input {
        channel: AdcChannelDriver::new(
            adc,
            pins.gpio34,
            &AdcChannelConfig {
                attenuation: DB_11,
                ..Default::default()
            },
        )
        .context("failed to configure TMP36 channel")?,
    };

    let i2c = I2cDriver::new(
        i2c0,
        pins.gpio21,
        pins.gpio22,
        &I2cConfig::new().baudrate(Hertz(config.motion.baudrate_khz * 1_000)),
    )
    .context("failed to initialize I2C bus")?;

    let motion = match Mpu6050Sensor::probe(i2c, &config.motion) {
        Ok(motion) => motion,
        Err(err) => {
            error!("{err}; check MPU6050 wiring");
            halt();
        }
    };
    info!("motion sensor initialized");

    let nvs = EspNvs::new(nvs_partition.clone(), CREDENTIALS_NAMESPACE, true)
        .context("failed to open credentials namespace")?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))
        .context("failed to create wifi driver")?;

    let device_peripherals = DevicePeripherals::<EspPlatform> {
        store: NvsKvStore { nvs },
        sensors: SensorSuite::new(config.adc, temperature, motion),
        server: MirrorDataServer::default(),
        portal: EspPortal::new(config.provisioning.portal_port),
        link: EspLink::new(wifi),
    };
    let mut ctx = DeviceContext::new(config, device_peripherals);

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
            info!("restarting to apply new WiFi credentials");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }

        let remaining = cadence.remaining(started, monotonic_ms());
        thread::sleep(Duration::from_millis(remaining));
    }
}

/// Parks the main task for good. Used when a required sensor is missing.
fn halt() -> ! {
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn log_step(ctx: &DeviceContext<EspPlatform>, report: &StepReport) {
    for err in &report.errors {
        warn!("{err}");
    }

    if report.associations > 0 {
        info!("Connecting to WiFi...");
    }

    if report.transitioned() {
        match report.state {
            ProvisioningState::AccessPointActive => {
                let ip = ctx
                    .link()
                    .access_point_address()
                    .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
                info!("Access Point IP address: {ip}");
            }
            ProvisioningState::Connected => {
                let ip = ctx
                    .link()
                    .ip_address()
                    .map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
                info!("WiFi connected! IP Address: {ip}");
            }
            state => info!("provisioning state: {}", state.as_str()),
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
        warn!("{} data server writes rejected", tick.server_errors);
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

struct NvsKvStore {
    nvs: EspNvs<NvsDefault>,
}

impl KeyValueStore for NvsKvStore {
    fn get_str(&self, key: &'static str) -> Result<Option<String>, StoreError> {
        let mut buffer = [0_u8; NVS_VALUE_BUFFER];
        self.nvs
            .get_str(key, &mut buffer)
            .map(|value| value.map(str::to_string))
            .map_err(|err| StoreError::Read {
                key,
                details: err.to_string(),
            })
    }

    fn set_str(&mut self, key: &'static str, value: &str) -> Result<(), StoreError> {
        self.nvs.set_str(key, value).map_err(|err| StoreError::Write {
            key,
            details: err.to_string(),
        })
    }
}

/// TMP36 on GPIO34, 11 dB attenuation.
struct Tmp36Input {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AnalogInput for Tmp36Input {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        self.channel
            .read_raw()
            .map_err(|err| SensorError::ReadFailed {
                sensor: "TMP36",
                details: err.to_string(),
            })
    }
}

struct Mpu6050Sensor {
    device: Mpu6050<I2cDriver<'static>>,
}

impl Mpu6050Sensor {
    fn probe(i2c: I2cDriver<'static>, bus: &MotionBusConfig) -> Result<Self, SensorError> {
        let mut device = Mpu6050::new_with_addr(i2c, bus.address);
        device
            .init(&mut FreeRtos)
            .map_err(|err| SensorError::InitFailed {
                sensor: "MPU6050",
                details: format!("{err:?}"),
            })?;
        Ok(Self { device })
    }
}

impl MotionSensor for Mpu6050Sensor {
    fn read_acceleration(&mut self) -> Result<Acceleration, SensorError> {
        // The driver reports g.
        let acc = self
            .device
            .get_acc()
            .map_err(|err| SensorError::ReadFailed {
                sensor: "MPU6050",
                details: format!("{err:?}"),
            })?;
        Ok(Acceleration {
            x: acc.x * STANDARD_GRAVITY,
            y: acc.y * STANDARD_GRAVITY,
            z: acc.z * STANDARD_GRAVITY,
        })
    }
}

/// Holds the latest value of every registered variable for the protocol task.
#[derive(Default)]
struct MirrorDataServer {
    values: HashMap<NodeId, f32>,
}

impl DataServer for MirrorDataServer {
    fn add_variable(&mut self, point: &TelemetryPoint) -> Result<(), ServerError> {
        if self.values.contains_key(&point.node_id) {
            return Err(ServerError::AddNode {
                node_id: point.node_id.to_string(),
                details: "node already exists".to_string(),
            });
        }
        self.values.insert(point.node_id.clone(), point.value);
        Ok(())
    }

    fn write_value(&mut self, node_id: &NodeId, value: f32) -> Result<(), ServerError> {
        let slot = self
            .values
            .get_mut(node_id)
            .ok_or_else(|| ServerError::Write {
                node_id: node_id.to_string(),
                details: "unknown node".to_string(),
            })?;
        *slot = value;
        Ok(())
    }

    fn run_iterate(&mut self) {}
}

struct EspLink {
    wifi: EspWifi<'static>,
    station_configured: bool,
}

impl EspLink {
    fn new(wifi: EspWifi<'static>) -> Self {
        Self {
            wifi,
            station_configured: false,
        }
    }

    fn access_point_address(&self) -> Option<Ipv4Addr> {
        self.wifi.ap_netif().get_ip_info().ok().map(|info| info.ip)
    }

    fn configure_station(&mut self, credentials: &NetworkCredentials) -> anyhow::Result<()> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("wifi ssid too long"))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))?;
        self.wifi.start()?;
        Ok(())
    }
}

impl NetworkLink for EspLink {
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        let ap_err = |details: String| LinkError::AccessPoint {
            ssid: ssid.to_string(),
            details,
        };

        let configuration = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| ap_err("ssid too long".to_string()))?,
            auth_method: AuthMethod::None,
            channel: 1,
            ..Default::default()
        });
        self.wifi
            .set_configuration(&configuration)
            .map_err(|err| ap_err(err.to_string()))?;
        self.wifi.start().map_err(|err| ap_err(err.to_string()))?;
        info!("Started Access Point: {ssid}");
        Ok(())
    }

    fn associate(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        let assoc_err = |details: String| LinkError::Association {
            ssid: credentials.ssid.clone(),
            details,
        };

        if !self.station_configured {
            self.configure_station(credentials)
                .map_err(|err| assoc_err(format!("{err:#}")))?;
            self.station_configured = true;
        }
        self.wifi.connect().map_err(|err| {
            if err.code() == esp_idf_svc::sys::ESP_ERR_WIFI_CONN as esp_idf_svc::sys::esp_err_t {
                LinkError::InProgress {
                    ssid: credentials.ssid.clone(),
                }
            } else {
                assoc_err(err.to_string())
            }
        })
    }

    fn is_up(&mut self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
            .filter(|ip| !ip.is_unspecified())
    }
}

type PendingReply = (PortalRequest, mpsc::SyncSender<PortalResponse>);

/// HTTP handlers run on the server's own task; each one forwards its request
/// to the control loop and blocks until the loop answers.
struct EspPortal {
    port: u16,
    server: Option<EspHttpServer<'static>>,
    inbox: Option<mpsc::Receiver<PendingReply>>,
    waiting: HashMap<u64, mpsc::SyncSender<PortalResponse>>,
    next_id: u64,
}

impl EspPortal {
    fn new(port: u16) -> Self {
        Self {
            port,
            server: None,
            inbox: None,
            waiting: HashMap::new(),
            next_id: 0,
        }
    }

    fn create_server(&self, outbox: mpsc::Sender<PendingReply>) -> anyhow::Result<EspHttpServer<'static>> {
        let conf = HttpConfiguration {
            http_port: self.port,
            stack_size: 8 * 1024,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&conf)?;

        for (path, method) in [("/", Method::Get), ("/connect", Method::Post)] {
            let outbox = outbox.clone();
            server.fn_handler::<anyhow::Error, _>(path, method, move |mut req| {
                let request = read_portal_request(&mut req, method)?;
                let (reply, answer) = mpsc::sync_channel(1);
                outbox
                    .send((request, reply))
                    .map_err(|_| anyhow::anyhow!("control loop is gone"))?;
                let response = answer
                    .recv_timeout(PORTAL_REPLY_TIMEOUT)
                    .unwrap_or_else(|_| PortalResponse::server_error("Device busy"));
                write_portal_response(req, &response)
            })?;
        }

        Ok(server)
    }
}

impl PortalTransport for EspPortal {
    fn start(&mut self) -> Result<(), PortalError> {
        let (outbox, inbox) = mpsc::channel();
        let server = self
            .create_server(outbox)
            .map_err(|err| PortalError::StartFailed(format!("{err:#}")))?;
        self.server = Some(server);
        self.inbox = Some(inbox);
        info!("configuration portal listening on port {}", self.port);
        Ok(())
    }

    fn pending(&mut self) -> Vec<PortalRequest> {
        let Some(inbox) = self.inbox.as_ref() else {
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

fn read_portal_request(
    req: &mut Request<&mut EspHttpConnection<'_>>,
    method: Method,
) -> anyhow::Result<PortalRequest> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_FORM_BODY {
        anyhow::bail!("request body too large");
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }

    Ok(PortalRequest {
        id: 0,
        method: match method {
            Method::Get => PortalMethod::Get,
            Method::Post => PortalMethod::Post,
            _ => PortalMethod::Other,
        },
        path: req.uri().to_string(),
        body,
    })
}

fn write_portal_response(
    req: Request<&mut EspHttpConnection<'_>>,
    response: &PortalResponse,
) -> anyhow::Result<()> {
    req.into_response(
        response.status,
        None,
        &[("Content-Type", response.content_type)],
    )?
    .write_all(response.body.as_bytes())?;
    Ok(())
}
