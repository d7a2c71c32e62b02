use std::{collections::VecDeque, net::Ipv4Addr};

use crate::{
    address_space::{DataServer, NodeId, ServerError, TelemetryPoint},
    config::{AdcConfig, NodeConfig},
    credentials::MemoryKvStore,
    device::{DeviceContext, DevicePeripherals, Platform},
    network::{LinkError, NetworkLink},
    portal::{PortalError, PortalRequest, PortalResponse, PortalTransport},
    sensing::{AnalogInput, MotionSensor, SensorError, SensorSuite},
    types::{Acceleration, NetworkCredentials},
};

pub struct FakeAnalog {
    samples: Vec<u16>,
    next: usize,
}

impl FakeAnalog {
    pub fn fixed(raw: u16) -> Self {
        Self::sequence(vec![raw])
    }

    /// Cycles through `samples` forever.
    pub fn sequence(samples: Vec<u16>) -> Self {
        Self { samples, next: 0 }
    }
}

impl AnalogInput for FakeAnalog {
    fn read_raw(&mut self) -> Result<u16, SensorError> {
        let raw = self.samples[self.next % self.samples.len()];
        self.next += 1;
        Ok(raw)
    }
}

pub struct FakeMotion {
    sample: Option<Acceleration>,
}

impl FakeMotion {
    pub fn fixed(sample: Acceleration) -> Self {
        Self {
            sample: Some(sample),
        }
    }

    pub fn failing() -> Self {
        Self { sample: None }
    }
}

impl MotionSensor for FakeMotion {
    fn read_acceleration(&mut self) -> Result<Acceleration, SensorError> {
        self.sample.ok_or_else(|| SensorError::ReadFailed {
            sensor: "fake-motion",
            details: "no sample".to_string(),
        })
    }
}

#[derive(Default)]
pub struct RecordingServer {
    pub added: Vec<TelemetryPoint>,
    pub writes: Vec<(NodeId, f32)>,
    pub write_attempts: usize,
    pub iterations: usize,
    reject_writes: bool,
}

impl RecordingServer {
    pub fn rejecting_writes() -> Self {
        Self {
            reject_writes: true,
            ..Self::default()
        }
    }
}

impl DataServer for RecordingServer {
    fn add_variable(&mut self, point: &TelemetryPoint) -> Result<(), ServerError> {
        self.added.push(point.clone());
        Ok(())
    }

    fn write_value(&mut self, node_id: &NodeId, value: f32) -> Result<(), ServerError> {
        self.write_attempts += 1;
        if self.reject_writes {
            return Err(ServerError::Write {
                node_id: node_id.to_string(),
                details: "rejected".to_string(),
            });
        }
        self.writes.push((node_id.clone(), value));
        Ok(())
    }

    fn run_iterate(&mut self) {
        self.iterations += 1;
    }
}

#[derive(Default)]
pub struct QueuedPortal {
    pub started: bool,
    pub queue: VecDeque<PortalRequest>,
    pub responses: Vec<(u64, PortalResponse)>,
}

impl QueuedPortal {
    pub fn push(&mut self, request: PortalRequest) {
        self.queue.push_back(request);
    }
}

impl PortalTransport for QueuedPortal {
    fn start(&mut self) -> Result<(), PortalError> {
        self.started = true;
        Ok(())
    }

    fn pending(&mut self) -> Vec<PortalRequest> {
        self.queue.drain(..).collect()
    }

    fn respond(&mut self, request_id: u64, response: PortalResponse) -> Result<(), PortalError> {
        self.responses.push((request_id, response));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLink {
    pub access_points: Vec<String>,
    pub associations: Vec<NetworkCredentials>,
    /// Reports the link up on the n-th `is_up` call; never when `None`.
    pub up_after_polls: Option<u32>,
    /// Answers every association request with `InProgress`.
    pub busy: bool,
    /// Rejects every association request.
    pub refuse: bool,
    polls: u32,
}

impl NetworkLink for FakeLink {
    fn start_access_point(&mut self, ssid: &str) -> Result<(), LinkError> {
        self.access_points.push(ssid.to_string());
        Ok(())
    }

    fn associate(&mut self, credentials: &NetworkCredentials) -> Result<(), LinkError> {
        self.associations.push(credentials.clone());
        if self.refuse {
            return Err(LinkError::Association {
                ssid: credentials.ssid.clone(),
                details: "refused".to_string(),
            });
        }
        if self.busy {
            return Err(LinkError::InProgress {
                ssid: credentials.ssid.clone(),
            });
        }
        Ok(())
    }

    fn is_up(&mut self) -> bool {
        self.polls += 1;
        self.up_after_polls.is_some_and(|after| self.polls >= after)
    }

    fn ip_address(&self) -> Option<Ipv4Addr> {
        self.up_after_polls
            .filter(|after| self.polls >= *after)
            .map(|_| Ipv4Addr::new(192, 168, 1, 42))
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Store = MemoryKvStore;
    type Analog = FakeAnalog;
    type Motion = FakeMotion;
    type Server = RecordingServer;
    type Portal = QueuedPortal;
    type Link = FakeLink;
}

pub fn peripherals(store: MemoryKvStore) -> DevicePeripherals<TestPlatform> {
    DevicePeripherals {
        store,
        sensors: SensorSuite::new(
            AdcConfig::default(),
            FakeAnalog::fixed(931),
            FakeMotion::fixed(Acceleration {
                x: 0.0,
                y: 0.0,
                z: 9.81,
            }),
        ),
        server: RecordingServer::default(),
        portal: QueuedPortal::default(),
        link: FakeLink::default(),
    }
}

pub fn device_with_store(store: MemoryKvStore) -> DeviceContext<TestPlatform> {
    DeviceContext::new(NodeConfig::default(), peripherals(store))
}

pub fn device() -> DeviceContext<TestPlatform> {
    device_with_store(MemoryKvStore::new())
}
