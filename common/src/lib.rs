pub mod address_space;
pub mod config;
pub mod credentials;
pub mod device;
pub mod network;
pub mod portal;
pub mod provisioning;
pub mod sensing;
pub mod sync;
pub mod types;

#[cfg(test)]
mod testing;

pub use address_space::{AddressSpace, DataServer, NodeId, PointHandle, ServerError, TelemetryPoint};
pub use config::NodeConfig;
pub use credentials::{CredentialStore, KeyValueStore, MemoryKvStore, StoreError};
pub use device::{DeviceContext, DeviceError, DevicePeripherals, Platform, StepReport};
pub use network::{LinkError, NetworkLink};
pub use portal::{PortalError, PortalMethod, PortalRequest, PortalResponse, PortalTransport};
pub use provisioning::{ProvisioningAction, ProvisioningMachine};
pub use sensing::{AnalogInput, MotionSensor, SensorError, SensorSuite};
pub use sync::{Cadence, SyncEngine, TickReport};
pub use types::{Acceleration, NetworkCredentials, ProvisioningState, SensorReading};
