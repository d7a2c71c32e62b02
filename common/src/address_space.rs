//! In-memory mirror of the variables exposed by the structured-data server.

use std::fmt;

use thiserror::Error;

/// Standard namespace-0 nodes the telemetry variables hang off.
pub const OBJECTS_FOLDER: NumericNodeId = NumericNodeId(85);
pub const ORGANIZES_REFERENCE: NumericNodeId = NumericNodeId(35);
pub const BASE_DATA_VARIABLE_TYPE: NumericNodeId = NumericNodeId(63);
pub const FLOAT_DATA_TYPE: NumericNodeId = NumericNodeId(10);

pub const DISPLAY_LOCALE: &str = "en-US";

pub struct PointSpec {
    pub identifier: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub initial_value: f32,
}

/// Every telemetry point, in tick write order.
pub const TELEMETRY_POINTS: [PointSpec; 4] = [
    PointSpec {
        identifier: "Temperature",
        display_name: "Temperature",
        description: "Temperature",
        initial_value: 0.0,
    },
    PointSpec {
        identifier: "AccelerationX",
        display_name: "Acceleration X",
        description: "Acceleration X",
        initial_value: 0.0,
    },
    PointSpec {
        identifier: "AccelerationY",
        display_name: "Acceleration Y",
        description: "Acceleration Y",
        initial_value: 0.0,
    },
    PointSpec {
        identifier: "AccelerationZ",
        display_name: "Acceleration Z",
        description: "Acceleration Z",
        initial_value: 0.0,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumericNodeId(pub u32);

impl fmt::Display for NumericNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns=0;i={}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub namespace: u16,
    pub identifier: String,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns={};s={}", self.namespace, self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryPoint {
    pub node_id: NodeId,
    pub display_name: String,
    pub description: String,
    pub value: f32,
    pub parent: NumericNodeId,
    pub reference_type: NumericNodeId,
    pub type_definition: NumericNodeId,
    pub data_type: NumericNodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointHandle(usize);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to add variable {node_id}: {details}")]
    AddNode { node_id: String, details: String },
    #[error("failed to write {node_id}: {details}")]
    Write { node_id: String, details: String },
}

/// The structured-data server collaborator. Protocol, sessions and node
/// storage live behind this seam.
pub trait DataServer {
    fn add_variable(&mut self, point: &TelemetryPoint) -> Result<(), ServerError>;
    fn write_value(&mut self, node_id: &NodeId, value: f32) -> Result<(), ServerError>;
    /// One bounded, non-blocking step of protocol processing.
    fn run_iterate(&mut self);
}

#[derive(Debug, Clone)]
pub struct AddressSpace {
    namespace: u16,
    points: Vec<TelemetryPoint>,
}

impl AddressSpace {
    pub fn new(namespace: u16) -> Self {
        Self {
            namespace,
            points: Vec::with_capacity(TELEMETRY_POINTS.len()),
        }
    }

    /// Builds the fixed telemetry catalog from [`TELEMETRY_POINTS`].
    pub fn populate(namespace: u16) -> Self {
        let mut space = Self::new(namespace);
        for spec in &TELEMETRY_POINTS {
            let handle = space.create_point(spec.identifier, spec.description);
            let point = &mut space.points[handle.0];
            point.display_name = spec.display_name.to_string();
            point.value = spec.initial_value;
        }
        space
    }

    /// Registering an identifier twice is a programming error.
    pub fn create_point(&mut self, identifier: &str, description: &str) -> PointHandle {
        debug_assert!(
            self.handle(identifier).is_none(),
            "telemetry point `{identifier}` created twice"
        );

        self.points.push(TelemetryPoint {
            node_id: NodeId {
                namespace: self.namespace,
                identifier: identifier.to_string(),
            },
            display_name: identifier.to_string(),
            description: description.to_string(),
            value: 0.0,
            parent: OBJECTS_FOLDER,
            reference_type: ORGANIZES_REFERENCE,
            type_definition: BASE_DATA_VARIABLE_TYPE,
            data_type: FLOAT_DATA_TYPE,
        });
        PointHandle(self.points.len() - 1)
    }

    pub fn write(&mut self, handle: PointHandle, value: f32) {
        self.points[handle.0].value = value;
    }

    pub fn handle(&self, identifier: &str) -> Option<PointHandle> {
        self.points
            .iter()
            .position(|point| point.node_id.identifier == identifier)
            .map(PointHandle)
    }

    pub fn handles(&self) -> impl Iterator<Item = PointHandle> {
        (0..self.points.len()).map(PointHandle)
    }

    pub fn point(&self, handle: PointHandle) -> &TelemetryPoint {
        &self.points[handle.0]
    }

    pub fn points(&self) -> &[TelemetryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Registers every point with the server, stopping at the first failure.
    pub fn register(&self, server: &mut impl DataServer) -> Result<(), ServerError> {
        for point in &self.points {
            server.add_variable(point)?;
        }
        Ok(())
    }
}
