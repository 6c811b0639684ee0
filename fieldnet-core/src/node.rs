//! Node identity: addresses, reserved ranges, descriptors, id allocation.

use serde::{Deserialize, Serialize};

/// Node address carried in header source/target fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// Reserved broadcast address.
pub const BROADCAST: NodeId = NodeId(0);

/// Reserved coordinator address.
pub const SERVER: NodeId = NodeId(1);

// Control panels live below this threshold, sensor nodes at or above it.
const SENSOR_NODE_MIN: u32 = 0x10000;

impl NodeId {
    pub fn is_broadcast(self) -> bool {
        self == BROADCAST
    }

    pub fn is_server(self) -> bool {
        self == SERVER
    }

    /// Control-panel range: [2, 0xFFFF].
    pub fn is_control_panel(self) -> bool {
        self.0 >= 2 && self.0 < SENSOR_NODE_MIN
    }

    /// Sensor-node range: [0x10000, ..].
    pub fn is_sensor_node(self) -> bool {
        self.0 >= SENSOR_NODE_MIN
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of participant a node is. Stored in descriptors; the ranges
/// above are checked by predicates, never enforced here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    SensorNode,
    ControlPanel,
    Server,
}

/// One sensor exposed by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub sensor_id: String,
    pub unit: String,
    pub min: f64,
    pub max: f64,
}

/// One actuator exposed by a node, with its current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorDescriptor {
    pub actuator_id: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub unit: String,
}

/// Self-description a node sends at announce time. `node_id` is `None` until
/// the server allocates one. Absent sensor/actuator lists are distinct from
/// empty ones and are omitted on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Vec<SensorDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actuators: Option<Vec<ActuatorDescriptor>>,
    #[serde(default)]
    pub supports_images: bool,
    #[serde(default)]
    pub supports_aggregates: bool,
}

impl NodeDescriptor {
    /// Copy of this descriptor with an assigned id substituted in.
    pub fn with_node_id(&self, id: NodeId) -> Self {
        Self {
            node_id: Some(id),
            ..self.clone()
        }
    }
}

/// Hands out node ids. Released ids are reused before fresh ones; the
/// counter starts above the reserved broadcast/server addresses. Callers
/// must not release an id still in use.
#[derive(Debug)]
pub struct NodeIdAllocator {
    next: u32,
    released: Vec<NodeId>,
}

impl NodeIdAllocator {
    pub fn new() -> Self {
        Self {
            next: 2,
            released: Vec::new(),
        }
    }

    pub fn allocate(&mut self) -> NodeId {
        if let Some(id) = self.released.pop() {
            return id;
        }
        let id = NodeId(self.next);
        self.next += 1;
        id
    }

    pub fn release(&mut self, id: NodeId) {
        self.released.push(id);
    }
}

impl Default for NodeIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
