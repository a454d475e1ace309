pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grid;
pub mod net;
pub mod registry;
pub mod session;
pub mod teleport;

pub use agent::{AgentCache, AgentIdentity, AgentState};
pub use config::ClientConfig;
pub use dispatch::{CallbackDispatcher, HandlerId};
pub use error::{
    ConnectError, DecodeError, DeliveryFailure, FieldError, SendError, TeleportError,
    TeleportErrorKind,
};
pub use grid::{RegionDirectory, RegionResolver, region_handle, region_handle_for_cell};
pub use net::{
    Block, BodyEncoding, Circuit, CircuitId, CloseReason, DeliveryOutcome, DeliveryTicket,
    EncodeError, FieldValue, Message, MessageType, NetworkStats, Packet, PacketFlags,
    PacketLossSimulation, ReliableTransport, TransportEvent,
};
pub use registry::{PendingConnection, SimulatorRegistry};
pub use session::Session;
pub use teleport::{
    TeleportCoordinator, TeleportHandle, TeleportOutcome, TeleportPhase, TeleportSession,
    TeleportStatus, TeleportTarget, TeleportUpdate,
};
