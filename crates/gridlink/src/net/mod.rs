mod circuit;
mod message;
mod protocol;
mod stats;
mod template;
mod tracking;
mod transport;
mod zerocode;

pub use circuit::{Circuit, CircuitId, CircuitState, CloseReason};
pub use message::{Block, FieldError, FieldValue, Message};
pub use protocol::{
    BodyEncoding, DecodeError, EncodeError, MAX_BODY_SIZE, MAX_PACKET_SIZE, Packet, PacketFlags,
    PacketHeader, RECV_BUFFER_SIZE,
};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use template::{
    BlockCount, BlockTemplate, FieldTemplate, FieldType, Frequency, MessageTemplate, MessageType,
};
pub use tracking::{AckTracker, DeliveryOutcome, PendingAck, ReceiveTracker};
pub use transport::{DeliveryTicket, Incoming, ReliableTransport, TransportEvent};
pub use zerocode::{decode as zero_decode, encode as zero_encode};
