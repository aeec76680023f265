#![cfg_attr(not(feature = "std"), no_std)]

mod codec;

pub mod an400;
pub mod controller;
pub mod envelope;
pub mod frame;
pub mod mcp2515;
pub mod ndjson;
pub mod node;
pub mod packet;
pub mod receiver;
pub mod sequence;
pub mod snapshot;

#[cfg(feature = "std")]
pub mod ingest;

// AN400 frame 0x0CFFF048, rpm 5000, ign 12.0 deg:
// CAN,123456,CFFF048,1,8,136,19,0,0,22,0,120,0

pub use an400::{Decoder, DecoderConfig, DecoderVariant, LambdaArbitration, MessageId};
pub use controller::{CanController, ErrorFlags, RxBuffer, RxFlags};
pub use envelope::{EnvelopeEncoder, EnvelopeError, FramedTelemetry, ENVELOPE_LEN};
pub use frame::*;
pub use ndjson::{NdjsonEncoder, NdjsonError};
pub use node::{Clock, NodeConfig, NodeError, TelemetryNode, Uplink, UplinkFormat};
pub use packet::{PacketEncoder, PacketLengthError, TelemetryPacket, PACKET_LEN};
pub use receiver::{RadioFormat, RadioReceiver};
pub use sequence::{SequenceEvent, SequenceTracker};
pub use snapshot::Snapshot;

pub use embedded_can::{ExtendedId, Id, StandardId};
