//! Wire protocol shared by the Durango bridge daemon and the relay.
//!
//! The relay speaks JSON text frames over a WebSocket. Every frame is one
//! tagged message: [`ClientMessage`] flowing bridge → relay, [`ServerMessage`]
//! flowing relay → bridge. Conversation content crosses the wire as
//! [`DurangoItem`]s, a frozen schema the web product renders directly.

mod items;
mod messages;

pub use items::{CommandStatus, DurangoItem};
pub use messages::{
    AckStatus, Attachment, ClientMessage, DispatchAction, ErrorCode, ErrorEnvelope,
    MachineDescriptor, ServerMessage, ThreadRecord,
};
