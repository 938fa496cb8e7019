//! The OpenFlow wire format as far as the driver needs to understand it: the common header,
//!  message framing and validation, version negotiation and the handshake messages.

pub mod datapath_id;
pub mod header;
pub mod message;
pub mod messages;
pub mod versions;

pub use datapath_id::DatapathId;
pub use header::{Header, MessageType};
pub use message::{FrameError, Message};
pub use versions::ProtocolVersions;
