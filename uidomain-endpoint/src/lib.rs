//! Server-side endpoint: a connection/channel table, a one-shot readiness
//! loop over `epoll`, and request/reply dispatch for a single Unix-domain-
//! socket service.

pub mod endpoint;
pub mod error;
pub mod id;
pub mod message;
pub mod opcode;
pub mod readiness;
pub mod table;

pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use id::ChannelId;
pub use message::{
    ChannelManager, ChannelReference, FileReference, GetChannelHandleResult, GetFileHandleResult,
    LocalChannelHandle, Message, MessageState, IMPULSE_MESSAGE_ID,
};
pub use opcode::{CHANNEL_CLOSE, CHANNEL_OPEN};
pub use table::{ChannelData, ChannelTable, EventSet};

pub use uidomain_wire::{ChannelInfo, PeerCredentials, IMPULSE_PAYLOAD_LEN};
