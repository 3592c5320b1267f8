//! Wire-level primitives shared by the endpoint and its demo consumers.
//!
//! This crate owns exactly the things that do not depend on any policy
//! about what a channel *means*: socket construction, fd-flag handling,
//! ancillary-data (SCM_RIGHTS / SCM_CREDENTIALS) transfer, and the
//! fixed-schema request/response header layout described by the protocol.

pub mod cred;
pub mod fd;
pub mod fs_utils;
pub mod frame;
pub mod channel;

pub use cred::PeerCredentials;
pub use frame::{ChannelInfo, RequestHeader, ResponseHeader, IMPULSE_PAYLOAD_LEN};
pub use channel::{
    recv_payload, recv_request, send_header_with_fds, send_payload, ChannelSocket, ListenSocket,
};
