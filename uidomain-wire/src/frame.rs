//! Fixed-schema request/response headers.
//!
//! Unlike the length-prefixed, serde-encoded `Packet` this crate's ancestor used,
//! every header here has an explicit byte layout: a handful of known-width
//! integers, little-endian, with no framing ambiguity. File descriptors and
//! channel-info pairs never appear in these bytes; they travel alongside as
//! `SCM_RIGHTS` ancillary data, and the header only records how many of each
//! the ancillary block holds so the receiver knows where to cut the fd list.

use std::os::fd::OwnedFd;

/// Size, in bytes, of the inline payload an impulse request carries instead of
/// a separate payload frame. Chosen generously enough to hold a small fixed
/// record (e.g. a (u64, u64) pair) without forcing a second read.
pub const IMPULSE_PAYLOAD_LEN: usize = 16;

const REQUEST_HEADER_LEN: usize = 4 + 4 + 4 + 1 + 4 + 4 + IMPULSE_PAYLOAD_LEN;
const RESPONSE_HEADER_LEN: usize = 4 + 4 + 4 + 4;

/// A `(data_fd, event_fd)` pair describing a channel handed to or from a peer.
pub struct ChannelInfo<F> {
    pub data_fd: F,
    pub event_fd: F,
}

impl ChannelInfo<OwnedFd> {
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.data_fd, self.event_fd)
    }
}

/// The header of a request frame, as received from the wire.
///
/// `peer_credentials` is not part of this struct: it arrives via `SCM_CREDENTIALS`
/// and is handled by [`crate::channel::ChannelSocket::recv_request`] directly.
#[derive(Debug, Clone, Copy)]
pub struct RequestHeader {
    pub op: i32,
    pub send_len: u32,
    pub max_recv_len: u32,
    pub is_impulse: bool,
    pub num_fds: u32,
    pub num_channels: u32,
    pub impulse_payload: [u8; IMPULSE_PAYLOAD_LEN],
}

impl RequestHeader {
    pub fn to_bytes(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        let mut off = 0;
        buf[off..off + 4].copy_from_slice(&self.op.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.send_len.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.max_recv_len.to_le_bytes());
        off += 4;
        buf[off] = self.is_impulse as u8;
        off += 1;
        buf[off..off + 4].copy_from_slice(&self.num_fds.to_le_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.num_channels.to_le_bytes());
        off += 4;
        buf[off..off + IMPULSE_PAYLOAD_LEN].copy_from_slice(&self.impulse_payload);
        buf
    }

    pub fn from_bytes(buf: &[u8; REQUEST_HEADER_LEN]) -> Self {
        let mut off = 0;
        let op = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let send_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let max_recv_len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let is_impulse = buf[off] != 0;
        off += 1;
        let num_fds = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let num_channels = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        off += 4;
        let mut impulse_payload = [0u8; IMPULSE_PAYLOAD_LEN];
        impulse_payload.copy_from_slice(&buf[off..off + IMPULSE_PAYLOAD_LEN]);

        RequestHeader {
            op,
            send_len,
            max_recv_len,
            is_impulse,
            num_fds,
            num_channels,
            impulse_payload,
        }
    }

    pub const WIRE_LEN: usize = REQUEST_HEADER_LEN;
}

/// The header of a response frame.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub ret_code: i32,
    pub recv_len: u32,
    pub num_fds: u32,
    pub num_channels: u32,
}

impl ResponseHeader {
    pub fn to_bytes(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.ret_code.to_le_bytes());
        buf[4..8].copy_from_slice(&self.recv_len.to_le_bytes());
        buf[8..12].copy_from_slice(&self.num_fds.to_le_bytes());
        buf[12..16].copy_from_slice(&self.num_channels.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RESPONSE_HEADER_LEN]) -> Self {
        ResponseHeader {
            ret_code: i32::from_le_bytes(buf[0..4].try_into().unwrap()),
            recv_len: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            num_fds: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            num_channels: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    pub const WIRE_LEN: usize = RESPONSE_HEADER_LEN;
}
