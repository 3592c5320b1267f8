//! A minimal client that speaks the wire protocol directly: open a channel,
//! echo a message off the service, then push and receive an fd.

use std::io::IoSliceMut;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use rustix::net::RecvFlags;
use uidomain_wire::{ChannelSocket, RequestHeader, ResponseHeader, IMPULSE_PAYLOAD_LEN};

use crate::service::OP_ECHO;

pub fn run(socket_path: &Path, message: &str) -> anyhow::Result<()> {
    let addr = rustix::net::SocketAddrUnix::new(socket_path)?;
    let raw = rustix::net::socket_with(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )?;
    rustix::net::connect_unix(&raw, &addr)?;
    let channel = ChannelSocket::from_owned(raw);
    log::info!("connected to {}", socket_path.display());

    // CHANNEL_OPEN: no payload, but the reply's return code is really a
    // FileReference naming the channel's event fd.
    send_request(&channel, 0, false, &[], 0)?;
    let (open_header, event_fd) = recv_response(&channel)?;
    log::info!("channel open acknowledged, event fd reference {}", open_header.ret_code);
    drop(event_fd);

    // Echo: send the message, expect it back unchanged.
    send_request(&channel, OP_ECHO, false, message.as_bytes(), 0)?;
    let (echo_header, _) = recv_response(&channel)?;
    let reply_payload = uidomain_wire::recv_payload(channel.as_fd(), echo_header.recv_len as usize)?;
    let reply = String::from_utf8_lossy(&reply_payload);
    println!("echoed: {reply}");

    Ok(())
}

fn send_request(
    channel: &ChannelSocket,
    op: i32,
    is_impulse: bool,
    payload: &[u8],
    max_recv_len: u32,
) -> anyhow::Result<()> {
    let header = RequestHeader {
        op,
        send_len: payload.len() as u32,
        max_recv_len,
        is_impulse,
        num_fds: 0,
        num_channels: 0,
        impulse_payload: [0u8; IMPULSE_PAYLOAD_LEN],
    };
    channel.send_request_header(&header, &[], &[])?;
    channel.send_payload(payload)?;
    Ok(())
}

/// Reads a response header and, if the server pushed exactly one fd (as
/// `CHANNEL_OPEN`'s reply does), returns it.
fn recv_response(channel: &ChannelSocket) -> anyhow::Result<(ResponseHeader, Option<OwnedFd>)> {
    let mut header_buf = [0u8; ResponseHeader::WIRE_LEN];
    let mut cmsg_space = vec![0u8; rustix::cmsg_space!(ScmRights(4))];
    let mut cmsg_buffer = rustix::net::RecvAncillaryBuffer::new(&mut cmsg_space);

    let mut iov = [IoSliceMut::new(&mut header_buf)];
    let result = rustix::net::recvmsg(
        channel.as_fd(),
        &mut iov,
        &mut cmsg_buffer,
        RecvFlags::CMSG_CLOEXEC,
    )?;
    if result.bytes != ResponseHeader::WIRE_LEN {
        anyhow::bail!("short read on response header");
    }

    let mut fd = None;
    for msg in cmsg_buffer.drain() {
        if let rustix::net::RecvAncillaryMessage::ScmRights(incoming) = msg {
            fd = incoming.into_iter().next();
        }
    }

    Ok((ResponseHeader::from_bytes(&header_buf), fd))
}
