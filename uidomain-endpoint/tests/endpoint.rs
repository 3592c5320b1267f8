//! End-to-end tests driving `Endpoint` over a real `AF_UNIX` socket, playing
//! the client role by hand with `uidomain_wire`'s framing primitives.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use rustix::net::{RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags};
use uidomain_endpoint::{Endpoint, Error, CHANNEL_OPEN};
use uidomain_wire::{ChannelInfo, ChannelSocket, RequestHeader, ResponseHeader, IMPULSE_PAYLOAD_LEN};

const OP_ECHO: i32 = 42;
const OP_PUSH_CHANNEL: i32 = 99;

fn socket_path(name: &str) -> PathBuf {
    let _ = env_logger::try_init();
    std::env::temp_dir().join(format!("uidomain-endpoint-test-{name}-{}", std::process::id()))
}

fn connect(path: &Path) -> ChannelSocket {
    let addr = rustix::net::SocketAddrUnix::new(path).unwrap();
    let raw = rustix::net::socket_with(
        rustix::net::AddressFamily::UNIX,
        rustix::net::SocketType::STREAM,
        rustix::net::SocketFlags::CLOEXEC,
        None,
    )
    .unwrap();
    rustix::net::connect_unix(&raw, &addr).unwrap();
    ChannelSocket::from_owned(raw)
}

fn send_request(channel: &ChannelSocket, op: i32, is_impulse: bool, payload: &[u8], impulse_payload: [u8; IMPULSE_PAYLOAD_LEN]) {
    let header = RequestHeader {
        op,
        send_len: payload.len() as u32,
        max_recv_len: 4096,
        is_impulse,
        num_fds: 0,
        num_channels: 0,
        impulse_payload,
    };
    channel.send_request_header(&header, &[], &[]).unwrap();
    channel.send_payload(payload).unwrap();
}

/// Reads a response header plus any ancillary fds, splitting them into plain
/// fds vs. channel-info pairs the same way a request frame would be.
fn recv_response(channel: &ChannelSocket) -> (ResponseHeader, Vec<OwnedFd>, Vec<ChannelInfo<OwnedFd>>) {
    let mut header_buf = [0u8; ResponseHeader::WIRE_LEN];
    let mut cmsg_space = vec![0u8; rustix::cmsg_space!(ScmRights(8))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);

    let mut iov = [IoSliceMut::new(&mut header_buf)];
    let result = rustix::net::recvmsg(channel.as_fd(), &mut iov, &mut cmsg_buffer, RecvFlags::CMSG_CLOEXEC).unwrap();
    assert_eq!(result.bytes, ResponseHeader::WIRE_LEN);

    let mut fds = Vec::new();
    for msg in cmsg_buffer.drain() {
        if let RecvAncillaryMessage::ScmRights(incoming) = msg {
            fds.extend(incoming);
        }
    }

    let header = ResponseHeader::from_bytes(&header_buf);
    let num_fds = header.num_fds as usize;
    let num_channels = header.num_channels as usize;
    assert!(fds.len() >= num_fds + num_channels * 2);

    let channel_part = fds.split_off(num_fds.min(fds.len()));
    let file_fds = fds;

    let mut channels = Vec::with_capacity(num_channels);
    let mut it = channel_part.into_iter().take(num_channels * 2);
    for _ in 0..num_channels {
        let data_fd = it.next().unwrap();
        let event_fd = it.next().unwrap();
        channels.push(ChannelInfo { data_fd, event_fd });
    }

    (header, file_fds, channels)
}

fn recv_response_payload(channel: &ChannelSocket, header: &ResponseHeader) -> Vec<u8> {
    uidomain_wire::recv_payload(channel.as_fd(), header.recv_len as usize).unwrap()
}

#[test]
fn basic_open_and_close() {
    let path = socket_path("open-close");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    let client = connect(&path);

    send_request(&client, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);

    let message = endpoint.message_receive().unwrap();
    assert_eq!(message.op, CHANNEL_OPEN);
    let cid = message.cid;
    endpoint.message_reply(message, 0).unwrap();

    let (header, fds, channels) = recv_response(&client);
    assert_eq!(fds.len(), 1, "CHANNEL_OPEN reply carries exactly the event fd");
    assert!(channels.is_empty());
    assert!(header.ret_code >= 0);

    drop(client);

    let close_message = endpoint.message_receive().unwrap();
    assert_eq!(close_message.op, uidomain_endpoint::CHANNEL_CLOSE);
    assert_eq!(close_message.cid, cid);
    endpoint.message_reply(close_message, 0).unwrap();

    assert!(matches!(endpoint.get_channel_socket_fd(cid), Err(Error::Invalid)));
}

#[test]
fn payload_echo() {
    let path = socket_path("echo");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    let client = connect(&path);

    send_request(&client, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let open = endpoint.message_receive().unwrap();
    endpoint.message_reply(open, 0).unwrap();
    let _ = recv_response(&client);

    send_request(&client, OP_ECHO, false, b"hello", [0; IMPULSE_PAYLOAD_LEN]);
    let mut message = endpoint.message_receive().unwrap();
    assert_eq!(message.op, OP_ECHO);
    assert_eq!(message.state.request_len(), 5);

    let mut buf = [0u8; 5];
    {
        let mut iov = [IoSliceMut::new(&mut buf)];
        message.state.read_message_data(&mut iov);
    }
    assert_eq!(&buf, b"hello");
    buf.make_ascii_uppercase();
    {
        let iov = [IoSlice::new(&buf)];
        message.state.write_message_data(&iov);
    }
    endpoint.message_reply(message, 0).unwrap();

    let (header, _fds, _channels) = recv_response(&client);
    assert_eq!(header.ret_code, 0);
    assert_eq!(header.recv_len, 5);
    let payload = recv_response_payload(&client, &header);
    assert_eq!(&payload, b"HELLO");
}

#[test]
fn fd_passing_round_trip() {
    let path = socket_path("fd-pass");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    let client = connect(&path);

    send_request(&client, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let open = endpoint.message_receive().unwrap();
    endpoint.message_reply(open, 0).unwrap();
    let _ = recv_response(&client);

    send_request(&client, 7, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let message = endpoint.message_receive().unwrap();
    let devnull = std::fs::File::open("/dev/null").unwrap();
    endpoint.message_reply_fd(message, devnull.into()).unwrap();

    let (header, mut fds, _channels) = recv_response(&client);
    assert_eq!(fds.len(), 1);
    let received = fds.pop().unwrap();
    let got_meta = std::fs::File::from(received).metadata().unwrap();
    let want_meta = std::fs::metadata("/dev/null").unwrap();
    assert_eq!(got_meta.dev(), want_meta.dev());
    assert_eq!(got_meta.ino(), want_meta.ino());
    assert_eq!(header.ret_code, 0, "first pushed fd gets reference index 0");
}

#[test]
fn channel_push_registers_a_new_channel() {
    let path = socket_path("channel-push");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    let client = connect(&path);

    send_request(&client, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let open = endpoint.message_receive().unwrap();
    endpoint.message_reply(open, 0).unwrap();
    let _ = recv_response(&client);

    send_request(&client, OP_PUSH_CHANNEL, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let mut message = endpoint.message_receive().unwrap();
    let reference = endpoint.push_channel(&mut message, 0).unwrap();
    endpoint.message_reply(message, reference.raw()).unwrap();

    let (_header, _fds, mut channels) = recv_response(&client);
    assert_eq!(channels.len(), 1);
    let pushed = channels.pop().unwrap();
    let pushed_channel = ChannelSocket::from_owned(pushed.data_fd);

    send_request(&pushed_channel, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let new_open = endpoint.message_receive().unwrap();
    assert_eq!(new_open.op, CHANNEL_OPEN);
    endpoint.message_reply(new_open, 0).unwrap();
    let _ = recv_response(&pushed_channel);
}

#[test]
fn impulse_does_not_require_a_reply_and_rearms() {
    let path = socket_path("impulse");
    let endpoint = Endpoint::bind(&path, true).unwrap();
    let client = connect(&path);

    send_request(&client, CHANNEL_OPEN, false, &[], [0; IMPULSE_PAYLOAD_LEN]);
    let open = endpoint.message_receive().unwrap();
    endpoint.message_reply(open, 0).unwrap();
    let _ = recv_response(&client);

    let payload: [u8; IMPULSE_PAYLOAD_LEN] = [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0];
    send_request(&client, 7, true, &[], payload);

    let impulse = endpoint.message_receive().unwrap();
    assert!(impulse.is_impulse);
    assert_eq!(impulse.mid, uidomain_endpoint::IMPULSE_MESSAGE_ID);
    assert_eq!(impulse.impulse_payload, Some(payload));

    // No reply was sent for the impulse; the channel is already rearmed, so a
    // fresh request on the same socket must still be servable.
    send_request(&client, OP_ECHO, false, b"x", [0; IMPULSE_PAYLOAD_LEN]);
    let echo = endpoint.message_receive().unwrap();
    assert_eq!(echo.op, OP_ECHO);
    assert_eq!(echo.cid, impulse.cid);
}

#[test]
fn cancel_unblocks_message_receive() {
    let path = socket_path("cancel");
    let endpoint = std::sync::Arc::new(Endpoint::bind(&path, true).unwrap());
    let worker = endpoint.clone();

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = worker.message_receive();
        tx.send(result.is_err()).unwrap();
    });

    // Give the worker time to block inside message_receive before cancelling.
    thread::sleep(Duration::from_millis(50));
    endpoint.cancel().unwrap();

    let returned_err = rx.recv_timeout(Duration::from_secs(2)).expect("worker did not return after cancel");
    assert!(returned_err, "message_receive must fail after cancellation");
}
