use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};

use crate::cred::PeerCredentials;
use crate::fd::{self, set_cloexec};
use crate::frame::{ChannelInfo, RequestHeader, ResponseHeader};
use crate::fs_utils::UnlinkOnDrop;

/// Upper bound on the combined number of file descriptors (plain fds plus
/// `2 * channel-infos`) a single frame may carry; sizes the `SCM_RIGHTS`
/// cmsg buffer.
pub const MAX_ANCILLARY_FDS: usize = 32;

/// The UDS listening socket the endpoint accepts new channels from.
pub struct ListenSocket {
    fd: OwnedFd,
    _path: Option<UnlinkOnDrop>,
}

impl ListenSocket {
    /// Creates a fresh listening socket bound to `path`, unlinking any stale
    /// entry left over from a previous run first.
    pub fn bind(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let socket = rustix::net::socket_with(
            rustix::net::AddressFamily::UNIX,
            rustix::net::SocketType::STREAM,
            rustix::net::SocketFlags::CLOEXEC | rustix::net::SocketFlags::NONBLOCK,
            None,
        )
        .map_err(std::io::Error::from)?;

        let addr = fd::unix_addr(path)?;
        rustix::net::bind_unix(&socket, &addr).map_err(std::io::Error::from)?;

        // Backlog of 1: the endpoint accepts one connection at a time off the
        // readiness set, matching the one-shot-per-event dispatch discipline.
        rustix::net::listen(&socket, 1).map_err(std::io::Error::from)?;

        Ok(ListenSocket {
            fd: socket,
            _path: Some(UnlinkOnDrop::new(path.to_owned())),
        })
    }

    /// Adopts a listening socket fd handed out by an init service instead of
    /// creating one. The caller has already validated the registered name.
    pub fn adopt(fd: OwnedFd) -> std::io::Result<Self> {
        set_cloexec(fd.as_fd())?;
        fd::set_nonblock(fd.as_fd())?;
        Ok(ListenSocket { fd, _path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self._path.as_ref().map(UnlinkOnDrop::path)
    }

    pub fn path_buf(&self) -> Option<PathBuf> {
        self.path().map(Path::to_path_buf)
    }

    /// Accepts one pending connection, enabling `SO_PASSCRED` before handing
    /// it back so every subsequent request on it carries peer credentials.
    pub fn accept(&self) -> std::io::Result<ChannelSocket> {
        let fd = rustix::net::accept_with(
            self,
            rustix::net::SocketFlags::NONBLOCK | rustix::net::SocketFlags::CLOEXEC,
        )
        .map_err(std::io::Error::from)?;
        fd::enable_passcred(&fd)?;
        Ok(ChannelSocket { fd })
    }
}

impl AsFd for ListenSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A single channel's full-duplex data socket: request frames flow in one
/// direction, response frames the other.
pub struct ChannelSocket {
    fd: OwnedFd,
}

impl ChannelSocket {
    pub fn from_owned(fd: OwnedFd) -> Self {
        ChannelSocket { fd }
    }

    pub fn into_owned(self) -> OwnedFd {
        self.fd
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Creates a connected pair of stream sockets for `PushChannel`: the
    /// server-side half is wrapped and returned ready to register with the
    /// readiness set, the client-side half is handed back as a raw owned fd
    /// for the caller to embed in a reply.
    pub fn socketpair() -> std::io::Result<(ChannelSocket, OwnedFd)> {
        let (a, b) = rustix::net::socketpair(
            rustix::net::AddressFamily::UNIX,
            rustix::net::SocketType::STREAM,
            rustix::net::SocketFlags::CLOEXEC | rustix::net::SocketFlags::NONBLOCK,
            None,
        )
        .map_err(std::io::Error::from)?;

        fd::enable_passcred(&a)?;

        Ok((ChannelSocket { fd: a }, b))
    }

    /// Reads one request frame. See [`recv_request`].
    #[allow(clippy::type_complexity)]
    pub fn recv_request(
        &self,
    ) -> std::io::Result<Option<(RequestHeader, PeerCredentials, Vec<OwnedFd>, Vec<ChannelInfo<OwnedFd>>)>> {
        recv_request(&self.fd)
    }

    /// Reads exactly `len` payload bytes following a request header.
    pub fn recv_payload(&self, len: usize) -> std::io::Result<Vec<u8>> {
        recv_payload(&self.fd, len)
    }

    /// Sends a response header together with the outgoing fd and channel-info
    /// lists as `SCM_RIGHTS` ancillary data.
    pub fn send_response_header(
        &self,
        header: &ResponseHeader,
        fds: &[BorrowedFd<'_>],
        channel_fds: &[BorrowedFd<'_>],
    ) -> std::io::Result<()> {
        send_header_with_fds(&self.fd, &header.to_bytes(), fds, channel_fds)
    }

    /// Sends a request header together with the outgoing fd and channel-info
    /// lists. Used by client-style callers (the demo binary's client mode).
    pub fn send_request_header(
        &self,
        header: &RequestHeader,
        fds: &[BorrowedFd<'_>],
        channel_fds: &[BorrowedFd<'_>],
    ) -> std::io::Result<()> {
        send_header_with_fds(&self.fd, &header.to_bytes(), fds, channel_fds)
    }

    /// Sends payload bytes following a header previously written by
    /// `send_response_header`/`send_request_header`.
    pub fn send_payload(&self, payload: &[u8]) -> std::io::Result<()> {
        send_payload(&self.fd, payload)
    }
}

impl AsFd for ChannelSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A short read/write on an otherwise-healthy stream: a truncated header, a
/// short ancillary block, or a short payload. `AF_UNIX`/`SOCK_STREAM` gives
/// no single-syscall delivery guarantee, so this is reserved for frames that
/// are genuinely malformed after accumulating as many bytes as the peer has
/// to offer — never for an ordinary short `recv` that a retry loop would
/// have completed.
fn framing_error(what: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, what)
}

/// Reads one request frame: the fixed header, its peer credentials via
/// `SCM_CREDENTIALS`, and any fds/channel-infos via `SCM_RIGHTS`.
///
/// Returns `Ok(None)` on a clean peer shutdown (zero bytes read before any
/// header byte arrives). A header that starts arriving but never completes
/// is a framing error, not a shutdown: it is accumulated across as many
/// `recv` calls as it takes, same as the ancillary-fd block and the payload.
///
/// Exposed as a free function (rather than only a `ChannelSocket` method) so
/// callers that only hold a borrowed fd — such as the endpoint operating
/// directly on a channel table entry — don't need to materialize ownership
/// just to read from it.
#[allow(clippy::type_complexity)]
pub fn recv_request(
    fd: impl AsFd,
) -> std::io::Result<Option<(RequestHeader, PeerCredentials, Vec<OwnedFd>, Vec<ChannelInfo<OwnedFd>>)>> {
    let fd = fd.as_fd();
    let mut header_buf = [0u8; RequestHeader::WIRE_LEN];
    let mut cmsg_space = vec![0u8; rustix::cmsg_space!(ScmRights(MAX_ANCILLARY_FDS), ScmCredentials(1))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);

    // Ancillary data is bound to whichever `recvmsg` call reads the first
    // byte of the sender's frame, so only the first call needs to pass the
    // control buffer; any remaining header bytes are plain stream bytes.
    let mut filled = 0;
    {
        let mut iov = [IoSliceMut::new(&mut header_buf)];
        let result = rustix::net::recvmsg(fd, &mut iov, &mut cmsg_buffer, RecvFlags::CMSG_CLOEXEC)
            .map_err(std::io::Error::from)?;
        filled += result.bytes;
    }
    if filled == 0 {
        return Ok(None);
    }
    while filled < header_buf.len() {
        let n = rustix::net::recv(fd, &mut header_buf[filled..], RecvFlags::empty())
            .map_err(std::io::Error::from)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled != RequestHeader::WIRE_LEN {
        return Err(framing_error("short read on request header"));
    }

    let mut fds = Vec::new();
    let mut cred = PeerCredentials::ABSENT;
    for msg in cmsg_buffer.drain() {
        match msg {
            RecvAncillaryMessage::ScmRights(incoming) => fds.extend(incoming),
            RecvAncillaryMessage::ScmCredentials(ucred) => {
                cred = PeerCredentials::from_ucred(ucred);
            }
            _ => {}
        }
    }

    let header = RequestHeader::from_bytes(&header_buf);

    let num_fds = header.num_fds as usize;
    let num_channels = header.num_channels as usize;
    if fds.len() < num_fds + num_channels * 2 {
        return Err(framing_error("short ancillary fd block"));
    }

    let mut remaining = fds;
    let mut tail = remaining.split_off(num_fds);
    let file_fds = remaining;
    let _extra = tail.split_off(num_channels * 2);
    let channel_part = tail;

    let mut channels = Vec::with_capacity(num_channels);
    let mut it = channel_part.into_iter();
    for _ in 0..num_channels {
        let data_fd = it.next().expect("counted above");
        let event_fd = it.next().expect("counted above");
        channels.push(ChannelInfo { data_fd, event_fd });
    }

    Ok(Some((header, cred, file_fds, channels)))
}

/// Reads exactly `len` payload bytes, accumulating across as many `recv`
/// calls as the peer delivers them in. See [`recv_request`] for why this is
/// a free function.
pub fn recv_payload(fd: impl AsFd, len: usize) -> std::io::Result<Vec<u8>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let fd = fd.as_fd();
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = rustix::net::recv(fd, &mut buf[filled..], RecvFlags::empty()).map_err(std::io::Error::from)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled != len {
        return Err(framing_error("short read on payload"));
    }
    Ok(buf)
}

/// Sends a header together with the outgoing fd and channel-info lists as
/// `SCM_RIGHTS` ancillary data. See [`recv_request`] for why this is a free
/// function.
pub fn send_header_with_fds(
    fd: impl AsFd,
    header_bytes: &[u8],
    fds: &[BorrowedFd<'_>],
    channel_fds: &[BorrowedFd<'_>],
) -> std::io::Result<()> {
    let iov = [IoSlice::new(header_bytes)];
    let mut cmsg_space = vec![0u8; rustix::cmsg_space!(ScmRights(MAX_ANCILLARY_FDS))];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);

    let mut combined: Vec<BorrowedFd<'_>> = Vec::with_capacity(fds.len() + channel_fds.len());
    if !fds.is_empty() || !channel_fds.is_empty() {
        combined.extend_from_slice(fds);
        combined.extend_from_slice(channel_fds);
        if !cmsg_buffer.push(SendAncillaryMessage::ScmRights(&combined)) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "failed to attach file descriptors to frame",
            ));
        }
    }

    let sent = rustix::net::sendmsg(fd.as_fd(), &iov, &mut cmsg_buffer, SendFlags::NOSIGNAL)
        .map_err(std::io::Error::from)?;
    if sent != header_bytes.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short write on frame header",
        ));
    }
    Ok(())
}

/// Sends payload bytes following a header previously written by
/// [`send_header_with_fds`].
pub fn send_payload(fd: impl AsFd, payload: &[u8]) -> std::io::Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    let sent = rustix::net::send(fd.as_fd(), payload, SendFlags::NOSIGNAL).map_err(std::io::Error::from)?;
    if sent != payload.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "short write on payload",
        ));
    }
    Ok(())
}

/// Wraps a raw fd received as a channel's data half (e.g. the client side of a
/// pushed pair, or an fd pulled out of ancillary data) as an owned fd.
///
/// # Safety
/// `raw` must be a valid, uniquely-owned file descriptor.
pub unsafe fn owned_from_raw(raw: RawFd) -> OwnedFd {
    OwnedFd::from_raw_fd(raw)
}
