use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use rustix::event::{eventfd, EventfdFlags};
use uidomain_wire::{self as wire, ChannelInfo, ListenSocket, ResponseHeader};

use crate::error::{Error, Result};
use crate::id::ChannelId;
use crate::message::{ChannelReference, Message, MessageState, IMPULSE_MESSAGE_ID};
use crate::opcode;
use crate::readiness::{Event, Readiness};
use crate::table::ChannelTable;

/// Keys used to identify which fd a readiness event belongs to. Encoded to
/// and from `u64` for the epoll `data` field: `0` and `1` are reserved for
/// the listener and the cancellation eventfd, channel ids are offset by `2`
/// so they never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadinessKey {
    Listener,
    Cancel,
    Channel(ChannelId),
}

impl From<ReadinessKey> for u64 {
    fn from(key: ReadinessKey) -> u64 {
        match key {
            ReadinessKey::Listener => 0,
            ReadinessKey::Cancel => 1,
            ReadinessKey::Channel(id) => 2 + (id.get() as u32 as u64),
        }
    }
}

impl TryFrom<u64> for ReadinessKey {
    type Error = ();

    fn try_from(value: u64) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(ReadinessKey::Listener),
            1 => Ok(ReadinessKey::Cancel),
            other => {
                let raw = (other - 2) as u32 as i32;
                crate::id::ChannelId::new(raw).map(ReadinessKey::Channel).ok_or(())
            }
        }
    }
}

/// What `message_receive` produced for one readiness event.
enum ReceiveOutcome {
    Message(Message),
    /// The whole channel is gone; nothing further to hand the caller for it.
    Dropped,
}

/// The server-side endpoint: connection/channel table, readiness-driven
/// dispatch loop with one-shot rearming, and the reply path.
pub struct Endpoint {
    listener: ListenSocket,
    cancel_fd: OwnedFd,
    readiness: Readiness<ReadinessKey>,
    table: ChannelTable,
    next_message_id: AtomicU64,
    blocking: bool,
}

impl Endpoint {
    /// Creates a fresh `AF_UNIX` listening socket bound to `path`.
    pub fn bind(path: impl AsRef<Path>, blocking: bool) -> Result<Self> {
        let listener = ListenSocket::bind(path.as_ref())?;
        log::debug!("endpoint bound at {}", path.as_ref().display());
        Self::from_listener(listener, blocking)
    }

    /// Adopts a listening fd handed out by an init service instead of
    /// creating one. `registered_name` must be the name under which the
    /// fd was registered; `path` must begin with `/dev/socket/` per the
    /// init-fd adoption convention.
    pub fn adopt(fd: OwnedFd, path: impl AsRef<Path>, blocking: bool) -> Result<Self> {
        let path = path.as_ref();
        if !path.starts_with("/dev/socket/") {
            return Err(Error::Invalid);
        }
        let listener = ListenSocket::adopt(fd)?;
        log::debug!("endpoint adopted init-provided socket at {}", path.display());
        Self::from_listener(listener, blocking)
    }

    fn from_listener(listener: ListenSocket, blocking: bool) -> Result<Self> {
        let cancel_fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        let readiness = Readiness::new()?;
        readiness.add_oneshot(&listener, ReadinessKey::Listener)?;
        readiness.add_persistent(&cancel_fd, ReadinessKey::Cancel)?;

        Ok(Endpoint {
            listener,
            cancel_fd,
            readiness,
            table: ChannelTable::new(),
            next_message_id: AtomicU64::new(IMPULSE_MESSAGE_ID + 1),
            blocking,
        })
    }

    /// Writes `1` to the cancellation eventfd. Any `message_receive` blocked
    /// right now, or called in the future, returns `Shutdown` immediately.
    ///
    /// The eventfd is never drained internally: once cancelled, every future
    /// `message_receive` keeps returning `Shutdown` until some external party
    /// reads the eventfd down to zero, or the endpoint is dropped. This
    /// mirrors the source implementation's behaviour exactly; callers that
    /// need to resume after a cancel must build that externally.
    pub fn cancel(&self) -> Result<()> {
        let value: u64 = 1;
        let raw = self.cancel_fd.as_raw_fd();
        let buf = value.to_ne_bytes();
        let res = unsafe { libc::write(raw, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::WouldBlock {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Blocks (unless the endpoint was constructed non-blocking) until one
    /// readiness event is available, and turns it into exactly one `Message`.
    pub fn message_receive(&self) -> Result<Message> {
        let timeout = if self.blocking { None } else { Some(0) };

        loop {
            let event = self
                .readiness
                .wait_one(timeout)?
                .ok_or(Error::TimedOut)?;

            match event {
                Event::Ready(ReadinessKey::Cancel) => {
                    return Err(Error::Shutdown);
                }
                Event::Ready(ReadinessKey::Listener) => {
                    match self.accept_connection()? {
                        ReceiveOutcome::Message(msg) => return Ok(msg),
                        ReceiveOutcome::Dropped => continue,
                    }
                }
                Event::HangUp { key: ReadinessKey::Listener, .. } => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "listening socket hung up",
                    )));
                }
                Event::Error(ReadinessKey::Listener) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "listening socket error",
                    )));
                }
                Event::Ready(ReadinessKey::Channel(id)) => {
                    match self.receive_message_for_channel(id)? {
                        ReceiveOutcome::Message(msg) => return Ok(msg),
                        ReceiveOutcome::Dropped => continue,
                    }
                }
                Event::HangUp { key: ReadinessKey::Channel(id), .. }
                | Event::Error(ReadinessKey::Channel(id)) => match self.synthesize_channel_close(id) {
                    ReceiveOutcome::Message(msg) => return Ok(msg),
                    ReceiveOutcome::Dropped => continue,
                },
                Event::HangUp { key: ReadinessKey::Cancel, .. }
                | Event::Error(ReadinessKey::Cancel) => {
                    return Err(Error::Shutdown);
                }
            }
        }
    }

    /// Accepts a pending connection and immediately attempts to read its
    /// first frame, since CHANNEL_OPEN-as-first-request means the connect
    /// event and the first message event are the same event.
    ///
    /// The new channel fd is registered disarmed: its first frame is read
    /// out-of-band below, not off the readiness set, and it must not start
    /// reporting events until that first message's reply rearms it — a
    /// pipelined second request queued on the socket must not wake a second
    /// dispatcher while the first message is still in flight.
    fn accept_connection(&self) -> Result<ReceiveOutcome> {
        let channel = self.listener.accept()?;
        let fd = channel.into_owned();
        let id = self.table.insert(fd)?;

        self.table
            .with_channel(id, |data| self.readiness.add_disarmed(data.data_fd(), ReadinessKey::Channel(id)))??;

        self.readiness.rearm(&self.listener, ReadinessKey::Listener)?;

        log::debug!("accepted channel {id}");
        self.receive_message_for_channel(id)
    }

    /// Reads one request frame off `id`'s socket and turns it into either a
    /// `Message` or a synthesized `CHANNEL_CLOSE` outcome, per §4.6.
    fn receive_message_for_channel(&self, id: ChannelId) -> Result<ReceiveOutcome> {
        let raw_fd = match self.table.raw_data_fd(id) {
            Ok(raw) => raw,
            Err(_) => return Ok(ReceiveOutcome::Dropped),
        };
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };

        let frame = match wire::recv_request(borrowed) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(self.synthesize_channel_close(id)),
            Err(e) => {
                let err: Error = e.into();
                if matches!(err, Error::Shutdown) {
                    return Ok(self.synthesize_channel_close(id));
                }
                self.close_channel(id);
                return Err(err);
            }
        };

        let (header, cred, fds, channels) = frame;

        let payload = if header.is_impulse || header.send_len == 0 {
            Vec::new()
        } else {
            match wire::recv_payload(borrowed, header.send_len as usize) {
                Ok(p) => p,
                Err(e) => {
                    let err: Error = e.into();
                    if matches!(err, Error::Shutdown) {
                        return Ok(self.synthesize_channel_close(id));
                    }
                    self.close_channel(id);
                    return Err(err);
                }
            }
        };

        let mid = if header.is_impulse {
            IMPULSE_MESSAGE_ID
        } else {
            self.next_message_id.fetch_add(1, Ordering::Relaxed)
        };

        let message = Message {
            mid,
            cid: id,
            op: header.op,
            is_impulse: header.is_impulse,
            max_recv_len: header.max_recv_len,
            credentials: cred,
            impulse_payload: header.is_impulse.then_some(header.impulse_payload),
            channel_state: None,
            state: MessageState::new(payload, fds, channels),
        };

        if header.is_impulse {
            // Impulses are one-way: rearm right away instead of waiting for a reply.
            self.readiness.rearm(borrowed, ReadinessKey::Channel(id))?;
        }

        Ok(ReceiveOutcome::Message(message))
    }

    fn synthesize_channel_close(&self, id: ChannelId) -> ReceiveOutcome {
        log::debug!("channel {id} hung up, synthesizing CHANNEL_CLOSE");
        let channel_state = self
            .table
            .with_channel_mut(id, |data| data.take_channel_state())
            .ok()
            .flatten();
        let message = Message {
            mid: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            cid: id,
            op: opcode::CHANNEL_CLOSE,
            is_impulse: false,
            max_recv_len: 0,
            credentials: uidomain_wire::PeerCredentials::ABSENT,
            impulse_payload: None,
            channel_state,
            state: MessageState::new(Vec::new(), Vec::new(), Vec::new()),
        };
        ReceiveOutcome::Message(message)
    }

    fn close_channel(&self, id: ChannelId) {
        if let Some(data) = self.table.remove(id) {
            if let Err(e) = self.readiness.delete(data.data_fd()) {
                log::warn!("failed to unregister channel {id} from readiness set: {e}");
            }
        }
    }

    /// Creates a socketpair for `PushChannel`: registers the server-side half
    /// as a brand-new channel and stashes the client-side half in `message`'s
    /// holding area until the reply is transmitted. `_flags` is accepted and
    /// ignored; no flag semantics are currently defined.
    pub fn push_channel(&self, message: &mut Message, _flags: u32) -> Result<ChannelReference> {
        let (server_half, client_half) = wire::ChannelSocket::socketpair()?;
        let server_fd = server_half.into_owned();

        let new_id = self.table.insert(server_fd)?;
        self.table
            .with_channel(new_id, |data| self.readiness.add_oneshot(data.data_fd(), ReadinessKey::Channel(new_id)))??;

        let event_fd = self.table.with_channel(new_id, |data| {
            data.event_fd().try_clone_to_owned()
        })??;

        let reference = message.state.push_channel_raw(client_half.as_fd(), event_fd.as_fd())?;
        message.state.hold_until_reply(client_half);

        log::debug!("pushed new channel {new_id} into message {}", message.mid);
        Ok(reference)
    }

    /// Sends the reply for `message` and, except for the CHANNEL_CLOSE and
    /// rejected-CHANNEL_OPEN cases, rearms its channel fd.
    pub fn message_reply(&self, mut message: Message, return_code: i32) -> Result<()> {
        if message.op == opcode::CHANNEL_CLOSE {
            self.close_channel(message.cid);
            return Ok(());
        }

        if message.op == opcode::CHANNEL_OPEN && return_code < 0 {
            self.close_channel(message.cid);
            return Ok(());
        }

        let raw_fd = self.table.raw_data_fd(message.cid).map_err(|_| Error::BadFd)?;
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw_fd) };

        let mut return_code = return_code;
        if message.op == opcode::CHANNEL_OPEN {
            let event_fd = self.table.with_channel(message.cid, |data| data.event_fd().try_clone_to_owned())??;
            let reference = message.state.push_file_handle(Some(event_fd), -1);
            return_code = reference.raw();
            message.state.clear_response_payload();
        }

        let outgoing_fds = message.state.take_outgoing_fds();
        let outgoing_channels = message.state.take_outgoing_channels();
        let payload = message.state.response_payload().to_vec();

        let header = ResponseHeader {
            ret_code: return_code,
            recv_len: payload.len() as u32,
            num_fds: outgoing_fds.len() as u32,
            num_channels: outgoing_channels.len() as u32,
        };

        let fd_borrows: Vec<BorrowedFd<'_>> = outgoing_fds.iter().map(AsFd::as_fd).collect();
        let mut channel_borrows: Vec<BorrowedFd<'_>> = Vec::with_capacity(outgoing_channels.len() * 2);
        for ChannelInfo { data_fd, event_fd } in &outgoing_channels {
            channel_borrows.push(data_fd.as_fd());
            channel_borrows.push(event_fd.as_fd());
        }

        wire::send_header_with_fds(borrowed, &header.to_bytes(), &fd_borrows, &channel_borrows)?;
        wire::send_payload(borrowed, &payload)?;

        self.readiness.rearm(borrowed, ReadinessKey::Channel(message.cid))?;

        Ok(())
    }

    /// Pushes `fd` and replies with its reference as the return code.
    pub fn message_reply_fd(&self, mut message: Message, fd: OwnedFd) -> Result<()> {
        let reference = message.state.push_file_handle(Some(fd), -1);
        self.message_reply(message, reference.raw())
    }

    /// Pushes a channel described by a raw `(data_fd, event_fd)` pair and
    /// replies with its reference as the return code.
    pub fn message_reply_channel_raw(
        &self,
        mut message: Message,
        data_fd: BorrowedFd<'_>,
        event_fd: BorrowedFd<'_>,
    ) -> Result<()> {
        let reference = message.state.push_channel_raw(data_fd, event_fd)?;
        self.message_reply(message, reference.raw())
    }

    /// Pushes a channel via an existing client-side handle and replies with
    /// its reference as the return code.
    pub fn message_reply_channel_handle(
        &self,
        mut message: Message,
        handle: &crate::message::LocalChannelHandle,
        manager: &dyn crate::message::ChannelManager,
    ) -> Result<()> {
        let reference = message.state.push_channel_handle(handle, manager)?;
        self.message_reply(message, reference.raw())
    }

    /// Pushes a channel identified only by a remote numeric reference (no
    /// local allocation) and replies with it as the return code.
    pub fn message_reply_channel_remote(&self, mut message: Message, remote_reference: i32) -> Result<()> {
        let reference = message.state.push_channel_remote(remote_reference);
        self.message_reply(message, reference.raw())
    }

    pub fn get_channel_socket_fd(&self, id: ChannelId) -> Result<BorrowedFd<'_>> {
        // Returned as a raw-number borrow rebuilt against `self`'s lifetime:
        // valid for as long as the channel stays in the table, matching the
        // "borrow must not outlive the owner" rule from the design notes.
        let raw = self.table.raw_data_fd(id)?;
        Ok(unsafe { BorrowedFd::borrow_raw(raw) })
    }

    pub fn get_channel_event_fd(&self, id: ChannelId) -> Result<BorrowedFd<'_>> {
        let raw = self.table.raw_event_fd(id)?;
        Ok(unsafe { BorrowedFd::borrow_raw(raw) })
    }

    pub fn get_channel_id(&self, fd: BorrowedFd<'_>) -> Option<ChannelId> {
        self.table.lookup_by_fd(fd.as_raw_fd())
    }

    /// Reads the channel's registered state under the table lock, handing a
    /// borrow of it to `f`. `None` if nothing has been registered yet.
    pub fn get_channel_state<R>(
        &self,
        id: ChannelId,
        f: impl FnOnce(Option<&(dyn std::any::Any + Send)>) -> R,
    ) -> Result<R> {
        self.table.with_channel(id, |data| f(data.channel_state()))
    }

    pub fn set_channel_state(&self, id: ChannelId, state: Box<dyn std::any::Any + Send>) -> Result<()> {
        self.table.with_channel_mut(id, |data| data.set_channel_state(state))
    }

    /// No contract is defined for this operation; it always fails.
    pub fn check_channel(&self, _id: ChannelId) -> Result<()> {
        Err(Error::Fault)
    }

    pub fn socket_path(&self) -> Option<std::path::PathBuf> {
        self.listener.path_buf()
    }
}
