use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use uidomain_wire::{ChannelInfo, PeerCredentials};

use crate::error::{Error, Result};
use crate::id::ChannelId;

/// Names an entry in a message's outgoing fd list. Negative values are a
/// "no-fd" sentinel that passes through unchanged rather than indexing
/// anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileReference(i32);

impl FileReference {
    pub fn embedded(raw: i32) -> Self {
        FileReference(raw)
    }

    pub fn index(self) -> Option<usize> {
        (self.0 >= 0).then_some(self.0 as usize)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

/// Names an entry in a message's outgoing channel-info list. Same
/// pass-through convention as [`FileReference`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReference(i32);

impl ChannelReference {
    pub fn embedded(raw: i32) -> Self {
        ChannelReference(raw)
    }

    pub fn index(self) -> Option<usize> {
        (self.0 >= 0).then_some(self.0 as usize)
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

/// A client-side channel handle as understood by the collaborator Channel
/// Manager. The endpoint never constructs one's internals directly; it only
/// asks the manager to register the raw fds and hands back whatever token
/// the manager produces.
pub struct LocalChannelHandle {
    pub data_fd: OwnedFd,
    pub event_fd: OwnedFd,
}

/// The client-side channel registry, modeled as an injected collaborator so
/// tests can substitute a fake instead of reaching into process-wide state.
pub trait ChannelManager: Send + Sync {
    /// Builds a local handle from a freshly-received `(data_fd, event_fd)` pair.
    fn adopt(&self, data_fd: OwnedFd, event_fd: OwnedFd) -> LocalChannelHandle;

    /// Looks up the event fd backing an existing handle, for
    /// `PushChannelHandle`'s borrowed-handle variant. Borrowed from `handle`
    /// itself, not from the manager.
    fn event_fd_of<'a>(&self, handle: &'a LocalChannelHandle) -> Option<BorrowedFd<'a>>;
}

/// Scratch state for one in-flight message: the captured request, the
/// response under construction, pushed fds/channels, and a read cursor.
/// Owned by exactly one `Message` for its lifetime.
pub struct MessageState {
    request_data: Vec<u8>,
    read_cursor: usize,
    response_data: Vec<u8>,
    received_fds: Vec<Option<OwnedFd>>,
    received_channels: Vec<Option<ChannelInfo<OwnedFd>>>,
    outgoing_fds: Vec<OwnedFd>,
    outgoing_channels: Vec<ChannelInfo<OwnedFd>>,
    /// Locally-owned sockets (e.g. the client half of a pushed pair) that
    /// must survive until the reply has actually been transmitted.
    holding_area: Vec<OwnedFd>,
}

impl MessageState {
    pub(crate) fn new(
        request_data: Vec<u8>,
        received_fds: Vec<OwnedFd>,
        received_channels: Vec<ChannelInfo<OwnedFd>>,
    ) -> Self {
        MessageState {
            request_data,
            read_cursor: 0,
            response_data: Vec::new(),
            received_fds: received_fds.into_iter().map(Some).collect(),
            received_channels: received_channels.into_iter().map(Some).collect(),
            outgoing_fds: Vec::new(),
            outgoing_channels: Vec::new(),
            holding_area: Vec::new(),
        }
    }

    /// Reads payload bytes into `iov`, advancing the cursor. Returns the
    /// number of bytes copied; `0` once the cursor reaches the end.
    pub fn read_message_data(&mut self, iov: &mut [IoSliceMut<'_>]) -> usize {
        let remaining = &self.request_data[self.read_cursor..];
        let mut copied = 0;
        let mut src = remaining;
        for dst in iov.iter_mut() {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
            src = &src[n..];
            copied += n;
            if src.is_empty() {
                break;
            }
        }
        self.read_cursor += copied;
        copied
    }

    /// Appends payload bytes to the response buffer.
    pub fn write_message_data(&mut self, iov: &[IoSlice<'_>]) {
        for chunk in iov {
            self.response_data.extend_from_slice(chunk);
        }
    }

    pub fn response_payload(&self) -> &[u8] {
        &self.response_data
    }

    pub(crate) fn clear_response_payload(&mut self) {
        self.response_data.clear();
    }

    /// Transfers ownership of a previously-received fd out to the caller.
    /// Negative refs pass through unchanged. Out-of-range indices fail.
    pub fn get_file_handle(&mut self, reference: FileReference) -> Result<GetFileHandleResult> {
        let Some(index) = reference.index() else {
            return Ok(GetFileHandleResult::PassThrough(reference.raw()));
        };
        let slot = self.received_fds.get_mut(index).ok_or(Error::Invalid)?;
        let fd = slot.take().ok_or(Error::Invalid)?;
        Ok(GetFileHandleResult::Owned(fd))
    }

    /// Constructs a client-side handle for a previously-received channel-info
    /// entry via the Channel Manager collaborator. Negative refs pass through.
    pub fn get_channel_handle(
        &mut self,
        reference: ChannelReference,
        manager: &dyn ChannelManager,
    ) -> Result<GetChannelHandleResult> {
        let Some(index) = reference.index() else {
            return Ok(GetChannelHandleResult::PassThrough(reference.raw()));
        };
        let slot = self.received_channels.get_mut(index).ok_or(Error::Invalid)?;
        let info = slot.take().ok_or(Error::Invalid)?;
        let (data_fd, event_fd) = info.into_parts();
        Ok(GetChannelHandleResult::Owned(manager.adopt(data_fd, event_fd)))
    }

    /// Pushes an owned fd into the outgoing list, returning its reference.
    /// Passing `None` (an "empty" handle) passes its numeric value through.
    pub fn push_file_handle(&mut self, fd: Option<OwnedFd>, empty_value: i32) -> FileReference {
        match fd {
            None => FileReference::embedded(empty_value),
            Some(fd) => {
                let idx = self.outgoing_fds.len();
                self.outgoing_fds.push(fd);
                FileReference::embedded(idx as i32)
            }
        }
    }

    /// Pushes a channel described by a borrowed `(data_fd, event_fd)` pair,
    /// duplicating both so the outgoing list owns independent copies.
    pub fn push_channel_raw(&mut self, data_fd: BorrowedFd<'_>, event_fd: BorrowedFd<'_>) -> Result<ChannelReference> {
        let data_fd = data_fd.try_clone_to_owned().map_err(std::io::Error::from)?;
        let event_fd = event_fd.try_clone_to_owned().map_err(std::io::Error::from)?;
        let idx = self.outgoing_channels.len();
        self.outgoing_channels.push(ChannelInfo { data_fd, event_fd });
        Ok(ChannelReference::embedded(idx as i32))
    }

    /// Pushes a channel via an existing client-side handle, consulting the
    /// Channel Manager for its event fd. Fails if the handle is unknown.
    pub fn push_channel_handle(
        &mut self,
        handle: &LocalChannelHandle,
        manager: &dyn ChannelManager,
    ) -> Result<ChannelReference> {
        let event_fd = manager.event_fd_of(handle).ok_or(Error::Invalid)?;
        self.push_channel_raw(handle.data_fd.as_fd(), event_fd)
    }

    /// Pushes a channel identified only by a remote numeric reference: no
    /// allocation, the value is passed through as-is.
    pub fn push_channel_remote(&mut self, remote_reference: i32) -> ChannelReference {
        ChannelReference::embedded(remote_reference)
    }

    /// Stashes an owned fd so it outlives this message until the reply is
    /// actually transmitted (the kernel only duplicates an fd on `sendmsg`).
    pub(crate) fn hold_until_reply(&mut self, fd: OwnedFd) {
        self.holding_area.push(fd);
    }

    pub(crate) fn take_outgoing_fds(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.outgoing_fds)
    }

    pub(crate) fn take_outgoing_channels(&mut self) -> Vec<ChannelInfo<OwnedFd>> {
        std::mem::take(&mut self.outgoing_channels)
    }

    pub fn request_len(&self) -> usize {
        self.request_data.len()
    }
}

#[derive(Debug)]
pub enum GetFileHandleResult {
    Owned(OwnedFd),
    PassThrough(i32),
}

pub enum GetChannelHandleResult {
    Owned(LocalChannelHandle),
    PassThrough(i32),
}

/// Message-id sentinel carried by impulse requests, which have no reply.
pub const IMPULSE_MESSAGE_ID: u64 = 0;

/// Immutable header info for one dispatched message plus its mutable scratch
/// state.
pub struct Message {
    pub mid: u64,
    pub cid: ChannelId,
    pub op: i32,
    pub is_impulse: bool,
    pub max_recv_len: u32,
    pub credentials: PeerCredentials,
    /// Populated only when `is_impulse` is set.
    pub impulse_payload: Option<[u8; uidomain_wire::IMPULSE_PAYLOAD_LEN]>,
    /// The channel's registered state, taken out of the table. Only ever
    /// set on a synthesized `CHANNEL_CLOSE`; ordinary messages carry `None`
    /// since the channel is still live and the table keeps the slot.
    pub channel_state: Option<Box<dyn std::any::Any + Send>>,
    pub state: MessageState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn make_fd_pair() -> (OwnedFd, OwnedFd) {
        rustix::net::socketpair(
            rustix::net::AddressFamily::UNIX,
            rustix::net::SocketType::STREAM,
            rustix::net::SocketFlags::CLOEXEC,
            None,
        )
        .unwrap()
    }

    /// Adopts handles as-is and looks the event fd straight off them, so
    /// tests can assert a push/get round-trip without reaching into a real
    /// process-wide channel registry.
    struct FakeChannelManager;

    impl ChannelManager for FakeChannelManager {
        fn adopt(&self, data_fd: OwnedFd, event_fd: OwnedFd) -> LocalChannelHandle {
            LocalChannelHandle { data_fd, event_fd }
        }

        fn event_fd_of<'a>(&self, handle: &'a LocalChannelHandle) -> Option<BorrowedFd<'a>> {
            Some(handle.event_fd.as_fd())
        }
    }

    #[test]
    fn get_file_handle_negative_ref_passes_through() {
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let result = state.get_file_handle(FileReference::embedded(-7)).unwrap();
        assert!(matches!(result, GetFileHandleResult::PassThrough(-7)));
    }

    #[test]
    fn get_file_handle_out_of_range_is_invalid() {
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let err = state.get_file_handle(FileReference::embedded(0)).unwrap_err();
        assert!(matches!(err, Error::Invalid));
    }

    #[test]
    fn get_file_handle_transfers_ownership_and_cannot_be_taken_twice() {
        let (fd, _other) = make_fd_pair();
        let raw = fd.as_raw_fd();
        let mut state = MessageState::new(Vec::new(), vec![fd], Vec::new());

        let result = state.get_file_handle(FileReference::embedded(0)).unwrap();
        match result {
            GetFileHandleResult::Owned(got) => assert_eq!(got.as_raw_fd(), raw),
            GetFileHandleResult::PassThrough(_) => panic!("expected an owned fd"),
        }

        let err = state.get_file_handle(FileReference::embedded(0)).unwrap_err();
        assert!(matches!(err, Error::Invalid));
    }

    #[test]
    fn push_file_handle_empty_passes_value_through() {
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let reference = state.push_file_handle(None, -1);
        assert_eq!(reference.raw(), -1);
        assert!(state.take_outgoing_fds().is_empty());
    }

    #[test]
    fn push_file_handle_owned_appends_and_indexes() {
        let (fd, _other) = make_fd_pair();
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let reference = state.push_file_handle(Some(fd), -1);
        assert_eq!(reference.raw(), 0);
        assert_eq!(state.take_outgoing_fds().len(), 1);
    }

    #[test]
    fn get_channel_handle_negative_ref_passes_through() {
        let manager = FakeChannelManager;
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let result = state
            .get_channel_handle(ChannelReference::embedded(-3), &manager)
            .unwrap();
        assert!(matches!(result, GetChannelHandleResult::PassThrough(-3)));
    }

    #[test]
    fn get_channel_handle_round_trips_through_the_manager() {
        let (data_fd, _) = make_fd_pair();
        let (event_fd, _) = make_fd_pair();
        let data_raw = data_fd.as_raw_fd();
        let event_raw = event_fd.as_raw_fd();
        let manager = FakeChannelManager;

        let mut state = MessageState::new(Vec::new(), Vec::new(), vec![ChannelInfo { data_fd, event_fd }]);
        let result = state
            .get_channel_handle(ChannelReference::embedded(0), &manager)
            .unwrap();
        match result {
            GetChannelHandleResult::Owned(handle) => {
                assert_eq!(handle.data_fd.as_raw_fd(), data_raw);
                assert_eq!(handle.event_fd.as_raw_fd(), event_raw);
            }
            GetChannelHandleResult::PassThrough(_) => panic!("expected an owned handle"),
        }
    }

    #[test]
    fn push_channel_handle_consults_the_manager_for_the_event_fd() {
        let (data_fd, _) = make_fd_pair();
        let (event_fd, _) = make_fd_pair();
        let handle = LocalChannelHandle { data_fd, event_fd };
        let manager = FakeChannelManager;

        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let reference = state.push_channel_handle(&handle, &manager).unwrap();
        assert_eq!(reference.raw(), 0);
        assert_eq!(state.take_outgoing_channels().len(), 1);
    }

    #[test]
    fn push_channel_remote_passes_the_reference_through_unallocated() {
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        let reference = state.push_channel_remote(42);
        assert_eq!(reference.raw(), 42);
        assert!(state.take_outgoing_channels().is_empty());
    }

    #[test]
    fn read_message_data_advances_the_cursor_across_calls() {
        let mut state = MessageState::new(b"hello".to_vec(), Vec::new(), Vec::new());

        let mut first = [0u8; 3];
        {
            let mut iov = [IoSliceMut::new(&mut first)];
            assert_eq!(state.read_message_data(&mut iov), 3);
        }
        assert_eq!(&first, b"hel");

        let mut rest = [0u8; 2];
        {
            let mut iov = [IoSliceMut::new(&mut rest)];
            assert_eq!(state.read_message_data(&mut iov), 2);
        }
        assert_eq!(&rest, b"lo");
    }

    #[test]
    fn write_message_data_appends_to_the_response_buffer() {
        let mut state = MessageState::new(Vec::new(), Vec::new(), Vec::new());
        state.write_message_data(&[IoSlice::new(b"ab")]);
        state.write_message_data(&[IoSlice::new(b"cd")]);
        assert_eq!(state.response_payload(), b"abcd");
    }
}
