use std::any::Any;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Mutex;

use rustix::event::{eventfd, EventfdFlags};

use crate::error::{Error, Result};
use crate::id::ChannelId;

/// Owns a channel's event fd and the client-visible bit mask it last reported.
///
/// The event fd is a plain counter object; `current_bits` is a server-side
/// cache of whatever state bits the service last asked to be signalled, kept
/// here so re-arming or re-reading doesn't need a round trip to the client.
pub struct EventSet {
    event_fd: OwnedFd,
    current_bits: u64,
}

impl EventSet {
    fn new() -> Result<Self> {
        let event_fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK)?;
        Ok(EventSet {
            event_fd,
            current_bits: 0,
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.event_fd.as_fd()
    }

    pub fn current_bits(&self) -> u64 {
        self.current_bits
    }

    pub fn set_bits(&mut self, bits: u64) {
        self.current_bits = bits;
    }
}

/// Per-channel state owned by the channel table.
pub struct ChannelData {
    data_fd: OwnedFd,
    events: EventSet,
    /// Non-owning: service-supplied state registered via `set_channel_state`.
    /// The table only stores it; it never interprets or drops it specially.
    channel_state: Option<Box<dyn Any + Send>>,
}

impl ChannelData {
    pub fn data_fd(&self) -> BorrowedFd<'_> {
        self.data_fd.as_fd()
    }

    pub fn event_fd(&self) -> BorrowedFd<'_> {
        self.events.fd()
    }

    pub fn events(&self) -> &EventSet {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventSet {
        &mut self.events
    }

    pub fn channel_state(&self) -> Option<&(dyn Any + Send)> {
        self.channel_state.as_deref()
    }

    pub fn set_channel_state(&mut self, state: Box<dyn Any + Send>) {
        self.channel_state = Some(state);
    }

    pub fn take_channel_state(&mut self) -> Option<Box<dyn Any + Send>> {
        self.channel_state.take()
    }
}

struct Inner {
    channels: HashMap<ChannelId, ChannelData>,
    fd_to_id: HashMap<RawFd, ChannelId>,
    last_channel_id: i32,
}

/// The connection/channel table: maps channel id to channel socket fd and
/// per-channel state under a single mutex, as specified. Held for the
/// duration of registration and removal; never across wire I/O.
pub struct ChannelTable {
    inner: Mutex<Inner>,
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            inner: Mutex::new(Inner {
                channels: HashMap::new(),
                fd_to_id: HashMap::new(),
                last_channel_id: 0,
            }),
        }
    }

    /// Allocates a fresh id and registers `data_fd` under it, creating its
    /// event fd. Returns the new id.
    pub fn insert(&self, data_fd: OwnedFd) -> Result<ChannelId> {
        let events = EventSet::new()?;
        let raw = data_fd.as_raw_fd();

        let mut inner = self.inner.lock().unwrap();
        let id = Self::allocate_id(&mut inner);

        inner.channels.insert(
            id,
            ChannelData {
                data_fd,
                events,
                channel_state: None,
            },
        );
        inner.fd_to_id.insert(raw, id);

        Ok(id)
    }

    /// Increment-and-probe allocation: advance `last_channel_id`, wrapping
    /// `i32::MAX` back to `1`, until an id absent from the table is found.
    /// Never returns a live id, never returns `0`.
    fn allocate_id(inner: &mut Inner) -> ChannelId {
        loop {
            inner.last_channel_id += 1;
            if inner.last_channel_id == i32::MAX {
                inner.last_channel_id = 1;
            }

            let candidate = ChannelId::new(inner.last_channel_id).expect("non-zero by construction");
            if !inner.channels.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn remove(&self, id: ChannelId) -> Option<ChannelData> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner.channels.remove(&id)?;
        inner.fd_to_id.remove(&data.data_fd.as_raw_fd());
        Some(data)
    }

    pub fn lookup_by_fd(&self, fd: RawFd) -> Option<ChannelId> {
        let inner = self.inner.lock().unwrap();
        inner.fd_to_id.get(&fd).copied()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.inner.lock().unwrap().channels.contains_key(&id)
    }

    pub fn with_channel<R>(&self, id: ChannelId, f: impl FnOnce(&ChannelData) -> R) -> Result<R> {
        let inner = self.inner.lock().unwrap();
        let data = inner.channels.get(&id).ok_or(Error::Invalid)?;
        Ok(f(data))
    }

    pub fn with_channel_mut<R>(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut ChannelData) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner.channels.get_mut(&id).ok_or(Error::Invalid)?;
        Ok(f(data))
    }

    /// Copies out the raw data-fd number under the lock, releasing it before
    /// the caller does any wire I/O. Safe because a channel's fd cannot be
    /// closed while a message for it is in flight: the one-shot readiness
    /// discipline guarantees exclusive access per channel (see §5/§9).
    pub fn raw_data_fd(&self, id: ChannelId) -> Result<RawFd> {
        self.with_channel(id, |data| data.data_fd().as_raw_fd())
    }

    pub fn raw_event_fd(&self, id: ChannelId) -> Result<RawFd> {
        self.with_channel(id, |data| data.event_fd().as_raw_fd())
    }
}

impl Default for ChannelTable {
    fn default() -> Self {
        Self::new()
    }
}
