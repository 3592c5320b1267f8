//! A one-shot, level-triggered readiness set built on epoll.
//!
//! Every armed registration uses `EPOLLONESHOT` + `EPOLLRDHUP`, and the only
//! way to make a fd reportable again is the explicit `rearm` call, because
//! one-shot readiness is the endpoint's sole per-channel concurrency
//! primitive: a channel fd cannot be readable to two callers at once. A
//! freshly accepted channel is added disarmed instead, since its first frame
//! is read directly rather than off the readiness set.

use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};

use rustix::event::epoll::{self, EventData, EventFlags};

use crate::error::Result;

/// One readiness notification.
pub enum Event<K> {
    /// Readable (and not simultaneously hung up).
    Ready(K),
    /// Peer hung up (`EPOLLRDHUP`/`EPOLLHUP`), possibly along with data still
    /// pending; callers that care about ordering check `readable` too.
    HangUp { key: K, readable: bool },
    Error(K),
}

/// # Panics
/// Conversion back from the raw `u64` key must always round-trip; violating
/// that is a programming error in the caller, not a runtime condition.
pub struct Readiness<K> {
    epoll_fd: OwnedFd,
    _key: PhantomData<K>,
}

impl<K> Readiness<K> {
    pub fn new() -> Result<Self> {
        Ok(Readiness {
            epoll_fd: epoll::create(epoll::CreateFlags::CLOEXEC)?,
            _key: PhantomData,
        })
    }
}

impl<K: Into<u64>> Readiness<K> {
    /// Registers `file` one-shot for readable + hangup. Must not be called
    /// twice for the same fd without an intervening `delete`.
    pub fn add_oneshot(&self, file: impl AsFd, key: K) -> Result<()> {
        epoll::add(
            &self.epoll_fd,
            file.as_fd(),
            EventData::new_u64(key.into()),
            EventFlags::IN | EventFlags::RDHUP | EventFlags::ONESHOT,
        )?;
        Ok(())
    }

    /// Registers `file` persistently (no one-shot), used only for the
    /// cancellation eventfd.
    pub fn add_persistent(&self, file: impl AsFd, key: K) -> Result<()> {
        epoll::add(
            &self.epoll_fd,
            file.as_fd(),
            EventData::new_u64(key.into()),
            EventFlags::IN,
        )?;
        Ok(())
    }

    /// Registers `file` present in the set but reporting no events at all,
    /// for a freshly accepted channel whose first frame is read out-of-band
    /// before the dispatch loop ever sees it ready. `rearm` is the only way
    /// to start it reporting, matching the discipline that a channel fd is
    /// disarmed for the whole lifetime of an in-flight message.
    pub fn add_disarmed(&self, file: impl AsFd, key: K) -> Result<()> {
        epoll::add(
            &self.epoll_fd,
            file.as_fd(),
            EventData::new_u64(key.into()),
            EventFlags::empty(),
        )?;
        Ok(())
    }

    /// The only operation permitted to resurrect a one-shot fd in the set.
    pub fn rearm(&self, file: impl AsFd, key: K) -> Result<()> {
        epoll::modify(
            &self.epoll_fd,
            file.as_fd(),
            EventData::new_u64(key.into()),
            EventFlags::IN | EventFlags::RDHUP | EventFlags::ONESHOT,
        )?;
        Ok(())
    }
}

impl<K> Readiness<K> {
    pub fn delete(&self, file: impl AsFd) -> Result<()> {
        epoll::delete(&self.epoll_fd, file.as_fd())?;
        Ok(())
    }
}

impl<K: TryFrom<u64>> Readiness<K> {
    /// Blocks until one event is available (or, if `timeout_ms` is
    /// `Some(0)`, returns immediately with `None`). Requests exactly one
    /// event per syscall so the dispatch loop's "one event per
    /// `MessageReceive` call" rule holds even when several fds are ready at
    /// once.
    pub fn wait_one(&self, timeout_ms: Option<i32>) -> Result<Option<Event<K>>> {
        let mut slot: MaybeUninit<libc::epoll_event> = MaybeUninit::uninit();
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                &mut slot as *mut _ as *mut libc::epoll_event,
                1,
                timeout_ms.unwrap_or(-1),
            )
        };
        if num_events < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if num_events == 0 {
            return Ok(None);
        }

        let event = unsafe { slot.assume_init() };
        let flags = event.events as i32;
        let key: K = match event.u64.try_into() {
            Ok(key) => key,
            Err(_) => panic!("failed to convert an epoll key back from u64"),
        };

        if flags & libc::EPOLLERR != 0 {
            return Ok(Some(Event::Error(key)));
        }
        if flags & (libc::EPOLLRDHUP | libc::EPOLLHUP) != 0 {
            return Ok(Some(Event::HangUp {
                key,
                readable: flags & libc::EPOLLIN != 0,
            }));
        }
        Ok(Some(Event::Ready(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::event::{eventfd, EventfdFlags};

    /// A minimal `Into<u64>`/`TryFrom<u64>` key, standing in for the
    /// endpoint's private `ReadinessKey` to exercise the generic round trip
    /// `wait_one` relies on without reaching into another module's types.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TestKey(u64);

    impl From<TestKey> for u64 {
        fn from(key: TestKey) -> u64 {
            key.0
        }
    }

    impl TryFrom<u64> for TestKey {
        type Error = ();
        fn try_from(value: u64) -> std::result::Result<Self, ()> {
            Ok(TestKey(value))
        }
    }

    fn bump(fd: &OwnedFd) {
        let buf = 1u64.to_ne_bytes();
        let res = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len()) };
        assert_eq!(res as usize, buf.len());
    }

    #[test]
    fn oneshot_key_round_trips_and_disarms_after_one_event() {
        let readiness: Readiness<TestKey> = Readiness::new().unwrap();
        let event_fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap();
        readiness.add_oneshot(&event_fd, TestKey(7)).unwrap();
        bump(&event_fd);

        let event = readiness.wait_one(Some(0)).unwrap().expect("event should be ready");
        match event {
            Event::Ready(key) => assert_eq!(key, TestKey(7)),
            _ => panic!("expected a plain Ready event"),
        }

        // The eventfd is still readable (never drained), but the one-shot
        // registration must not report it again until an explicit rearm.
        assert!(readiness.wait_one(Some(0)).unwrap().is_none());
    }

    #[test]
    fn rearm_makes_a_disarmed_fd_reportable_again() {
        let readiness: Readiness<TestKey> = Readiness::new().unwrap();
        let event_fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap();
        readiness.add_disarmed(&event_fd, TestKey(3)).unwrap();
        bump(&event_fd);

        assert!(
            readiness.wait_one(Some(0)).unwrap().is_none(),
            "a disarmed fd must not report, even while readable"
        );

        readiness.rearm(&event_fd, TestKey(3)).unwrap();
        let event = readiness.wait_one(Some(0)).unwrap().expect("event should be ready after rearm");
        match event {
            Event::Ready(key) => assert_eq!(key, TestKey(3)),
            _ => panic!("expected a plain Ready event"),
        }
    }

    #[test]
    fn delete_stops_reporting_entirely() {
        let readiness: Readiness<TestKey> = Readiness::new().unwrap();
        let event_fd = eventfd(0, EventfdFlags::CLOEXEC | EventfdFlags::NONBLOCK).unwrap();
        readiness.add_persistent(&event_fd, TestKey(1)).unwrap();
        bump(&event_fd);
        readiness.delete(&event_fd).unwrap();

        assert!(readiness.wait_one(Some(0)).unwrap().is_none());
    }
}
