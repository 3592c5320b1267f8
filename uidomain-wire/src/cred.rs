/// Peer credentials received via `SCM_CREDENTIALS` on a request frame.
///
/// Negative `pid`/`uid`/`gid` (represented here as `-1`) marks the synthetic
/// credentials attached to a `CHANNEL_CLOSE` message, which has no real peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

impl PeerCredentials {
    /// The credentials attached to a synthesized message that has no real peer.
    pub const ABSENT: PeerCredentials = PeerCredentials {
        pid: -1,
        uid: u32::MAX,
        gid: u32::MAX,
    };

    pub(crate) fn from_ucred(cred: rustix::net::UCred) -> Self {
        PeerCredentials {
            pid: cred.pid.as_raw_nonzero().get(),
            uid: cred.uid.as_raw(),
            gid: cred.gid.as_raw(),
        }
    }
}
