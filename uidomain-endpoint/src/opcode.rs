/// First frame on a new channel. The reply's return code is re-interpreted
/// as a `FileReference` naming the pushed event fd rather than a status.
pub const CHANNEL_OPEN: i32 = 0;

/// Explicit or synthesized teardown request. The service's reply to this
/// message completes channel teardown; no wire I/O is performed for it.
pub const CHANNEL_CLOSE: i32 = -1;
