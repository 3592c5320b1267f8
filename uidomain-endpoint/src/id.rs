use std::fmt;
use std::num::NonZeroI32;

/// A channel identifier in `[1, i32::MAX]`. `0` is structurally unrepresentable,
/// matching the invariant that `0` is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(NonZeroI32);

impl ChannelId {
    pub(crate) fn new(value: i32) -> Option<Self> {
        NonZeroI32::new(value).map(ChannelId)
    }

    pub fn get(self) -> i32 {
        self.0.get()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}
