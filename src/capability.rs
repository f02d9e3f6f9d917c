//! Optional features an [`Allocator`](crate::Allocator) advertises.
use core::ops::BitOr;

/// A single optional allocator feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    /// The allocator can report the layout originally requested for a pointer.
    RequestedLayout = 1 << 0,
    /// The allocator can report the layout actually usable behind a pointer.
    UsableLayout = 1 << 1,
    /// The allocator can report the layout including its own overhead.
    AllocatedLayout = 1 << 2,
    /// The allocator can report the total amount of managed memory.
    Capacity = 1 << 3,
    /// The allocator can tell whether it owns a given pointer.
    Recognizes = 1 << 4,
}

/// A set of [`Capability`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);
impl Capabilities {
    /// The empty set.
    pub const NONE: Self = Self(0);

    /// Every capability a block allocator supports.
    pub const BLOCK_ALLOCATOR: Self = Self::NONE
        .with(Capability::RequestedLayout)
        .with(Capability::UsableLayout)
        .with(Capability::AllocatedLayout)
        .with(Capability::Capacity)
        .with(Capability::Recognizes);

    /// Add a capability to this set.
    #[must_use]
    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability as u32)
    }

    /// Check whether the given capability is part of this set.
    pub const fn has(self, capability: Capability) -> bool {
        self.0 & capability as u32 != 0
    }
}
impl From<Capability> for Capabilities {
    fn from(capability: Capability) -> Self {
        Self::NONE.with(capability)
    }
}
impl BitOr for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
impl BitOr<Capability> for Capabilities {
    type Output = Self;

    fn bitor(self, rhs: Capability) -> Self {
        self.with(rhs)
    }
}
impl BitOr for Capability {
    type Output = Capabilities;

    fn bitor(self, rhs: Self) -> Capabilities {
        Capabilities::from(self).with(rhs)
    }
}
