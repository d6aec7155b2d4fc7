//! Callchain contexts
//!
//! The kernel separates kernel, user and guest frames of one callchain with
//! marker entries. Replay uses them to pick the lookup domain for the frames
//! that follow and to label the boundaries in the resolved trace.

use syshud_common::{
    PERF_CONTEXT_GUEST, PERF_CONTEXT_GUEST_KERNEL, PERF_CONTEXT_GUEST_USER, PERF_CONTEXT_HV,
    PERF_CONTEXT_KERNEL, PERF_CONTEXT_USER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallchainContext {
    Hypervisor,
    Kernel,
    User,
    Guest,
    GuestKernel,
    GuestUser,
}

impl CallchainContext {
    /// Context switched to by marker `ip`; `None` for ordinary addresses and
    /// unknown markers
    #[must_use]
    pub fn from_marker(ip: u64) -> Option<Self> {
        match ip {
            PERF_CONTEXT_HV => Some(Self::Hypervisor),
            PERF_CONTEXT_KERNEL => Some(Self::Kernel),
            PERF_CONTEXT_USER => Some(Self::User),
            PERF_CONTEXT_GUEST => Some(Self::Guest),
            PERF_CONTEXT_GUEST_KERNEL => Some(Self::GuestKernel),
            PERF_CONTEXT_GUEST_USER => Some(Self::GuestUser),
            _ => None,
        }
    }

    /// Frame inserted where a trace leaves this context
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Hypervisor => "- - Hypervisor - -",
            Self::Kernel => "- - Kernel - -",
            Self::User => "- - User - -",
            Self::Guest => "- - Guest - -",
            Self::GuestKernel => "- - Guest Kernel - -",
            Self::GuestUser => "- - Guest User - -",
        }
    }
}
