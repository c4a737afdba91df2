//! 64-bit node addressing.
//!
//! One id space covers both backend service instances and client sessions
//! attached to a gateway. The top bit tells them apart:
//!
//! ```text
//! backend:  1 | service type (15 bits, 48..63) | 0 (32..48) | instance (0..32)
//! session:  0 | 0 (48..63)                     | gateway (32..48) | session (0..32)
//! ```
//!
//! Components that persist or log addresses must treat them as opaque `u64`
//! values with exactly this layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const BACKEND_BIT: u64 = 1 << 63;
const SERVICE_SHIFT: u32 = 48;
const GATEWAY_SHIFT: u32 = 32;
const LOW_MASK: u64 = 0xFFFF_FFFF;

/// Largest service type a backend address can carry
pub const MAX_SERVICE_TYPE: u16 = 0x7FFF;

/// Address of a backend instance or a gateway client session
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddress(u64);

impl NodeAddress {
    /// Unassigned address
    pub const NONE: NodeAddress = NodeAddress(0);

    /// Address of backend `instance` of `service_type`.
    ///
    /// `service_type` must not exceed [`MAX_SERVICE_TYPE`]; debug builds
    /// panic, release builds truncate to 15 bits. Use [`try_backend`] for
    /// untrusted input.
    ///
    /// [`try_backend`]: NodeAddress::try_backend
    pub const fn backend(service_type: u16, instance: u32) -> Self {
        debug_assert!(service_type <= MAX_SERVICE_TYPE, "service type exceeds 15 bits");
        let service = (service_type & MAX_SERVICE_TYPE) as u64;
        NodeAddress(BACKEND_BIT | (service << SERVICE_SHIFT) | instance as u64)
    }

    /// Like [`backend`](NodeAddress::backend), but `None` if `service_type`
    /// does not fit in 15 bits
    pub const fn try_backend(service_type: u16, instance: u32) -> Option<Self> {
        if service_type > MAX_SERVICE_TYPE {
            return None;
        }
        Some(Self::backend(service_type, instance))
    }

    /// Address of client `session_id` attached to gateway `gateway_id`
    pub const fn gateway_session(gateway_id: u16, session_id: u32) -> Self {
        NodeAddress(((gateway_id as u64) << GATEWAY_SHIFT) | session_id as u64)
    }

    /// Wrap a raw id
    pub const fn from_raw(raw: u64) -> Self {
        NodeAddress(raw)
    }

    /// Raw 64-bit id
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the unassigned address
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Whether this addresses a backend service instance
    pub const fn is_backend(self) -> bool {
        self.0 & BACKEND_BIT != 0
    }

    /// Whether this addresses a gateway client session
    pub const fn is_session(self) -> bool {
        !self.is_backend()
    }

    /// Service type of a backend address (0 for sessions)
    pub const fn service_type(self) -> u16 {
        if self.is_backend() {
            ((self.0 >> SERVICE_SHIFT) as u16) & MAX_SERVICE_TYPE
        } else {
            0
        }
    }

    /// Instance id of a backend address (0 for sessions)
    pub const fn instance_id(self) -> u32 {
        if self.is_backend() {
            (self.0 & LOW_MASK) as u32
        } else {
            0
        }
    }

    /// Gateway id of a session address (0 for backends)
    pub const fn gateway_id(self) -> u16 {
        if self.is_session() {
            (self.0 >> GATEWAY_SHIFT) as u16
        } else {
            0
        }
    }

    /// Session id of a session address (0 for backends)
    pub const fn session_id(self) -> u32 {
        if self.is_session() {
            (self.0 & LOW_MASK) as u32
        } else {
            0
        }
    }
}

impl From<u64> for NodeAddress {
    fn from(raw: u64) -> Self {
        NodeAddress(raw)
    }
}

impl From<NodeAddress> for u64 {
    fn from(addr: NodeAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_backend() {
            write!(f, "{:X}#{}", self.service_type(), self.instance_id())
        } else {
            write!(f, "G{}#{}", self.gateway_id(), self.session_id())
        }
    }
}

/// Error parsing a [`NodeAddress`] from its display form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node address: {0:?}")]
pub struct ParseNodeAddressError(String);

impl FromStr for NodeAddress {
    type Err = ParseNodeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseNodeAddressError(s.to_string());
        let (head, tail) = s.split_once('#').ok_or_else(invalid)?;
        let low: u32 = tail.parse().map_err(|_| invalid())?;

        if let Some(gateway) = head.strip_prefix('G') {
            let gateway: u16 = gateway.parse().map_err(|_| invalid())?;
            return Ok(NodeAddress::gateway_session(gateway, low));
        }

        let service = u16::from_str_radix(head, 16).map_err(|_| invalid())?;
        NodeAddress::try_backend(service, low).ok_or_else(invalid)
    }
}
