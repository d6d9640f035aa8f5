use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::radio::{bluetooth_uuid, L2CAP_PROTOCOL, RFCOMM_PROTOCOL};


/// This is the smallest transfer unit every packet transport supports (the L2CAP minimum MTU).
///  Buffers up to this size work with any peer in packet mode.
pub const MIN_TRANSFER_UNIT: usize = 48;

/// Both peers must use the same transport mode. It is not negotiated.
pub const DEFAULT_TRANSPORT_MODE: TransportMode = TransportMode::Stream;


/// Coarse lifecycle status of an [crate::advertiser::Advertiser] or a
///  [crate::discovery::orchestrator::DiscoveryOrchestrator]. It is polled by the application, there are no
///  change notifications.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum Status {
    /// neither advertising nor discovering
    Inactive = 0,
    /// advertising or discovery in progress, no usable peer yet
    Waiting = 1,
    /// at least one link is open and its receive loop is running
    Connected = 2,
}
impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Inactive => write!(f, "inactive"),
            Status::Waiting => write!(f, "waiting for peers"),
            Status::Connected => write!(f, "connected"),
        }
    }
}


#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportMode {
    /// byte stream (RFCOMM): reads and writes always transfer the full buffer length
    Stream,
    /// datagrams (L2CAP): each send / receive transfers exactly one message
    Packet,
}
impl TransportMode {
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportMode::Stream => "btspp",
            TransportMode::Packet => "btl2cap",
        }
    }

    /// the protocol identifier that a peer's protocol descriptor list binds the port to
    pub fn protocol_uuid(&self) -> Uuid {
        match self {
            TransportMode::Stream => bluetooth_uuid(RFCOMM_PROTOCOL),
            TransportMode::Packet => bluetooth_uuid(L2CAP_PROTOCOL),
        }
    }

    /// RFCOMM channels are advertised as 1-byte integers, L2CAP PSMs as 2-byte integers
    pub fn port_width(&self) -> IntWidth {
        match self {
            TransportMode::Stream => IntWidth::U8,
            TransportMode::Packet => IntWidth::U16,
        }
    }

    /// NB: PSMs are written in hex in connection URLs, RFCOMM channels in decimal
    pub fn format_port(&self, port: u16) -> String {
        match self {
            TransportMode::Stream => format!("{}", port),
            TransportMode::Packet => format!("{:04X}", port),
        }
    }
}


#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum IntWidth {
    U8,
    U16,
    U32,
    U64,
}


/// Discoverability of the local device. The 'narrow' mode corresponds to limited inquiry
///  (LIAC), 'wide' to general inquiry (GIAC).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Visibility {
    NotDiscoverable,
    Narrow,
    Wide,
}
impl Visibility {
    /// the mode to try if the platform rejects this one
    pub fn fallback(&self) -> Option<Visibility> {
        match self {
            Visibility::Wide => Some(Visibility::Narrow),
            Visibility::Narrow | Visibility::NotDiscoverable => None,
        }
    }
}
