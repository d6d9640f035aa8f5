//! The radio stack is a platform capability: address assignment, pairing and the physical
//!  transport are out of scope. This module describes the four primitives the rest of the crate
//!  builds on - advertising a service, discovering peers, searching a peer for a service and
//!  opening / accepting connections - as traits, plus the data the platform hands back.

pub mod data_element;

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use crate::radio::data_element::DataElement;
use crate::status::Visibility;

pub const RFCOMM_PROTOCOL: u16 = 0x0003;
pub const L2CAP_PROTOCOL: u16 = 0x0100;
pub const PUBLIC_BROWSE_ROOT: u16 = 0x1002;

pub const ATTR_PROTOCOL_DESCRIPTOR_LIST: u16 = 0x0004;
pub const ATTR_BROWSE_GROUP_LIST: u16 = 0x0005;
pub const ATTR_SERVICE_NAME: u16 = 0x0100;
pub const ATTR_SERVICE_DESCRIPTION: u16 = 0x0101;
pub const ATTR_PROVIDER_NAME: u16 = 0x0102;

/// attributes requested in addition to the platform's defaults when searching a peer
pub const SEARCH_ATTRIBUTES: [u16; 2] = [ATTR_PROTOCOL_DESCRIPTOR_LIST, ATTR_SERVICE_NAME];

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// expand a 16-bit Bluetooth short identifier using the Bluetooth base UUID
pub fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}


/// 48-bit device address
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PeerAddress(pub [u8; 6]);
impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}
impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// class of device as reported during inquiry
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct DeviceClass(pub u32);
impl DeviceClass {
    pub fn major_device_class(&self) -> u32 {
        self.0 & 0x1f00
    }

    pub fn minor_device_class(&self) -> u32 {
        self.0 & 0xfc
    }
}

/// A peer found by device scan or known from earlier pairing. It is valid for one discovery run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerDescriptor {
    pub address: PeerAddress,
    pub device_class: DeviceClass,
    pub name: Option<String>,
}

/// A service record found on a peer. `connection_url` is what the platform derives from the
///  record by itself; it is not always usable, so the attribute tree is kept for a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub peer: PeerDescriptor,
    pub connection_url: Option<String>,
    pub attributes: BTreeMap<u16, DataElement>,
}
impl ServiceRecord {
    pub fn protocol_descriptor_list(&self) -> Option<&DataElement> {
        self.attributes.get(&ATTR_PROTOCOL_DESCRIPTOR_LIST)
    }
}

/// what the client role publishes
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAdvertisement {
    pub url: String,
    pub attributes: BTreeMap<u16, DataElement>,
}


pub type SearchId = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InquiryOutcome {
    Completed,
    Terminated,
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SearchOutcome {
    Completed,
    NoRecords,
    DeviceNotReachable,
    Terminated,
    Error,
}


/// Discovery results are delivered through these callbacks, possibly on a platform thread.
///  Implementations must not block.
pub trait DiscoveryListener: Send + Sync {
    fn device_discovered(&self, peer: PeerDescriptor);
    fn inquiry_completed(&self, outcome: InquiryOutcome);
    fn services_discovered(&self, search_id: SearchId, records: Vec<ServiceRecord>);
    fn service_search_completed(&self, search_id: SearchId, outcome: SearchOutcome);
}


pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// the underlying connection behind a pair of stream halves
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn close(&self) -> anyhow::Result<()>;
}

pub struct StreamConnection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub handle: Box<dyn ConnectionHandle>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PacketConnection: Send + Sync {
    fn receive_mtu(&self) -> usize;
    fn transmit_mtu(&self) -> usize;

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;
    /// receives exactly one message, returning its length. Messages longer than `buf` are
    ///  truncated by the platform.
    async fn receive(&self, buf: &mut [u8]) -> anyhow::Result<usize>;
    async fn close(&self) -> anyhow::Result<()>;
}

pub enum Connection {
    Stream(StreamConnection),
    Packet(Box<dyn PacketConnection>),
}
impl Connection {
    /// release the stream halves (if any), then the connection itself
    pub async fn close(self) -> anyhow::Result<()> {
        match self {
            Connection::Stream(stream) => {
                drop(stream.reader);
                drop(stream.writer);
                stream.handle.close().await
            }
            Connection::Packet(packet) => packet.close().await,
        }
    }
}
impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Stream(_) => write!(f, "Connection::Stream"),
            Connection::Packet(_) => write!(f, "Connection::Packet"),
        }
    }
}


#[async_trait]
pub trait Acceptor: Send + Sync {
    /// waits for the next inbound connection
    async fn accept(&self) -> anyhow::Result<Connection>;
    /// withdraws the service record
    async fn close(&self) -> anyhow::Result<()>;
}


#[async_trait]
pub trait Radio: Send + Sync + 'static {
    /// the platform's limit for simultaneous connections
    fn max_connections(&self) -> usize;

    fn set_discoverable(&self, visibility: Visibility) -> anyhow::Result<()>;

    /// peers that were paired or cached before, available without a device scan
    fn known_peers(&self) -> Vec<PeerDescriptor>;

    /// Starts a device scan. Results go to `listener`, and `inquiry_completed` is called exactly
    ///  once unless this returns an error.
    fn start_inquiry(&self, visibility: Visibility, listener: Arc<dyn DiscoveryListener>) -> anyhow::Result<()>;
    fn cancel_inquiry(&self) -> bool;

    /// Starts a service search on a single peer. `service_search_completed` is called exactly
    ///  once with the returned id unless this returns an error.
    fn search_services(&self, attributes: &[u16], uuids: &[Uuid], peer: &PeerDescriptor, listener: Arc<dyn DiscoveryListener>) -> anyhow::Result<SearchId>;
    fn cancel_service_search(&self, search_id: SearchId) -> bool;

    async fn open(&self, url: &str) -> anyhow::Result<Connection>;

    async fn advertise(&self, service: &ServiceAdvertisement) -> anyhow::Result<Box<dyn Acceptor>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bluetooth_uuid() {
        assert_eq!(bluetooth_uuid(RFCOMM_PROTOCOL).to_string(), "00000003-0000-1000-8000-00805f9b34fb");
        assert_eq!(bluetooth_uuid(PUBLIC_BROWSE_ROOT).to_string(), "00001002-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn test_peer_address_display() {
        let addr = PeerAddress([0x00, 0x50, 0xc0, 0x00, 0x32, 0x1b]);
        assert_eq!(addr.to_string(), "0050C000321B");
        assert_eq!(format!("{:?}", addr), "0050C000321B");
    }

    #[test]
    fn test_device_class() {
        let class = DeviceClass(0x5a020c);
        assert_eq!(class.major_device_class(), 0x0200);
        assert_eq!(class.minor_device_class(), 0x0c);
    }
}
