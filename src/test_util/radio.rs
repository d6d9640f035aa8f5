use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::radio::data_element::DataElement;
use crate::radio::*;
use crate::status::{TransportMode, Visibility};
use crate::test_util::connection::{packet_pair, stream_pair};

const FAKE_MTU: usize = 672;
const FAKE_STREAM_CAPACITY: usize = 1024;


/// convenience for test code: the same number always gives the same peer
pub fn test_peer(number: u8) -> PeerDescriptor {
    PeerDescriptor {
        address: PeerAddress([0, 0, 0, 0, 0, number]),
        device_class: DeviceClass(0x5a020c),
        name: Some(format!("peer-{}", number)),
    }
}

/// An RFCOMM service record on `peer` bound to `channel`. The platform URL (if present) differs
///  textually from the fallback URL built from the descriptor list.
pub fn test_service_record(peer: PeerDescriptor, channel: u8, with_platform_url: bool) -> ServiceRecord {
    let connection_url = with_platform_url
        .then(|| format!("btspp://{}:{};authenticate=false;encrypt=false;master=false", peer.address, channel));

    let mut attributes = BTreeMap::new();
    attributes.insert(ATTR_PROTOCOL_DESCRIPTOR_LIST, DataElement::Sequence(vec![
        DataElement::Sequence(vec![DataElement::Uuid(bluetooth_uuid(L2CAP_PROTOCOL))]),
        DataElement::Sequence(vec![DataElement::Uuid(bluetooth_uuid(RFCOMM_PROTOCOL)), DataElement::u8(channel)]),
    ]));
    attributes.insert(ATTR_SERVICE_NAME, DataElement::Text("radiolink".to_string()));

    ServiceRecord {
        peer,
        connection_url,
        attributes,
    }
}


/// An in-memory [Radio] for tests. Peers and their services are scripted up front, callbacks
///  are delivered from spawned tasks like a platform would, and every interaction is tracked for
///  later assertions.
///
/// This must be used inside a tokio runtime.
pub struct FakeRadio {
    mode: TransportMode,
    max_connections: usize,

    rejected_visibility: Mutex<Vec<Visibility>>,
    visibility_log: Mutex<Vec<Visibility>>,

    known_peers: Mutex<Vec<PeerDescriptor>>,
    inquiry_peers: Mutex<Vec<PeerDescriptor>>,
    services: Mutex<HashMap<PeerAddress, Vec<ServiceRecord>>>,

    inquiry_outcome: Mutex<InquiryOutcome>,
    hold_inquiry: AtomicBool,
    panic_on_inquiry: AtomicBool,
    held_inquiry: Mutex<Option<Arc<dyn DiscoveryListener>>>,
    num_inquiries: AtomicUsize,

    next_search_id: AtomicU32,
    outstanding_searches: Arc<AtomicUsize>,
    overlapping_searches: Arc<AtomicUsize>,
    searched_peers: Mutex<Vec<PeerAddress>>,
    cancelled_searches: Mutex<Vec<SearchId>>,

    /// `None` means every URL can be opened
    openable: Mutex<Option<Vec<String>>>,
    attempted_urls: Mutex<Vec<String>>,
    remotes: Mutex<Vec<(String, Connection)>>,

    fail_advertise: AtomicBool,
    advertisements: Mutex<Vec<ServiceAdvertisement>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Connection>>>,
    acceptor_closed: Arc<AtomicBool>,
}

impl FakeRadio {
    pub fn new(mode: TransportMode, max_connections: usize) -> FakeRadio {
        FakeRadio {
            mode,
            max_connections,
            rejected_visibility: Default::default(),
            visibility_log: Default::default(),
            known_peers: Default::default(),
            inquiry_peers: Default::default(),
            services: Default::default(),
            inquiry_outcome: Mutex::new(InquiryOutcome::Completed),
            hold_inquiry: Default::default(),
            panic_on_inquiry: Default::default(),
            held_inquiry: Default::default(),
            num_inquiries: Default::default(),
            next_search_id: AtomicU32::new(1),
            outstanding_searches: Default::default(),
            overlapping_searches: Default::default(),
            searched_peers: Default::default(),
            cancelled_searches: Default::default(),
            openable: Default::default(),
            attempted_urls: Default::default(),
            remotes: Default::default(),
            fail_advertise: Default::default(),
            advertisements: Default::default(),
            inbound: Default::default(),
            acceptor_closed: Default::default(),
        }
    }

    /// a peer that is found by device scan, offering `records`
    pub fn add_peer(&self, peer: PeerDescriptor, records: Vec<ServiceRecord>) {
        self.services.lock().unwrap().insert(peer.address, records);
        self.inquiry_peers.lock().unwrap().push(peer);
    }

    /// a peer that is only available as a previously paired device
    pub fn add_known_peer(&self, peer: PeerDescriptor, records: Vec<ServiceRecord>) {
        self.services.lock().unwrap().insert(peer.address, records);
        self.known_peers.lock().unwrap().push(peer);
    }

    pub fn reject_visibility(&self, visibility: Visibility) {
        self.rejected_visibility.lock().unwrap().push(visibility);
    }

    /// every successfully applied visibility mode, in order
    pub fn visibility_log(&self) -> Vec<Visibility> {
        self.visibility_log.lock().unwrap().clone()
    }

    pub fn set_inquiry_outcome(&self, outcome: InquiryOutcome) {
        *self.inquiry_outcome.lock().unwrap() = outcome;
    }

    /// the device scan does not complete until it is cancelled
    pub fn hold_inquiry(&self) {
        self.hold_inquiry.store(true, Ordering::Release);
    }

    /// simulates a platform bug: starting a device scan panics
    pub fn panic_on_inquiry(&self, panic: bool) {
        self.panic_on_inquiry.store(panic, Ordering::Release);
    }

    pub fn num_inquiries(&self) -> usize {
        self.num_inquiries.load(Ordering::Acquire)
    }

    pub fn searched_peers(&self) -> Vec<PeerAddress> {
        self.searched_peers.lock().unwrap().clone()
    }

    /// number of service searches that were started while another one was still running
    pub fn overlapping_searches(&self) -> usize {
        self.overlapping_searches.load(Ordering::Acquire)
    }

    pub fn cancelled_searches(&self) -> Vec<SearchId> {
        self.cancelled_searches.lock().unwrap().clone()
    }

    pub fn set_openable(&self, urls: Vec<String>) {
        *self.openable.lock().unwrap() = Some(urls);
    }

    pub fn attempted_urls(&self) -> Vec<String> {
        self.attempted_urls.lock().unwrap().clone()
    }

    pub fn num_opened(&self) -> usize {
        self.remotes.lock().unwrap().len()
    }

    /// the far end of a connection opened to `url`
    pub fn take_stream_remote(&self, url: &str) -> Option<StreamConnection> {
        match self.take_remote(url)? {
            Connection::Stream(s) => Some(s),
            Connection::Packet(_) => None,
        }
    }

    pub fn take_packet_remote(&self, url: &str) -> Option<Box<dyn PacketConnection>> {
        match self.take_remote(url)? {
            Connection::Packet(p) => Some(p),
            Connection::Stream(_) => None,
        }
    }

    fn take_remote(&self, url: &str) -> Option<Connection> {
        let mut remotes = self.remotes.lock().unwrap();
        let idx = remotes.iter().position(|(u, _)| u == url)?;
        Some(remotes.remove(idx).1)
    }

    pub fn set_advertise_failure(&self, fail: bool) {
        self.fail_advertise.store(fail, Ordering::Release);
    }

    pub fn advertisements(&self) -> Vec<ServiceAdvertisement> {
        self.advertisements.lock().unwrap().clone()
    }

    pub fn is_acceptor_closed(&self) -> bool {
        self.acceptor_closed.load(Ordering::Acquire)
    }

    /// Simulate a peer connecting to the advertised service, returning the peer's end
    pub fn connect_inbound(&self) -> anyhow::Result<Connection> {
        let (local, remote) = self.connection_pair();
        self.inbound.lock().unwrap().as_ref()
            .ok_or_else(|| anyhow!("no service advertised"))?
            .send(local)
            .map_err(|_| anyhow!("acceptor is gone"))?;
        Ok(remote)
    }

    fn connection_pair(&self) -> (Connection, Connection) {
        match self.mode {
            TransportMode::Stream => {
                let (a, b) = stream_pair(FAKE_STREAM_CAPACITY);
                (Connection::Stream(a), Connection::Stream(b))
            }
            TransportMode::Packet => {
                let (a, b) = packet_pair(FAKE_MTU);
                (Connection::Packet(Box::new(a)), Connection::Packet(Box::new(b)))
            }
        }
    }
}

#[async_trait]
impl Radio for FakeRadio {
    fn max_connections(&self) -> usize {
        self.max_connections
    }

    fn set_discoverable(&self, visibility: Visibility) -> anyhow::Result<()> {
        if self.rejected_visibility.lock().unwrap().contains(&visibility) {
            bail!("{:?} is not supported", visibility);
        }
        self.visibility_log.lock().unwrap().push(visibility);
        Ok(())
    }

    fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.known_peers.lock().unwrap().clone()
    }

    fn start_inquiry(&self, _visibility: Visibility, listener: Arc<dyn DiscoveryListener>) -> anyhow::Result<()> {
        self.num_inquiries.fetch_add(1, Ordering::AcqRel);
        if self.panic_on_inquiry.load(Ordering::Acquire) {
            panic!("device scan blew up");
        }
        let peers = self.inquiry_peers.lock().unwrap().clone();

        if self.hold_inquiry.load(Ordering::Acquire) {
            for peer in peers {
                listener.device_discovered(peer);
            }
            *self.held_inquiry.lock().unwrap() = Some(listener);
            return Ok(());
        }

        let outcome = *self.inquiry_outcome.lock().unwrap();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            for peer in peers {
                listener.device_discovered(peer);
            }
            listener.inquiry_completed(outcome);
        });
        Ok(())
    }

    fn cancel_inquiry(&self) -> bool {
        match self.held_inquiry.lock().unwrap().take() {
            Some(listener) => {
                listener.inquiry_completed(InquiryOutcome::Terminated);
                true
            }
            None => false,
        }
    }

    fn search_services(&self, _attributes: &[u16], _uuids: &[Uuid], peer: &PeerDescriptor, listener: Arc<dyn DiscoveryListener>) -> anyhow::Result<SearchId> {
        let search_id = self.next_search_id.fetch_add(1, Ordering::AcqRel);
        trace!("fake service search #{} on {}", search_id, peer.address);

        if self.outstanding_searches.fetch_add(1, Ordering::AcqRel) > 0 {
            self.overlapping_searches.fetch_add(1, Ordering::AcqRel);
        }
        self.searched_peers.lock().unwrap().push(peer.address);

        let records = self.services.lock().unwrap()
            .get(&peer.address)
            .cloned()
            .unwrap_or_default();
        let outstanding = self.outstanding_searches.clone();

        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let outcome = if records.is_empty() {
                SearchOutcome::NoRecords
            }
            else {
                listener.services_discovered(search_id, records);
                SearchOutcome::Completed
            };
            // the search is over before the completion is reported
            outstanding.fetch_sub(1, Ordering::AcqRel);
            listener.service_search_completed(search_id, outcome);
        });

        Ok(search_id)
    }

    fn cancel_service_search(&self, search_id: SearchId) -> bool {
        self.cancelled_searches.lock().unwrap().push(search_id);
        false
    }

    async fn open(&self, url: &str) -> anyhow::Result<Connection> {
        self.attempted_urls.lock().unwrap().push(url.to_string());

        let is_openable = self.openable.lock().unwrap().as_ref()
            .map(|urls| urls.iter().any(|u| u == url))
            .unwrap_or(true);
        if !is_openable {
            bail!("connection to {} refused", url);
        }

        let (local, remote) = self.connection_pair();
        self.remotes.lock().unwrap().push((url.to_string(), remote));
        Ok(local)
    }

    async fn advertise(&self, service: &ServiceAdvertisement) -> anyhow::Result<Box<dyn Acceptor>> {
        if self.fail_advertise.load(Ordering::Acquire) {
            bail!("service registration failed");
        }
        self.advertisements.lock().unwrap().push(service.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        self.acceptor_closed.store(false, Ordering::Release);

        Ok(Box::new(FakeAcceptor {
            inbound: tokio::sync::Mutex::new(rx),
            closed: self.acceptor_closed.clone(),
        }))
    }
}


struct FakeAcceptor {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Acceptor for FakeAcceptor {
    async fn accept(&self) -> anyhow::Result<Connection> {
        self.inbound.lock().await
            .recv().await
            .ok_or_else(|| anyhow!("acceptor is closed"))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
