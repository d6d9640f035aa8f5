use std::sync::{Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::discovery::rendezvous::Rendezvous;
use crate::radio::{DiscoveryListener, InquiryOutcome, PeerAddress, PeerDescriptor, SearchId, SearchOutcome, ServiceRecord};


/// what the discovery pipeline waits for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DiscoveryEvent {
    InquiryCompleted(InquiryOutcome),
    SearchCompleted(SearchId, SearchOutcome),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SearchState {
    Idle,
    /// `search_services` was called but has not returned the search id yet - callbacks can
    ///  overtake it
    Starting,
    Running(SearchId),
}

#[derive(Default)]
struct DiscoveryLists {
    peers: Vec<PeerDescriptor>,
    peer_addresses: FxHashSet<PeerAddress>,
    services: Vec<ServiceRecord>,
}


/// Collects the results of one discovery run from the platform's callbacks, and hands completion
///  events to the pipeline through a [Rendezvous].
///
/// Peers are deduplicated by address, and at most one service record is kept per peer. Callbacks
///  belonging to anything but the current service search are ignored.
pub struct DiscoveryCollector {
    lists: Mutex<DiscoveryLists>,
    search: Mutex<SearchState>,
    last_search_id: Mutex<Option<SearchId>>,
    rendezvous: Rendezvous<DiscoveryEvent>,
}
impl Default for DiscoveryCollector {
    fn default() -> Self {
        DiscoveryCollector {
            lists: Default::default(),
            search: Mutex::new(SearchState::Idle),
            last_search_id: Default::default(),
            rendezvous: Rendezvous::new(),
        }
    }
}

impl DiscoveryCollector {
    pub fn new() -> DiscoveryCollector {
        DiscoveryCollector::default()
    }

    pub fn rendezvous(&self) -> &Rendezvous<DiscoveryEvent> {
        &self.rendezvous
    }

    /// Discard all results of a previous run. Both lists are cleared under the same lock, so no
    ///  reader sees one of them cleared and the other one not.
    pub fn reset(&self) {
        *lock(&self.lists) = DiscoveryLists::default();
        *lock(&self.search) = SearchState::Idle;
    }

    /// returns `false` if a peer with the same address is already known
    pub fn add_peer(&self, peer: PeerDescriptor) -> bool {
        let mut lists = lock(&self.lists);
        if !lists.peer_addresses.insert(peer.address) {
            return false;
        }
        lists.peers.push(peer);
        true
    }

    /// peers in discovery order
    pub fn peers(&self) -> Vec<PeerDescriptor> {
        lock(&self.lists).peers.clone()
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.lists).peers.len()
    }

    /// service records in discovery order
    pub fn services(&self) -> Vec<ServiceRecord> {
        lock(&self.lists).services.clone()
    }

    pub fn service_count(&self) -> usize {
        lock(&self.lists).services.len()
    }

    /// Call this immediately before starting a service search.
    pub fn search_starting(&self) {
        *lock(&self.search) = SearchState::Starting;
    }

    /// Call this with the id returned from starting a service search.
    pub fn search_started(&self, search_id: SearchId) {
        *lock(&self.last_search_id) = Some(search_id);

        let mut search = lock(&self.search);
        if *search == SearchState::Starting {
            *search = SearchState::Running(search_id);
        }
    }

    pub fn search_failed(&self) {
        *lock(&self.search) = SearchState::Idle;
    }

    /// the id of the most recently started service search, for cancellation
    pub fn last_search_id(&self) -> Option<SearchId> {
        *lock(&self.last_search_id)
    }

    fn is_current_search(&self, search_id: SearchId) -> bool {
        let mut search = lock(&self.search);
        match *search {
            SearchState::Running(id) => id == search_id,
            SearchState::Starting => {
                *search = SearchState::Running(search_id);
                true
            }
            SearchState::Idle => false,
        }
    }
}

impl DiscoveryListener for DiscoveryCollector {
    fn device_discovered(&self, peer: PeerDescriptor) {
        let address = peer.address;
        if self.add_peer(peer) {
            debug!(%address, "peer discovered");
        }
    }

    fn inquiry_completed(&self, outcome: InquiryOutcome) {
        if !self.rendezvous.signal(DiscoveryEvent::InquiryCompleted(outcome)) {
            trace!(?outcome, "ignoring device scan completion nobody waits for");
        }
    }

    fn services_discovered(&self, search_id: SearchId, records: Vec<ServiceRecord>) {
        if !self.is_current_search(search_id) {
            trace!(search_id, "ignoring service records of a stale search");
            return;
        }

        // only the first record per callback, and only one per peer
        let Some(record) = records.into_iter().next() else {
            return;
        };

        let mut lists = lock(&self.lists);
        if lists.services.iter().any(|s| s.peer.address == record.peer.address) {
            return;
        }
        debug!(search_id, address = %record.peer.address, "service found");
        lists.services.push(record);
    }

    fn service_search_completed(&self, search_id: SearchId, outcome: SearchOutcome) {
        if !self.is_current_search(search_id) {
            trace!(search_id, "ignoring completion of a stale search");
            return;
        }
        *lock(&self.search) = SearchState::Idle;

        if !self.rendezvous.signal(DiscoveryEvent::SearchCompleted(search_id, outcome)) {
            trace!(search_id, ?outcome, "ignoring service search completion nobody waits for");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::radio::{test_peer, test_service_record};

    #[test]
    fn test_peers_are_deduplicated() {
        let collector = DiscoveryCollector::new();
        collector.device_discovered(test_peer(1));
        collector.device_discovered(test_peer(2));
        collector.device_discovered(test_peer(1));

        assert_eq!(collector.peers(), vec![test_peer(1), test_peer(2)]);
    }

    #[test]
    fn test_first_record_per_callback_is_kept() {
        let collector = DiscoveryCollector::new();
        collector.search_starting();
        collector.search_started(4);

        collector.services_discovered(4, vec![
            test_service_record(test_peer(1), 1, true),
            test_service_record(test_peer(1), 2, true),
        ]);
        collector.services_discovered(4, vec![test_service_record(test_peer(1), 3, true)]);

        assert_eq!(collector.services(), vec![test_service_record(test_peer(1), 1, true)]);
    }

    #[test]
    fn test_records_of_other_searches_are_ignored() {
        let collector = DiscoveryCollector::new();
        collector.services_discovered(1, vec![test_service_record(test_peer(1), 1, true)]);

        collector.search_starting();
        collector.search_started(2);
        collector.services_discovered(1, vec![test_service_record(test_peer(1), 1, true)]);

        assert_eq!(collector.service_count(), 0);
        assert_eq!(collector.last_search_id(), Some(2));
    }

    #[tokio::test]
    async fn test_completion_may_overtake_search_id() {
        let collector = DiscoveryCollector::new();
        let completion = collector.rendezvous().arm().unwrap();

        collector.search_starting();
        collector.services_discovered(7, vec![test_service_record(test_peer(3), 1, false)]);
        collector.service_search_completed(7, SearchOutcome::Completed);
        collector.search_started(7);

        assert_eq!(completion.await.unwrap(), DiscoveryEvent::SearchCompleted(7, SearchOutcome::Completed));
        assert_eq!(collector.service_count(), 1);
    }

    #[tokio::test]
    async fn test_inquiry_completion_is_handed_to_waiter() {
        let collector = DiscoveryCollector::new();
        let completion = collector.rendezvous().arm().unwrap();
        collector.inquiry_completed(InquiryOutcome::Error);
        assert_eq!(completion.await.unwrap(), DiscoveryEvent::InquiryCompleted(InquiryOutcome::Error));
    }

    #[test]
    fn test_reset_clears_everything() {
        let collector = DiscoveryCollector::new();
        collector.device_discovered(test_peer(1));
        collector.search_starting();
        collector.services_discovered(1, vec![test_service_record(test_peer(1), 1, true)]);

        collector.reset();
        assert_eq!(collector.peer_count(), 0);
        assert_eq!(collector.service_count(), 0);

        // a peer seen before the reset is new again
        assert!(collector.add_peer(test_peer(1)));
    }
}
