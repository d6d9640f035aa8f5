use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::LinkConfig;
use crate::connection::worker::ConnectionWorker;
use crate::discovery::collector::{DiscoveryCollector, DiscoveryEvent};
use crate::radio::{InquiryOutcome, PeerDescriptor, Radio, SearchOutcome, SEARCH_ATTRIBUTES};
use crate::status::{Status, Visibility};
use crate::transport::shared_buffer::SharedBuffer;


#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum PipelinePhase {
    Idle = 0,
    Discovering = 1,
    Finished = 2,
}


/// The server role: finds peers offering the service and keeps a pool of outbound links to them.
///
/// Discovery runs as a single background task going through strictly sequential phases:
///  * the local device is made non-discoverable
///  * previously paired peers are added (if configured)
///  * a device scan adds the peers it finds
///  * every peer is searched for the service, one search at a time, newest peer first
///  * free slots are filled from the service records found, newest first
///
/// Each slot owns one pair of buffers for the orchestrator's lifetime. The number of slots is
///  the smallest of the number of buffer pairs, the platform's connection limit and the
///  configured maximum.
pub struct DiscoveryOrchestrator {
    config: Arc<LinkConfig>,
    radio: Arc<dyn Radio>,
    workers: Arc<Vec<ConnectionWorker>>,
    collector: Arc<DiscoveryCollector>,
    phase: Arc<AtomicU8>,
    pipeline: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryOrchestrator {
    pub fn new(config: LinkConfig, radio: Arc<dyn Radio>, send_buffers: Vec<SharedBuffer>, recv_buffers: Vec<SharedBuffer>) -> anyhow::Result<DiscoveryOrchestrator> {
        config.validate()?;

        let num_slots = send_buffers.len()
            .min(recv_buffers.len())
            .min(radio.max_connections())
            .min(config.max_connections);

        let buffers = send_buffers.into_iter()
            .zip(recv_buffers)
            .take(num_slots)
            .collect::<Vec<_>>();
        check_buffers(&buffers)?;

        let config = Arc::new(config);
        let workers = buffers.into_iter()
            .enumerate()
            .map(|(slot, (send, recv))| ConnectionWorker::new(slot, config.clone(), send, recv))
            .collect::<Vec<_>>();

        debug!("discovery orchestrator with {} slots", workers.len());

        Ok(DiscoveryOrchestrator {
            config,
            radio,
            workers: Arc::new(workers),
            collector: Arc::new(DiscoveryCollector::new()),
            phase: Arc::new(AtomicU8::new(PipelinePhase::Idle.into())),
            pipeline: Mutex::new(None),
        })
    }

    /// Start a discovery run in the background. This fails if a run is in progress. Slots that
    ///  are still connected from an earlier run are kept, and only free slots are filled.
    pub async fn start(&self) -> anyhow::Result<()> {
        let previous = self.phase.swap(PipelinePhase::Discovering.into(), Ordering::AcqRel);
        if previous == u8::from(PipelinePhase::Discovering) {
            bail!("discovery is already running");
        }

        let config = self.config.clone();
        let radio = self.radio.clone();
        let collector = self.collector.clone();
        let workers = self.workers.clone();
        let phase = self.phase.clone();

        let pipeline = tokio::spawn(async move {
            let _finished = FinishOnDrop(phase);
            match run_pipeline(config, radio, collector, workers.clone()).await {
                Ok(()) => {
                    let connected = workers.iter().filter(|w| w.is_connected()).count();
                    info!("discovery finished with {} of {} slots connected", connected, workers.len());
                }
                Err(e) => {
                    warn!("discovery aborted: {}", e);
                }
            }
        });

        *self.pipeline_handle() = Some(pipeline);
        Ok(())
    }

    /// Cancel discovery if it is running, and close all slots. This never fails, and calling it
    ///  repeatedly is harmless.
    pub async fn close(&self) {
        if let Some(search_id) = self.collector.last_search_id() {
            self.radio.cancel_service_search(search_id);
        }
        self.radio.cancel_inquiry();
        self.collector.rendezvous().disarm();

        let pipeline = self.pipeline_handle().take();
        if let Some(pipeline) = pipeline {
            pipeline.abort();
            if let Err(e) = pipeline.await {
                if !e.is_cancelled() {
                    warn!("discovery task terminated abnormally: {}", e);
                }
            }
        }

        self.collector.reset();
        for worker in self.workers.iter() {
            worker.close().await;
        }
        self.phase.store(PipelinePhase::Idle.into(), Ordering::Release);
    }

    /// Any connected slot makes the orchestrator `Connected`, even while a re-run is still
    ///  discovering. Without connections, a running discovery is `Waiting`.
    pub fn status(&self) -> Status {
        if self.connection_size() > 0 {
            Status::Connected
        }
        else if self.is_discovering() {
            Status::Waiting
        }
        else {
            Status::Inactive
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.phase() == PipelinePhase::Discovering
    }

    /// Send slot `index`'s send buffer to its peer.
    pub async fn update(&self, index: usize) -> anyhow::Result<()> {
        match self.workers.get(index) {
            Some(worker) => worker.update().await,
            None => bail!("slot {} does not exist - there are {} slots", index, self.workers.len()),
        }
    }

    /// Send every connected slot's buffer, returning the number of successful sends.
    pub async fn update_all(&self) -> usize {
        let mut num_sent = 0;
        for worker in self.workers.iter().rev() {
            if worker.is_connected() && worker.update().await.is_ok() {
                num_sent += 1;
            }
        }
        num_sent
    }

    /// number of connected slots
    pub fn connection_size(&self) -> usize {
        self.workers.iter()
            .filter(|w| w.is_connected())
            .count()
    }

    /// number of slots
    pub fn max_connections(&self) -> usize {
        self.workers.len()
    }

    /// number of service records found in the current run
    pub fn discovered_size(&self) -> usize {
        self.collector.service_count()
    }

    /// number of peers found in the current run, including previously paired ones
    pub fn peer_count(&self) -> usize {
        self.collector.peer_count()
    }

    pub fn is_connected(&self, index: usize) -> bool {
        self.workers.get(index)
            .map(|w| w.is_connected())
            .unwrap_or(false)
    }

    pub fn slot_peer(&self, index: usize) -> Option<PeerDescriptor> {
        self.workers.get(index)?.peer()
    }

    pub fn slot_error_count(&self, index: usize) -> Option<u32> {
        self.workers.get(index)
            .map(|w| w.error_count())
    }

    /// sum of all slots' error counters
    pub fn error_count(&self) -> u32 {
        self.workers.iter()
            .map(|w| w.error_count())
            .fold(0, u32::saturating_add)
    }

    fn phase(&self) -> PipelinePhase {
        PipelinePhase::try_from(self.phase.load(Ordering::Acquire))
            .unwrap_or(PipelinePhase::Idle)
    }

    fn pipeline_handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


/// Marks the pipeline as finished when its task ends, whether it returns, panics or is aborted.
///  NB: `close()` overwrites this with `Idle` after awaiting the task.
struct FinishOnDrop(Arc<AtomicU8>);
impl Drop for FinishOnDrop {
    fn drop(&mut self) {
        self.0.store(PipelinePhase::Finished.into(), Ordering::Release);
    }
}


fn check_buffers(buffers: &[(SharedBuffer, SharedBuffer)]) -> anyhow::Result<()> {
    let all = buffers.iter()
        .flat_map(|(send, recv)| [send, recv])
        .collect::<Vec<_>>();

    for (i, a) in all.iter().enumerate() {
        if a.is_empty() {
            bail!("slot {} has an empty buffer", i / 2);
        }
        if all[i+1..].iter().any(|b| a.is_same(b)) {
            bail!("a buffer of slot {} is shared with another buffer", i / 2);
        }
    }
    Ok(())
}


#[instrument(skip_all)]
async fn run_pipeline(config: Arc<LinkConfig>, radio: Arc<dyn Radio>, collector: Arc<DiscoveryCollector>, workers: Arc<Vec<ConnectionWorker>>) -> anyhow::Result<()> {
    // we initiate all contact ourselves, there is no point in being found
    radio.set_discoverable(Visibility::NotDiscoverable)?;

    collector.reset();
    if config.use_known_peers {
        for peer in radio.known_peers() {
            collector.add_peer(peer);
        }
        debug!("{} previously paired peers", collector.peer_count());
    }

    scan_devices(&config, radio.as_ref(), &collector).await?;

    for peer in collector.peers().iter().rev() {
        search_services(&config, radio.as_ref(), &collector, peer).await?;
    }
    debug!("{} service records found", collector.service_count());

    fill_slots(radio.as_ref(), &collector, &workers).await;
    Ok(())
}

async fn scan_devices(config: &LinkConfig, radio: &dyn Radio, collector: &Arc<DiscoveryCollector>) -> anyhow::Result<()> {
    let completion = collector.rendezvous().arm()?;
    if let Err(e) = radio.start_inquiry(config.visibility, collector.clone()) {
        collector.rendezvous().disarm();
        return Err(e);
    }

    match completion.await {
        Ok(DiscoveryEvent::InquiryCompleted(InquiryOutcome::Terminated)) => bail!("device scan was cancelled"),
        Ok(DiscoveryEvent::InquiryCompleted(outcome)) => {
            // NB: a scan ending with an error still leaves us with the peers found so far
            debug!(?outcome, "device scan completed, {} peers", collector.peer_count());
            Ok(())
        }
        Ok(other) => bail!("expected device scan completion, got {:?}", other),
        Err(_) => bail!("discovery was cancelled during device scan"),
    }
}

async fn search_services(config: &LinkConfig, radio: &dyn Radio, collector: &Arc<DiscoveryCollector>, peer: &PeerDescriptor) -> anyhow::Result<()> {
    let completion = collector.rendezvous().arm()?;

    collector.search_starting();
    match radio.search_services(&SEARCH_ATTRIBUTES, &[config.service_uuid], peer, collector.clone()) {
        Ok(search_id) => {
            collector.search_started(search_id);
            debug!(search_id, address = %peer.address, "service search started");
        }
        Err(e) => {
            // an unreachable peer should not keep us from searching the others
            collector.search_failed();
            collector.rendezvous().disarm();
            debug!(address = %peer.address, "could not start service search: {}", e);
            return Ok(());
        }
    }

    match completion.await {
        Ok(DiscoveryEvent::SearchCompleted(_, SearchOutcome::Terminated)) => bail!("service search was cancelled"),
        Ok(DiscoveryEvent::SearchCompleted(search_id, outcome)) => {
            debug!(search_id, ?outcome, "service search completed");
            Ok(())
        }
        Ok(other) => bail!("expected service search completion, got {:?}", other),
        Err(_) => bail!("discovery was cancelled during service search"),
    }
}

async fn fill_slots(radio: &dyn Radio, collector: &DiscoveryCollector, workers: &[ConnectionWorker]) {
    for record in collector.services().iter().rev() {
        let already_connected = workers.iter()
            .any(|w| w.is_connected() && w.peer().map(|p| p.address) == Some(record.peer.address));
        if already_connected {
            debug!(address = %record.peer.address, "peer is connected already");
            continue;
        }

        let Some(worker) = workers.iter().find(|w| !w.is_connected()) else {
            debug!("all slots are in use");
            break;
        };

        match worker.open(radio, record).await {
            Ok(()) => info!(slot = worker.slot(), address = %record.peer.address, "connected"),
            Err(e) => debug!(slot = worker.slot(), address = %record.peer.address, "skipping service: {}", e),
        }
    }
}
