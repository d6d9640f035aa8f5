use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::connection::error_counter::ErrorCounter;
use crate::connection::port_resolver::resolve_port;
use crate::connection::url::peer_url;
use crate::radio::{Connection, PeerDescriptor, Radio, ServiceRecord};
use crate::transport::link::TransportLink;
use crate::transport::shared_buffer::SharedBuffer;


/// A [ConnectionWorker] owns the lifetime of one link to a peer, and it owns the buffers for that
///  link. It can be opened, closed and re-opened any number of times, always transferring the
///  same buffers.
///
/// While open, a background task receives into the receive buffer. Every transfer failure
///  (in either direction) increments the error counter, and every success resets it. The receive
///  loop drops the link when the counter exceeds the configured threshold.
///
/// The server role dials out with [ConnectionWorker::open], the client role hands in a link it
///  accepted with [ConnectionWorker::attach]. Everything after that is the same for both.
pub struct ConnectionWorker {
    slot: usize,
    config: Arc<LinkConfig>,
    send_buffer: SharedBuffer,
    recv_buffer: SharedBuffer,
    errors: Arc<ErrorCounter>,
    session: Mutex<Option<Session>>,
}

/// one open link and its receive loop
struct Session {
    link: Arc<TransportLink>,
    running: Arc<AtomicBool>,
    peer: Option<PeerDescriptor>,
    receive_task: JoinHandle<()>,
}
impl Session {
    fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.link.is_closed()
    }
}

impl ConnectionWorker {
    pub fn new(slot: usize, config: Arc<LinkConfig>, send_buffer: SharedBuffer, recv_buffer: SharedBuffer) -> ConnectionWorker {
        ConnectionWorker {
            slot,
            config,
            send_buffer,
            recv_buffer,
            errors: Default::default(),
            session: Mutex::new(None),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn send_buffer(&self) -> &SharedBuffer {
        &self.send_buffer
    }

    pub fn recv_buffer(&self) -> &SharedBuffer {
        &self.recv_buffer
    }

    pub fn is_connected(&self) -> bool {
        self.session().as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    pub fn error_count(&self) -> u32 {
        self.errors.get()
    }

    /// the peer of the current (or most recent) link, if it was dialed from a service record
    pub fn peer(&self) -> Option<PeerDescriptor> {
        self.session().as_ref()
            .and_then(|s| s.peer.clone())
    }

    /// Connect to the service described by `record` and start receiving. If this fails, the
    ///  worker is left as it was.
    pub async fn open(&self, radio: &dyn Radio, record: &ServiceRecord) -> anyhow::Result<()> {
        if self.is_connected() {
            bail!("slot {} is already connected", self.slot);
        }

        let connection = self.connect(radio, record).await?;
        self.attach(connection, Some(record.peer.clone())).await
    }

    /// The URL the platform derives from a service record is not reliable for all peers. If it
    ///  is missing or does not work, the URL is rebuilt from the peer's address and the port
    ///  bound to our transport protocol in the record's protocol descriptor list.
    async fn connect(&self, radio: &dyn Radio, record: &ServiceRecord) -> anyhow::Result<Connection> {
        let mode = self.config.transport_mode;
        let address = record.peer.address;

        match &record.connection_url {
            Some(url) => {
                match radio.open(url).await {
                    Ok(connection) => {
                        debug!(slot = self.slot, %address, "connected via platform URL {}", url);
                        return Ok(connection);
                    }
                    Err(e) => {
                        debug!(slot = self.slot, %address, "platform URL {} failed, falling back to descriptor list: {}", url, e);
                    }
                }
            }
            None => {
                debug!(slot = self.slot, %address, "no platform URL, falling back to descriptor list");
            }
        }

        let port = record.protocol_descriptor_list()
            .and_then(|root| resolve_port(root, mode.protocol_uuid(), mode.port_width()))
            .ok_or_else(|| anyhow!("service record of {} has no {} port", address, mode.scheme()))?;

        let url = peer_url(mode, address, port);
        match radio.open(&url).await {
            Ok(connection) => {
                debug!(slot = self.slot, %address, "connected via fallback URL {}", url);
                Ok(connection)
            }
            Err(e) => {
                Err(anyhow!("connecting to {} failed with both platform and fallback URL {}: {}", address, url, e))
            }
        }
    }

    /// Take over an already open connection and start receiving. A connection that does not fit
    ///  the transport mode or the buffers is closed.
    pub async fn attach(&self, connection: Connection, peer: Option<PeerDescriptor>) -> anyhow::Result<()> {
        let link = TransportLink::new(
            connection,
            self.config.transport_mode,
            self.send_buffer.clone(),
            self.recv_buffer.clone(),
            self.config.write_timeout,
        ).await?;

        // a previous link may have been dropped by its receive loop - clean up before reuse
        self.close().await;

        let link = Arc::new(link);
        let running = Arc::new(AtomicBool::new(true));
        self.errors.reset();
        let receive_task = tokio::spawn(receive_loop(
            self.slot,
            link.clone(),
            running.clone(),
            self.errors.clone(),
            self.config.error_threshold,
        ));

        info!(slot = self.slot, peer = ?peer.as_ref().map(|p| p.address), "link established");
        *self.session() = Some(Session {
            link,
            running,
            peer,
            receive_task,
        });
        Ok(())
    }

    /// Send the send buffer's current contents. A failure is counted, but the link is only ever
    ///  dropped by the receive loop.
    pub async fn update(&self) -> anyhow::Result<()> {
        let link = self.session().as_ref()
            .filter(|s| s.is_connected())
            .map(|s| s.link.clone());
        let Some(link) = link else {
            bail!("slot {} is not connected", self.slot);
        };

        match link.send().await {
            Ok(()) => {
                self.errors.record_success();
                Ok(())
            }
            Err(e) => {
                let num_errors = self.errors.record_failure();
                debug!(slot = self.slot, num_errors, "send failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the receive loop and release the link. This is safe to call repeatedly and on a
    ///  worker that was never opened.
    pub async fn close(&self) {
        let session = self.session().take();
        if let Some(session) = session {
            session.running.store(false, Ordering::Release);
            session.link.close().await;

            // the loop notices the closed link on its current or next receive
            if let Err(e) = session.receive_task.await {
                if !e.is_cancelled() {
                    warn!(slot = self.slot, "receive loop terminated abnormally: {}", e);
                }
            }
            debug!(slot = self.slot, "link closed");
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


async fn receive_loop(slot: usize, link: Arc<TransportLink>, running: Arc<AtomicBool>, errors: Arc<ErrorCounter>, error_threshold: u32) {
    debug!(slot, "starting receive loop");

    while running.load(Ordering::Acquire) {
        match link.receive().await {
            Ok(_) => {
                errors.record_success();
            }
            Err(_) if !running.load(Ordering::Acquire) || link.is_closed() => {
                // closed by close() or by a send that gave up halfway, the failure was counted there
                break;
            }
            Err(e) => {
                let num_errors = errors.record_failure();
                trace!(slot, num_errors, "receive failed: {}", e);
                if errors.exceeds(error_threshold) {
                    warn!(slot, "{} consecutive transfer errors, dropping the link", num_errors);
                    break;
                }
            }
        }
    }

    running.store(false, Ordering::Release);
    link.close().await;
    debug!(slot, "receive loop terminated");
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{MockPacketConnection, PacketConnection};
    use crate::status::TransportMode;
    use crate::test_util::connection::ScriptedPacketConnection;
    use crate::test_util::radio::{test_peer, test_service_record, FakeRadio};
    use crate::test_util::eventually;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use uuid::Uuid;

    const LEN: usize = 8;

    fn config(mode: TransportMode, error_threshold: u32) -> Arc<LinkConfig> {
        let mut config = LinkConfig::new(Uuid::from_u128(0xabcd));
        config.transport_mode = mode;
        config.error_threshold = error_threshold;
        Arc::new(config)
    }

    fn worker(config: Arc<LinkConfig>) -> ConnectionWorker {
        ConnectionWorker::new(0, config, SharedBuffer::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]), SharedBuffer::new(LEN))
    }

    #[tokio::test]
    async fn test_open_with_platform_url() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));

        worker.open(&radio, &record).await.unwrap();

        assert!(worker.is_connected());
        assert_eq!(worker.peer(), Some(test_peer(1)));
        assert_eq!(radio.attempted_urls(), vec![record.connection_url.clone().unwrap()]);
    }

    #[tokio::test]
    async fn test_open_falls_back_to_descriptor_list() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        radio.set_openable(vec![peer_url(TransportMode::Stream, test_peer(1).address, 3)]);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));

        worker.open(&radio, &record).await.unwrap();

        assert!(worker.is_connected());
        assert_eq!(radio.attempted_urls(), vec![
            record.connection_url.clone().unwrap(),
            "btspp://000000000001:3;master=false;encrypt=false;authenticate=false".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_open_without_platform_url() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        let record = test_service_record(test_peer(2), 9, false);
        let worker = worker(config(TransportMode::Stream, 5));

        worker.open(&radio, &record).await.unwrap();
        assert_eq!(radio.attempted_urls(), vec!["btspp://000000000002:9;master=false;encrypt=false;authenticate=false".to_string()]);
    }

    #[tokio::test]
    async fn test_open_fails_without_side_effects() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        radio.set_openable(vec![]);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));

        assert!(worker.open(&radio, &record).await.is_err());
        assert!(!worker.is_connected());
        assert_eq!(worker.error_count(), 0);
        assert!(worker.peer().is_none());
        assert_eq!(radio.attempted_urls().len(), 2);
    }

    #[tokio::test]
    async fn test_open_twice_is_rejected() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));

        worker.open(&radio, &record).await.unwrap();
        assert!(worker.open(&radio, &record).await.is_err());
        assert_eq!(radio.attempted_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_receive() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));
        worker.open(&radio, &record).await.unwrap();

        let mut remote = radio.take_stream_remote(record.connection_url.as_ref().unwrap()).unwrap();

        worker.update().await.unwrap();
        let mut received = [0u8; LEN];
        remote.reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, [1, 2, 3, 4, 5, 6, 7, 8]);

        remote.writer.write_all(&[8, 7, 6, 5, 4, 3, 2, 1]).await.unwrap();
        let recv_buffer = worker.recv_buffer().clone();
        eventually(|| recv_buffer.to_vec() == vec![8, 7, 6, 5, 4, 3, 2, 1]).await;
        assert_eq!(worker.error_count(), 0);
    }

    #[tokio::test]
    async fn test_update_when_not_connected() {
        let worker = worker(config(TransportMode::Stream, 5));
        assert!(worker.update().await.is_err());
        assert_eq!(worker.error_count(), 0);
    }

    #[tokio::test]
    async fn test_link_dropped_after_threshold_exceeded() {
        let mut packet = MockPacketConnection::new();
        packet.expect_transmit_mtu().return_const(64usize);
        packet.expect_receive_mtu().return_const(64usize);
        packet.expect_receive()
            .times(4)
            .returning(|_| Err(anyhow!("radio silence")));
        packet.expect_close()
            .times(1)
            .returning(|| Ok(()));

        let worker = worker(config(TransportMode::Packet, 3));
        worker.attach(Connection::Packet(Box::new(packet)), None).await.unwrap();

        eventually(|| !worker.is_connected()).await;
        assert_eq!(worker.error_count(), 4);
        assert!(worker.update().await.is_err());
    }

    #[tokio::test]
    async fn test_errors_below_threshold_keep_the_link() {
        let packet = ScriptedPacketConnection::new(64, vec![Err(()), Err(())]);
        let attempts = packet.receive_attempts();

        let worker = worker(config(TransportMode::Packet, 3));
        worker.attach(Connection::Packet(Box::new(packet)), None).await.unwrap();

        eventually(|| attempts.load(Ordering::Acquire) == 3).await;
        assert_eq!(worker.error_count(), 2);
        assert!(worker.is_connected());
    }

    #[tokio::test]
    async fn test_successful_receive_resets_errors() {
        let packet = ScriptedPacketConnection::new(64, vec![Err(()), Err(()), Ok(vec![4, 4, 4])]);
        let attempts = packet.receive_attempts();

        let worker = worker(config(TransportMode::Packet, 3));
        worker.attach(Connection::Packet(Box::new(packet)), None).await.unwrap();

        eventually(|| attempts.load(Ordering::Acquire) == 4).await;
        assert_eq!(worker.error_count(), 0);
        assert_eq!(worker.recv_buffer().to_vec(), vec![4, 4, 4, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_allows_reopen() {
        let radio = FakeRadio::new(TransportMode::Stream, 7);
        let record = test_service_record(test_peer(1), 3, true);
        let worker = worker(config(TransportMode::Stream, 5));

        worker.close().await;
        worker.open(&radio, &record).await.unwrap();
        worker.close().await;
        worker.close().await;
        assert!(!worker.is_connected());

        worker.open(&radio, &record).await.unwrap();
        assert!(worker.is_connected());
        assert_eq!(worker.error_count(), 0);
    }

    #[tokio::test]
    async fn test_packet_send() {
        let (packet, remote) = crate::test_util::connection::packet_pair(64);
        let worker = worker(config(TransportMode::Packet, 3));
        worker.attach(Connection::Packet(Box::new(packet)), None).await.unwrap();

        worker.update().await.unwrap();
        let mut buf = [0u8; 64];
        let n = remote.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_attach_closes_unusable_connection() {
        let mut packet = MockPacketConnection::new();
        packet.expect_transmit_mtu().return_const(48usize);
        packet.expect_receive_mtu().return_const(48usize);
        packet.expect_receive().never();
        packet.expect_close()
            .times(1)
            .returning(|| Ok(()));

        let worker = ConnectionWorker::new(0, config(TransportMode::Packet, 3), SharedBuffer::new(100), SharedBuffer::new(100));
        assert!(worker.attach(Connection::Packet(Box::new(packet)), None).await.is_err());
        assert!(!worker.is_connected());
        assert!(worker.update().await.is_err());
    }

    #[rstest]
    #[case::single_failure(1, 10)]
    #[case::two_failures(2, 10)]
    #[case::above_threshold(5, 3)]
    #[tokio::test]
    async fn test_send_failures_are_counted_and_reset(#[case] num_failures: usize, #[case] error_threshold: u32) {
        let packet = ScriptedPacketConnection::new(64, vec![])
            .with_send_failures(num_failures);

        let worker = worker(config(TransportMode::Packet, error_threshold));
        worker.attach(Connection::Packet(Box::new(packet)), None).await.unwrap();

        for i in 0..num_failures {
            assert!(worker.update().await.is_err());
            assert_eq!(worker.error_count(), i as u32 + 1);
            // only the receive loop drops the link
            assert!(worker.is_connected());
        }

        worker.update().await.unwrap();
        assert_eq!(worker.error_count(), 0);
        assert!(worker.is_connected());
    }
}
