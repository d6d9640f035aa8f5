use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::connection::url::local_service_url;
use crate::connection::worker::ConnectionWorker;
use crate::radio::data_element::DataElement;
use crate::radio::*;
use crate::status::{Status, Visibility};
use crate::transport::shared_buffer::SharedBuffer;


/// The client role: publishes the service, waits for exactly one peer to connect and then
///  exchanges buffers with it.
///
/// Once a peer is connected the device stops being discoverable. If the link is dropped (by
///  the error threshold), the session is over and the status goes back to [Status::Inactive];
///  `start()` can then be called again.
pub struct Advertiser {
    config: Arc<LinkConfig>,
    radio: Arc<dyn Radio>,
    worker: Arc<ConnectionWorker>,
    session: Mutex<Option<AdvertiserSession>>,
    /// serializes start and close
    lifecycle: tokio::sync::Mutex<()>,
}

struct AdvertiserSession {
    acceptor: Arc<dyn Acceptor>,
    accepted: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl Advertiser {
    pub fn new(config: LinkConfig, radio: Arc<dyn Radio>, send_buffer: SharedBuffer, recv_buffer: SharedBuffer) -> anyhow::Result<Advertiser> {
        config.validate()?;
        if send_buffer.is_empty() || recv_buffer.is_empty() {
            bail!("buffers must not be empty");
        }
        if send_buffer.is_same(&recv_buffer) {
            bail!("send and receive buffer must be different");
        }

        let config = Arc::new(config);
        Ok(Advertiser {
            worker: Arc::new(ConnectionWorker::new(0, config.clone(), send_buffer, recv_buffer)),
            config,
            radio,
            session: Mutex::new(None),
            lifecycle: Default::default(),
        })
    }

    /// Make the device discoverable, publish the service and wait for a peer in the background.
    ///  This fails if a session is running. On failure, the advertiser stays inactive.
    pub async fn start(&self) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.status() != Status::Inactive {
            bail!("advertiser is already running");
        }
        self.release().await;

        let visibility = self.make_discoverable()?;

        let advertisement = self.advertisement();
        let acceptor: Arc<dyn Acceptor> = match self.radio.advertise(&advertisement).await {
            Ok(acceptor) => Arc::from(acceptor),
            Err(e) => {
                self.make_invisible();
                return Err(e);
            }
        };
        info!(?visibility, "advertising {}", advertisement.url);

        let accepted = Arc::new(AtomicBool::new(false));
        let accept_task = tokio::spawn(accept_peer(
            acceptor.clone(),
            self.radio.clone(),
            self.worker.clone(),
            accepted.clone(),
        ));

        *self.session() = Some(AdvertiserSession {
            acceptor,
            accepted,
            accept_task,
        });
        Ok(())
    }

    /// Stop advertising and release the link. Every resource is released even if releasing
    ///  another one failed, and calling this repeatedly is harmless.
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.release().await;
    }

    pub fn status(&self) -> Status {
        match self.session().as_ref() {
            None => Status::Inactive,
            Some(session) => {
                if session.accepted.load(Ordering::Acquire) {
                    if self.worker.is_connected() {
                        Status::Connected
                    }
                    else {
                        Status::Inactive
                    }
                }
                else if session.accept_task.is_finished() {
                    // accepting failed
                    Status::Inactive
                }
                else {
                    Status::Waiting
                }
            }
        }
    }

    /// Send the send buffer to the connected peer.
    pub async fn update(&self) -> anyhow::Result<()> {
        self.worker.update().await
    }

    pub fn error_count(&self) -> u32 {
        self.worker.error_count()
    }

    fn make_discoverable(&self) -> anyhow::Result<Visibility> {
        let mut candidate = Some(self.config.visibility);
        while let Some(visibility) = candidate {
            match self.radio.set_discoverable(visibility) {
                Ok(()) => return Ok(visibility),
                Err(e) => {
                    debug!("visibility {:?} was rejected: {}", visibility, e);
                    candidate = visibility.fallback();
                }
            }
        }
        bail!("the platform rejected all visibility modes")
    }

    fn make_invisible(&self) {
        if let Err(e) = self.radio.set_discoverable(Visibility::NotDiscoverable) {
            debug!("could not make the device non-discoverable: {}", e);
        }
    }

    fn advertisement(&self) -> ServiceAdvertisement {
        let config = &self.config;

        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_SERVICE_NAME, DataElement::Text(config.service_name.clone()));
        attributes.insert(ATTR_SERVICE_DESCRIPTION, DataElement::Text(config.service_description.clone()));
        attributes.insert(ATTR_PROVIDER_NAME, DataElement::Text(config.service_vendor.clone()));
        if config.publish_public_browse {
            attributes.insert(ATTR_BROWSE_GROUP_LIST, DataElement::Sequence(vec![
                DataElement::Uuid(bluetooth_uuid(PUBLIC_BROWSE_ROOT)),
            ]));
        }

        ServiceAdvertisement {
            url: local_service_url(config.transport_mode, config.service_uuid, &config.service_name),
            attributes,
        }
    }

    async fn release(&self) {
        let session = self.session().take();

        if let Some(session) = &session {
            session.accept_task.abort();
        }
        self.worker.close().await;

        if let Some(session) = session {
            if let Err(e) = session.accept_task.await {
                if !e.is_cancelled() {
                    warn!("accept task terminated abnormally: {}", e);
                }
            }
            // the accept task may have been aborted halfway through setting up the link
            self.worker.close().await;

            if let Err(e) = session.acceptor.close().await {
                debug!("error withdrawing the service: {}", e);
            }
            self.make_invisible();
            debug!("advertiser closed");
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<AdvertiserSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


async fn accept_peer(acceptor: Arc<dyn Acceptor>, radio: Arc<dyn Radio>, worker: Arc<ConnectionWorker>, accepted: Arc<AtomicBool>) {
    let connection = match acceptor.accept().await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("accepting a peer failed: {}", e);
            return;
        }
    };

    // this is a single peer service - stop advertising it
    if let Err(e) = radio.set_discoverable(Visibility::NotDiscoverable) {
        debug!("could not make the device non-discoverable: {}", e);
    }

    match worker.attach(connection, None).await {
        Ok(()) => {
            accepted.store(true, Ordering::Release);
            info!("peer connected");
        }
        Err(e) => {
            warn!("could not set up the link to the accepted peer: {}", e);
        }
    }
}
