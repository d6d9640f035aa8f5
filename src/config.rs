use std::time::Duration;
use anyhow::bail;
use uuid::Uuid;

use crate::status::{TransportMode, Visibility, DEFAULT_TRANSPORT_MODE};


#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// The visibility to request when advertising. If the platform rejects it, the next narrower
    ///  mode is tried.
    pub visibility: Visibility,
    pub transport_mode: TransportMode,

    /// include the platform's previously paired peers in discovery without finding them by
    ///  device scan
    pub use_known_peers: bool,
    /// upper bound for simultaneous outbound connections, in addition to the platform's own limit
    ///  and the number of buffers
    pub max_connections: usize,
    /// A link is dropped when its error counter *exceeds* this number. The counter is reset by
    ///  every successful transfer.
    pub error_threshold: u32,

    /// add the advertised service to the public browse group so that generic service browsers
    ///  can see it
    pub publish_public_browse: bool,
    pub service_uuid: Uuid,
    pub service_name: String,
    pub service_description: String,
    pub service_vendor: String,

    /// bounds a single `update()`, i.e. the time a caller's tick can stall on one link
    pub write_timeout: Duration,
}

impl LinkConfig {
    pub fn new(service_uuid: Uuid) -> LinkConfig {
        LinkConfig {
            visibility: Visibility::Wide,
            transport_mode: DEFAULT_TRANSPORT_MODE,
            use_known_peers: true,
            max_connections: 7,
            error_threshold: 10,
            publish_public_browse: true,
            service_uuid,
            service_name: "radiolink".to_string(),
            service_description: "fixed-size state exchange".to_string(),
            service_vendor: "radiolink".to_string(),
            write_timeout: Duration::from_millis(250),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.service_name.is_empty() {
            bail!("service name must not be empty");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.visibility == Visibility::NotDiscoverable {
            bail!("advertising requires a discoverable visibility mode");
        }
        if self.write_timeout.is_zero() {
            bail!("write timeout must be positive");
        }
        Ok(())
    }
}
