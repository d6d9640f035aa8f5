use uuid::Uuid;

use crate::radio::PeerAddress;
use crate::status::TransportMode;

/// No master role switch, no encryption, no authentication - both roles use the same posture
const SECURITY_PARAMS: &str = "master=false;encrypt=false;authenticate=false";


/// URL for dialing a peer's port directly, bypassing the platform's URL derivation
pub fn peer_url(mode: TransportMode, address: PeerAddress, port: u16) -> String {
    format!("{}://{}:{};{}", mode.scheme(), address, mode.format_port(port), SECURITY_PARAMS)
}

/// URL for publishing a local service
pub fn local_service_url(mode: TransportMode, service_uuid: Uuid, service_name: &str) -> String {
    format!("{}://localhost:{};name={};{}", mode.scheme(), service_uuid.simple(), service_name, SECURITY_PARAMS)
}
