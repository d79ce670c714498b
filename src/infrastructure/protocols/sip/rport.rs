/// RPORT support for NAT traversal (RFC 3581)
///
/// Requests get `received` and `rport` stamped on their top Via from the real
/// source address; responses travel back to that address.
use super::message::SipError;
use super::via::ViaHeader;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Set `received` and `rport` on a Via value from the actual source address
pub fn add_rport_and_received(via_header: &str, source_addr: SocketAddr) -> Result<String, SipError> {
    let mut via = ViaHeader::parse(via_header)?;
    via.set_param("received", Some(source_addr.ip().to_string()));
    via.set_param("rport", Some(source_addr.port().to_string()));
    debug!(
        "Stamped Via with received={} rport={}",
        source_addr.ip(),
        source_addr.port()
    );
    Ok(via.to_string())
}

/// Extract rport value from Via header
pub fn extract_rport_from_via(via_header: &str) -> Option<u16> {
    ViaHeader::parse(via_header).ok().and_then(|via| via.rport())
}

/// Extract received parameter from Via header
pub fn extract_received_from_via(via_header: &str) -> Option<IpAddr> {
    ViaHeader::parse(via_header)
        .ok()
        .and_then(|via| via.received().and_then(|r| r.parse().ok()))
}

/// Get public address from Via header (rport + received)
///
/// Returns (IP, port) if both rport and received parameters are present
pub fn get_public_address_from_via(via_header: &str) -> Option<SocketAddr> {
    let via = ViaHeader::parse(via_header).ok()?;
    let ip: IpAddr = via.received()?.parse().ok()?;
    let port = via.rport()?;
    Some(SocketAddr::new(ip, port))
}

/// Where a response for this Via goes: received/rport first, then sent-by
/// when it is an IP literal
pub fn response_address(via_header: &str) -> Option<SocketAddr> {
    let via = ViaHeader::parse(via_header).ok()?;
    let port = via.rport().unwrap_or_else(|| via.effective_port());
    if let Some(ip) = via.received().and_then(|r| r.parse::<IpAddr>().ok()) {
        return Some(SocketAddr::new(ip, port));
    }
    via.host
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, port))
}
