//! Manager discovery over UDP multicast.
//!
//! When no manager URL is configured, the worker sends an SSDP-style search
//! datagram to the site-local multicast group and takes the `LOCATION` header
//! of the first manager that answers. Nothing is retained beyond the call;
//! a silent network yields [`WorkerError::Discovery`] after the attempts are
//! exhausted.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::error::{Result, WorkerError};

const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
const MULTICAST_PORT: u16 = 1900;
const SERVICE_TAG: &str = "urn:farmhand:manager:0";
const ATTEMPTS: u32 = 5;

/// Find a manager on the local network, returning its base URL.
///
/// `timeout` bounds the wait for a response per attempt.
pub async fn discover_manager(timeout: Duration) -> Result<String> {
    let destination = SocketAddr::from((MULTICAST_ADDR, MULTICAST_PORT));
    discover_at(destination, timeout).await
}

/// Discovery against an explicit destination. Split out so tests can point
/// the probe at a loopback responder instead of the multicast group.
pub(crate) async fn discover_at(destination: SocketAddr, timeout: Duration) -> Result<String> {
    info!(%destination, "searching for a manager via UDP discovery");

    let probe = format!(
        "M-SEARCH * HTTP/1.1\r\n\
         ST: {SERVICE_TAG}\r\n\
         MX: 3\r\n\
         MAN: \"ssdp:discover\"\r\n\
         HOST: {destination}\r\n\r\n"
    );

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| WorkerError::Discovery(format!("binding discovery socket: {e}")))?;

    for attempt in 1..=ATTEMPTS {
        // Sending the probe twice per attempt lowers the odds of losing it.
        for _ in 0..2 {
            if let Err(err) = socket.send_to(probe.as_bytes(), destination).await {
                warn!(%err, "failed to send discovery probe");
            }
        }

        let mut buf = [0u8; 1024];
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, peer))) => {
                let response = String::from_utf8_lossy(&buf[..len]);
                if let Some(location) = parse_location(&response) {
                    info!(%peer, %location, "manager found");
                    return Ok(location);
                }
                debug!(%peer, "discovery response without LOCATION header, ignoring");
            }
            Ok(Err(err)) => {
                warn!(%err, "error receiving discovery response");
            }
            Err(_) => {
                debug!(attempt, "discovery attempt timed out");
            }
        }
    }

    Err(WorkerError::Discovery(format!(
        "no manager answered after {ATTEMPTS} attempts"
    )))
}

/// Extract the `LOCATION` header from an HTTP-over-UDP response.
fn parse_location(response: &str) -> Option<String> {
    response
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("location"))
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
