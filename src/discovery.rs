use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::utils::Endpoint;
use crate::PROTOCOL_VERSION;

const DATAGRAM_SIZE: usize = 512;

/// Datagrams exchanged on the discovery port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Broadcast by a sender looking for receivers.
    Query { version: u16, nonce: u64 },
    /// Unicast answer. `nonce` echoes the query so stale replies from an
    /// earlier round are recognisable.
    Reply {
        version: u16,
        nonce: u64,
        transfer_port: u16,
    },
}

impl DiscoveryMessage {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
            .map_err(|e| TransferError::Protocol(format!("cannot encode discovery message: {e}")))
    }

    fn decode(datagram: &[u8]) -> Option<Self> {
        bincode::deserialize(datagram).ok()
    }
}

/// Receiver-side task answering discovery queries with the TCP port offers
/// should be sent to.
pub struct DiscoveryResponder {
    socket: UdpSocket,
    transfer_port: u16,
}

impl DiscoveryResponder {
    pub async fn bind(addr: SocketAddr, transfer_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!("Discovery responder listening on {}", socket.local_addr()?);
        Ok(DiscoveryResponder {
            socket,
            transfer_port,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Answers queries until `cancel` fires. Queries from other protocol
    /// versions and undecodable datagrams are dropped silently.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let mut buf = [0u8; DATAGRAM_SIZE];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Discovery responder shutting down");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Discovery receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
            };

            let nonce = match DiscoveryMessage::decode(&buf[..len]) {
                Some(DiscoveryMessage::Query { version, nonce }) if version == PROTOCOL_VERSION => {
                    nonce
                }
                _ => continue,
            };
            debug!("Discovery query from {}", from);

            let reply = DiscoveryMessage::Reply {
                version: PROTOCOL_VERSION,
                nonce,
                transfer_port: self.transfer_port,
            };
            if let Err(e) = self.socket.send_to(&reply.encode()?, from).await {
                warn!("Failed to answer discovery query from {}: {}", from, e);
            }
        }
    }
}

/// Sends one query to `config.discovery_addr` and collects replies for
/// `config.discovery_timeout`.
///
/// Returns receivers in reply order, deduplicated by address. An empty set
/// is not an error here; see [`require_endpoints`].
pub async fn discover(config: &TransferConfig) -> Result<Vec<Endpoint>> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
    socket.set_broadcast(true)?;

    let nonce: u64 = rand::random();
    let query = DiscoveryMessage::Query {
        version: PROTOCOL_VERSION,
        nonce,
    };
    let target = SocketAddr::new(config.discovery_addr, config.discovery_port);
    socket
        .send_to(&query.encode()?, target)
        .await
        .map_err(TransferError::connection)?;
    debug!("Discovery query sent to {}", target);

    let deadline = Instant::now() + config.discovery_timeout;
    let mut seen = HashSet::new();
    let mut endpoints = Vec::new();
    let mut buf = [0u8; DATAGRAM_SIZE];

    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(received) => received,
        };
        let (len, from) = match received {
            Ok(received) => received,
            Err(e) => {
                debug!("Discovery receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        match DiscoveryMessage::decode(&buf[..len]) {
            Some(DiscoveryMessage::Reply {
                version,
                nonce: echoed,
                transfer_port,
            }) if version == PROTOCOL_VERSION && echoed == nonce => {
                let addr = SocketAddr::new(from.ip(), transfer_port);
                if seen.insert(addr) {
                    info!("Discovered receiver at {}", addr);
                    endpoints.push(Endpoint::discovered(addr));
                }
            }
            _ => debug!("Ignoring discovery datagram from {}", from),
        }
    }

    Ok(endpoints)
}

/// Turns an empty discovery result into [`TransferError::DiscoveryTimeout`].
pub fn require_endpoints(endpoints: Vec<Endpoint>, config: &TransferConfig) -> Result<Vec<Endpoint>> {
    if endpoints.is_empty() {
        Err(TransferError::DiscoveryTimeout(config.discovery_timeout))
    } else {
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn loopback_config(port: u16, timeout: Duration) -> TransferConfig {
        TransferConfig {
            discovery_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: port,
            discovery_timeout: timeout,
            ..TransferConfig::default()
        }
    }

    #[tokio::test]
    async fn test_discover_finds_responder() {
        let responder = DiscoveryResponder::bind(localhost(0), 40123).await.unwrap();
        let port = responder.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.serve(cancel.clone()));

        let endpoints = discover(&loopback_config(port, Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(endpoints, vec![Endpoint::discovered(localhost(40123))]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_discover_without_receivers_is_empty_and_bounded() {
        // Bound and never read, so queries go nowhere.
        let silent = UdpSocket::bind(localhost(0)).await.unwrap();
        let config = loopback_config(silent.local_addr().unwrap().port(), Duration::from_millis(300));

        let started = std::time::Instant::now();
        let endpoints = discover(&config).await.unwrap();
        assert!(endpoints.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            require_endpoints(endpoints, &config),
            Err(TransferError::DiscoveryTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_mismatched_replies_are_ignored() {
        // A fake receiver that answers with a wrong version, a stale nonce,
        // garbage, and finally a valid reply twice.
        let fake = UdpSocket::bind(localhost(0)).await.unwrap();
        let port = fake.local_addr().unwrap().port();
        let fake_task = tokio::spawn(async move {
            let mut buf = [0u8; DATAGRAM_SIZE];
            let (len, from) = fake.recv_from(&mut buf).await.unwrap();
            let Some(DiscoveryMessage::Query { nonce, .. }) = DiscoveryMessage::decode(&buf[..len])
            else {
                panic!("expected query");
            };
            let replies = [
                DiscoveryMessage::Reply {
                    version: PROTOCOL_VERSION + 1,
                    nonce,
                    transfer_port: 1,
                },
                DiscoveryMessage::Reply {
                    version: PROTOCOL_VERSION,
                    nonce: nonce.wrapping_add(1),
                    transfer_port: 2,
                },
                DiscoveryMessage::Reply {
                    version: PROTOCOL_VERSION,
                    nonce,
                    transfer_port: 3,
                },
                DiscoveryMessage::Reply {
                    version: PROTOCOL_VERSION,
                    nonce,
                    transfer_port: 3,
                },
            ];
            fake.send_to(b"\xff\xfe garbage", from).await.unwrap();
            for reply in &replies {
                fake.send_to(&reply.encode().unwrap(), from).await.unwrap();
            }
        });

        let endpoints = discover(&loopback_config(port, Duration::from_millis(500)))
            .await
            .unwrap();
        fake_task.await.unwrap();
        assert_eq!(endpoints, vec![Endpoint::discovered(localhost(3))]);
    }

    #[tokio::test]
    async fn test_responder_ignores_other_versions() {
        let responder = DiscoveryResponder::bind(localhost(0), 5000).await.unwrap();
        let addr = responder.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.serve(cancel.clone()));

        let client = UdpSocket::bind(localhost(0)).await.unwrap();
        let query = DiscoveryMessage::Query {
            version: PROTOCOL_VERSION + 7,
            nonce: 1,
        };
        client.send_to(&query.encode().unwrap(), addr).await.unwrap();

        let mut buf = [0u8; DATAGRAM_SIZE];
        let answer = tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(answer.is_err(), "responder answered a foreign version");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
