use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::bytes::plan_segments;
use crate::commands::send::{run_pipelines, VerifiedReceiver};
use crate::config::TransferConfig;
use crate::cryptography::{derive_secret, stretch_key_blocking, verifier_of, TransferKey};
use crate::error::{Result, TransferError};
use crate::handshake::SenderHandshake;
use crate::networking::{Offer, TransferId};
use crate::utils::{Endpoint, ReceiverOutcome, TransferDescriptor, TransferHooks};
use crate::PROTOCOL_VERSION;

/// Aggregated result of one `send`.
#[derive(Debug, Clone)]
pub struct FanoutReport {
    /// One outcome per endpoint, in the order the endpoints were given.
    pub outcomes: Vec<ReceiverOutcome>,
    /// Streams per receiver actually used (1 for directories).
    pub stream_count: usize,
}

impl FanoutReport {
    /// At least one receiver got the whole transfer.
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().any(ReceiverOutcome::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReceiverOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

/// Runs handshakes against every endpoint concurrently, then streams the
/// source to the verified ones. Failures stay with their endpoint.
pub struct FanoutCoordinator {
    config: TransferConfig,
    key: TransferKey,
    hooks: TransferHooks,
}

impl FanoutCoordinator {
    pub fn new(config: TransferConfig, key: TransferKey, hooks: TransferHooks) -> Self {
        FanoutCoordinator {
            config: config.normalized(),
            key,
            hooks,
        }
    }

    /// Delivers `descriptor` to `endpoints`.
    ///
    /// With fan-out disabled only the first endpoint to verify the key gets
    /// the data; the rest are closed and reported as rejected. Returns `Err`
    /// only when the local source cannot be read.
    pub async fn run(
        &self,
        descriptor: Arc<TransferDescriptor>,
        endpoints: Vec<Endpoint>,
        cancel: CancellationToken,
    ) -> Result<FanoutReport> {
        let mut seen = HashSet::new();
        let endpoints: Vec<Endpoint> = endpoints
            .into_iter()
            .filter(|e| seen.insert(e.addr))
            .collect();

        // Fresh salt per transfer: a reused key still yields a new secret.
        let transfer_id = TransferId::random();
        let material = stretch_key_blocking(self.key.clone(), transfer_id.0).await?;
        let offer = Arc::new(Offer {
            version: PROTOCOL_VERSION,
            transfer_id,
            name: descriptor.name.clone(),
            size: descriptor.size,
            verifier: verifier_of(&material),
            compression_level: descriptor.compression_level,
            chunk_size: descriptor.chunk_size as u32,
            segments: plan_segments(descriptor.size, descriptor.stream_count),
        });
        let stream_count = offer.segments.len();
        info!(
            "Offering {} to {} receiver(s), transfer {}",
            offer.name,
            endpoints.len(),
            offer.transfer_id
        );

        let (verified, mut outcomes) = self.handshake_all(&endpoints, &offer, &cancel).await;

        let secret = derive_secret(&material);
        let delivered = run_pipelines(
            descriptor,
            offer,
            &secret,
            verified,
            &self.config,
            &self.hooks,
            &cancel,
        )
        .await?;
        for outcome in delivered {
            outcomes.insert(outcome.endpoint.addr, outcome);
        }

        let outcomes: Vec<ReceiverOutcome> = endpoints
            .iter()
            .filter_map(|e| outcomes.remove(&e.addr))
            .collect();
        self.hooks.report_completion(&outcomes);
        Ok(FanoutReport {
            outcomes,
            stream_count,
        })
    }

    /// Handshakes every endpoint in parallel. Returns the receivers that get
    /// a pipeline and the outcomes of those that do not.
    async fn handshake_all(
        &self,
        endpoints: &[Endpoint],
        offer: &Arc<Offer>,
        cancel: &CancellationToken,
    ) -> (Vec<VerifiedReceiver>, HashMap<std::net::SocketAddr, ReceiverOutcome>) {
        // Separate token so the fan-out race can stop the losers without
        // touching the transfer itself.
        let race = cancel.child_token();
        let mut handshakes = JoinSet::new();
        for &endpoint in endpoints {
            let offer = offer.clone();
            let config = self.config.clone();
            let race = race.clone();
            handshakes.spawn(async move {
                let result = SenderHandshake::new(endpoint)
                    .run(&offer, &config, &race)
                    .await;
                (endpoint, result)
            });
        }

        let mut verified = Vec::new();
        let mut outcomes = HashMap::new();
        while let Some(joined) = handshakes.join_next().await {
            let (endpoint, result) = match joined {
                Ok(finished) => finished,
                Err(e) => {
                    warn!("Handshake task failed: {}", e);
                    continue;
                }
            };
            let lost_race = !self.config.fanout && !verified.is_empty();
            match result {
                Ok(_) if lost_race => {
                    debug!("{} verified after the winner, closing", endpoint);
                    outcomes.insert(endpoint.addr, lost_race_outcome(endpoint));
                }
                Ok(stream) => {
                    verified.push(VerifiedReceiver { endpoint, stream });
                    if !self.config.fanout {
                        info!("{} verified first, fan-out disabled", endpoint);
                        race.cancel();
                    }
                }
                Err(TransferError::Cancelled) if lost_race && !cancel.is_cancelled() => {
                    outcomes.insert(endpoint.addr, lost_race_outcome(endpoint));
                }
                Err(e) => {
                    warn!("Handshake with {} failed: {}", endpoint, e);
                    outcomes.insert(endpoint.addr, ReceiverOutcome::failed(endpoint, &e));
                }
            }
        }
        (verified, outcomes)
    }
}

fn lost_race_outcome(endpoint: Endpoint) -> ReceiverOutcome {
    ReceiverOutcome::failed(
        endpoint,
        &TransferError::HandshakeRejected("fanout disabled, another receiver accepted first".into()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::OutcomeKind;

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(([127, 0, 0, 1], port).into())
    }

    #[test]
    fn test_report_success_is_any_receiver() {
        let mut report = FanoutReport {
            outcomes: vec![
                ReceiverOutcome::failed(endpoint(1), &TransferError::ConnectionFailure("reset".into())),
                ReceiverOutcome::success(endpoint(2), 10, 1),
            ],
            stream_count: 1,
        };
        assert!(report.succeeded());
        assert_eq!(report.failures().count(), 1);

        report.outcomes.remove(1);
        assert!(!report.succeeded());
    }

    #[test]
    fn test_lost_race_is_rejected() {
        let outcome = lost_race_outcome(endpoint(3));
        assert_eq!(outcome.kind, OutcomeKind::Rejected);
        assert!(outcome.detail.contains("fanout disabled"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoints_fail_independently() {
        // Bind then drop to get ports nobody listens on.
        let mut ports = Vec::new();
        for _ in 0..2 {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let config = TransferConfig {
            connection_timeout: std::time::Duration::from_millis(500),
            ..TransferConfig::default()
        };
        let descriptor = Arc::new(TransferDescriptor::from_path(&path, &config).unwrap());
        let coordinator = FanoutCoordinator::new(config, TransferKey::generate(), TransferHooks::default());
        let report = coordinator
            .run(
                descriptor,
                vec![endpoint(ports[0]), endpoint(ports[1]), endpoint(ports[0])],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.kind == OutcomeKind::NetworkFailure));
        assert!(!report.succeeded());
    }
}
