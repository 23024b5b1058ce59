//! ---
//! mgd_section: "01-core-dispatch"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Primary dispatch loop and lifecycle management."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mgd_common::{
    AppConfig, ControllerConfig, EndpointConfig, ForecastConfig, LoggingConfig, ObserverConfig,
    OracleConfig, SolverConfig, SourceSpec,
};
use mgd_core::{DispatchController, Snapshot, SnapshotBroadcaster};
use mgd_link::EndpointLink;
use mgd_oracle::{OracleBackend, OracleClient, OracleError, OracleProposal, OracleRequest};
use mgd_proto::{
    encode_telemetry, telemetry_frame_len, NodeKind, TelemetryFrame, TelemetryNode,
};
use mgd_sim::{SimEndpoint, TelemetryGenerator};
use mgd_solver::Flow;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

fn test_config(endpoint_address: String) -> AppConfig {
    AppConfig {
        controller: ControllerConfig {
            tick_interval: Duration::from_millis(20),
            solve_budget: Duration::from_millis(25),
            stale_after: Duration::from_millis(5000),
            shutdown_grace: Duration::from_millis(500),
            history_depth: 200,
        },
        forecast: ForecastConfig::default(),
        solver: SolverConfig::default(),
        sources: vec![
            SourceSpec {
                source_id: 1,
                max_capacity: 5.0,
                cost_per_amp: 0.10,
                ramp_limit: None,
                green: true,
            },
            SourceSpec {
                source_id: 2,
                max_capacity: 5.0,
                cost_per_amp: 0.20,
                ramp_limit: None,
                green: false,
            },
        ],
        endpoint: EndpointConfig {
            address: endpoint_address,
        },
        observer: ObserverConfig {
            enabled: false,
            ..ObserverConfig::default()
        },
        oracle: None,
        logging: LoggingConfig::default(),
    }
}

async fn wait_for_snapshot<F>(
    broadcaster: &SnapshotBroadcaster,
    deadline: Duration,
    predicate: F,
) -> Arc<Snapshot>
where
    F: Fn(&Snapshot) -> bool,
{
    tokio::time::timeout(deadline, async {
        loop {
            if let Some(snapshot) = broadcaster.latest() {
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("snapshot matching predicate within deadline")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn closed_loop_dispatches_against_a_simulated_endpoint() {
    let generator = TelemetryGenerator::new(1, 3, 1.0 / 24.0, 42);
    let endpoint = SimEndpoint::spawn(
        "127.0.0.1:0".parse().unwrap(),
        generator,
        Duration::from_millis(20),
    )
    .await
    .unwrap();

    let config = test_config(endpoint.address().to_string());
    let sources = config.sources.clone();
    let broadcaster = SnapshotBroadcaster::new();
    let link = EndpointLink::spawn(config.endpoint.address.clone());
    let controller = DispatchController::new(config, link, None, broadcaster.clone(), None);
    let handle = controller.spawn();

    // Wait for a tick that actually served demand.
    let snapshot = wait_for_snapshot(&broadcaster, Duration::from_secs(5), |snapshot| {
        !snapshot.link_down && snapshot.economic.total_supply > 0.5
    })
    .await;

    assert!(snapshot.dispatch_count > 0);
    assert!(snapshot.confidence_score > 0.0);
    for spec in &sources {
        let usage = &snapshot.economic.source_usage[&spec.source_id];
        assert!(usage.amps <= spec.max_capacity + 1e-6);
    }
    let accounted =
        snapshot.economic.total_supply + snapshot.economic.unmet_demand;
    assert!((accounted - snapshot.economic.total_demand).abs() < 1e-6);

    // Published snapshots keep strictly increasing tick order and
    // non-decreasing endpoint timestamps.
    let first = broadcaster.latest().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = broadcaster.latest().unwrap();
    assert!(second.tick > first.tick);
    assert!(second.timestamp_ms >= first.timestamp_ms);

    // The endpoint saw our dispatch commands.
    assert!(endpoint.dispatches_received() > 0);
    let dispatch = endpoint.last_dispatch().expect("dispatch recorded");
    for command in &dispatch.commands {
        assert!((0.0..=1.0).contains(&command.supply));
    }

    handle.shutdown().await.unwrap();
    endpoint.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_keeps_publishing_flagged_snapshots_while_link_is_down() {
    // Nothing listens on this port; the link stays down.
    let config = test_config("127.0.0.1:1".to_string());
    let broadcaster = SnapshotBroadcaster::new();
    let link = EndpointLink::spawn(config.endpoint.address.clone());
    let controller = DispatchController::new(config, link, None, broadcaster.clone(), None);
    let handle = controller.spawn();

    let snapshot = wait_for_snapshot(&broadcaster, Duration::from_secs(3), |snapshot| {
        snapshot.link_down && snapshot.tick >= 3
    })
    .await;
    assert!(snapshot.nodes.is_empty());
    assert_eq!(snapshot.economic.total_demand, 0.0);

    handle.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_nodes_leave_forecaster_solver_and_snapshot() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // Feed node 4 for half a second, then stop mentioning it.
    let feeder = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; telemetry_frame_len(2)];
        for tick in 0u32.. {
            let mut nodes = vec![TelemetryNode {
                id: 3,
                kind: NodeKind::Consumer,
                demand: 1.0,
                fulfillment: 1.0,
            }];
            if tick < 25 {
                nodes.push(TelemetryNode {
                    id: 4,
                    kind: NodeKind::Consumer,
                    demand: 2.0,
                    fulfillment: 2.0,
                });
            }
            let frame = TelemetryFrame {
                timestamp_ms: tick * 20,
                nodes,
            };
            let written = encode_telemetry(&frame, &mut buf).unwrap();
            if socket.write_all(&buf[..written]).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let mut config = test_config(address);
    config.controller.stale_after = Duration::from_millis(300);
    let broadcaster = SnapshotBroadcaster::new();
    let link = EndpointLink::spawn(config.endpoint.address.clone());
    let controller = DispatchController::new(config, link, None, broadcaster.clone(), None);
    let handle = controller.spawn();

    // First both nodes appear...
    wait_for_snapshot(&broadcaster, Duration::from_secs(3), |snapshot| {
        snapshot.nodes.iter().any(|n| n.id == 4)
    })
    .await;

    // ...then node 4 is retired everywhere once it goes stale.
    let snapshot = wait_for_snapshot(&broadcaster, Duration::from_secs(5), |snapshot| {
        !snapshot.nodes.is_empty() && snapshot.nodes.iter().all(|n| n.id != 4)
    })
    .await;
    assert!(snapshot.nodes.iter().any(|n| n.id == 3));
    assert!(snapshot
        .economic
        .dispatch_details
        .iter()
        .all(|detail| detail.id != 4));

    handle.shutdown().await.unwrap();
    feeder.abort();
}

struct ReliefOracle;

#[async_trait]
impl OracleBackend for ReliefOracle {
    async fn propose(&self, request: &OracleRequest) -> Result<OracleProposal, OracleError> {
        // Serve both oversubscribed consumers at full source capacity.
        assert!(!request.rejected_flows.is_empty());
        Ok(OracleProposal {
            flows: vec![
                Flow {
                    source_id: 1,
                    node_id: 3,
                    amps: 5.0,
                },
                Flow {
                    source_id: 2,
                    node_id: 4,
                    amps: 5.0,
                },
            ],
            confidence: 0.85,
            reasoning: Some("load shed split across both feeders".into()),
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn low_confidence_escalation_applies_a_validated_override() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    // Persistently oversubscribed grid: 12 A of demand on 10 A of capacity.
    let feeder = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; telemetry_frame_len(2)];
        for tick in 0u32.. {
            let frame = TelemetryFrame {
                timestamp_ms: tick * 20,
                nodes: vec![
                    TelemetryNode {
                        id: 3,
                        kind: NodeKind::Consumer,
                        demand: 6.0,
                        fulfillment: 4.0,
                    },
                    TelemetryNode {
                        id: 4,
                        kind: NodeKind::Consumer,
                        demand: 6.0,
                        fulfillment: 4.0,
                    },
                ],
            };
            let written = encode_telemetry(&frame, &mut buf).unwrap();
            if socket.write_all(&buf[..written]).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    let mut config = test_config(address);
    config.oracle = Some(OracleConfig {
        endpoint: "stub".into(),
        deadline: Duration::from_millis(300),
        snapshot_history: 10,
    });
    let broadcaster = SnapshotBroadcaster::new();
    let link = EndpointLink::spawn(config.endpoint.address.clone());
    let oracle = Arc::new(OracleClient::new(
        Arc::new(ReliefOracle),
        Duration::from_millis(300),
    ));
    let controller = DispatchController::new(
        config,
        link,
        Some(oracle.clone()),
        broadcaster.clone(),
        None,
    );
    let handle = controller.spawn();

    // The oversubscribed solve escalates...
    let escalating = wait_for_snapshot(&broadcaster, Duration::from_secs(5), |snapshot| {
        snapshot.escalating
    })
    .await;
    assert!(escalating.confidence_score < 0.5);

    // ...and a later tick runs on the validated oracle override.
    let overridden = wait_for_snapshot(&broadcaster, Duration::from_secs(5), |snapshot| {
        snapshot.oracle_override
    })
    .await;
    assert!(overridden.tick > escalating.tick.saturating_sub(1));
    assert!((overridden.economic.total_supply - 10.0).abs() < 1e-6);

    handle.shutdown().await.unwrap();
    feeder.abort();
}
