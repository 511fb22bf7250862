//! Two-phase block protocol between nodes registered with one manager.

use std::sync::Arc;
use std::time::Duration;

use swarmsim_core::swarm::MANAGER_NAME;
use swarmsim_core::{
    BlockGrant, Directory, ManagerHandle, Node, NodeManager, NodeSpec, PeerHandle, RegistryError,
    SwarmConfig, SwarmError,
};

fn directory() -> Directory<dyn ManagerHandle> {
    let directory: Directory<dyn ManagerHandle> = Directory::new();
    directory
        .bind(
            MANAGER_NAME,
            Arc::new(NodeManager::default()) as Arc<dyn ManagerHandle>,
        )
        .unwrap();
    directory
}

/// Slow enough that a peer never finishes a block during a test.
fn frozen_config() -> SwarmConfig {
    let mut config = SwarmConfig::for_testing();
    config.simulation.time_dilation = 1000.0;
    config
}

#[tokio::test]
async fn test_request_for_missing_block_returns_minus_one() {
    let config = frozen_config();
    let directory = directory();
    let peer = Node::join(
        NodeSpec::peer("peer0", 1_000_000.0, 1_000_000.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    for index in 0..config.file.block_count() {
        let grant = peer.request_block("peer1", index, 1_000_000.0).await.unwrap();
        assert_eq!(grant, BlockGrant::NotHeld);
        assert_eq!(grant.as_wire(), -1.0);
    }
    assert_eq!(peer.upload_count(), 0);

    peer.dispose().await;
}

#[tokio::test]
async fn test_responder_below_floor_refuses_everyone() {
    let config = frozen_config();
    let directory = directory();
    let seed = Node::join(
        NodeSpec::seed("seed0", 800.0, 800.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    // Cap is 200 and floor 133.3; drain the seed down to 800 / 8.
    for (block, requested) in [(0, 200.0), (1, 200.0), (2, 150.0), (3, 150.0)] {
        let grant = seed.request_block("drain", block, requested).await.unwrap();
        assert_eq!(grant, BlockGrant::Granted(requested));
    }
    assert_eq!(seed.available_upload_rate(), 100.0);

    for requested in [1.0, 100.0, 1_000.0, f64::MAX] {
        let grant = seed.request_block("peer0", 5, requested).await.unwrap();
        assert_eq!(grant, BlockGrant::Refused);
        assert_eq!(grant.as_wire(), 0.0);
    }
    assert_eq!(seed.available_upload_rate(), 100.0);
    assert_eq!(seed.upload_count(), 4);

    seed.dispose().await;
}

#[tokio::test]
async fn test_finalize_twice_credits_once() {
    let config = frozen_config();
    let directory = directory();
    let seed = Node::join(
        NodeSpec::seed("seed0", 1_048_576.0, 1_048_576.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    let grant = seed.request_block("peer0", 3, 10_000_000.0).await.unwrap();
    assert_eq!(grant, BlockGrant::Granted(262_144.0));
    assert_eq!(seed.current_upload_rate(), 262_144.0);

    seed.finalize_block("peer0", 3).await.unwrap();
    seed.finalize_block("peer0", 3).await.unwrap();

    assert_eq!(seed.available_upload_rate(), 1_048_576.0);
    assert_eq!(seed.current_upload_rate(), 0.0);
    assert_eq!(seed.upload_count(), 0);

    seed.dispose().await;
}

#[tokio::test]
async fn test_created_seed_never_downloads() {
    let config = SwarmConfig::for_testing();
    let directory = directory();
    let seed = Node::join(
        NodeSpec::seed("seed0", 1_000.0, 1_000.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    assert_eq!(seed.progress(), 1.0);
    assert!(seed.is_seed());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(seed.download_count(), 0);
    assert_eq!(seed.transfer_time_ms(), 0);
    assert_eq!(seed.estimated_time_ms(), Some(0));

    seed.dispose().await;
}

#[tokio::test]
async fn test_name_reuse_by_different_node_is_fatal() {
    let config = frozen_config();
    let directory = directory();
    let first = Node::join(
        NodeSpec::seed("seed0", 1_000.0, 1_000.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    let err = Node::join(
        NodeSpec::seed("seed0", 1_000.0, 1_000.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        SwarmError::Registry(RegistryError::NameTaken { ref name }) if name == "seed0"
    ));

    first.dispose().await;
}

#[tokio::test]
async fn test_status_reflects_open_reservations() {
    let config = frozen_config();
    let directory = directory();
    let seed = Node::join(
        NodeSpec::seed("seed0", 1_200.0, 1_200.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    seed.request_block("peer0", 0, 1_000.0).await.unwrap();
    seed.request_block("peer1", 0, 1_000.0).await.unwrap();

    let status = PeerHandle::status(seed.as_ref()).await.unwrap();
    assert_eq!(status.name, "seed0");
    assert_eq!(status.upload_count, 2);
    assert_eq!(status.current_upload_rate, 600.0);
    assert_eq!(status.available_upload_rate, 600.0);
    assert_eq!(status.progress, 1.0);

    seed.dispose().await;
}

#[tokio::test]
async fn test_downloads_stay_within_download_capacity() {
    let config = frozen_config();
    let directory = directory();
    let seed = Node::join(
        NodeSpec::seed("seed0", 1_200.0, 1_200.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();
    // The seed would lend up to 300 per block; the peer can absorb only one.
    let peer = Node::join(
        NodeSpec::peer("peer0", 300.0, 300.0),
        &config,
        &directory,
        MANAGER_NAME,
    )
    .await
    .unwrap();

    for _ in 0..60 {
        assert!(seed.lent_to("peer0") <= peer.max_download_rate());
        assert!(peer.current_download_rate() <= peer.max_download_rate());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(peer.download_count(), 1);
    assert_eq!(peer.available_download_rate(), 0.0);
    assert_eq!(seed.upload_count(), 1);
    assert_eq!(seed.lent_to("peer0"), 300.0);
    assert_eq!(seed.available_upload_rate(), 900.0);

    peer.dispose().await;
    assert_eq!(seed.upload_count(), 0);
    seed.dispose().await;
}
