mod common;

use bytes::Bytes;
use common::*;
use tempfile::TempDir;
use vault_deployer::integrity::IntegrityVerifier;
use vault_deployer::registry::{CanisterId, CreationStatus};
use vault_deployer::release::{AssetFullStatus, DownloadStatus, ReleaseFullStatus};
use vault_deployer::sim::{fixtures, SimulatedWorld, FRONTEND_ASSET, MODULE_ASSET};
use vault_deployer::{Deployer, DeployerConfig};

fn release(deployer: &Deployer, tag: &str) -> ReleaseFullStatus {
    deployer
        .get_releases_full_status()
        .releases
        .into_iter()
        .find(|r| r.tag_name == tag)
        .unwrap()
}

fn asset(release: &ReleaseFullStatus, name: &str) -> AssetFullStatus {
    release.assets.iter().find(|a| a.name == name).cloned().unwrap()
}

/// Tick until `tag` is deployment ready, calling `check` on every status seen on the way.
async fn reingest<F>(deployer: &Deployer, tag: &str, mut check: F) -> usize
where
    F: FnMut(&ReleaseFullStatus),
{
    for ticks in 0..MAX_TICKS {
        let status = release(deployer, tag);
        check(&status);
        if status.is_deployment_ready {
            return ticks;
        }
        deployer.tick().await;
    }
    panic!("{} never became deployment ready again", tag);
}

async fn deploy(world: &SimulatedWorld, deployer: &Deployer) -> CanisterId {
    fund(world, &alice(), deployer.installer());
    let record = deployer.create_storage(&alice(), create_new()).await.unwrap();
    match drive(deployer, record.id).await.status {
        CreationStatus::Completed { canister_id } => canister_id,
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_changed_module_is_downloaded_again() {
    let dir = TempDir::new().unwrap();
    let world = SimulatedWorld::new();
    world.publish_release("v1.0.0", false, false, 2048).unwrap();
    let deployer = deployer(&world, DeployerConfig::for_testing(dir.path())).await;
    ingest(&deployer).await;

    let old_digest = asset(&release(&deployer, "v1.0.0"), MODULE_ASSET).sha256.unwrap();
    let fetches = world.host.fetch_count();

    let rebuilt = fixtures::sample_module("v1.0.0-rebuilt", 3072);
    let new_hash = IntegrityVerifier::calculate_checksum(&rebuilt);
    world.host.replace_asset("v1.0.0", MODULE_ASSET, rebuilt);

    let summary = deployer.refresh_releases().await.unwrap();
    assert_eq!(summary.invalidated_assets, 1);
    assert!(!deployer.get_releases_full_status().has_deployment_ready_release);

    let stale = release(&deployer, "v1.0.0");
    let module = asset(&stale, MODULE_ASSET);
    assert_eq!(module.download_status, DownloadStatus::NotStarted);
    assert_eq!(module.size, 3072);
    assert_eq!(module.sha256.as_deref(), Some(new_hash.to_digest().as_str()));
    assert_ne!(module.sha256.unwrap(), old_digest);
    // The frontend did not change and keeps its download
    assert!(asset(&stale, FRONTEND_ASSET).download_status.is_completed());

    let ticks = reingest(&deployer, "v1.0.0", |status| {
        if status.is_deployment_ready {
            assert_eq!(
                asset(status, MODULE_ASSET).download_status,
                DownloadStatus::Completed { size: 3072 }
            );
        }
    })
    .await;
    // 3 KiB in 1 KiB chunks
    assert!(ticks >= 3);
    assert!(world.host.fetch_count() >= fetches + 3);

    let canister_id = deploy(&world, &deployer).await;
    assert_eq!(world.platform.installed_module(&canister_id), Some(new_hash));
}

#[tokio::test]
async fn test_changed_frontend_is_extracted_again() {
    let dir = TempDir::new().unwrap();
    let world = SimulatedWorld::new();
    world.publish_release("v1.0.0", false, false, 2048).unwrap();
    let deployer = deployer(&world, DeployerConfig::for_testing(dir.path())).await;
    ingest(&deployer).await;

    let hotfix = fixtures::sample_frontend("v1.0.0-hotfix");
    let archive: Bytes = fixtures::tar_gz(&hotfix).unwrap();
    world.host.replace_asset("v1.0.0", FRONTEND_ASSET, archive);

    let summary = deployer.refresh_releases().await.unwrap();
    assert_eq!(summary.invalidated_assets, 1);

    let stale = release(&deployer, "v1.0.0");
    assert!(!stale.is_deployment_ready);
    let frontend = asset(&stale, FRONTEND_ASSET);
    assert_eq!(frontend.download_status, DownloadStatus::NotStarted);
    assert!(!frontend.extraction_status.unwrap().is_complete());

    let new_index = IntegrityVerifier::calculate_checksum(&hotfix[0].1);
    reingest(&deployer, "v1.0.0", |status| {
        if status.is_deployment_ready {
            let frontend = asset(status, FRONTEND_ASSET);
            let files = frontend.extraction_status.unwrap();
            let index = files
                .files()
                .unwrap()
                .iter()
                .find(|f| f.key == "index.html")
                .cloned()
                .unwrap();
            assert_eq!(index.sha256, new_index);
        }
    })
    .await;

    let canister_id = deploy(&world, &deployer).await;
    let index = world.platform.served_asset(&canister_id, "/index.html").unwrap();
    assert!(String::from_utf8_lossy(&index.content).contains("vault v1.0.0-hotfix"));
}
