#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use vault_deployer::deploy::CreateStorageOptions;
use vault_deployer::registry::{CanisterId, Principal, StorageRecord, StorageTarget};
use vault_deployer::sim::SimulatedWorld;
use vault_deployer::{Deployer, DeployerConfig};

pub const MAX_TICKS: usize = 200;
pub const FUNDS: u128 = 1_000_000_000;

pub fn alice() -> Principal {
    Principal::new("alice")
}

pub fn bob() -> Principal {
    Principal::new("bob")
}

pub async fn deployer(world: &SimulatedWorld, config: DeployerConfig) -> Arc<Deployer> {
    Arc::new(
        Deployer::new(config, world.release_host(), world.collaborators())
            .await
            .unwrap(),
    )
}

/// Config backed by a sqlite file so a second deployer can pick up where the first stopped.
pub fn file_backed_config(dir: &Path) -> DeployerConfig {
    let mut config = DeployerConfig::for_testing(dir);
    config.database_url = format!("sqlite://{}?mode=rwc", dir.join("deployer.db").display());
    config
}

/// Refresh, then tick until every release in the catalog is deployment ready.
pub async fn ingest(deployer: &Deployer) {
    deployer.refresh_releases().await.unwrap();
    for _ in 0..MAX_TICKS {
        let status = deployer.get_releases_full_status();
        if !status.releases.is_empty() && status.releases.iter().all(|r| r.is_deployment_ready) {
            return;
        }
        deployer.tick().await;
    }
    panic!("releases never became deployment ready");
}

/// Tick until the record has no work left and return it.
pub async fn drive(deployer: &Deployer, id: u64) -> StorageRecord {
    for _ in 0..MAX_TICKS {
        let record = deployer.get_storage(id).await.unwrap().unwrap();
        if !record.is_active() {
            return record;
        }
        deployer.tick().await;
    }
    panic!("storage {} never settled", id);
}

pub fn fund(world: &SimulatedWorld, owner: &Principal, spender: &Principal) {
    world.ledger.mint(owner, FUNDS);
    world.ledger.approve(owner, spender, FUNDS);
}

pub fn create_new() -> CreateStorageOptions {
    CreateStorageOptions {
        target: StorageTarget::Create {
            initial_cycles: 1_000_000_000_000,
            subnet_hint: None,
        },
        release_selector: None,
        init_arg: None,
    }
}

pub fn use_existing(canister_id: &CanisterId) -> CreateStorageOptions {
    CreateStorageOptions {
        target: StorageTarget::Existing {
            canister_id: canister_id.clone(),
        },
        release_selector: None,
        init_arg: None,
    }
}
