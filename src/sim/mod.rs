//! In-memory stand-ins for every external system the deployer talks to.

pub mod fixtures;
pub mod host;
pub mod ledger;
pub mod platform;

pub use host::SimulatedReleaseHost;
pub use ledger::{LedgerBlock, SimulatedLedger, DEFAULT_TRANSFER_FEE};
pub use platform::{ServedAsset, SimulatedPlatform};

use crate::deploy::Collaborators;
use crate::release::ReleaseHost;
use bytes::Bytes;
use std::io;
use std::sync::Arc;

pub const MODULE_ASSET: &str = "vault.wasm";
pub const FRONTEND_ASSET: &str = "vault-frontend.tar.gz";

/// One release host, one ledger and one platform sharing their instances.
#[derive(Clone)]
pub struct SimulatedWorld {
    pub host: Arc<SimulatedReleaseHost>,
    pub platform: Arc<SimulatedPlatform>,
    pub ledger: Arc<SimulatedLedger>,
}

impl Default for SimulatedWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedWorld {
    pub fn new() -> Self {
        let platform = Arc::new(SimulatedPlatform::new());
        Self {
            host: Arc::new(SimulatedReleaseHost::new()),
            ledger: Arc::new(SimulatedLedger::new(platform.clone())),
            platform,
        }
    }

    pub fn release_host(&self) -> Arc<dyn ReleaseHost> {
        self.host.clone()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            gateway: self.ledger.clone(),
            platform: self.platform.clone(),
            storage: self.platform.clone(),
        }
    }

    /// Publish a release carrying a module of `module_len` bytes and the sample frontend.
    pub fn publish_release(
        &self,
        tag: &str,
        draft: bool,
        prerelease: bool,
        module_len: usize,
    ) -> io::Result<()> {
        let frontend = fixtures::tar_gz(&fixtures::sample_frontend(tag))?;
        self.host.add_release(
            tag,
            draft,
            prerelease,
            vec![
                (MODULE_ASSET, fixtures::sample_module(tag, module_len)),
                (FRONTEND_ASSET, frontend),
                ("CHECKSUMS.txt", Bytes::from(format!("release {}\n", tag))),
            ],
        );
        Ok(())
    }
}
