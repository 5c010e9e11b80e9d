use crate::deploy::{
    AssetCommit, ComputePlatform, InstallMode, Permission, PlatformError, StorageInstance,
};
use crate::integrity::{frontend_digest, ContentHash, IntegrityVerifier};
use crate::registry::{CanisterId, Principal};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone)]
pub struct ServedAsset {
    pub content_type: String,
    pub sha256: ContentHash,
    pub content: Bytes,
}

#[derive(Default)]
struct SimCanister {
    controllers: Vec<Principal>,
    chunk_store: HashMap<ContentHash, Bytes>,
    module_hash: Option<ContentHash>,
    installs: Vec<InstallMode>,
    batches: HashMap<u64, HashMap<u64, Bytes>>,
    /// `None` until the first batch commit
    frontend: Option<BTreeMap<String, ServedAsset>>,
    entries: BTreeMap<String, Bytes>,
    /// Explicit grants keyed by normalized entry path, root is `""`
    permissions: BTreeMap<String, BTreeMap<Principal, Permission>>,
}

impl SimCanister {
    fn is_controller(&self, principal: &Principal) -> bool {
        self.controllers.contains(principal)
    }

    /// Strongest grant on `path` or any of its ancestors
    fn effective_permission(&self, path: &str, principal: &Principal) -> Option<Permission> {
        ancestors(path)
            .filter_map(|p| self.permissions.get(p).and_then(|grants| grants.get(principal)))
            .max()
            .copied()
    }

    fn can_manage(&self, path: &str, principal: &Principal) -> bool {
        self.is_controller(principal)
            || self.effective_permission(path, principal) == Some(Permission::ReadWriteManage)
    }

    fn can_write(&self, path: &str, principal: &Principal) -> bool {
        self.effective_permission(path, principal)
            .is_some_and(|p| p >= Permission::ReadWrite)
    }
}

#[derive(Default)]
struct PlatformState {
    canisters: HashMap<CanisterId, SimCanister>,
    next_canister: u64,
    next_batch: u64,
    next_chunk: u64,
    failing_uploads: u32,
    failing_commits: u32,
}

/// Compute platform plus the storage instances running on it.
#[derive(Default)]
pub struct SimulatedPlatform {
    state: Mutex<PlatformState>,
}

fn normalize(entry: Option<&str>) -> String {
    entry
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// `a/b/c`, `a/b`, `a`, then the root
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut next = Some(path);
    std::iter::from_fn(move || {
        let current = next?;
        next = match current.rfind('/') {
            Some(i) => Some(&current[..i]),
            None if current.is_empty() => None,
            None => Some(""),
        };
        Some(current)
    })
}

fn unauthorized(caller: &Principal, canister: &CanisterId) -> PlatformError {
    PlatformError::Unauthorized(format!("{} may not manage {}", caller, canister))
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_canister(&self, controllers: Vec<Principal>) -> CanisterId {
        let mut state = self.state.lock();
        state.next_canister += 1;
        let canister_id = CanisterId::new(format!("sim-{:05}-cai", state.next_canister));
        state.canisters.insert(
            canister_id.clone(),
            SimCanister {
                controllers,
                ..SimCanister::default()
            },
        );
        canister_id
    }

    /// Replace the controller list without any authorization check
    pub fn set_controllers(&self, canister: &CanisterId, controllers: Vec<Principal>) {
        if let Some(c) = self.state.lock().canisters.get_mut(canister) {
            c.controllers = controllers;
        }
    }

    pub fn controllers_of(&self, canister: &CanisterId) -> Vec<Principal> {
        self.state
            .lock()
            .canisters
            .get(canister)
            .map(|c| c.controllers.clone())
            .unwrap_or_default()
    }

    pub fn installed_module(&self, canister: &CanisterId) -> Option<ContentHash> {
        self.state.lock().canisters.get(canister)?.module_hash
    }

    pub fn installs(&self, canister: &CanisterId) -> Vec<InstallMode> {
        self.state
            .lock()
            .canisters
            .get(canister)
            .map(|c| c.installs.clone())
            .unwrap_or_default()
    }

    pub fn served_asset(&self, canister: &CanisterId, key: &str) -> Option<ServedAsset> {
        self.state
            .lock()
            .canisters
            .get(canister)?
            .frontend
            .as_ref()?
            .get(key)
            .cloned()
    }

    pub fn served_keys(&self, canister: &CanisterId) -> Vec<String> {
        self.state
            .lock()
            .canisters
            .get(canister)
            .and_then(|c| c.frontend.as_ref())
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn canister_count(&self) -> usize {
        self.state.lock().canisters.len()
    }

    /// Fail the next `count` chunk pushes, module and frontend alike
    pub fn fail_next_uploads(&self, count: u32) {
        self.state.lock().failing_uploads = count;
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.state.lock().failing_commits = count;
    }

    fn with_canister<T>(
        &self,
        canister: &CanisterId,
        f: impl FnOnce(&mut SimCanister, &mut u64) -> Result<T, PlatformError>,
    ) -> Result<T, PlatformError> {
        let mut state = self.state.lock();
        let PlatformState {
            canisters,
            next_batch,
            ..
        } = &mut *state;
        let c = canisters
            .get_mut(canister)
            .ok_or_else(|| PlatformError::Rejected(format!("canister {} not found", canister)))?;
        f(c, next_batch)
    }

    fn take_failure(&self, commit: bool) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        let counter = if commit {
            &mut state.failing_commits
        } else {
            &mut state.failing_uploads
        };
        if *counter > 0 {
            *counter -= 1;
            return Err(PlatformError::Unavailable("simulated failure".into()));
        }
        Ok(())
    }

    fn next_chunk_id(&self) -> u64 {
        let mut state = self.state.lock();
        state.next_chunk += 1;
        state.next_chunk
    }
}

fn require_module(c: &SimCanister, canister: &CanisterId) -> Result<(), PlatformError> {
    if c.module_hash.is_none() {
        return Err(PlatformError::Rejected(format!("{} has no module installed", canister)));
    }
    Ok(())
}

#[async_trait]
impl ComputePlatform for SimulatedPlatform {
    async fn clear_chunk_store(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<(), PlatformError> {
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            c.chunk_store.clear();
            Ok(())
        })
    }

    async fn upload_chunk(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        chunk: Bytes,
    ) -> Result<ContentHash, PlatformError> {
        self.take_failure(false)?;
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            let hash = IntegrityVerifier::calculate_checksum(&chunk);
            c.chunk_store.insert(hash, chunk);
            Ok(hash)
        })
    }

    async fn install_chunked_code(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        mode: InstallMode,
        chunk_hashes: Vec<ContentHash>,
        module_hash: ContentHash,
        _arg: Vec<u8>,
    ) -> Result<(), PlatformError> {
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            match (mode, c.module_hash.is_some()) {
                (InstallMode::Install, true) => {
                    return Err(PlatformError::Rejected("module already installed".into()))
                }
                (InstallMode::Upgrade, false) => {
                    return Err(PlatformError::Rejected("nothing to upgrade".into()))
                }
                _ => {}
            }

            let mut module = BytesMut::new();
            for hash in &chunk_hashes {
                let chunk = c.chunk_store.get(hash).ok_or_else(|| {
                    PlatformError::Rejected(format!("chunk {} not in store", hash.to_hex()))
                })?;
                module.extend_from_slice(chunk);
            }
            IntegrityVerifier::verify_data(&module, &module_hash)
                .map_err(|e| PlatformError::Rejected(e.to_string()))?;

            if mode != InstallMode::Upgrade {
                c.frontend = None;
                c.entries.clear();
                c.permissions.clear();
                c.permissions
                    .entry(String::new())
                    .or_default()
                    .insert(caller.clone(), Permission::ReadWriteManage);
            }
            c.module_hash = Some(module_hash);
            c.installs.push(mode);
            Ok(())
        })
    }

    async fn controllers(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<Vec<Principal>, PlatformError> {
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            Ok(c.controllers.clone())
        })
    }

    async fn update_controllers(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        controllers: Vec<Principal>,
    ) -> Result<(), PlatformError> {
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            c.controllers = controllers;
            Ok(())
        })
    }

    async fn module_hash(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<Option<ContentHash>, PlatformError> {
        self.with_canister(canister, |c, _| {
            if !c.is_controller(caller) {
                return Err(unauthorized(caller, canister));
            }
            Ok(c.module_hash)
        })
    }
}

#[async_trait]
impl StorageInstance for SimulatedPlatform {
    async fn create_batch(
        &self,
        caller: &Principal,
        canister: &CanisterId,
    ) -> Result<u64, PlatformError> {
        self.with_canister(canister, |c, next_batch| {
            require_module(c, canister)?;
            if !c.can_manage("", caller) {
                return Err(unauthorized(caller, canister));
            }
            *next_batch += 1;
            c.batches.insert(*next_batch, HashMap::new());
            Ok(*next_batch)
        })
    }

    async fn create_chunk(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        batch_id: u64,
        content: Bytes,
    ) -> Result<u64, PlatformError> {
        self.take_failure(false)?;
        let chunk_id = self.next_chunk_id();
        self.with_canister(canister, |c, _| {
            if !c.can_manage("", caller) {
                return Err(unauthorized(caller, canister));
            }
            let batch = c
                .batches
                .get_mut(&batch_id)
                .ok_or_else(|| PlatformError::Rejected(format!("batch {} not found", batch_id)))?;
            batch.insert(chunk_id, content);
            Ok(chunk_id)
        })
    }

    async fn commit_batch(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        batch_id: u64,
        assets: Vec<AssetCommit>,
    ) -> Result<(), PlatformError> {
        self.take_failure(true)?;
        self.with_canister(canister, |c, _| {
            if !c.can_manage("", caller) {
                return Err(unauthorized(caller, canister));
            }
            let batch = c
                .batches
                .get(&batch_id)
                .ok_or_else(|| PlatformError::Rejected(format!("batch {} not found", batch_id)))?;

            let mut served = BTreeMap::new();
            for asset in assets {
                let mut content = BytesMut::new();
                for chunk_id in &asset.chunk_ids {
                    let chunk = batch.get(chunk_id).ok_or_else(|| {
                        let reason = format!("chunk {} not in batch {}", chunk_id, batch_id);
                        PlatformError::Rejected(reason)
                    })?;
                    content.extend_from_slice(chunk);
                }
                IntegrityVerifier::verify_data(&content, &asset.sha256)
                    .map_err(|e| PlatformError::Rejected(format!("{}: {}", asset.key, e)))?;
                served.insert(
                    asset.key,
                    ServedAsset {
                        content_type: asset.content_type,
                        sha256: asset.sha256,
                        content: content.freeze(),
                    },
                );
            }

            c.batches.remove(&batch_id);
            c.frontend = Some(served);
            Ok(())
        })
    }

    async fn frontend_digest(
        &self,
        canister: &CanisterId,
    ) -> Result<Option<ContentHash>, PlatformError> {
        self.with_canister(canister, |c, _| {
            Ok(c.frontend.as_ref().map(|assets| {
                frontend_digest(assets.iter().map(|(key, asset)| (key.as_str(), &asset.sha256)))
            }))
        })
    }

    async fn create_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
        content: Bytes,
    ) -> Result<(), PlatformError> {
        let path = normalize(Some(path));
        self.with_canister(canister, |c, _| {
            require_module(c, canister)?;
            if !c.can_write(&path, caller) {
                return Err(unauthorized(caller, canister));
            }
            if c.entries.contains_key(&path) {
                return Err(PlatformError::Rejected(format!("{} already exists", path)));
            }
            c.entries.insert(path, content);
            Ok(())
        })
    }

    async fn update_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
        content: Bytes,
    ) -> Result<(), PlatformError> {
        let path = normalize(Some(path));
        self.with_canister(canister, |c, _| {
            if !c.can_write(&path, caller) {
                return Err(unauthorized(caller, canister));
            }
            match c.entries.get_mut(&path) {
                Some(existing) => {
                    *existing = content;
                    Ok(())
                }
                None => Err(PlatformError::Rejected(format!("{} not found", path))),
            }
        })
    }

    async fn delete_entry(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        path: &str,
    ) -> Result<(), PlatformError> {
        let path = normalize(Some(path));
        self.with_canister(canister, |c, _| {
            if !c.can_write(&path, caller) {
                return Err(unauthorized(caller, canister));
            }
            c.entries
                .remove(&path)
                .map(|_| ())
                .ok_or_else(|| PlatformError::Rejected(format!("{} not found", path)))
        })
    }

    async fn grant_permission(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
        permission: Permission,
    ) -> Result<(), PlatformError> {
        let path = normalize(entry);
        self.with_canister(canister, |c, _| {
            require_module(c, canister)?;
            if !c.can_manage(&path, caller) {
                return Err(unauthorized(caller, canister));
            }
            c.permissions
                .entry(path)
                .or_default()
                .insert(principal.clone(), permission);
            Ok(())
        })
    }

    async fn revoke_permission(
        &self,
        caller: &Principal,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
    ) -> Result<(), PlatformError> {
        let path = normalize(entry);
        self.with_canister(canister, |c, _| {
            if !c.can_manage(&path, caller) {
                return Err(unauthorized(caller, canister));
            }
            if let Some(grants) = c.permissions.get_mut(&path) {
                grants.remove(principal);
            }
            Ok(())
        })
    }

    async fn has_permission(
        &self,
        canister: &CanisterId,
        entry: Option<&str>,
        principal: &Principal,
        permission: Permission,
    ) -> Result<bool, PlatformError> {
        let path = normalize(entry);
        self.with_canister(canister, |c, _| {
            Ok(c.effective_permission(&path, principal)
                .is_some_and(|p| p >= permission))
        })
    }

    async fn list_permitted(
        &self,
        canister: &CanisterId,
        entry: Option<&str>,
    ) -> Result<Vec<(Principal, Permission)>, PlatformError> {
        let path = normalize(entry);
        self.with_canister(canister, |c, _| {
            Ok(c.permissions
                .get(&path)
                .map(|grants| grants.iter().map(|(p, perm)| (p.clone(), *perm)).collect())
                .unwrap_or_default())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str) -> Principal {
        Principal::new(id)
    }

    async fn installed(platform: &SimulatedPlatform, installer: &Principal) -> CanisterId {
        let canister = platform.create_canister(vec![installer.clone()]);
        let module = Bytes::from_static(b"\0asm module");
        let hash = platform.upload_chunk(installer, &canister, module.clone()).await.unwrap();
        platform
            .install_chunked_code(
                installer,
                &canister,
                InstallMode::Install,
                vec![hash],
                IntegrityVerifier::calculate_checksum(&module),
                vec![],
            )
            .await
            .unwrap();
        canister
    }

    #[test]
    fn test_ancestors() {
        let chain: Vec<&str> = ancestors("a/b/c").collect();
        assert_eq!(chain, vec!["a/b/c", "a/b", "a", ""]);
        assert_eq!(ancestors("").collect::<Vec<_>>(), vec![""]);
        assert_eq!(normalize(Some("/docs//2024/")), "docs/2024");
    }

    #[tokio::test]
    async fn test_install_rejects_wrong_hash() {
        let platform = SimulatedPlatform::new();
        let installer = principal("deployer");
        let canister = platform.create_canister(vec![installer.clone()]);
        let hash = platform
            .upload_chunk(&installer, &canister, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let result = platform
            .install_chunked_code(
                &installer,
                &canister,
                InstallMode::Install,
                vec![hash],
                ContentHash([0u8; 32]),
                vec![],
            )
            .await;
        assert!(matches!(result, Err(PlatformError::Rejected(_))));
        assert_eq!(platform.installed_module(&canister), None);
    }

    #[tokio::test]
    async fn test_module_hash_restricted_to_controllers() {
        let platform = SimulatedPlatform::new();
        let installer = principal("deployer");
        let canister = installed(&platform, &installer).await;

        assert!(platform.module_hash(&installer, &canister).await.unwrap().is_some());
        assert!(matches!(
            platform.module_hash(&principal("mallory"), &canister).await,
            Err(PlatformError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_permissions_are_inherited() {
        let platform = SimulatedPlatform::new();
        let installer = principal("deployer");
        let alice = principal("alice");
        let canister = installed(&platform, &installer).await;

        platform
            .grant_permission(&installer, &canister, Some("docs"), &alice, Permission::ReadWrite)
            .await
            .unwrap();

        assert!(platform
            .has_permission(&canister, Some("docs/2024/report.pdf"), &alice, Permission::Read)
            .await
            .unwrap());
        assert!(!platform
            .has_permission(&canister, Some("docs"), &alice, Permission::ReadWriteManage)
            .await
            .unwrap());
        assert!(!platform
            .has_permission(&canister, None, &alice, Permission::Read)
            .await
            .unwrap());

        platform
            .create_entry(&alice, &canister, "docs/a.txt", Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert!(platform
            .create_entry(&alice, &canister, "photos/b.jpg", Bytes::from_static(b"b"))
            .await
            .is_err());

        let explicit = platform.list_permitted(&canister, Some("docs")).await.unwrap();
        assert_eq!(explicit, vec![(alice, Permission::ReadWrite)]);
    }

    #[tokio::test]
    async fn test_commit_replaces_frontend() {
        let platform = SimulatedPlatform::new();
        let installer = principal("deployer");
        let canister = installed(&platform, &installer).await;
        assert_eq!(platform.frontend_digest(&canister).await.unwrap(), None);

        let batch = platform.create_batch(&installer, &canister).await.unwrap();
        let content = Bytes::from_static(b"<html></html>");
        let chunk = platform
            .create_chunk(&installer, &canister, batch, content.clone())
            .await
            .unwrap();
        let sha256 = IntegrityVerifier::calculate_checksum(&content);
        platform
            .commit_batch(
                &installer,
                &canister,
                batch,
                vec![AssetCommit {
                    key: "/index.html".into(),
                    content_type: "text/html".into(),
                    sha256,
                    chunk_ids: vec![chunk],
                }],
            )
            .await
            .unwrap();

        assert_eq!(
            platform.frontend_digest(&canister).await.unwrap(),
            Some(frontend_digest(vec![("/index.html", &sha256)]))
        );
        assert_eq!(platform.served_asset(&canister, "/index.html").unwrap().content, content);
    }
}
