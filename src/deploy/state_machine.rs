use crate::deploy::error::{DeployError, DeployResult};
use crate::registry::CreationStatus;

/// Allowed moves between creation statuses.
///
/// Creation walks the stages strictly forward and may fail from any
/// non-terminal stage. An upgrade re-enters the install and upload stages
/// from `Completed` and always ends in `Completed`, whether it succeeds or not.
pub struct CreationStateMachine;

impl CreationStateMachine {
    pub fn validate(
        from: &CreationStatus,
        to: &CreationStatus,
        upgrading: bool,
    ) -> DeployResult<()> {
        use CreationStatus::*;

        let allowed = match (from, to) {
            (from, Failed { .. }) => !from.is_terminal() && !upgrading,

            (Pending, CheckingAllowance) => true,
            (Pending, CanisterCreated { .. }) => true,
            (CheckingAllowance, TransferringIcp { .. }) => true,
            (TransferringIcp { .. }, NotifyingCmc { .. }) => true,
            (NotifyingCmc { .. }, CanisterCreated { .. }) => true,
            (CanisterCreated { canister_id: a }, InstallingWasm { canister_id: b, progress }) => {
                a == b && progress.processed == 0
            }

            (
                InstallingWasm { canister_id: a, progress: p },
                InstallingWasm { canister_id: b, progress: q },
            )
            | (
                UploadingFrontend { canister_id: a, progress: p },
                UploadingFrontend { canister_id: b, progress: q },
            ) => a == b && p.total == q.total && p.processed <= q.processed,

            (
                InstallingWasm { canister_id: a, .. },
                UploadingFrontend {
                    canister_id: b,
                    progress,
                },
            ) => {
                a == b && progress.processed == 0
            }
            (UploadingFrontend { canister_id: a, .. }, UpdatingControllers { canister_id: b }) => {
                a == b && !upgrading
            }
            (UpdatingControllers { canister_id: a }, RevokingInstallerPermission { canister_id: b })
            | (UpdatingControllers { canister_id: a }, Completed { canister_id: b })
            | (
                RevokingInstallerPermission { canister_id: a },
                Completed { canister_id: b },
            ) => a == b,

            // Upgrades
            (Completed { canister_id: a }, InstallingWasm { canister_id: b, .. })
            | (Completed { canister_id: a }, UploadingFrontend { canister_id: b, .. }) => {
                a == b && upgrading
            }
            (InstallingWasm { canister_id: a, .. }, Completed { canister_id: b })
            | (UploadingFrontend { canister_id: a, .. }, Completed { canister_id: b }) => {
                a == b && upgrading
            }

            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(DeployError::InvalidTransition {
                from: from.label(),
                to: to.label(),
            })
        }
    }
}
