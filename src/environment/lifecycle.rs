use super::provisioner::Provisioner;
use super::registry::{EnvironmentHandle, EnvironmentRegistry};
use super::EnvironmentError;
use crate::api::worker::{JobControlApi, ScratchCompletion};
use crate::api::SigningIdentity;
use crate::config::DEFAULT_SCRATCH_DAYS;
use crate::job::model::{EnvironmentRequest, ScratchRequest, ScratchRequestStatus};
use crate::project::ProjectConfig;
use chrono::Utc;

/// Per-job environment lifecycle. Transitions are monotonic within a run;
/// the only re-entry is an explicit operator retry of a failed or pending
/// scratch request, which starts a fresh `Provisioning` pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentState {
    NeedsProvision,
    Provisioning,
    Provisioned,
    ProvisionFailed,
    NeedsImport,
    Importing,
    Imported,
    ImportFailed,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NeedsProvision => "needs_provision",
            Self::Provisioning => "provisioning",
            Self::Provisioned => "provisioned",
            Self::ProvisionFailed => "provision_failed",
            Self::NeedsImport => "needs_import",
            Self::Importing => "importing",
            Self::Imported => "imported",
            Self::ImportFailed => "import_failed",
        };
        write!(f, "{name}")
    }
}

/// Provider-issued fields for a freshly created scratch environment, held
/// until the caller records the acquisition and forwards them via
/// [`EnvironmentLifecycle::confirm`].
#[derive(Debug, Clone)]
pub struct PendingCompletion {
    pub request_id: String,
    pub completion: ScratchCompletion,
}

/// The environment a run executes against, plus whether this run created it
/// (and therefore owes a remote teardown in cleanup).
#[derive(Debug, Clone)]
pub struct AcquiredEnvironment {
    pub handle: EnvironmentHandle,
    pub scratch_created: bool,
    pub pending_completion: Option<PendingCompletion>,
}

pub struct EnvironmentLifecycle<'a> {
    registry: &'a EnvironmentRegistry,
    provisioner: &'a Provisioner,
    state: EnvironmentState,
}

impl<'a> EnvironmentLifecycle<'a> {
    pub fn new(registry: &'a EnvironmentRegistry, provisioner: &'a Provisioner) -> Self {
        Self {
            registry,
            provisioner,
            state: EnvironmentState::NeedsImport,
        }
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// Materializes or imports the environment the job asked for and
    /// registers it locally under `alias`.
    pub fn acquire(
        &mut self,
        api: &dyn JobControlApi,
        identity: &SigningIdentity,
        project: &ProjectConfig,
        job_id: &str,
        alias: &str,
        request: &EnvironmentRequest<'_>,
        retry_scratch: bool,
    ) -> Result<AcquiredEnvironment, EnvironmentError> {
        match request {
            EnvironmentRequest::Scratch(scratch) => {
                let provisionable = matches!(scratch.status, ScratchRequestStatus::Pending)
                    || (retry_scratch && matches!(scratch.status, ScratchRequestStatus::Failed));
                if provisionable {
                    self.state = EnvironmentState::NeedsProvision;
                    return self.provision(project, alias, scratch);
                }
                if matches!(scratch.status, ScratchRequestStatus::Success) {
                    // Already materialized by an earlier attempt; the control
                    // plane holds the credential, keyed by the request id.
                    return self.import(api, identity, job_id, alias, &scratch.id);
                }
                Err(EnvironmentError::ScratchNotRetryable {
                    request_id: scratch.id.clone(),
                    status: format!("{:?}", scratch.status).to_lowercase(),
                })
            }
            EnvironmentRequest::ExistingUser(user_id) => {
                self.import(api, identity, job_id, alias, user_id)
            }
        }
    }

    fn provision(
        &mut self,
        project: &ProjectConfig,
        alias: &str,
        scratch: &ScratchRequest,
    ) -> Result<AcquiredEnvironment, EnvironmentError> {
        self.state = EnvironmentState::Provisioning;
        match self.provision_inner(project, alias, scratch) {
            Ok(acquired) => {
                self.state = EnvironmentState::Provisioned;
                Ok(acquired)
            }
            Err(err) => {
                self.state = EnvironmentState::ProvisionFailed;
                Err(err)
            }
        }
    }

    fn provision_inner(
        &self,
        project: &ProjectConfig,
        alias: &str,
        scratch: &ScratchRequest,
    ) -> Result<AcquiredEnvironment, EnvironmentError> {
        let profile = project.scratch_profiles.get(&scratch.profile).ok_or_else(|| {
            EnvironmentError::UnknownScratchProfile {
                profile: scratch.profile.clone(),
            }
        })?;
        let days = scratch
            .days
            .or(profile.days)
            .unwrap_or(DEFAULT_SCRATCH_DAYS);

        self.provisioner
            .create_scratch(&profile.definition, alias, days)?;
        let details = self.provisioner.display(alias)?;

        let handle = EnvironmentHandle {
            alias: alias.to_string(),
            provider_id: details.provider_id.clone(),
            principal: details.principal.clone(),
            instance_url: details.instance_url.clone(),
            access_token: details.access_token.clone(),
            scratch: true,
            last_refreshed: Utc::now(),
        };
        self.registry.import(&handle)?;

        // The completion callback is deliberately deferred: the caller must
        // record the created environment first so cleanup covers it even if
        // the callback fails.
        Ok(AcquiredEnvironment {
            handle,
            scratch_created: true,
            pending_completion: Some(PendingCompletion {
                request_id: scratch.id.clone(),
                completion: ScratchCompletion {
                    provider_id: details.provider_id,
                    principal: details.principal,
                    instance_url: details.instance_url,
                    principal_id: details.principal_id,
                    auth_url: details.auth_url,
                },
            }),
        })
    }

    /// Records a freshly created scratch environment with the control plane,
    /// exactly once per provision. No-op for imported environments.
    pub fn confirm(
        &self,
        api: &dyn JobControlApi,
        identity: &SigningIdentity,
        acquired: &AcquiredEnvironment,
    ) -> Result<(), EnvironmentError> {
        if let Some(pending) = &acquired.pending_completion {
            api.complete_scratch_request(identity, &pending.request_id, &pending.completion)?;
        }
        Ok(())
    }

    fn import(
        &mut self,
        api: &dyn JobControlApi,
        identity: &SigningIdentity,
        job_id: &str,
        alias: &str,
        target_id: &str,
    ) -> Result<AcquiredEnvironment, EnvironmentError> {
        self.state = EnvironmentState::Importing;
        match self.import_inner(api, identity, job_id, alias, target_id) {
            Ok(acquired) => {
                self.state = EnvironmentState::Imported;
                Ok(acquired)
            }
            Err(err) => {
                self.state = EnvironmentState::ImportFailed;
                Err(err)
            }
        }
    }

    fn import_inner(
        &self,
        api: &dyn JobControlApi,
        identity: &SigningIdentity,
        job_id: &str,
        alias: &str,
        target_id: &str,
    ) -> Result<AcquiredEnvironment, EnvironmentError> {
        let bundle = api.fetch_environment_credential(identity, job_id, target_id)?;

        let handle = EnvironmentHandle {
            alias: alias.to_string(),
            provider_id: bundle.provider_id.clone(),
            principal: bundle.principal.clone(),
            instance_url: bundle.instance_url.clone(),
            access_token: bundle.access_token.clone(),
            scratch: false,
            last_refreshed: Utc::now(),
        };
        // Conflict-checked before anything touches the tool keychain.
        self.registry.import(&handle)?;
        self.provisioner
            .import_access_token(alias, &bundle.instance_url, &bundle.access_token)?;

        Ok(AcquiredEnvironment {
            handle,
            scratch_created: false,
            pending_completion: None,
        })
    }

    /// Tears down the run's environment record. Always removes the local
    /// registry entry; requests remote release (tool logout) only for a
    /// scratch environment this run created. Runs in the orchestrator's
    /// terminal path regardless of how the run ended.
    pub fn cleanup(&self, acquired: &AcquiredEnvironment) -> Result<(), EnvironmentError> {
        self.registry.remove(&acquired.handle.alias)?;
        if acquired.scratch_created {
            self.provisioner.logout(&acquired.handle.alias)?;
        }
        Ok(())
    }
}
