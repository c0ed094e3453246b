//! Provisioning strategies.
//!
//! A VM is either a local interpreter process or a VM provisioned on a
//! remote virtualization host. The two differ only in how the
//! [`RuntimeHandle`] is obtained; once it exists, the registry and the
//! controller treat both the same way.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, VmError};
use crate::registry::{SessionRegistry, VmId, VmSnapshot};
use crate::runtime::{LocalLauncher, RuntimeHandle};

/// Which provisioning strategy backs a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmKind {
    Local,
    Remote,
}

impl VmKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VmKind::Local => "local",
            VmKind::Remote => "remote",
        }
    }
}

impl fmt::Display for VmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "basic" => Ok(VmKind::Local),
            "remote" | "xcpng" => Ok(VmKind::Remote),
            other => Err(format!("unknown VM kind '{other}' (expected local or remote)")),
        }
    }
}

/// Connection parameters for a remotely provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Virtualization host address.
    pub host: String,
    /// Login user on the host.
    pub username: String,
    /// Name of the environment variable holding the password. The secret
    /// itself is never stored.
    pub password_env: Option<String>,
    /// Template the VM is cloned from.
    pub template: String,
}

impl RemoteConfig {
    /// Resolves the credentials reference against the environment.
    pub fn credentials(&self) -> Result<Credentials, ProvisionError> {
        let password = match self.password_env.as_deref() {
            None | Some("") => String::new(),
            Some(var) => std::env::var(var).map_err(|_| ProvisionError::Auth {
                host: self.host.clone(),
                message: format!("credential variable {var} is not set"),
            })?,
        };

        Ok(Credentials {
            username: self.username.clone(),
            password,
        })
    }

    fn check(&self, id: &str) -> Result<(), VmError> {
        let missing = if self.host.trim().is_empty() {
            Some("host")
        } else if self.template.trim().is_empty() {
            Some("template")
        } else if self.username.trim().is_empty() {
            Some("username")
        } else {
            None
        };

        match missing {
            Some(field) => Err(VmError::InvalidSpec {
                id: id.to_string(),
                message: format!("remote VM requires a {field}"),
            }),
            None => Ok(()),
        }
    }
}

/// Resolved login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated session with a virtualization host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

/// Host-side reference to a provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVmRef(pub String);

/// Parameters passed to the host when creating a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmParams {
    pub name: String,
    pub profile: String,
}

/// Remote provisioning collaborator.
///
/// Implementations speak the hypervisor's RPC. The channel returned by
/// `open_command_channel` must honour the same [`RuntimeChannel`] contract
/// as a local worker.
///
/// [`RuntimeChannel`]: crate::runtime::RuntimeChannel
#[allow(async_fn_in_trait)]
pub trait RemoteProvisioning: Send + Sync {
    async fn login(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<SessionToken, ProvisionError>;

    async fn create_vm(
        &self,
        token: &SessionToken,
        template: &str,
        params: &VmParams,
    ) -> Result<RemoteVmRef, ProvisionError>;

    async fn open_command_channel(
        &self,
        token: &SessionToken,
        vm: &RemoteVmRef,
    ) -> Result<RuntimeHandle, ProvisionError>;
}

/// How a VM's runtime is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningStrategy {
    /// A worker process on this machine.
    Local,
    /// A VM on a virtualization host.
    Remote(RemoteConfig),
}

impl ProvisioningStrategy {
    pub fn kind(&self) -> VmKind {
        match self {
            ProvisioningStrategy::Local => VmKind::Local,
            ProvisioningStrategy::Remote(_) => VmKind::Remote,
        }
    }

    pub fn remote_config(&self) -> Option<&RemoteConfig> {
        match self {
            ProvisioningStrategy::Local => None,
            ProvisioningStrategy::Remote(config) => Some(config),
        }
    }

    /// Starts the runtime for `vm_id`.
    pub async fn start<L, R>(
        &self,
        vm_id: &str,
        profile: &str,
        launcher: &L,
        remote: &R,
    ) -> Result<RuntimeHandle, ProvisionError>
    where
        L: LocalLauncher + ?Sized,
        R: RemoteProvisioning + ?Sized,
    {
        match self {
            ProvisioningStrategy::Local => Ok(launcher.launch(vm_id)?),
            ProvisioningStrategy::Remote(config) => {
                let credentials = config.credentials()?;
                let token = remote.login(&config.host, &credentials).await?;
                tracing::debug!(vm_id = %vm_id, host = %config.host, "Logged in to virtualization host");

                let params = VmParams {
                    name: vm_id.to_string(),
                    profile: profile.to_string(),
                };
                let vm_ref = remote.create_vm(&token, &config.template, &params).await?;
                tracing::debug!(vm_id = %vm_id, vm_ref = %vm_ref.0, "Remote VM provisioned");

                remote.open_command_channel(&token, &vm_ref).await
            }
        }
    }
}

/// Everything needed to create a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub id: VmId,
    pub profile: String,
    pub strategy: ProvisioningStrategy,
}

impl VmSpec {
    pub fn local(id: impl Into<VmId>, profile: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            profile: profile.into(),
            strategy: ProvisioningStrategy::Local,
        }
    }

    pub fn remote(id: impl Into<VmId>, profile: impl Into<String>, config: RemoteConfig) -> Self {
        Self {
            id: id.into(),
            profile: profile.into(),
            strategy: ProvisioningStrategy::Remote(config),
        }
    }

    pub fn kind(&self) -> VmKind {
        self.strategy.kind()
    }
}

/// Provisions a VM and registers it.
///
/// The id is checked before any process is started, so a duplicate create
/// never spawns a worker.
pub async fn provision<L, R>(
    registry: &SessionRegistry,
    spec: VmSpec,
    launcher: &L,
    remote: &R,
) -> Result<VmSnapshot, VmError>
where
    L: LocalLauncher + ?Sized,
    R: RemoteProvisioning + ?Sized,
{
    registry.ensure_available(&spec.id)?;
    if let Some(config) = spec.strategy.remote_config() {
        config.check(&spec.id)?;
    }

    let runtime = spec
        .strategy
        .start(&spec.id, &spec.profile, launcher, remote)
        .await
        .map_err(|source| VmError::Provisioning {
            id: spec.id.clone(),
            source,
        })?;

    registry.create(spec, runtime)
}
