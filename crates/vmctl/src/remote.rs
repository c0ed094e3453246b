//! Remote provisioning for this build.
//!
//! The hypervisor RPC client is not bundled. [`UnavailableProvisioner`]
//! fills the [`RemoteProvisioning`] seam so remote creates fail cleanly
//! with an authentication error that names the host.

use vmcore::{
    Credentials, ProvisionError, RemoteProvisioning, RemoteVmRef, RuntimeHandle, SessionToken,
    VmParams,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableProvisioner;

impl RemoteProvisioning for UnavailableProvisioner {
    async fn login(
        &self,
        host: &str,
        credentials: &Credentials,
    ) -> Result<SessionToken, ProvisionError> {
        tracing::warn!(host = %host, username = %credentials.username, "Remote provisioning requested but no hypervisor client is available");
        Err(ProvisionError::Auth {
            host: host.to_string(),
            message: "no hypervisor client is available in this build".to_string(),
        })
    }

    async fn create_vm(
        &self,
        _token: &SessionToken,
        _template: &str,
        _params: &VmParams,
    ) -> Result<RemoteVmRef, ProvisionError> {
        Err(ProvisionError::Provisioning {
            message: "no hypervisor client is available in this build".to_string(),
        })
    }

    async fn open_command_channel(
        &self,
        _token: &SessionToken,
        _vm: &RemoteVmRef,
    ) -> Result<RuntimeHandle, ProvisionError> {
        Err(ProvisionError::Provisioning {
            message: "no hypervisor client is available in this build".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_login_fails_naming_host() {
        let credentials = Credentials {
            username: "root".to_string(),
            password: String::new(),
        };
        let err = UnavailableProvisioner
            .login("10.0.0.5", &credentials)
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Auth { ref host, .. } if host == "10.0.0.5"));
        assert!(err.to_string().contains("10.0.0.5"));
    }
}
