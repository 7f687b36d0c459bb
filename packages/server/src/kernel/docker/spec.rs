//! Container specs and the creation allow-list.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::common::OrchestratorError;
use crate::config::RunnerConfig;
use crate::kernel::jobs::ResourceProfile;

/// What the orchestrator asks the engine to create.
///
/// Env entries carry secret *handles* (names the runner resolves inside
/// the container), never secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
    /// `host:container[:ro]` bind mounts.
    pub binds: Vec<String>,
    /// Capabilities to retain. Everything is dropped first; retaining
    /// any capability requires it to be allow-listed.
    pub cap_add: Vec<String>,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    pub gpu_count: i32,
    pub pids_limit: i64,
    pub read_only_rootfs: bool,
}

impl ContainerSpec {
    /// A runner spec from a resource profile, before validation.
    pub fn for_profile(name: impl Into<String>, profile: &ResourceProfile) -> Self {
        Self {
            name: name.into(),
            image: profile.image.clone(),
            env: Vec::new(),
            labels: HashMap::new(),
            binds: Vec::new(),
            cap_add: Vec::new(),
            cpu_shares: profile.cpu_shares,
            memory_bytes: profile.memory_bytes,
            gpu_count: profile.gpu_count,
            pids_limit: 512,
            read_only_rootfs: profile.read_only_rootfs,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Validate against the allow-list. Violations are `Validation`
    /// errors and are never retried.
    pub fn validate(&self, allow: &RunnerConfig) -> Result<(), OrchestratorError> {
        if !allow
            .allowed_image_prefixes
            .iter()
            .any(|prefix| self.image.starts_with(prefix))
        {
            return Err(OrchestratorError::Validation(format!(
                "image '{}' is not allow-listed",
                self.image
            )));
        }

        for bind in &self.binds {
            let host_path = bind.split(':').next().unwrap_or_default();
            if !allow
                .allowed_bind_paths
                .iter()
                .any(|prefix| host_path.starts_with(prefix.as_str()))
            {
                return Err(OrchestratorError::Validation(format!(
                    "bind path '{host_path}' is not allow-listed"
                )));
            }
        }

        // No capability survives unless explicitly allow-listed, and the
        // default allow-list is empty.
        if let Some(cap) = self.cap_add.first() {
            return Err(OrchestratorError::Security(format!(
                "capability '{cap}' requested but not allow-listed"
            )));
        }

        if self.cpu_shares <= 0 || self.memory_bytes <= 0 {
            return Err(OrchestratorError::Validation(
                "resource caps must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// A stable hash of the spec, stored in the container registry.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.image.as_bytes());
        hasher.update(self.cpu_shares.to_be_bytes());
        hasher.update(self.memory_bytes.to_be_bytes());
        hasher.update(self.gpu_count.to_be_bytes());
        for (key, value) in &self.env {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        for bind in &self.binds {
            hasher.update(bind.as_bytes());
        }
        hex::encode(&hasher.finalize()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn allow() -> RunnerConfig {
        RunnerConfig {
            default_image: "ghcr.io/runfleet/runner:latest".into(),
            allowed_image_prefixes: vec!["ghcr.io/runfleet/".into()],
            allowed_bind_paths: vec!["/var/cache/runfleet".into()],
            max_execution: Duration::from_secs(3_600),
        }
    }

    fn spec() -> ContainerSpec {
        ContainerSpec::for_profile(
            "runner-1",
            &ResourceProfile::default_profile("ghcr.io/runfleet/runner:latest"),
        )
    }

    #[test]
    fn default_profile_spec_passes() {
        assert!(spec().validate(&allow()).is_ok());
    }

    #[test]
    fn unlisted_image_is_rejected() {
        let mut s = spec();
        s.image = "docker.io/evil/miner:latest".into();
        let err = s.validate(&allow()).unwrap_err();
        assert!(err.to_string().contains("not allow-listed"));
    }

    #[test]
    fn unlisted_bind_path_is_rejected() {
        let mut s = spec();
        s.binds.push("/etc:/host-etc:ro".into());
        assert!(s.validate(&allow()).is_err());
    }

    #[test]
    fn listed_bind_path_passes() {
        let mut s = spec();
        s.binds.push("/var/cache/runfleet/tools:/opt/tools:ro".into());
        assert!(s.validate(&allow()).is_ok());
    }

    #[test]
    fn requested_capability_is_a_security_error() {
        let mut s = spec();
        s.cap_add.push("SYS_ADMIN".into());
        let err = s.validate(&allow()).unwrap_err();
        assert_eq!(
            err.code(),
            crate::common::ErrorCode::Security
        );
    }

    #[test]
    fn zero_caps_are_rejected() {
        let mut s = spec();
        s.memory_bytes = 0;
        assert!(s.validate(&allow()).is_err());
    }

    #[test]
    fn hash_is_stable_and_spec_sensitive() {
        let a = spec();
        let mut b = spec();
        assert_eq!(a.hash(), b.hash());
        b.memory_bytes += 1;
        assert_ne!(a.hash(), b.hash());
    }
}
