//! Sandbox request and guest metadata types.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Longest id accepted in any request field.
pub const MAX_ID_LEN: usize = 128;

/// The original create request, carried on the sandbox for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// External identity of the sandbox.
    pub sandbox_id: String,

    /// Template whose snapshot the sandbox resumes from.
    pub template_id: String,

    /// Build of the template.
    pub build_id: String,

    /// Kernel directory name under the kernels root.
    pub kernel_version: String,

    /// Firecracker binary directory name under the binaries root.
    pub firecracker_version: String,

    /// Owning team.
    pub team_id: String,

    /// Serve guest memory through the userfaultfd helper.
    #[serde(default)]
    pub huge_pages: bool,

    /// Hard lifetime limit; `0` means unlimited.
    #[serde(default)]
    pub max_instance_length_hours: u32,
}

impl SandboxConfig {
    /// Check every field before any host resource is touched.
    ///
    /// Ids end up in filesystem paths, hosts-file lines and KV keys, so they
    /// are restricted to `[A-Za-z0-9._-]`.
    ///
    /// # Errors
    /// Returns [`CoreError::InvalidField`] naming the first offending field.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_id("sandbox_id", &self.sandbox_id)?;
        validate_id("template_id", &self.template_id)?;
        validate_id("build_id", &self.build_id)?;
        validate_id("kernel_version", &self.kernel_version)?;
        validate_id("firecracker_version", &self.firecracker_version)?;
        if self.team_id.len() > MAX_ID_LEN {
            return Err(CoreError::InvalidField {
                field: "team_id",
                reason: format!("longer than {MAX_ID_LEN} bytes"),
            });
        }
        Ok(())
    }
}

fn validate_id(field: &'static str, value: &str) -> Result<(), CoreError> {
    let reason = if value.is_empty() {
        "must not be empty".to_owned()
    } else if value.len() > MAX_ID_LEN {
        format!("longer than {MAX_ID_LEN} bytes")
    } else if value == "." || value == ".." {
        "must not be a relative path component".to_owned()
    } else if let Some(c) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        format!("contains disallowed character {c:?}")
    } else {
        return Ok(());
    };
    Err(CoreError::InvalidField { field, reason })
}

/// JSON blob placed into Firecracker's metadata service at resume time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsMetadata {
    pub instance_id: String,
    pub env_id: String,
    pub trace_id: String,
    pub team_id: String,
    /// Where the guest forwards its logs.
    pub address: String,
}

impl MmdsMetadata {
    /// Build the metadata for a sandbox with a fresh trace id.
    #[must_use]
    pub fn for_sandbox(config: &SandboxConfig, logs_proxy_address: &str) -> Self {
        Self {
            instance_id: config.sandbox_id.clone(),
            env_id: config.template_id.clone(),
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            team_id: config.team_id.clone(),
            address: logs_proxy_address.to_owned(),
        }
    }
}
