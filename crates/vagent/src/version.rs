//! Version information for vagent.

use serde::Serialize;

/// vagent version from Cargo.toml
pub const VAGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported to the peer by `va.capabilities`.
#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    pub version: &'static str,
    /// Which side of the channel answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            version: VAGENT_VERSION,
            role: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}
