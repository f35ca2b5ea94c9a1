//! Which bridge build is talking to which worker.
//!
//! The worker reports its own version as the optional second token of its
//! `ready` line; it is recorded here next to the crate version so both can be
//! logged or shown to a host together.

use std::fmt;

use serde::Serialize;

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    /// `None` until a worker has completed its handshake, or when it
    /// announced no version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::from_handshake(None)
    }

    /// Version pair for a worker whose ready line carried `worker`.
    pub fn from_handshake(worker: Option<String>) -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            worker,
        }
    }

    pub fn with_worker(mut self, version: String) -> Self {
        self.worker = Some(version);
        self
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scifio-bridge {}", self.bridge)?;
        match &self.worker {
            Some(worker) => write!(f, " (worker {worker})"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_version_comes_from_the_crate() {
        let info = VersionInfo::default();
        assert_eq!(info.bridge, BRIDGE_VERSION);
        assert!(info.worker.is_none());
    }

    #[test]
    fn display_names_both_sides() {
        let info = VersionInfo {
            bridge: "0.1.0",
            worker: None,
        };
        assert_eq!(info.to_string(), "scifio-bridge 0.1.0");
        assert_eq!(
            info.with_worker("0.4.1".to_string()).to_string(),
            "scifio-bridge 0.1.0 (worker 0.4.1)"
        );
    }

    #[test]
    fn worker_version_is_omitted_when_unknown() {
        let mut info = VersionInfo::from_handshake(Some("0.4.1".to_string()));
        info.bridge = "0.1.0";
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0",
          "worker": "0.4.1"
        }
        "#);

        info.worker = None;
        insta::assert_json_snapshot!(info, @r#"
        {
          "bridge": "0.1.0"
        }
        "#);
    }
}
