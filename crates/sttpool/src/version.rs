//! Version information for sttpool.

/// sttpool version from Cargo.toml
pub const STTPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine backend compiled into this build.
#[cfg(feature = "sherpa")]
pub const ENGINE_BACKEND: Option<&str> = Some("sherpa-onnx");
#[cfg(not(feature = "sherpa"))]
pub const ENGINE_BACKEND: Option<&str> = None;

/// Version information logged at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub sttpool: &'static str,
    /// Recognition backend, absent when built without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<&'static str>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            sttpool: STTPOOL_VERSION,
            engine: ENGINE_BACKEND,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// `0.3.0 (sherpa-onnx)` or just `0.3.0`.
    pub fn describe(&self) -> String {
        match self.engine {
            Some(engine) => format!("{} ({engine})", self.sttpool),
            None => self.sttpool.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.sttpool, STTPOOL_VERSION);
        assert_eq!(info.engine, ENGINE_BACKEND);
    }

    #[test]
    fn describe_includes_backend() {
        let info = VersionInfo {
            sttpool: "0.1.0",
            engine: Some("sherpa-onnx"),
        };
        assert_eq!(info.describe(), "0.1.0 (sherpa-onnx)");
    }

    #[test]
    fn version_info_serializes_minimal() {
        let info = VersionInfo {
            sttpool: "0.1.0",
            engine: None,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "sttpool": "0.1.0"
        }
        "#);
    }
}
