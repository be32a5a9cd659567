//! Initialization parameters for all backends.
//!
//! [`InitParams`] is versioned: a backend refuses a structure newer than the
//! one it was built against instead of guessing at fields it does not
//! understand. New parameters are only ever appended.
//!
//! # Examples
//!
//! ```no_run
//! use vmiscope::api::params::{DummyInitParams, InitParams};
//!
//! // Simulated guest: vm_name is mandatory.
//! let params = InitParams {
//!     dummy: Some(DummyInitParams { memory_size: 64 << 20, vcpu_count: 2 }),
//!     ..InitParams::for_vm("windows10")
//! };
//!
//! // Record/replay: the recording path is mandatory.
//! let params = InitParams::for_vm("windows10").with_extension(
//!     "replay.recording",
//!     "/tmp/windows10.json",
//!     true,
//! );
//! ```

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{InitError, SerializeError};

/// Newest [`InitParams::version`] this build understands.
pub const INIT_PARAMS_VERSION: u32 = 1;

/// Parameters shared by two or more backends.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonInitParams {
    pub vm_name: String,
}

/// Simulated guest parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyInitParams {
    /// Guest physical memory size in bytes.
    pub memory_size: u64,
    pub vcpu_count: u16,
}

impl Default for DummyInitParams {
    fn default() -> Self {
        Self {
            memory_size: 16 * 1024 * 1024,
            vcpu_count: 1,
        }
    }
}

/// Record/replay parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayInitParams {
    /// Recording to play back.
    pub recording: PathBuf,
}

/// One backend-specific key/value extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub value: String,
    /// A backend that does not recognise a required key must refuse to
    /// initialize.
    #[serde(default)]
    pub required: bool,
}

/// Parameters for every backend, passed as one record to
/// [`Vmi::init`](crate::Vmi::init).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitParams {
    pub version: u32,
    pub common: Option<CommonInitParams>,
    pub dummy: Option<DummyInitParams>,
    pub replay: Option<ReplayInitParams>,
    /// Extensions keyed `"<backend>.<key>"`.
    pub extensions: BTreeMap<String, Extension>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            version: INIT_PARAMS_VERSION,
            common: None,
            dummy: None,
            replay: None,
            extensions: BTreeMap::new(),
        }
    }
}

impl InitParams {
    /// Parameters naming the VM and nothing else.
    pub fn for_vm(vm_name: impl Into<String>) -> Self {
        Self {
            common: Some(CommonInitParams {
                vm_name: vm_name.into(),
            }),
            ..Default::default()
        }
    }

    pub fn with_extension(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        required: bool,
    ) -> Self {
        self.extensions.insert(
            key.into(),
            Extension {
                value: value.into(),
                required,
            },
        );
        self
    }

    pub fn vm_name(&self) -> Option<&str> {
        self.common.as_ref().map(|c| c.vm_name.as_str())
    }

    /// Load parameters from a JSON file.
    pub fn load(path: &Path) -> Result<Self, SerializeError> {
        let file = File::open(path)?;
        let params: InitParams = serde_json::from_reader(file)?;
        Ok(params)
    }

    /// Refuse structures this build cannot interpret.
    pub fn check_version(&self, backend: &str) -> Result<(), InitError> {
        if self.version == 0 || self.version > INIT_PARAMS_VERSION {
            return Err(InitError::rejected(
                backend,
                format!(
                    "init parameters version {} is not supported (newest is {})",
                    self.version, INIT_PARAMS_VERSION
                ),
            ));
        }
        Ok(())
    }

    /// The VM name, or a rejection if the backend needs one and it is
    /// missing.
    pub fn require_vm_name(&self, backend: &str) -> Result<&str, InitError> {
        match self.vm_name() {
            Some(name) if !name.is_empty() => Ok(name),
            _ => Err(InitError::rejected(backend, "missing required common.vm_name")),
        }
    }

    /// Reject required extensions whose `"<backend>."` prefix names none of
    /// `backends`. No backend would ever judge such a key.
    pub fn check_extension_targets(&self, who: &str, backends: &[&str]) -> Result<(), InitError> {
        for (key, ext) in &self.extensions {
            let Some((prefix, _)) = key.split_once('.') else {
                continue;
            };
            if backends.contains(&prefix) {
                continue;
            }
            if ext.required {
                return Err(InitError::rejected(
                    who,
                    format!("required parameter '{}' names no registered backend", key),
                ));
            }
            debug!("{}: ignoring parameter '{}' for unknown backend", who, key);
        }
        Ok(())
    }

    /// Extensions addressed to `backend` whose key is in `known`, keyed by
    /// the unprefixed name.
    ///
    /// Keys prefixed with another backend's name are skipped. Unprefixed
    /// keys are offered to every backend. An unknown key that is marked
    /// required rejects the whole parameter set.
    pub fn extensions_for(
        &self,
        backend: &str,
        known: &[&str],
    ) -> Result<BTreeMap<&str, &str>, InitError> {
        let mut accepted = BTreeMap::new();
        for (key, ext) in &self.extensions {
            let name = match key.split_once('.') {
                Some((prefix, rest)) if prefix == backend => rest,
                Some(_) => continue,
                None => key.as_str(),
            };
            if known.contains(&name) {
                accepted.insert(name, ext.value.as_str());
            } else if ext.required {
                return Err(InitError::rejected(
                    backend,
                    format!("unknown required parameter '{}'", key),
                ));
            } else {
                debug!("{}: ignoring unknown optional parameter '{}'", backend, key);
            }
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_carry_current_version() {
        let params = InitParams::default();
        assert_eq!(params.version, INIT_PARAMS_VERSION);
        assert!(params.check_version("dummy").is_ok());
    }

    #[test]
    fn future_version_rejected() {
        let params = InitParams {
            version: INIT_PARAMS_VERSION + 1,
            ..InitParams::for_vm("alpha")
        };
        assert!(matches!(
            params.check_version("dummy"),
            Err(InitError::RejectedParameters { .. })
        ));
    }

    #[test]
    fn missing_vm_name_rejected() {
        let params = InitParams::default();
        assert!(params.require_vm_name("dummy").is_err());
        let params = InitParams::for_vm("");
        assert!(params.require_vm_name("dummy").is_err());
        let params = InitParams::for_vm("alpha");
        assert_eq!(params.require_vm_name("dummy").unwrap(), "alpha");
    }

    #[test]
    fn extensions_routed_by_prefix() {
        let params = InitParams::for_vm("alpha")
            .with_extension("dummy.vcpu_count", "4", true)
            .with_extension("replay.recording", "/tmp/x.json", true)
            .with_extension("memory_size", "4096", false);

        let dummy = params
            .extensions_for("dummy", &["vcpu_count", "memory_size"])
            .unwrap();
        assert_eq!(dummy.get("vcpu_count"), Some(&"4"));
        assert_eq!(dummy.get("memory_size"), Some(&"4096"));
        assert!(!dummy.contains_key("recording"));
    }

    #[test]
    fn unknown_required_extension_rejected() {
        let params = InitParams::for_vm("alpha").with_extension("dummy.nested_paging", "on", true);
        let err = params.extensions_for("dummy", &["vcpu_count"]).unwrap_err();
        match err {
            InitError::RejectedParameters { backend, reason } => {
                assert_eq!(backend, "dummy");
                assert!(reason.contains("dummy.nested_paging"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn required_extension_for_unknown_backend_rejected() {
        let backends = ["dummy", "replay"];
        let params = InitParams::for_vm("alpha").with_extension("turbo.mode", "1", true);
        assert!(matches!(
            params.check_extension_targets("vmiscope", &backends),
            Err(InitError::RejectedParameters { .. })
        ));

        let params = InitParams::for_vm("alpha")
            .with_extension("turbo.mode", "1", false)
            .with_extension("replay.recording", "/tmp/x.json", true)
            .with_extension("vcpu_count", "2", true);
        assert!(params.check_extension_targets("vmiscope", &backends).is_ok());
    }

    #[test]
    fn unknown_optional_extension_ignored() {
        let params = InitParams::for_vm("alpha").with_extension("dummy.nested_paging", "on", false);
        let accepted = params.extensions_for("dummy", &["vcpu_count"]).unwrap();
        assert!(accepted.is_empty());
    }

    #[test]
    fn params_json_roundtrip_through_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("params.json");
        let params = InitParams {
            dummy: Some(DummyInitParams {
                memory_size: 1 << 20,
                vcpu_count: 2,
            }),
            ..InitParams::for_vm("alpha")
        }
        .with_extension("dummy.vcpu_count", "2", false);
        std::fs::write(&path, serde_json::to_string_pretty(&params).unwrap()).unwrap();

        let loaded = InitParams::load(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let params: InitParams =
            serde_json::from_str(r#"{ "common": { "vm_name": "alpha" } }"#).unwrap();
        assert_eq!(params.version, INIT_PARAMS_VERSION);
        assert_eq!(params.vm_name(), Some("alpha"));
        assert!(params.extensions.is_empty());
    }
}
