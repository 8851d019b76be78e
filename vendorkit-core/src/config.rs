// Vendor configuration parser - vendorkit.yaml / vendorkit.json

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Unpack target that stands for the project root's dependency directory
pub const ROOT_SENTINEL: &str = "$$ROOT";

/// Environment variable that re-roots every unpack destination
pub const DEBUG_ROOT_ENV: &str = "VENDORKIT_DEBUG_ROOT";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VendorConfig {
    pub vendor_packages: Vec<VendorSpec>,

    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    #[serde(default = "default_dependency_dir")]
    pub dependency_dir: String,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_explain_timeout")]
    pub explain_timeout_secs: u64,
}

/// One vendored source tree
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct VendorSpec {
    pub name: String,
    pub path: String,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub install: InstallPhase,

    #[serde(default)]
    pub build: BuildPhase,

    #[serde(default)]
    pub pack: PackPhase,

    #[serde(default)]
    pub unpack: UnpackPhase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InstallPhase {
    #[serde(default)]
    pub required: bool,

    /// Package script to run instead of a plain install
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BuildPhase {
    #[serde(default)]
    pub required: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PackPhase {
    #[serde(default)]
    pub required: bool,

    /// Sub-package directory names to pack (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Directory under the vendor path holding the sub-packages
    #[serde(default = "default_packages_dir")]
    pub packages_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct UnpackPhase {
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Where an archive gets unpacked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnpackTarget {
    /// The project root's dependency directory
    Root,
    /// A directory relative to the vendor path
    VendorRelative(String),
}

fn default_package_manager() -> String {
    "yarn".to_string()
}

fn default_dependency_dir() -> String {
    "node_modules".to_string()
}

fn default_command_timeout() -> u64 {
    900
}

fn default_explain_timeout() -> u64 {
    120
}

fn default_packages_dir() -> String {
    "packages".to_string()
}

impl Default for PackPhase {
    fn default() -> Self {
        Self {
            required: false,
            include: Vec::new(),
            packages_dir: default_packages_dir(),
        }
    }
}

impl VendorConfig {
    /// Parse configuration from file (JSON when the extension says so, YAML otherwise)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        if is_json {
            Self::from_json_str(&content).map_err(|e| relabel(e, path))
        } else {
            Self::from_yaml_str(&content).map_err(|e| relabel(e, path))
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: VendorConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: "<yaml>".to_string(),
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: VendorConfig =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse {
                path: "<json>".to_string(),
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the whole document, reporting every violation at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        if self.package_manager.trim().is_empty() {
            errors.push("package-manager cannot be empty".to_string());
        }
        if self.dependency_dir.trim().is_empty() {
            errors.push("dependency-dir cannot be empty".to_string());
        }
        if self.command_timeout_secs == 0 {
            errors.push("command-timeout-secs must be greater than zero".to_string());
        }
        if self.explain_timeout_secs == 0 {
            errors.push("explain-timeout-secs must be greater than zero".to_string());
        }

        for vendor in &self.vendor_packages {
            if vendor.name.trim().is_empty() {
                errors.push("vendor name cannot be empty".to_string());
            } else if !seen.insert(vendor.name.as_str()) {
                errors.push(format!("duplicate vendor name: {}", vendor.name));
            }

            if vendor.path.trim().is_empty() {
                errors.push(format!("{}: path cannot be empty", vendor.name));
            }

            for dep in &vendor.dependencies {
                if dep == &vendor.name {
                    errors.push(format!("{}: vendor cannot depend on itself", vendor.name));
                } else if self.vendor(dep).is_none() {
                    errors.push(format!("{}: unknown dependency '{}'", vendor.name, dep));
                }
            }

            if vendor.build.required && script_missing(&vendor.build.script) {
                errors.push(format!(
                    "{}: build.required is set but build.script is missing",
                    vendor.name
                ));
            }

            if vendor.pack.required && vendor.pack.packages_dir.trim().is_empty() {
                errors.push(format!("{}: pack.packages-dir cannot be empty", vendor.name));
            }

            if !vendor.unpack.targets.is_empty() && !vendor.pack.required {
                errors.push(format!(
                    "{}: unpack targets are declared but pack.required is false",
                    vendor.name
                ));
            }

            if vendor.unpack.targets.iter().any(|t| t.trim().is_empty()) {
                errors.push(format!("{}: unpack target cannot be empty", vendor.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Look up a vendor by name
    pub fn vendor(&self, name: &str) -> Option<&VendorSpec> {
        self.vendor_packages.iter().find(|v| v.name == name)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn explain_timeout(&self) -> Duration {
        Duration::from_secs(self.explain_timeout_secs)
    }
}

impl VendorSpec {
    /// Declared unpack targets, typed
    pub fn unpack_targets(&self) -> Vec<UnpackTarget> {
        self.unpack
            .targets
            .iter()
            .map(|t| UnpackTarget::parse(t))
            .collect()
    }

    /// Namespace scope owned by this vendor (`@demo` for both `demo` and `@demo/tools`)
    pub fn scope(&self) -> String {
        match self.name.strip_prefix('@') {
            Some(rest) => {
                let scope = rest.split('/').next().unwrap_or(rest);
                format!("@{}", scope)
            }
            None => format!("@{}", self.name),
        }
    }
}

impl UnpackTarget {
    pub fn parse(raw: &str) -> Self {
        if raw.trim() == ROOT_SENTINEL {
            UnpackTarget::Root
        } else {
            UnpackTarget::VendorRelative(raw.trim().to_string())
        }
    }
}

fn script_missing(script: &Option<String>) -> bool {
    script.as_deref().map(str::trim).unwrap_or("").is_empty()
}

fn relabel(err: ConfigError, path: &Path) -> ConfigError {
    match err {
        ConfigError::Parse { message, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            message,
        },
        other => other,
    }
}
