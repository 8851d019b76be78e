// Sub-package manifests (package.json) and sub-package discovery

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::VendorSpec;

/// File name of a sub-package manifest
pub const MANIFEST_FILE: &str = "package.json";

/// The parts of a sub-package manifest we care about
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
}

impl PackageManifest {
    /// Parse package.json from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;

        Self::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.as_ref().display()))
    }

    pub fn from_str(content: &str) -> Result<Self> {
        let manifest: PackageManifest =
            serde_json::from_str(content).context("Invalid package manifest")?;

        if manifest.name.trim().is_empty() {
            anyhow::bail!("Package name cannot be empty");
        }
        if manifest.version.trim().is_empty() {
            anyhow::bail!("Package version cannot be empty for {}", manifest.name);
        }

        Ok(manifest)
    }

    /// Archive file name produced by packing this manifest (`@demo/core` 1.0.0 -> `demo-core-1.0.0.tgz`)
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}.tgz", sanitize_package_name(&self.name), self.version)
    }
}

/// Map a (possibly scoped) package name to a filesystem-safe stem
pub fn sanitize_package_name(name: &str) -> String {
    name.trim_start_matches('@').replace('/', "-")
}

/// Path segments of a package name (`@demo/core` -> [`@demo`, `core`])
pub fn name_segments(name: &str) -> Vec<&str> {
    name.split('/').filter(|s| !s.is_empty()).collect()
}

/// Scope of a package name, if it has one
pub fn package_scope(name: &str) -> Option<&str> {
    if name.starts_with('@') && name.contains('/') {
        name.split('/').next()
    } else {
        None
    }
}

/// A sub-package directory inside a vendor tree
#[derive(Debug, Clone)]
pub struct SubPackage {
    /// Directory name (what `pack.include` refers to)
    pub dir_name: String,
    pub path: PathBuf,
    /// None when the directory has no manifest
    pub manifest: Option<PackageManifest>,
}

/// Enumerate the sub-packages a vendor packs, honouring `pack.include`.
///
/// Excluded directories are logged at debug level. Directories without a
/// manifest are returned with `manifest: None` so callers can warn and skip.
/// A manifest that exists but cannot be parsed is an error.
pub fn discover_sub_packages(vendor_root: &Path, vendor: &VendorSpec) -> Result<Vec<SubPackage>> {
    let packages_dir = vendor_root.join(&vendor.pack.packages_dir);

    let mut entries: Vec<_> = fs::read_dir(&packages_dir)
        .with_context(|| format!("Failed to read directory: {}", packages_dir.display()))?
        .collect::<Result<Vec<_>, _>>()?;

    // Sorted for a deterministic pack order
    entries.sort_by_key(|e| e.path());

    let mut found = Vec::new();
    for entry in entries {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let dir_name = entry.file_name().to_string_lossy().to_string();
        if !vendor.pack.include.is_empty() && !vendor.pack.include.contains(&dir_name) {
            log::debug!("{}: skipping {} (not in pack.include)", vendor.name, dir_name);
            continue;
        }

        let manifest_path = path.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            Some(PackageManifest::from_file(&manifest_path)?)
        } else {
            None
        };

        found.push(SubPackage {
            dir_name,
            path,
            manifest,
        });
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VendorConfig;

    fn vendor(include: &str) -> VendorSpec {
        let yaml = format!(
            "vendor-packages:\n  - name: demo\n    path: ./v\n    pack:\n      required: true\n      include: [{}]\n",
            include
        );
        VendorConfig::from_yaml_str(&yaml)
            .unwrap()
            .vendor_packages
            .remove(0)
    }

    #[test]
    fn test_archive_file_name() {
        let manifest = PackageManifest::from_str(r#"{"name":"@demo/core","version":"1.0.0"}"#).unwrap();
        assert_eq!(manifest.archive_file_name(), "demo-core-1.0.0.tgz");

        let plain = PackageManifest::from_str(r#"{"name":"left-pad","version":"0.0.3"}"#).unwrap();
        assert_eq!(plain.archive_file_name(), "left-pad-0.0.3.tgz");
    }

    #[test]
    fn test_manifest_requires_version() {
        assert!(PackageManifest::from_str(r#"{"name":"x"}"#).is_err());
        assert!(PackageManifest::from_str(r#"{"name":"","version":"1.0.0"}"#).is_err());
    }

    #[test]
    fn test_name_helpers() {
        assert_eq!(name_segments("@demo/core"), vec!["@demo", "core"]);
        assert_eq!(name_segments("core"), vec!["core"]);
        assert_eq!(package_scope("@demo/core"), Some("@demo"));
        assert_eq!(package_scope("core"), None);
    }

    #[test]
    fn test_discover_honours_include() {
        let dir = tempfile::tempdir().unwrap();
        let packages = dir.path().join("packages");
        for name in ["core", "extra", "bare"] {
            fs::create_dir_all(packages.join(name)).unwrap();
        }
        fs::write(
            packages.join("core").join(MANIFEST_FILE),
            r#"{"name":"@demo/core","version":"1.0.0"}"#,
        )
        .unwrap();

        let all = discover_sub_packages(dir.path(), &vendor("")).unwrap();
        let names: Vec<_> = all.iter().map(|p| p.dir_name.as_str()).collect();
        assert_eq!(names, vec!["bare", "core", "extra"]);
        assert!(all[0].manifest.is_none());

        let only_core = discover_sub_packages(dir.path(), &vendor("core")).unwrap();
        assert_eq!(only_core.len(), 1);
        assert_eq!(
            only_core[0].manifest.as_ref().map(|m| m.name.as_str()),
            Some("@demo/core")
        );
    }
}
