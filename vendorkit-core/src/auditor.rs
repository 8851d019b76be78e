// Dependency resolution audit across all vendors

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::config::{VendorConfig, VendorSpec};
use crate::manifest::{discover_sub_packages, package_scope};
use crate::walker::ResolutionProbe;

/// How many levels of declared vendor dependencies contribute their packages.
/// 1 means direct dependencies only, without recursing into theirs.
pub const VENDOR_EXPANSION_DEPTH: usize = 1;

/// Observed locations for one package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackageResolution {
    pub root: Vec<PathBuf>,
    pub vendor_dependencies: BTreeMap<String, Vec<PathBuf>>,
}

/// Fully-qualified package name -> observed locations
pub type DependencyReport = BTreeMap<String, PackageResolution>;

pub struct DependencyAuditor<'a, P: ResolutionProbe> {
    config: &'a VendorConfig,
    probe: &'a P,
    project_root: PathBuf,
}

impl<'a, P: ResolutionProbe> DependencyAuditor<'a, P> {
    pub fn new<Q: AsRef<Path>>(config: &'a VendorConfig, probe: &'a P, project_root: Q) -> Self {
        Self {
            config,
            probe,
            project_root: project_root.as_ref().to_path_buf(),
        }
    }

    /// Build the report. Unreadable vendors and failed probes only shrink it.
    pub fn audit(&self) -> DependencyReport {
        let own_packages: HashMap<&str, Vec<String>> = self
            .config
            .vendor_packages
            .iter()
            .map(|v| (v.name.as_str(), self.packaged_names(v)))
            .collect();

        let mut report = DependencyReport::new();

        for vendor in &self.config.vendor_packages {
            let own: HashSet<&str> = own_packages
                .get(vendor.name.as_str())
                .map(|names| names.iter().map(String::as_str).collect())
                .unwrap_or_default();
            let scope = vendor.scope();
            let vendor_dir = self.project_root.join(&vendor.path);

            for package in self.exposed_packages(vendor, &own_packages) {
                let entry = report.entry(package.clone()).or_insert_with(|| {
                    log::info!("resolving {} from project root", package);
                    PackageResolution {
                        root: self
                            .probe
                            .resolve(&package, &self.project_root)
                            .into_iter()
                            .collect(),
                        vendor_dependencies: BTreeMap::new(),
                    }
                });

                let in_namespace = own.contains(package.as_str())
                    || package_scope(&package) == Some(scope.as_str());
                if in_namespace {
                    log::debug!("{}: {} is in its own namespace", vendor.name, package);
                    continue;
                }

                log::info!("resolving {} from vendor {}", package, vendor.name);
                let found = self.probe.resolve(&package, &vendor_dir);
                let observed = entry
                    .vendor_dependencies
                    .entry(vendor.name.clone())
                    .or_default();
                for location in found {
                    if !observed.contains(&location) {
                        observed.push(location);
                    }
                }
            }
        }

        report
    }

    /// Packages a vendor exposes: its own plus those of its dependencies,
    /// expanded `VENDOR_EXPANSION_DEPTH` levels deep
    fn exposed_packages(
        &self,
        vendor: &VendorSpec,
        own_packages: &HashMap<&str, Vec<String>>,
    ) -> Vec<String> {
        let mut exposed = Vec::new();
        let mut seen = HashSet::new();
        let mut push_all = |names: Option<&Vec<String>>, exposed: &mut Vec<String>| {
            for name in names.into_iter().flatten() {
                if seen.insert(name.clone()) {
                    exposed.push(name.clone());
                }
            }
        };

        push_all(own_packages.get(vendor.name.as_str()), &mut exposed);

        let mut frontier: Vec<&VendorSpec> = vec![vendor];
        let mut visited: BTreeSet<&str> = BTreeSet::from([vendor.name.as_str()]);
        for _ in 0..VENDOR_EXPANSION_DEPTH {
            let mut next = Vec::new();
            for current in frontier {
                for dep_name in &current.dependencies {
                    if !visited.insert(dep_name.as_str()) {
                        continue;
                    }
                    push_all(own_packages.get(dep_name.as_str()), &mut exposed);
                    if let Some(dep) = self.config.vendor(dep_name) {
                        next.push(dep);
                    }
                }
            }
            frontier = next;
        }

        exposed
    }

    /// Names of the sub-packages a vendor packs, read from their manifests
    fn packaged_names(&self, vendor: &VendorSpec) -> Vec<String> {
        if !vendor.pack.required {
            return Vec::new();
        }

        let vendor_dir = self.project_root.join(&vendor.path);
        match discover_sub_packages(&vendor_dir, vendor) {
            Ok(packages) => packages
                .into_iter()
                .filter_map(|p| p.manifest.map(|m| m.name))
                .collect(),
            Err(e) => {
                log::warn!("{}: could not read sub-packages: {:#}", vendor.name, e);
                Vec::new()
            }
        }
    }
}
