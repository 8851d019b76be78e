// Vendor pipeline: install -> build -> pack -> unpack, with rollback

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::archive::{extract_stripped, read_declared_name};
use crate::config::{UnpackTarget, VendorConfig, VendorSpec, DEBUG_ROOT_ENV};
use crate::manifest::{discover_sub_packages, name_segments, PackageManifest, SubPackage};
use crate::runner::{CommandError, CommandRunner, Invocation, OutputMode};
use crate::snapshot::{RollbackReport, SnapshotEntry, Transaction};

/// Stands in for a `..` that would climb out of the debug root
const PARENT_SEGMENT: &str = "__parent__";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("[{vendor}] install failed: {source}")]
    Install {
        vendor: String,
        source: CommandError,
    },

    #[error("[{vendor}] build failed: {source}")]
    Build {
        vendor: String,
        source: CommandError,
    },

    #[error("[{vendor}] packing {package} failed: {source}")]
    Pack {
        vendor: String,
        package: String,
        source: CommandError,
    },

    #[error("[{vendor}] {message}")]
    Staging { vendor: String, message: String },
}

/// A fatal run error together with the transaction log it rolled back
#[derive(Error, Debug)]
#[error("vendoring aborted, {} snapshot(s) rolled back", .rollback.restored.len())]
pub struct PipelineFailure {
    #[source]
    pub error: PipelineError,
    pub snapshots: Vec<SnapshotEntry>,
    pub rollback: RollbackReport,
}

impl PipelineError {
    fn staging(vendor: &VendorSpec, err: anyhow::Error) -> Self {
        PipelineError::Staging {
            vendor: vendor.name.clone(),
            message: format!("{:#}", err),
        }
    }
}

/// Where the pipeline reads and writes
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub project_root: PathBuf,
    /// Archives and backups go here
    pub scratch_dir: PathBuf,
    /// Re-root every unpack destination under this directory
    pub debug_root: Option<PathBuf>,
    /// Remove the scratch directory after a successful run
    pub clean_scratch: bool,
}

impl PipelineOptions {
    pub fn new<P: AsRef<Path>>(project_root: P) -> Self {
        let project_root = project_root.as_ref().to_path_buf();
        let scratch_dir = project_root.join(".vendorkit").join("scratch");

        Self {
            project_root,
            scratch_dir,
            debug_root: None,
            clean_scratch: false,
        }
    }

    /// Pick up the debug root from the environment, if set
    pub fn with_env_debug_root(mut self) -> Self {
        if let Ok(root) = std::env::var(DEBUG_ROOT_ENV) {
            if !root.trim().is_empty() {
                self.debug_root = Some(PathBuf::from(root));
            }
        }
        self
    }
}

/// One archive produced by the pack phase
#[derive(Debug, Clone, Serialize)]
pub struct PackedArchive {
    pub vendor: String,
    pub package: String,
    pub version: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// An unpack target that could not be populated
#[derive(Debug, Clone, Serialize)]
pub struct TargetFailure {
    pub package: String,
    pub target: String,
    pub error: String,
}

/// What a successful run did
#[derive(Debug, Default, Serialize)]
pub struct PipelineReport {
    pub archives: Vec<PackedArchive>,
    pub unpacked: Vec<PathBuf>,
    pub failed_targets: Vec<TargetFailure>,
    /// Sub-package directories skipped for lack of a manifest
    pub skipped: Vec<PathBuf>,
    pub snapshots: Vec<SnapshotEntry>,
}

pub struct VendorPipeline<'a, R: CommandRunner> {
    config: &'a VendorConfig,
    runner: &'a R,
    options: PipelineOptions,
}

impl<'a, R: CommandRunner> VendorPipeline<'a, R> {
    pub fn new(config: &'a VendorConfig, runner: &'a R, options: PipelineOptions) -> Self {
        Self {
            config,
            runner,
            options,
        }
    }

    /// Run every phase for every vendor. On a fatal error all recorded
    /// snapshots are rolled back before the error is returned.
    pub fn run(&self) -> Result<PipelineReport, PipelineFailure> {
        let mut tx = Transaction::new(self.options.scratch_dir.join("backups"));

        match self.run_phases(&mut tx) {
            Ok(mut report) => {
                report.snapshots = tx.entries().to_vec();
                tx.commit();
                if self.options.clean_scratch {
                    if let Err(e) = fs::remove_dir_all(&self.options.scratch_dir) {
                        log::warn!("failed to clean {}: {}", self.options.scratch_dir.display(), e);
                    }
                }
                log::info!(
                    "done: {} archive(s), {} destination(s), {} failed target(s)",
                    report.archives.len(),
                    report.unpacked.len(),
                    report.failed_targets.len()
                );
                Ok(report)
            }
            Err(error) => {
                log::error!("{}", error);
                let snapshots = tx.entries().to_vec();
                log::warn!("rolling back {} snapshot(s)", snapshots.len());
                let rollback = tx.rollback();
                if !rollback.is_clean() {
                    log::error!(
                        "rollback left {} path(s) unrestored",
                        rollback.failed.len()
                    );
                }
                Err(PipelineFailure {
                    error,
                    snapshots,
                    rollback,
                })
            }
        }
    }

    fn run_phases(&self, tx: &mut Transaction) -> Result<PipelineReport, PipelineError> {
        // Every install finishes before anything destructive happens
        for vendor in &self.config.vendor_packages {
            if vendor.install.required {
                self.install(vendor)?;
            }
        }

        let mut report = PipelineReport::default();
        for vendor in &self.config.vendor_packages {
            if vendor.build.required {
                self.build(vendor)?;
            }
            if vendor.pack.required {
                self.pack_and_unpack(vendor, tx, &mut report)?;
            }
        }

        Ok(report)
    }

    fn vendor_dir(&self, vendor: &VendorSpec) -> PathBuf {
        self.options.project_root.join(&vendor.path)
    }

    fn install(&self, vendor: &VendorSpec) -> Result<(), PipelineError> {
        log::info!("[{}] installing", vendor.name);

        let invocation = Invocation::new(&self.config.package_manager, self.vendor_dir(vendor));
        let invocation = match vendor.install.script.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => invocation.args(["run", script]),
            _ => invocation.arg("install"),
        };

        self.runner
            .run(
                &invocation
                    .output(OutputMode::Capture)
                    .timeout(self.config.command_timeout()),
            )
            .map(|_| ())
            .map_err(|source| PipelineError::Install {
                vendor: vendor.name.clone(),
                source,
            })
    }

    fn build(&self, vendor: &VendorSpec) -> Result<(), PipelineError> {
        log::info!("[{}] building", vendor.name);

        let script = vendor.build.script.as_deref().unwrap_or("build").trim();
        let invocation = Invocation::new(&self.config.package_manager, self.vendor_dir(vendor))
            .args(["run", script])
            .output(OutputMode::Inherit)
            .timeout(self.config.command_timeout());

        self.runner
            .run(&invocation)
            .map(|_| ())
            .map_err(|source| PipelineError::Build {
                vendor: vendor.name.clone(),
                source,
            })
    }

    fn pack_and_unpack(
        &self,
        vendor: &VendorSpec,
        tx: &mut Transaction,
        report: &mut PipelineReport,
    ) -> Result<(), PipelineError> {
        let scratch = self
            .prepare_scratch()
            .map_err(|e| PipelineError::staging(vendor, e))?;
        let sub_packages = discover_sub_packages(&self.vendor_dir(vendor), vendor)
            .map_err(|e| PipelineError::staging(vendor, e))?;

        for sub in sub_packages {
            let Some(manifest) = &sub.manifest else {
                log::warn!(
                    "[{}] {} has no package.json, skipping",
                    vendor.name,
                    sub.path.display()
                );
                report.skipped.push(sub.path.clone());
                continue;
            };

            let packed = self.pack(vendor, &sub, manifest, &scratch)?;

            for target in vendor.unpack_targets() {
                match self.unpack(vendor, &packed.path, &target, tx) {
                    Ok(dest) => {
                        log::info!("[{}] {} -> {}", vendor.name, packed.package, dest.display());
                        report.unpacked.push(dest);
                    }
                    Err(e) => {
                        let target = describe_target(&target);
                        log::error!(
                            "[{}] unpacking {} into {} failed: {:#}",
                            vendor.name,
                            packed.package,
                            target,
                            e
                        );
                        report.failed_targets.push(TargetFailure {
                            package: packed.package.clone(),
                            target,
                            error: format!("{:#}", e),
                        });
                    }
                }
            }

            report.archives.push(packed);
        }

        Ok(())
    }

    fn prepare_scratch(&self) -> Result<PathBuf> {
        let scratch = &self.options.scratch_dir;
        fs::create_dir_all(scratch)
            .with_context(|| format!("Failed to create scratch directory: {}", scratch.display()))?;

        // Packing runs inside each sub-package, so the output path must be absolute
        fs::canonicalize(scratch)
            .with_context(|| format!("Failed to resolve scratch directory: {}", scratch.display()))
    }

    fn pack(
        &self,
        vendor: &VendorSpec,
        sub: &SubPackage,
        manifest: &PackageManifest,
        scratch: &Path,
    ) -> Result<PackedArchive, PipelineError> {
        let archive = scratch.join(manifest.archive_file_name());
        log::info!(
            "[{}] packing {}@{} -> {}",
            vendor.name,
            manifest.name,
            manifest.version,
            archive.display()
        );

        let invocation = Invocation::new(&self.config.package_manager, &sub.path)
            .args(["pack", "--out"])
            .arg(archive.to_string_lossy())
            .output(OutputMode::Capture)
            .timeout(self.config.command_timeout());

        self.runner
            .run(&invocation)
            .map_err(|source| PipelineError::Pack {
                vendor: vendor.name.clone(),
                package: manifest.name.clone(),
                source,
            })?;

        let sha256 = sha256_file(&archive).map_err(|e| PipelineError::staging(vendor, e))?;
        log::debug!("[{}] {} sha256:{}", vendor.name, archive.display(), sha256);

        Ok(PackedArchive {
            vendor: vendor.name.clone(),
            package: manifest.name.clone(),
            version: manifest.version.clone(),
            path: archive,
            sha256,
        })
    }

    /// Directory an unpack target resolves to, before the package name is appended
    fn target_base(&self, vendor: &VendorSpec, target: &UnpackTarget) -> Result<PathBuf> {
        let relative = match target {
            UnpackTarget::Root => PathBuf::from(&self.config.dependency_dir),
            UnpackTarget::VendorRelative(dir) => Path::new(&vendor.path).join(dir),
        };

        let Some(debug_root) = &self.options.debug_root else {
            return Ok(self.options.project_root.join(relative));
        };

        let base = debug_root.join(rebase_relative(&relative));
        if !base.starts_with(debug_root) {
            anyhow::bail!(
                "{} escapes the debug root {}",
                relative.display(),
                debug_root.display()
            );
        }
        Ok(base)
    }

    fn unpack(
        &self,
        vendor: &VendorSpec,
        archive: &Path,
        target: &UnpackTarget,
        tx: &mut Transaction,
    ) -> Result<PathBuf> {
        let declared = read_declared_name(archive)?;

        let mut dest = self.target_base(vendor, target)?;
        for segment in name_segments(&declared) {
            if segment == "." || segment == ".." {
                anyhow::bail!("Refusing package name with relative segments: {}", declared);
            }
            dest.push(segment);
        }

        // Covers the scope and dependency directories created along the way
        let guarded = outermost_missing(&dest);
        tx.snapshot(&guarded)?;

        match replace_with_archive(archive, &dest) {
            Ok(written) => {
                log::debug!("[{}] extracted {} entries into {}", vendor.name, written, dest.display());
                Ok(dest)
            }
            Err(e) => {
                match tx.restore(&guarded) {
                    Ok(()) => log::warn!("[{}] {} left as it was", vendor.name, guarded.display()),
                    Err(restore_err) => log::error!("[{}] {}", vendor.name, restore_err),
                }
                Err(e)
            }
        }
    }
}

/// Clear `dest` and extract `archive` into it
fn replace_with_archive(archive: &Path, dest: &Path) -> Result<usize> {
    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("Failed to clear {}", dest.display()))?;
    }
    fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    Ok(extract_stripped(archive, dest)?)
}

/// `path` itself if it exists, otherwise its outermost ancestor that does not exist yet
fn outermost_missing(path: &Path) -> PathBuf {
    let mut top = path;
    while let Some(parent) = top.parent() {
        if parent.as_os_str().is_empty() || fs::symlink_metadata(parent).is_ok() {
            break;
        }
        top = parent;
    }
    top.to_path_buf()
}

fn describe_target(target: &UnpackTarget) -> String {
    match target {
        UnpackTarget::Root => crate::config::ROOT_SENTINEL.to_string(),
        UnpackTarget::VendorRelative(dir) => dir.clone(),
    }
}

/// Turn `path` into a plain relative path that can be re-rooted under the debug root.
///
/// Root and prefix components are dropped, `..` cancels the segment before it,
/// and a `..` with nothing left to cancel becomes a literal `__parent__` segment.
fn rebase_relative(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(segment) => out.push(segment),
            Component::ParentDir => {
                if out.as_os_str().is_empty() || out.ends_with(PARENT_SEGMENT) {
                    out.push(PARENT_SEGMENT);
                } else {
                    out.pop();
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// SHA-256 of a file, hex encoded
fn sha256_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read archive: {}", path.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase_relative() {
        assert_eq!(rebase_relative(Path::new("/abs/vendor/node_modules")), PathBuf::from("abs/vendor/node_modules"));
        assert_eq!(rebase_relative(Path::new("./v/node_modules")), PathBuf::from("v/node_modules"));
        assert_eq!(rebase_relative(Path::new("v/../w/node_modules")), PathBuf::from("w/node_modules"));
        assert_eq!(
            rebase_relative(Path::new("../shared/node_modules")),
            PathBuf::from("__parent__/shared/node_modules")
        );
        assert_eq!(
            rebase_relative(Path::new("v/../../../node_modules")),
            PathBuf::from("__parent__/__parent__/node_modules")
        );
    }

    #[test]
    fn test_outermost_missing() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("node_modules");
        fs::create_dir_all(&existing).unwrap();

        assert_eq!(outermost_missing(&existing), existing);
        assert_eq!(
            outermost_missing(&existing.join("@demo").join("core")),
            existing.join("@demo")
        );
        assert_eq!(
            outermost_missing(&dir.path().join("v/node_modules/@demo/core")),
            dir.path().join("v")
        );
    }

    #[test]
    fn test_target_base_with_debug_root() {
        let config = VendorConfig::from_yaml_str(
            "vendor-packages:\n  - name: demo\n    path: ./v\n    pack:\n      required: true\n    unpack:\n      targets: [\"$$ROOT\", apps/web/node_modules]\n",
        )
        .unwrap();
        let runner = crate::runner::ProcessRunner;
        let vendor = &config.vendor_packages[0];

        let mut options = PipelineOptions::new("/proj");
        let pipeline = VendorPipeline::new(&config, &runner, options.clone());
        assert_eq!(
            pipeline.target_base(vendor, &UnpackTarget::Root).unwrap(),
            PathBuf::from("/proj/node_modules")
        );

        options.debug_root = Some(PathBuf::from("/tmp/debug"));
        let pipeline = VendorPipeline::new(&config, &runner, options);
        assert_eq!(
            pipeline.target_base(vendor, &UnpackTarget::Root).unwrap(),
            PathBuf::from("/tmp/debug/node_modules")
        );
        assert_eq!(
            pipeline
                .target_base(
                    vendor,
                    &UnpackTarget::VendorRelative("apps/web/node_modules".to_string())
                )
                .unwrap(),
            PathBuf::from("/tmp/debug/v/apps/web/node_modules")
        );
        assert_eq!(
            pipeline
                .target_base(
                    vendor,
                    &UnpackTarget::VendorRelative("../../node_modules".to_string())
                )
                .unwrap(),
            PathBuf::from("/tmp/debug/__parent__/node_modules")
        );
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.tgz");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
