// vendorkit - vendor build-and-distribute pipeline and resolution auditor

pub mod archive;
pub mod auditor;
pub mod config;
pub mod manifest;
pub mod normalize;
pub mod pipeline;
pub mod runner;
pub mod snapshot;
pub mod walker;

pub use archive::{extract_stripped, read_declared_name, ArchiveError};
pub use auditor::{DependencyAuditor, DependencyReport, PackageResolution, VENDOR_EXPANSION_DEPTH};
pub use config::{
    ConfigError, UnpackTarget, VendorConfig, VendorSpec, DEBUG_ROOT_ENV, ROOT_SENTINEL,
};
pub use manifest::{discover_sub_packages, PackageManifest, SubPackage};
pub use normalize::normalize;
pub use pipeline::{
    PackedArchive, PipelineError, PipelineFailure, PipelineOptions, PipelineReport, TargetFailure,
    VendorPipeline,
};
pub use runner::{CommandError, CommandOutput, CommandRunner, Invocation, OutputMode, ProcessRunner};
pub use snapshot::{RollbackReport, SnapshotEntry, Transaction};
pub use walker::{DependencyGraphWalker, ResolutionProbe};

/// Tool version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
