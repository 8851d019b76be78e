// Dependency-explain walker: where does the resolver put a package?

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::VendorConfig;
use crate::normalize::normalize;
use crate::runner::{CommandRunner, Invocation, OutputMode};

/// Anything that can answer "where does `package` resolve to from `working_dir`"
pub trait ResolutionProbe {
    /// Never fails: an unknown answer is an empty set
    fn resolve(&self, package: &str, working_dir: &Path) -> BTreeSet<PathBuf>;
}

/// One line of `why --json` output
#[derive(Debug, Deserialize)]
struct ExplainRecord {
    value: String,
    #[serde(default)]
    children: BTreeMap<String, ExplainChild>,
}

#[derive(Debug, Deserialize)]
struct ExplainChild {
    #[serde(default)]
    locator: Option<String>,
}

/// Runs the package manager's dependency-explain command and reduces its records
pub struct DependencyGraphWalker<'a, R: CommandRunner> {
    runner: &'a R,
    package_manager: String,
    dependency_dir: String,
    timeout: Duration,
}

impl<'a, R: CommandRunner> DependencyGraphWalker<'a, R> {
    pub fn new(runner: &'a R, config: &VendorConfig) -> Self {
        Self {
            runner,
            package_manager: config.package_manager.clone(),
            dependency_dir: config.dependency_dir.clone(),
            timeout: config.explain_timeout(),
        }
    }

    fn try_resolve(&self, package: &str, working_dir: &Path) -> Result<BTreeSet<PathBuf>> {
        let invocation = Invocation::new(&self.package_manager, working_dir)
            .args(["why", package, "--json", "--recursive"])
            .output(OutputMode::Capture)
            .timeout(self.timeout);

        let output = self.runner.run(&invocation)?;
        parse_explain_output(&output.stdout, package, working_dir, &self.dependency_dir)
    }
}

impl<R: CommandRunner> ResolutionProbe for DependencyGraphWalker<'_, R> {
    fn resolve(&self, package: &str, working_dir: &Path) -> BTreeSet<PathBuf> {
        match self.try_resolve(package, working_dir) {
            Ok(locations) => locations,
            Err(e) => {
                log::warn!(
                    "could not resolve {} from {}: {:#}",
                    package,
                    working_dir.display(),
                    e
                );
                BTreeSet::new()
            }
        }
    }
}

/// Name part of a `<name>:<resolution>` locator (`core@npm:1.0.0` -> `core@npm`)
fn locator_name(locator: &str) -> Result<&str> {
    match locator.split_once(':') {
        Some((name, _)) if !name.is_empty() => Ok(name),
        _ => anyhow::bail!("Malformed locator: {}", locator),
    }
}

/// Normalized `<dependency_dir>/<name>` under `base`
fn install_location(base: &Path, dependency_dir: &str, name: &str) -> PathBuf {
    normalize(&base.join(dependency_dir).join(name))
}

/// Reduce newline-delimited explain records into a set of locations.
///
/// The direct location of `package` is always part of the result. Any
/// malformed line fails the whole parse.
pub fn parse_explain_output(
    stdout: &str,
    package: &str,
    working_dir: &Path,
    dependency_dir: &str,
) -> Result<BTreeSet<PathBuf>> {
    let mut locations = BTreeSet::new();
    locations.insert(install_location(working_dir, dependency_dir, package));

    for (index, line) in stdout.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: ExplainRecord = serde_json::from_str(line)
            .with_context(|| format!("Invalid explain record on line {}", index + 1))?;

        let parent = install_location(working_dir, dependency_dir, locator_name(&record.value)?);

        for child in record.children.values() {
            let Some(locator) = &child.locator else {
                continue;
            };
            let child_location = install_location(Path::new(""), dependency_dir, locator_name(locator)?);
            locations.insert(parent.join(child_location));
        }
    }

    Ok(locations)
}
