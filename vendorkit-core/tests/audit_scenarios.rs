// Audit runs driven through the real walker with a scripted explain command

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use vendorkit_core::{
    CommandError, CommandOutput, CommandRunner, DependencyAuditor, DependencyGraphWalker,
    Invocation, VendorConfig,
};

/// Answers `why <package> --json` with canned output per package
struct ExplainRunner {
    answers: HashMap<String, String>,
}

impl CommandRunner for ExplainRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        assert_eq!(invocation.args[0], "why");
        let package = &invocation.args[1];

        Ok(CommandOutput {
            stdout: self.answers.get(package).cloned().unwrap_or_default(),
            stderr: String::new(),
        })
    }
}

fn add_sub_package(root: &Path, vendor_path: &str, dir: &str, name: &str) {
    let pkg = root.join(vendor_path).join("packages").join(dir);
    fs::create_dir_all(&pkg).unwrap();
    fs::write(
        pkg.join("package.json"),
        format!(r#"{{"name":"{}","version":"1.0.0"}}"#, name),
    )
    .unwrap();
}

const TWO_VENDORS: &str = r#"
vendor-packages:
  - name: a
    path: a
    pack: { required: true }
  - name: b
    path: b
    dependencies: [a]
    pack: { required: true }
"#;

#[test]
fn dependent_vendor_gets_its_own_entry() {
    let project = tempfile::tempdir().unwrap();
    add_sub_package(project.path(), "a", "x", "x");

    let config = VendorConfig::from_yaml_str(TWO_VENDORS).unwrap();
    let runner = ExplainRunner {
        answers: HashMap::new(),
    };
    let walker = DependencyGraphWalker::new(&runner, &config);
    let report = DependencyAuditor::new(&config, &walker, project.path()).audit();

    let x = &report["x"];
    assert_eq!(x.root, vec![project.path().join("node_modules/x")]);
    assert_eq!(
        x.vendor_dependencies.get("b"),
        Some(&vec![project.path().join("b/node_modules/x")])
    );
    assert!(!x.vendor_dependencies.contains_key("a"));
}

#[test]
fn nested_copies_show_up_in_the_report() {
    let project = tempfile::tempdir().unwrap();
    add_sub_package(project.path(), "a", "x", "x");

    let config = VendorConfig::from_yaml_str(TWO_VENDORS).unwrap();
    let runner = ExplainRunner {
        answers: HashMap::from([(
            "x".to_string(),
            r#"{"value":"legacy@npm:0.9.0","children":{"x@npm:0.1.0":{"locator":"x@npm:0.1.0"}}}"#
                .to_string(),
        )]),
    };
    let walker = DependencyGraphWalker::new(&runner, &config);
    let report = DependencyAuditor::new(&config, &walker, project.path()).audit();

    let root: Vec<PathBuf> = report["x"].root.clone();
    assert!(root.contains(&project.path().join("node_modules/x")));
    assert!(root.contains(&project.path().join("node_modules/legacy/node_modules/x")));
}

#[test]
fn malformed_explain_output_leaves_empty_result_and_continues() {
    let project = tempfile::tempdir().unwrap();
    add_sub_package(project.path(), "a", "x", "x");
    add_sub_package(project.path(), "a", "y", "y");

    let config = VendorConfig::from_yaml_str(TWO_VENDORS).unwrap();
    let runner = ExplainRunner {
        answers: HashMap::from([("x".to_string(), "this is not json".to_string())]),
    };
    let walker = DependencyGraphWalker::new(&runner, &config);
    let report = DependencyAuditor::new(&config, &walker, project.path()).audit();

    assert!(report["x"].root.is_empty());
    assert_eq!(report["x"].vendor_dependencies.get("b"), Some(&Vec::new()));
    assert_eq!(report["y"].root, vec![project.path().join("node_modules/y")]);
}

#[test]
fn report_serializes_to_expected_shape() {
    let project = tempfile::tempdir().unwrap();
    add_sub_package(project.path(), "a", "x", "x");

    let config = VendorConfig::from_yaml_str(TWO_VENDORS).unwrap();
    let runner = ExplainRunner {
        answers: HashMap::new(),
    };
    let walker = DependencyGraphWalker::new(&runner, &config);
    let report = DependencyAuditor::new(&config, &walker, project.path()).audit();

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["x"]["root"].is_array());
    assert!(json["x"]["vendor_dependencies"]["b"].is_array());
}
