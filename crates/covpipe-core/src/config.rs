//! Pipeline file model (`covpipe.toml`).
//!
//! The file declares the interpreter matrix, the ordered dependency set, the
//! installer command prefixes, the test command with its coverage options and
//! the coverage export step. Commands may use `{interpreter}`, `{version}` and
//! `{job}` placeholders which are substituted per job.

use crate::coverage::CoverageFlags;
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Default location of the reporting helper download.
pub const DEFAULT_HELPER_URL: &str =
    "https://codeclimate.com/downloads/test-reporter/test-reporter-latest-linux-amd64";

/// Default variable name the reporting helper reads its identifier from.
pub const DEFAULT_REPORTER_ID_ENV: &str = "CC_TEST_REPORTER_ID";

/// Default pipeline file name.
pub const DEFAULT_PIPELINE_FILE: &str = "covpipe.toml";

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory every command runs in.
    pub workdir: PathBuf,

    /// Global read-only variables shared by every job.
    pub env: BTreeMap<String, String>,

    pub reporter: ReporterConfig,

    pub matrix: MatrixConfig,

    /// Ordered install actions executed before the tests.
    pub dependencies: Vec<InstallAction>,

    pub installers: InstallersConfig,

    pub tests: TestConfig,

    pub export: ExportConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            env: BTreeMap::new(),
            reporter: ReporterConfig::default(),
            matrix: MatrixConfig::default(),
            dependencies: Vec::new(),
            installers: InstallersConfig::default(),
            tests: TestConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

/// External reporting helper settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReporterConfig {
    /// Reporting-service identifier. Usually supplied on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Variable the helper reads the identifier from.
    pub id_env: String,

    /// Fixed download location of the helper.
    pub helper_url: String,

    /// Local helper binary to copy instead of downloading.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helper_file: Option<PathBuf>,

    /// Helper location relative to the working directory. Each job gets its
    /// own copy at `<helper_path>-<job id>`.
    pub helper_path: PathBuf,

    /// Timeout for each helper invocation in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            id: None,
            id_env: DEFAULT_REPORTER_ID_ENV.to_string(),
            helper_url: DEFAULT_HELPER_URL.to_string(),
            helper_file: None,
            helper_path: PathBuf::from("cc-test-reporter"),
            timeout_secs: 300,
        }
    }
}

/// Interpreter matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MatrixConfig {
    pub interpreter: String,

    /// Ordered interpreter versions; one job per entry.
    pub versions: Vec<String>,

    /// Maximum number of jobs in flight.
    pub parallelism: usize,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            versions: vec!["2.7".to_string()],
            parallelism: 1,
        }
    }
}

/// Which package manager an install action targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Installer {
    /// OS-level package manager.
    System,
    /// Interpreter-level package manager.
    Language,
}

impl Installer {
    pub fn name(&self) -> &'static str {
        match self {
            Installer::System => "system",
            Installer::Language => "language",
        }
    }
}

/// One entry of the dependency set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InstallAction {
    pub installer: Installer,

    /// Named package to install.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    /// Local project descriptor directory to install from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl InstallAction {
    pub fn package(installer: Installer, name: &str) -> Self {
        Self {
            installer,
            package: Some(name.to_string()),
            path: None,
        }
    }

    pub fn local(installer: Installer, path: impl Into<PathBuf>) -> Self {
        Self {
            installer,
            package: None,
            path: Some(path.into()),
        }
    }

    /// The argument handed to the installer.
    pub fn target(&self) -> Result<String> {
        match (&self.package, &self.path) {
            (Some(name), None) => Ok(name.clone()),
            (None, Some(path)) => Ok(path.to_string_lossy().into_owned()),
            _ => Err(PipelineError::InvalidConfig(format!(
                "{} install action needs exactly one of `package` or `path`",
                self.installer.name()
            ))),
        }
    }

    pub fn label(&self) -> String {
        let target = self.target().unwrap_or_else(|_| "?".to_string());
        format!("{}:{}", self.installer.name(), target)
    }
}

/// Installer command prefixes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct InstallersConfig {
    pub system: SystemInstaller,
    pub language: LanguageInstaller,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SystemInstaller {
    pub command: Vec<String>,

    /// Index refresh run once before the first system action of a job.
    /// An empty list disables it.
    pub refresh: Vec<String>,
}

impl Default for SystemInstaller {
    fn default() -> Self {
        Self {
            command: argv(&["sudo", "apt-get", "install", "-qq"]),
            refresh: argv(&["sudo", "apt-get", "update", "-qq"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LanguageInstaller {
    pub command: Vec<String>,
}

impl Default for LanguageInstaller {
    fn default() -> Self {
        Self {
            command: argv(&["pip", "install"]),
        }
    }
}

impl InstallersConfig {
    pub fn command_for(&self, installer: Installer) -> &[String] {
        match installer {
            Installer::System => &self.system.command,
            Installer::Language => &self.language.command,
        }
    }
}

/// Test runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TestConfig {
    pub command: Vec<String>,

    /// Package filter for coverage accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,

    /// Count the test code itself in coverage.
    pub include_tests: bool,

    pub flags: CoverageFlags,

    /// Base name of the raw coverage data file. Each job writes
    /// `<coverage_file>.<job id>` in the working directory.
    pub coverage_file: PathBuf,

    /// Variable through which the coverage tool is pointed at the job's
    /// data file.
    pub coverage_env: String,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: argv(&["nosetests"]),
            package: None,
            include_tests: true,
            flags: CoverageFlags::Nose,
            coverage_file: PathBuf::from(".coverage"),
            coverage_env: "COVERAGE_FILE".to_string(),
            timeout_secs: 0,
        }
    }
}

/// Coverage export settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExportConfig {
    pub command: Vec<String>,

    /// Report written by the export command, relative to the working
    /// directory. Placeholders are substituted per job.
    pub output: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            command: argv(&["coverage", "xml", "-o", "coverage-{job}.xml"]),
            output: "coverage-{job}.xml".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| PipelineError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate pipeline TOML held in memory.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| PipelineError::ConfigParse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as a pipeline file.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::InvalidConfig(e.to_string()))
    }

    /// Check that the configuration describes a runnable pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.matrix.versions.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "matrix.versions must list at least one version".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for version in &self.matrix.versions {
            if version.trim().is_empty() {
                return Err(PipelineError::InvalidConfig(
                    "matrix.versions contains an empty entry".to_string(),
                ));
            }
            if !seen.insert(version.as_str()) {
                return Err(PipelineError::InvalidConfig(format!(
                    "matrix version '{}' is listed twice",
                    version
                )));
            }
        }

        if self.matrix.parallelism == 0 {
            return Err(PipelineError::InvalidConfig(
                "matrix.parallelism must be at least 1".to_string(),
            ));
        }

        for (name, command) in [
            ("tests.command", &self.tests.command),
            ("export.command", &self.export.command),
            ("installers.system.command", &self.installers.system.command),
            ("installers.language.command", &self.installers.language.command),
        ] {
            if command.is_empty() {
                return Err(PipelineError::EmptyCommand(name.to_string()));
            }
        }

        for action in &self.dependencies {
            action.target()?;
        }

        if self.tests.coverage_env.trim().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "tests.coverage_env must not be empty".to_string(),
            ));
        }

        if self.reporter.helper_path.as_os_str().is_empty() {
            return Err(PipelineError::InvalidConfig(
                "reporter.helper_path must not be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Keep only the listed versions, preserving matrix order.
    pub fn restrict_versions(&mut self, versions: &[String]) -> Result<()> {
        for version in versions {
            if !self.matrix.versions.contains(version) {
                return Err(PipelineError::InvalidConfig(format!(
                    "version '{}' is not part of the matrix",
                    version
                )));
            }
        }
        self.matrix.versions.retain(|v| versions.contains(v));
        Ok(())
    }

    /// SHA-256 digest of the canonical JSON form.
    ///
    /// The reporting-service identifier is excluded so the digest can be
    /// logged and published.
    pub fn digest(&self) -> Result<String> {
        let mut canonical = self.clone();
        canonical.reporter.id = None;
        let bytes = serde_json::to_vec(&canonical)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
workdir = "."

[env]
LANG = "C.UTF-8"

[reporter]
helper_path = "./cc-test-reporter"

[matrix]
versions = ["2.7", "3.6"]

[[dependencies]]
installer = "system"
package = "graphviz"

[[dependencies]]
installer = "language"
package = "coverage"

[[dependencies]]
installer = "language"
path = "."

[tests]
command = ["nosetests"]
package = "barf"
"#;

    #[test]
    fn test_parse_sample_pipeline() {
        let config = PipelineConfig::from_toml_str(SAMPLE).expect("parse failed");
        assert_eq!(config.matrix.versions, vec!["2.7", "3.6"]);
        assert_eq!(config.matrix.interpreter, "python");
        assert_eq!(config.dependencies.len(), 3);
        assert_eq!(config.dependencies[0].installer, Installer::System);
        assert_eq!(config.dependencies[2].target().unwrap(), ".");
        assert_eq!(config.tests.package.as_deref(), Some("barf"));
        assert!(config.tests.include_tests);
        assert_eq!(config.reporter.id_env, DEFAULT_REPORTER_ID_ENV);
        assert_eq!(config.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_defaults_are_valid() {
        PipelineConfig::default().validate().expect("defaults should validate");
    }

    #[test]
    fn test_empty_matrix_rejected() {
        let mut config = PipelineConfig::default();
        config.matrix.versions.clear();
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let mut config = PipelineConfig::default();
        config.matrix.versions = vec!["2.7".to_string(), "2.7".to_string()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn test_install_action_needs_one_target() {
        let action = InstallAction {
            installer: Installer::Language,
            package: Some("coverage".to_string()),
            path: Some(PathBuf::from(".")),
        };
        assert!(action.target().is_err());

        let mut config = PipelineConfig::default();
        config.dependencies.push(InstallAction {
            installer: Installer::System,
            package: None,
            path: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = PipelineConfig::from_toml_str("[matrix]\nversion = [\"2.7\"]\n");
        assert!(matches!(result, Err(PipelineError::ConfigParse { .. })));
    }

    #[test]
    fn test_empty_test_command_rejected() {
        let mut config = PipelineConfig::default();
        config.tests.command.clear();
        assert!(matches!(
            config.validate(),
            Err(PipelineError::EmptyCommand(_))
        ));
    }

    #[test]
    fn test_restrict_versions_keeps_matrix_order() {
        let mut config = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        config
            .restrict_versions(&["3.6".to_string()])
            .expect("restrict failed");
        assert_eq!(config.matrix.versions, vec!["3.6"]);

        let err = config.restrict_versions(&["9.9".to_string()]).unwrap_err();
        assert!(err.to_string().contains("9.9"));
    }

    #[test]
    fn test_digest_ignores_reporter_id() {
        let plain = PipelineConfig::default();
        let mut with_id = PipelineConfig::default();
        with_id.reporter.id = Some("secret".to_string());
        assert_eq!(plain.digest().unwrap(), with_id.digest().unwrap());

        let mut other = PipelineConfig::default();
        other.matrix.versions = vec!["3.6".to_string()];
        assert_ne!(plain.digest().unwrap(), other.digest().unwrap());
        assert_eq!(plain.digest().unwrap().len(), 64);
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let mut config = PipelineConfig::default();
        config.dependencies.push(InstallAction::package(Installer::System, "graphviz"));
        config.dependencies.push(InstallAction::local(Installer::Language, "."));
        let rendered = config.to_toml_string().expect("render failed");
        let parsed = PipelineConfig::from_toml_str(&rendered).expect("reparse failed");
        assert_eq!(parsed, config);
    }
}
