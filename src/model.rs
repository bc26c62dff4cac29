use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

// ============================================================================
// Dependency Analysis
// ============================================================================

/// Where a module name resolves in the current interpreter environment.
///
/// A name maps to exactly one classification per analysis run. The answer
/// depends on the live environment and may differ between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleClassification {
    /// Compiled into the interpreter, never a separate file
    Builtin,

    /// Ships with the interpreter distribution
    Stdlib,

    /// Installed by a package manager (`site-packages` / `dist-packages`)
    ThirdParty,

    /// Importable, but none of the above
    Available,

    /// Cannot be resolved at all
    Missing,
}

impl ModuleClassification {
    /// Builtin and stdlib modules never need bundling hints.
    pub fn is_runtime_provided(self) -> bool {
        matches!(self, Self::Builtin | Self::Stdlib)
    }
}

/// A single top-level import observed in a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImportReference {
    pub module: String,
    pub origin: PathBuf,
}

/// Result of analyzing a project tree. Built fresh per analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
    /// Top-level modules installed by a package manager
    pub third_party: BTreeSet<String>,

    /// Imported modules that cannot be resolved
    pub missing: BTreeSet<String>,

    /// Modules the packaging backend should be told about explicitly
    pub hidden_imports: BTreeSet<String>,

    /// Source files whose imports contributed to this report
    pub files_analyzed: Vec<PathBuf>,

    /// Source files skipped because they could not be read or parsed
    pub skipped_files: Vec<PathBuf>,
}

// ============================================================================
// Packaging Configuration
// ============================================================================

/// The external packaging program to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    PyInstaller,
    Nuitka,
}

impl Backend {
    /// Name used in the settings document.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PyInstaller => "pyinstaller",
            Self::Nuitka => "nuitka",
        }
    }

    /// Anything other than `nuitka` selects PyInstaller.
    pub fn from_setting(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("nuitka") {
            Self::Nuitka
        } else {
            Self::PyInstaller
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One-file executable versus a directory of supporting files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BundleMode {
    OneFile,
    #[default]
    OneDir,
}

/// Whether the packaged program opens a terminal window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowMode {
    Windowed,
    #[default]
    Console,
}

/// A `source;destination` data-file mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMapping {
    pub source: PathBuf,
    pub destination: String,
}

impl DataMapping {
    /// Splits `src;dst` at the first `;`. Returns `None` when the separator
    /// is missing or either side is blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let (src, dst) = raw.split_once(';')?;
        let (src, dst) = (src.trim(), dst.trim());
        if src.is_empty() || dst.is_empty() {
            return None;
        }
        Some(Self {
            source: PathBuf::from(src),
            destination: dst.to_string(),
        })
    }
}

/// Everything the caller chose for one packaging attempt.
///
/// `bundle` and `window` are single enums, so exactly one of
/// one-file/one-directory and exactly one of windowed/console is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagingConfig {
    pub backend: Backend,
    pub main_file: PathBuf,
    /// `None` means `<main file dir>/dist`
    pub output_dir: Option<PathBuf>,
    pub output_name: Option<String>,
    pub bundle: BundleMode,
    pub window: WindowMode,
    pub icon: Option<PathBuf>,
    pub hidden_imports: Vec<String>,
    /// Raw `src;dst` entries, validated when the command is built
    pub data_files: Vec<String>,
    pub excludes: Vec<String>,
    pub clean: bool,
    pub no_confirm: bool,
    pub auto_analyze: bool,
    pub smart_exclude: bool,
    pub upx_compress: bool,
    pub auto_add_missing: bool,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            backend: Backend::PyInstaller,
            main_file: PathBuf::new(),
            output_dir: None,
            output_name: None,
            bundle: BundleMode::OneDir,
            window: WindowMode::Console,
            icon: None,
            hidden_imports: Vec::new(),
            data_files: Vec::new(),
            excludes: Vec::new(),
            clean: true,
            no_confirm: true,
            auto_analyze: true,
            smart_exclude: true,
            upx_compress: false,
            auto_add_missing: true,
        }
    }
}

/// What [`PackagingConfig::merge_report`] appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added_hidden: Vec<String>,
    pub added_missing: Vec<String>,
}

impl MergeSummary {
    pub fn is_empty(&self) -> bool {
        self.added_hidden.is_empty() && self.added_missing.is_empty()
    }
}

impl PackagingConfig {
    /// Directory holding the main file; also the backend's working directory.
    pub fn project_dir(&self) -> PathBuf {
        match self.main_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Output directory with the `<project>/dist` default applied.
    pub fn effective_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.project_dir().join("dist"))
    }

    /// Appends recommended hidden imports, and missing modules when
    /// `auto_add_missing` is set, skipping names already listed.
    pub fn merge_report(&mut self, report: &DependencyReport) -> MergeSummary {
        let mut summary = MergeSummary::default();

        for name in &report.hidden_imports {
            if !self.has_hidden_import(name) {
                self.hidden_imports.push(name.clone());
                summary.added_hidden.push(name.clone());
            }
        }

        if self.auto_add_missing {
            for name in &report.missing {
                if !self.has_hidden_import(name) {
                    self.hidden_imports.push(name.clone());
                    summary.added_missing.push(name.clone());
                }
            }
        }

        summary
    }

    fn has_hidden_import(&self, name: &str) -> bool {
        self.hidden_imports.iter().any(|h| h.trim() == name)
    }
}

// ============================================================================
// Command & Process Result
// ============================================================================

/// A fully built backend invocation. Consumed once by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl Command {
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// How a supervised run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit status zero
    Succeeded,

    /// The program ran and exited non-zero (`None` when killed by a signal)
    ExitFailure { code: Option<i32> },

    /// The program could not be started at all
    LaunchFailure { reason: String },

    /// Stopped through `stop()`; `forced` when the grace period ran out
    Cancelled { forced: bool },
}

/// Terminal report of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    pub success: bool,
    pub summary: String,
    /// Most recent error-bearing output lines, oldest first
    pub error_excerpt: Vec<String>,
    pub outcome: RunOutcome,
}

impl ProcessResult {
    pub fn from_outcome(outcome: RunOutcome, error_excerpt: Vec<String>) -> Self {
        let summary = match &outcome {
            RunOutcome::Succeeded => "Packaging completed successfully".to_string(),
            RunOutcome::ExitFailure { code: Some(code) } => {
                format!("Packaging failed with exit code {}", code)
            }
            RunOutcome::ExitFailure { code: None } => {
                "Packaging failed: process terminated by a signal".to_string()
            }
            RunOutcome::LaunchFailure { reason } => {
                format!("Failed to launch packaging backend: {}", reason)
            }
            RunOutcome::Cancelled { forced: false } => "Packaging cancelled".to_string(),
            RunOutcome::Cancelled { forced: true } => {
                "Packaging cancelled (process killed after grace period)".to_string()
            }
        };

        // Cancellation is not a failure worth an excerpt.
        let error_excerpt = match outcome {
            RunOutcome::ExitFailure { .. } => error_excerpt,
            _ => Vec::new(),
        };

        Self {
            success: outcome == RunOutcome::Succeeded,
            summary,
            error_excerpt,
            outcome,
        }
    }
}
