//! Packaging orchestration.
//!
//! [`PackagingExecutor`] drives one packaging request through its stages:
//! environment probe → project scan → module lookup → classification →
//! config merge → command build → supervised run. Blocking stages run on
//! the blocking pool under a stage timeout; only one packaging process runs
//! at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::analysis::analyzer::{DependencyAnalyzer, ProjectScan};
use crate::analysis::classifier::ModuleClassifier;
use crate::analysis::environment::{EnvironmentResolver, LocatedResolver};
use crate::analysis::hidden::HiddenImportTable;
use crate::analysis::imports::ImportExtractor;
use crate::model::{Backend, Command, DependencyReport, MergeSummary, PackagingConfig};
use crate::packaging::command::{CommandBuildWarning, CommandBuilder};
use crate::packaging::supervisor::{ProcessSupervisor, RunHandle, SupervisorError};
use crate::traits::{EnvironmentProbe, ModuleResolver, ProbeError};

// ============================================================================
// Executor Types
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("Main file not found: {}", .0.display())]
    MissingMainFile(PathBuf),

    #[error("A packaging process is already running")]
    AlreadyRunning,

    #[error("Stage '{stage}' timed out after {timeout_secs}s")]
    StageTimeout { stage: String, timeout_secs: u64 },

    #[error("Environment probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Analysis failed: {0}")]
    AnalysisFailed(String),

    #[error("Cannot create output directory '{}': {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<SupervisorError> for ExecutorError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::AlreadyRunning => Self::AlreadyRunning,
        }
    }
}

/// Timings of the preparation stages.
#[derive(Debug, Default, Clone)]
pub struct PrepareStats {
    /// Time spent probing the interpreter (zero when cached or skipped)
    pub probe_duration_ms: u64,

    /// Time spent scanning the project
    pub analysis_duration_ms: u64,

    pub total_duration_ms: u64,
}

/// Everything decided before the backend is launched.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    /// Config after the report merge and output-dir default
    pub config: PackagingConfig,

    /// `None` when analysis was disabled or the environment was unavailable
    pub report: Option<DependencyReport>,

    pub merged: MergeSummary,
    pub command: Command,
    pub warnings: Vec<CommandBuildWarning>,
    pub stats: PrepareStats,
}

/// A launched packaging run.
#[derive(Debug)]
pub struct Execution {
    pub prepared: PreparedRun,
    pub handle: RunHandle,
}

/// Interpreter facts cached after the first successful probe.
#[derive(Debug)]
struct ProbedInterpreter {
    resolver: Arc<EnvironmentResolver>,
    executable: String,
}

// ============================================================================
// Executor
// ============================================================================

pub struct PackagingExecutor<P> {
    probe: P,
    interpreter: OnceCell<ProbedInterpreter>,
    table: HiddenImportTable,
    supervisor: ProcessSupervisor,
    stage_timeout: Duration,
}

impl<P: EnvironmentProbe> PackagingExecutor<P> {
    /// Default configuration: 5 minute stage timeout, default hidden-import
    /// table, a fresh supervisor.
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            interpreter: OnceCell::new(),
            table: HiddenImportTable::default(),
            supervisor: ProcessSupervisor::new(),
            stage_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_table(mut self, table: HiddenImportTable) -> Self {
        self.table = table;
        self
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.supervisor.is_busy()
    }

    /// Scans the project around `main_file`. Requires a working interpreter.
    #[instrument(skip(self, main_file), fields(main_file = %main_file.display()))]
    pub async fn analyze(&self, main_file: &Path) -> Result<DependencyReport, ExecutorError> {
        ensure_main_file(main_file)?;
        let interpreter = self.interpreter().await?;
        self.run_analysis(main_file, &interpreter.resolver).await
    }

    /// Runs every stage up to, but not including, the launch.
    #[instrument(skip(self, config), fields(backend = %config.backend))]
    pub async fn prepare(&self, mut config: PackagingConfig) -> Result<PreparedRun, ExecutorError> {
        let start = Instant::now();
        let mut stats = PrepareStats::default();

        ensure_main_file(&config.main_file)?;

        // ====================================================================
        // Stage 1: Environment
        // ====================================================================

        // PyInstaller without analysis needs nothing from the interpreter.
        let probe_start = Instant::now();
        let interpreter = if config.auto_analyze || config.backend == Backend::Nuitka {
            match self.interpreter().await {
                Ok(interpreter) => Some(interpreter),
                Err(e) if config.auto_analyze => {
                    warn!(error = %e, "Python environment unavailable, skipping dependency analysis");
                    None
                }
                Err(e) => {
                    debug!(error = %e, "Python environment unavailable");
                    None
                }
            }
        } else {
            None
        };
        stats.probe_duration_ms = probe_start.elapsed().as_millis() as u64;

        // ====================================================================
        // Stage 2: Analysis & merge
        // ====================================================================

        let mut report = None;
        let mut merged = MergeSummary::default();

        if let (true, Some(interpreter)) = (config.auto_analyze, interpreter) {
            let analysis_start = Instant::now();
            let found = self
                .run_analysis(&config.main_file, &interpreter.resolver)
                .await?;
            stats.analysis_duration_ms = analysis_start.elapsed().as_millis() as u64;

            merged = config.merge_report(&found);
            info!(
                duration_ms = stats.analysis_duration_ms,
                added_hidden = merged.added_hidden.len(),
                added_missing = merged.added_missing.len(),
                "Analysis merged into config"
            );
            report = Some(found);
        }

        // ====================================================================
        // Stage 3: Command
        // ====================================================================

        config.output_dir = Some(config.effective_output_dir());
        let working_dir = config.project_dir();

        let mut builder = CommandBuilder::new();
        if let Some(interpreter) = interpreter {
            builder = builder
                .with_resolver(interpreter.resolver.as_ref())
                .with_interpreter(&interpreter.executable);
        }
        let built = builder.build(&config, &working_dir);

        stats.total_duration_ms = start.elapsed().as_millis() as u64;
        info!(
            command = %built.command,
            warnings = built.warnings.len(),
            duration_ms = stats.total_duration_ms,
            "Packaging command prepared"
        );

        Ok(PreparedRun {
            config,
            report,
            merged,
            command: built.command,
            warnings: built.warnings,
            stats,
        })
    }

    /// Prepares and launches a packaging run.
    ///
    /// # Errors
    ///
    /// Fails with [`ExecutorError::AlreadyRunning`] while another run from
    /// this executor is active, without touching the project.
    #[instrument(skip(self, config), fields(backend = %config.backend))]
    pub async fn execute(&self, config: PackagingConfig) -> Result<Execution, ExecutorError> {
        if self.supervisor.is_busy() {
            return Err(ExecutorError::AlreadyRunning);
        }

        let prepared = self.prepare(config).await?;

        if let Some(dir) = &prepared.config.output_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ExecutorError::OutputDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let handle = self.supervisor.start(prepared.command.clone())?;
        info!(backend = %prepared.config.backend, "Packaging started");

        Ok(Execution { prepared, handle })
    }

    async fn interpreter(&self) -> Result<&ProbedInterpreter, ExecutorError> {
        self.interpreter
            .get_or_try_init(|| async {
                let env = timeout(self.stage_timeout, self.probe.probe())
                    .await
                    .map_err(|_| ExecutorError::StageTimeout {
                        stage: "probe".to_string(),
                        timeout_secs: self.stage_timeout.as_secs(),
                    })??;

                let executable = if env.executable.as_os_str().is_empty() {
                    self.probe.interpreter().to_string()
                } else {
                    env.executable.to_string_lossy().into_owned()
                };

                Ok(ProbedInterpreter {
                    resolver: Arc::new(EnvironmentResolver::new(&env)),
                    executable,
                })
            })
            .await
    }

    /// Scans the project, asks the interpreter where the imported names live,
    /// then classifies. Names the interpreter could not answer for fall back
    /// to the filesystem resolver.
    async fn run_analysis(
        &self,
        main_file: &Path,
        resolver: &Arc<EnvironmentResolver>,
    ) -> Result<DependencyReport, ExecutorError> {
        let main_file = main_file.to_path_buf();
        let scan = self
            .blocking_stage("scan", move || {
                ProjectScan::collect(&ImportExtractor::new(), &main_file)
            })
            .await?;

        let mut names = scan.module_names();
        names.retain(|name| !resolver.is_builtin(name) && !resolver.is_stdlib(name));

        let located = match timeout(self.stage_timeout, self.probe.locate(&names)).await {
            Ok(Ok(located)) => located,
            Ok(Err(e)) => {
                warn!(error = %e, "Interpreter lookup failed, resolving modules from the search path");
                HashMap::new()
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.stage_timeout.as_secs(),
                    "Interpreter lookup timed out, resolving modules from the search path"
                );
                HashMap::new()
            }
        };
        debug!(requested = names.len(), located = located.len(), "Module lookup finished");

        let resolver = LocatedResolver::new(Arc::clone(resolver), located);
        let analyzer =
            DependencyAnalyzer::new(ModuleClassifier::new(resolver)).with_table(self.table.clone());

        self.blocking_stage("analysis", move || analyzer.report(scan))
            .await
    }

    async fn blocking_stage<T, F>(&self, stage: &str, work: F) -> Result<T, ExecutorError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        timeout(self.stage_timeout, tokio::task::spawn_blocking(work))
            .await
            .map_err(|_| ExecutorError::StageTimeout {
                stage: stage.to_string(),
                timeout_secs: self.stage_timeout.as_secs(),
            })?
            .map_err(|e| ExecutorError::AnalysisFailed(format!("Task join error: {}", e)))
    }
}

fn ensure_main_file(main_file: &Path) -> Result<(), ExecutorError> {
    if main_file.as_os_str().is_empty() || !main_file.is_file() {
        return Err(ExecutorError::MissingMainFile(main_file.to_path_buf()));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
