use crate::analysis::environment::PythonEnvironment;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Path components that mark a package-manager installation directory.
pub const PACKAGE_MANAGER_DIRS: &[&str] = &["site-packages", "dist-packages"];

/// Location an importable module was found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOrigin {
    /// File backing the module; `None` for namespace packages
    pub file: Option<PathBuf>,
}

impl ModuleOrigin {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(path.into()),
        }
    }

    pub fn namespace() -> Self {
        Self { file: None }
    }

    /// True when the backing file lives under a package-manager directory.
    pub fn is_package_managed(&self) -> bool {
        self.file.as_deref().is_some_and(is_package_managed_path)
    }
}

pub fn is_package_managed_path(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| PACKAGE_MANAGER_DIRS.contains(&s))
    })
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid Python syntax near line {line}, column {column}")]
    InvalidSyntax { line: usize, column: usize },
    #[error("Failed to load Python grammar: {0}")]
    Grammar(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Resolution hit something other than "not found".
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Could not inspect '{path}' while resolving '{module}': {source}")]
    Indeterminate {
        module: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Answers the questions the classifier asks about a module name.
///
/// Implementations must be cheap to query repeatedly; the analyzer asks once
/// per unique name per run.
pub trait ModuleResolver: Send + Sync {
    /// Compiled into the interpreter.
    fn is_builtin(&self, name: &str) -> bool;

    /// Present in the standard library directories.
    fn is_stdlib(&self, name: &str) -> bool;

    /// Locates an importable top-level module. `Ok(None)` means not found.
    fn find_module(&self, name: &str) -> Result<Option<ModuleOrigin>, ResolveError>;
}

impl<R: ModuleResolver + ?Sized> ModuleResolver for &R {
    fn is_builtin(&self, name: &str) -> bool {
        (**self).is_builtin(name)
    }

    fn is_stdlib(&self, name: &str) -> bool {
        (**self).is_stdlib(name)
    }

    fn find_module(&self, name: &str) -> Result<Option<ModuleOrigin>, ResolveError> {
        (**self).find_module(name)
    }
}

impl<R: ModuleResolver + ?Sized> ModuleResolver for std::sync::Arc<R> {
    fn is_builtin(&self, name: &str) -> bool {
        (**self).is_builtin(name)
    }

    fn is_stdlib(&self, name: &str) -> bool {
        (**self).is_stdlib(name)
    }

    fn find_module(&self, name: &str) -> Result<Option<ModuleOrigin>, ResolveError> {
        (**self).find_module(name)
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("No Python interpreter found on PATH: {0}")]
    InterpreterNotFound(String),
    #[error("Failed to run interpreter '{interpreter}': {source}")]
    Launch {
        interpreter: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Interpreter probe timed out after {0}s")]
    Timeout(u64),
    #[error("Interpreter probe exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Interpreter probe produced invalid output: {0}")]
    InvalidOutput(#[from] serde_json::Error),
}

#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Interpreter the probe talks to (e.g., "/usr/bin/python3").
    fn interpreter(&self) -> &str;

    /// Captures the interpreter's module layout.
    async fn probe(&self) -> Result<PythonEnvironment, ProbeError>;

    /// Asks the interpreter where each top-level name would load from,
    /// without importing it. `None` means the interpreter cannot find the
    /// name; names it could not answer for are absent from the map.
    async fn locate(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Option<ModuleOrigin>>, ProbeError>;
}
