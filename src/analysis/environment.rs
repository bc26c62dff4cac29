//! Interpreter environment discovery and filesystem module resolution.
//!
//! The interpreter is asked once for its layout ([`PythonEnvironment`]) and,
//! per analysis, where each imported name would load from (`find_spec`, which
//! sees zip entries and meta-path finders such as editable installs).
//! [`LocatedResolver`] serves those answers first; [`EnvironmentResolver`]
//! answers everything else from the filesystem. Nothing is imported.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::traits::{
    EnvironmentProbe, ModuleOrigin, ModuleResolver, ProbeError, ResolveError, PACKAGE_MANAGER_DIRS,
};

const PROBE_SCRIPT: &str = r#"
import importlib.machinery, json, os, sys, sysconfig
paths = sysconfig.get_paths()
stdlib = []
for p in (os.path.dirname(os.__file__), paths.get("stdlib"), paths.get("platstdlib")):
    if p and p not in stdlib:
        stdlib.append(p)
json.dump({
    "executable": sys.executable,
    "version": "%d.%d.%d" % tuple(sys.version_info[:3]),
    "builtin_modules": sorted(sys.builtin_module_names),
    "stdlib_dirs": stdlib,
    "search_path": [p for p in sys.path if p],
    "source_suffixes": list(importlib.machinery.SOURCE_SUFFIXES),
    "extension_suffixes": list(importlib.machinery.EXTENSION_SUFFIXES),
}, sys.stdout)
"#;

const LOCATE_SCRIPT: &str = r#"
import importlib.util, json, sys
sys.path[:] = [p for p in sys.path if p]
found = {}
for name in sys.argv[1:]:
    try:
        spec = importlib.util.find_spec(name)
    except Exception as exc:
        found[name] = {"error": "%s: %s" % (type(exc).__name__, exc)}
        continue
    if spec is None:
        found[name] = {"found": False}
    else:
        found[name] = {"found": True, "origin": spec.origin if spec.has_location else None}
json.dump(found, sys.stdout)
"#;

/// Snapshot of an interpreter's module layout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PythonEnvironment {
    pub executable: PathBuf,
    pub version: String,
    pub builtin_modules: Vec<String>,
    pub stdlib_dirs: Vec<PathBuf>,
    pub search_path: Vec<PathBuf>,
    pub source_suffixes: Vec<String>,
    pub extension_suffixes: Vec<String>,
}

// ============================================================================
// Probe
// ============================================================================

/// Runs a short script in a Python interpreter to capture its layout.
#[derive(Debug, Clone)]
pub struct InterpreterProbe {
    interpreter: String,
    timeout: Duration,
    extra_paths: Vec<PathBuf>,
}

impl InterpreterProbe {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout: Duration::from_secs(30),
            extra_paths: Vec::new(),
        }
    }

    /// Uses `python3`, then `python`, from `PATH`.
    pub fn discover() -> Result<Self, ProbeError> {
        let path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|e| ProbeError::InterpreterNotFound(e.to_string()))?;
        Ok(Self::new(path.to_string_lossy().into_owned()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Entries put in front of the interpreter's search path (`PYTHONPATH`).
    pub fn with_extra_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.extra_paths.extend(paths.into_iter().map(Into::into));
        self
    }

    async fn run_script(&self, script: &str, args: &[String]) -> Result<Vec<u8>, ProbeError> {
        let mut command = Command::new(&self.interpreter);
        command
            .arg("-c")
            .arg(script)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if !self.extra_paths.is_empty() {
            let mut paths = self.extra_paths.clone();
            if let Some(existing) = std::env::var_os("PYTHONPATH") {
                paths.extend(std::env::split_paths(&existing));
            }
            match std::env::join_paths(paths) {
                Ok(joined) => {
                    command.env("PYTHONPATH", joined);
                }
                Err(e) => warn!(error = %e, "Ignoring extra search paths"),
            }
        }

        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout.as_secs()))?
            .map_err(|source| ProbeError::Launch {
                interpreter: self.interpreter.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl EnvironmentProbe for InterpreterProbe {
    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    async fn probe(&self) -> Result<PythonEnvironment, ProbeError> {
        debug!(interpreter = %self.interpreter, "Probing interpreter environment");

        let stdout = self.run_script(PROBE_SCRIPT, &[]).await?;
        let env: PythonEnvironment = serde_json::from_slice(&stdout)?;
        info!(
            interpreter = %self.interpreter,
            version = %env.version,
            search_entries = env.search_path.len(),
            "Interpreter environment captured"
        );
        Ok(env)
    }

    async fn locate(
        &self,
        names: &[String],
    ) -> Result<HashMap<String, Option<ModuleOrigin>>, ProbeError> {
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        let stdout = self.run_script(LOCATE_SCRIPT, names).await?;
        let located = parse_locations(&stdout)?;
        debug!(
            requested = names.len(),
            answered = located.len(),
            "Module locations resolved by interpreter"
        );
        Ok(located)
    }
}

#[derive(Debug, Deserialize)]
struct SpecAnswer {
    #[serde(default)]
    found: bool,
    origin: Option<PathBuf>,
    error: Option<String>,
}

/// Turns the locate script's JSON into resolver answers. Names the
/// interpreter failed on are left out so they fall back to the filesystem.
fn parse_locations(raw: &[u8]) -> Result<HashMap<String, Option<ModuleOrigin>>, serde_json::Error> {
    let answers: HashMap<String, SpecAnswer> = serde_json::from_slice(raw)?;

    Ok(answers
        .into_iter()
        .filter_map(|(name, answer)| {
            if let Some(error) = answer.error {
                debug!(module = %name, %error, "Interpreter could not locate module");
                return None;
            }
            let origin = answer.found.then(|| match answer.origin {
                Some(file) => ModuleOrigin::file(file),
                None => ModuleOrigin::namespace(),
            });
            Some((name, origin))
        })
        .collect())
}

// ============================================================================
// Resolver
// ============================================================================

/// Answers module lookups from a [`PythonEnvironment`] snapshot.
///
/// Lookup mirrors the interpreter's path finder: for each search-path entry a
/// regular package (`name/__init__.*`) wins, then a module file
/// (`name<suffix>`); a bare directory is a namespace portion and only counts
/// when no entry yields a file.
#[derive(Debug, Clone)]
pub struct EnvironmentResolver {
    builtins: HashSet<String>,
    stdlib: HashSet<String>,
    search_path: Vec<PathBuf>,
    suffixes: Vec<String>,
}

impl EnvironmentResolver {
    pub fn new(env: &PythonEnvironment) -> Self {
        let mut suffixes = env.source_suffixes.clone();
        if suffixes.is_empty() {
            suffixes.push(".py".to_string());
        }
        suffixes.extend(env.extension_suffixes.iter().cloned());

        Self {
            builtins: env.builtin_modules.iter().cloned().collect(),
            stdlib: stdlib_modules(&env.stdlib_dirs),
            search_path: env.search_path.clone(),
            suffixes,
        }
    }

    fn package_init(&self, dir: &Path, name: &str) -> Result<Option<PathBuf>, ResolveError> {
        for suffix in &self.suffixes {
            let candidate = dir.join(format!("__init__{}", suffix));
            if is_file(&candidate, name)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }
}

impl ModuleResolver for EnvironmentResolver {
    fn is_builtin(&self, name: &str) -> bool {
        self.builtins.contains(name)
    }

    fn is_stdlib(&self, name: &str) -> bool {
        self.stdlib.contains(name)
    }

    fn find_module(&self, name: &str) -> Result<Option<ModuleOrigin>, ResolveError> {
        let mut namespace = false;

        for entry in &self.search_path {
            let package_dir = entry.join(name);
            if is_dir(&package_dir, name)? {
                if let Some(init) = self.package_init(&package_dir, name)? {
                    return Ok(Some(ModuleOrigin::file(init)));
                }
                namespace = true;
            }

            for suffix in &self.suffixes {
                let candidate = entry.join(format!("{}{}", name, suffix));
                if is_file(&candidate, name)? {
                    return Ok(Some(ModuleOrigin::file(candidate)));
                }
            }
        }

        Ok(namespace.then(ModuleOrigin::namespace))
    }
}

/// Interpreter-located answers in front of another resolver.
///
/// `find_module` answers from `located` when the interpreter gave an answer
/// for the name and falls through to `inner` otherwise.
#[derive(Debug, Clone)]
pub struct LocatedResolver<R> {
    inner: R,
    located: HashMap<String, Option<ModuleOrigin>>,
}

impl<R> LocatedResolver<R> {
    pub fn new(inner: R, located: HashMap<String, Option<ModuleOrigin>>) -> Self {
        Self { inner, located }
    }
}

impl<R: ModuleResolver> ModuleResolver for LocatedResolver<R> {
    fn is_builtin(&self, name: &str) -> bool {
        self.inner.is_builtin(name)
    }

    fn is_stdlib(&self, name: &str) -> bool {
        self.inner.is_stdlib(name)
    }

    fn find_module(&self, name: &str) -> Result<Option<ModuleOrigin>, ResolveError> {
        match self.located.get(name) {
            Some(answer) => Ok(answer.clone()),
            None => self.inner.find_module(name),
        }
    }
}

/// Top-level names found in the stdlib directories and their `lib-dynload`.
fn stdlib_modules(dirs: &[PathBuf]) -> HashSet<String> {
    let mut modules = HashSet::new();

    for dir in dirs {
        collect_stdlib_entries(dir, true, &mut modules);
        collect_stdlib_entries(&dir.join("lib-dynload"), false, &mut modules);
    }

    debug!(count = modules.len(), "Standard library modules indexed");
    modules
}

fn collect_stdlib_entries(dir: &Path, include_dirs: bool, modules: &mut HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot list standard library directory");
            return;
        }
    };

    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        let counts = if is_dir {
            include_dirs
        } else {
            file_name.ends_with(".py") || file_name.ends_with(".so") || file_name.ends_with(".pyd")
        };
        if !counts {
            continue;
        }

        let module = file_name.split('.').next().unwrap_or_default();
        if module.is_empty() || module == "__pycache__" || PACKAGE_MANAGER_DIRS.contains(&module) {
            continue;
        }
        modules.insert(module.to_string());
    }
}

fn metadata(path: &Path, module: &str) -> Result<Option<std::fs::Metadata>, ResolveError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
            Ok(None)
        }
        Err(source) => Err(ResolveError::Indeterminate {
            module: module.to_string(),
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn is_dir(path: &Path, module: &str) -> Result<bool, ResolveError> {
    Ok(metadata(path, module)?.is_some_and(|m| m.is_dir()))
}

fn is_file(path: &Path, module: &str) -> Result<bool, ResolveError> {
    Ok(metadata(path, module)?.is_some_and(|m| m.is_file()))
}
