//! Backend command synthesis.
//!
//! One function per backend maps a [`PackagingConfig`] onto that backend's
//! flag vocabulary. Building never spawns anything and never writes to disk;
//! it only inspects paths (icon, data sources) and asks the resolver where
//! hidden imports live.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::{Backend, BundleMode, Command, DataMapping, PackagingConfig, WindowMode};
use crate::traits::ModuleResolver;

/// GUI toolkit whose submodules are collapsed to the top-level package.
pub const GUI_TOOLKIT: &str = "PyQt5";

/// Networking helpers Nuitka does not discover on its own.
pub const NUITKA_REQUIRED_MODULES: &[&str] = &["chardet", "certifi", "idna", "urllib3"];

/// Something left out of the command while it was being built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBuildWarning {
    /// Configured icon does not exist; no icon flag emitted
    MissingIcon(PathBuf),

    /// Data entry without a `;` separator (or with an empty side)
    MalformedDataMapping(String),

    /// Data source is neither a file nor a directory
    MissingDataSource(PathBuf),
}

impl fmt::Display for CommandBuildWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingIcon(path) => write!(f, "Icon not found, skipping: {}", path.display()),
            Self::MalformedDataMapping(raw) => {
                write!(f, "Invalid data mapping (expected 'src;dst'): {}", raw)
            }
            Self::MissingDataSource(path) => {
                write!(f, "Data source is not a file or directory: {}", path.display())
            }
        }
    }
}

/// A command plus whatever was dropped while building it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub command: Command,
    pub warnings: Vec<CommandBuildWarning>,
}

/// Maps a [`PackagingConfig`] into a backend invocation.
#[derive(Clone, Copy)]
pub struct CommandBuilder<'r> {
    resolver: Option<&'r dyn ModuleResolver>,
    interpreter: &'r str,
}

impl Default for CommandBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'r> CommandBuilder<'r> {
    pub fn new() -> Self {
        Self {
            resolver: None,
            interpreter: "python",
        }
    }

    /// Lets Nuitka hidden imports that live in a package-manager directory be
    /// included with their package data.
    pub fn with_resolver(mut self, resolver: &'r dyn ModuleResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Interpreter used for `-m nuitka` (default `python`).
    pub fn with_interpreter(mut self, interpreter: &'r str) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn build(&self, config: &PackagingConfig, working_dir: &Path) -> BuiltCommand {
        let mut warnings = Vec::new();

        let (program, mut args) = match config.backend {
            Backend::PyInstaller => ("pyinstaller".to_string(), pyinstaller_args(config, &mut warnings)),
            Backend::Nuitka => {
                let mut args = vec!["-m".to_string(), "nuitka".to_string()];
                args.extend(self.nuitka_args(config, &mut warnings));
                (self.interpreter.to_string(), args)
            }
        };

        args.push(config.main_file.to_string_lossy().into_owned());

        for warning in &warnings {
            match warning {
                CommandBuildWarning::MissingIcon(_) => debug!(backend = %config.backend, "{}", warning),
                _ => warn!(backend = %config.backend, "{}", warning),
            }
        }

        BuiltCommand {
            command: Command {
                program,
                args,
                working_dir: working_dir.to_path_buf(),
            },
            warnings,
        }
    }

    fn nuitka_args(
        &self,
        config: &PackagingConfig,
        warnings: &mut Vec<CommandBuildWarning>,
    ) -> Vec<String> {
        let mut args = Vec::new();

        args.push(match config.bundle {
            BundleMode::OneFile => "--onefile".to_string(),
            BundleMode::OneDir => "--standalone".to_string(),
        });
        if config.window == WindowMode::Windowed {
            args.push("--disable-console".to_string());
        }
        if let Some(dir) = &config.output_dir {
            args.push(format!("--output-dir={}", dir.display()));
        }
        if let Some(name) = &config.output_name {
            args.push(format!("--output-filename={}", name));
        }
        if let Some(icon) = existing_icon(config, warnings) {
            args.push(format!("--windows-icon-from-ico={}", icon.display()));
        }

        args.push("--enable-plugin=pyqt5".to_string());
        args.push("--follow-imports".to_string());

        let hidden = hidden_imports(&config.hidden_imports);
        for module in &hidden {
            if self.is_package_managed(module) {
                args.push(format!("--include-package-data={}", module));
            } else {
                args.push(format!("--include-module={}", module));
            }
        }
        for module in NUITKA_REQUIRED_MODULES {
            if !hidden.iter().any(|h| h == module) {
                args.push(format!("--include-module={}", module));
            }
        }

        for (mapping, kind) in data_mappings(&config.data_files, warnings) {
            let flag = match kind {
                SourceKind::File => "--include-data-file",
                SourceKind::Dir => "--include-data-dir",
            };
            args.push(format!(
                "{}={}={}",
                flag,
                mapping.source.display(),
                mapping.destination
            ));
        }

        if config.clean {
            args.push("--remove-output".to_string());
        }
        if config.upx_compress {
            args.push("--lto=yes".to_string());
        }

        args
    }

    fn is_package_managed(&self, module: &str) -> bool {
        let Some(resolver) = self.resolver else {
            return false;
        };
        let top = module.split('.').next().unwrap_or(module);
        match resolver.find_module(top) {
            Ok(Some(origin)) => origin.is_package_managed(),
            Ok(None) => false,
            Err(e) => {
                debug!(module, error = %e, "Could not locate hidden import");
                false
            }
        }
    }
}

fn pyinstaller_args(config: &PackagingConfig, warnings: &mut Vec<CommandBuildWarning>) -> Vec<String> {
    let mut args = Vec::new();

    if config.bundle == BundleMode::OneFile {
        args.push("--onefile".to_string());
    }
    match config.window {
        WindowMode::Windowed => args.push("--windowed".to_string()),
        WindowMode::Console => args.push("--console".to_string()),
    }
    if let Some(name) = &config.output_name {
        args.push("--name".to_string());
        args.push(name.clone());
    }
    if let Some(dir) = &config.output_dir {
        args.push("--distpath".to_string());
        args.push(dir.to_string_lossy().into_owned());
    }
    if let Some(icon) = existing_icon(config, warnings) {
        args.push("--icon".to_string());
        args.push(icon.to_string_lossy().into_owned());
    }

    for module in hidden_imports(&config.hidden_imports) {
        args.push("--hidden-import".to_string());
        args.push(module);
    }

    for (mapping, _) in data_mappings(&config.data_files, warnings) {
        args.push("--add-data".to_string());
        args.push(format!("{};{}", mapping.source.display(), mapping.destination));
    }

    for module in config.excludes.iter().map(|m| m.trim()).filter(|m| !m.is_empty()) {
        args.push("--exclude-module".to_string());
        args.push(module.to_string());
    }

    if config.clean {
        args.push("--clean".to_string());
    }
    if config.upx_compress {
        args.push("--upx-dir=".to_string());
    }
    if config.no_confirm {
        args.push("--noconfirm".to_string());
    }

    args
}

/// Trimmed, de-duplicated hidden imports with toolkit submodules collapsed.
fn hidden_imports(raw: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    raw.iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .map(|m| match m.strip_prefix(GUI_TOOLKIT) {
            Some(rest) if rest.starts_with('.') => GUI_TOOLKIT,
            _ => m,
        })
        .filter(|m| seen.insert(*m))
        .map(str::to_string)
        .collect()
}

fn existing_icon<'a>(
    config: &'a PackagingConfig,
    warnings: &mut Vec<CommandBuildWarning>,
) -> Option<&'a Path> {
    let icon = config.icon.as_deref()?;
    if icon.exists() {
        Some(icon)
    } else {
        warnings.push(CommandBuildWarning::MissingIcon(icon.to_path_buf()));
        None
    }
}

/// Well-formed mappings whose source exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceKind {
    File,
    Dir,
}

fn source_kind(path: &Path) -> Option<SourceKind> {
    if path.is_file() {
        Some(SourceKind::File)
    } else if path.is_dir() {
        Some(SourceKind::Dir)
    } else {
        None
    }
}

/// Valid mappings whose source is a regular file or a directory.
fn data_mappings(
    raw: &[String],
    warnings: &mut Vec<CommandBuildWarning>,
) -> Vec<(DataMapping, SourceKind)> {
    raw.iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| match DataMapping::parse(entry) {
            Some(mapping) => match source_kind(&mapping.source) {
                Some(kind) => Some((mapping, kind)),
                None => {
                    warnings.push(CommandBuildWarning::MissingDataSource(mapping.source));
                    None
                }
            },
            None => {
                warnings.push(CommandBuildWarning::MalformedDataMapping(entry.to_string()));
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::testing::FakeResolver;
    use std::fs;
    use tempfile::TempDir;

    fn config(backend: Backend) -> PackagingConfig {
        PackagingConfig {
            backend,
            main_file: PathBuf::from("/p/app.py"),
            ..Default::default()
        }
    }

    fn build(config: &PackagingConfig) -> BuiltCommand {
        CommandBuilder::new().build(config, Path::new("/p"))
    }

    fn count(args: &[String], needle: &str) -> usize {
        args.iter().filter(|a| *a == needle).count()
    }

    #[test]
    fn test_pyinstaller_onefile_console() {
        let config = PackagingConfig {
            bundle: BundleMode::OneFile,
            ..config(Backend::PyInstaller)
        };
        let built = build(&config);
        let args = &built.command.args;

        assert_eq!(built.command.program, "pyinstaller");
        assert!(args.contains(&"--onefile".to_string()));
        assert!(args.contains(&"--console".to_string()));
        assert!(!args.contains(&"--windowed".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/p/app.py"));
        assert_eq!(built.command.working_dir, PathBuf::from("/p"));
    }

    #[test]
    fn test_pyinstaller_windowed_has_no_console_flag() {
        let config = PackagingConfig {
            bundle: BundleMode::OneFile,
            window: WindowMode::Windowed,
            ..config(Backend::PyInstaller)
        };
        let args = build(&config).command.args;
        assert!(args.contains(&"--windowed".to_string()));
        assert!(!args.contains(&"--console".to_string()));
    }

    #[test]
    fn test_pyinstaller_full_flag_order() {
        let config = PackagingConfig {
            output_name: Some("Tool".to_string()),
            output_dir: Some(PathBuf::from("/out")),
            hidden_imports: vec!["yaml".to_string()],
            excludes: vec!["tkinter".to_string(), "  ".to_string()],
            upx_compress: true,
            ..config(Backend::PyInstaller)
        };
        let args = build(&config).command.args;

        assert_eq!(
            args,
            vec![
                "--console",
                "--name",
                "Tool",
                "--distpath",
                "/out",
                "--hidden-import",
                "yaml",
                "--exclude-module",
                "tkinter",
                "--clean",
                "--upx-dir=",
                "--noconfirm",
                "/p/app.py",
            ]
        );
    }

    #[test]
    fn test_toolkit_submodules_collapse_to_top_level_once() {
        let config = PackagingConfig {
            hidden_imports: vec![
                "PyQt5.QtWebEngineWidgets".to_string(),
                "PyQt5.QtCore".to_string(),
                "PyQt5".to_string(),
                "PyQt5Extras".to_string(),
                " requests ".to_string(),
                "requests".to_string(),
            ],
            ..config(Backend::PyInstaller)
        };
        let args = build(&config).command.args;

        assert_eq!(count(&args, "PyQt5"), 1);
        assert_eq!(count(&args, "PyQt5Extras"), 1);
        assert_eq!(count(&args, "requests"), 1);
        assert!(!args.iter().any(|a| a.starts_with("PyQt5.")));

        let nuitka = build(&PackagingConfig {
            backend: Backend::Nuitka,
            ..config
        })
        .command
        .args;
        assert_eq!(count(&nuitka, "--include-module=PyQt5"), 1);
        assert!(!nuitka.iter().any(|a| a.contains("PyQt5.")));
    }

    #[test]
    fn test_nuitka_standalone_defaults() {
        let args = build(&config(Backend::Nuitka)).command.args;

        assert_eq!(&args[..3], &["-m", "nuitka", "--standalone"]);
        assert!(args.contains(&"--enable-plugin=pyqt5".to_string()));
        assert!(args.contains(&"--follow-imports".to_string()));
        assert!(args.contains(&"--remove-output".to_string()));
        assert!(!args.contains(&"--disable-console".to_string()));
        assert!(!args.contains(&"--noconfirm".to_string()));
        for module in NUITKA_REQUIRED_MODULES {
            assert!(args.contains(&format!("--include-module={}", module)));
        }
        assert_eq!(args.last().map(String::as_str), Some("/p/app.py"));
    }

    #[test]
    fn test_nuitka_flags_and_required_modules_not_duplicated() {
        let config = PackagingConfig {
            bundle: BundleMode::OneFile,
            window: WindowMode::Windowed,
            output_name: Some("tool".to_string()),
            output_dir: Some(PathBuf::from("/out")),
            hidden_imports: vec!["certifi".to_string()],
            excludes: vec!["tkinter".to_string()],
            upx_compress: true,
            ..config(Backend::Nuitka)
        };
        let built = CommandBuilder::new()
            .with_interpreter("/usr/bin/python3")
            .build(&config, Path::new("/p"));
        let args = &built.command.args;

        assert_eq!(built.command.program, "/usr/bin/python3");
        assert!(args.contains(&"--onefile".to_string()));
        assert!(args.contains(&"--disable-console".to_string()));
        assert!(args.contains(&"--output-dir=/out".to_string()));
        assert!(args.contains(&"--output-filename=tool".to_string()));
        assert!(args.contains(&"--lto=yes".to_string()));
        assert_eq!(count(args, "--include-module=certifi"), 1);
        assert!(!args.iter().any(|a| a.contains("tkinter")));
    }

    #[test]
    fn test_nuitka_package_data_for_installed_modules() {
        let resolver = FakeResolver::default().installed("numpy").local("helpers");
        let config = PackagingConfig {
            hidden_imports: vec![
                "numpy.random".to_string(),
                "helpers".to_string(),
                "ghost".to_string(),
            ],
            ..config(Backend::Nuitka)
        };
        let args = CommandBuilder::new()
            .with_resolver(&resolver)
            .build(&config, Path::new("/p"))
            .command
            .args;

        assert!(args.contains(&"--include-package-data=numpy.random".to_string()));
        assert!(args.contains(&"--include-module=helpers".to_string()));
        assert!(args.contains(&"--include-module=ghost".to_string()));
    }

    #[test]
    fn test_data_mappings_per_backend() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("logo.png");
        let folder = dir.path().join("assets");
        fs::write(&file, b"png").unwrap();
        fs::create_dir(&folder).unwrap();

        let data_files = vec![
            format!("{};img", file.display()),
            format!("{} ; assets", folder.display()),
            "/missing/path;dest".to_string(),
            "no-separator".to_string(),
        ];

        let pyi = build(&PackagingConfig {
            data_files: data_files.clone(),
            ..config(Backend::PyInstaller)
        });
        assert_eq!(count(&pyi.command.args, "--add-data"), 2);
        assert!(pyi.command.args.contains(&format!("{};img", file.display())));
        assert!(pyi.command.args.contains(&format!("{};assets", folder.display())));
        assert!(!pyi.command.args.iter().any(|a| a.contains("/missing/path")));
        assert_eq!(
            pyi.warnings,
            vec![
                CommandBuildWarning::MissingDataSource(PathBuf::from("/missing/path")),
                CommandBuildWarning::MalformedDataMapping("no-separator".to_string()),
            ]
        );

        let nuitka = build(&PackagingConfig {
            data_files,
            ..config(Backend::Nuitka)
        });
        assert!(nuitka
            .command
            .args
            .contains(&format!("--include-data-file={}=img", file.display())));
        assert!(nuitka
            .command
            .args
            .contains(&format!("--include-data-dir={}=assets", folder.display())));
        assert!(!nuitka.command.args.iter().any(|a| a.contains("/missing/path")));
        assert_eq!(nuitka.warnings.len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_special_file_data_source_is_skipped() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();

        for backend in [Backend::PyInstaller, Backend::Nuitka] {
            let built = build(&PackagingConfig {
                data_files: vec![format!("{};run", socket.display())],
                ..config(backend)
            });
            assert!(!built.command.args.iter().any(|a| a.contains("agent.sock")));
            assert_eq!(
                built.warnings,
                vec![CommandBuildWarning::MissingDataSource(socket.clone())]
            );
        }
    }

    #[test]
    fn test_icon_only_when_present() {
        let dir = TempDir::new().unwrap();
        let icon = dir.path().join("app.ico");
        fs::write(&icon, b"ico").unwrap();

        let with_icon = build(&PackagingConfig {
            icon: Some(icon.clone()),
            ..config(Backend::PyInstaller)
        });
        assert!(with_icon
            .command
            .args
            .windows(2)
            .any(|w| w[0] == "--icon" && w[1] == icon.to_string_lossy()));

        let missing = build(&PackagingConfig {
            icon: Some(PathBuf::from("/nope/app.ico")),
            ..config(Backend::Nuitka)
        });
        assert!(!missing.command.args.iter().any(|a| a.contains("icon")));
        assert_eq!(
            missing.warnings,
            vec![CommandBuildWarning::MissingIcon(PathBuf::from("/nope/app.ico"))]
        );
    }

    #[test]
    fn test_build_is_pure() {
        let config = PackagingConfig {
            hidden_imports: vec!["PyQt5.QtCore".to_string(), "yaml".to_string()],
            data_files: vec!["/missing;x".to_string()],
            ..config(Backend::Nuitka)
        };
        assert_eq!(build(&config), build(&config));
    }
}
