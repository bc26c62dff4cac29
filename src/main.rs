use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use py_packager::analysis::InterpreterProbe;
use py_packager::packaging::SupervisorEvent;
use py_packager::settings::{SettingsStore, DEFAULT_SETTINGS_FILE};
use py_packager::{Backend, BundleMode, PackagingConfig, PackagingExecutor, WindowMode};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(name = "py-packager")]
#[command(about = "Dependency-aware front end for PyInstaller and Nuitka", long_about = None)]
#[command(version)]
struct Cli {
    /// Settings file holding the saved packaging configuration
    #[arg(long, global = true, env = "PY_PACKAGER_SETTINGS", default_value = DEFAULT_SETTINGS_FILE)]
    settings: PathBuf,

    /// Python interpreter to inspect (defaults to python3/python on PATH)
    #[arg(long, global = true)]
    python: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report the third-party and missing modules of a project
    Analyze {
        /// Entry script of the project
        main: PathBuf,
    },

    /// Print the backend command without running it
    Command(PackageArgs),

    /// Run the packaging backend
    Package(PackageArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Pyinstaller,
    Nuitka,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Pyinstaller => Backend::PyInstaller,
            BackendArg::Nuitka => Backend::Nuitka,
        }
    }
}

/// Overrides applied on top of the saved settings.
#[derive(Args, Debug)]
struct PackageArgs {
    /// Entry script (overrides `main_file`)
    main: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Produce a single executable
    #[arg(long, conflicts_with = "onedir")]
    onefile: bool,

    /// Produce a directory bundle
    #[arg(long)]
    onedir: bool,

    /// Hide the console window
    #[arg(long, conflicts_with = "console")]
    windowed: bool,

    #[arg(long)]
    console: bool,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Name of the produced executable
    #[arg(short, long)]
    name: Option<String>,

    #[arg(long)]
    icon: Option<PathBuf>,

    /// Extra hidden import (repeatable)
    #[arg(long = "hidden-import")]
    hidden_imports: Vec<String>,

    /// Data mapping `SOURCE;DEST` (repeatable)
    #[arg(long = "add-data")]
    data_files: Vec<String>,

    /// Module to exclude (repeatable)
    #[arg(long = "exclude")]
    excludes: Vec<String>,

    /// Keep previous build artifacts
    #[arg(long)]
    no_clean: bool,

    /// Skip dependency analysis
    #[arg(long)]
    no_analyze: bool,

    /// Do not add missing modules as hidden imports
    #[arg(long)]
    no_add_missing: bool,

    /// Enable size optimisation (UPX / LTO)
    #[arg(long)]
    upx: bool,

    /// Write the effective configuration back to the settings file
    #[arg(long)]
    save: bool,
}

impl PackageArgs {
    fn apply(&self, config: &mut PackagingConfig) {
        if let Some(main) = &self.main {
            config.main_file = main.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend.into();
        }
        if self.onefile {
            config.bundle = BundleMode::OneFile;
        } else if self.onedir {
            config.bundle = BundleMode::OneDir;
        }
        if self.windowed {
            config.window = WindowMode::Windowed;
        } else if self.console {
            config.window = WindowMode::Console;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
        }
        if let Some(name) = &self.name {
            config.output_name = Some(name.clone());
        }
        if let Some(icon) = &self.icon {
            config.icon = Some(icon.clone());
        }
        for module in &self.hidden_imports {
            if !config.hidden_imports.contains(module) {
                config.hidden_imports.push(module.clone());
            }
        }
        config.data_files.extend(self.data_files.iter().cloned());
        config.excludes.extend(self.excludes.iter().cloned());
        if self.no_clean {
            config.clean = false;
        }
        if self.no_analyze {
            config.auto_analyze = false;
        }
        if self.no_add_missing {
            config.auto_add_missing = false;
        }
        if self.upx {
            config.upx_compress = true;
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}

fn probe(python: Option<&str>) -> InterpreterProbe {
    match python {
        Some(path) => InterpreterProbe::new(path),
        None => InterpreterProbe::discover().unwrap_or_else(|e| {
            warn!(error = %e, "No Python interpreter on PATH");
            InterpreterProbe::new("python")
        }),
    }
}

fn load_config(store: &SettingsStore) -> PackagingConfig {
    store.load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable settings, using defaults");
        PackagingConfig::default()
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<ExitCode> {
    let store = SettingsStore::new(&cli.settings);
    let executor = PackagingExecutor::new(probe(cli.python.as_deref()));

    match cli.command {
        Commands::Analyze { main } => {
            let report = executor.analyze(&main).await?;

            println!("Third-party modules ({}):", report.third_party.len());
            for module in &report.third_party {
                println!("  {}", module);
            }
            println!("Missing modules ({}):", report.missing.len());
            for module in &report.missing {
                println!("  {}    (pip install {})", module, module);
            }
            println!("Recommended hidden imports ({}):", report.hidden_imports.len());
            for module in &report.hidden_imports {
                println!("  {}", module);
            }
            println!(
                "Files analyzed: {} ({} skipped)",
                report.files_analyzed.len(),
                report.skipped_files.len()
            );
            Ok(ExitCode::SUCCESS)
        }

        Commands::Command(args) => {
            let mut config = load_config(&store);
            args.apply(&mut config);

            let prepared = executor.prepare(config.clone()).await?;
            if args.save {
                store.save(&config)?;
            }

            for warning in &prepared.warnings {
                eprintln!("warning: {}", warning);
            }
            println!("{}", prepared.command);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Package(args) => {
            let mut config = load_config(&store);
            args.apply(&mut config);
            if args.save {
                store.save(&config)?;
            }

            let mut execution = executor.execute(config).await?;
            for module in execution
                .prepared
                .merged
                .added_hidden
                .iter()
                .chain(&execution.prepared.merged.added_missing)
            {
                println!("Added hidden import: {}", module);
            }

            let stopper = execution.handle.stopper();
            let mut stopping = false;
            loop {
                tokio::select! {
                    event = execution.handle.next_event() => match event {
                        Some(SupervisorEvent::Progress(line)) => println!("{}", line),
                        Some(SupervisorEvent::ErrorExcerpt(text)) => {
                            eprintln!("Error summary:\n{}", text);
                        }
                        Some(SupervisorEvent::Finished(result)) => {
                            println!("{}", result.summary);
                            return Ok(if result.success {
                                ExitCode::SUCCESS
                            } else {
                                ExitCode::FAILURE
                            });
                        }
                        None => return Ok(ExitCode::FAILURE),
                    },
                    _ = tokio::signal::ctrl_c(), if !stopping => {
                        stopping = true;
                        warn!("Interrupted, stopping packaging process");
                        let stopper = stopper.clone();
                        tokio::spawn(async move { stopper.stop().await });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_on_top_of_settings() {
        let cli = Cli::parse_from([
            "py-packager",
            "package",
            "app.py",
            "--backend",
            "nuitka",
            "--onefile",
            "--windowed",
            "--hidden-import",
            "yaml",
            "--hidden-import",
            "yaml",
            "--no-analyze",
        ]);
        let Commands::Package(args) = cli.command else {
            panic!("expected package subcommand");
        };

        let mut config = PackagingConfig::default();
        args.apply(&mut config);

        assert_eq!(config.main_file, PathBuf::from("app.py"));
        assert_eq!(config.backend, Backend::Nuitka);
        assert_eq!(config.bundle, BundleMode::OneFile);
        assert_eq!(config.window, WindowMode::Windowed);
        assert_eq!(config.hidden_imports, vec!["yaml".to_string()]);
        assert!(!config.auto_analyze);
        assert!(config.clean);
    }

    #[test]
    fn test_unset_flags_keep_saved_values() {
        let cli = Cli::parse_from(["py-packager", "command"]);
        let Commands::Command(args) = cli.command else {
            panic!("expected command subcommand");
        };

        let mut config = PackagingConfig {
            bundle: BundleMode::OneFile,
            window: WindowMode::Windowed,
            upx_compress: true,
            ..PackagingConfig::default()
        };
        let before = config.clone();
        args.apply(&mut config);

        assert_eq!(config, before);
    }

    #[test]
    fn test_conflicting_bundle_flags_rejected() {
        let parsed = Cli::try_parse_from(["py-packager", "command", "--onefile", "--onedir"]);
        assert!(parsed.is_err());
    }
}
