use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::analysis::classifier::ModuleClassifier;
use crate::analysis::hidden::HiddenImportTable;
use crate::analysis::imports::ImportExtractor;
use crate::model::{DependencyReport, ImportReference, ModuleClassification};
use crate::traits::ModuleResolver;

/// Imports collected from a project tree, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectScan {
    /// Top-level name → files importing it; project-local names excluded
    pub imports: BTreeMap<String, Vec<PathBuf>>,
    pub files_analyzed: Vec<PathBuf>,
    pub skipped_files: Vec<PathBuf>,
}

impl ProjectScan {
    /// Parses every `.py` file under the main file's directory.
    #[instrument(skip(extractor, main_file), fields(main_file = %main_file.display()))]
    pub fn collect(extractor: &ImportExtractor, main_file: &Path) -> Self {
        let project_dir = match main_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut scan = Self::default();

        for path in source_files(&project_dir) {
            match extractor.extract_file(&path) {
                Ok(refs) => {
                    for ImportReference { module, origin } in refs {
                        scan.imports.entry(module).or_default().push(origin);
                    }
                    scan.files_analyzed.push(path);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Skipping unparseable source file");
                    scan.skipped_files.push(path);
                }
            }
        }

        let local = project_local_modules(&project_dir);
        scan.imports.retain(|module, _| {
            let keep = !local.contains(module);
            if !keep {
                debug!(module = %module, "Project-local module");
            }
            keep
        });

        scan
    }

    /// Names left to classify, sorted.
    pub fn module_names(&self) -> Vec<String> {
        self.imports.keys().cloned().collect()
    }
}

/// Scans a project tree and classifies everything it imports.
///
/// Synchronous and read-only; the same file set and the same resolver
/// answers always produce the same report.
#[derive(Debug, Clone)]
pub struct DependencyAnalyzer<R> {
    classifier: ModuleClassifier<R>,
    extractor: ImportExtractor,
    table: HiddenImportTable,
}

impl<R: ModuleResolver> DependencyAnalyzer<R> {
    pub fn new(classifier: ModuleClassifier<R>) -> Self {
        Self {
            classifier,
            extractor: ImportExtractor::new(),
            table: HiddenImportTable::default(),
        }
    }

    pub fn with_table(mut self, table: HiddenImportTable) -> Self {
        self.table = table;
        self
    }

    pub fn classifier(&self) -> &ModuleClassifier<R> {
        &self.classifier
    }

    /// Analyzes every `.py` file under the main file's directory.
    pub fn analyze_project(&self, main_file: &Path) -> DependencyReport {
        self.report(ProjectScan::collect(&self.extractor, main_file))
    }

    /// Classifies the names of a finished scan.
    pub fn report(&self, scan: ProjectScan) -> DependencyReport {
        let mut report = DependencyReport {
            files_analyzed: scan.files_analyzed,
            skipped_files: scan.skipped_files,
            ..DependencyReport::default()
        };

        for (module, origins) in &scan.imports {
            match self.classifier.classify(module) {
                ModuleClassification::ThirdParty => {
                    report.third_party.insert(module.clone());
                }
                ModuleClassification::Missing => {
                    debug!(module = %module, importers = origins.len(), "Missing module");
                    report.missing.insert(module.clone());
                }
                ModuleClassification::Builtin
                | ModuleClassification::Stdlib
                | ModuleClassification::Available => {}
            }
        }

        report.hidden_imports = self
            .table
            .recommend(report.third_party.iter().map(String::as_str))
            .into_iter()
            .filter(|name| !self.is_runtime_provided(name))
            .collect();

        info!(
            files = report.files_analyzed.len(),
            skipped = report.skipped_files.len(),
            third_party = report.third_party.len(),
            missing = report.missing.len(),
            hidden_imports = report.hidden_imports.len(),
            "Dependency analysis completed"
        );

        report
    }

    fn is_runtime_provided(&self, module: &str) -> bool {
        let top = module.split('.').next().unwrap_or(module);
        self.classifier.classify(top).is_runtime_provided()
    }
}

/// All `.py` files under `root`, in a stable order.
fn source_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Cannot read project entry");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "py"))
        .map(|entry| entry.into_path())
        .collect()
}

/// Names the interpreter would find through the script directory.
fn project_local_modules(root: &Path) -> BTreeSet<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return BTreeSet::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let file_type = entry.file_type().ok()?;
            if file_type.is_dir() {
                path.file_name()?.to_str().map(str::to_string)
            } else if path.extension().is_some_and(|ext| ext == "py") {
                path.file_stem()?.to_str().map(str::to_string)
            } else {
                None
            }
        })
        .filter(|name| !name.starts_with('.') && name != "__pycache__")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::classifier::testing::FakeResolver;
    use crate::analysis::hidden::COMMON_DYNAMIC_IMPORTS;
    use indoc::indoc;
    use std::fs;
    use tempfile::TempDir;

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("app.py"),
            indoc! {"
                import os
                import json
                import requests
                from .config import settings
                from helpers import tidy
            "},
        )
        .unwrap();
        fs::write(dir.path().join("helpers.py"), "import sys\nimport yaml\n").unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg/__init__.py"), "from pkg import core\n").unwrap();
        fs::write(dir.path().join("pkg/broken.py"), "def oops(:\n").unwrap();
        fs::write(dir.path().join("README.md"), "import nothing\n").unwrap();
        dir
    }

    fn environment() -> FakeResolver {
        FakeResolver::default()
            .builtin("sys")
            .stdlib("os")
            .stdlib("json")
    }

    #[test]
    fn test_requests_installed() {
        let dir = project();
        let analyzer = DependencyAnalyzer::new(ModuleClassifier::new(
            environment().installed("requests").installed("yaml"),
        ));

        let report = analyzer.analyze_project(&dir.path().join("app.py"));

        assert_eq!(
            report.third_party,
            BTreeSet::from(["requests".to_string(), "yaml".to_string()])
        );
        assert!(report.missing.is_empty());
        for module in ["urllib3", "certifi", "chardet", "idna"]
            .iter()
            .chain(COMMON_DYNAMIC_IMPORTS)
        {
            assert!(report.hidden_imports.contains(*module), "{} missing", module);
        }
        assert_eq!(report.files_analyzed.len(), 3);
        assert_eq!(report.skipped_files, vec![dir.path().join("pkg/broken.py")]);
    }

    #[test]
    fn test_requests_not_installed() {
        let dir = project();
        let analyzer =
            DependencyAnalyzer::new(ModuleClassifier::new(environment().installed("yaml")));

        let report = analyzer.analyze_project(&dir.path().join("app.py"));

        assert_eq!(report.missing, BTreeSet::from(["requests".to_string()]));
        assert!(!report.third_party.contains("requests"));
        assert!(!report.hidden_imports.contains("urllib3"));
    }

    #[test]
    fn test_project_local_and_available_names_are_dropped() {
        let dir = project();
        let analyzer = DependencyAnalyzer::new(ModuleClassifier::new(
            environment().installed("requests").local("yaml"),
        ));

        let report = analyzer.analyze_project(&dir.path().join("app.py"));

        // `helpers` and `pkg` live in the project; `yaml` resolves off-site.
        assert!(!report.missing.contains("helpers"));
        assert!(!report.missing.contains("pkg"));
        assert!(!report.missing.contains("yaml"));
        assert!(!report.third_party.contains("yaml"));
    }

    #[test]
    fn test_runtime_provided_recommendations_are_filtered() {
        let dir = project();
        let table = HiddenImportTable::empty()
            .with_expansion("requests", ["urllib3", "json"])
            .with_common("xml.etree");
        let analyzer = DependencyAnalyzer::new(ModuleClassifier::new(
            environment().stdlib("xml").installed("requests"),
        ))
        .with_table(table);

        let report = analyzer.analyze_project(&dir.path().join("app.py"));

        assert_eq!(report.hidden_imports, BTreeSet::from(["urllib3".to_string()]));
    }

    #[test]
    fn test_deterministic_for_fixed_resolver() {
        let dir = project();
        let analyzer = DependencyAnalyzer::new(ModuleClassifier::new(
            environment().installed("requests"),
        ));
        let main = dir.path().join("app.py");

        assert_eq!(analyzer.analyze_project(&main), analyzer.analyze_project(&main));
    }

    #[test]
    fn test_scan_lists_only_names_to_classify() {
        let dir = project();
        let scan = ProjectScan::collect(&ImportExtractor::new(), &dir.path().join("app.py"));

        assert_eq!(scan.module_names(), vec!["json", "os", "requests", "sys", "yaml"]);
        assert_eq!(scan.imports["sys"], vec![dir.path().join("helpers.py")]);
        assert_eq!(scan.files_analyzed.len(), 3);
    }

    #[test]
    fn test_missing_project_dir_yields_empty_report() {
        let analyzer = DependencyAnalyzer::new(ModuleClassifier::new(environment()));
        let report = analyzer.analyze_project(Path::new("/definitely/not/here/app.py"));

        assert!(report.files_analyzed.is_empty());
        assert!(report.third_party.is_empty());
        assert!(report.missing.is_empty());
    }
}
