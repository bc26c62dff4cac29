//! Hidden-import recommendations.
//!
//! Static scanners in the packaging backends miss modules that are loaded
//! dynamically. The table maps a detected top-level package to the extra
//! top-level modules it pulls in at runtime.

use std::collections::{BTreeSet, HashMap};

const DEFAULT_EXPANSIONS: &[(&str, &[&str])] = &[
    ("PyQt5", &["PyQt5"]),
    ("requests", &["urllib3", "certifi", "chardet", "idna"]),
    ("pandas", &["pytz", "numpy", "dateutil"]),
    ("numpy", &["numpy"]),
    ("PIL", &["PIL"]),
    ("Pillow", &["PIL"]),
    ("matplotlib", &["matplotlib"]),
    ("sqlalchemy", &["sqlalchemy"]),
    ("scipy", &["scipy"]),
    ("bs4", &["bs4"]),
    ("lxml", &["lxml"]),
];

/// Recommended regardless of what the project imports.
pub const COMMON_DYNAMIC_IMPORTS: &[&str] =
    &["pkg_resources", "pandas._libs", "numpy.random", "scipy.special"];

/// Package name → modules it needs at runtime.
#[derive(Debug, Clone)]
pub struct HiddenImportTable {
    expansions: HashMap<String, BTreeSet<String>>,
    common: BTreeSet<String>,
}

impl Default for HiddenImportTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (package, extras) in DEFAULT_EXPANSIONS {
            table = table.with_expansion(package, extras.iter().copied());
        }
        for module in COMMON_DYNAMIC_IMPORTS {
            table = table.with_common(module);
        }
        table
    }
}

impl HiddenImportTable {
    /// A table with no entries and no common modules.
    pub fn empty() -> Self {
        Self {
            expansions: HashMap::new(),
            common: BTreeSet::new(),
        }
    }

    pub fn with_expansion<'a>(
        mut self,
        package: &str,
        extras: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        self.expansions
            .entry(package.to_string())
            .or_default()
            .extend(extras.into_iter().map(str::to_string));
        self
    }

    pub fn with_common(mut self, module: &str) -> Self {
        self.common.insert(module.to_string());
        self
    }

    /// Extra modules for one package; empty for unknown packages.
    pub fn expand(&self, package: &str) -> impl Iterator<Item = &str> {
        self.expansions
            .get(package)
            .into_iter()
            .flat_map(|extras| extras.iter().map(String::as_str))
    }

    pub fn common(&self) -> impl Iterator<Item = &str> {
        self.common.iter().map(String::as_str)
    }

    /// Union of per-package expansions and the common list.
    pub fn recommend<'a>(&self, third_party: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let mut recommended: BTreeSet<String> = self.common().map(str::to_string).collect();
        for package in third_party {
            recommended.extend(self.expand(package).map(str::to_string));
        }
        recommended
    }
}
