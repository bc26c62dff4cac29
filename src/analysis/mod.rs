//! Dependency analysis for a Python project.
//!
//! - **Environment**: [`InterpreterProbe`] captures an interpreter's layout,
//!   and locates imported names; [`LocatedResolver`] serves those answers
//!   ahead of the filesystem lookups of [`EnvironmentResolver`]
//! - **Classification**: [`ModuleClassifier`] sorts names into builtin,
//!   stdlib, third-party, available and missing
//! - **Extraction**: [`ImportExtractor`] reads top-level imports from source
//! - **Project scan**: [`ProjectScan`] collects the imports and
//!   [`DependencyAnalyzer`] ties the above together and
//!   adds hidden-import recommendations from a [`HiddenImportTable`]

pub mod analyzer;
pub mod classifier;
pub mod environment;
pub mod hidden;
pub mod imports;

pub use analyzer::{DependencyAnalyzer, ProjectScan};
pub use classifier::ModuleClassifier;
pub use environment::{EnvironmentResolver, InterpreterProbe, LocatedResolver, PythonEnvironment};
pub use hidden::{HiddenImportTable, COMMON_DYNAMIC_IMPORTS};
pub use imports::ImportExtractor;
