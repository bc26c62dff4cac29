pub mod analysis;
pub mod executor;
pub mod model;
pub mod packaging;
pub mod settings;
pub mod traits;

// Re-export common types for convenience
pub use executor::*;
pub use model::*;
pub use settings::{SettingsDocument, SettingsError, SettingsStore};
pub use traits::*;
