use tracing::debug;

use crate::model::ModuleClassification;
use crate::traits::ModuleResolver;

/// Classifies top-level module names against a [`ModuleResolver`].
///
/// Order: builtin, stdlib, then lookup; a found module is third-party when
/// its file sits under a package-manager directory and merely available
/// otherwise. Any resolution failure counts as missing.
#[derive(Debug, Clone)]
pub struct ModuleClassifier<R> {
    resolver: R,
}

impl<R: ModuleResolver> ModuleClassifier<R> {
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn classify(&self, name: &str) -> ModuleClassification {
        if self.resolver.is_builtin(name) {
            return ModuleClassification::Builtin;
        }
        if self.resolver.is_stdlib(name) {
            return ModuleClassification::Stdlib;
        }

        match self.resolver.find_module(name) {
            Ok(Some(origin)) if origin.is_package_managed() => ModuleClassification::ThirdParty,
            Ok(Some(_)) => ModuleClassification::Available,
            Ok(None) => ModuleClassification::Missing,
            Err(e) => {
                debug!(module = name, error = %e, "Classification indeterminate, treating as missing");
                ModuleClassification::Missing
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeResolver;
    use super::*;
    use crate::traits::ModuleOrigin;

    fn classifier() -> ModuleClassifier<FakeResolver> {
        ModuleClassifier::new(
            FakeResolver::default()
                .builtin("sys")
                .stdlib("os")
                .stdlib("json")
                .installed("requests")
                .local("helpers")
                .broken("locked"),
        )
    }

    #[test]
    fn test_classification_order() {
        let classifier = classifier();
        assert_eq!(classifier.classify("sys"), ModuleClassification::Builtin);
        assert_eq!(classifier.classify("os"), ModuleClassification::Stdlib);
        assert_eq!(classifier.classify("requests"), ModuleClassification::ThirdParty);
        assert_eq!(classifier.classify("helpers"), ModuleClassification::Available);
        assert_eq!(classifier.classify("nope"), ModuleClassification::Missing);
    }

    #[test]
    fn test_builtin_wins_over_installed_copy() {
        let classifier = ModuleClassifier::new(FakeResolver::default().builtin("sys").installed("sys"));
        assert_eq!(classifier.classify("sys"), ModuleClassification::Builtin);
    }

    #[test]
    fn test_resolution_failure_is_missing() {
        assert_eq!(classifier().classify("locked"), ModuleClassification::Missing);
    }

    #[test]
    fn test_namespace_package_is_available() {
        let mut resolver = FakeResolver::default();
        resolver
            .modules
            .insert("zope".to_string(), ModuleOrigin::namespace());
        let classifier = ModuleClassifier::new(resolver);
        assert_eq!(classifier.classify("zope"), ModuleClassification::Available);
    }
}
