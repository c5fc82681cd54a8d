//! Output registry -- a named collection of output factories.
//!
//! The harness looks up an output by the name given on its command line
//! (e.g. `--out plugin=./foo`) and asks the factory to build it.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use super::trait_def::HarnessOutput;
use super::types::OutputParams;

/// Builds a [`HarnessOutput`] from harness parameters.
#[async_trait]
pub trait OutputFactory: Send + Sync {
    /// Name the output is selected by (e.g. "plugin").
    fn name(&self) -> &str;

    /// Construct a ready-to-start output.
    async fn create(&self, params: OutputParams) -> Result<Box<dyn HarnessOutput>>;
}

/// A collection of registered [`OutputFactory`] implementations, keyed by
/// name.
///
/// Populated explicitly by [`super::bootstrap`]; nothing registers itself
/// at load time.
#[derive(Default)]
pub struct OutputRegistry {
    factories: HashMap<String, Box<dyn OutputFactory>>,
}

impl OutputRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under the name returned by
    /// [`OutputFactory::name`]. A factory already registered under that
    /// name is replaced and returned.
    pub fn register(&mut self, factory: impl OutputFactory + 'static) -> Option<Box<dyn OutputFactory>> {
        let name = factory.name().to_string();
        self.factories.insert(name, Box::new(factory))
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Option<&dyn OutputFactory> {
        self.factories.get(name).map(|b| b.as_ref())
    }

    /// Build the output registered under `name`.
    pub async fn create(&self, name: &str, params: OutputParams) -> Result<Box<dyn HarnessOutput>> {
        let factory = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown output {name:?}"))?;
        factory.create(params).await
    }

    /// List the names of all registered outputs. Order is not guaranteed.
    pub fn list(&self) -> Vec<&str> {
        self.factories.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for OutputRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRegistry")
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::types::{SampleContainer, Thresholds};

    struct NullOutput;

    #[async_trait]
    impl HarnessOutput for NullOutput {
        fn description(&self) -> String {
            "null".to_string()
        }

        fn set_thresholds(&self, _thresholds: HashMap<String, Thresholds>) {}

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn add_metric_samples(&self, _samples: Vec<SampleContainer>) {}

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeFactory {
        factory_name: String,
    }

    impl FakeFactory {
        fn new(name: &str) -> Self {
            Self {
                factory_name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl OutputFactory for FakeFactory {
        fn name(&self) -> &str {
            &self.factory_name
        }

        async fn create(&self, _params: OutputParams) -> Result<Box<dyn HarnessOutput>> {
            Ok(Box::new(NullOutput))
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = OutputRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = OutputRegistry::new();
        assert!(registry.register(FakeFactory::new("alpha")).is_none());
        let old = registry.register(FakeFactory::new("alpha"));
        assert_eq!(old.unwrap().name(), "alpha");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = OutputRegistry::new();
        registry.register(FakeFactory::new("alpha"));
        registry.register(FakeFactory::new("beta"));

        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn create_builds_registered_output() {
        let mut registry = OutputRegistry::new();
        registry.register(FakeFactory::new("null"));

        let params = OutputParams::new("", HashMap::new());
        let output = registry.create("null", params).await.unwrap();
        assert_eq!(output.description(), "null");
    }

    #[tokio::test]
    async fn create_unknown_output_fails() {
        let registry = OutputRegistry::new();
        let params = OutputParams::new("", HashMap::new());
        let err = registry.create("missing", params).await.err().unwrap();
        assert!(err.to_string().contains("unknown output"));
    }

    #[test]
    fn registry_debug_shows_names() {
        let mut registry = OutputRegistry::new();
        registry.register(FakeFactory::new("statsd"));
        assert!(format!("{registry:?}").contains("statsd"));
    }
}
