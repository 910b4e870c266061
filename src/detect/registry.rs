use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use super::backend::Detector;

/// Builds a fresh detector for one inference worker.
pub type DetectorFactory = Arc<dyn Fn() -> Result<Box<dyn Detector>> + Send + Sync>;

/// Named detector factories.
///
/// Workers never share a detector: every camera gets its own instance from
/// the selected factory, so no lock is held around `detect`.
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
    default_name: Option<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
        }
    }

    /// Registry with every backend compiled into this build.
    pub fn builtin(config: &crate::config::InferenceConfig) -> Self {
        let mut registry = Self::new();
        registry.register("stub", || Ok(Box::new(super::StubDetector::new())));

        #[cfg(feature = "backend-tract")]
        {
            let model_path = config.model_path.clone();
            registry.register("tract", move || {
                let path = model_path
                    .as_ref()
                    .ok_or_else(|| anyhow!("tract backend requires inference.model_path"))?;
                Ok(Box::new(super::TractDetector::new(path)?))
            });
        }
        #[cfg(not(feature = "backend-tract"))]
        let _ = config;

        registry
    }

    /// Register a factory. The first registered factory becomes the default.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(name.to_string());
        }
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.factories.contains_key(name) {
            return Err(anyhow!(
                "detector '{}' not registered (available: {})",
                name,
                self.list().join(", ")
            ));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    pub fn factory(&self, name: &str) -> Option<DetectorFactory> {
        self.factories.get(name).cloned()
    }

    pub fn default_factory(&self) -> Result<DetectorFactory> {
        let name = self
            .default_name
            .as_deref()
            .ok_or_else(|| anyhow!("no detector registered"))?;
        self.factory(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))
    }

    /// Instantiate a detector by name.
    pub fn build(&self, name: &str) -> Result<Box<dyn Detector>> {
        let factory = self
            .factory(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        factory()
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InferenceConfig;
    use crate::detect::Detection;
    use crate::frame::Frame;

    #[test]
    fn builtin_registry_defaults_to_stub() -> Result<()> {
        let registry = DetectorRegistry::builtin(&InferenceConfig::default());
        assert_eq!(registry.default_name(), Some("stub"));
        let detector = registry.build("stub")?;
        assert_eq!(detector.name(), "stub");
        Ok(())
    }

    #[test]
    fn unknown_detector_is_an_error() {
        let mut registry = DetectorRegistry::new();
        assert!(registry.build("yolo").is_err());
        assert!(registry.set_default("yolo").is_err());
        assert!(registry.default_factory().is_err());
    }

    #[test]
    fn each_build_returns_an_independent_instance() -> Result<()> {
        let mut registry = DetectorRegistry::new();
        registry.register("empty", || {
            Ok(Box::new(|_: &Frame| -> Result<Vec<Detection>> { Ok(Vec::new()) }))
        });
        let factory = registry.default_factory()?;
        let mut a = factory()?;
        let mut b = factory()?;
        let frame = Frame::new(crate::CameraId(1), 0, 0, 2, 2, vec![0; 12]);
        assert!(a.detect(&frame)?.is_empty());
        assert!(b.detect(&frame)?.is_empty());
        Ok(())
    }
}
