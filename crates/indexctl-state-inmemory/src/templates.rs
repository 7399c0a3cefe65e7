use std::collections::HashMap;
use std::path::{Component, Path};
use tracing::debug;

use indexctl_core::{domain::template::TemplateLoader, CoreError};

/// Template loader serving templates registered in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryTemplateLoader {
    templates: HashMap<String, String>,
}

impl InMemoryTemplateLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `text` under `file`
    pub fn with_template(mut self, file: &str, text: &str) -> Self {
        self.templates.insert(file.to_string(), text.to_string());
        self
    }
}

impl TemplateLoader for InMemoryTemplateLoader {
    fn load(&self, _root: &str, file: &str) -> Result<String, CoreError> {
        self.templates
            .get(file)
            .cloned()
            .ok_or_else(|| CoreError::TemplateError(format!("template not found: {}", file)))
    }
}

/// Template loader reading files below the template root
#[derive(Debug, Default, Clone)]
pub struct FsTemplateLoader;

impl FsTemplateLoader {
    /// Create a loader
    pub fn new() -> Self {
        Self
    }
}

impl TemplateLoader for FsTemplateLoader {
    fn load(&self, root: &str, file: &str) -> Result<String, CoreError> {
        let relative = Path::new(file);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CoreError::TemplateError(format!(
                "template path must stay below the template root: {}",
                file
            )));
        }

        let path = Path::new(root).join(relative);
        debug!(path = %path.display(), "Loading template");
        std::fs::read_to_string(&path).map_err(|e| {
            CoreError::TemplateError(format!("cannot read template {}: {}", path.display(), e))
        })
    }
}
