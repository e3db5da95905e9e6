//! Process registry: name to template lookup, with directory loading and
//! hot reload.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::process::builtin;
use crate::process::functions::FunctionRegistry;
use crate::process::template::{ProcessTemplate, StepKind};

/// Source of process templates.
pub trait ProcessRegistry: Send + Sync {
    /// Get a template snapshot by name.
    fn get(&self, name: &str) -> Result<Arc<ProcessTemplate>>;

    fn names(&self) -> Vec<String>;
}

type TemplateMap = HashMap<String, Arc<ProcessTemplate>>;

/// Registry held in memory. Clones share the same template table.
///
/// Replacing a template swaps its `Arc`; runs already holding the old one
/// keep executing it.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProcessRegistry {
    templates: Arc<RwLock<TemplateMap>>,
}

impl InMemoryProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in processes.
    pub fn with_builtins() -> Result<Self> {
        let registry = Self::new();
        for template in builtin::templates()? {
            registry.insert(template)?;
        }
        Ok(registry)
    }

    /// Validate and insert (or replace) a template.
    pub fn insert(&self, template: ProcessTemplate) -> Result<()> {
        template.validate()?;
        let name = template.name.clone();
        let mut map = self.templates.write().unwrap_or_else(|e| e.into_inner());
        map.insert(name, Arc::new(template));
        Ok(())
    }

    /// Load every `*.toml` / `*.json` file in `dir`.
    ///
    /// All files are parsed before any is inserted, so one bad file leaves the
    /// registry unchanged. Returns the loaded names.
    pub fn load_dir(&self, dir: &Path) -> Result<Vec<String>> {
        let mut loaded = Vec::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_template_file(p))
            .collect();
        paths.sort();
        for path in &paths {
            loaded.push(ProcessTemplate::from_file(path)?);
        }

        let names: Vec<String> = loaded.iter().map(|t| t.name.clone()).collect();
        let mut map = self.templates.write().unwrap_or_else(|e| e.into_inner());
        for template in loaded {
            map.insert(template.name.clone(), Arc::new(template));
        }
        info!(dir = %dir.display(), count = names.len(), "process templates loaded");
        Ok(names)
    }

    /// Reload a single file. Invalid files are logged and ignored, leaving
    /// the previous version in place.
    pub fn reload_file(&self, path: &Path) -> Option<String> {
        if !is_template_file(path) {
            return None;
        }
        match ProcessTemplate::from_file(path) {
            Ok(template) => {
                let name = template.name.clone();
                let mut map = self.templates.write().unwrap_or_else(|e| e.into_inner());
                map.insert(name.clone(), Arc::new(template));
                info!(process = %name, path = %path.display(), "process template reloaded");
                Some(name)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid process template");
                None
            }
        }
    }

    /// Watch `dir` and reload templates as files are created or modified.
    ///
    /// The returned watcher must be kept alive for watching to continue.
    pub fn watch(&self, dir: &Path) -> Result<RecommendedWatcher> {
        let registry = self.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    for path in &event.paths {
                        registry.reload_file(path);
                    }
                }
                Err(e) => warn!(error = %e, "process watcher error"),
            },
            Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "watching process templates");
        Ok(watcher)
    }

    /// `(process, function)` pairs naming functions the registry lacks.
    pub fn missing_functions(&self, functions: &FunctionRegistry) -> Vec<(String, String)> {
        let map = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut missing = Vec::new();
        for template in map.values() {
            for step in &template.steps {
                if let StepKind::Call { function, .. } = &step.kind {
                    if !functions.contains(function) {
                        missing.push((template.name.clone(), function.clone()));
                    }
                }
            }
        }
        missing.sort();
        missing
    }
}

impl ProcessRegistry for InMemoryProcessRegistry {
    fn get(&self, name: &str) -> Result<Arc<ProcessTemplate>> {
        let map = self.templates.read().unwrap_or_else(|e| e.into_inner());
        map.get(name)
            .cloned()
            .ok_or_else(|| Error::ProcessNotFound(name.to_string()))
    }

    fn names(&self) -> Vec<String> {
        let map = self.templates.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }
}

fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("toml") | Some("json")
    )
}
