//! Analysis packages: what a run starts and when it is done.
//!
//! A package is a set of hooks. Only `start` is mandatory; `check` and
//! `finish` may be left out, and their presence is settled once when the
//! package is built.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::PackageConfig;
use crate::gateway::InjectionGateway;
use crate::registry::ProcessId;

pub mod exe;
pub mod observe;

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("analysis package \"{0}\" does not exist")]
    NotFound(String),

    #[error("analysis package \"{0}\" has no start hook")]
    MissingStartHook(String),

    #[error("analysis package \"{name}\" is misconfigured: {reason}")]
    Config { name: String, reason: String },

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("analysis package \"{name}\" failed to start: {reason}")]
    Start { name: String, reason: String },

    #[error("analysis package \"{name}\" failed to finish: {reason}")]
    Finish { name: String, reason: String },
}

pub type StartHook = Box<dyn FnMut() -> Result<Vec<ProcessId>, PackageError> + Send>;
pub type CheckHook = Box<dyn FnMut() -> bool + Send>;
pub type FinishHook = Box<dyn FnOnce() -> Result<(), PackageError> + Send>;

/// A loaded analysis package.
pub struct AnalysisPackage {
    name: String,
    start: StartHook,
    check: Option<CheckHook>,
    finish: Option<FinishHook>,
}

impl AnalysisPackage {
    pub fn builder(name: impl Into<String>) -> PackageBuilder {
        PackageBuilder {
            name: name.into(),
            start: None,
            check: None,
            finish: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launch the workload and return the processes to monitor.
    pub fn start(&mut self) -> Result<Vec<ProcessId>, PackageError> {
        (self.start)()
    }

    /// Whether the run should go on. Without a check hook it always should.
    pub fn should_continue(&mut self) -> bool {
        self.check.as_mut().map_or(true, |check| check())
    }

    /// Run the finish hook, if any. Later calls do nothing.
    pub fn finish(&mut self) -> Result<(), PackageError> {
        self.finish.take().map_or(Ok(()), |finish| finish())
    }

    pub fn has_check(&self) -> bool {
        self.check.is_some()
    }

    pub fn has_finish(&self) -> bool {
        self.finish.is_some()
    }
}

impl fmt::Debug for AnalysisPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisPackage")
            .field("name", &self.name)
            .field("check", &self.has_check())
            .field("finish", &self.has_finish())
            .finish()
    }
}

/// Collects the hooks of a package.
pub struct PackageBuilder {
    name: String,
    start: Option<StartHook>,
    check: Option<CheckHook>,
    finish: Option<FinishHook>,
}

impl PackageBuilder {
    #[must_use]
    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> Result<Vec<ProcessId>, PackageError> + Send + 'static,
    {
        self.start = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_check<F>(mut self, hook: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.check = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_finish<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> Result<(), PackageError> + Send + 'static,
    {
        self.finish = Some(Box::new(hook));
        self
    }

    /// Fails when the start hook is missing.
    pub fn build(self) -> Result<AnalysisPackage, PackageError> {
        let start = self
            .start
            .ok_or_else(|| PackageError::MissingStartHook(self.name.clone()))?;

        Ok(AnalysisPackage {
            name: self.name,
            start,
            check: self.check,
            finish: self.finish,
        })
    }
}

/// What a package factory gets to work with.
#[derive(Clone)]
pub struct PackageContext {
    pub config: PackageConfig,
    pub gateway: Arc<dyn InjectionGateway>,
}

pub type PackageFactory =
    Box<dyn Fn(&PackageContext) -> Result<AnalysisPackage, PackageError> + Send + Sync>;

/// Packages available to the agent, by name.
#[derive(Default)]
pub struct PackageCatalog {
    factories: BTreeMap<String, PackageFactory>,
}

impl PackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the packages shipped with the agent.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(exe::NAME, exe::load);
        catalog.register(observe::NAME, observe::load);
        catalog
    }

    /// Add a package, replacing any package of the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&PackageContext) -> Result<AnalysisPackage, PackageError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn load(&self, name: &str, ctx: &PackageContext) -> Result<AnalysisPackage, PackageError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PackageError::NotFound(name.to_string()))?;
        factory(ctx)
    }
}

impl fmt::Debug for PackageCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
