//! Prog definitions and the registry the runtime dispatches through.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;

use super::context::HopContext;
use super::directive::Directive;
use crate::failure::{HopError, RetryPolicy};
use crate::semaphore::{SemaphoreDecl, SemaphoreKind};

/// One bounded unit of work at a label.
///
/// Handlers may run more than once for the same hop (a worker can crash after
/// the side effect but before the transition commits), so remote effects must
/// be idempotent or checked before acting.
#[async_trait]
pub trait LabelHandler: Send + Sync {
    async fn run(&self, ctx: &mut HopContext) -> Result<Directive, HopError>;
}

#[async_trait]
impl<F> LabelHandler for F
where
    F: Fn(&mut HopContext) -> Result<Directive, HopError> + Send + Sync,
{
    async fn run(&self, ctx: &mut HopContext) -> Result<Directive, HopError> {
        self(ctx)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("prog {0} is already registered")]
    DuplicateProg(String),
    #[error("prog {0} declares no labels")]
    EmptyProg(String),
    #[error("prog {prog} registers label {label} twice")]
    DuplicateLabel { prog: String, label: String },
    #[error("prog {prog} declares semaphore {name} twice")]
    DuplicateSemaphore { prog: String, name: String },
    #[error("prog {prog} references unknown label {label} as {role}")]
    UnknownLabel {
        prog: String,
        label: String,
        role: &'static str,
    },
}

#[derive(Clone)]
struct LabelSpec {
    handler: Arc<dyn LabelHandler>,
    edges: Option<HashSet<String>>,
}

/// A named state machine: labels, their handlers, and the signals it reacts to.
pub struct Prog {
    name: String,
    labels: HashMap<String, LabelSpec>,
    semaphores: Vec<SemaphoreDecl>,
    fail_label: Option<String>,
    cancel_label: Option<String>,
    retry_policy: Option<RetryPolicy>,
}

impl std::fmt::Debug for Prog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut labels: Vec<&String> = self.labels.keys().collect();
        labels.sort();
        f.debug_struct("Prog")
            .field("name", &self.name)
            .field("labels", &labels)
            .field("semaphores", &self.semaphores)
            .field("fail_label", &self.fail_label)
            .field("cancel_label", &self.cancel_label)
            .finish()
    }
}

impl Prog {
    pub fn builder(name: impl Into<String>) -> ProgBuilder {
        ProgBuilder {
            name: name.into(),
            labels: Vec::new(),
            edges: Vec::new(),
            semaphores: Vec::new(),
            fail_label: None,
            cancel_label: None,
            retry_policy: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.contains_key(label)
    }

    pub fn handler(&self, label: &str) -> Option<Arc<dyn LabelHandler>> {
        self.labels.get(label).map(|spec| spec.handler.clone())
    }

    /// Whether `from` may hop to `to`. Labels without declared edges may go anywhere
    /// inside the prog.
    pub fn allows_hop(&self, from: &str, to: &str) -> bool {
        if !self.has_label(to) {
            return false;
        }
        match self.labels.get(from).and_then(|spec| spec.edges.as_ref()) {
            Some(edges) => edges.contains(to),
            None => true,
        }
    }

    pub fn semaphores(&self) -> &[SemaphoreDecl] {
        &self.semaphores
    }

    pub fn semaphore_kinds(&self) -> HashMap<String, SemaphoreKind> {
        self.semaphores
            .iter()
            .map(|decl| (decl.name.clone(), decl.kind))
            .collect()
    }

    pub fn fail_label(&self) -> Option<&str> {
        self.fail_label.as_deref()
    }

    pub fn cancel_label(&self) -> Option<&str> {
        self.cancel_label.as_deref()
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

pub struct ProgBuilder {
    name: String,
    labels: Vec<(String, Arc<dyn LabelHandler>)>,
    edges: Vec<(String, Vec<String>)>,
    semaphores: Vec<SemaphoreDecl>,
    fail_label: Option<String>,
    cancel_label: Option<String>,
    retry_policy: Option<RetryPolicy>,
}

impl ProgBuilder {
    pub fn label<F>(self, label: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut HopContext) -> Result<Directive, HopError> + Send + Sync + 'static,
    {
        self.label_handler(label, handler)
    }

    /// Register a handler that awaits remote work.
    pub fn label_handler(
        mut self,
        label: impl Into<String>,
        handler: impl LabelHandler + 'static,
    ) -> Self {
        self.labels.push((label.into(), Arc::new(handler)));
        self
    }

    /// Restrict the labels `from` may hop to.
    pub fn edges<I, S>(mut self, from: impl Into<String>, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges
            .push((from.into(), targets.into_iter().map(Into::into).collect()));
        self
    }

    pub fn semaphore(mut self, name: impl Into<String>, kind: SemaphoreKind) -> Self {
        self.semaphores.push(SemaphoreDecl {
            name: name.into(),
            kind,
            trigger: None,
        });
        self
    }

    /// Declare a semaphore that forces the strand to `label` whenever it is pending.
    pub fn trigger(
        mut self,
        name: impl Into<String>,
        kind: SemaphoreKind,
        label: impl Into<String>,
    ) -> Self {
        self.semaphores.push(SemaphoreDecl {
            name: name.into(),
            kind,
            trigger: Some(label.into()),
        });
        self
    }

    pub fn fail_label(mut self, label: impl Into<String>) -> Self {
        self.fail_label = Some(label.into());
        self
    }

    pub fn cancel_label(mut self, label: impl Into<String>) -> Self {
        self.cancel_label = Some(label.into());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<Prog, RegistryError> {
        if self.labels.is_empty() {
            return Err(RegistryError::EmptyProg(self.name));
        }

        let mut labels: HashMap<String, LabelSpec> = HashMap::new();
        for (label, handler) in self.labels {
            if labels.contains_key(&label) {
                return Err(RegistryError::DuplicateLabel {
                    prog: self.name,
                    label,
                });
            }
            labels.insert(
                label,
                LabelSpec {
                    handler,
                    edges: None,
                },
            );
        }

        let unknown = |label: &str, role: &'static str| RegistryError::UnknownLabel {
            prog: self.name.clone(),
            label: label.to_string(),
            role,
        };

        for (from, targets) in self.edges {
            for target in &targets {
                if !labels.contains_key(target) {
                    return Err(unknown(target, "hop target"));
                }
            }
            let spec = labels
                .get_mut(&from)
                .ok_or_else(|| unknown(&from, "edge source"))?;
            spec.edges
                .get_or_insert_with(HashSet::new)
                .extend(targets);
        }

        if let Some(label) = &self.fail_label
            && !labels.contains_key(label)
        {
            return Err(unknown(label, "fail label"));
        }
        if let Some(label) = &self.cancel_label
            && !labels.contains_key(label)
        {
            return Err(unknown(label, "cancel label"));
        }

        let mut seen = HashSet::new();
        for decl in &self.semaphores {
            if !seen.insert(decl.name.as_str()) {
                return Err(RegistryError::DuplicateSemaphore {
                    prog: self.name.clone(),
                    name: decl.name.clone(),
                });
            }
            if let Some(trigger) = &decl.trigger
                && !labels.contains_key(trigger)
            {
                return Err(unknown(trigger, "trigger label"));
            }
        }

        Ok(Prog {
            name: self.name,
            labels,
            semaphores: self.semaphores,
            fail_label: self.fail_label,
            cancel_label: self.cancel_label,
            retry_policy: self.retry_policy,
        })
    }
}

/// All progs a worker can run, keyed by name.
#[derive(Clone, Default)]
pub struct ProgRegistry {
    progs: HashMap<String, Arc<Prog>>,
}

impl ProgRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prog: Prog) -> Result<(), RegistryError> {
        if self.progs.contains_key(prog.name()) {
            return Err(RegistryError::DuplicateProg(prog.name().to_string()));
        }
        self.progs.insert(prog.name().to_string(), Arc::new(prog));
        Ok(())
    }

    pub fn with(mut self, prog: Prog) -> Result<Self, RegistryError> {
        self.register(prog)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Prog>> {
        self.progs.get(name).cloned()
    }

    pub fn has_label(&self, prog: &str, label: &str) -> bool {
        self.progs
            .get(prog)
            .is_some_and(|prog| prog.has_label(label))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.progs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
