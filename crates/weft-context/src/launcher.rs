//! Task launchers.
//!
//! A launcher names the task, the regions it needs and the body that runs
//! in the child context. Bodies receive the child's [`Context`] and return
//! the bytes the child's future resolves to.

use std::fmt;
use std::sync::Arc;

use weft_core::{ContextError, TaskId};
use weft_eqset::Rect;
use weft_pipeline::{Predicate, RegionRequirement};

use crate::context::Context;

/// Body of a task.
pub type TaskBody = Arc<dyn Fn(&Context) -> Result<Vec<u8>, ContextError> + Send + Sync>;

/// Launch of a single child task.
#[derive(Clone)]
pub struct TaskLauncher {
    /// Task id, used in logs and traces.
    pub task: TaskId,
    /// Regions the child may access.
    pub requirements: Vec<RegionRequirement>,
    /// The body.
    pub body: TaskBody,
    /// Arguments passed to the child.
    pub args: Vec<u8>,
    /// Predicate and the value the future takes when it is false.
    pub predicate: Option<(Predicate, Vec<u8>)>,
    /// Run the child in a leaf context.
    pub leaf: bool,
}

impl TaskLauncher {
    /// Launcher for `task` running `body`.
    pub fn new<F>(task: TaskId, body: F) -> Self
    where
        F: Fn(&Context) -> Result<Vec<u8>, ContextError> + Send + Sync + 'static,
    {
        Self {
            task,
            requirements: Vec::new(),
            body: Arc::new(body),
            args: Vec::new(),
            predicate: None,
            leaf: false,
        }
    }

    /// Add a region requirement.
    pub fn with_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: impl Into<Vec<u8>>) -> Self {
        self.args = args.into();
        self
    }

    /// Predicate the launch.
    pub fn with_predicate(mut self, predicate: Predicate, false_value: Vec<u8>) -> Self {
        self.predicate = Some((predicate, false_value));
        self
    }

    /// Run the child in a leaf context.
    pub fn leaf(mut self) -> Self {
        self.leaf = true;
        self
    }
}

impl fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("task", &self.task)
            .field("requirements", &self.requirements.len())
            .field("args", &self.args.len())
            .field("predicated", &self.predicate.is_some())
            .field("leaf", &self.leaf)
            .finish()
    }
}

/// Launch of one leaf task per point of a domain.
#[derive(Clone)]
pub struct IndexLauncher {
    /// Task id.
    pub task: TaskId,
    /// Launch domain.
    pub domain: Rect,
    /// Regions every point may access.
    pub requirements: Vec<RegionRequirement>,
    /// The body, run once per point.
    pub body: TaskBody,
    /// Arguments passed to every point.
    pub args: Vec<u8>,
}

impl IndexLauncher {
    /// Launcher of `task` over `domain`.
    pub fn new<F>(task: TaskId, domain: Rect, body: F) -> Self
    where
        F: Fn(&Context) -> Result<Vec<u8>, ContextError> + Send + Sync + 'static,
    {
        Self {
            task,
            domain,
            requirements: Vec::new(),
            body: Arc::new(body),
            args: Vec::new(),
        }
    }

    /// Add a region requirement.
    pub fn with_requirement(mut self, req: RegionRequirement) -> Self {
        self.requirements.push(req);
        self
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: impl Into<Vec<u8>>) -> Self {
        self.args = args.into();
        self
    }
}

impl fmt::Debug for IndexLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexLauncher")
            .field("task", &self.task)
            .field("domain", &self.domain)
            .field("requirements", &self.requirements.len())
            .finish()
    }
}
