//! Statically registered tasks and the callables that name them.
//!
//! Controller and worker binaries build the same [`TaskRegistry`]. The
//! controller hands out [`Callable`]s; shipping one to a worker only sends
//! its name (or its script text), never code.

use crate::remote::{ShippedUnit, UnitSource};
use distdev_core::Rank;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Error returned by a task
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Arguments did not match what the task expects
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// The task ran and failed
    #[error("{0}")]
    Failed(String),
}

/// Per-worker context passed to every task call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    /// Rank of the executing worker
    pub rank: Rank,
    /// Workers plus controller
    pub world_size: u32,
}

/// Arguments of a call, identical for every worker
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallArgs {
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    /// No arguments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Positional arguments only
    #[must_use]
    pub fn positional(args: Vec<Value>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    /// Append a positional argument
    #[must_use]
    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument
    #[must_use]
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index`
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Keyword argument `name`
    #[must_use]
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument `index` as an integer
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidArgs`] if it is missing or not an integer
    pub fn int(&self, index: usize) -> Result<i64, TaskError> {
        self.arg(index)
            .and_then(Value::as_i64)
            .ok_or_else(|| TaskError::InvalidArgs(format!("argument {} must be an integer", index)))
    }
}

/// Synchronous unit of work executed on a worker
pub trait Task: Send + Sync {
    /// Registered name
    fn name(&self) -> &str;

    /// Run the task
    ///
    /// # Errors
    ///
    /// Returns error if the task fails
    fn call(&self, ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError>;
}

/// Task backed by a closure
pub struct FnTask<F> {
    name: String,
    f: F,
}

impl<F> FnTask<F>
where
    F: Fn(&TaskContext, &CallArgs) -> Result<Value, TaskError> + Send + Sync,
{
    /// Wrap `f` under `name`
    #[must_use]
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(&TaskContext, &CallArgs) -> Result<Value, TaskError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
        (self.f)(ctx, args)
    }
}

/// Handle to a unit of work the controller can launch.
///
/// Clones share an identity; the code shipper installs each identity on
/// the workers at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callable {
    id: Uuid,
    name: String,
    source: UnitSource,
}

impl Callable {
    /// Callable for a task registered under `name`
    #[must_use]
    pub fn registered(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source: UnitSource::Registered,
        }
    }

    /// Callable for a cell-language script bound under `name`
    #[must_use]
    pub fn script(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            source: UnitSource::Script(source.into()),
        }
    }

    /// Identity used for memoization
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Bound name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Source
    #[must_use]
    pub fn source(&self) -> &UnitSource {
        &self.source
    }

    /// Install payload
    #[must_use]
    pub fn unit(&self) -> ShippedUnit {
        ShippedUnit {
            id: self.id,
            name: self.name.clone(),
            source: self.source.clone(),
        }
    }
}

/// Error from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A task with this name exists
    #[error("Task already registered: {name}")]
    AlreadyRegistered {
        /// Task name
        name: String,
    },
}

struct TaskEntry {
    task: Arc<dyn Task>,
    callable: Callable,
}

/// Tasks known to a binary, in registration order
#[derive(Default)]
pub struct TaskRegistry {
    tasks: IndexMap<String, TaskEntry>,
}

impl TaskRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken
    pub fn register(&mut self, task: Arc<dyn Task>) -> Result<(), RegistryError> {
        let name = task.name().to_string();
        if self.tasks.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }
        let callable = Callable::registered(name.clone());
        self.tasks.insert(name, TaskEntry { task, callable });
        Ok(())
    }

    /// Register a closure as a task
    ///
    /// # Errors
    ///
    /// Returns error if the name is taken
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<(), RegistryError>
    where
        F: Fn(&TaskContext, &CallArgs) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnTask::new(name, f)))
    }

    /// Look up a task
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).map(|e| Arc::clone(&e.task))
    }

    /// The callable for a registered task. Every lookup returns the same identity.
    #[must_use]
    pub fn callable(&self, name: &str) -> Option<Callable> {
        self.tasks.get(name).map(|e| e.callable.clone())
    }

    /// Registered names in registration order
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Whether `name` is registered
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Number of tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TaskContext {
        TaskContext {
            rank: Rank::new(1),
            world_size: 3,
        }
    }

    #[test]
    fn test_register_and_call() {
        let mut registry = TaskRegistry::new();
        registry
            .register_fn("add", |_, args| Ok(json!(args.int(0)? + args.int(1)?)))
            .unwrap();

        let task = registry.get("add").unwrap();
        let result = task.call(&ctx(), &CallArgs::new().with_arg(2).with_arg(3)).unwrap();
        assert_eq!(result, json!(5));
        assert!(registry.contains("add"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("rank", |c, _| Ok(json!(c.rank.as_u32()))).unwrap();
        let err = registry.register_fn("rank", |_, _| Ok(Value::Null)).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered { name: "rank".into() });
    }

    #[test]
    fn test_callable_identity_is_stable() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("noop", |_, _| Ok(Value::Null)).unwrap();

        let a = registry.callable("noop").unwrap();
        let b = registry.callable("noop").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.unit().source, UnitSource::Registered);
    }

    #[test]
    fn test_distinct_callables_have_distinct_identity() {
        let a = Callable::script("f", "1");
        let b = Callable::script("f", "1");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }

    #[test]
    fn test_names_in_registration_order() {
        let mut registry = TaskRegistry::new();
        for name in ["c", "a", "b"] {
            registry.register_fn(name, |_, _| Ok(Value::Null)).unwrap();
        }
        assert_eq!(registry.names(), vec!["c", "a", "b"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_int_argument_errors() {
        let args = CallArgs::positional(vec![json!("x")]);
        assert!(matches!(args.int(0), Err(TaskError::InvalidArgs(_))));
        assert!(matches!(args.int(3), Err(TaskError::InvalidArgs(_))));
    }
}
