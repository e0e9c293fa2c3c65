//! Tasks compiled into the `distdev` binary.

use distdev_cluster::{CallArgs, RegistryError, TaskContext, TaskError, TaskRegistry};
use serde_json::{Value, json};
use std::time::Duration;

/// Name and one-line description of every built-in task, in registration order
pub const BUILTIN_TASKS: &[(&str, &str)] = &[
    ("rank", "the executing worker's rank"),
    ("world_size", "workers plus the controller"),
    ("echo", "its positional arguments as a list"),
    ("sum", "the sum of its integer arguments"),
    ("square", "the square of its argument, or of the rank without one"),
    ("fail_on", "fails on the given rank, \"ok\" elsewhere"),
    ("log_lines", "logs N lines, returns N"),
    ("sleep_ms", "sleeps for N milliseconds, returns N"),
    ("panic_on", "panics on the given rank, none elsewhere"),
];

/// Registry holding every built-in task
///
/// # Errors
///
/// Returns error if a name is registered twice
pub fn registry() -> Result<TaskRegistry, RegistryError> {
    let mut registry = TaskRegistry::new();
    registry.register_fn("rank", |ctx, _| Ok(json!(ctx.rank.as_u32())))?;
    registry.register_fn("world_size", |ctx, _| Ok(json!(ctx.world_size)))?;
    registry.register_fn("echo", |_, args| Ok(Value::Array(args.args.clone())))?;
    registry.register_fn("sum", sum)?;
    registry.register_fn("square", square)?;
    registry.register_fn("fail_on", fail_on)?;
    registry.register_fn("log_lines", log_lines)?;
    registry.register_fn("sleep_ms", sleep_ms)?;
    registry.register_fn("panic_on", panic_on)?;
    Ok(registry)
}

fn sum(_: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    let mut total = 0i64;
    for index in 0..args.args.len() {
        total = total
            .checked_add(args.int(index)?)
            .ok_or_else(|| TaskError::Failed("integer overflow".to_string()))?;
    }
    Ok(json!(total))
}

fn square(ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    let base = if args.args.is_empty() {
        i64::from(ctx.rank.as_u32())
    } else {
        args.int(0)?
    };
    base.checked_mul(base)
        .map(|v| json!(v))
        .ok_or_else(|| TaskError::Failed("integer overflow".to_string()))
}

fn is_target(ctx: &TaskContext, args: &CallArgs) -> Result<bool, TaskError> {
    Ok(i64::from(ctx.rank.as_u32()) == args.int(0)?)
}

fn fail_on(ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    if is_target(ctx, args)? {
        return Err(TaskError::Failed(format!("rank {} was told to fail", ctx.rank)));
    }
    Ok(json!("ok"))
}

fn log_lines(ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    let count = args.int(0)?;
    for line in 0..count {
        tracing::info!("line {} from rank {}", line, ctx.rank);
    }
    Ok(json!(count))
}

fn sleep_ms(_: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    let ms = u64::try_from(args.int(0)?)
        .map_err(|_| TaskError::InvalidArgs("duration must not be negative".to_string()))?;
    std::thread::sleep(Duration::from_millis(ms));
    Ok(json!(ms))
}

fn panic_on(ctx: &TaskContext, args: &CallArgs) -> Result<Value, TaskError> {
    if is_target(ctx, args)? {
        panic!("rank {} was told to panic", ctx.rank);
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use distdev_core::Rank;

    fn ctx(rank: u32) -> TaskContext {
        TaskContext {
            rank: Rank::new(rank),
            world_size: 5,
        }
    }

    fn call(name: &str, rank: u32, args: CallArgs) -> Result<Value, TaskError> {
        registry().unwrap().get(name).unwrap().call(&ctx(rank), &args)
    }

    #[test]
    fn test_descriptions_match_registry() {
        let names: Vec<String> = BUILTIN_TASKS.iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(registry().unwrap().names(), names);
    }

    #[test]
    fn test_rank_and_world_size() {
        assert_eq!(call("rank", 3, CallArgs::new()), Ok(json!(3)));
        assert_eq!(call("world_size", 0, CallArgs::new()), Ok(json!(5)));
    }

    #[test]
    fn test_arithmetic_tasks() {
        let args = CallArgs::positional(vec![json!(1), json!(2), json!(3)]);
        assert_eq!(call("sum", 0, args), Ok(json!(6)));
        assert_eq!(call("square", 3, CallArgs::new()), Ok(json!(9)));
        assert_eq!(call("square", 0, CallArgs::new().with_arg(-4)), Ok(json!(16)));
        assert!(call("square", 0, CallArgs::new().with_arg(i64::MAX)).is_err());
        assert!(matches!(
            call("sum", 0, CallArgs::new().with_arg("x")),
            Err(TaskError::InvalidArgs(_))
        ));
    }

    #[test]
    fn test_fail_on_targets_one_rank() {
        assert_eq!(call("fail_on", 0, CallArgs::new().with_arg(1)), Ok(json!("ok")));
        assert!(matches!(
            call("fail_on", 1, CallArgs::new().with_arg(1)),
            Err(TaskError::Failed(_))
        ));
    }

    #[test]
    fn test_echo() {
        let args = CallArgs::new().with_arg("a").with_arg(1);
        assert_eq!(call("echo", 0, args), Ok(json!(["a", 1])));
    }

    #[test]
    fn test_sleep_rejects_negative() {
        assert!(matches!(
            call("sleep_ms", 0, CallArgs::new().with_arg(-1)),
            Err(TaskError::InvalidArgs(_))
        ));
    }
}
