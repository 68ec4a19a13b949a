//! psysh CLI - interactive shell with crash recovery and live reloading.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use psysh_core::value::{ArrayKey, Object, Value};
use psysh_core::{
    ExecutionLoop, Listener, LiveReloader, ProcessForker, RawStdin, ScopeVariables, Session, Shell,
    SignalHandler,
};

/// Exit status of a session ended by a fatal error.
const FATAL_EXIT_CODE: i32 = 255;

const PANIC_EXIT_CODE: i32 = 101;

#[derive(Parser)]
#[command(name = "psysh")]
#[command(about = "Interactive shell with crash recovery and live reloading")]
#[command(version)]
struct Cli {
    /// Files to include before the first prompt
    includes: Vec<PathBuf>,

    /// Evaluate in this process instead of a forked worker
    #[arg(long)]
    no_fork: bool,

    /// Do not reload modified files
    #[arg(long)]
    no_reload: bool,

    /// Print the final scope variables as JSON on exit
    #[arg(long)]
    dump_scope: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    // The interpreter recurses once per nested user call; give it room.
    const STACK_SIZE: usize = 64 * 1024 * 1024; // 64 MiB
    let builder = std::thread::Builder::new()
        .name("psysh-main".into())
        .stack_size(STACK_SIZE);
    // Exit from the spawned thread itself: in forked children it is the
    // only thread, and a process whose last thread returns exits with 0.
    let spawned = builder.spawn(|| {
        let code = std::panic::catch_unwind(psysh_main).unwrap_or(PANIC_EXIT_CODE);
        std::process::exit(code)
    });
    let handler = match spawned {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("Error: failed to spawn main thread: {}", e);
            std::process::exit(1);
        }
    };
    // The closure never returns, so joining only ever yields a panic.
    let Err(e) = handler.join();
    std::panic::resume_unwind(e);
}

fn psysh_main() -> i32 {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            let err = match err.downcast_ref::<psysh_core::Error>() {
                Some(core_err) if core_err.is_fatal() => return FATAL_EXIT_CODE,
                Some(core_err) => anyhow::anyhow!("{}", core_err.with_hint()),
                None => err,
            };
            eprintln!("Error: {:#}", err);
            1
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let mut session = Session::new(RawStdin, std::io::stdout()).with_includes(cli.includes.clone());
    // SAFETY: isatty has no memory-safety preconditions.
    if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
        session = session.with_prompt(">>> ");
    }

    let interrupt = session.interrupt_handle();
    let mut execution = ExecutionLoop::new();

    let forker = ProcessForker::new(interrupt.clone());
    if !cli.no_fork && forker.is_supported() {
        execution.add_listener(forker);
    } else {
        execution.add_listener(SignalHandler::new(interrupt));
    }

    if !cli.no_reload && session.code_patcher().is_supported() {
        let reloader = Rc::new(RefCell::new(LiveReloader::new()));
        session.attach_reloader(Rc::clone(&reloader));
        execution.add_listener(reloader);
    }

    tracing::debug!("Starting session with {} listeners", execution.listener_count());
    let code = execution.run(&mut session)?;

    if cli.dump_scope {
        let scope = scope_to_json(&session.scope_variables(false));
        println!("{}", serde_json::to_string(&scope)?);
    }
    Ok(code)
}

fn scope_to_json(vars: &ScopeVariables) -> serde_json::Value {
    serde_json::Value::Object(
        vars.iter()
            .map(|(name, value)| (name.clone(), to_json(value, &mut Vec::new())))
            .collect(),
    )
}

/// Plain JSON rendering of a scope value. An object met again inside itself
/// renders as `null`; `open` holds the objects being rendered.
fn to_json(value: &Value, open: &mut Vec<*const RefCell<Object>>) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null | Value::Closure(_) | Value::Resource(_) => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.clone()),
        Value::Array(array) => {
            let is_list = array
                .iter()
                .enumerate()
                .all(|(i, (key, _))| *key == ArrayKey::Int(i as i64));
            if is_list {
                Json::Array(array.values().map(|item| to_json(item, open)).collect())
            } else {
                Json::Object(
                    array
                        .iter()
                        .map(|(key, item)| {
                            let key = match key {
                                ArrayKey::Int(i) => i.to_string(),
                                ArrayKey::Str(s) => s.clone(),
                            };
                            (key, to_json(item, open))
                        })
                        .collect(),
                )
            }
        }
        Value::Object(object) => {
            let ptr = Rc::as_ptr(object);
            if open.contains(&ptr) {
                return Json::Null;
            }
            open.push(ptr);
            let object = object.borrow();
            let mut map = serde_json::Map::new();
            map.insert("__class".into(), Json::String(object.class.clone()));
            for (name, property) in &object.properties {
                map.insert(name.clone(), to_json(property, open));
            }
            open.pop();
            Json::Object(map)
        }
        Value::Enum(case) => Json::String(format!("{}::{}", case.enum_name, case.case)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use psysh_core::value::ArrayValue;

    #[test]
    fn test_to_json() {
        let mut vars = ScopeVariables::new();
        vars.insert("n".into(), Value::Int(3));
        vars.insert(
            "list".into(),
            Value::Array(ArrayValue::from_list([Value::string("a"), Value::Bool(false)])),
        );
        let mut map = ArrayValue::new();
        map.insert(ArrayKey::Str("k".into()), Value::Float(0.5));
        vars.insert("map".into(), Value::Array(map));

        let json = scope_to_json(&vars);
        assert_eq!(json.to_string(), r#"{"list":["a",false],"map":{"k":0.5},"n":3}"#);
    }

    #[test]
    fn test_to_json_stops_at_cycles() {
        let object = Rc::new(RefCell::new(Object {
            class: "Node".into(),
            properties: Default::default(),
        }));
        object
            .borrow_mut()
            .properties
            .insert("me".into(), Value::Object(Rc::clone(&object)));

        let mut vars = ScopeVariables::new();
        vars.insert("a".into(), Value::Object(Rc::clone(&object)));
        let json = scope_to_json(&vars);
        assert_eq!(json.to_string(), r#"{"a":{"__class":"Node","me":null}}"#);

        object.borrow_mut().properties.clear();
    }
}
