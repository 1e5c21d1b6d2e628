//! One Lua interpreter per script
//!
//! The interpreter gets the base, table, string, math, utf8 and coroutine
//! libraries plus the engine functions below. Once the engine starts
//! aborting, every protected call rethrows and an instruction hook raises
//! the abort, so a script cannot keep running past a stop.

use chrono::Local;
use mlua::{
    AnyUserData, Function, HookTriggers, Lua, LuaOptions, MetaMethod, MultiValue, RegistryKey,
    StdLib, UserData, UserDataMethods, Value, Variadic,
};
use mq_bus::{Bus, SharedBus};
use mq_core::{encode, DevicePath, Message, Reading, Scalar, ValueRef};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::ValueCache;
use crate::catalog::Script;
use crate::error::{ExeError, ExeResult, WaitError};
use crate::globals::Globals;
use crate::os_lib;
use crate::time_expr::TimeExpr;
use crate::wait::{WaitBroker, WaitMode};

/// Instructions between abort checks
const HOOK_INSTRUCTIONS: u32 = 10_000;

/// Protected calls rethrow once the engine aborts
const PRELUDE: &str = r#"
local check = ...
local raw_pcall, raw_xpcall, raw_resume = pcall, xpcall, coroutine.resume
pcall = function(...) return check(raw_pcall(...)) end
xpcall = function(...) return check(raw_xpcall(...)) end
coroutine.resume = function(...) return check(raw_resume(...)) end
dofile, loadfile = nil, nil
"#;

/// Shared engine state handed to every interpreter
#[derive(Clone)]
pub struct ScriptEnv {
    pub bus: SharedBus,
    pub broker: Arc<WaitBroker>,
    pub cache: Arc<ValueCache>,
    pub globals: Arc<Globals>,
    /// Devices the engine subscribed to for this generation
    pub devices: Arc<BTreeSet<DevicePath>>,
}

/// Opaque handle returned by `register_value`
#[derive(Debug, Clone)]
pub struct ValueHandle(pub ValueRef);

impl UserData for ValueHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| Ok(this.0.to_string()));
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<ValueHandle>()
                .map(|other| other.0 == this.0)
                .unwrap_or(false))
        });
    }
}

fn runtime_error(message: impl Into<String>) -> mlua::Error {
    mlua::Error::RuntimeError(message.into())
}

fn aborted() -> mlua::Error {
    mlua::Error::external(WaitError::Aborted)
}

fn bad_argument(function: &str, position: usize, expected: &str, got: &Value) -> mlua::Error {
    runtime_error(format!(
        "{function}: bad argument #{position} ({expected} expected, got {})",
        got.type_name()
    ))
}

fn expect_count(function: &str, args: &[Value], count: usize) -> mlua::Result<()> {
    if args.len() != count {
        return Err(runtime_error(format!(
            "{function}: expected {count} argument(s), got {}",
            args.len()
        )));
    }
    Ok(())
}

fn handle_of(function: &str, position: usize, arg: &Value) -> mlua::Result<ValueRef> {
    match arg {
        Value::UserData(data) => data
            .borrow::<ValueHandle>()
            .map(|handle| handle.0.clone())
            .map_err(|_| bad_argument(function, position, "value handle", arg)),
        other => Err(bad_argument(function, position, "value handle", other)),
    }
}

/// A handle or a `device:value` string
fn target_of(function: &str, arg: &Value) -> mlua::Result<ValueRef> {
    match arg {
        Value::String(text) => {
            let text = text.to_str()?;
            text.parse()
                .map_err(|e| runtime_error(format!("{function}: '{text}': {e}")))
        }
        Value::UserData(_) => handle_of(function, 1, arg),
        other => Err(bad_argument(function, 1, "value reference", other)),
    }
}

fn scalar_of(function: &str, position: usize, arg: &Value) -> mlua::Result<Scalar> {
    match arg {
        Value::Boolean(b) => Ok(Scalar::Bool(*b)),
        Value::Integer(i) => Ok(Scalar::Int(*i)),
        Value::Number(n) => Ok(Scalar::Float(*n)),
        other => Err(bad_argument(function, position, "boolean or number", other)),
    }
}

fn lua_value<'lua>(scalar: Option<Scalar>) -> Value<'lua> {
    match scalar {
        Some(Scalar::Bool(b)) => Value::Boolean(b),
        Some(Scalar::Int(i)) => Value::Integer(i),
        Some(Scalar::Float(f)) => Value::Number(f),
        Some(Scalar::Str(_)) | None => Value::Nil,
    }
}

fn render_args(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.to_string_lossy().into_owned(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Nil => "nil".to_string(),
            Value::UserData(data) => data
                .borrow::<ValueHandle>()
                .map(|handle| handle.0.to_string())
                .unwrap_or_else(|_| "userdata".to_string()),
            other => other.type_name().to_string(),
        })
        .collect()
}

fn wait(broker: &WaitBroker, function: &str, mode: WaitMode, args: &[Value]) -> mlua::Result<()> {
    let now = Local::now();
    let mut values = Vec::new();
    let mut deadlines = Vec::new();

    for (index, arg) in args.iter().enumerate() {
        match arg {
            Value::UserData(_) => values.push(handle_of(function, index + 1, arg)?),
            Value::String(text) => {
                let text = text.to_str()?;
                let deadline = TimeExpr::parse(text)
                    .and_then(|expr| expr.deadline(now))
                    .map_err(|e| runtime_error(format!("{function}: {e}")))?;
                deadlines.push(deadline);
            }
            other => {
                return Err(bad_argument(
                    function,
                    index + 1,
                    "value handle or time expression",
                    other,
                ))
            }
        }
    }
    if values.is_empty() && deadlines.is_empty() {
        return Err(runtime_error(format!("{function}: nothing to wait for")));
    }
    broker
        .wait(&values, &deadlines, mode)
        .map_err(mlua::Error::external)
}

fn publish(bus: &SharedBus, script: &str, topic: &str, value: &ValueRef, scalar: Scalar) -> mlua::Result<()> {
    let message = Message::new().with(value.name(), Reading::new(scalar));
    let payload = encode(&message).map_err(|e| runtime_error(e.to_string()))?;
    if let Err(e) = bus.publish(topic, &payload) {
        warn!(script, topic, error = %e, "Publish failed, message dropped");
    }
    Ok(())
}

fn register_library(lua: &Lua, script: &str, env: &ScriptEnv) -> mlua::Result<()> {
    let globals = lua.globals();

    for (function, warning) in [("debug", false), ("warn", true)] {
        let script = script.to_string();
        globals.set(
            function,
            lua.create_function(move |_, args: Variadic<Value>| {
                let text = render_args(&args);
                if warning {
                    warn!(target: "mq_exe::lua", script = %script, "{text}");
                } else {
                    debug!(target: "mq_exe::lua", script = %script, "{text}");
                }
                Ok(())
            })?,
        )?;
    }
    globals.set("print", globals.get::<_, Function>("debug")?)?;

    let devices = Arc::clone(&env.devices);
    let owner = script.to_string();
    globals.set(
        "register_value",
        lua.create_function(move |_, args: Variadic<Value>| {
            args.iter()
                .enumerate()
                .map(|(index, arg)| {
                    let Value::String(text) = arg else {
                        return Err(bad_argument("register_value", index + 1, "string", arg));
                    };
                    let text = text.to_str()?;
                    let value: ValueRef = text
                        .parse()
                        .map_err(|e| runtime_error(format!("register_value: '{text}': {e}")))?;
                    if !devices.contains(value.device()) {
                        warn!(script = %owner, value = %value, "Value was not found by the scan, it is not subscribed");
                    }
                    trace!(script = %owner, value = %value, "Registered value");
                    Ok(ValueHandle(value))
                })
                .collect::<mlua::Result<Variadic<ValueHandle>>>()
        })?,
    )?;

    let cache = Arc::clone(&env.cache);
    globals.set(
        "request_value",
        lua.create_function(move |_, args: Variadic<Value>| {
            args.iter()
                .enumerate()
                .map(|(index, arg)| {
                    let value = handle_of("request_value", index + 1, arg)?;
                    Ok(lua_value(cache.get(&value)))
                })
                .collect::<mlua::Result<Variadic<Value>>>()
        })?,
    )?;

    for (function, mode) in [("wait_and", WaitMode::All), ("wait_or", WaitMode::Any)] {
        let broker = Arc::clone(&env.broker);
        globals.set(
            function,
            lua.create_function(move |_, args: Variadic<Value>| wait(&broker, function, mode, &args))?,
        )?;
    }

    for (function, report) in [("write_value", false), ("report_value", true)] {
        let bus = Arc::clone(&env.bus);
        let owner = script.to_string();
        globals.set(
            function,
            lua.create_function(move |_, args: Variadic<Value>| {
                expect_count(function, &args, 2)?;
                let value = target_of(function, &args[0])?;
                let scalar = scalar_of(function, 2, &args[1])?;
                let topic = if report {
                    value.status_topic()
                } else {
                    value.set_topic()
                };
                publish(&bus, &owner, &topic, &value, scalar)
            })?,
        )?;
    }

    let shared = Arc::clone(&env.globals);
    globals.set(
        "set_global",
        lua.create_function(move |_, args: Variadic<Value>| {
            expect_count("set_global", &args, 2)?;
            let Value::String(name) = &args[0] else {
                return Err(bad_argument("set_global", 1, "string", &args[0]));
            };
            let scalar = scalar_of("set_global", 2, &args[1])?;
            shared
                .set(name.to_str()?, scalar)
                .map_err(|e| runtime_error(format!("set_global: {e}")))
        })?,
    )?;

    let shared = Arc::clone(&env.globals);
    globals.set(
        "get_global",
        lua.create_function(move |_, args: Variadic<Value>| {
            expect_count("get_global", &args, 1)?;
            let Value::String(name) = &args[0] else {
                return Err(bad_argument("get_global", 1, "string", &args[0]));
            };
            Ok(lua_value(shared.get(name.to_str()?)))
        })?,
    )?;

    os_lib::register(lua, Instant::now())?;

    let broker = Arc::clone(&env.broker);
    let check = lua.create_function(move |_, results: MultiValue| {
        if broker.is_aborting() {
            return Err(aborted());
        }
        Ok(results)
    })?;
    lua.load(PRELUDE).set_name("prelude").call::<_, ()>(check)?;

    let broker = Arc::clone(&env.broker);
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS),
        move |_, _| {
            if broker.is_aborting() {
                return Err(aborted());
            }
            Ok(())
        },
    );
    Ok(())
}

/// A compiled script ready to run on its own thread
pub struct ScriptRuntime {
    name: String,
    lua: Lua,
    entry: RegistryKey,
    broker: Arc<WaitBroker>,
}

impl ScriptRuntime {
    /// Build the interpreter and compile the body; syntax errors surface here
    pub fn compile(script: &Script, env: &ScriptEnv) -> ExeResult<Self> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE,
            LuaOptions::new(),
        )?;
        register_library(&lua, &script.name, env)?;

        let function = lua
            .load(script.body.as_str())
            .set_name(script.name.as_str())
            .into_function()
            .map_err(|e| match e {
                mlua::Error::SyntaxError { message, .. } => ExeError::Syntax {
                    name: script.name.clone(),
                    message,
                },
                other => ExeError::Lua(other),
            })?;
        let entry = lua.create_registry_value(function)?;

        Ok(Self {
            name: script.name.clone(),
            lua,
            entry,
            broker: Arc::clone(&env.broker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the script to completion; failures are logged
    pub fn run(self) {
        info!(script = %self.name, "Script started");
        let result = self
            .lua
            .registry_value::<Function>(&self.entry)
            .and_then(|function| function.call::<_, ()>(()));

        match result {
            Ok(()) => info!(script = %self.name, "Script finished"),
            Err(_) if self.broker.is_aborting() => {
                warn!(script = %self.name, "Script aborted");
            }
            Err(e) => warn!(script = %self.name, error = %e, "Script failed"),
        }
    }
}
