//! Rule engine for MQ System
//!
//! Stored Lua scripts react to values observed on the bus and to calendar
//! deadlines. Each script runs on its own thread with its own interpreter and
//! suspends only inside `wait_and` / `wait_or`.
//!
//! # Key Types
//!
//! - [`ExeService`] - lifecycle, bus callback and reload
//! - [`ScriptCatalog`] - stored scripts and their static scan
//! - [`WaitBroker`] - value and deadline indices that wake waiting scripts
//! - [`TimeExpr`] - `NOW ...` / `EVERY ...` expressions

mod cache;
mod catalog;
mod error;
mod globals;
mod os_lib;
mod runtime;
mod scanner;
mod scheduler;
mod service;
mod time_expr;
mod wait;

pub use cache::ValueCache;
pub use catalog::{devices_of, Script, ScriptCatalog};
pub use error::{
    ExeError, ExeResult, GlobalError, ScanError, ScanResult, TimeExprError, TimeExprResult,
    WaitError,
};
pub use globals::Globals;
pub use runtime::{ScriptEnv, ScriptRuntime, ValueHandle};
pub use scanner::ScriptScanner;
pub use scheduler::{TimeScheduler, TICK};
pub use service::ExeService;
pub use time_expr::{Calendar, DaySelector, TimeExpr, TimeUnit};
pub use wait::{WaitBroker, WaitMode, WaitSignal};
