#![doc = include_str!("../../../README.md")]

mod attr;
mod config;
mod error;
mod handle;
mod ids;
pub mod local;
mod lock;
mod marshal;
mod module;
mod native;
mod registry;
mod session;
mod stats;
pub mod tracer;
mod value;

pub use crate::{
    config::{BridgeConfig, DEFAULT_MAX_RESULT_DEPTH},
    error::{BridgeError, BridgeResult, InvalidState, NativeError},
    handle::Handle,
    ids::{EpochId, NativeId},
    marshal::NATIVE_PANIC,
    module::Module,
    native::{NativeArg, NativeInterpreter, NativeValue},
    registry::{BuiltinName, HelperName},
    session::{Session, SessionBuilder},
    stats::BridgeStats,
    tracer::{BridgeTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    value::HostValue,
};
