//! Plugin contract, ring buffer/scheduler, declarative argument model,
//! reporting, and pipeline configuration shared by the supervisor and
//! every plugin it loads.

pub mod args;
pub mod config;
pub mod plugin;
pub mod report;
pub mod ring;
pub mod scheduler;

pub use args::{ArgsError, OptionSchema, OptionSpec, ParsedArgs, ValueKind};
pub use config::{PipelineConfig, PluginSpec};
pub use plugin::{
    InputPlugin, OutputPlugin, PluginContext, PluginError, PluginHandle, PluginLifecycle,
    PluginRole, ProcessOutcome, ProcessorPlugin,
};
pub use report::{Report, Severity, TracingReport};
pub use ring::{Ring, Slot, SlotState, StageCursor};
pub use scheduler::Scheduler;
