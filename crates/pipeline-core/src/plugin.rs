//! The plugin contract: the traits a concrete input/processor/output
//! implements, and the tagged variant the supervisor stores them behind.
//!
//! A pipeline is built from exactly one input, zero or more processors in
//! declared order, and exactly one output. Each concrete plugin type is
//! known only to the binary that registers it (the core library never
//! enumerates "all plugins"), so the tagged variant here wraps a trait
//! object rather than a closed set of concrete types.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use ts_packet::TsPacket;

use crate::args::{ArgsError, OptionSchema, ParsedArgs};
use crate::scheduler::Scheduler;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0}: start failed: {1}")]
    StartFailed(String, String),
    #[error("plugin {0}: stop failed: {1}")]
    StopFailed(String, String),
    #[error("plugin {0}: read error: {1}")]
    Read(String, String),
    #[error("plugin {0}: write error: {1}")]
    Write(String, String),
    #[error(transparent)]
    Args(#[from] ArgsError),
}

/// Outcome of feeding one packet through a processor plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Pass the (possibly modified) packet downstream unchanged in kind.
    Keep,
    /// Replace the packet with a null (PID 0x1FFF) packet.
    Null,
    /// Remove the packet from the stream entirely.
    Drop,
    /// Pass the packet downstream and also signal a flush of any buffered
    /// internal state (used by plugins like the encapsulator).
    Flush,
}

/// Default advisory stack size handed to plugins that don't override
/// [`PluginLifecycle::stack_hint`].
pub const DEFAULT_STACK_HINT: usize = 128 * 1024;

/// A stage's view onto pipeline-wide control state: abort flag, current
/// pipeline bitrate, the realtime hint from the global command line, and
/// the joint-termination primitives described in spec §4.6. Handed to
/// every lifecycle call so a plugin never needs to reach into the
/// scheduler directly.
#[derive(Clone)]
pub struct PluginContext {
    scheduler: Arc<Scheduler>,
    stage_index: usize,
    realtime: bool,
}

impl PluginContext {
    pub fn new(scheduler: Arc<Scheduler>, stage_index: usize, realtime: bool) -> Self {
        PluginContext {
            scheduler,
            stage_index,
            realtime,
        }
    }

    pub fn aborting(&self) -> bool {
        self.scheduler.is_aborted()
    }

    pub fn pipeline_bitrate(&self) -> Option<u64> {
        self.scheduler.bitrate()
    }

    pub fn realtime(&self) -> bool {
        self.realtime
    }

    /// Opt this stage in (or out) of joint termination: the pipeline is
    /// not considered finished until every opted-in stage has also called
    /// [`Self::joint_terminate`].
    pub fn use_joint_termination(&self, on: bool) {
        if on {
            self.scheduler.join_termination_set(self.stage_index);
        } else {
            self.scheduler.join_termination_unset(self.stage_index);
        }
    }

    /// Report that this stage, having opted into joint termination, is
    /// now done.
    pub fn joint_terminate(&self) {
        self.scheduler.mark_terminated(self.stage_index);
    }
}

/// Lifecycle every plugin kind shares: named, configured from parsed
/// arguments, started, and stopped.
pub trait PluginLifecycle: Send {
    /// Plugin name as given on the command line (`-I file`, `-P drop`, ...).
    fn name(&self) -> &str;

    /// Declarative schema of this plugin's own options, used to validate
    /// and parse its argument vector before `start`.
    fn option_schema(&self) -> OptionSchema {
        OptionSchema::empty()
    }

    /// Called once before the pipeline starts producing/consuming
    /// packets. `args` holds this plugin's own parsed options; `ctx`
    /// gives access to pipeline-wide control state (e.g. to opt into
    /// joint termination).
    fn start(&mut self, args: &ParsedArgs, ctx: &PluginContext) -> Result<(), PluginError>;

    /// Called once after the pipeline has stopped, in reverse start order
    /// relative to its siblings (supervisor's responsibility, not the
    /// plugin's).
    fn stop(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    /// Advises the supervisor on scheduling defaults (e.g. whether to
    /// favor low-latency polling over throughput). Default: not realtime.
    fn is_realtime(&self) -> bool {
        false
    }

    /// Advisory stack size for this plugin's worker thread.
    fn stack_hint(&self) -> usize {
        DEFAULT_STACK_HINT
    }
}

pub trait InputPlugin: PluginLifecycle {
    /// Fill one packet. Returns `Ok(false)` at end of stream.
    fn read_packet(&mut self, packet: &mut TsPacket, ctx: &PluginContext) -> Result<bool, PluginError>;

    /// Current bitrate estimate in bits/second, if known (spec §4.6's
    /// "pipeline bitrate" comes from here when available, else from the
    /// PCR analyzer fallback).
    fn bitrate_hint(&self) -> Option<u64> {
        None
    }
}

pub trait ProcessorPlugin: PluginLifecycle {
    fn process(&mut self, packet: &mut TsPacket, ctx: &PluginContext) -> Result<ProcessOutcome, PluginError>;

    /// Current bitrate estimate in bits/second, if this processor is in a
    /// position to know one (e.g. it sits downstream of a PCR reference
    /// PID). Participates in the output-upwards bitrate propagation scan.
    fn bitrate_hint(&self) -> Option<u64> {
        None
    }
}

pub trait OutputPlugin: PluginLifecycle {
    fn write_packet(&mut self, packet: &TsPacket, ctx: &PluginContext) -> Result<(), PluginError>;

    fn bitrate_hint(&self) -> Option<u64> {
        None
    }
}

/// One stage's slot in the pipeline: tagged by role, carrying the boxed
/// trait object. This is the idiomatic Rust shape of "a tagged variant
/// carrying a trait/interface object" — a closed 3-arm enum around an
/// open, binary-local set of concrete implementations.
pub enum PluginRole {
    Input(Box<dyn InputPlugin>),
    Processor(Box<dyn ProcessorPlugin>),
    Output(Box<dyn OutputPlugin>),
}

impl PluginRole {
    pub fn name(&self) -> &str {
        match self {
            PluginRole::Input(p) => p.name(),
            PluginRole::Processor(p) => p.name(),
            PluginRole::Output(p) => p.name(),
        }
    }

    pub fn option_schema(&self) -> OptionSchema {
        match self {
            PluginRole::Input(p) => p.option_schema(),
            PluginRole::Processor(p) => p.option_schema(),
            PluginRole::Output(p) => p.option_schema(),
        }
    }

    pub fn start(&mut self, args: &ParsedArgs, ctx: &PluginContext) -> Result<(), PluginError> {
        match self {
            PluginRole::Input(p) => p.start(args, ctx),
            PluginRole::Processor(p) => p.start(args, ctx),
            PluginRole::Output(p) => p.start(args, ctx),
        }
    }

    pub fn stop(&mut self) -> Result<(), PluginError> {
        match self {
            PluginRole::Input(p) => p.stop(),
            PluginRole::Processor(p) => p.stop(),
            PluginRole::Output(p) => p.stop(),
        }
    }

    pub fn is_realtime(&self) -> bool {
        match self {
            PluginRole::Input(p) => p.is_realtime(),
            PluginRole::Processor(p) => p.is_realtime(),
            PluginRole::Output(p) => p.is_realtime(),
        }
    }

    pub fn stack_hint(&self) -> usize {
        match self {
            PluginRole::Input(p) => p.stack_hint(),
            PluginRole::Processor(p) => p.stack_hint(),
            PluginRole::Output(p) => p.stack_hint(),
        }
    }

    /// Bitrate this stage can report, if any, used by the output-upwards
    /// bitrate propagation scan (spec §4.6).
    pub fn bitrate_hint(&self) -> Option<u64> {
        match self {
            PluginRole::Input(p) => p.bitrate_hint(),
            PluginRole::Processor(p) => p.bitrate_hint(),
            PluginRole::Output(p) => p.bitrate_hint(),
        }
    }
}

impl fmt::Debug for PluginRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            PluginRole::Input(_) => "Input",
            PluginRole::Processor(_) => "Processor",
            PluginRole::Output(_) => "Output",
        };
        write!(f, "PluginRole::{kind}({})", self.name())
    }
}

/// Bookkeeping the supervisor keeps per plugin instance, independent of
/// its concrete role: position in the pipeline, suspend state, and the
/// raw argument vector it was built from (kept for `restart`).
pub struct PluginHandle {
    pub role: PluginRole,
    pub stage_index: usize,
    pub suspended: bool,
    pub raw_args: Vec<String>,
}

impl PluginHandle {
    pub fn new(role: PluginRole, stage_index: usize, raw_args: Vec<String>) -> Self {
        PluginHandle {
            role,
            stage_index,
            suspended: false,
            raw_args,
        }
    }
}
