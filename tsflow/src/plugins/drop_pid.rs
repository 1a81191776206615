//! Built-in `drop` processor: removes packets on one or more PIDs from
//! the stream.

use pipeline_core::args::{OptionSchema, OptionSpec, ParsedArgs};
use pipeline_core::{PluginContext, PluginError, PluginLifecycle, ProcessOutcome, ProcessorPlugin};
use ts_packet::TsPacket;

pub struct DropByPid {
    pids: Vec<u16>,
}

impl DropByPid {
    pub fn new() -> Self {
        DropByPid { pids: Vec::new() }
    }
}

impl Default for DropByPid {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLifecycle for DropByPid {
    fn name(&self) -> &str {
        "drop"
    }

    fn option_schema(&self) -> OptionSchema {
        OptionSchema::new(vec![OptionSpec::integer("pid").occurrences(1, usize::MAX)])
    }

    fn start(&mut self, args: &ParsedArgs, _ctx: &PluginContext) -> Result<(), PluginError> {
        self.pids = args.all_int("pid").into_iter().map(|p| p as u16).collect();
        if self.pids.is_empty() {
            return Err(PluginError::StartFailed("drop".into(), "no PID given".into()));
        }
        Ok(())
    }
}

impl ProcessorPlugin for DropByPid {
    fn process(&mut self, packet: &mut TsPacket, _ctx: &PluginContext) -> Result<ProcessOutcome, PluginError> {
        if self.pids.contains(&packet.pid()) {
            Ok(ProcessOutcome::Drop)
        } else {
            Ok(ProcessOutcome::Keep)
        }
    }
}
