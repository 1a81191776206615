//! Built-in `encap` processor: wraps [`ts_encap::Encapsulator`] to
//! multiplex a set of input PIDs into a single output PID, optionally
//! framed as PES/KLV.

use pipeline_core::args::{OptionSchema, OptionSpec, ParsedArgs};
use pipeline_core::{PluginContext, PluginError, PluginLifecycle, ProcessOutcome, ProcessorPlugin};
use ts_encap::{Encapsulator, PesMode, NO_PACK_DISTANCE};
use ts_packet::TsPacket;

pub struct EncapProcessor {
    encap: Encapsulator,
}

impl EncapProcessor {
    pub fn new() -> Self {
        EncapProcessor {
            encap: Encapsulator::new(0x1FFF),
        }
    }
}

impl Default for EncapProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLifecycle for EncapProcessor {
    fn name(&self) -> &str {
        "encap"
    }

    fn option_schema(&self) -> OptionSchema {
        OptionSchema::new(vec![
            OptionSpec::integer("pid").occurrences(1, 1),
            OptionSpec::integer("input-pid").occurrences(1, usize::MAX),
            OptionSpec::string("pes-mode").occurrences(0, 1),
            OptionSpec::flag("pack"),
            OptionSpec::integer("pack-distance").occurrences(0, 1),
            OptionSpec::integer("pcr-pid").occurrences(0, 1),
        ])
    }

    fn start(&mut self, args: &ParsedArgs, ctx: &PluginContext) -> Result<(), PluginError> {
        ctx.use_joint_termination(true);
        let output_pid = args
            .value_int("pid")
            .ok_or_else(|| PluginError::StartFailed("encap".into(), "missing --pid".into()))?;
        self.encap.reset(output_pid as u16);

        let input_pids = args.all_int("input-pid");
        if input_pids.is_empty() {
            return Err(PluginError::StartFailed("encap".into(), "no --input-pid given".into()));
        }
        self.encap.set_input_pids(input_pids.into_iter().map(|p| p as u16));

        match args.value_str("pes-mode") {
            None | Some("disabled") => self.encap.set_pes_mode(PesMode::Disabled),
            Some("fixed") => self.encap.set_pes_mode(PesMode::Fixed),
            Some("variable") => self.encap.set_pes_mode(PesMode::Variable),
            Some(other) => {
                return Err(PluginError::StartFailed(
                    "encap".into(),
                    format!("unknown --pes-mode '{other}'"),
                ))
            }
        }

        let pack_distance = args
            .value_int("pack-distance")
            .map(|v| v as usize)
            .unwrap_or(NO_PACK_DISTANCE);
        self.encap.set_packing(args.present("pack"), pack_distance);
        if let Some(pcr_pid) = args.value_int("pcr-pid") {
            self.encap.set_reference_pcr(Some(pcr_pid as u16));
        }
        Ok(())
    }
}

impl ProcessorPlugin for EncapProcessor {
    fn process(&mut self, packet: &mut TsPacket, _ctx: &PluginContext) -> Result<ProcessOutcome, PluginError> {
        self.encap
            .process_packet(packet)
            .map_err(|e| PluginError::Write("encap".into(), e.to_string()))?;
        Ok(ProcessOutcome::Keep)
    }
}
