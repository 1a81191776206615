//! Builds a pipeline from parsed plugin specs and runs it as one OS
//! thread per stage, all synchronized through the shared ring.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipeline_core::ring::SlotState;
use pipeline_core::{
    InputPlugin, OutputPlugin, ParsedArgs, PipelineConfig, PluginContext, PluginError,
    PluginHandle, PluginRole, ProcessorPlugin, Report, Ring, Scheduler, StageCursor,
    TracingReport,
};

use crate::plugins;

/// How long a suspended processor's polling loop sleeps between checks of
/// upstream progress, resume, and abort.
const SUSPEND_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Args(#[from] pipeline_core::ArgsError),
    #[error("worker thread for stage {0} panicked")]
    WorkerPanicked(usize),
}

/// Owns the ring, the scheduler, and every plugin handle; `run` drives
/// the pipeline to completion (or abort) and returns a process exit code:
/// 0 clean, 1 warnings reported, 2 errors reported or a stage failed.
pub struct Supervisor {
    ring: Arc<Ring>,
    scheduler: Arc<Scheduler>,
    report: Arc<TracingReport>,
    handles: Vec<PluginHandle>,
    realtime: bool,
}

impl Supervisor {
    pub fn build(config: &PipelineConfig) -> Result<Self, SupervisorError> {
        let stage_count = config.stage_count();
        let ring = Ring::new(config.ring_capacity, stage_count);
        let scheduler = Arc::new(Scheduler::new());
        let report = Arc::new(TracingReport::new());

        if let Some(bps) = config.bitrate_override {
            scheduler.set_bitrate(bps);
        }

        let mut handles = Vec::with_capacity(stage_count);

        let input_role = plugins::input_role(&config.input.name)?;
        handles.push(PluginHandle::new(input_role, 0, config.input.args.clone()));

        for (i, spec) in config.processors.iter().enumerate() {
            let role = plugins::processor_role(&spec.name)?;
            handles.push(PluginHandle::new(role, i + 1, spec.args.clone()));
        }

        let output_role = plugins::output_role(&config.output.name)?;
        handles.push(PluginHandle::new(output_role, stage_count - 1, config.output.args.clone()));

        Ok(Supervisor {
            ring,
            scheduler,
            report,
            handles,
            realtime: config.realtime,
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        Arc::clone(&self.scheduler)
    }

    pub fn report(&self) -> Arc<TracingReport> {
        Arc::clone(&self.report)
    }

    pub fn stage_count(&self) -> usize {
        self.handles.len()
    }

    /// Start every plugin in declared order, parsing each one's own
    /// argument vector against its own schema first.
    fn start_all(&mut self) -> Result<(), SupervisorError> {
        let scheduler = Arc::clone(&self.scheduler);
        for handle in self.handles.iter_mut() {
            let schema = handle.role.option_schema();
            let parsed: ParsedArgs = pipeline_core::args::parse(&handle.raw_args, &schema)?;
            let ctx = PluginContext::new(Arc::clone(&scheduler), handle.stage_index, self.realtime);
            handle.role.start(&parsed, &ctx).map_err(|e| {
                tracing::error!(stage = handle.stage_index, error = %e, "plugin failed to start");
                e
            })?;
        }
        Ok(())
    }

    /// Stop every plugin in reverse start order; a failure at one stage
    /// does not prevent the others from being given a chance to stop.
    fn stop_all(&mut self) {
        for handle in self.handles.iter_mut().rev() {
            if let Err(e) = handle.role.stop() {
                tracing::warn!(stage = handle.stage_index, error = %e, "plugin failed to stop cleanly");
            }
        }
    }

    /// Run the pipeline to completion. Consumes `self` since plugin
    /// handles are moved into worker threads.
    pub fn run(mut self) -> Result<i32, SupervisorError> {
        self.start_all()?;

        let stage_count = self.handles.len();
        let ring = Arc::clone(&self.ring);
        let scheduler = Arc::clone(&self.scheduler);
        let report = Arc::clone(&self.report);
        let realtime = self.realtime;

        let mut handles_by_stage: Vec<Option<PluginHandle>> =
            self.handles.drain(..).map(Some).collect();

        let mut workers = Vec::with_capacity(stage_count);
        for stage_index in 0..stage_count {
            let handle = handles_by_stage[stage_index].take().unwrap();
            let ring = Arc::clone(&ring);
            let scheduler = Arc::clone(&scheduler);
            let report = Arc::clone(&report);
            let is_output = stage_index == stage_count - 1;
            let stack_hint = handle.role.stack_hint();
            let builder = thread::Builder::new()
                .name(format!("tsflow-stage-{stage_index}"))
                .stack_size(stack_hint);
            let spawned = builder.spawn(move || {
                run_stage(handle, ring, scheduler, report, is_output, realtime)
            });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!(stage = stage_index, error = %e, "failed to spawn stage thread");
                    self.scheduler.signal_abort();
                    return Err(SupervisorError::WorkerPanicked(stage_index));
                }
            }
        }

        let mut panicked = None;
        for (i, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                panicked = Some(i);
            }
        }
        if let Some(i) = panicked {
            self.scheduler.signal_abort();
            return Err(SupervisorError::WorkerPanicked(i));
        }

        Ok(self.report.exit_code())
    }
}

/// Busy-poll a suspended processor's cursor forward in lockstep with its
/// upstream neighbor, bypassing the plugin entirely so packets pass
/// through untouched while suspended. Returns `true` if the pipeline
/// aborted while waiting, `false` once the stage has been resumed.
fn suspend_until_resumed_or_abort(cursor: &mut StageCursor, ring: &Ring, scheduler: &Scheduler) -> bool {
    loop {
        if scheduler.is_aborted() {
            return true;
        }
        if !scheduler.is_suspended(cursor.stage_index()) {
            return false;
        }
        let upstream = ring.completed(cursor.stage_index() - 1);
        if upstream > cursor.position() {
            cursor.skip_to(upstream);
        } else {
            thread::sleep(SUSPEND_POLL_INTERVAL);
        }
    }
}

fn restart_handle(
    handle: &mut PluginHandle,
    new_args: Vec<String>,
    ctx: &PluginContext,
    report: &TracingReport,
) -> Result<(), PluginError> {
    let _ = handle.role.stop();
    let schema = handle.role.option_schema();
    let parsed = pipeline_core::args::parse(&new_args, &schema)?;
    handle.role.start(&parsed, ctx)?;
    handle.raw_args = new_args;
    report.info(&format!(
        "stage {} ({}) restarted",
        handle.stage_index,
        handle.role.name()
    ));
    Ok(())
}

fn run_stage(
    mut handle: PluginHandle,
    ring: Arc<Ring>,
    scheduler: Arc<Scheduler>,
    report: Arc<TracingReport>,
    is_output: bool,
    realtime: bool,
) {
    let mut cursor = ring.cursor(handle.stage_index);
    let abort = || scheduler.is_aborted();
    let ctx = PluginContext::new(Arc::clone(&scheduler), handle.stage_index, realtime);
    let is_processor = matches!(handle.role, PluginRole::Processor(_));

    loop {
        // Joint termination is a barrier: once every opted-in stage has
        // reported done, raise the abort signal so every stage (opted in
        // or not) unblocks from its own wait.
        if scheduler.joint_termination_reached() {
            scheduler.signal_abort();
        }

        if let Some(new_args) = scheduler.take_restart_request(handle.stage_index) {
            if let Err(e) = restart_handle(&mut handle, new_args, &ctx, &report) {
                report.error(&format!("stage {} restart failed: {e}", handle.stage_index));
            }
        }

        if is_processor && scheduler.is_suspended(handle.stage_index) {
            if suspend_until_resumed_or_abort(&mut cursor, &ring, &scheduler) {
                break;
            }
            continue;
        }

        let idx = match cursor.wait_for_slot(&abort) {
            Some(idx) => idx,
            None => break,
        };

        let mut terminal = false;
        {
            let mut slot = cursor.slot(idx);
            match &mut handle.role {
                PluginRole::Input(input) => match input.read_packet(&mut slot.packet, &ctx) {
                    Ok(true) => slot.state = SlotState::Filled,
                    Ok(false) => {
                        slot.state = SlotState::Terminal;
                        terminal = true;
                    }
                    Err(e) => {
                        report.error(&format!("input read failed: {e}"));
                        slot.state = SlotState::Terminal;
                        terminal = true;
                    }
                },
                PluginRole::Processor(processor) => {
                    if slot.state == SlotState::Terminal {
                        terminal = true;
                    } else {
                        match processor.process(&mut slot.packet, &ctx) {
                            Ok(pipeline_core::ProcessOutcome::Keep) => slot.state = SlotState::Filled,
                            Ok(pipeline_core::ProcessOutcome::Flush) => {
                                slot.state = SlotState::Filled;
                                slot.flush_hint = true;
                            }
                            Ok(pipeline_core::ProcessOutcome::Null) => {
                                slot.packet.set_pid(ts_packet::PID_NULL);
                                slot.state = SlotState::Nulled;
                            }
                            Ok(pipeline_core::ProcessOutcome::Drop) => slot.state = SlotState::Dropped,
                            Err(e) => {
                                report.error(&format!("processor failed: {e}"));
                                slot.state = SlotState::Dropped;
                            }
                        }
                    }
                }
                PluginRole::Output(output) => {
                    if slot.state == SlotState::Terminal {
                        terminal = true;
                    } else if slot.state != SlotState::Dropped {
                        if let Err(e) = output.write_packet(&slot.packet, &ctx) {
                            report.error(&format!("output write failed: {e}"));
                        }
                    }
                }
            }
        }

        cursor.publish();

        // Bitrate propagation: any stage that can offer a hint contributes
        // it to the shared estimate (spec's "output upwards" scan reduces,
        // in this one-thread-per-stage model, to every stage offering its
        // own hint as soon as it has one; the output stage's hint is the
        // last to land for a given packet and so tends to win).
        if let Some(bps) = handle.role.bitrate_hint() {
            if bps > 0 {
                scheduler.set_bitrate(bps);
            }
        }
        if is_output && scheduler.take_bitrate_changed() {
            report.info(&format!(
                "pipeline bitrate now {} bit/s",
                scheduler.bitrate().unwrap_or(0)
            ));
        }

        if terminal {
            if scheduler.is_joint_member(handle.stage_index) {
                ctx.joint_terminate();
                if scheduler.joint_termination_reached() {
                    scheduler.signal_abort();
                    break;
                }
                // Other joint members haven't reached Terminal yet; this
                // stage has nothing left to read but must not tear the
                // pipeline down until they catch up.
                while !scheduler.is_aborted() && !scheduler.joint_termination_reached() {
                    thread::sleep(SUSPEND_POLL_INTERVAL);
                }
                scheduler.signal_abort();
                break;
            }
            if is_output {
                scheduler.mark_terminated(handle.stage_index);
            }
            break;
        }
    }

    let _ = handle.role.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::config::PluginSpec;

    #[test]
    fn builds_every_declared_stage() {
        let config = PipelineConfig::new(
            PluginSpec::new("file", vec!["--file".into(), "/nonexistent".into()]),
            vec![PluginSpec::new("drop", vec!["--pid".into(), "0x100".into()])],
            PluginSpec::new("file", vec!["--file".into(), "/dev/null".into()]),
        );
        let supervisor = Supervisor::build(&config).unwrap();
        assert_eq!(supervisor.handles.len(), 3);
    }

    #[test]
    fn unknown_plugin_name_is_rejected_at_build_time() {
        let config = PipelineConfig::new(
            PluginSpec::new("nonexistent", vec![]),
            vec![],
            PluginSpec::new("file", vec![]),
        );
        assert!(Supervisor::build(&config).is_err());
    }

    #[test]
    fn plain_copy_pipeline_runs_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("in.ts");
        let output_path = dir.path().join("out.ts");

        {
            use ts_io::TsFileWriter;
            use ts_packet::TsPacket;
            let mut packets = Vec::new();
            for i in 0..20u8 {
                let mut p = TsPacket::default();
                p.set_pid(0x200);
                p.set_cc(i % 16);
                packets.push(p);
            }
            let mut writer = TsFileWriter::open(input_path.to_str().unwrap(), false, false).unwrap();
            writer.write(&packets).unwrap();
        }

        let config = PipelineConfig::new(
            PluginSpec::new("file", vec!["--file".into(), input_path.to_str().unwrap().into()]),
            vec![],
            PluginSpec::new("file", vec!["--file".into(), output_path.to_str().unwrap().into()]),
        )
        .with_ring_capacity(4);

        let supervisor = Supervisor::build(&config).unwrap();
        let code = supervisor.run().unwrap();
        assert_eq!(code, 0);

        let written = std::fs::metadata(&output_path).unwrap().len();
        assert_eq!(written, 20 * ts_packet::PACKET_SIZE as u64);
    }

    #[test]
    fn bitrate_override_is_visible_before_run() {
        let config = PipelineConfig::new(
            PluginSpec::new("file", vec!["--file".into(), "/nonexistent".into()]),
            vec![],
            PluginSpec::new("file", vec!["--file".into(), "/dev/null".into()]),
        )
        .with_bitrate_override(12_345);
        let supervisor = Supervisor::build(&config).unwrap();
        assert_eq!(supervisor.scheduler().bitrate(), Some(12_345));
    }
}
