//! Top-level pipeline configuration: ring capacity, receive timeouts,
//! and the declared plugin chain, independent of how those plugins got
//! constructed (the supervisor owns that).

use std::time::Duration;

/// One `-I`/`-P`/`-O` entry as given on the command line: a plugin name
/// plus its own raw argument vector, not yet parsed against that
/// plugin's schema.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl PluginSpec {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        PluginSpec {
            name: name.into(),
            args,
        }
    }
}

/// The declared shape of one pipeline: exactly one input, any number of
/// processors in order, exactly one output.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input: PluginSpec,
    pub processors: Vec<PluginSpec>,
    pub output: PluginSpec,
    /// Number of slots in the shared ring buffer.
    pub ring_capacity: usize,
    /// How long the input stage may block on a single read before the
    /// pipeline treats it as stalled (diagnostic only; does not abort).
    pub receive_timeout: Option<Duration>,
    /// Maximum packets processed per scheduling quantum before yielding,
    /// bounding per-stage latency under contention.
    pub max_batch_size: usize,
    /// `--bitrate`: overrides any self-estimated pipeline bitrate.
    pub bitrate_override: Option<u64>,
    /// `--max-flushed-packets`: caps how many packets an output stage may
    /// hold before a flush is forced.
    pub max_flushed_packets: Option<usize>,
    /// `--max-input-packets`: caps how many packets the input stage may
    /// read ahead of the rest of the pipeline in one scheduling quantum.
    pub max_input_packets: Option<usize>,
    /// `--realtime`: advises every stage to favor low latency over
    /// throughput.
    pub realtime: bool,
    /// `--control-port`: a filesystem path (Unix domain socket) or a
    /// plain decimal TCP port number the control server listens on.
    pub control_port: Option<String>,
    /// `--verbose` occurrence count.
    pub verbose: u32,
    /// `--debug[=level]` level, if given.
    pub debug_level: Option<i64>,
}

pub const DEFAULT_RING_CAPACITY: usize = 512;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 16;

impl PipelineConfig {
    pub fn new(input: PluginSpec, processors: Vec<PluginSpec>, output: PluginSpec) -> Self {
        PipelineConfig {
            input,
            processors,
            output,
            ring_capacity: DEFAULT_RING_CAPACITY,
            receive_timeout: None,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            bitrate_override: None,
            max_flushed_packets: None,
            max_input_packets: None,
            realtime: false,
            control_port: None,
            verbose: 0,
            debug_level: None,
        }
    }

    pub fn with_ring_capacity(mut self, capacity: usize) -> Self {
        self.ring_capacity = capacity;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn with_bitrate_override(mut self, bps: u64) -> Self {
        self.bitrate_override = Some(bps);
        self
    }

    pub fn with_max_flushed_packets(mut self, count: usize) -> Self {
        self.max_flushed_packets = Some(count);
        self
    }

    pub fn with_max_input_packets(mut self, count: usize) -> Self {
        self.max_input_packets = Some(count);
        self
    }

    pub fn with_realtime(mut self, on: bool) -> Self {
        self.realtime = on;
        self
    }

    pub fn with_control_port(mut self, addr: impl Into<String>) -> Self {
        self.control_port = Some(addr.into());
        self
    }

    /// Total stage count: input, each processor, output.
    pub fn stage_count(&self) -> usize {
        2 + self.processors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_count_includes_input_and_output() {
        let cfg = PipelineConfig::new(
            PluginSpec::new("file", vec!["in.ts".into()]),
            vec![PluginSpec::new("drop", vec!["0x100".into()])],
            PluginSpec::new("file", vec!["out.ts".into()]),
        );
        assert_eq!(cfg.stage_count(), 3);
    }

    #[test]
    fn builder_overrides_defaults() {
        let cfg = PipelineConfig::new(
            PluginSpec::new("file", vec![]),
            vec![],
            PluginSpec::new("file", vec![]),
        )
        .with_ring_capacity(64)
        .with_receive_timeout(Duration::from_millis(500));
        assert_eq!(cfg.ring_capacity, 64);
        assert_eq!(cfg.receive_timeout, Some(Duration::from_millis(500)));
    }
}
