//! Library surface behind the `tsflow` binary: the supervisor, control
//! socket, built-in plugins, and CLI plugin-chain parsing, kept separate
//! from `main` so integration tests can drive a full pipeline in-process.

pub mod control;
pub mod plugins;
pub mod supervisor;

use pipeline_core::args::{OptionSchema, OptionSpec, ParsedArgs};
use pipeline_core::config::{PipelineConfig, PluginSpec};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("missing required -I (input plugin) specification")]
    MissingInput,
    #[error("missing required -O (output plugin) specification")]
    MissingOutput,
    #[error("plugin option '{0}' requires a plugin name")]
    MissingPluginName(&'static str),
    #[error(transparent)]
    Args(#[from] pipeline_core::ArgsError),
    #[error("{0}")]
    Help(String),
    #[error("tsflow {}", env!("CARGO_PKG_VERSION"))]
    Version,
}

/// The global options recognized before the first `-I`/`-P`/`-O`, per the
/// ones every plugin and the supervisor itself accept (`--help`,
/// `--version`, `--verbose`, `--debug[=level]`) plus the pipeline-wide
/// ones: `--buffer-packets`, `--bitrate`, `--max-flushed-packets`,
/// `--max-input-packets`, `--realtime`, `--control-port`.
fn global_option_schema() -> OptionSchema {
    OptionSchema::new(vec![
        OptionSpec::integer("buffer-packets").occurrences(0, 1),
        OptionSpec::integer("bitrate").occurrences(0, 1),
        OptionSpec::integer("max-flushed-packets").occurrences(0, 1),
        OptionSpec::integer("max-input-packets").occurrences(0, 1),
        OptionSpec::flag("realtime"),
        OptionSpec::string("control-port").occurrences(0, 1),
    ])
    .with_standard_options()
}

/// Apply parsed global options onto a freshly built [`PipelineConfig`].
fn apply_global_options(mut config: PipelineConfig, global: &ParsedArgs) -> PipelineConfig {
    if let Some(n) = global.value_int("buffer-packets") {
        config = config.with_ring_capacity(n.max(1) as usize);
    }
    if let Some(bps) = global.value_int("bitrate") {
        config = config.with_bitrate_override(bps.max(0) as u64);
    }
    if let Some(n) = global.value_int("max-flushed-packets") {
        config = config.with_max_flushed_packets(n.max(0) as usize);
    }
    if let Some(n) = global.value_int("max-input-packets") {
        config = config.with_max_input_packets(n.max(0) as usize);
    }
    if global.present("realtime") {
        config = config.with_realtime(true);
    }
    if let Some(addr) = global.value_str("control-port") {
        config = config.with_control_port(addr);
    }
    config.verbose = global.count("verbose") as u32;
    config.debug_level = global.value_int("debug");
    config
}

/// Split `-I name args... -P name args... -O name args...` into a
/// [`PipelineConfig`]. Tokens before the first `-I`/`--input` are parsed
/// as global options; from there, each `-I`/`-P`/`-O` introduces a new
/// plugin spec, and every token up to the next such flag (or end of
/// input) belongs to that plugin's own argument vector.
pub fn parse_pipeline_args(raw: &[String]) -> Result<PipelineConfig, CliError> {
    let global_end = raw
        .iter()
        .position(|a| a == "-I" || a == "--input")
        .unwrap_or(raw.len());
    let (global_tokens, chain_tokens) = raw.split_at(global_end);

    let global_schema = global_option_schema();
    let global = pipeline_core::args::parse(&global_tokens.to_vec(), &global_schema)?;

    if global.present("help") {
        return Err(CliError::Help(usage_text()));
    }
    if global.present("version") {
        return Err(CliError::Version);
    }

    let mut input: Option<PluginSpec> = None;
    let mut processors = Vec::new();
    let mut output: Option<PluginSpec> = None;

    let mut i = 0;
    while i < chain_tokens.len() {
        let flag = chain_tokens[i].as_str();
        let role = match flag {
            "-I" | "--input" => "input",
            "-P" | "--processor" => "processor",
            "-O" | "--output" => "output",
            _ => {
                i += 1;
                continue;
            }
        };
        let name = chain_tokens
            .get(i + 1)
            .cloned()
            .ok_or(CliError::MissingPluginName(match role {
                "input" => "-I",
                "processor" => "-P",
                _ => "-O",
            }))?;
        i += 2;
        let mut args = Vec::new();
        while i < chain_tokens.len()
            && !matches!(
                chain_tokens[i].as_str(),
                "-I" | "--input" | "-P" | "--processor" | "-O" | "--output"
            )
        {
            args.push(chain_tokens[i].clone());
            i += 1;
        }
        let spec = PluginSpec::new(name, args);
        match role {
            "input" => input = Some(spec),
            "processor" => processors.push(spec),
            _ => output = Some(spec),
        }
    }

    let input = input.ok_or(CliError::MissingInput)?;
    let output = output.ok_or(CliError::MissingOutput)?;
    let config = PipelineConfig::new(input, processors, output);
    Ok(apply_global_options(config, &global))
}

fn usage_text() -> String {
    "usage: tsflow [global-options] -I input [args...] \
     [-P processor [args...] ...] -O output [args...]\n\
     global options: --buffer-packets N, --bitrate B, --max-flushed-packets N, \
     --max-input-packets N, --realtime, --control-port P, --verbose, --debug[=L], \
     --help, --version"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_a_full_input_processor_output_chain() {
        let cfg = parse_pipeline_args(&strs(&[
            "-I", "file", "--file", "in.ts",
            "-P", "drop", "--pid", "0x100",
            "-O", "file", "--file", "out.ts",
        ]))
        .unwrap();
        assert_eq!(cfg.input.name, "file");
        assert_eq!(cfg.input.args, vec!["--file", "in.ts"]);
        assert_eq!(cfg.processors.len(), 1);
        assert_eq!(cfg.processors[0].name, "drop");
        assert_eq!(cfg.output.name, "file");
    }

    #[test]
    fn missing_input_is_an_error() {
        let err = parse_pipeline_args(&strs(&["-O", "file"]));
        assert!(matches!(err, Err(CliError::MissingInput)));
    }

    #[test]
    fn missing_output_is_an_error() {
        let err = parse_pipeline_args(&strs(&["-I", "file"]));
        assert!(matches!(err, Err(CliError::MissingOutput)));
    }

    #[test]
    fn supports_multiple_processors_in_order() {
        let cfg = parse_pipeline_args(&strs(&[
            "-I", "file",
            "-P", "drop", "--pid", "1",
            "-P", "encap", "--pid", "0x300",
            "-O", "file",
        ]))
        .unwrap();
        assert_eq!(cfg.processors.len(), 2);
        assert_eq!(cfg.processors[0].name, "drop");
        assert_eq!(cfg.processors[1].name, "encap");
    }

    #[test]
    fn global_options_populate_the_pipeline_config() {
        let cfg = parse_pipeline_args(&strs(&[
            "--bitrate", "8000000",
            "--buffer-packets", "256",
            "--realtime",
            "--control-port", "/tmp/tsflow.sock",
            "-v", "-v",
            "-I", "file", "--file", "in.ts",
            "-O", "file", "--file", "out.ts",
        ]))
        .unwrap();
        assert_eq!(cfg.bitrate_override, Some(8_000_000));
        assert_eq!(cfg.ring_capacity, 256);
        assert!(cfg.realtime);
        assert_eq!(cfg.control_port.as_deref(), Some("/tmp/tsflow.sock"));
        assert_eq!(cfg.verbose, 2);
    }

    #[test]
    fn help_flag_short_circuits_with_usage_text() {
        let err = parse_pipeline_args(&strs(&["--help"]));
        assert!(matches!(err, Err(CliError::Help(_))));
    }

    #[test]
    fn version_flag_short_circuits() {
        let err = parse_pipeline_args(&strs(&["--version"]));
        assert!(matches!(err, Err(CliError::Version)));
    }
}
