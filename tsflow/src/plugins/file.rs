//! Built-in `file` input and output plugins, thin wrappers around
//! `ts-io`'s reader/writer that adapt them to the [`InputPlugin`] /
//! [`OutputPlugin`] contract.

use pipeline_core::args::{OptionSchema, OptionSpec, ParsedArgs};
use pipeline_core::{InputPlugin, OutputPlugin, PluginContext, PluginError, PluginLifecycle};
use ts_io::{TsFileReader, TsFileWriter};
use ts_packet::TsPacket;

pub struct FileInput {
    reader: Option<TsFileReader>,
}

impl FileInput {
    pub fn new() -> Self {
        FileInput { reader: None }
    }
}

impl Default for FileInput {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLifecycle for FileInput {
    fn name(&self) -> &str {
        "file"
    }

    fn option_schema(&self) -> OptionSchema {
        OptionSchema::new(vec![
            OptionSpec::string("file").occurrences(1, 1),
            OptionSpec::integer("repeat").occurrences(0, 1),
            OptionSpec::integer("start-offset").occurrences(0, 1),
        ])
    }

    fn start(&mut self, args: &ParsedArgs, _ctx: &PluginContext) -> Result<(), PluginError> {
        let path = args
            .value_str("file")
            .or_else(|| args.positional.first().map(|s| s.as_str()))
            .ok_or_else(|| PluginError::StartFailed("file".into(), "missing input path".into()))?;
        let repeat = args.value_int("repeat").unwrap_or(1).max(0) as u32;
        let start_offset = args.value_int("start-offset").unwrap_or(0).max(0) as u64;
        let reader = TsFileReader::open(path, repeat, start_offset)
            .map_err(|e| PluginError::StartFailed("file".into(), e.to_string()))?;
        self.reader = Some(reader);
        Ok(())
    }
}

impl InputPlugin for FileInput {
    fn read_packet(&mut self, packet: &mut TsPacket, _ctx: &PluginContext) -> Result<bool, PluginError> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| PluginError::Read("file".into(), "not started".into()))?;
        let mut one = [TsPacket::default()];
        let n = reader
            .read(&mut one)
            .map_err(|e| PluginError::Read("file".into(), e.to_string()))?;
        if n == 0 {
            return Ok(false);
        }
        *packet = one[0].clone();
        Ok(true)
    }
}

pub struct FileOutput {
    writer: Option<TsFileWriter>,
}

impl FileOutput {
    pub fn new() -> Self {
        FileOutput { writer: None }
    }
}

impl Default for FileOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLifecycle for FileOutput {
    fn name(&self) -> &str {
        "file"
    }

    fn option_schema(&self) -> OptionSchema {
        OptionSchema::new(vec![
            OptionSpec::string("file").occurrences(1, 1),
            OptionSpec::flag("append"),
            OptionSpec::flag("keep"),
        ])
    }

    fn start(&mut self, args: &ParsedArgs, _ctx: &PluginContext) -> Result<(), PluginError> {
        let path = args
            .value_str("file")
            .or_else(|| args.positional.first().map(|s| s.as_str()))
            .ok_or_else(|| PluginError::StartFailed("file".into(), "missing output path".into()))?;
        let writer = TsFileWriter::open(path, args.present("append"), args.present("keep"))
            .map_err(|e| PluginError::StartFailed("file".into(), e.to_string()))?;
        self.writer = Some(writer);
        Ok(())
    }
}

impl OutputPlugin for FileOutput {
    fn write_packet(&mut self, packet: &TsPacket, _ctx: &PluginContext) -> Result<(), PluginError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PluginError::Write("file".into(), "not started".into()))?;
        writer
            .write(std::slice::from_ref(packet))
            .map_err(|e| PluginError::Write("file".into(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_for(pairs: &[(&str, &str)]) -> ParsedArgs {
        let mut raw = Vec::new();
        for (k, v) in pairs {
            raw.push(format!("--{k}"));
            if !v.is_empty() {
                raw.push(v.to_string());
            }
        }
        pipeline_core::args::parse(
            &raw,
            &OptionSchema::new(vec![
                OptionSpec::string("file"),
                OptionSpec::integer("repeat"),
                OptionSpec::integer("start-offset"),
                OptionSpec::flag("append"),
                OptionSpec::flag("keep"),
            ]),
        )
        .unwrap()
    }

    fn test_ctx() -> PluginContext {
        PluginContext::new(std::sync::Arc::new(pipeline_core::Scheduler::new()), 0, false)
    }

    #[test]
    fn round_trips_packets_through_file_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipe.ts");
        let path_str = path.to_str().unwrap();
        let ctx = test_ctx();

        let mut output = FileOutput::new();
        output
            .start(&args_for(&[("file", path_str)]), &ctx)
            .unwrap();
        let mut pkt = TsPacket::default();
        pkt.set_pid(0x200);
        output.write_packet(&pkt, &ctx).unwrap();
        drop(output);

        let mut input = FileInput::new();
        input.start(&args_for(&[("file", path_str)]), &ctx).unwrap();
        let mut read_back = TsPacket::default();
        assert!(input.read_packet(&mut read_back, &ctx).unwrap());
        assert_eq!(read_back.pid(), 0x200);
        assert!(!input.read_packet(&mut read_back, &ctx).unwrap());
    }
}
