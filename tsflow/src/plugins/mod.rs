//! Built-in plugins: the ones the supervisor can resolve by name without
//! any external registration mechanism.

pub mod drop_pid;
pub mod encap;
pub mod file;

use pipeline_core::{PluginError, PluginRole};

/// Resolve a plugin name plus its raw CLI arguments to a [`PluginRole`],
/// or `None` if `name` isn't a built-in. This is the single place new
/// built-ins get wired in; the supervisor never matches on plugin names
/// itself.
pub fn resolve_input(name: &str) -> Option<Box<dyn pipeline_core::InputPlugin>> {
    match name {
        "file" => Some(Box::new(file::FileInput::new())),
        _ => None,
    }
}

pub fn resolve_processor(name: &str) -> Option<Box<dyn pipeline_core::ProcessorPlugin>> {
    match name {
        "drop" => Some(Box::new(drop_pid::DropByPid::new())),
        "encap" => Some(Box::new(encap::EncapProcessor::new())),
        _ => None,
    }
}

pub fn resolve_output(name: &str) -> Option<Box<dyn pipeline_core::OutputPlugin>> {
    match name {
        "file" => Some(Box::new(file::FileOutput::new())),
        _ => None,
    }
}

/// Build a [`PluginRole`] for an input plugin spec, or a plugin-not-found
/// error carrying the given name.
pub fn input_role(name: &str) -> Result<PluginRole, PluginError> {
    resolve_input(name)
        .map(PluginRole::Input)
        .ok_or_else(|| PluginError::StartFailed(name.to_string(), "no such input plugin".into()))
}

pub fn processor_role(name: &str) -> Result<PluginRole, PluginError> {
    resolve_processor(name)
        .map(PluginRole::Processor)
        .ok_or_else(|| PluginError::StartFailed(name.to_string(), "no such processor plugin".into()))
}

pub fn output_role(name: &str) -> Result<PluginRole, PluginError> {
    resolve_output(name)
        .map(PluginRole::Output)
        .ok_or_else(|| PluginError::StartFailed(name.to_string(), "no such output plugin".into()))
}
