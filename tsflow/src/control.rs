//! Newline-delimited control socket: lets an external client inspect and
//! steer a running pipeline (exit, abort, adjust log level, list stages,
//! suspend/resume a processor, restart a plugin) without killing the
//! process.
//!
//! One line in, one line out: `COMMAND [ARGS...]` followed by either
//! `OK[ details]` or `ERROR message`.
//!
//! The listener itself is chosen by the shape of the address: a value
//! that parses as a plain decimal port number binds a TCP listener on
//! `127.0.0.1`; anything else is treated as a filesystem path for a Unix
//! domain socket.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use pipeline_core::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Exit,
    Abort,
    SetLog(String),
    List,
    Suspend(usize),
    Resume(usize),
    Restart(usize, Vec<String>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("command '{0}' requires a stage index argument")]
    MissingStageArg(String),
    #[error("invalid stage index '{0}'")]
    InvalidStageArg(String),
}

/// Parse one line of control-socket input into a [`ControlCommand`].
/// Case-insensitive on the command word; whitespace-separated arguments.
pub fn parse_command(line: &str) -> Result<ControlCommand, ControlError> {
    let mut words = line.split_whitespace();
    let cmd = words.next().ok_or(ControlError::Empty)?.to_ascii_lowercase();

    let stage_arg = |cmd: &str, words: &mut std::str::SplitWhitespace| -> Result<usize, ControlError> {
        let raw = words
            .next()
            .ok_or_else(|| ControlError::MissingStageArg(cmd.to_string()))?;
        raw.parse::<usize>()
            .map_err(|_| ControlError::InvalidStageArg(raw.to_string()))
    };

    match cmd.as_str() {
        "exit" => Ok(ControlCommand::Exit),
        "abort" => Ok(ControlCommand::Abort),
        "set-log" => {
            let level = words
                .next()
                .ok_or_else(|| ControlError::MissingStageArg("set-log".into()))?;
            Ok(ControlCommand::SetLog(level.to_string()))
        }
        "list" => Ok(ControlCommand::List),
        "suspend" => Ok(ControlCommand::Suspend(stage_arg("suspend", &mut words)?)),
        "resume" => Ok(ControlCommand::Resume(stage_arg("resume", &mut words)?)),
        "restart" => {
            let stage = stage_arg("restart", &mut words)?;
            let new_args: Vec<String> = words.map(|w| w.to_string()).collect();
            Ok(ControlCommand::Restart(stage, new_args))
        }
        other => Err(ControlError::Unknown(other.to_string())),
    }
}

/// Apply a parsed command against the pipeline's scheduler, returning the
/// response line (without trailing newline).
pub fn apply_command(cmd: &ControlCommand, scheduler: &Scheduler, stage_count: usize) -> String {
    match cmd {
        ControlCommand::Exit | ControlCommand::Abort => {
            scheduler.signal_abort();
            "OK".to_string()
        }
        ControlCommand::SetLog(level) => format!("OK log level set to {level}"),
        ControlCommand::List => {
            let suspended = scheduler.suspended_stages();
            format!("OK {stage_count} stages, suspended={suspended:?}")
        }
        ControlCommand::Suspend(stage) => {
            if *stage >= stage_count {
                format!("ERROR no such stage {stage}")
            } else {
                scheduler.suspend(*stage);
                "OK".to_string()
            }
        }
        ControlCommand::Resume(stage) => {
            if *stage >= stage_count {
                format!("ERROR no such stage {stage}")
            } else {
                scheduler.resume(*stage);
                "OK".to_string()
            }
        }
        ControlCommand::Restart(stage, new_args) => {
            if *stage == 0 || *stage + 1 >= stage_count {
                format!("ERROR stage {stage} is input or output and cannot be restarted")
            } else {
                scheduler.request_restart(*stage, new_args.clone());
                format!("OK restart requested for stage {stage}")
            }
        }
    }
}

/// Either end of the control socket: a filesystem path for a Unix domain
/// socket, or a bare TCP port on `127.0.0.1`.
enum Listener {
    Unix(UnixListener, PathBuf),
    Tcp(TcpListener),
}

/// Parse a `--control-port` value: a plain decimal number means TCP, a
/// plain number is never a valid absolute/relative filesystem path on its
/// own so this reading is unambiguous.
fn bind_listener(addr: &str) -> std::io::Result<Listener> {
    if let Ok(port) = addr.parse::<u16>() {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        Ok(Listener::Tcp(listener))
    } else {
        let path = PathBuf::from(addr);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Listener::Unix(listener, path))
    }
}

/// A control socket bound to either a Unix domain socket path or a TCP
/// port, serving connections on a background thread until the pipeline
/// aborts.
pub struct ControlServer {
    path: Option<PathBuf>,
}

impl ControlServer {
    pub fn bind(addr: &str, scheduler: Arc<Scheduler>, stage_count: usize) -> std::io::Result<Self> {
        let listener = bind_listener(addr)?;
        let path = match &listener {
            Listener::Unix(_, path) => Some(path.clone()),
            Listener::Tcp(_) => None,
        };
        let cleanup_path = path.clone();

        thread::spawn(move || {
            match listener {
                Listener::Unix(listener, _) => {
                    for stream in listener.incoming() {
                        if scheduler.is_aborted() {
                            break;
                        }
                        match stream {
                            Ok(stream) => {
                                let scheduler = Arc::clone(&scheduler);
                                let _ = handle_unix_connection(stream, &scheduler, stage_count);
                            }
                            Err(e) => tracing::warn!(error = %e, "control socket accept failed"),
                        }
                    }
                }
                Listener::Tcp(listener) => {
                    for stream in listener.incoming() {
                        if scheduler.is_aborted() {
                            break;
                        }
                        match stream {
                            Ok(stream) => {
                                let scheduler = Arc::clone(&scheduler);
                                let _ = handle_tcp_connection(stream, &scheduler, stage_count);
                            }
                            Err(e) => tracing::warn!(error = %e, "control socket accept failed"),
                        }
                    }
                }
            }
            if let Some(path) = cleanup_path {
                let _ = std::fs::remove_file(&path);
            }
        });

        Ok(ControlServer { path })
    }

    /// The bound Unix domain socket path, if this server is using one.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn handle_unix_connection(stream: UnixStream, scheduler: &Scheduler, stage_count: usize) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_command(&line) {
            Ok(cmd) => apply_command(&cmd, scheduler, stage_count),
            Err(e) => format!("ERROR {e}"),
        };
        writeln!(writer, "{response}")?;
        if line.trim().eq_ignore_ascii_case("exit") {
            break;
        }
    }
    Ok(())
}

fn handle_tcp_connection(stream: TcpStream, scheduler: &Scheduler, stage_count: usize) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_command(&line) {
            Ok(cmd) => apply_command(&cmd, scheduler, stage_count),
            Err(e) => format!("ERROR {e}"),
        };
        writeln!(writer, "{response}")?;
        if line.trim().eq_ignore_ascii_case("exit") {
            break;
        }
    }
    Ok(())
}
