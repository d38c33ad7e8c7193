// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The subprocess seam.
//!
//! Every external byte-transforming tool (section wrapper, codecs, the
//! volume encoder) is invoked through [`ToolRunner`], so the encoders
//! can be exercised in tests without spawning processes.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;
use thiserror::Error;

/// Failure of one external tool invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("`{0}` was not found on the search path")]
    NotFound(String),

    #[error("`{tool}` exited with status {code}")]
    Failed { tool: String, code: i32 },

    #[error("`{tool}` was terminated by a signal")]
    Killed { tool: String },

    #[error("could not run `{tool}`: {source}")]
    Io {
        tool: String,
        #[source]
        source: io::Error,
    },
}

/// Runs external tools. Implementations must be shareable across the
/// file-encode worker threads.
pub trait ToolRunner: Send + Sync {
    /// Runs `command` with `args`, blocking until it exits. `command`
    /// may carry embedded arguments (`python3 Brotli.py`); the first
    /// whitespace-separated token is the program.
    fn run(&self, command: &str, args: &[OsString]) -> Result<(), ToolError>;
}

/// Production runner: one short-lived blocking subprocess per
/// invocation. Execution time is not bounded; a hung tool hangs the
/// build.
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, command: &str, args: &[OsString]) -> Result<(), ToolError> {
        let mut words = command.split_whitespace();
        let program = match words.next() {
            Some(p) => p,
            None => return Err(ToolError::NotFound(command.to_string())),
        };

        let mut cmd = Command::new(program);
        for word in words {
            cmd.arg(word);
        }
        cmd.args(args);
        debug!("running {:?}", cmd);

        let status = cmd.status().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ToolError::NotFound(program.to_string())
            } else {
                ToolError::Io {
                    tool: program.to_string(),
                    source: e,
                }
            }
        })?;

        if status.success() {
            return Ok(());
        }
        match status.code() {
            Some(code) => Err(ToolError::Failed {
                tool: program.to_string(),
                code,
            }),
            None => Err(ToolError::Killed {
                tool: program.to_string(),
            }),
        }
    }
}

/// Resolves the program of `command` to a path: an absolute (or
/// dotted-relative) program must exist as given; a bare name is
/// searched on `PATH`.
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    let program = command.split_whitespace().next()?;
    let p = Path::new(program);
    if p.components().count() > 1 {
        return if p.is_file() { Some(p.to_path_buf()) } else { None };
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}
