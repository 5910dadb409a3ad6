//! Helpers intended for [`std::process::Command`].

use std::io::{Read, Seek};
use std::process::Command;

use anyhow::{Context, Result};

/// How much of a failed child's stderr we include in the error.
const MAX_STDERR_BYTES: usize = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. On failure the
    /// tail of stderr is included in the returned error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Render the command the way a POSIX shell would parse it.
    fn to_string_pretty(&self) -> String;
}

fn last_utf8_content(buf: &[u8]) -> String {
    let start = buf.len().saturating_sub(MAX_STDERR_BYTES);
    String::from_utf8_lossy(&buf[start..]).trim().to_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let mut stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        let program = self.get_program().to_string_lossy().into_owned();
        let st = self
            .status()
            .with_context(|| format!("Spawning {program}"))?;
        if st.success() {
            return Ok(());
        }
        let mut buf = Vec::new();
        stderr.seek(std::io::SeekFrom::Start(0))?;
        stderr.read_to_end(&mut buf)?;
        let msg = last_utf8_content(&buf);
        if msg.is_empty() {
            anyhow::bail!("{program} failed: {st:?}");
        }
        anyhow::bail!("{program} failed: {st:?}: {msg}")
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                shlex::try_quote(&arg)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| arg.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
