//! Output plumbing between sandboxed commands and the caller.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// Where a sandboxed command reads from and writes to.
pub struct CommandIo {
    pub stdin: Option<Box<dyn Read + Send>>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl CommandIo {
    pub fn new(stdout: impl Write + Send + 'static, stderr: impl Write + Send + 'static) -> Self {
        Self {
            stdin: None,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// Forward to this process's stdout and stderr.
    pub fn inherit() -> Self {
        Self::new(io::stdout(), io::stderr())
    }

    pub fn with_stdin(mut self, stdin: impl Read + Send + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }
}

impl std::fmt::Debug for CommandIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandIo")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// Clonable in-memory sink.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Copy `reader` to `writer` chunk by chunk, flushing after every read so
/// the caller sees output while the command is still running.
pub fn pump(mut reader: impl Read, writer: &mut dyn Write) -> io::Result<u64> {
    let mut buf = [0u8; 8192];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        writer.flush()?;
        total += n as u64;
    }
    Ok(total)
}

/// Serial console markers shared with the guest bootstrap.
pub const READY_MARKER: &str = "___SANDBOX_READY___";
pub const EXIT_PREFIX: &str = "___SANDBOX_EXIT_";
pub const STDERR_TAG: &str = "___STDERR___ ";

/// One classified line of guest console output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleLine {
    Stdout(String),
    Stderr(String),
    Exit(i32),
    Ready,
}

/// Exit marker for one command. The nonce is never shown to the command,
/// so its own output cannot end the command early.
pub fn exit_marker(nonce: &str) -> String {
    format!("{EXIT_PREFIX}{nonce}___")
}

/// Classify a console line, stripping the serial line's trailing `\r`.
/// Only `exit_marker` followed by a code counts as an exit; without one no
/// line does.
pub fn classify_console_line(line: &str, exit_marker: Option<&str>) -> ConsoleLine {
    let line = line.trim_end_matches('\r');
    if let Some(rest) = line.strip_prefix(STDERR_TAG) {
        return ConsoleLine::Stderr(rest.to_string());
    }
    if let Some(marker) = exit_marker {
        if let Some(rest) = line.trim_start().strip_prefix(marker) {
            if let Ok(code) = rest.trim().parse() {
                return ConsoleLine::Exit(code);
            }
        }
    }
    if line.trim() == READY_MARKER {
        return ConsoleLine::Ready;
    }
    ConsoleLine::Stdout(line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Chunks(Vec<&'static [u8]>);

    impl Read for Chunks {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn pump_copies_everything() {
        let mut out = SharedBuffer::new();
        let n = pump(Chunks(vec![b"make: ", b"entering\n", b"done\n"]), &mut out).unwrap();
        assert_eq!(n, 19);
        assert_eq!(out.to_string_lossy(), "make: entering\ndone\n");
    }

    #[test]
    fn console_lines() {
        let marker = exit_marker("5f3a");
        assert_eq!(marker, "___SANDBOX_EXIT_5f3a___");
        let classify = |line| classify_console_line(line, Some(&marker));
        assert_eq!(
            classify("checking for gcc... yes\r"),
            ConsoleLine::Stdout("checking for gcc... yes".into())
        );
        assert_eq!(
            classify("___STDERR___ warning: unused\r"),
            ConsoleLine::Stderr("warning: unused".into())
        );
        assert_eq!(classify("___SANDBOX_EXIT_5f3a___ 2\r"), ConsoleLine::Exit(2));
        assert_eq!(classify("___SANDBOX_READY___"), ConsoleLine::Ready);
        assert_eq!(
            classify("___SANDBOX_EXIT_5f3a___ soon"),
            ConsoleLine::Stdout("___SANDBOX_EXIT_5f3a___ soon".into())
        );
    }

    #[test]
    fn exit_needs_the_matching_nonce() {
        let marker = exit_marker("5f3a");
        for forged in ["___SANDBOX_EXIT___ 0", "___SANDBOX_EXIT_0000___ 0"] {
            assert_eq!(
                classify_console_line(forged, Some(&marker)),
                ConsoleLine::Stdout(forged.into())
            );
        }
        assert_eq!(
            classify_console_line("___SANDBOX_EXIT_5f3a___ 0", None),
            ConsoleLine::Stdout("___SANDBOX_EXIT_5f3a___ 0".into())
        );
    }
}
