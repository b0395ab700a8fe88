//! Descriptor extraction through an external model command.
//!
//! Protocol: the frame is written to the command's stdin as a binary PGM
//! (P5) image. The command prints a JSON array of floats when exactly one
//! face was found, or `null` otherwise, and exits 0.

use std::io::{Read, Write};
use std::process::{ChildStderr, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use votegate_core::{DescriptorExtractor, ExtractorError, FaceDescriptor, Frame};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct CommandExtractor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    /// `command_line` is split on whitespace into program and arguments.
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self, ExtractorError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExtractorError::Unavailable("extractor command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl DescriptorExtractor for CommandExtractor {
    fn extract(&mut self, frame: &Frame) -> Result<Option<FaceDescriptor>, ExtractorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExtractorError::Unavailable(format!("{}: {e}", self.program)))?;

        let pgm = encode_pgm(frame);
        if let Some(mut stdin) = child.stdin.take() {
            // Written from a helper thread so a model that starts printing
            // before it has read all input cannot deadlock us.
            std::thread::spawn(move || {
                let _ = stdin.write_all(&pgm);
            });
        }

        // Both pipes are drained while the command runs; a full stderr pipe
        // would otherwise block the model and look like a timeout.
        let stdout = child.stdout.take().map(drain::<ChildStdout>);
        let stderr = child.stderr.take().map(drain::<ChildStderr>);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    // Readers are left detached: a grandchild may still hold the pipes.
                    return Err(ExtractorError::Timeout(self.timeout));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(ExtractorError::InferenceFailed(format!("wait: {e}"))),
            }
        };

        let stdout = collect(stdout)
            .map_err(|e| ExtractorError::InferenceFailed(format!("read stdout: {e}")))?;

        if !status.success() {
            let stderr = collect(stderr).unwrap_or_default();
            return Err(ExtractorError::InferenceFailed(format!(
                "{} exited with {status}: {}",
                self.program,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        if let Ok(stderr) = collect(stderr) {
            if !stderr.is_empty() {
                tracing::debug!(bytes = stderr.len(), "extractor wrote to stderr");
            }
        }

        parse_output(&String::from_utf8_lossy(&stdout))
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn collect(reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> std::io::Result<Vec<u8>> {
    match reader {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked"))),
        None => Ok(Vec::new()),
    }
}

/// Binary PGM: `P5\n<w> <h>\n255\n` followed by raw grayscale bytes.
pub fn encode_pgm(frame: &Frame) -> Vec<u8> {
    let header = format!("P5\n{} {}\n255\n", frame.width, frame.height);
    let mut out = Vec::with_capacity(header.len() + frame.data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&frame.data);
    out
}

/// Parse model output: `null` → no face, array → descriptor.
pub fn parse_output(stdout: &str) -> Result<Option<FaceDescriptor>, ExtractorError> {
    let values: Option<Vec<f32>> = serde_json::from_str(stdout.trim())
        .map_err(|e| ExtractorError::InferenceFailed(format!("unparseable model output: {e}")))?;
    values
        .map(FaceDescriptor::new)
        .transpose()
        .map_err(ExtractorError::from)
}
