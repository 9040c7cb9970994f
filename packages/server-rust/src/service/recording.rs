//! Live traffic capture for later replay.
//!
//! Each recorded call is one tab-separated line. Inputs go to
//! `<input_path>_<port>`; replies, when an output path is configured, go to
//! `<output_path>_<port>`.
//!
//! Capture files are created on the blocking pool. Record lines are short
//! and are written synchronously under the recorder lock.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::config::RecordingConfig;

#[derive(Default)]
struct RecorderState {
    started: Option<Instant>,
    input: Option<LineWriter<File>>,
    output: Option<LineWriter<File>>,
}

pub struct TrafficRecorder {
    input_path: PathBuf,
    output_path: Option<PathBuf>,
    max_duration: Duration,
    state: Mutex<RecorderState>,
}

fn with_port(path: &Path, port: u16) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("_{port}"));
    PathBuf::from(name)
}

fn timestamp_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Keeps one entry per line.
fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

impl TrafficRecorder {
    #[must_use]
    pub fn new(config: &RecordingConfig, port: u16) -> Self {
        Self {
            input_path: with_port(&config.input_path, port),
            output_path: config.output_path.as_deref().map(|p| with_port(p, port)),
            max_duration: config.max_duration,
            state: Mutex::new(RecorderState::default()),
        }
    }

    #[must_use]
    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Truncates the capture files and starts recording.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if a capture file cannot be created.
    pub async fn start(&self) -> io::Result<()> {
        let input_path = self.input_path.clone();
        let output_path = self.output_path.clone();
        let (input, output) = tokio::task::spawn_blocking(move || {
            let input = LineWriter::new(File::create(&input_path)?);
            let output = match output_path {
                Some(path) => Some(LineWriter::new(File::create(path)?)),
                None => None,
            };
            Ok::<_, io::Error>((input, output))
        })
        .await
        .map_err(io::Error::other)??;

        *self.state.lock() = RecorderState {
            started: Some(Instant::now()),
            input: Some(input),
            output,
        };
        info!(path = %self.input_path.display(), "recording started");
        Ok(())
    }

    pub fn stop(&self) {
        *self.state.lock() = RecorderState::default();
        info!("recording stopped");
    }

    /// True while started and within the maximum recording duration.
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state
            .lock()
            .started
            .is_some_and(|t| t.elapsed() <= self.max_duration)
    }

    pub fn record_input(&self, opname: &str, input_json: &str) {
        let line = format!("{}\t{opname}\t{}", timestamp_ms(), single_line(input_json));
        self.write_line(|s| s.input.as_mut(), &line);
    }

    pub fn record_output(&self, opname: &str, success: bool, output_json: &str) {
        let line = format!(
            "{}\t{opname}\t{success}\t{}",
            timestamp_ms(),
            single_line(output_json)
        );
        self.write_line(|s| s.output.as_mut(), &line);
    }

    fn write_line(
        &self,
        target: impl FnOnce(&mut RecorderState) -> Option<&mut LineWriter<File>>,
        line: &str,
    ) {
        let mut state = self.state.lock();
        if !state.started.is_some_and(|t| t.elapsed() <= self.max_duration) {
            return;
        }
        if let Some(writer) = target(&mut *state) {
            if let Err(e) = writeln!(writer, "{line}") {
                warn!(error = %e, "failed to write recording");
            }
        }
    }
}
