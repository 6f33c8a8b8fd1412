//! Slicing Invoker
//!
//! Builds the engine command line and runs it through a [`SlicingEngine`].
//! A failed run is reported with its captured output and never retried.

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default engine location for this platform.
pub fn default_executable() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Program Files\Prusa3D\PrusaSlicer\prusa-slicer-console.exe")
    } else {
        PathBuf::from("prusa-slicer")
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep reading after the engine exits. Background processes
/// that inherited its pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("Slicing engine not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("Failed to start slicing engine {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Slicing engine exited with {}", describe_exit(.code))]
    NonZeroExit { code: Option<i32>, output: Vec<String> },

    #[error("Slicing engine timed out after {timeout:?}")]
    TimedOut { timeout: Duration, output: Vec<String> },

    #[error("Slicing was cancelled")]
    Cancelled { output: Vec<String> },

    #[error("Lost contact with slicing engine: {0}")]
    Wait(#[source] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl InvokeError {
    /// Engine output captured before the failure, if any.
    pub fn output(&self) -> &[String] {
        match self {
            InvokeError::NonZeroExit { output, .. }
            | InvokeError::TimedOut { output, .. }
            | InvokeError::Cancelled { output } => output,
            _ => &[],
        }
    }
}

/// Program plus argv for one engine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(&arg);
                out.push('"');
            } else {
                out.push_str(&arg);
            }
        }
        out
    }
}

/// Cooperative cancellation flag shared with a running invocation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Limits for one engine run.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

impl RunControl {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancelToken::new(),
        }
    }
}

/// Result of a successful engine run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineRun {
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
}

impl EngineRun {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Capability to run the slicing engine.
///
/// Implementations return `Ok` with the exit status for any run that
/// completed; the invoker decides what a non-zero status means.
pub trait SlicingEngine: Send + Sync {
    fn invoke(
        &self,
        invocation: &Invocation,
        control: &RunControl,
    ) -> Result<EngineRun, InvokeError>;
}

impl<E: SlicingEngine + ?Sized> SlicingEngine for Arc<E> {
    fn invoke(
        &self,
        invocation: &Invocation,
        control: &RunControl,
    ) -> Result<EngineRun, InvokeError> {
        (**self).invoke(invocation, control)
    }
}

/// Optional engine flags added before the model path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub material_profile: Option<String>,
    pub printer_profile: Option<String>,
    pub printer_technology: Option<String>,
    pub layer_height: Option<f64>,
}

impl EngineOptions {
    fn flags(&self) -> Vec<(&'static str, String)> {
        let mut flags = Vec::new();
        if let Some(v) = &self.material_profile {
            flags.push(("--material-profile", v.clone()));
        }
        if let Some(v) = &self.printer_profile {
            flags.push(("--printer-profile", v.clone()));
        }
        if let Some(v) = &self.printer_technology {
            flags.push(("--printer-technology", v.clone()));
        }
        if let Some(v) = self.layer_height {
            flags.push(("--layer-height", v.to_string()));
        }
        flags
    }
}

/// Runs the engine as a child process.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    executable: PathBuf,
}

impl ProcessEngine {
    /// Resolve `executable` on disk or on `PATH`.
    ///
    /// Absence is a startup condition, not a per-request error.
    pub fn locate(executable: impl Into<PathBuf>) -> Result<Self, InvokeError> {
        let executable = executable.into();
        let resolved = resolve_executable(&executable)
            .ok_or_else(|| InvokeError::ExecutableNotFound(executable.clone()))?;
        debug!(engine = %resolved.display(), "Located slicing engine");
        Ok(Self { executable: resolved })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

fn resolve_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return executable.is_file().then(|| executable.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search).find_map(|dir| {
        let candidate = dir.join(executable);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

impl SlicingEngine for ProcessEngine {
    fn invoke(
        &self,
        invocation: &Invocation,
        control: &RunControl,
    ) -> Result<EngineRun, InvokeError> {
        run_process(invocation, control)
    }
}

/// Spawn `invocation`, relaying stdout and stderr line by line to the log
/// while buffering both, until it exits, times out or is cancelled.
pub fn run_process(
    invocation: &Invocation,
    control: &RunControl,
) -> Result<EngineRun, InvokeError> {
    info!(command = %invocation.display(), "Starting slicing engine");

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| InvokeError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, tx.clone()));
    }
    drop(tx);

    let started = Instant::now();
    let mut output = Vec::new();
    let mut streams_open = true;

    let status = loop {
        if streams_open {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => record(&mut output, line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => streams_open = false,
            }
        } else {
            thread::sleep(POLL_INTERVAL);
        }

        if let Some(status) = child.try_wait().map_err(InvokeError::Wait)? {
            break status;
        }

        let abort = if control.cancel.is_cancelled() {
            Some(None)
        } else {
            control
                .timeout
                .filter(|timeout| started.elapsed() >= *timeout)
                .map(Some)
        };
        if let Some(timed_out) = abort {
            if let Err(e) = child.kill() {
                warn!(error = %e, "Failed to kill slicing engine");
            }
            // Reap the child so it does not linger as a zombie.
            let _ = child.wait();
            output.extend(rx.try_iter());
            return Err(match timed_out {
                Some(timeout) => {
                    warn!(?timeout, "Slicing engine timed out");
                    InvokeError::TimedOut { timeout, output }
                }
                None => {
                    warn!("Slicing engine cancelled");
                    InvokeError::Cancelled { output }
                }
            });
        }
    };

    // The process is gone; collect what is still buffered, within bounds.
    let mut drain_until = Instant::now() + DRAIN_GRACE;
    if let Some(timeout) = control.timeout {
        drain_until = drain_until.min(started + timeout);
    }
    while streams_open {
        if control.cancel.is_cancelled() {
            output.extend(rx.try_iter());
            warn!("Slicing engine cancelled");
            return Err(InvokeError::Cancelled { output });
        }
        let now = Instant::now();
        if now >= drain_until {
            for line in rx.try_iter() {
                record(&mut output, line);
            }
            warn!("Engine output still open after exit, detaching readers");
            break;
        }
        match rx.recv_timeout((drain_until - now).min(POLL_INTERVAL)) {
            Ok(line) => record(&mut output, line),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => streams_open = false,
        }
    }
    if !streams_open {
        // Every sender is gone, so the readers have already returned.
        for reader in readers {
            let _ = reader.join();
        }
    }

    info!(
        exit_code = ?status.code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Slicing engine finished"
    );
    Ok(EngineRun {
        exit_code: status.code(),
        output,
    })
}

fn record(output: &mut Vec<String>, line: String) {
    info!(target: "slicequote::engine", "{line}");
    output.push(line);
}

fn spawn_reader<R>(stream: R, tx: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Builds invocations and interprets their outcome.
pub struct SlicingInvoker<E> {
    engine: E,
    executable: PathBuf,
    options: EngineOptions,
}

impl SlicingInvoker<ProcessEngine> {
    /// Invoker running the located engine binary.
    pub fn process(engine: ProcessEngine) -> Self {
        let executable = engine.executable().to_path_buf();
        Self::new(engine, executable)
    }
}

impl<E: SlicingEngine> SlicingInvoker<E> {
    pub fn new(engine: E, executable: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            executable: executable.into(),
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// `<exe> --export-gcode --output <out> --load <config> [flags] <model>`
    pub fn build_invocation(
        &self,
        model: &Path,
        config: &Path,
        output: &Path,
        options: &EngineOptions,
    ) -> Invocation {
        let mut args: Vec<OsString> = vec![
            "--export-gcode".into(),
            "--output".into(),
            output.as_os_str().to_owned(),
            "--load".into(),
            config.as_os_str().to_owned(),
        ];
        for (flag, value) in options.flags() {
            args.push(flag.into());
            args.push(value.into());
        }
        args.push(model.as_os_str().to_owned());
        Invocation {
            program: self.executable.clone(),
            args,
        }
    }

    /// Slice `model` with the engine config at `config` into `output`.
    ///
    /// Succeeds only on exit status zero.
    pub fn slice(
        &self,
        model: &Path,
        config: &Path,
        output: &Path,
        control: &RunControl,
    ) -> Result<EngineRun, InvokeError> {
        self.slice_with(model, config, output, &self.options, control)
    }

    pub fn slice_with(
        &self,
        model: &Path,
        config: &Path,
        output: &Path,
        options: &EngineOptions,
        control: &RunControl,
    ) -> Result<EngineRun, InvokeError> {
        let invocation = self.build_invocation(model, config, output, options);
        let run = self.engine.invoke(&invocation, control)?;
        if !run.success() {
            warn!(
                model = %model.display(),
                exit_code = ?run.exit_code,
                "Slicing failed"
            );
            return Err(InvokeError::NonZeroExit {
                code: run.exit_code,
                output: run.output,
            });
        }
        info!(model = %model.display(), "Slicing completed");
        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Invocation>>,
        exit_code: i32,
    }

    impl SlicingEngine for Recorder {
        fn invoke(
            &self,
            invocation: &Invocation,
            _: &RunControl,
        ) -> Result<EngineRun, InvokeError> {
            self.seen.lock().unwrap().push(invocation.clone());
            Ok(EngineRun {
                exit_code: Some(self.exit_code),
                output: vec!["slicing...".to_string()],
            })
        }
    }

    fn recorder(exit_code: i32) -> Recorder {
        Recorder {
            seen: Mutex::new(Vec::new()),
            exit_code,
        }
    }

    #[test]
    fn test_invocation_layout() {
        let invoker = SlicingInvoker::new(recorder(0), "prusa-slicer");
        let options = EngineOptions {
            material_profile: Some("Generic PLA".to_string()),
            ..Default::default()
        };
        let inv = invoker.build_invocation(
            Path::new("/w/u/model one.stl"),
            Path::new("/w/u/model one.ini"),
            Path::new("/w/u/model one.gcode"),
            &options,
        );
        let args: Vec<_> = inv.args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "--export-gcode",
                "--output",
                "/w/u/model one.gcode",
                "--load",
                "/w/u/model one.ini",
                "--material-profile",
                "Generic PLA",
                "/w/u/model one.stl",
            ]
        );
        assert!(inv.display().ends_with("\"/w/u/model one.stl\""));
    }

    #[test]
    fn test_nonzero_exit_carries_output() {
        let invoker = SlicingInvoker::new(recorder(3), "prusa-slicer");
        let err = invoker
            .slice(
                Path::new("m.stl"),
                Path::new("m.ini"),
                Path::new("m.gcode"),
                &RunControl::default(),
            )
            .unwrap_err();
        assert!(matches!(err, InvokeError::NonZeroExit { code: Some(3), .. }));
        assert_eq!(err.output().to_vec(), vec!["slicing...".to_string()]);
    }

    #[test]
    fn test_single_attempt() {
        let invoker = SlicingInvoker::new(recorder(1), "prusa-slicer");
        let _ = invoker.slice(
            Path::new("m.stl"),
            Path::new("m.ini"),
            Path::new("m.gcode"),
            &RunControl::default(),
        );
        assert_eq!(invoker.engine().seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_locate_missing_executable() {
        let err = ProcessEngine::locate("/definitely/not/here/prusa-slicer").unwrap_err();
        assert!(matches!(err, InvokeError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Invocation {
        Invocation {
            program: PathBuf::from("sh"),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_process_captures_both_streams() {
        let run =
            run_process(&sh("echo out; echo err 1>&2; exit 0"), &RunControl::default()).unwrap();
        assert!(run.success());
        assert!(run.output.contains(&"out".to_string()));
        assert!(run.output.contains(&"err".to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_reports_exit_code() {
        let run = run_process(&sh("echo broken mesh; exit 4"), &RunControl::default()).unwrap();
        assert_eq!(run.exit_code, Some(4));
        assert_eq!(run.output, vec!["broken mesh".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_timeout_kills_child() {
        let started = Instant::now();
        let err = run_process(
            &sh("echo starting; exec sleep 30"),
            &RunControl::with_timeout(Duration::from_millis(300)),
        )
        .unwrap_err();
        assert!(matches!(err, InvokeError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_background_child_does_not_hold_run_open() {
        let started = Instant::now();
        let run = run_process(
            &sh("echo hi; sleep 3 & exit 0"),
            &RunControl::with_timeout(Duration::from_millis(300)),
        )
        .unwrap();
        assert!(run.success());
        assert!(started.elapsed() < Duration::from_secs(2));

        // No timeout configured: the grace period still bounds the drain.
        let started = Instant::now();
        let run = run_process(&sh("echo hi; sleep 3 & exit 0"), &RunControl::default()).unwrap();
        assert!(run.success());
        assert_eq!(run.output, vec!["hi".to_string()]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn test_process_cancel() {
        let control = RunControl::default();
        control.cancel.cancel();
        let err = run_process(&sh("exec sleep 30"), &control).unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_spawn_failure() {
        let inv = Invocation {
            program: PathBuf::from("/definitely/not/here/prusa-slicer"),
            args: vec![],
        };
        let err = run_process(&inv, &RunControl::default()).unwrap_err();
        assert!(matches!(err, InvokeError::Spawn { .. }));
    }
}
