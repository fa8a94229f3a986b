//! The flash pipeline: writes an image to a block device.
//!
//! A write moves through a fixed sequence of [`FlashState`]s:
//! 1.  `Preparing`: the image is validated and its decoded size computed.
//!     The device must be at least that large.
//! 2.  `Unmounting`: every filesystem on the target is force-unmounted.
//! 3.  `Writing`: a single privileged shell pipeline decodes the image and
//!     pipes it into `dd`. Progress is *estimated* from elapsed time and an
//!     assumed throughput; `dd`'s own byte count is not parsed.
//! 4.  `Verifying` (optional): the first MiB of the device is hashed for
//!     display. The digest is informational and never compared.
//! 5.  One of `Completed`, `Failed`, or `Cancelled`.
//!
//! Everything from step 3 onwards destroys the device's contents. Callers
//! must obtain an explicit confirmation (see
//! [`crate::device::matches_device_name`]) before starting a job.
use crate::clock::Clock;
use crate::compression::{self, CompressionKind, SourceImage, shell_quote};
use crate::device::BlockDevice;
use crate::disk::DiskService;
use crate::error::{FlashError, FlashResult};
use crate::exec::{PrivilegedExecutor, RunningProcess};
use crate::{format, integrity};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// A cancellation request shared between a job and its observers.
#[derive(Clone, Debug, Default)]
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

    fn check(&self) -> FlashResult<()> {
        if self.is_cancelled() {
            Err(FlashError::UserCancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum FlashState {
    Idle,
    Preparing,
    Unmounting,
    Writing {
        progress: f64,
        bytes_written: u64,
        total_bytes: u64,
    },
    Verifying {
        progress: f64,
    },
    Completed,
    Failed(FlashError),
    Cancelled,
}

impl FlashState {
    /// Position in the pipeline. States may only move forward.
    fn rank(&self) -> u8 {
        match self {
            FlashState::Idle => 0,
            FlashState::Preparing => 1,
            FlashState::Unmounting => 2,
            FlashState::Writing { .. } => 3,
            FlashState::Verifying { .. } => 4,
            FlashState::Completed | FlashState::Failed(_) | FlashState::Cancelled => 5,
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            FlashState::Writing { progress, .. } | FlashState::Verifying { progress } => *progress,
            FlashState::Completed => 1.0,
            _ => 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashState::Completed | FlashState::Failed(_) | FlashState::Cancelled
        )
    }

    /// `true` while a job is between `Idle` and a terminal state.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != FlashState::Idle
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "Ready"),
            FlashState::Preparing => write!(f, "Preparing..."),
            FlashState::Unmounting => write!(f, "Unmounting device..."),
            FlashState::Writing {
                bytes_written,
                total_bytes,
                ..
            } => write!(
                f,
                "Writing: {} / {}",
                format::bytes(*bytes_written),
                format::bytes(*total_bytes)
            ),
            FlashState::Verifying { .. } => write!(f, "Verifying..."),
            FlashState::Completed => write!(f, "Completed"),
            FlashState::Failed(e) => write!(f, "Failed: {e}"),
            FlashState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// One write of one image to one device.
///
/// A job is a fresh value per write; it is never reset and reused.
#[derive(Clone, Debug)]
pub struct FlashJob {
    pub image: SourceImage,
    pub device: BlockDevice,
    pub created_at: SystemTime,
    state: FlashState,
    total_bytes: Option<u64>,
    bytes_written: u64,
    eta: Option<Duration>,
    device_digest: Option<String>,
}

impl FlashJob {
    pub fn new(image: impl Into<PathBuf>, device: BlockDevice) -> Self {
        Self {
            image: SourceImage::new(image),
            device,
            created_at: SystemTime::now(),
            state: FlashState::Idle,
            total_bytes: None,
            bytes_written: 0,
            eta: None,
            device_digest: None,
        }
    }

    pub fn state(&self) -> &FlashState {
        &self.state
    }

    /// The effective payload size, once `Preparing` has computed it.
    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn estimated_time_remaining(&self) -> Option<Duration> {
        self.eta
    }

    /// SHA-256 of the device's first MiB, if the verify phase read it.
    pub fn device_digest(&self) -> Option<&str> {
        self.device_digest.as_deref()
    }

    /// Applies a state transition, refusing anything that moves backwards.
    ///
    /// Repeated `Writing` states are accepted only while `bytes_written` does
    /// not decrease. Returns whether the transition was applied.
    fn advance(&mut self, next: FlashState) -> bool {
        if self.state.is_terminal() || next.rank() < self.state.rank() {
            return false;
        }
        match (&self.state, &next) {
            (FlashState::Writing { .. }, FlashState::Writing { bytes_written, .. })
                if *bytes_written < self.bytes_written =>
            {
                return false;
            }
            (a, b) if a == b && !matches!(b, FlashState::Writing { .. }) => return false,
            _ => {}
        }

        match &next {
            FlashState::Writing { bytes_written, .. } => self.bytes_written = *bytes_written,
            FlashState::Completed => {
                self.bytes_written = self.total_bytes.unwrap_or(self.bytes_written);
                self.eta = None;
            }
            _ => {}
        }
        self.state = next;
        true
    }
}

/// What a front-end learns about an image when the user picks it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub kind: CompressionKind,
    /// Bytes that will be written to the device.
    pub size: u64,
}

/// Validates an image and computes its effective payload size.
pub fn inspect_image(path: &Path) -> FlashResult<ImageInfo> {
    integrity::validate(path)?;
    let kind = compression::classify(path);
    let size = compression::estimate_decoded_size(path).map_err(|e| {
        match e.downcast_ref::<std::io::Error>() {
            Some(io) => FlashError::from_image_io(io),
            None => FlashError::SizeComputationFailed(format!("{e:#}")),
        }
    })?;
    Ok(ImageInfo { kind, size })
}

/// Fails with [`FlashError::InsufficientSpace`] if the payload does not fit.
/// A payload exactly the size of the device fits.
pub fn check_capacity(required: u64, device: &BlockDevice) -> FlashResult<()> {
    if device.size < required {
        return Err(FlashError::InsufficientSpace {
            required,
            available: device.size,
        });
    }
    Ok(())
}

/// Whether a front-end may start a new write.
pub fn can_start_write(
    image: Option<&Path>,
    device: Option<&BlockDevice>,
    current: &FlashState,
) -> bool {
    image.is_some() && device.is_some() && !current.is_active()
}

/// The shell pipeline run with elevated rights during `Writing`.
pub fn write_script(image: &SourceImage, target: &Path, block_size: &str) -> String {
    format!(
        "(set -o pipefail) 2>/dev/null && set -o pipefail; {} | dd of={} bs={} conv=fsync status=progress",
        image.decode_command().to_shell(),
        shell_quote(&target.to_string_lossy()),
        shell_quote(block_size),
    )
}

#[derive(Clone, Debug)]
pub struct FlashOptions {
    /// Hash a prefix of the device after writing.
    pub verify: bool,
    /// `dd` block size, e.g. `"4M"`.
    pub block_size: String,
    /// Throughput, in bytes per second, used to extrapolate write progress.
    pub assumed_throughput: u64,
    /// How often the write is sampled.
    pub sample_interval: Duration,
    /// How many bytes of the device the verify phase hashes.
    pub verify_prefix_len: u64,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            verify: true,
            block_size: "4M".to_string(),
            assumed_throughput: 50_000_000,
            sample_interval: Duration::from_millis(500),
            verify_prefix_len: 1024 * 1024,
        }
    }
}

/// Bytes assumed written after `elapsed`, never more than `total`.
fn estimate_written(elapsed: Duration, throughput: u64, total: u64) -> u64 {
    let estimated = elapsed.as_secs_f64() * throughput as f64;
    (estimated as u64).min(total)
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

/// Runs flash jobs. Holds no per-job state, so one `Flasher` can run any
/// number of jobs one after another.
#[derive(Clone)]
pub struct Flasher {
    disks: Arc<dyn DiskService>,
    privileged: Arc<dyn PrivilegedExecutor>,
    clock: Arc<dyn Clock>,
    options: FlashOptions,
}

impl Flasher {
    pub fn new(
        disks: Arc<dyn DiskService>,
        privileged: Arc<dyn PrivilegedExecutor>,
        clock: Arc<dyn Clock>,
        options: FlashOptions,
    ) -> Self {
        Self {
            disks,
            privileged,
            clock,
            options,
        }
    }

    pub fn options(&self) -> &FlashOptions {
        &self.options
    }

    /// Powers off / ejects a device through the disk service.
    pub fn eject(&self, device: &BlockDevice) -> anyhow::Result<()> {
        log::info!("Ejecting {}", device.name);
        self.disks.eject(&device.name)
    }

    /// Runs `job` to a terminal state on the current thread.
    ///
    /// `on_update` is called after every accepted state change, including
    /// each `Writing` sample.
    pub fn run<F>(&self, job: &mut FlashJob, cancel: &CancelToken, mut on_update: F) -> FlashResult<()>
    where
        F: FnMut(&FlashJob),
    {
        log::info!(
            "Flashing {} ({}) to {}",
            job.image.path.display(),
            job.image.kind,
            job.device.path.display()
        );

        let result = self.drive(job, cancel, &mut on_update);
        let terminal = match &result {
            Ok(()) => FlashState::Completed,
            Err(FlashError::UserCancelled) => FlashState::Cancelled,
            Err(e) => FlashState::Failed(e.clone()),
        };
        match &result {
            Ok(()) => log::info!("Flash of {} completed", job.device.name),
            Err(e) => log::warn!("Flash of {} ended: {e}", job.device.name),
        }
        emit(job, terminal, &mut on_update);
        result
    }

    /// Runs `job` on a worker thread and streams its states.
    pub fn start(&self, job: FlashJob) -> FlashHandle {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let flasher = self.clone();
        let token = cancel.clone();

        let thread = std::thread::spawn(move || {
            let mut job = job;
            let result = flasher.run(&mut job, &token, |job| {
                let _ = tx.send(job.state().clone());
            });
            (job, result)
        });

        FlashHandle {
            states: rx,
            cancel,
            thread,
        }
    }

    fn drive<F>(&self, job: &mut FlashJob, cancel: &CancelToken, on_update: &mut F) -> FlashResult<()>
    where
        F: FnMut(&FlashJob),
    {
        cancel.check()?;
        emit(job, FlashState::Preparing, on_update);

        let info = inspect_image(&job.image.path)?;
        job.image.kind = info.kind;
        job.total_bytes = Some(info.size);
        check_capacity(info.size, &job.device)?;
        log::info!("Effective payload: {}", format::bytes(info.size));

        cancel.check()?;
        emit(job, FlashState::Unmounting, on_update);
        self.disks
            .unmount(&job.device.name, true)
            .map_err(|e| FlashError::UnmountFailed {
                detail: format!("{e:#}"),
            })?;

        cancel.check()?;
        self.write(job, info.size, cancel, on_update)?;

        if self.options.verify {
            cancel.check()?;
            self.verify(job, on_update);
        }
        Ok(())
    }

    fn write<F>(&self, job: &mut FlashJob, total: u64, cancel: &CancelToken, on_update: &mut F) -> FlashResult<()>
    where
        F: FnMut(&FlashJob),
    {
        let script = write_script(&job.image, &job.device.raw_path, &self.options.block_size);
        let mut process = self
            .privileged
            .spawn_script(&script)
            .map_err(|e| FlashError::WriteFailed {
                code: -1,
                message: format!("{e:#}"),
            })?;

        let started = self.clock.now();
        let output = loop {
            if cancel.is_cancelled() {
                return Err(match terminate(process.as_mut()) {
                    Ok(()) => FlashError::UserCancelled,
                    Err(message) => FlashError::WriteFailed { code: -1, message },
                });
            }

            match process.try_wait() {
                Ok(Some(output)) => break output,
                Ok(None) => {}
                Err(e) => {
                    let _ = terminate(process.as_mut());
                    return Err(FlashError::WriteFailed {
                        code: -1,
                        message: format!("{e:#}"),
                    });
                }
            }

            self.sample(job, started, total, on_update);
            self.clock.sleep(self.options.sample_interval);
        };

        if cancel.is_cancelled() {
            return Err(FlashError::UserCancelled);
        }
        if !output.success() {
            return Err(FlashError::WriteFailed {
                code: output.code.unwrap_or(-1),
                message: output.combined(),
            });
        }

        emit(
            job,
            FlashState::Writing {
                progress: 1.0,
                bytes_written: total,
                total_bytes: total,
            },
            on_update,
        );
        Ok(())
    }

    /// Publishes one extrapolated progress sample.
    fn sample<F>(&self, job: &mut FlashJob, started: Instant, total: u64, on_update: &mut F)
    where
        F: FnMut(&FlashJob),
    {
        let elapsed = self.clock.now().saturating_duration_since(started);
        let written = estimate_written(elapsed, self.options.assumed_throughput, total)
            .max(job.bytes_written);
        let progress = fraction(written, total);

        job.eta = (progress > 0.01)
            .then(|| Duration::from_secs_f64(elapsed.as_secs_f64() / progress).saturating_sub(elapsed));

        log::debug!("write sample: {written}/{total} after {elapsed:?}");
        emit(
            job,
            FlashState::Writing {
                progress,
                bytes_written: written,
                total_bytes: total,
            },
            on_update,
        );
    }

    fn verify<F>(&self, job: &mut FlashJob, on_update: &mut F)
    where
        F: FnMut(&FlashJob),
    {
        emit(job, FlashState::Verifying { progress: 0.0 }, on_update);

        let raw_path = &job.device.raw_path;
        match File::open(raw_path)
            .and_then(|f| integrity::checksum_prefix(f, self.options.verify_prefix_len))
        {
            Ok(digest) => {
                log::info!("{} prefix SHA-256: {}", raw_path.display(), digest);
                job.device_digest = Some(digest);
            }
            Err(e) => log::warn!("Could not read back {}: {}", raw_path.display(), e),
        }

        emit(job, FlashState::Verifying { progress: 1.0 }, on_update);
    }
}

fn emit<F>(job: &mut FlashJob, state: FlashState, on_update: &mut F)
where
    F: FnMut(&FlashJob),
{
    if job.advance(state) {
        on_update(job);
    }
}

/// Kills the pipeline. A job only counts as cancelled once this succeeds.
fn terminate(process: &mut dyn RunningProcess) -> Result<(), String> {
    match process.kill() {
        Ok(out) => {
            log::debug!("write pipeline terminated (code {:?})", out.code);
            Ok(())
        }
        Err(e) => {
            log::error!("Failed to terminate write pipeline: {e:#}");
            Err(format!("Cancellation requested but the write pipeline could not be stopped: {e:#}"))
        }
    }
}

/// A job running on a worker thread.
pub struct FlashHandle {
    states: Receiver<FlashState>,
    cancel: CancelToken,
    thread: JoinHandle<(FlashJob, FlashResult<()>)>,
}

impl FlashHandle {
    /// Every state the job enters, in order. The stream ends when the job
    /// reaches a terminal state.
    pub fn states(&self) -> &Receiver<FlashState> {
        &self.states
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Waits for the job and returns it with its outcome.
    pub fn join(self) -> std::thread::Result<(FlashJob, FlashResult<()>)> {
        self.thread.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::test_device;
    use crate::disk::DiskRecord;
    use crate::exec::CommandOutput;
    use anyhow::{Result, anyhow};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeDisks {
        unmounted: Mutex<Vec<String>>,
        fail_unmount: bool,
    }

    impl DiskService for FakeDisks {
        fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn info(&self, id: &str) -> Result<DiskRecord> {
            Err(anyhow!("unknown disk {id}"))
        }

        fn unmount(&self, id: &str, force: bool) -> Result<()> {
            assert!(force);
            if self.fail_unmount {
                return Err(anyhow!("Unmount of {id} failed: resource busy"));
            }
            self.unmounted.lock().unwrap().push(id.to_string());
            Ok(())
        }

        fn eject(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    /// A write pipeline that exits after a fixed number of polls.
    struct FakePrivileged {
        polls_until_exit: usize,
        exit: CommandOutput,
        scripts: Mutex<Vec<String>>,
        killed: Arc<AtomicBool>,
        kill_fails: bool,
    }

    impl FakePrivileged {
        fn exiting(polls: usize, code: i32) -> Self {
            Self {
                polls_until_exit: polls,
                exit: CommandOutput {
                    code: Some(code),
                    stdout: String::new(),
                    stderr: if code == 0 { String::new() } else { "dd: /dev/sdz: Input/output error".to_string() },
                },
                scripts: Mutex::new(Vec::new()),
                killed: Arc::new(AtomicBool::new(false)),
                kill_fails: false,
            }
        }
    }

    struct FakeProcess {
        remaining: AtomicUsize,
        exit: CommandOutput,
        killed: Arc<AtomicBool>,
        kill_fails: bool,
    }

    impl RunningProcess for FakeProcess {
        fn try_wait(&mut self) -> Result<Option<CommandOutput>> {
            if self.remaining.load(Ordering::SeqCst) == 0 {
                return Ok(Some(self.exit.clone()));
            }
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }

        fn kill(&mut self) -> Result<CommandOutput> {
            if self.kill_fails {
                return Err(anyhow!("Operation not permitted"));
            }
            self.killed.store(true, Ordering::SeqCst);
            Ok(CommandOutput::default())
        }
    }

    impl PrivilegedExecutor for FakePrivileged {
        fn spawn_script(&self, script: &str) -> Result<Box<dyn RunningProcess>> {
            self.scripts.lock().unwrap().push(script.to_string());
            Ok(Box::new(FakeProcess {
                remaining: AtomicUsize::new(self.polls_until_exit),
                exit: self.exit.clone(),
                killed: self.killed.clone(),
                kill_fails: self.kill_fails,
            }))
        }
    }

    struct Fixture {
        _dir: TempDir,
        image: PathBuf,
        disks: Arc<FakeDisks>,
        privileged: Arc<FakePrivileged>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new(image_len: u64, privileged: FakePrivileged) -> Self {
            Self::with_disks(image_len, privileged, FakeDisks::default())
        }

        fn with_disks(image_len: u64, privileged: FakePrivileged, disks: FakeDisks) -> Self {
            let dir = TempDir::new().unwrap();
            let image = dir.path().join("disk.img");
            // Sparse, so multi-gigabyte images cost nothing.
            File::create(&image).unwrap().set_len(image_len).unwrap();
            Self {
                _dir: dir,
                image,
                disks: Arc::new(disks),
                privileged: Arc::new(privileged),
                clock: Arc::new(ManualClock::new()),
            }
        }

        fn flasher(&self, verify: bool) -> Flasher {
            Flasher::new(
                self.disks.clone(),
                self.privileged.clone(),
                self.clock.clone(),
                FlashOptions {
                    verify,
                    ..FlashOptions::default()
                },
            )
        }
    }

    fn run_collecting(
        flasher: &Flasher,
        job: &mut FlashJob,
        cancel: &CancelToken,
    ) -> (FlashResult<()>, Vec<FlashState>) {
        let mut states = Vec::new();
        let result = flasher.run(job, cancel, |j| states.push(j.state().clone()));
        (result, states)
    }

    fn writing_bytes(states: &[FlashState]) -> Vec<u64> {
        states
            .iter()
            .filter_map(|s| match s {
                FlashState::Writing { bytes_written, .. } => Some(*bytes_written),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn writes_four_gigabytes_to_eight_gigabyte_device() {
        let fx = Fixture::new(4_000_000_000, FakePrivileged::exiting(200, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8_000_000_000));

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        assert_eq!(result, Ok(()));
        assert_eq!(states[0], FlashState::Preparing);
        assert_eq!(states[1], FlashState::Unmounting);
        assert_eq!(
            states[2],
            FlashState::Writing {
                progress: 0.0,
                bytes_written: 0,
                total_bytes: 4_000_000_000
            }
        );
        assert_eq!(states[states.len() - 1], FlashState::Completed);
        assert_eq!(
            states[states.len() - 2],
            FlashState::Writing {
                progress: 1.0,
                bytes_written: 4_000_000_000,
                total_bytes: 4_000_000_000
            }
        );
        assert!(!states.iter().any(|s| matches!(s, FlashState::Verifying { .. })));

        let bytes = writing_bytes(&states);
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]));
        assert!(bytes.iter().all(|&b| b <= 4_000_000_000));

        assert_eq!(job.bytes_written(), 4_000_000_000);
        assert_eq!(job.total_bytes(), Some(4_000_000_000));
        assert_eq!(*job.state(), FlashState::Completed);
        assert_eq!(*fx.disks.unmounted.lock().unwrap(), vec!["sdz".to_string()]);
    }

    #[test]
    fn progress_is_extrapolated_from_assumed_throughput() {
        let fx = Fixture::new(1_000_000_000, FakePrivileged::exiting(5, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 2_000_000_000));

        let (_, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        // One sample per 0.5 s poll at 50 MB/s.
        assert_eq!(
            writing_bytes(&states),
            vec![0, 25_000_000, 50_000_000, 75_000_000, 100_000_000, 1_000_000_000]
        );
        assert_eq!(fx.clock.elapsed(), Duration::from_millis(2500));
    }

    #[test]
    fn estimate_is_clamped_to_total() {
        assert_eq!(estimate_written(Duration::from_secs(10), 50_000_000, 1_000), 1_000);
        assert_eq!(estimate_written(Duration::from_millis(500), 50_000_000, u64::MAX), 25_000_000);
    }

    #[test]
    fn exact_fit_is_allowed() {
        let fx = Fixture::new(4096, FakePrivileged::exiting(0, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 4096));

        assert_eq!(flasher.run(&mut job, &CancelToken::new(), |_| {}), Ok(()));
    }

    #[test]
    fn one_byte_too_large_is_rejected_before_unmount() {
        let fx = Fixture::new(4097, FakePrivileged::exiting(0, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 4096));

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        let expected = FlashError::InsufficientSpace {
            required: 4097,
            available: 4096,
        };
        assert_eq!(result, Err(expected.clone()));
        assert_eq!(states, vec![FlashState::Preparing, FlashState::Failed(expected)]);
        assert!(fx.disks.unmounted.lock().unwrap().is_empty());
        assert!(fx.privileged.scripts.lock().unwrap().is_empty());
    }

    #[test]
    fn unmount_failure_never_writes() {
        let disks = FakeDisks {
            fail_unmount: true,
            ..FakeDisks::default()
        };
        let fx = Fixture::with_disks(1024, FakePrivileged::exiting(0, 0), disks);
        let flasher = fx.flasher(true);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8192));

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        assert!(matches!(
            result,
            Err(FlashError::UnmountFailed { ref detail }) if detail.contains("resource busy")
        ));
        assert!(matches!(states.last(), Some(FlashState::Failed(FlashError::UnmountFailed { .. }))));
        assert!(!states.iter().any(|s| matches!(s, FlashState::Writing { .. })));
        assert!(fx.privileged.scripts.lock().unwrap().is_empty());
    }

    #[test]
    fn missing_image_fails_in_preparing() {
        let fx = Fixture::new(0, FakePrivileged::exiting(0, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(fx.image.with_file_name("missing.img"), test_device("sdz", 8192));

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        assert_eq!(result, Err(FlashError::ImageNotFound));
        assert_eq!(
            states,
            vec![FlashState::Preparing, FlashState::Failed(FlashError::ImageNotFound)]
        );
    }

    #[test]
    fn corrupt_compressed_image_fails_size_computation() {
        let fx = Fixture::new(0, FakePrivileged::exiting(0, 0));
        let image = fx.image.with_file_name("disk.img.xz");
        std::fs::write(&image, b"not an xz stream").unwrap();
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&image, test_device("sdz", 8192));

        let result = flasher.run(&mut job, &CancelToken::new(), |_| {});
        assert!(matches!(result, Err(FlashError::SizeComputationFailed(_))));
    }

    #[test]
    fn nonzero_exit_is_write_failure() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(2, 1));
        let flasher = fx.flasher(true);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8192));

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        assert_eq!(
            result,
            Err(FlashError::WriteFailed {
                code: 1,
                message: "dd: /dev/sdz: Input/output error".to_string()
            })
        );
        assert!(!states.iter().any(|s| matches!(s, FlashState::Verifying { .. })));
        assert!(matches!(job.state(), FlashState::Failed(FlashError::WriteFailed { .. })));
    }

    #[test]
    fn cancel_before_start_never_writes() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(3, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8192));
        let cancel = CancelToken::new();
        cancel.cancel();

        let (result, states) = run_collecting(&flasher, &mut job, &cancel);

        assert_eq!(result, Err(FlashError::UserCancelled));
        assert_eq!(states, vec![FlashState::Cancelled]);
        assert!(fx.privileged.scripts.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_during_unmount_stops_before_writing() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(3, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8192));
        let cancel = CancelToken::new();

        let token = cancel.clone();
        let mut states = Vec::new();
        let result = flasher.run(&mut job, &cancel, |j| {
            if *j.state() == FlashState::Unmounting {
                token.cancel();
            }
            states.push(j.state().clone());
        });

        assert_eq!(result, Err(FlashError::UserCancelled));
        assert_eq!(
            states,
            vec![FlashState::Preparing, FlashState::Unmounting, FlashState::Cancelled]
        );
        assert_eq!(job.bytes_written(), 0);
    }

    #[test]
    fn cancel_mid_write_kills_pipeline() {
        let fx = Fixture::new(1_000_000_000, FakePrivileged::exiting(1_000, 0));
        let flasher = fx.flasher(true);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 2_000_000_000));
        let cancel = CancelToken::new();

        let token = cancel.clone();
        let mut states = Vec::new();
        let result = flasher.run(&mut job, &cancel, |j| {
            if j.bytes_written() >= 100_000_000 {
                token.cancel();
            }
            states.push(j.state().clone());
        });

        assert_eq!(result, Err(FlashError::UserCancelled));
        assert!(fx.privileged.killed.load(Ordering::SeqCst));
        assert_eq!(states.last(), Some(&FlashState::Cancelled));
        assert!(!states.contains(&FlashState::Completed));
        assert_eq!(job.bytes_written(), 100_000_000);
    }

    #[test]
    fn unkillable_pipeline_is_not_reported_as_cancelled() {
        let mut privileged = FakePrivileged::exiting(1_000, 0);
        privileged.kill_fails = true;
        let fx = Fixture::new(1_000_000_000, privileged);
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 2_000_000_000));
        let cancel = CancelToken::new();

        let token = cancel.clone();
        let mut states = Vec::new();
        let result = flasher.run(&mut job, &cancel, |j| {
            if matches!(j.state(), FlashState::Writing { .. }) {
                token.cancel();
            }
            states.push(j.state().clone());
        });

        assert!(matches!(
            result,
            Err(FlashError::WriteFailed { code: -1, ref message }) if message.contains("not permitted")
        ));
        assert!(!states.contains(&FlashState::Cancelled));
        assert!(matches!(states.last(), Some(FlashState::Failed(_))));
    }

    #[test]
    fn verify_hashes_device_prefix() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(0, 0));
        let device_file = fx.image.with_file_name("device.bin");
        let contents: Vec<u8> = (0..(2 * 1024 * 1024)).map(|i| (i % 13) as u8).collect();
        std::fs::write(&device_file, &contents).unwrap();

        let mut device = test_device("sdz", 8192);
        device.raw_path = device_file;
        let flasher = fx.flasher(true);
        let mut job = FlashJob::new(&fx.image, device);

        let (result, states) = run_collecting(&flasher, &mut job, &CancelToken::new());

        assert_eq!(result, Ok(()));
        let expected = integrity::checksum_prefix(&contents[..], 1024 * 1024).unwrap();
        assert_eq!(job.device_digest(), Some(expected.as_str()));
        let n = states.len();
        assert_eq!(states[n - 3], FlashState::Verifying { progress: 0.0 });
        assert_eq!(states[n - 2], FlashState::Verifying { progress: 1.0 });
        assert_eq!(states[n - 1], FlashState::Completed);
    }

    #[test]
    fn unreadable_device_does_not_fail_verify() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(0, 0));
        let mut device = test_device("sdz", 8192);
        device.raw_path = fx.image.with_file_name("no-such-device");
        let flasher = fx.flasher(true);
        let mut job = FlashJob::new(&fx.image, device);

        assert_eq!(flasher.run(&mut job, &CancelToken::new(), |_| {}), Ok(()));
        assert_eq!(job.device_digest(), None);
    }

    #[test]
    fn script_decodes_into_dd() {
        let image = SourceImage::new("/images/it's.img.gz");
        let script = write_script(&image, Path::new("/dev/sdz"), "4M");
        assert!(script.ends_with(
            r"gzip '-dc' '/images/it'\''s.img.gz' | dd of='/dev/sdz' bs='4M' conv=fsync status=progress"
        ));

        let fx = Fixture::new(16, FakePrivileged::exiting(0, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 8192));
        flasher.run(&mut job, &CancelToken::new(), |_| {}).unwrap();

        let scripts = fx.privileged.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("cat '"));
    }

    #[test]
    fn eta_appears_after_one_percent() {
        let fx = Fixture::new(1_000_000_000, FakePrivileged::exiting(10, 0));
        let flasher = fx.flasher(false);
        let mut job = FlashJob::new(&fx.image, test_device("sdz", 2_000_000_000));

        let mut etas = Vec::new();
        flasher
            .run(&mut job, &CancelToken::new(), |j| {
                if matches!(j.state(), FlashState::Writing { .. }) {
                    etas.push(j.estimated_time_remaining());
                }
            })
            .unwrap();

        assert_eq!(etas[0], None);
        // 25 MB of 1 GB after 0.5 s: 2.5 % done, 19.5 s to go.
        let eta = etas[1].unwrap();
        let expected = Duration::from_millis(19_500);
        assert!(eta.abs_diff(expected) < Duration::from_millis(1), "{eta:?}");
        assert_eq!(job.estimated_time_remaining(), None);
    }

    #[test]
    fn transitions_never_move_backwards() {
        let mut job = FlashJob::new("/tmp/x.img", test_device("sdz", 100));
        assert!(job.advance(FlashState::Preparing));
        assert!(!job.advance(FlashState::Idle));
        assert!(!job.advance(FlashState::Preparing));
        assert!(job.advance(FlashState::Writing {
            progress: 0.5,
            bytes_written: 50,
            total_bytes: 100
        }));
        assert!(!job.advance(FlashState::Writing {
            progress: 0.4,
            bytes_written: 40,
            total_bytes: 100
        }));
        assert!(!job.advance(FlashState::Unmounting));
        assert!(job.advance(FlashState::Cancelled));
        assert!(!job.advance(FlashState::Completed));
        assert_eq!(*job.state(), FlashState::Cancelled);
    }

    #[test]
    fn readiness_predicate() {
        let device = test_device("sdz", 100);
        let image = Path::new("a.img");
        assert!(can_start_write(Some(image), Some(&device), &FlashState::Idle));
        assert!(can_start_write(Some(image), Some(&device), &FlashState::Completed));
        assert!(!can_start_write(None, Some(&device), &FlashState::Idle));
        assert!(!can_start_write(Some(image), None, &FlashState::Idle));
        assert!(!can_start_write(Some(image), Some(&device), &FlashState::Unmounting));
    }

    #[test]
    fn handle_streams_states_and_joins() {
        let fx = Fixture::new(1024, FakePrivileged::exiting(2, 0));
        let flasher = fx.flasher(false);
        let handle = flasher.start(FlashJob::new(&fx.image, test_device("sdz", 8192)));

        let states: Vec<FlashState> = handle.states().iter().collect();
        let (job, result) = handle.join().unwrap();

        assert_eq!(result, Ok(()));
        assert_eq!(states.first(), Some(&FlashState::Preparing));
        assert_eq!(states.last(), Some(&FlashState::Completed));
        assert_eq!(job.bytes_written(), 1024);
    }
}
