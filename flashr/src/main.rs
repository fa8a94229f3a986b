use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use flashr_core::clock::SystemClock;
use flashr_core::compression;
use flashr_core::device::{BlockDevice, matches_device_name};
use flashr_core::enumerator::{DEFAULT_REFRESH_INTERVAL, DeviceEnumerator};
use flashr_core::exec::{PrivilegeHelper, ShellPrivileged};
use flashr_core::flash::{FlashJob, FlashOptions, FlashState, Flasher, inspect_image};
use flashr_core::{FlashError, format, integrity, platform};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{IsTerminal, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Parser)]
#[command(name = "flashr")]
#[command(about = "A safe, interactive disk image flasher", version)]
struct Cli {
    /// Log phase changes (same as --log-filter info)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// env_logger-style filter string (e.g. "debug,flashr_core=trace"); overrides RUST_LOG
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an image to a device interactively
    Write {
        /// Image file to write (.img, .iso, optionally .gz/.xz/.zip/.bz2/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Target device name (e.g. sdb); prompts if omitted
        #[arg(short, long)]
        device: Option<String>,

        /// Skip the post-write read-back probe
        #[arg(short = 'n', long = "no-verify")]
        no_verify: bool,

        /// Block size handed to dd
        #[arg(long, default_value = "4M")]
        block_size: String,

        /// Assumed write speed in bytes per second, used to estimate progress
        #[arg(long, default_value_t = 50_000_000)]
        throughput: u64,

        /// Program used to gain root when not already running as root
        #[arg(long, default_value = "pkexec")]
        privilege_helper: String,

        /// Power off the device after a successful write
        #[arg(long)]
        eject: bool,
    },
    /// List available removable devices
    List,
    /// Watch removable devices come and go
    Watch {
        /// Seconds between scans
        #[arg(long, default_value_t = DEFAULT_REFRESH_INTERVAL.as_secs())]
        interval: u64,
    },
    /// Print an image's SHA-256 and decoded size
    Checksum {
        #[arg(required = true)]
        image: PathBuf,
    },
}

fn init_logging(verbose: bool, cli_filter: Option<&str>) {
    let default = if verbose { "info" } else { DEFAULT_LOG_FILTER };
    let env = env_logger::Env::default().default_filter_or(default);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.init();
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Disabling it keeps the progress bars intact when the user cancels.
/// The original terminal state is restored when this struct is dropped.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            let original_termios = stdout()
                .is_terminal()
                .then(|| Termios::from_fd(fd).ok())
                .flatten()
                .filter(|original| {
                    let mut quiet = *original;
                    quiet.c_lflag &= !ECHOCTL;
                    tcsetattr(fd, TCSANOW, &quiet).is_ok()
                });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

fn scan_devices() -> (Arc<DeviceEnumerator>, Arc<Vec<BlockDevice>>) {
    let enumerator = Arc::new(DeviceEnumerator::new(platform::disk_service()));
    enumerator.refresh();
    let devices = enumerator.devices();
    (enumerator, devices)
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[BlockDevice], prompt: &str) -> Result<BlockDevice> {
    if devices.is_empty() {
        return Err(anyhow!("No removable devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Asks the user to type the device name. Anything else aborts.
fn confirm_device_name(device: &BlockDevice) -> Result<bool> {
    let input: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Type '{}' to erase it and continue", device.name))
        .allow_empty(true)
        .interact_text()?;

    Ok(matches_device_name(&input, device))
}

fn spinner() -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:12} [{elapsed_precise}] {spinner:.blue} {msg}")?
            .tick_strings(&["■    ", " ■   ", "  ■  ", "   ■ ", "    ■", "   ■ ", "  ■  ", " ■   ", "■■■■■"]),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

fn write_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_prefix("Writing");
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} (~{bytes_per_sec}, {eta})",
            )?
            .progress_chars("■ "),
    );
    Ok(pb)
}

/// Keeps the on-screen progress in step with the job's state stream.
struct ProgressView {
    status: ProgressBar,
    write: Option<ProgressBar>,
}

impl ProgressView {
    fn new() -> Result<Self> {
        Ok(Self {
            status: spinner()?,
            write: None,
        })
    }

    fn update(&mut self, state: &FlashState) -> Result<()> {
        match state {
            FlashState::Idle => {}
            FlashState::Preparing => {
                self.status.set_prefix("Preparing");
                self.status.set_message("Validating image and computing size...");
            }
            FlashState::Unmounting => {
                self.status.set_prefix("Unmounting");
                self.status.set_message("Releasing mounted partitions...");
            }
            FlashState::Writing {
                bytes_written,
                total_bytes,
                ..
            } => {
                if self.write.is_none() {
                    self.status.finish_and_clear();
                    self.write = Some(write_bar(*total_bytes)?);
                }
                if let Some(bar) = &self.write {
                    bar.set_position(*bytes_written);
                }
            }
            FlashState::Verifying { .. } => {
                if let Some(bar) = self.write.take() {
                    bar.finish_with_message("Write complete.");
                }
                if self.status.is_finished() {
                    self.status = spinner()?;
                }
                self.status.set_prefix("Verifying");
                self.status.set_message("Reading back the first MiB...");
            }
            FlashState::Completed => {
                if let Some(bar) = self.write.take() {
                    bar.finish_with_message("Write complete.");
                }
                self.status.finish_and_clear();
            }
            FlashState::Failed(_) | FlashState::Cancelled => {
                if let Some(bar) = self.write.take() {
                    bar.abandon_with_message("❌ Operation failed.");
                }
                self.status.finish_and_clear();
            }
        }
        Ok(())
    }
}

struct WriteArgs {
    image: PathBuf,
    device: Option<String>,
    verify: bool,
    options: FlashOptions,
    privilege_helper: String,
    eject: bool,
}

fn run_write(args: WriteArgs, running: Arc<AtomicBool>) -> Result<()> {
    let WriteArgs {
        image,
        device,
        verify,
        options,
        privilege_helper,
        eject,
    } = args;

    integrity::validate(&image).with_context(|| format!("Cannot use {}", image.display()))?;
    if !integrity::is_supported_image(&image) {
        log::warn!("{} has an unusual extension; writing it as-is", image.display());
    }
    let kind = compression::classify(&image);

    let (enumerator, devices) = scan_devices();
    let device = match device {
        Some(name) => enumerator
            .find(&name)
            .ok_or_else(|| anyhow!("'{name}' is not a removable device. Run `flashr list`."))?,
        None => select_device(&devices, "Select the target device to WRITE to")?,
    };

    println!(
        "{} This will erase all data on '{}' ({}).",
        style("WARNING:").red().bold(),
        device.name,
        format::bytes(device.size),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    println!("  Model:  {}", style(device.display_name()).cyan());
    println!("  Image:  {} [{}]", style(image.display()).cyan(), kind);
    println!();

    if !confirm_device_name(&device)? {
        println!("Name did not match. Write operation cancelled.");
        return Ok(());
    }
    println!();

    let flasher = Flasher::new(
        platform::disk_service(),
        Arc::new(ShellPrivileged::new(PrivilegeHelper::detect(&privilege_helper))),
        Arc::new(SystemClock),
        FlashOptions { verify, ..options },
    );

    let handle = flasher.start(FlashJob::new(&image, device.clone()));
    let mut view = ProgressView::new()?;
    loop {
        if !running.load(Ordering::SeqCst) {
            handle.cancel();
        }
        match handle.states().recv_timeout(Duration::from_millis(100)) {
            Ok(state) => view.update(&state)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let (job, result) = handle
        .join()
        .map_err(|_| anyhow!("The flash worker thread panicked"))?;

    match result {
        Ok(()) => {
            if let Some(digest) = job.device_digest() {
                println!("  First MiB SHA-256: {}", style(digest).dim());
            }
            println!(
                "\n✨ Successfully flashed {} with {} ({}).",
                style(device.path.display()).cyan(),
                style(image.display()).cyan(),
                format::bytes(job.bytes_written()),
            );
            if eject {
                flasher.eject(&device)?;
                println!("Device powered off. It is safe to remove.");
            }
            Ok(())
        }
        Err(FlashError::UserCancelled) => {
            println!("Write operation cancelled. The device may hold a partial image.");
            Err(FlashError::UserCancelled.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_list() -> Result<()> {
    let (_, devices) = scan_devices();
    if devices.is_empty() {
        println!("No removable devices found.");
        return Ok(());
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<32} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<32} {:-<10} {:-<20}", "", "", "", "");
    for device in devices.iter() {
        let location = match &device.mount_point {
            Some(mp) => mp.display().to_string(),
            None => "(Not mounted)".to_string(),
        };
        let name = [device.vendor.as_str(), device.model.as_str()]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "  {:<12} {:<32} {:>10}  {}",
            device.path.display(),
            if name.is_empty() { &device.name } else { &name },
            format::bytes(device.size),
            location
        );
    }
    Ok(())
}

fn run_watch(interval: u64, running: Arc<AtomicBool>) -> Result<()> {
    if interval == 0 {
        bail!("--interval must be at least 1 second");
    }
    let (enumerator, mut shown) = scan_devices();
    let watcher = enumerator.watch_every(Duration::from_secs(interval));

    println!("Watching for removable devices. Press Ctrl+C to stop.\n");
    print_snapshot(&shown);
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        let current = enumerator.devices();
        if current != shown {
            print_snapshot(&current);
            shown = current;
        }
    }

    watcher.stop();
    Ok(())
}

fn print_snapshot(devices: &[BlockDevice]) {
    if devices.is_empty() {
        println!("{} no removable devices", style("•").dim());
    }
    for device in devices {
        println!("{} {}", style("•").green(), device);
    }
    println!();
}

fn run_checksum(image: PathBuf) -> Result<()> {
    let pb = spinner()?;
    pb.set_prefix("Inspecting");
    pb.set_message(image.display().to_string());

    let info = inspect_image(&image)?;
    pb.set_prefix("Hashing");
    let digest = integrity::checksum(&image)
        .with_context(|| format!("Failed to read {}", image.display()))?;
    pb.finish_and_clear();

    println!("{}  {}", digest, image.display());
    println!(
        "  Compression: {}\n  Payload:     {} ({} bytes)",
        info.kind,
        format::bytes(info.size),
        info.size
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_filter.as_deref());

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // Cleared by Ctrl+C; long-running commands poll it.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    match cli.command {
        Commands::Write {
            image,
            device,
            no_verify,
            block_size,
            throughput,
            privilege_helper,
            eject,
        } => run_write(
            WriteArgs {
                image,
                device,
                verify: !no_verify,
                options: FlashOptions {
                    block_size,
                    assumed_throughput: throughput,
                    ..FlashOptions::default()
                },
                privilege_helper,
                eject,
            },
            running,
        ),
        Commands::List => run_list(),
        Commands::Watch { interval } => run_watch(interval, running),
        Commands::Checksum { image } => run_checksum(image),
    }
}
