use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use oled_sleeper_shared::{app_dir, Behavior, ManagedMonitorConfig, SettingsStore};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[cfg(windows)]
const SINGLE_INSTANCE_MUTEX: &str = "OLEDSleeperMutex";
#[cfg(windows)]
const SETTINGS_RELOAD_INTERVAL: std::time::Duration = std::time::Duration::from_millis(2000);

/// OLED-Sleeper - black out or dim OLED monitors nobody is using
#[derive(Parser, Debug)]
#[command(name = "oled-sleeper", version, about)]
struct Cli {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding settings.json and brightness_state.json
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch monitors and apply idle behavior until stopped (default)
    Run,
    /// List connected monitors
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Restore brightness left dimmed by a previous run, then exit
    Restore,
    /// Manage a monitor, or change its settings
    Manage(ManageArgs),
    /// Stop managing a monitor
    Unmanage {
        /// Hardware id as shown by `list`
        hardware_id: String,
    },
}

#[derive(Args, Debug)]
struct ManageArgs {
    /// Hardware id as shown by `list`
    hardware_id: String,

    /// What to do once the monitor is idle
    #[arg(long, value_enum, default_value_t = BehaviorArg::Blackout)]
    behavior: BehaviorArg,

    /// Brightness while dimmed, in percent of the monitor's maximum
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(0..=100))]
    dim_level: u8,

    /// Seconds without activity before the monitor counts as idle
    #[arg(long, default_value_t = 60)]
    idle_secs: u64,

    /// Ignore keyboard and mouse input
    #[arg(long)]
    no_input: bool,

    /// Ignore the cursor being on this monitor
    #[arg(long)]
    no_mouse: bool,

    /// Ignore the foreground window overlapping this monitor
    #[arg(long)]
    no_window: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BehaviorArg {
    Blackout,
    Dim,
}

impl From<BehaviorArg> for Behavior {
    fn from(arg: BehaviorArg) -> Self {
        match arg {
            BehaviorArg::Blackout => Behavior::Blackout,
            BehaviorArg::Dim => Behavior::Dim,
        }
    }
}

impl ManageArgs {
    fn to_config(&self) -> Result<ManagedMonitorConfig, String> {
        let config = ManagedMonitorConfig {
            is_managed: true,
            behavior: self.behavior.into(),
            dim_level: self.dim_level,
            idle_threshold_ms: self.idle_secs.saturating_mul(1000),
            on_input: !self.no_input,
            on_mouse_position: !self.no_mouse,
            on_active_window: !self.no_window,
            ..ManagedMonitorConfig::new(self.hardware_id.clone())
        };
        if !config.has_any_trigger() {
            return Err("at least one of input, mouse or window activity must count".to_string());
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let data_dir = cli.data_dir.clone().unwrap_or_else(app_dir);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&data_dir),
        Command::List { json } => list_monitors(&data_dir, json),
        Command::Restore => restore(&data_dir),
        Command::Manage(args) => manage(&data_dir, &args),
        Command::Unmanage { hardware_id } => unmanage(&data_dir, &hardware_id),
    }
}

fn manage(data_dir: &Path, args: &ManageArgs) -> ExitCode {
    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };
    let store = SettingsStore::in_dir(data_dir);
    match store.upsert(config) {
        Ok(()) => {
            info!("Managing {}", args.hardware_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Could not save settings: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn unmanage(data_dir: &Path, hardware_id: &str) -> ExitCode {
    let store = SettingsStore::in_dir(data_dir);
    match store.remove(hardware_id) {
        Ok(true) => {
            info!("No longer managing {}", hardware_id);
            ExitCode::SUCCESS
        }
        Ok(false) => {
            warn!("{} was not in the settings", hardware_id);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Could not save settings: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(windows)]
fn run_daemon(data_dir: &Path) -> ExitCode {
    use oled_sleeper::brightness::BrightnessLedger;
    use oled_sleeper::platform::win32::{
        enable_dpi_awareness, InstanceGuard, ShellHooks, UiThread, Win32Activity, Win32Directory,
        Win32DisplayControl, Win32Overlays,
    };
    use oled_sleeper::worker::Worker;
    use oled_sleeper::{Orchestrator, Platform, Timing};
    use oled_sleeper_shared::{BrightnessStateFile, Signal};
    use std::sync::{Arc, OnceLock};
    use std::thread;

    let _instance = match InstanceGuard::acquire(SINGLE_INSTANCE_MUTEX) {
        Ok(Some(guard)) => guard,
        Ok(None) => {
            warn!("OLED-Sleeper is already running");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            error!("Single-instance check failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("OLED-Sleeper v{} starting", env!("CARGO_PKG_VERSION"));
    enable_dpi_awareness();

    let restore = Arc::new(Signal::<()>::new());
    let running: Arc<OnceLock<Arc<Orchestrator>>> = Arc::new(OnceLock::new());

    let hooks = ShellHooks {
        session_ending: {
            let restore = restore.clone();
            Box::new(move || restore.emit(&()))
        },
        display_changed: {
            let running = running.clone();
            Box::new(move || {
                if let Some(orchestrator) = running.get() {
                    orchestrator.refresh_topology();
                }
            })
        },
    };
    let ui = match UiThread::create(hooks) {
        Ok(ui) => ui,
        Err(e) => {
            error!("Failed to create the shell window: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let settings = Arc::new(SettingsStore::in_dir(data_dir));
    let ledger = BrightnessLedger::load(BrightnessStateFile::in_dir(data_dir));
    let platform = Platform {
        directory: Arc::new(Win32Directory::new()),
        control: Arc::new(Win32DisplayControl::new()),
        overlays: Arc::new(Win32Overlays::new(ui)),
        activity: Arc::new(Win32Activity::new()),
    };
    let orchestrator = Orchestrator::new(
        platform,
        settings.clone(),
        ledger,
        &restore,
        Timing::default(),
    );
    let _ = running.set(orchestrator.clone());

    // off the UI thread: the first reconcile may need it to create overlays
    let startup = {
        let orchestrator = orchestrator.clone();
        thread::Builder::new().name("startup".to_string()).spawn(move || {
            if let Err(e) = orchestrator.start() {
                error!("Failed to start: {}", e);
                ui.close();
            }
        })
    };
    if let Err(e) = &startup {
        error!("Failed to spawn startup thread: {}", e);
        ui.close();
    }

    let reload = Worker::spawn("settings-reload", SETTINGS_RELOAD_INTERVAL, move |_| {
        settings.reload_if_modified();
    });
    if let Err(e) = &reload {
        warn!("Settings file will not be watched: {}", e);
    }

    ui.run();

    info!("Shutting down");
    if let Ok(reload) = reload {
        reload.stop();
    }
    if let Ok(startup) = startup {
        let _ = startup.join();
    }
    orchestrator.shutdown();
    ExitCode::SUCCESS
}

#[cfg(windows)]
fn list_monitors(data_dir: &Path, json: bool) -> ExitCode {
    use oled_sleeper::monitor::MonitorDirectory;
    use oled_sleeper::platform::win32::Win32Directory;

    let directory = Win32Directory::new();
    let mut monitors = directory.list_monitors();
    for monitor in monitors.iter_mut() {
        monitor.ddc_ci = Some(directory.probe_ddc_ci_support(&monitor.identity));
    }
    monitors.sort_by_key(|m| m.identity.display_number);

    if json {
        match serde_json::to_string_pretty(&monitors) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                error!("Could not serialize monitors: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let configs = SettingsStore::in_dir(data_dir).load();
    for m in &monitors {
        let managed = configs
            .iter()
            .any(|c| c.is_managed && c.hardware_id == m.identity.hardware_id);
        println!(
            "#{}{} {}  {}  {}%  DDC/CI: {}  {}",
            m.identity.display_number,
            if m.identity.is_primary { "*" } else { " " },
            m.identity.device_name,
            m.bounds,
            m.identity.scale_percent(),
            if m.supports_ddc_ci() { "yes" } else { "no" },
            if managed { "managed" } else { "-" },
        );
        println!("    {}", m.identity.hardware_id);
    }
    ExitCode::SUCCESS
}

#[cfg(windows)]
fn restore(data_dir: &Path) -> ExitCode {
    use oled_sleeper::brightness::{BrightnessController, BrightnessLedger};
    use oled_sleeper::platform::win32::{Win32Directory, Win32DisplayControl};
    use oled_sleeper_shared::BrightnessStateFile;
    use std::sync::Arc;

    let ledger = BrightnessLedger::load(BrightnessStateFile::in_dir(data_dir));
    if ledger.is_empty() {
        info!("Nothing to restore");
        return ExitCode::SUCCESS;
    }
    let controller = BrightnessController::new(
        Arc::new(Win32Directory::new()),
        Arc::new(Win32DisplayControl::new()),
        ledger,
    );
    let restored = controller.recover();
    let left = controller.ledger().entries().len();
    info!("Restored {} monitor(s)", restored);
    if left > 0 {
        warn!("{} monitor(s) not connected, kept for the next run", left);
    }
    ExitCode::SUCCESS
}

#[cfg(not(windows))]
fn run_daemon(_data_dir: &Path) -> ExitCode {
    unsupported("run")
}

#[cfg(not(windows))]
fn list_monitors(_data_dir: &Path, _json: bool) -> ExitCode {
    unsupported("list")
}

#[cfg(not(windows))]
fn restore(_data_dir: &Path) -> ExitCode {
    unsupported("restore")
}

#[cfg(not(windows))]
fn unsupported(command: &str) -> ExitCode {
    error!("`{}` needs Windows: monitors are enumerated and controlled through Win32", command);
    ExitCode::FAILURE
}
