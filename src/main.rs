use changedetect::{
    app::{App, ScreenModel},
    app_dirs::AppDirs,
    archive::ResultsArchive,
    clock::{Clock, SystemClock},
    config::{AppConfig, ConfigStore, ExperimentConfig, FileConfigStore},
    device::{device_id, Fingerprint},
    flow::{Experiment, Services},
    lang::Language,
    network::{Endpoint, HttpEndpoint, OfflineEndpoint},
    runtime::{CrosstermInputSource, FixedTicker, InputEvent, InputSource, Runner, Ticker},
    storage::{DurableStore, FileStore, MemoryStore},
};
use clap::{error::ErrorKind, CommandFactory, Parser};
use crossterm::{
    event::{DisableFocusChange, EnableFocusChange, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    tty::IsTty,
};
use rand::{rngs::StdRng, SeedableRng};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    Frame, Terminal,
};
use std::{
    error::Error,
    fs::{self, OpenOptions},
    io::{self, stdin},
    path::PathBuf,
    rc::Rc,
    sync::Mutex,
    time::Duration,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TICK_RATE_MS: u64 = 50;
const LOG_FILTER_ENV: &str = "CHANGEDETECT_LOG";

/// change-detection working memory experiment for the terminal
#[derive(Parser, Debug, Clone)]
#[clap(
    version,
    about,
    long_about = "Runs a visual working-memory experiment: coloured squares are shown, hidden, and shown again, and the participant reports whether any of them moved. Results are posted to a spreadsheet endpoint and archived locally."
)]
pub struct Cli {
    /// results endpoint accepting JSON posts (offline when unset)
    #[clap(short = 'e', long)]
    endpoint_url: Option<String>,

    /// spreadsheet opened from the admin control panel
    #[clap(long)]
    spreadsheet_url: Option<String>,

    /// interface language
    #[clap(short = 'l', long, value_enum)]
    language: Option<Language>,

    /// read settings from this file instead of the platform config dir
    #[clap(short = 'c', long)]
    config: Option<PathBuf>,

    /// seed the random generator for a reproducible run
    #[clap(long)]
    seed: Option<u64>,

    /// write the local results archive as CSV to this path and exit
    #[clap(long, value_name = "PATH")]
    export_csv: Option<PathBuf>,

    /// persist the effective settings to the config file
    #[clap(long)]
    save_config: bool,
}

impl Cli {
    /// Command line values take precedence over the stored settings.
    fn merge_into(&self, mut cfg: AppConfig) -> AppConfig {
        if let Some(url) = &self.endpoint_url {
            cfg.endpoint_url = Some(url.clone());
        }
        if let Some(url) = &self.spreadsheet_url {
            cfg.spreadsheet_url = Some(url.clone());
        }
        if let Some(language) = self.language {
            cfg.language = language;
        }
        cfg
    }

    fn config_store(&self) -> FileConfigStore {
        match &self.config {
            Some(path) => FileConfigStore::with_path(path),
            None => FileConfigStore::new(),
        }
    }

    fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

fn init_logging() {
    let Some(path) = AppDirs::log_path() else {
        return;
    };
    if let Some(parent) = path.parent() {
        if fs::create_dir_all(parent).is_err() {
            return;
        }
    }
    let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
        return;
    };
    let filter = EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .try_init();
}

fn open_store() -> Rc<dyn DurableStore> {
    match AppDirs::store_path() {
        Some(path) => Rc::new(FileStore::open(path)),
        None => {
            warn!("no state directory, participation records will not persist");
            Rc::new(MemoryStore::new())
        }
    }
}

fn open_endpoint(cfg: &AppConfig) -> Rc<dyn Endpoint> {
    match cfg.endpoint_url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => match HttpEndpoint::new(url) {
            Ok(endpoint) => Rc::new(endpoint),
            Err(err) => {
                warn!(%err, "could not build http client, running offline");
                Rc::new(OfflineEndpoint)
            }
        },
        None => Rc::new(OfflineEndpoint),
    }
}

fn open_archive() -> Option<ResultsArchive> {
    match ResultsArchive::open_default() {
        Ok(archive) => Some(archive),
        Err(err) => {
            warn!(%err, "local results archive unavailable");
            None
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging();

    let store = cli.config_store();
    let cfg = cli.merge_into(store.load());
    if cli.save_config {
        store.save(&cfg)?;
        info!(path = %store.path().display(), "settings saved");
    }

    if let Some(path) = &cli.export_csv {
        let archive = ResultsArchive::open_default()?;
        let rows = archive.export_csv(path)?;
        println!("exported {rows} sessions to {}", path.display());
        return Ok(());
    }

    if !stdin().is_tty() {
        let mut cmd = Cli::command();
        cmd.error(ErrorKind::Io, "stdin must be a tty").exit();
    }

    let durable = open_store();
    let id = device_id(durable.as_ref(), &Fingerprint::collect());
    let services = Services {
        durable,
        endpoint: open_endpoint(&cfg),
        archive: open_archive(),
        device_id: id,
        language: cfg.language,
        admin_password: cfg.effective_admin_password(),
    };
    let flow = Experiment::new(
        ExperimentConfig::default(),
        SystemClock::new(),
        ScreenModel::default(),
        cli.rng(),
        services,
    );
    let mut app = App::new(flow, cfg.spreadsheet_url.clone());

    enable_raw_mode()?;

    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableFocusChange)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let runner = Runner::new(
        CrosstermInputSource::new(),
        FixedTicker::new(Duration::from_millis(TICK_RATE_MS)),
    );
    let result = start_tui(&mut terminal, &mut app, &runner);

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        DisableFocusChange,
        LeaveAlternateScreen,
    )?;
    terminal.show_cursor()?;

    result
}

fn start_tui<B: Backend, E: InputSource, T: Ticker, C: Clock + Clone>(
    terminal: &mut Terminal<B>,
    app: &mut App<C>,
    runner: &Runner<E, T>,
) -> Result<(), Box<dyn Error>> {
    let stage = app.flow.start();
    info!(%stage, device = app.flow.device_id(), "experiment started");
    terminal.draw(|f| ui(app, f))?;

    while !app.should_quit {
        match runner.step() {
            InputEvent::Key(key) if key.kind == KeyEventKind::Press => app.on_key(key),
            InputEvent::Key(_) | InputEvent::FocusGained => {}
            InputEvent::FocusLost => app.on_focus_lost(),
            InputEvent::Resize | InputEvent::Tick => app.on_tick(),
        }
        terminal.draw(|f| ui(app, f))?;
    }

    info!(stage = %app.flow.stage(), "experiment closed");
    Ok(())
}

fn ui<C: Clock + Clone>(app: &App<C>, f: &mut Frame) {
    f.render_widget(app, f.area());
}
