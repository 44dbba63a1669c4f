use anyhow::{Context, Result};
use clap::{Arg, ArgMatches, Command};
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod app;
mod chat;
mod config;
mod error;
mod session;
mod transport;
mod ui;

use app::App;
use config::Config;
use session::Session;

fn cli() -> Command {
    Command::new("gigchat")
        .version("0.1.0")
        .author("GigChat Team")
        .about("Terminal client for GigChat direct messages")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Config file (defaults to the user config directory)"),
        )
        .arg(
            Arg::new("api-url")
                .long("api-url")
                .value_name("URL")
                .help("REST API base, e.g. http://localhost:5000/api"),
        )
        .arg(
            Arg::new("ws-base")
                .long("ws-base")
                .value_name("URL")
                .help("Realtime server origin (derived from --api-url by default)"),
        )
        .arg(
            Arg::new("web-url")
                .long("web-url")
                .value_name("URL")
                .help("Web client origin used by /full"),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("TOKEN")
                .help("Bearer token for the API and realtime server"),
        )
        .arg(
            Arg::new("user-id")
                .long("user-id")
                .value_name("ID")
                .help("Your user id"),
        )
        .arg(
            Arg::new("session")
                .long("session")
                .value_name("FILE")
                .help("Stored session JSON with the user and token"),
        )
        .arg(
            Arg::new("peer")
                .short('p')
                .long("peer")
                .value_name("USER_ID")
                .help("Open a conversation with this user on startup"),
        )
}

fn apply_cli(config: &mut Config, matches: &ArgMatches) {
    let value = |id: &str| matches.get_one::<String>(id).cloned();

    if let Some(api_url) = value("api-url") {
        config.api_url = api_url;
    }
    if let Some(ws_base) = value("ws-base") {
        config.ws_base = Some(ws_base);
    }
    if let Some(web_url) = value("web-url") {
        config.web_url = web_url;
    }
    if let Some(token) = value("token") {
        config.token = Some(token);
    }
    if let Some(user_id) = value("user-id") {
        config.user_id = Some(user_id);
    }
    if let Some(session) = value("session") {
        config.session_file = Some(PathBuf::from(session));
    }
}

/// The terminal belongs to the UI, so logs go to a file.
fn init_logging(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gigchat=info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;
    apply_cli(&mut config, &matches);

    init_logging(&config.log_file())?;
    info!("Starting gigchat against {}", config.api_url);

    let session = Session::resolve(&config).await?;
    let auto_peer = matches.get_one::<String>("peer").map(|s| s.as_str());

    let mut app = App::new(config, session, auto_peer).await?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, &mut app).await;

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> Result<()> {
    let mut last_tick = Instant::now();
    let tick_rate = Duration::from_millis(250);

    loop {
        terminal.draw(|f| ui::draw(f, app))?;

        let timeout_duration = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));

        if event::poll(timeout_duration)? {
            let event = event::read()?;
            app.handle_input(event).await?;
        }

        if last_tick.elapsed() >= tick_rate {
            app.on_tick().await?;
            last_tick = Instant::now();
        }

        if app.should_quit {
            return Ok(());
        }
    }
}
