use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use warren::api;
use warren::container::{
    ContainerPool, ContainerRuntime, ContainerRuntimeApi, PoolConfig, RuntimeType,
};
use warren::db;
use warren::monitor::{AlertThresholds, MetricsRepository, MonitorConfig, ResourceMonitor};
use warren::session::{SessionManager, SessionManagerConfig, SessionRepository};

const APP_NAME: &str = "warren";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let mut ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Warren - disposable sandbox shell platform.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the sandbox platform server
    Serve(ServeCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Default sandbox container image
    #[arg(long)]
    image: Option<String>,
    /// Base host port for container SSH allocation
    #[arg(long)]
    base_port: Option<u16>,
    /// Skip pool warmup at startup
    #[arg(long)]
    no_warmup: bool,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&mut paths, &common)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("warren={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        let data_dir = default_data_dir()?;
        let state_dir = default_state_dir()?;

        Ok(Self {
            config_file,
            data_dir,
            state_dir,
        })
    }

    fn apply_overrides(mut self, cfg: &AppConfig) -> Result<Self> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        if let Some(ref state_override) = cfg.paths.state_dir {
            self.state_dir = expand_str_path(state_override)?;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    container: ContainerRuntimeConfig,
    pool: PoolSettings,
    session: SessionSettings,
    monitor: MonitorSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
    file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ContainerRuntimeConfig {
    /// Container runtime type: "docker" or "podman" (auto-detected if not set)
    runtime: Option<RuntimeType>,
    /// Custom path to the container runtime binary
    binary: Option<String>,
    /// Default sandbox image
    default_image: String,
    /// Host the published SSH ports are reachable on
    ssh_host: String,
    /// Base host port for container SSH allocation
    base_port: u16,
}

impl Default for ContainerRuntimeConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            default_image: "warren-sandbox:latest".to_string(),
            ssh_host: "127.0.0.1".to_string(),
            base_port: 42100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PoolSettings {
    /// Entries maintenance keeps per profile
    min_pool_size: usize,
    /// Entries a profile may hold
    max_pool_size: usize,
    /// Seconds an unleased pooled container may idle before eviction
    idle_eviction_secs: u64,
    /// Seconds to wait for a new container to become ready
    ready_timeout_secs: u64,
    /// Seconds of grace when stopping containers
    stop_timeout_secs: u32,
    /// Seconds between maintenance passes
    maintain_interval_secs: u64,
    /// Profile leased when a session names none
    default_profile: String,
    /// Profile name -> image
    profile_images: HashMap<String, String>,
    /// Profiles warmed at startup
    warmup_profiles: Vec<String>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            max_pool_size: 5,
            idle_eviction_secs: 30 * 60,
            ready_timeout_secs: 30,
            stop_timeout_secs: 10,
            maintain_interval_secs: 60,
            default_profile: "ssh-terminal".to_string(),
            profile_images: HashMap::new(),
            warmup_profiles: vec!["ssh-terminal".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct SessionSettings {
    /// Seconds of inactivity before an active session is demoted
    idle_timeout_secs: u64,
    /// Absolute session lifetime in seconds
    session_ttl_secs: u64,
    /// Minimum seconds between persisted activity bumps
    activity_persist_secs: u64,
    /// Seconds between idle/expiry sweeps
    sweep_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            session_ttl_secs: 24 * 60 * 60,
            activity_persist_secs: 5 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct MonitorSettings {
    /// Seconds between collection ticks
    interval_secs: u64,
    /// Seconds metric records are retained
    retention_secs: u64,
    /// Filesystem whose usage feeds the disk alert
    disk_path: String,
    thresholds: AlertThresholds,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            retention_secs: 24 * 60 * 60,
            disk_path: "/".to_string(),
            thresholds: AlertThresholds::default(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file),
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting warren server...");

    // Database
    let db_path = ctx.paths.data_dir.join("warren.db");
    info!("Database path: {}", db_path.display());
    let database = db::Database::new(&db_path).await?;

    // Container runtime
    let runtime = match (&ctx.config.container.runtime, &ctx.config.container.binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(*rt, binary.clone()),
        (Some(rt), None) => ContainerRuntime::with_type(*rt),
        (None, _) => ContainerRuntime::new(),
    };
    match runtime.ping().await {
        Ok(()) => info!("Container runtime ({}) is available", runtime.runtime_type()),
        Err(e) => warn!(
            "Container runtime check failed: {e}. Container operations may fail."
        ),
    }
    let runtime: Arc<dyn warren::container::ContainerRuntimeApi> = Arc::new(runtime);

    // Pool; CLI flags override config file values
    let pool_config = PoolConfig {
        min_pool_size: ctx.config.pool.min_pool_size,
        max_pool_size: ctx.config.pool.max_pool_size,
        idle_eviction: Duration::from_secs(ctx.config.pool.idle_eviction_secs),
        ready_timeout: Duration::from_secs(ctx.config.pool.ready_timeout_secs),
        stop_timeout_secs: ctx.config.pool.stop_timeout_secs,
        host: ctx.config.container.ssh_host.clone(),
        base_port: cmd.base_port.unwrap_or(ctx.config.container.base_port),
        default_image: cmd
            .image
            .clone()
            .unwrap_or_else(|| ctx.config.container.default_image.clone()),
        profile_images: ctx.config.pool.profile_images.clone(),
    };
    let pool = ContainerPool::new(runtime.clone(), pool_config);

    // Session manager
    let session_config = SessionManagerConfig {
        idle_timeout: Duration::from_secs(ctx.config.session.idle_timeout_secs),
        session_ttl: Duration::from_secs(ctx.config.session.session_ttl_secs),
        activity_persist_interval: Duration::from_secs(ctx.config.session.activity_persist_secs),
        sweep_interval: Duration::from_secs(ctx.config.session.sweep_interval_secs),
    };
    let session_repo = SessionRepository::new(database.pool().clone());
    let sessions = SessionManager::new(
        session_repo,
        pool.clone(),
        runtime.clone(),
        session_config,
    );

    // Reconcile sessions persisted by a previous process, then remove
    // managed containers nothing restorable references anymore.
    if let Err(e) = sessions.startup_reconcile().await {
        warn!("Startup reconciliation failed (continuing anyway): {e:#}");
    }
    match sessions.restorable_container_ids().await {
        Ok(keep) => pool.reap_orphans(&keep).await,
        Err(e) => warn!("Orphan reaping skipped: {e:#}"),
    }
    let sweeper = sessions.spawn_sweeper();

    // Pool warmup and maintenance
    if !cmd.no_warmup {
        for profile in &ctx.config.pool.warmup_profiles {
            let pool = pool.clone();
            let profile = profile.clone();
            let count = ctx.config.pool.min_pool_size;
            tokio::spawn(async move { pool.warmup(&profile, count).await });
        }
    }
    let maintenance = {
        let pool = pool.clone();
        let interval = Duration::from_secs(ctx.config.pool.maintain_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pool.maintain().await;
            }
        })
    };

    // Resource monitor
    let monitor_config = MonitorConfig {
        interval: Duration::from_secs(ctx.config.monitor.interval_secs),
        retention: Duration::from_secs(ctx.config.monitor.retention_secs),
        disk_path: ctx.config.monitor.disk_path.clone(),
        thresholds: ctx.config.monitor.thresholds.clone(),
    };
    let metrics_repo = MetricsRepository::new(database.pool().clone());
    let monitor = ResourceMonitor::new(
        runtime.clone(),
        pool.clone(),
        sessions.clone(),
        metrics_repo,
        monitor_config,
    );
    let monitor_task = monitor.spawn();

    // HTTP + WebSocket surface
    let state = api::AppState::new(
        pool.clone(),
        sessions.clone(),
        runtime,
        monitor,
        ctx.config.pool.default_profile.clone(),
    );
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    let pool_for_shutdown = pool.clone();
    let sessions_for_shutdown = sessions.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received, draining sessions and pool...");

        sweeper.abort();
        maintenance.abort();
        monitor_task.abort();

        sessions_for_shutdown.shutdown().await;
        pool_for_shutdown.shutdown().await;

        info!("Shutdown complete");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    Ok(())
}

fn load_or_init_config(paths: &mut AppPaths, _common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        write_default_config(&paths.config_file)?;
    }

    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(APP_NAME.to_uppercase().as_str()).separator("__"))
        .build()?;

    let mut config: AppConfig = built.try_deserialize()?;

    if let Some(ref file) = config.logging.file {
        let expanded = expand_str_path(file)?;
        config.logging.file = Some(expanded.display().to_string());
    }

    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path)?;
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> Result<String> {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    Ok(buffer)
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn default_state_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::state_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("state").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine state directory"))
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}, state: {}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}
