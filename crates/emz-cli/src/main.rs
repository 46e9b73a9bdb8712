//! CLI interface for emz - upload custom emoji to Microsoft Teams.

use std::env;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use anyhow::{Context as _, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use emz_core::paths::write_default_config;
use emz_core::{
    AppConfig, AppPaths, ExtensionStorage, FileInput, JsonFileStorage, LocalStorageSnapshot,
    LogNotifier, Orchestrator, ProcessingState, StatusKind, TokenSet, TokenStore, UploadResult,
    UploadSettings, generate_schema, write_generated_files,
};
use env_logger::fmt::WriteStyle;
use log::{LevelFilter, debug};

const APP_NAME: &str = "emz";

/// Repository URL used as the schema `$id`.
const REPO_URL: &str = "https://github.com/byteowlz/emz";

fn main() -> anyhow::Result<()> {
    try_main()
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Upload(cmd) => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(handle_upload(&ctx, cmd))
        }
        Command::Tokens { subcommand } => handle_tokens(&ctx, subcommand),
        Command::Status => handle_status(&ctx),
        Command::Reset => handle_reset(&ctx),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => {
            handle_completions(shell);
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "emz",
    author,
    version,
    about = "Upload custom emoji to Microsoft Teams",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

/// Common CLI options shared across all subcommands.
#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Override the config file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Reduce output to only errors.
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    /// Increase logging verbosity (stackable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace logging.
    #[arg(long, global = true)]
    pub trace: bool,
    /// Output machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,
    /// Disable ANSI colors in output.
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    pub no_color: bool,
    /// Control color output.
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    pub color: ColorOption,
    /// Do not change anything on disk or upload anything.
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,
    /// Assume "yes" for interactive prompts.
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    pub assume_yes: bool,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorOption {
    /// Detect terminal capabilities automatically.
    Auto,
    /// Always emit ANSI color codes.
    Always,
    /// Never emit ANSI color codes.
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Upload image files as custom emoji. The shortcut is the file name up to the first dot.
    Upload(UploadCommand),
    /// Capture and inspect Teams tokens.
    Tokens {
        #[command(subcommand)]
        subcommand: TokensSubcommand,
    },
    /// Show the result of the last upload.
    Status,
    /// Forget captured tokens and the last status.
    Reset,
    /// Create config directories and default files.
    Init(InitCommand),
    /// Inspect and manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct UploadCommand {
    /// Image files to upload.
    #[arg(required = true, value_name = "FILE")]
    files: Vec<PathBuf>,
    /// Import tokens from a Teams localStorage export before uploading.
    #[arg(long, value_name = "PATH")]
    local_storage: Option<PathBuf>,
    /// Forget the captured tokens once the upload succeeds. The last status is kept.
    #[arg(long)]
    reset_after: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum TokensSubcommand {
    /// Save the chat and identity tokens found in a localStorage export.
    Capture {
        /// JSON export of `localStorage` from teams.microsoft.com.
        path: PathBuf,
    },
    /// Copy every token entry of a localStorage export under its original key.
    Import {
        /// JSON export of `localStorage` from teams.microsoft.com.
        path: PathBuf,
    },
    /// Show which tokens are available.
    Status,
}

#[derive(Debug, Clone, Copy, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists.
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration.
    Show,
    /// Print the resolved config file path.
    Path,
    /// Print all resolved paths.
    Paths,
    /// Print the JSON schema.
    Schema,
    /// Write the JSON schema and an example config to a directory.
    Generate {
        /// Output directory.
        #[arg(value_name = "DIR")]
        output: PathBuf,
    },
    /// Regenerate the default configuration file.
    Reset,
}

// ─── Runtime ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.as_deref())?;
        let config = AppConfig::load(&paths, common.dry_run)?;
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
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_level(self.effective_log_level());

        if let Some(ref file) = self.config.logging.file {
            let target = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("opening log file {file}"))?;
            builder.target(env_logger::Target::Pipe(Box::new(target)));
            builder.write_style(WriteStyle::Never);
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            if disable_color {
                builder.write_style(WriteStyle::Never);
            } else if force_color {
                builder.write_style(WriteStyle::Always);
            } else {
                builder.write_style(WriteStyle::Auto);
            }
        }

        builder.try_init().or_else(|err| {
            if self.common.verbose > 0 {
                eprintln!("logger already initialized: {err}");
            }
            Ok(())
        })
    }

    /// Flags win; a configured log file falls back to the configured level.
    const fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 if self.config.logging.file.is_some() => self.config.logging.level.as_filter(),
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            self.paths.log_dry_run();
            return Ok(());
        }
        self.paths.ensure_directories()
    }

    fn storage(&self) -> JsonFileStorage {
        JsonFileStorage::new(self.paths.storage_file())
            .with_lock_file(self.paths.storage_lock_file())
    }

    fn orchestrator(&self) -> Orchestrator<JsonFileStorage, LogNotifier> {
        Orchestrator::new(
            self.storage(),
            LogNotifier,
            UploadSettings::from(&self.config),
        )
    }
}

// ─── Handlers ────────────────────────────────────────────────────────

async fn handle_upload(ctx: &RuntimeContext, cmd: UploadCommand) -> Result<()> {
    let orchestrator = ctx.orchestrator();

    if let Some(ref path) = cmd.local_storage {
        let page = LocalStorageSnapshot::from_path(path)?;
        if ctx.common.dry_run {
            log::info!("dry-run: would import tokens from {}", path.display());
        } else {
            let count = TokenStore::import_matching_entries(&page, orchestrator.storage());
            debug!("imported {count} token entries from {}", path.display());
        }
    }

    let mut files = Vec::with_capacity(cmd.files.len());
    for path in &cmd.files {
        let file = FileInput::from_path(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        files.push(file);
    }

    if ctx.common.dry_run {
        for file in &files {
            println!("would upload {} as :{}:", file.name, file.shortcut());
        }
        return Ok(());
    }

    let tokens = orchestrator.collect_tokens();
    let result = orchestrator.handle_processing(&files, &tokens).await;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("serializing result to JSON")?
        );
    }

    if result.success {
        if cmd.reset_after {
            forget_tokens(orchestrator.storage(), &result)?;
        }
        if !ctx.common.json && !ctx.common.quiet {
            println!("{}", result.display_text());
        }
        Ok(())
    } else {
        Err(anyhow!("{}", result.display_text()))
    }
}

/// Clear the store, keeping only the status of `result`.
fn forget_tokens(storage: &impl ExtensionStorage, result: &UploadResult) -> Result<()> {
    storage.clear()?;
    let mut items = serde_json::Map::new();
    items.insert(
        ProcessingState::STORAGE_KEY.to_string(),
        serde_json::to_value(ProcessingState::from(result))
            .context("serializing processing state")?,
    );
    storage.set(items)?;
    debug!("cleared captured tokens after upload");
    Ok(())
}

fn handle_tokens(ctx: &RuntimeContext, cmd: TokensSubcommand) -> Result<()> {
    let storage = ctx.storage();

    match cmd {
        TokensSubcommand::Capture { path } => {
            let page = LocalStorageSnapshot::from_path(&path)?;
            if ctx.common.dry_run {
                let tokens = TokenStore::collect_from_page_storage(&page);
                print_token_status(&tokens, ctx.common.json)?;
                return Ok(());
            }
            if TokenStore::capture_and_persist(&page, &storage) {
                println!("Teams tokens saved to {}", storage.path().display());
                Ok(())
            } else {
                Err(anyhow!(
                    "no chat and identity tokens found in {}. Log in to teams.microsoft.com and export localStorage again.",
                    path.display()
                ))
            }
        }
        TokensSubcommand::Import { path } => {
            let page = LocalStorageSnapshot::from_path(&path)?;
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would import token entries from {} ({} items)",
                    path.display(),
                    page.len()
                );
                return Ok(());
            }
            let count = TokenStore::import_matching_entries(&page, &storage);
            println!("Imported {count} token entries");
            Ok(())
        }
        TokensSubcommand::Status => {
            let tokens = TokenStore::collect_from_extension_storage(&storage);
            print_token_status(&tokens, ctx.common.json)
        }
    }
}

fn handle_status(ctx: &RuntimeContext) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    match orchestrator.last_state() {
        Some(state) if ctx.common.json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&state).context("serializing state to JSON")?
            );
        }
        Some(state) => {
            let label = match state.kind {
                StatusKind::Success => "success",
                StatusKind::Error => "error",
            };
            println!("[{label}] {}", state.status);
        }
        None if ctx.common.json => println!("null"),
        None => println!("No uploads yet."),
    }
    Ok(())
}

fn handle_reset(ctx: &RuntimeContext) -> Result<()> {
    let storage = ctx.storage();
    if ctx.common.dry_run {
        log::info!("dry-run: would clear {}", storage.path().display());
        return Ok(());
    }
    storage.clear()?;
    println!("Cleared stored tokens and status.");
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    if ctx.common.dry_run {
        log::info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
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
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Paths => {
            let storage = ctx.paths.storage_file();
            if ctx.common.json {
                let paths = serde_json::json!({
                    "config": ctx.paths.config_file,
                    "data": ctx.paths.data_dir,
                    "state": ctx.paths.state_dir,
                    "storage": storage,
                    "storage_lock": ctx.paths.storage_lock_file(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&paths).context("serializing paths to JSON")?
                );
            } else {
                println!("config:  {}", ctx.paths.config_file.display());
                println!("data:    {}", ctx.paths.data_dir.display());
                println!("state:   {}", ctx.paths.state_dir.display());
                println!("storage: {}", storage.display());
                println!("lock:    {}", ctx.paths.storage_lock_file().display());
            }
            Ok(())
        }
        ConfigCommand::Schema => {
            println!("{}", generate_schema(APP_NAME, REPO_URL)?);
            Ok(())
        }
        ConfigCommand::Generate { output } => {
            if ctx.common.dry_run {
                log::info!("dry-run: would write schema and config to {}", output.display());
                return Ok(());
            }
            write_generated_files(&output, APP_NAME, REPO_URL)
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
}

// ─── Formatting helpers ──────────────────────────────────────────────

fn print_token_status(tokens: &TokenSet, json: bool) -> Result<()> {
    if json {
        let status = serde_json::json!({
            "chatToken": tokens.chat_token.is_some(),
            "identityToken": tokens.identity_token.is_some(),
            "permissionsId": tokens.permissions_id,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serializing token status to JSON")?
        );
        return Ok(());
    }

    println!("Chat token:     {}", mask(tokens.chat_token.as_deref()));
    println!("Identity token: {}", mask(tokens.identity_token.as_deref()));
    println!(
        "Tenant ID:      {}",
        tokens.permissions_id.as_deref().unwrap_or("missing")
    );
    if tokens.as_complete().is_none() {
        println!();
        println!("Run 'emz tokens capture <localStorage.json>' to capture tokens.");
    }
    Ok(())
}

/// Show only the start of a secret.
fn mask(secret: Option<&str>) -> String {
    secret.map_or_else(
        || "missing".to_string(),
        |s| {
            let head: String = s.chars().take(8).collect();
            format!("{head}... ({} chars)", s.chars().count())
        },
    )
}
