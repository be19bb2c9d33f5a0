//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use halldyll_converge::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use halldyll_converge::config::{ConfigParser, ConfigValidator, Manifest, StateBackend, find_config_file};
use halldyll_converge::error::{ConfigError, ConvergeError, Result};
use halldyll_converge::provider::{SandboxCloud, catalog};
use halldyll_converge::reconciler::{ReconcileOptions, Reconciler};
use halldyll_converge::schema::{InstanceId, SchemaRegistry};
use halldyll_converge::state::{StateStore as _, create_store};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Writes command output to stdout.
#[allow(clippy::print_stdout)]
fn emit(output: &str) {
    println!("{}", output.trim_end());
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| ExitCode::SUCCESS),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter).await,
        Commands::Plan { detailed } => cmd_plan(config, detailed, &formatter).await,
        Commands::Apply { yes, parallelism } => cmd_apply(config, yes, parallelism, &formatter).await,
        Commands::Refresh => cmd_refresh(config, &formatter).await,
        Commands::Drift => cmd_drift(config, &formatter).await,
        Commands::State { command } => cmd_state(config, command, &formatter).await,
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    // Write/update .gitignore
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".converge") || !existing.contains(".env") {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(".converge") {
                writeln!(file, ".converge/")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit converge.yaml with your resources");
    eprintln!("  2. Run 'converge validate' to check your configuration");
    eprintln!("  3. Run 'converge plan' to preview the changes");
    eprintln!("  4. Run 'converge apply' to apply them");

    Ok(())
}

/// Validate configuration.
async fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let result = ConfigValidator::new(Arc::clone(&workspace.registry)).check(&workspace.manifest);

    emit(&formatter.format_validation(&result, show_warnings));
    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let reconciler = workspace.reconciler(None);
    let plan = reconciler.plan_manifest(&workspace.manifest).await?;

    emit(&formatter.format_plan(&plan, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let reconciler = workspace.reconciler(parallelism);
    let plan = reconciler.plan_manifest(&workspace.manifest).await?;

    emit(&formatter.format_plan(&plan, false));
    if plan.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    // Confirm
    if !auto_approve {
        eprint!("Do you want to apply this plan? [y/N]: ");
        std::io::stderr().flush()?;
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight operations...");
            on_interrupt.cancel();
        }
    });

    let result = reconciler.apply(&plan, cancel).await?;
    emit(&formatter.format_apply(&result));

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Refresh the state from the provider.
async fn cmd_refresh(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let report = workspace.reconciler(None).refresh().await?;

    emit(&formatter.format_refresh(&report));
    Ok(if report.drift.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let report = workspace.reconciler(None).check_drift().await?;

    emit(&formatter.format_drift(&report));
    Ok(if report.is_converged() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let workspace = Workspace::load(config_path).await?;
    let reconciler = workspace.reconciler(None);

    match command {
        StateCommands::Show => match reconciler.state().await? {
            Some(state) => emit(&formatter.format_state(&state)),
            None => eprintln!("No state found."),
        },
        StateCommands::List => match reconciler.state().await? {
            Some(state) => emit(&formatter.format_instances(&state)),
            None => eprintln!("No state found."),
        },
        StateCommands::Taint { instance } => {
            let id = parse_instance(&instance)?;
            let serial = reconciler.taint(&id).await?;
            eprintln!("{id} tainted; it will be replaced on the next apply (serial {serial}).");
        }
        StateCommands::Untaint { instance } => {
            let id = parse_instance(&instance)?;
            let serial = reconciler.untaint(&id).await?;
            eprintln!("{id} untainted (serial {serial}).");
        }
        StateCommands::Unlock { force } => match reconciler.store().get_lock_info().await? {
            None => eprintln!("State is not locked."),
            Some(lock) if force || lock.is_expired() => {
                reconciler.force_unlock().await?;
                eprintln!("State unlocked (was held by {}).", lock.holder);
            }
            Some(lock) => {
                eprintln!(
                    "State is locked by {} ({}s left). Use --force to remove the lock.",
                    lock.holder,
                    lock.remaining_secs()
                );
                return Ok(ExitCode::FAILURE);
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Manifest, registry and state location for one invocation.
struct Workspace {
    manifest: Manifest,
    registry: Arc<SchemaRegistry>,
    root: PathBuf,
}

impl Workspace {
    /// Loads the manifest and opens the sandbox cloud next to the state.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
        debug!("Loading configuration from: {}", config_file.display());

        let root = config_file
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let parser = ConfigParser::new().with_base_path(&root);
        parser.load_dotenv()?;
        let manifest = parser.load_with_env(&config_file)?;

        let cloud = match manifest.state.backend {
            StateBackend::Local => SandboxCloud::open(manifest.state.directory(&root)).await?,
            StateBackend::Memory => SandboxCloud::new(),
        };
        let registry = catalog::registry(&Arc::new(cloud)).map_err(ConvergeError::Config)?;

        Ok(Self {
            manifest,
            registry: Arc::new(registry),
            root,
        })
    }

    fn reconciler(&self, parallelism: Option<usize>) -> Reconciler {
        let mut options = ReconcileOptions::from_engine(&self.manifest.engine);
        if let Some(parallelism) = parallelism {
            options.parallelism = parallelism.max(1);
        }
        Reconciler::new(
            Arc::clone(&self.registry),
            create_store(&self.manifest.state, &self.root),
        )
        .with_options(options)
    }
}

fn parse_instance(raw: &str) -> Result<InstanceId> {
    raw.parse()
        .map_err(|e: String| ConvergeError::Config(ConfigError::validation(e, "instance")))
}
