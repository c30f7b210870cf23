//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use converge::cli::{Cli, Commands, OutputFormatter, StateCommands, WorkspaceCommands};
use converge::config::{ConfigParser, Settings, find_config_file};
use converge::declaration::{DeclarationSet, ResourceAddress};
use converge::engine::Engine;
use converge::error::{ConfigError, CoreError, Result};
use converge::executor::ApplyOutcome;
use converge::planner::{Plan, PlanMode};
use converge::provider::ProviderRegistry;
use converge::state::Workspace;

use clap::Parser;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Everything a command needs.
struct Context {
    engine: Engine,
    workspace: Workspace,
    declarations: PathBuf,
    formatter: OutputFormatter,
}

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

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
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let ctx = load_context(&cli).await?;

    let cancel = ctx.engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight operations");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Validate => cmd_validate(&ctx).map(|()| ExitCode::SUCCESS),
        Commands::Plan { out, refresh, destroy } => cmd_plan(&ctx, out.as_deref(), refresh, destroy)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Apply { plan, yes, .. } => cmd_apply(&ctx, plan.as_deref(), yes).await,
        Commands::Destroy { yes } => cmd_destroy(&ctx, yes).await,
        Commands::Refresh { accept } => cmd_refresh(&ctx, accept).await.map(|()| ExitCode::SUCCESS),
        Commands::State { command } => cmd_state(&ctx, command).await.map(|()| ExitCode::SUCCESS),
        Commands::Import { address, id } => cmd_import(&ctx, &address, &id).await.map(|()| ExitCode::SUCCESS),
        Commands::Workspace { command } => cmd_workspace(&ctx, command).await.map(|()| ExitCode::SUCCESS),
        Commands::ForceUnlock { lock_id } => {
            ctx.engine.force_unlock(&ctx.workspace, &lock_id).await?;
            emit(&ctx.formatter.success(&format!("Lock {lock_id} removed from workspace {}", ctx.workspace)))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Validate settings and declarations.
fn cmd_validate(ctx: &Context) -> Result<()> {
    let declarations = load_declarations(ctx)?;
    let graph = ctx.engine.validate(&declarations)?;
    emit(&ctx.formatter.success(&format!(
        "Declarations are valid: {} resource instance(s), {} output(s)",
        graph.nodes().len(),
        graph.outputs().len()
    )))
}

/// Show a plan, optionally saving it.
async fn cmd_plan(ctx: &Context, out: Option<&Path>, refresh: Option<bool>, destroy: bool) -> Result<()> {
    let declarations = load_declarations(ctx)?;
    let mode = if destroy { PlanMode::Destroy } else { PlanMode::Normal };
    let mut options = ctx.engine.plan_options(mode);
    if let Some(refresh) = refresh {
        options.refresh = refresh;
    }

    let plan = ctx.engine.plan(&ctx.workspace, &declarations, options).await?;
    emit(&ctx.formatter.format_plan(&plan))?;

    if let Some(path) = out {
        plan.save(path).await?;
        emit(&ctx.formatter.success(&format!("Plan saved to {}", path.display())))?;
    }
    Ok(())
}

/// Apply a saved plan, or plan and apply after confirmation.
async fn cmd_apply(ctx: &Context, saved: Option<&Path>, auto_approve: bool) -> Result<ExitCode> {
    let declarations = load_declarations(ctx)?;

    let plan = match saved {
        Some(path) => Plan::load(path).await?,
        None => {
            ctx.engine
                .plan(&ctx.workspace, &declarations, ctx.engine.plan_options(PlanMode::Normal))
                .await?
        }
    };
    emit(&ctx.formatter.format_plan(&plan))?;

    if plan.is_empty() && plan.outputs.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    if saved.is_none() && !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    apply_plan(ctx, &declarations, &plan).await
}

/// Destroy every managed instance after confirmation.
async fn cmd_destroy(ctx: &Context, auto_approve: bool) -> Result<ExitCode> {
    let declarations = load_declarations(ctx)?;
    let plan = ctx
        .engine
        .plan(&ctx.workspace, &declarations, ctx.engine.plan_options(PlanMode::Destroy))
        .await?;
    emit(&ctx.formatter.format_plan(&plan))?;

    if plan.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }
    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destroy cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    apply_plan(ctx, &declarations, &plan).await
}

async fn apply_plan(ctx: &Context, declarations: &DeclarationSet, plan: &Plan) -> Result<ExitCode> {
    let report = ctx
        .engine
        .apply(&plan.workspace, declarations, Some(plan))
        .await?;
    emit(&ctx.formatter.format_apply(&report))?;

    Ok(match report.outcome() {
        ApplyOutcome::Complete => ExitCode::SUCCESS,
        ApplyOutcome::Partial => ExitCode::FAILURE,
    })
}

/// Check for drift, optionally recording live values.
async fn cmd_refresh(ctx: &Context, accept: bool) -> Result<()> {
    let declarations = if ctx.declarations.exists() {
        Some(load_declarations(ctx)?)
    } else {
        debug!("No declarations at {}; ignore_changes not applied", ctx.declarations.display());
        None
    };

    let report = ctx
        .engine
        .refresh(&ctx.workspace, declarations.as_ref(), accept)
        .await?;
    emit(&ctx.formatter.format_drift(&report, accept))
}

/// State management commands.
async fn cmd_state(ctx: &Context, command: StateCommands) -> Result<()> {
    match command {
        StateCommands::List { prefix } => {
            let instances = ctx.engine.state_list(&ctx.workspace, prefix.as_deref()).await?;
            emit(&ctx.formatter.format_instances(&instances))
        }
        StateCommands::Show { address } => {
            let instance = ctx
                .engine
                .state_show(&ctx.workspace, &parse_address(&address)?)
                .await?;
            emit(&ctx.formatter.format_instance(&instance))
        }
        StateCommands::Mv { from, to } => {
            let moved = ctx.engine.state_mv(&ctx.workspace, &from, &to).await?;
            emit(&ctx.formatter.success(&format!("Moved {moved} instance(s) from {from} to {to}")))
        }
        StateCommands::Rm { address } => {
            let removed = ctx.engine.state_rm(&ctx.workspace, &address).await?;
            emit(&ctx.formatter.success(&format!("Removed {removed} instance(s) under {address}")))
        }
    }
}

/// Import an existing object.
async fn cmd_import(ctx: &Context, address: &str, id: &str) -> Result<()> {
    let address = parse_address(address)?;
    let instance = ctx.engine.import(&ctx.workspace, &address, id).await?;
    emit(&ctx.formatter.success(&format!("Imported {id} as {address}")))?;
    emit(&ctx.formatter.format_instance(&instance))
}

/// Workspace commands.
async fn cmd_workspace(ctx: &Context, command: WorkspaceCommands) -> Result<()> {
    match command {
        WorkspaceCommands::New { name } => {
            let workspace = ctx.engine.workspace_new(&name).await?;
            emit(&ctx.formatter.success(&format!("Created workspace {workspace}")))
        }
        WorkspaceCommands::Select { name } => {
            let workspace = ctx.engine.workspace_select(&name).await?;
            emit(&ctx.formatter.success(&format!("Switched to workspace {workspace}")))
        }
        WorkspaceCommands::Delete { name } => {
            ctx.engine.workspace_delete(&name).await?;
            emit(&ctx.formatter.success(&format!("Deleted workspace {name}")))
        }
        WorkspaceCommands::List => {
            let workspaces = ctx.engine.workspace_list().await?;
            emit(&ctx.formatter.format_workspaces(&workspaces, &ctx.workspace))
        }
        WorkspaceCommands::Show => emit(&format!("{}\n", ctx.workspace)),
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loads settings, builds the engine and resolves the workspace.
async fn load_context(cli: &Cli) -> Result<Context> {
    let config_file = match &cli.config {
        Some(path) => Some(path.clone()),
        None => match find_config_file(std::env::current_dir()?) {
            Ok(path) => Some(path),
            Err(CoreError::Config(ConfigError::FileNotFound { .. })) => None,
            Err(e) => return Err(e),
        },
    };

    let base_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let mut settings = match &config_file {
        Some(path) => parser.load_with_env(path)?,
        None => {
            debug!("No settings file found; using defaults");
            let mut settings = Settings::default();
            ConfigParser::apply_env_overrides(&mut settings)?;
            settings
        }
    };
    if let Commands::Apply {
        parallelism: Some(parallelism),
        ..
    } = &cli.command
    {
        settings.parallelism = *parallelism;
    }

    let registry = ProviderRegistry::with_builtin(&base_dir);
    let engine = Engine::from_settings(&settings, &base_dir, registry).await?;

    let workspace = match cli.workspace.as_deref().or(settings.workspace.as_deref()) {
        Some(name) => Workspace::new(name)?,
        None => engine.workspace_current().await?,
    };
    debug!("Using workspace {workspace}");

    let declarations = parser.resolve(cli.declarations.as_deref().unwrap_or(&settings.declarations));

    Ok(Context {
        engine,
        workspace,
        declarations,
        formatter: OutputFormatter::new(cli.output),
    })
}

fn load_declarations(ctx: &Context) -> Result<DeclarationSet> {
    ConfigParser::new().load_declarations(&ctx.declarations)
}

fn parse_address(input: &str) -> Result<ResourceAddress> {
    Ok(input.parse::<ResourceAddress>()?)
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    Ok(())
}
