use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use stackresearch_core::{
    Config, ConfigLoader, ResearchInput, ResearchOutcome, ResearchServices, SessionLog,
    SessionOptions, TelemetryOptions, env_present, init_metrics_from_env, init_telemetry,
    remove_session_logs, run_research_session,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "stackresearch",
    version,
    about = "Research a recommended tech stack with web search and reflection"
)]
struct Cli {
    /// Configuration file (defaults to $STACKRESEARCH_CONFIG or ./stackresearch.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a research session for a project description.
    Run(RunArgs),
    /// Print the resolved configuration and which secrets are available.
    Config,
    /// Remove a session from the session log.
    Forget(ForgetArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Project description to research.
    #[arg(long)]
    project: String,

    /// User requirements, as JSON or plain text.
    #[arg(long)]
    requirements: Option<String>,

    /// Path to a JSON schema describing the expected output.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Upper bound on search queries per research round.
    #[arg(long)]
    max_search_queries: Option<u8>,

    /// Upper bound on results retained per query.
    #[arg(long)]
    max_search_results: Option<u8>,

    /// Upper bound on reflection iterations.
    #[arg(long)]
    max_reflection_steps: Option<u8>,

    /// Optional session ID (a UUID is generated otherwise).
    #[arg(long)]
    session: Option<String>,

    /// Directory to persist the execution trace into.
    #[arg(long, env = "STACKRESEARCH_TRACE_DIR")]
    trace_dir: Option<PathBuf>,

    /// Skip appending the session to the session log.
    #[arg(long, default_value_t = false)]
    no_session_log: bool,

    /// Print the full outcome as JSON instead of the recommendation and summary.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Print the execution trace after the summary.
    #[arg(long, default_value_t = false)]
    explain: bool,

    /// Rendering used by --explain.
    #[arg(long, value_enum, default_value_t = ExplainFormat::Markdown)]
    explain_format: ExplainFormat,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
enum ExplainFormat {
    #[default]
    Markdown,
    Mermaid,
    Graphviz,
}

impl ExplainFormat {
    fn render(self, outcome: &ResearchOutcome) -> String {
        match self {
            ExplainFormat::Markdown => outcome.explain_markdown(),
            ExplainFormat::Mermaid => outcome.explain_mermaid(),
            ExplainFormat::Graphviz => outcome.explain_graphviz(),
        }
    }
}

#[derive(Args, Debug)]
struct ForgetArgs {
    /// Session ID to remove.
    #[arg(long)]
    session: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions::default().with_default_level(&config.logging.level))?;
    init_metrics_from_env("stackresearch-cli")?;

    match cli.command {
        Command::Run(args) => {
            config.research = config.research.with_overrides(
                args.max_search_queries,
                args.max_search_results,
                args.max_reflection_steps,
            );
            config.validate()?;

            let rt = Runtime::new()?;
            rt.block_on(run_command(config, args))?;
        }
        Command::Config => config_command(&config)?,
        Command::Forget(args) => {
            let removed = remove_session_logs(&args.session)?;
            println!("removed {removed} log entries for session {}", args.session);
        }
    }

    Ok(())
}

async fn run_command(config: Config, args: RunArgs) -> Result<()> {
    let services = Arc::new(ResearchServices::from_config(&config)?);

    let mut input = ResearchInput::new(args.project);
    if let Some(path) = args.schema.as_deref() {
        input = input.with_schema(read_schema(path)?);
    }
    if let Some(raw) = args.requirements {
        input = input.with_requirements(parse_requirements(&raw));
    }

    let mut options = SessionOptions::new(input);
    if let Some(session_id) = args.session {
        options = options.with_session_id(session_id);
    }
    if let Some(dir) = args.trace_dir {
        options = options.with_trace_dir(dir);
    }
    if !args.no_session_log {
        options = options.with_session_log(SessionLog::from_env());
    }

    info!(
        max_search_queries = config.research.max_search_queries,
        max_search_results = config.research.max_search_results,
        max_reflection_steps = config.research.max_reflection_steps,
        "starting StackResearch session"
    );

    let outcome = run_research_session(services, options).await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome)?;
        if args.explain {
            println!();
            println!("{}", args.explain_format.render(&outcome));
        }
    }
    Ok(())
}

fn read_schema(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("schema {} is not valid JSON", path.display()))
}

fn parse_requirements(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_outcome(outcome: &ResearchOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome.info)?);
    println!();
    println!("Session: {}", outcome.session_id);
    println!(
        "Satisfactory: {} (reflection steps: {})",
        if outcome.is_satisfactory { "yes" } else { "no" },
        outcome.reflection_steps_taken
    );
    if !outcome.missing_components.is_empty() {
        println!("Open gaps: {}", outcome.missing_components.join(", "));
    }
    if !outcome.missing_required.is_empty() {
        println!(
            "Missing required fields: {}",
            outcome.missing_required.join(", ")
        );
    }
    if outcome.search_failed {
        println!("Note: live search failed in the last round; notes rely on general knowledge.");
    }
    if outcome.sources.is_empty() {
        println!("Sources: (none recorded)");
    } else {
        println!("Sources:");
        for (idx, source) in outcome.sources.iter().enumerate() {
            println!("  {}. {}", idx + 1, source);
        }
    }
    if let Some(path) = &outcome.trace_path {
        println!("Trace: {}", path.display());
    }
    Ok(())
}

fn config_command(config: &Config) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("failed to render configuration")?;
    println!("{rendered}");
    for var in [&config.llm.api_key_env, &config.search.api_key_env] {
        let state = if env_present(var) { "set" } else { "missing" };
        println!("# {var}: {state}");
    }
    Ok(())
}
