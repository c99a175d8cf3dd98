//! sitepipe CLI tool.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "sitepipe")]
#[command(about = "Static site delivery pipelines", long_about = None)]
struct Cli {
    /// Stack configuration file
    #[arg(long, global = true, env = "SITEPIPE_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the assembled stack definition as JSON
    Synth {
        /// Stack name, required when the file declares several
        #[arg(long)]
        stack: Option<String>,
    },
    /// Parse and assemble every stack in the configuration
    Validate,
    /// Provision a stack locally and execute one pipeline run
    Run {
        /// Stack name, required when the file declares several
        #[arg(long)]
        stack: Option<String>,
        /// Directory used as the source checkout
        #[arg(long, required_unless_present = "git", conflicts_with = "git")]
        source: Option<PathBuf>,
        /// Clone the configured repository instead of reading a local checkout
        #[arg(long)]
        git: bool,
        /// Base URL repositories are cloned from
        #[arg(long, env = "SITEPIPE_GIT_BASE_URL", requires = "git")]
        git_base_url: Option<String>,
        /// Replay a push webhook payload; the run only starts when it targets the pipeline
        #[arg(long, value_name = "FILE")]
        push_event: Option<PathBuf>,
        /// X-Hub-Signature-256 value sent with the push payload
        #[arg(long, requires = "push_event")]
        signature: Option<String>,
        /// Secret push payloads must be signed with
        #[arg(long, env = "SITEPIPE_WEBHOOK_SECRET", hide_env_values = true)]
        webhook_secret: Option<String>,
        /// Approve manual gates without prompting
        #[arg(long)]
        auto_approve: bool,
        /// Reject a pending approval after this many seconds
        #[arg(long, value_name = "SECS")]
        approval_timeout: Option<u64>,
        /// Where build commands run
        #[arg(long, value_enum, default_value_t = commands::run::ExecutorKind::Process)]
        executor: commands::run::ExecutorKind,
        /// Attempts per build and deploy action
        #[arg(long, default_value = "1")]
        retries: u32,
        /// Token stored under the source action's secret
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Synth { stack } => {
            commands::synth(config, stack.as_deref())?;
        }
        Commands::Validate => {
            commands::validate(config)?;
        }
        Commands::Run {
            stack,
            source,
            git,
            git_base_url,
            push_event,
            signature,
            webhook_secret,
            auto_approve,
            approval_timeout,
            executor,
            retries,
            token,
        } => {
            let definition = commands::load_definition(config, stack.as_deref())?;
            let source = match source {
                Some(dir) if !git => commands::run::SourceOption::Directory(dir),
                _ => commands::run::SourceOption::Git {
                    base_url: git_base_url,
                },
            };
            let push = push_event.map(|event_file| commands::run::PushOptions {
                event_file,
                signature,
                secret: webhook_secret,
            });
            let options = commands::run::RunOptions {
                source,
                push,
                auto_approve,
                approval_timeout: approval_timeout.map(std::time::Duration::from_secs),
                executor,
                retries,
                token,
                json_events: cli.json,
            };
            commands::run::run_local(definition, options).await?;
        }
    }

    Ok(())
}
