//! Gantry - promotion-pipeline orchestrator CLI
//!
//! ## Commands
//!
//! - `pipeline`: register and inspect pipeline definitions
//! - `run`: start, resume, inspect, and abort pipeline runs
//! - `promote`: move an artifact tag between environments
//! - `env` / `tag`: manage environments and tag bindings
//! - `policy`: manage per-environment permission grants
//!
//! Runs execute in the foreground: when a run hits an approval gate the
//! CLI prompts on stdin for a decision, and Ctrl-C aborts the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{warn, Level};

use gantry_core::{
    telemetry::init_tracing, ApprovalRecord, Decision, Error, Identity, ImageDigest, Permission,
    PipelineDefinition, PipelineEngine, PolicyDocument, PolicyStore, RunId, RunState,
};
use gantry_state::{PipelineId, PipelineStore, RunStore, SurrealStore, TagStore};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Promotion-pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Path to the policy file
    #[arg(long, global = true, env = "GANTRY_POLICY", default_value = ".gantry/policy.json")]
    policy: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage pipeline definitions
    Pipeline {
        #[command(subcommand)]
        action: PipelineAction,
    },

    /// Start and inspect pipeline runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Promote an artifact between environments
    Promote {
        /// Source environment
        source_env: String,

        /// Source tag
        source_tag: String,

        /// Target environment
        target_env: String,

        /// Target tag
        target_tag: String,

        /// Acting identity
        #[arg(long = "as", env = "GANTRY_IDENTITY")]
        identity: Option<String>,
    },

    /// Manage environments
    Env {
        #[command(subcommand)]
        action: EnvAction,
    },

    /// Manage tag bindings
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Manage access policy
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PipelineAction {
    /// Register a pipeline definition from a JSON file
    Register {
        /// Path to the definition file
        file: PathBuf,
    },

    /// List registered pipelines
    List,
}

#[derive(Subcommand)]
enum RunAction {
    /// Start a run and drive it to completion in the foreground
    Start {
        /// Pipeline ID, or path to a definition file to register and run
        pipeline: String,

        /// Acting identity
        #[arg(long = "as", env = "GANTRY_IDENTITY")]
        identity: Option<String>,
    },

    /// Resume an interrupted run from its last committed stage
    Resume {
        /// Run ID to resume
        run: String,
    },

    /// Show a run's state and stage results
    Status {
        /// Run ID
        run: String,
    },

    /// List runs, newest first
    List {
        /// Filter by pipeline ID
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Abort a run that is not being driven by a live process
    Abort {
        /// Run ID
        run: String,
    },
}

#[derive(Subcommand)]
enum EnvAction {
    /// Create an environment (idempotent)
    Create {
        /// Environment name
        name: String,
    },
}

#[derive(Subcommand)]
enum TagAction {
    /// Bind a tag directly to a digest
    Set {
        env: String,
        tag: String,
        /// Image digest (`sha256:<hex>` or bare hex)
        digest: String,

        /// Acting identity
        #[arg(long = "as", env = "GANTRY_IDENTITY")]
        identity: Option<String>,
    },

    /// Resolve a tag to its current digest
    Get { env: String, tag: String },

    /// Show a tag's binding history, newest first
    History {
        env: String,
        tag: String,

        /// Maximum entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Rebind a tag to its previous digest
    Rollback {
        env: String,
        tag: String,

        /// Acting identity
        #[arg(long = "as", env = "GANTRY_IDENTITY")]
        identity: Option<String>,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Grant a permission to an identity in an environment
    Grant {
        identity: String,
        environment: String,
        /// One of: read, deploy, promote
        permission: String,
    },

    /// Revoke a permission from an identity in an environment
    Revoke {
        identity: String,
        environment: String,
        /// One of: read, deploy, promote
        permission: String,
    },

    /// List current grants
    List,

    /// Show the policy audit log
    Audit,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let policy = Arc::new(load_policy(&cli.policy)?);
    let store = Arc::new(
        SurrealStore::from_env()
            .await
            .context("Failed to open the Gantry database")?,
    );
    let engine = Arc::new(PipelineEngine::with_stores(
        store.clone() as Arc<dyn RunStore>,
        store.clone() as Arc<dyn PipelineStore>,
        store as Arc<dyn TagStore>,
        policy.clone(),
    ));

    match cli.command {
        Commands::Pipeline { action } => match action {
            PipelineAction::Register { file } => cmd_pipeline_register(&engine, &file).await,
            PipelineAction::List => cmd_pipeline_list(&engine).await,
        },
        Commands::Run { action } => match action {
            RunAction::Start { pipeline, identity } => {
                cmd_run_start(&engine, &pipeline, acting(identity)).await
            }
            RunAction::Resume { run } => cmd_run_resume(&engine, &run).await,
            RunAction::Status { run } => cmd_run_status(&engine, &run).await,
            RunAction::List { pipeline } => cmd_run_list(&engine, pipeline).await,
            RunAction::Abort { run } => {
                engine.abort(&RunId(run.clone())).await?;
                println!("run {run} aborted");
                Ok(())
            }
        },
        Commands::Promote {
            source_env,
            source_tag,
            target_env,
            target_tag,
            identity,
        } => {
            let digest = engine
                .registry()
                .promote(
                    &source_env,
                    &source_tag,
                    &target_env,
                    &target_tag,
                    &acting(identity),
                )
                .await?;
            println!("{target_env}:{target_tag} -> {digest}");
            Ok(())
        }
        Commands::Env { action } => match action {
            EnvAction::Create { name } => {
                engine.registry().create_env(&name).await?;
                println!("environment {name} ready");
                Ok(())
            }
        },
        Commands::Tag { action } => cmd_tag(&engine, action).await,
        Commands::Policy { action } => cmd_policy(&policy, &cli.policy, action),
    }
}

/// Resolve the acting identity: `--as`, then `$USER`, then "anonymous".
fn acting(explicit: Option<String>) -> Identity {
    let name = explicit
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "anonymous".to_string());
    Identity::new(name)
}

fn load_policy(path: &Path) -> Result<PolicyStore> {
    if !path.exists() {
        return Ok(PolicyStore::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    let doc: PolicyDocument = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed policy file {}", path.display()))?;
    Ok(PolicyStore::from_document(doc))
}

fn save_policy(store: &PolicyStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let doc = store.to_document();
    let raw = serde_json::to_string_pretty(&doc)?;
    std::fs::write(path, raw)
        .with_context(|| format!("Failed to write policy file {}", path.display()))
}

async fn cmd_pipeline_register(engine: &PipelineEngine, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let definition: PipelineDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("Malformed pipeline definition in {}", file.display()))?;

    let record = engine.register_pipeline(&definition).await?;
    println!("pipeline: {}", record.pipeline_id);
    println!("name:     {}", definition.name);
    println!("digest:   {}", &record.digest[..12.min(record.digest.len())]);
    println!("stages:   {}", definition.stages.len());
    Ok(())
}

async fn cmd_pipeline_list(engine: &PipelineEngine) -> Result<()> {
    let pipelines = engine.list_pipelines().await?;
    if pipelines.is_empty() {
        println!("no pipelines registered");
        return Ok(());
    }
    for record in pipelines {
        let name = record
            .definition
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("?");
        println!(
            "{}  {}  {}  {}",
            record.pipeline_id,
            &record.digest[..12.min(record.digest.len())],
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            name
        );
    }
    Ok(())
}

async fn cmd_run_start(
    engine: &Arc<PipelineEngine>,
    pipeline: &str,
    identity: Identity,
) -> Result<()> {
    // A path to a definition file registers it first; anything else is a
    // pipeline id.
    let pipeline_id = if Path::new(pipeline).is_file() {
        let raw = std::fs::read_to_string(pipeline)
            .with_context(|| format!("Failed to read {pipeline}"))?;
        let definition: PipelineDefinition = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed pipeline definition in {pipeline}"))?;
        engine.register_pipeline(&definition).await?.pipeline_id
    } else {
        PipelineId(pipeline.to_string())
    };

    // Subscribe before the run task exists: broadcast receivers only see
    // messages sent after subscription, and the first stage may be a gate.
    let approvals = engine.subscribe_approvals();
    let run_id = engine.start(&pipeline_id, identity).await?;
    println!("run {run_id} started");
    drive_foreground(engine, run_id, approvals).await
}

async fn cmd_run_resume(engine: &Arc<PipelineEngine>, run: &str) -> Result<()> {
    let run_id = RunId(run.to_string());
    let approvals = engine.subscribe_approvals();
    engine.resume(&run_id).await?;
    println!("run {run_id} resumed");
    drive_foreground(engine, run_id, approvals).await
}

/// Drive a started run to a terminal state, prompting on approval gates
/// and aborting on Ctrl-C. The approval receiver must have been taken
/// before the run started.
async fn drive_foreground(
    engine: &Arc<PipelineEngine>,
    run_id: RunId,
    mut approvals: broadcast::Receiver<ApprovalRecord>,
) -> Result<()> {
    loop {
        tokio::select! {
            request = approvals.recv() => {
                match request {
                    Ok(request) if request.run_id == run_id => {
                        prompt_decision(engine, &request).await?;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "approval stream interrupted"),
                }
            }
            run = engine.wait(&run_id) => {
                let run = run?;
                match run.state {
                    RunState::Succeeded => {
                        println!("run {run_id} succeeded");
                        return Ok(());
                    }
                    RunState::Aborted => {
                        println!("run {run_id} aborted");
                        std::process::exit(1);
                    }
                    _ => {
                        if let Some(failure) = run.failure {
                            println!(
                                "run {run_id} failed at stage '{}': {} ({})",
                                failure.stage, failure.message, failure.kind
                            );
                        } else {
                            println!("run {run_id} failed");
                        }
                        std::process::exit(1);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("aborting run {run_id}");
                engine.abort(&run_id).await?;
            }
        }
    }
}

async fn prompt_decision(engine: &PipelineEngine, request: &ApprovalRecord) -> Result<()> {
    println!();
    println!(
        "approval required for stage '{}' (request {})",
        request.stage_name, request.request_id
    );
    println!(
        "deadline: {}",
        request.deadline.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("enter 'approve <identity>' or 'reject <identity>':");

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    stdin.read_line(&mut line).await?;

    let mut parts = line.split_whitespace();
    let decision = match (parts.next(), parts.next()) {
        (Some("approve"), Some(who)) => Some((Decision::Approve, Identity::new(who))),
        (Some("reject"), Some(who)) => Some((Decision::Reject, Identity::new(who))),
        _ => {
            println!("unrecognized input, gate left pending");
            None
        }
    };

    if let Some((decision, who)) = decision {
        match engine
            .decide(&request.run_id, &request.request_id, decision, who)
            .await
        {
            Ok(()) => {}
            Err(Error::AlreadyDecided(_)) => {
                println!("request was already decided or expired");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn cmd_run_status(engine: &PipelineEngine, run: &str) -> Result<()> {
    let status = engine.status(&RunId(run.to_string())).await?;
    println!("run:      {}", status.run.run_id);
    println!("pipeline: {}", status.run.pipeline_id);
    println!("state:    {}", status.run.state);
    println!("started:  {}", status.run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(finished) = status.run.finished_at {
        println!("finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(failure) = &status.run.failure {
        println!(
            "failure:  stage '{}' ({}): {}",
            failure.stage, failure.kind, failure.message
        );
    }
    if let Some(pending) = &status.pending_approval {
        println!(
            "pending approval: request {} on stage '{}', deadline {}",
            pending.request_id,
            pending.stage_name,
            pending.deadline.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if !status.results.is_empty() {
        println!("stages:");
        for result in &status.results {
            println!(
                "  {:>2}. {:<24} {:<10} attempts={}{}",
                result.seq,
                result.stage_name,
                result.outcome,
                result.attempts,
                result
                    .error_kind
                    .as_deref()
                    .map(|k| format!("  error={k}"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

async fn cmd_run_list(engine: &PipelineEngine, pipeline: Option<String>) -> Result<()> {
    let filter = pipeline.map(PipelineId);
    let runs = engine.list_runs(filter.as_ref()).await?;
    if runs.is_empty() {
        println!("no runs");
        return Ok(());
    }
    for run in runs {
        println!(
            "{}  {:<18} {}  {}",
            run.run_id,
            run.state.to_string(),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.initiator
        );
    }
    Ok(())
}

async fn cmd_tag(engine: &PipelineEngine, action: TagAction) -> Result<()> {
    match action {
        TagAction::Set {
            env,
            tag,
            digest,
            identity,
        } => {
            let digest: ImageDigest = digest.parse()?;
            let binding = engine
                .registry()
                .set_tag(&env, &tag, &digest, &acting(identity))
                .await?;
            println!("{env}:{tag} -> {} (seq {})", binding.digest, binding.seq);
        }
        TagAction::Get { env, tag } => {
            let digest = engine.registry().resolve(&env, &tag).await?;
            println!("{digest}");
        }
        TagAction::History { env, tag, limit } => {
            let history = engine.registry().history(&env, &tag).await?;
            for binding in history.iter().take(limit) {
                println!(
                    "{:>4}  {}  {}  {}",
                    binding.seq,
                    binding.digest.short(),
                    binding.bound_at.format("%Y-%m-%d %H:%M:%S"),
                    binding.bound_by
                );
            }
        }
        TagAction::Rollback { env, tag, identity } => {
            let digest = engine
                .registry()
                .rollback(&env, &tag, &acting(identity))
                .await?;
            println!("{env}:{tag} rolled back to {digest}");
        }
    }
    Ok(())
}

fn cmd_policy(policy: &PolicyStore, path: &Path, action: PolicyAction) -> Result<()> {
    match action {
        PolicyAction::Grant {
            identity,
            environment,
            permission,
        } => {
            let permission: Permission = permission
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            policy.grant(&Identity::new(identity.clone()), &environment, permission);
            save_policy(policy, path)?;
            println!("granted {permission} on {environment} to {identity}");
        }
        PolicyAction::Revoke {
            identity,
            environment,
            permission,
        } => {
            let permission: Permission = permission
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            policy.revoke(&Identity::new(identity.clone()), &environment, permission);
            save_policy(policy, path)?;
            println!("revoked {permission} on {environment} from {identity}");
        }
        PolicyAction::List => {
            let doc = policy.to_document();
            if doc.grants.is_empty() {
                println!("no grants");
            }
            for entry in doc.grants {
                let perms: Vec<&str> = entry.permissions.iter().map(|p| p.as_str()).collect();
                println!(
                    "{:<20} {:<12} {}",
                    entry.identity,
                    entry.environment,
                    perms.join(", ")
                );
            }
        }
        PolicyAction::Audit => {
            for change in policy.audit_log() {
                let verb = match change.kind {
                    gantry_core::ChangeKind::Grant => "grant",
                    gantry_core::ChangeKind::Revoke => "revoke",
                };
                println!(
                    "{}  {:<6} {:<10} {:<12} {}",
                    change.at.format("%Y-%m-%d %H:%M:%S"),
                    verb,
                    change.permission,
                    change.environment,
                    change.identity
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acting_prefers_explicit_identity() {
        assert_eq!(acting(Some("releaser".into())).as_str(), "releaser");
    }
}
