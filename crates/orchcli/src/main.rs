// crates/orchcli/src/main.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use orchcore::{
    DispatchError, ExecutionEvent, FailurePolicy, NodeKind, NodeKindTag, NodeSpec, NodeStatus,
    RunStatus, Value,
};
use orchruntime::{CancellationToken, Dispatcher, FlowRuntime, ResolvedInputs, RuntimeConfig};
use orchtemplates::{WorkflowDocument, TEMPLATE_NAMES};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "orch")]
#[command(about = "Workflow orchestration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file against the echo dispatcher
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Initial context as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Path to runtime configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Failure policy: fail-fast or best-effort
        #[arg(long)]
        policy: Option<FailurePolicy>,

        /// Maximum number of nodes dispatched at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Print the full run result as JSON
        #[arg(long)]
        json: bool,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List the available templates
    Templates,

    /// Create a new example workflow
    Init {
        /// Template to start from
        #[arg(short, long, default_value = "sequential")]
        template: String,

        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            config,
            policy,
            max_parallel,
            json,
            verbose,
        } => {
            init_logging(verbose);

            let mut runtime_config = match config {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading config {}", path.display()))?;
                    RuntimeConfig::from_json(&raw)?
                }
                None => RuntimeConfig::default(),
            };
            if let Some(policy) = policy {
                runtime_config.failure_policy = policy;
            }
            if let Some(max) = max_parallel {
                runtime_config.max_parallel_nodes = max;
            }

            let status = run_workflow(file, input, runtime_config, json).await?;
            if status != RunStatus::Succeeded {
                std::process::exit(1);
            }
        }

        Commands::Validate { file } => {
            validate_workflow(file)?;
        }

        Commands::Templates => {
            list_templates();
        }

        Commands::Init { template, output } => {
            create_example_workflow(&template, output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Stand-in collaborator: agents echo their rendered prompt, tools echo
/// their arguments.
struct EchoDispatcher;

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn dispatch(
        &self,
        node: Arc<NodeSpec>,
        inputs: ResolvedInputs,
        _cancel: CancellationToken,
    ) -> Result<Value, DispatchError> {
        match &node.kind {
            NodeKind::AgentCall { agent, .. } => Ok(Value::from(format!(
                "[{}] {}",
                agent,
                inputs.prompt.unwrap_or_default()
            ))),
            NodeKind::ToolCall { tool, .. } => {
                let mut out = BTreeMap::new();
                out.insert("tool".to_string(), Value::from(tool.as_str()));
                out.insert("args".to_string(), Value::Object(inputs.args));
                Ok(Value::Object(out))
            }
            _ => Ok(inputs.merged()),
        }
    }
}

fn load_document(file: &Path) -> Result<WorkflowDocument> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading workflow {}", file.display()))?;
    Ok(WorkflowDocument::from_json(&raw)?)
}

fn parse_context(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(input_str) = input else {
        return Ok(BTreeMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&input_str)?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow::anyhow!("Input must be a JSON object")),
    }
}

async fn run_workflow(
    file: PathBuf,
    input: Option<String>,
    config: RuntimeConfig,
    json: bool,
) -> Result<RunStatus> {
    println!("🚀 Loading workflow from: {}", file.display());

    let document = load_document(&file)?;
    let template = document.template();
    let graph = Arc::new(document.build()?);
    let context = parse_context(input)?;

    println!("📋 Workflow: {} ({})", graph.name(), template);
    println!("   Nodes: {}", graph.len());
    println!("   Policy: {:?}, max parallel: {}", config.failure_policy, config.max_parallel_nodes);
    println!();

    let mut runtime = FlowRuntime::with_config(config);
    let echo: Arc<dyn Dispatcher> = Arc::new(EchoDispatcher);
    runtime.register_dispatcher(NodeKindTag::AgentCall, echo.clone());
    runtime.register_dispatcher(NodeKindTag::ToolCall, echo);

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::RunStarted { run_id, .. } => {
                    println!("▶️  Run {} started", run_id);
                }
                ExecutionEvent::NodeStarted { node_id, kind, attempt, .. } => {
                    println!("  ⚡ Starting node: {} ({}, attempt {})", node_id, kind, attempt);
                }
                ExecutionEvent::NodeRetrying { node_id, delay_ms, error, .. } => {
                    println!("  🔁 Node {} retrying in {}ms: {}", node_id, delay_ms, error);
                }
                ExecutionEvent::NodeSucceeded { node_id, duration_ms, .. } => {
                    println!("  ✅ Node {} completed in {}ms", node_id, duration_ms);
                }
                ExecutionEvent::NodeFailed { node_id, error, .. } => {
                    println!("  ❌ Node {} failed: {}", node_id, error);
                }
                ExecutionEvent::NodeSkipped { node_id, reason, .. } => {
                    println!("  ⏭️  Node {} skipped: {:?}", node_id, reason);
                }
                ExecutionEvent::RunCompleted { status, duration_ms, .. } => {
                    match status {
                        RunStatus::Succeeded => {
                            println!("✨ Run completed successfully in {}ms", duration_ms)
                        }
                        RunStatus::Failed => println!("💥 Run failed after {}ms", duration_ms),
                        RunStatus::Cancelled => {
                            println!("🛑 Run cancelled after {}ms", duration_ms)
                        }
                    }
                    break;
                }
            }
        }
    });

    let handle = runtime.start(graph, context).await?;
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = handle.wait().await?;
    let _ = event_task.await;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(result.status);
    }

    println!();
    println!("📊 Execution Summary:");
    println!("   Run ID: {}", result.run_id);
    println!(
        "   Succeeded: {}/{} nodes",
        result.nodes_with_status(NodeStatus::Succeeded).len(),
        result.node_states.len()
    );
    for error in &result.errors {
        match &error.node_id {
            Some(node) => println!("   Error in {}: {}", node, error.message),
            None => println!("   Error: {}", error.message),
        }
    }

    if !result.variables.outputs.is_empty() {
        println!();
        println!("📤 Outputs:");
        for (node_id, value) in &result.variables.outputs {
            println!("   {}: {}", node_id, value.to_text());
        }
    }

    Ok(result.status)
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let document = load_document(&file)?;
    let template = document.template();
    let graph = document.build()?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", graph.name());
    println!("   Template: {}", template);
    println!("   Nodes: {}", graph.len());
    println!("   Roots: {}", graph.roots().join(", "));
    println!("   Order: {}", graph.topological_order().join(" → "));

    Ok(())
}

fn list_templates() {
    println!("📦 Available Templates:");
    println!();
    for name in TEMPLATE_NAMES {
        println!("  • {}", name);
    }
}

fn create_example_workflow(template: &str, output: PathBuf) -> Result<()> {
    let document = WorkflowDocument::example(template).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown template '{}', expected one of: {}",
            template,
            TEMPLATE_NAMES.join(", ")
        )
    })?;

    std::fs::write(&output, document.to_json_pretty()?)?;

    println!("✨ Created example {} workflow: {}", template, output.display());
    println!();
    println!("Run it with:");
    println!(
        "  orch run --file {} --input '{{\"topic\": \"ownership\", \"question\": \"What is 6 x 7?\"}}'",
        output.display()
    );

    Ok(())
}
