// crates/flowcli/src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use flowcore::{Action, DataMap, ExecutionEvent, Flow, FlowParam, FlowStatus, RuntimeState};
use flownodes::ScriptRunner;
use flowruntime::{validate_flow, ActionRegistry, FlowRuntime, RuntimeConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Used when neither `--timeout` nor the flow sets one
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow file once
    Run {
        /// Path to flow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Deadline in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Run params as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Write the resulting runtime state to this file
        #[arg(short, long)]
        save: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Resume a runtime state saved by `run --save`
    Resume {
        /// Path to runtime state JSON file
        #[arg(short = 'S', long)]
        state: PathBuf,

        /// Deadline in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Params to merge before resuming, as a JSON object
        #[arg(short, long)]
        params: Option<String>,

        /// Write the resulting runtime state to this file
        #[arg(short, long)]
        save: Option<PathBuf>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a flow file
    Validate {
        /// Path to flow JSON file
        file: PathBuf,
    },

    /// List available action runners
    Actions,

    /// Create a new example flow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "flow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            timeout,
            params,
            save,
            verbose,
        } => {
            init_logging(verbose);
            let runtime = build_runtime();
            let flow = runtime.parse_flow(&std::fs::read_to_string(&file)?)?;
            println!("🚀 Loaded flow from: {}", file.display());
            let state = runtime.create_runtime(flow, parse_params(params)?);
            run_state(&runtime, state, timeout, save).await?;
        }

        Commands::Resume {
            state,
            timeout,
            params,
            save,
            verbose,
        } => {
            init_logging(verbose);
            let runtime = build_runtime();
            let mut saved: RuntimeState = serde_json::from_str(&std::fs::read_to_string(&state)?)?;
            saved.params.extend(parse_params(params)?);
            println!("🔁 Resuming runtime {} from: {}", saved.id, state.display());
            run_state(&runtime, saved, timeout, save).await?;
        }

        Commands::Validate { file } => {
            validate_file(&file)?;
        }

        Commands::Actions => {
            list_actions();
        }

        Commands::Init { output } => {
            create_example_flow(&output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

/// Standard runners, with the script runner as the `common` fallback.
fn build_registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    flownodes::register_all(&mut registry);
    registry.register("common", Arc::new(ScriptRunner));
    registry
}

fn build_runtime() -> FlowRuntime {
    FlowRuntime::with_registry(Arc::new(build_registry()), RuntimeConfig::default())
}

fn parse_params(params: Option<String>) -> Result<DataMap> {
    let Some(raw) = params else {
        return Ok(DataMap::new());
    };
    match serde_json::from_str(&raw)? {
        serde_json::Value::Object(obj) => Ok(obj.into_iter().collect()),
        _ => Err(anyhow::anyhow!("Params must be a JSON object")),
    }
}

async fn run_state(
    runtime: &FlowRuntime,
    state: RuntimeState,
    timeout: Option<u64>,
    save: Option<PathBuf>,
) -> Result<()> {
    println!("📋 Flow: {} ({})", state.flow.name, state.flow.code);
    println!("   Actions: {}", state.flow.actions.len());
    println!("   Links: {}", state.flow.links.len());
    println!();

    let timeout_ms = timeout
        .or(state.flow.timeout)
        .unwrap_or(DEFAULT_TIMEOUT_MS);

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::FlowStarted { resumed, .. } => {
                    if resumed {
                        println!("▶️  Flow resumed");
                    } else {
                        println!("▶️  Flow started");
                    }
                }
                ExecutionEvent::ActionStarted {
                    action_id,
                    action_name,
                    ..
                } => {
                    println!("  ⚡ Starting action: {} ({})", action_id, action_name);
                }
                ExecutionEvent::ActionCompleted {
                    action_id,
                    outcome,
                    elapsed_ms,
                    ..
                } => {
                    println!("  ✅ Action {} {} in {}ms", action_id, outcome, elapsed_ms);
                }
                ExecutionEvent::ActionFailed {
                    action_id, error, ..
                } => {
                    println!("  ❌ Action {} failed: {}", action_id, error);
                }
                ExecutionEvent::LinkCompleted {
                    source_id,
                    target_id,
                    outcome,
                    ..
                } => {
                    println!("  ➡️  Link {} -> {}: {}", source_id, target_id, outcome);
                }
                ExecutionEvent::LinkFailed {
                    source_id,
                    target_id,
                    error,
                    ..
                } => {
                    println!("  ❌ Link {} -> {} failed: {}", source_id, target_id, error);
                }
                ExecutionEvent::FlowTimedOut { .. } => {
                    println!("⏰ Flow timed out after {}ms", timeout_ms);
                }
                ExecutionEvent::FlowCompleted {
                    status, is_error, ..
                } => {
                    if is_error {
                        println!("💥 Flow finished with errors ({:?})", status);
                    } else {
                        println!("✨ Flow finished ({:?})", status);
                    }
                }
            }
        }
    });

    let (state, result) = runtime
        .execute(state, Some(Duration::from_millis(timeout_ms)))
        .await?;

    // Wait for events to finish printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Runtime ID: {}", result.runtime_id);
    println!("   Status: {:?}", result.status);
    println!(
        "   Records: {} actions, {} links",
        result.action_records, result.link_records
    );
    if result.status != FlowStatus::Complete {
        println!(
            "   Pending: {} actions, {} links",
            result.pending_actions, result.pending_links
        );
    }
    if !state.data.is_empty() {
        println!();
        println!("📤 Data:");
        for (key, value) in &state.data {
            println!("     {}: {}", key, value);
        }
    }
    println!();
    println!("time used(ms): {}", result.elapsed_ms);

    if let Some(path) = save {
        std::fs::write(&path, serde_json::to_string_pretty(&state)?)?;
        println!("💾 Saved runtime state to: {}", path.display());
    }

    Ok(())
}

fn validate_file(file: &Path) -> Result<()> {
    println!("🔍 Validating flow: {}", file.display());

    let flow: Flow = serde_json::from_str(&std::fs::read_to_string(file)?)?;
    let errors = validate_flow(&flow);

    println!("   Name: {}", flow.name);
    println!("   Actions: {}", flow.actions.len());
    println!("   Links: {}", flow.links.len());

    if errors.is_empty() {
        println!("✅ Flow is valid");
    } else {
        println!("⚠️  {} problem(s) found:", errors.len());
        for error in &errors {
            println!("   - {}", error);
        }
    }

    let registry = build_registry();
    for action in &flow.actions {
        if !registry.contains(&action.name) {
            println!(
                "   ℹ️  action {} uses {:?}, handled by the common runner",
                action.id, action.name
            );
        }
    }

    Ok(())
}

fn list_actions() {
    println!("📦 Available Action Runners:");
    println!();

    let registry = build_registry();
    for name in registry.names() {
        if let Some(metadata) = registry.metadata(&name) {
            println!("  • {} ({})", name, metadata.category);
            println!("    {}", metadata.description);
            for prop in &metadata.properties {
                let required = if prop.required { " (required)" } else { "" };
                println!("      - {}: {}{}", prop.name, prop.label, required);
            }
        } else {
            println!("  • {}", name);
        }
    }
}

fn create_example_flow(output: &Path) -> Result<()> {
    let mut flow = Flow::new("example", "Example Flow");
    flow.params.push(FlowParam {
        name: "who".to_string(),
        value: "world".to_string(),
    });

    flow.add_action(
        Action::new("greet", "script")
            .with_title("Greet")
            .with_param("script", r#"set_data("greeting", "hello " + get_param("who")); true"#),
    );
    flow.add_action(
        Action::new("wait", "time.delay")
            .with_title("Wait")
            .with_param("delay_ms", "200"),
    );
    flow.add_action(
        Action::new("log", "debug.log")
            .with_title("Log")
            .with_collect(true)
            .with_param("message", "both branches done"),
    );
    flow.connect("greet", "log");
    flow.connect("wait", "log");

    let json = serde_json::to_string_pretty(&flow)?;
    std::fs::write(output, json)?;

    println!("✨ Created example flow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --params '{{\"who\": \"flow\"}}'",
        output.display()
    );

    Ok(())
}
