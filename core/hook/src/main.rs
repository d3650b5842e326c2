//! beacon-hook: event producer for the beacon daemon.
//!
//! Called directly by tool hooks (reading the payload from stdin) and by
//! CLI producers that want a one-shot event on the bus. Delivery is
//! always best-effort: when no daemon is advertised, both paths are
//! silent no-ops and the producer is never slowed down.

mod emitter;
mod handle;

use beacon_protocol::{EventContext, Source};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use emitter::Emitter;

#[derive(Parser)]
#[command(name = "beacon-hook")]
#[command(about = "Emit tool lifecycle events to the beacon daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a hook event (reads the JSON payload from stdin)
    Handle {
        /// Hook name in kebab-case, e.g. pre-tool-use
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Emit a one-shot event from the command line
    Send {
        /// Dot-qualified event type, e.g. worktree.created
        #[arg(long = "type", value_name = "TYPE")]
        event_type: String,

        /// Event data as a JSON object
        #[arg(long, default_value = "{}")]
        data: String,

        /// App label (defaults to claude-code)
        #[arg(long, default_value = "claude-code")]
        app: String,

        /// Project root (defaults to the working directory)
        #[arg(long)]
        app_root: Option<String>,

        /// Correlation id to group related events
        #[arg(long)]
        correlation_id: Option<String>,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let mut emitter = match Emitter::new() {
        Ok(emitter) => emitter,
        Err(err) => {
            // Event delivery is non-critical; never fail the producer.
            tracing::warn!(error = %err, "beacon-hook disabled");
            return;
        }
    };

    match cli.command {
        Commands::Handle { name } => {
            if let Err(err) = handle::run(&name, &mut emitter) {
                tracing::warn!(error = %err, name = %name, "beacon-hook handle failed");
            }
        }
        Commands::Send {
            event_type,
            data,
            app,
            app_root,
            correlation_id,
        } => {
            if let Err(err) = send(&mut emitter, &event_type, &data, app, app_root, correlation_id)
            {
                tracing::warn!(error = %err, "beacon-hook send failed");
            }
        }
    }
}

fn send(
    emitter: &mut Emitter,
    event_type: &str,
    data: &str,
    app: String,
    app_root: Option<String>,
    correlation_id: Option<String>,
) -> Result<(), String> {
    let data: Map<String, Value> = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err("--data must be a JSON object".to_string()),
        Err(err) => return Err(format!("--data was not valid JSON: {}", err)),
    };

    let app_root = match app_root {
        Some(root) => root,
        None => std::env::current_dir()
            .map_err(|err| format!("Failed to resolve working directory: {}", err))?
            .to_string_lossy()
            .to_string(),
    };

    let ctx = EventContext {
        app,
        app_root,
        source: Source::Cli,
        correlation_id,
    };
    emitter.emit_cli(event_type, data, &ctx);
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
