//! Kioku MCP Server - persona-scoped long-term memory for AI agents
//!
//! Core features:
//! - Persona-partitioned durable store (SQLite) with additive schema
//!   evolution, operation log, promises/goals, memory blocks and a
//!   bitemporal user-state log
//! - Hybrid search: keyword/fuzzy + Qdrant semantic with cross-encoder
//!   reranking, metadata filters and composite scoring
//! - Async write path: synchronous durable writes, deferred vector upserts
//!   with a dirty-flag recovery contract, association generation
//! - Background workers: idle vector rebuild, cleanup suggestions,
//!   periodic self-summarization
//!
//! Transports: newline-delimited JSON-RPC on stdio and streamable HTTP
//! with the persona carried in the `x-persona` header.

mod protocol;
mod resources;
mod server;
mod tools;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use kioku_core::{ConfigManager, MemoryEngine, WorkerHandles};

use crate::protocol::stdio::StdioTransport;
use crate::server::McpServer;

struct Args {
    data_dir: Option<PathBuf>,
    persona: String,
    http: bool,
}

/// Parse command-line arguments. Exits on --help/--version.
fn parse_args() -> Args {
    let mut args = Args {
        data_dir: None,
        persona: "default".to_string(),
        http: false,
    };
    let argv: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "--help" | "-h" => {
                println!("Kioku MCP Server v{}", env!("CARGO_PKG_VERSION"));
                println!();
                println!("Persona-scoped long-term memory server over the Model Context Protocol.");
                println!();
                println!("USAGE:");
                println!("    kioku-mcp [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help              Print help information");
                println!("    -V, --version           Print version information");
                println!("    --data-dir <PATH>       Custom data directory");
                println!("    --persona <NAME>        Default persona for stdio sessions");
                println!("    --http                  Serve HTTP instead of stdio");
                println!();
                println!("ENVIRONMENT:");
                println!("    RUST_LOG                Log level filter (e.g. debug, info, warn)");
                println!("    KIOKU_DATA_DIR          Data directory (same as --data-dir)");
                println!("    KIOKU_*                 Config overrides (e.g. KIOKU_SERVER_PORT)");
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("kioku-mcp {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--data-dir" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                args.data_dir = Some(PathBuf::from(&argv[i]));
            }
            "--persona" => {
                i += 1;
                if i >= argv.len() {
                    eprintln!("error: --persona requires a name argument");
                    std::process::exit(1);
                }
                args.persona = argv[i].clone();
            }
            "--http" => args.http = true,
            arg if arg.starts_with("--data-dir=") => {
                let path = arg.strip_prefix("--data-dir=").unwrap_or("");
                if path.is_empty() {
                    eprintln!("error: --data-dir requires a path argument");
                    std::process::exit(1);
                }
                args.data_dir = Some(PathBuf::from(path));
            }
            arg if arg.starts_with("--persona=") => {
                let name = arg.strip_prefix("--persona=").unwrap_or("");
                if name.is_empty() {
                    eprintln!("error: --persona requires a name argument");
                    std::process::exit(1);
                }
                args.persona = name.to_string();
            }
            arg => {
                eprintln!("error: unknown argument '{}'", arg);
                eprintln!("Try 'kioku-mcp --help' for more information.");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    args
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    // Logging goes to stderr - stdout is reserved for JSON-RPC frames.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    info!("Kioku MCP Server v{} starting...", env!("CARGO_PKG_VERSION"));

    let data_dir = args
        .data_dir
        .unwrap_or_else(ConfigManager::default_data_dir);

    let engine = match MemoryEngine::builder(data_dir).build() {
        Ok(engine) => {
            info!("Memory engine initialized");
            engine
        }
        Err(e) => {
            error!("Failed to initialize memory engine: {}", e);
            std::process::exit(1);
        }
    };

    // Open the default persona up front so background workers have work to
    // observe even before the first tool call.
    if let Err(e) = engine.persona(&args.persona) {
        error!("Failed to open persona '{}': {}", args.persona, e);
        std::process::exit(1);
    }

    let workers = WorkerHandles::spawn(Arc::clone(&engine));

    let run_result = if args.http {
        #[cfg(feature = "http")]
        {
            let config = engine.config();
            let transport = protocol::http::HttpTransport::new(protocol::http::HttpTransportConfig {
                host: config.server_host.clone(),
                port: config.server_port,
            });
            transport.run(Arc::clone(&engine), args.persona.clone()).await
        }
        #[cfg(not(feature = "http"))]
        {
            error!("--http requested but this build has no http feature");
            std::process::exit(1);
        }
    } else {
        let server = McpServer::new(Arc::clone(&engine), args.persona.clone());
        info!("Starting MCP server on stdio...");
        StdioTransport::new().run(server).await
    };

    if let Err(e) = run_result {
        error!("Server error: {}", e);
    }

    // Drain what we can before exiting: pending vector tasks, then workers.
    engine.flush_queue().await;
    workers.shutdown().await;

    info!("Kioku MCP Server shutting down");
}
