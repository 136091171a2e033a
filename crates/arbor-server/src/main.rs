use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use arbor_agent_loop::{
    AgentIdentity, EnvSettings, GenaiLlmExecutor, SettingsStore, StaticModelResolver,
    SubAgentTracker, ToolRegistry, TurnRunner, UpdatePlanTool, WaitSubagentTool,
};
use arbor_chat_store::ChatStore;
use arbor_server::http;
use arbor_server::service::AppState;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "arbor-server")]
struct Args {
    #[arg(long, env = "ARBOR_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    #[arg(long, env = "ARBOR_DATA_DIR", default_value = "./sessions")]
    data_dir: PathBuf,

    /// Default model id for requests that do not name one. Falls back to
    /// the ARBOR_MODEL environment variable.
    #[arg(long)]
    model: Option<String>,

    /// Upper bound on model/tool rounds within one turn.
    #[arg(long, env = "ARBOR_MAX_ROUNDS")]
    max_rounds: Option<usize>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let settings = EnvSettings;
    let default_model = args
        .model
        .or_else(|| settings.get("ARBOR_MODEL"))
        .unwrap_or_default();
    if default_model.is_empty() {
        warn!("no default model configured; chat requests must name one");
    }

    let store = Arc::new(ChatStore::new(args.data_dir));
    let resolver = Arc::new(StaticModelResolver::new(
        default_model,
        Arc::new(GenaiLlmExecutor::default()),
    ));
    let tracker = Arc::new(SubAgentTracker::new());
    let tools = Arc::new(
        ToolRegistry::new()
            .with(Arc::new(UpdatePlanTool))
            .with(Arc::new(WaitSubagentTool::new(tracker))),
    );
    let agent = AgentIdentity::new("arbor", "Arbor", "chat");
    let mut runner = TurnRunner::new(store.clone(), resolver, tools, agent);
    if let Some(max_rounds) = args.max_rounds {
        runner = runner.with_max_rounds(max_rounds);
    }

    let app = http::router(AppState::new(store, Arc::new(runner)));

    info!(addr = %args.http_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&args.http_addr)
        .await
        .expect("failed to bind http listener");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("http server crashed");
}
