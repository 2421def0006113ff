//! Console driver for the sandbot core
//!
//! Reads `session-key: message` lines from stdin and feeds them to the
//! debounced scheduler, standing in for a real chat adapter. Useful for
//! exercising the whole stack against a local Docker daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use sandbot::agent::{InboundMessage, SessionHistory};
use sandbot::docker::DockerClient;
use sandbot::model::HttpModelClient;
use sandbot::{AgentEngine, CoreConfig, SandboxOrchestrator, SessionScheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = CoreConfig::from_env();

    match std::env::var("SANDBOT_OTLP_ENDPOINT") {
        Ok(endpoint) => sandbot::tracing::init_tracing("sandbot", &endpoint)?,
        Err(_) => sandbot::tracing::init_logging(),
    }

    println!("sandbot console");
    println!("  docker socket : {}", config.docker_socket.display());
    println!("  image         : {}", config.sandbox_image);
    println!("  model         : {} ({})", config.primary_group.model, config.primary_group.base_url);
    println!("  max sandboxes : {}", config.max_concurrent_sandboxes);
    println!();
    println!("type `session-key: message` and press enter; Ctrl+C to exit");
    println!("--------------------------------------------------");

    let runtime = Arc::new(DockerClient::new(&config.docker_socket));
    let orchestrator = Arc::new(SandboxOrchestrator::new(runtime, config.clone())?);
    let model = Arc::new(HttpModelClient::new());
    let history = Arc::new(SessionHistory::new(config.history_max_messages * 4));
    let engine = Arc::new(AgentEngine::new(model, orchestrator, history, config.clone()));
    let scheduler = SessionScheduler::new(engine, config.debounce_window);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Some((session, text)) = line.split_once(':') else {
                    println!("expected `session-key: message`");
                    continue;
                };
                let session = session.trim();
                let message = InboundMessage::text_only(
                    uuid::Uuid::now_v7().to_string(),
                    "console",
                    text.trim(),
                );
                scheduler.notify(session, message);
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nshutting down ({} sessions tracked)", scheduler.session_count());
                scheduler.shutdown();
                // let in-flight turns finish, up to the sandbox timeout
                let grace = tokio::time::Instant::now() + config.sandbox_timeout;
                while scheduler.any_running() && tokio::time::Instant::now() < grace {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                break;
            }
        }
    }

    sandbot::tracing::shutdown_tracing();
    Ok(())
}
