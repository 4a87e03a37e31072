use std::sync::Arc;

use turnstream::config::AppConfig;
use turnstream::observability::init_tracing;
use turnstream::store::{Identity, MemoryStore, StaticIdentity};
use turnstream::transport::{HttpChatTransport, TurnRequest};
use turnstream::turn::ChatEngine;

fn main() {
    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        eprintln!("Usage: turnstream <prompt>");
        std::process::exit(2);
    }

    let config_path =
        std::env::var("TURNSTREAM_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = AppConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    runtime.block_on(async move {
        run(config, prompt).await;
    });
}

async fn run(config: AppConfig, prompt: String) {
    let transport = HttpChatTransport::new(&config).unwrap_or_else(|e| {
        eprintln!("Failed to build transport: {e}");
        std::process::exit(1);
    });
    let store = Arc::new(MemoryStore::new());
    let identity = Arc::new(StaticIdentity(Identity {
        user_id: None,
        guest_id: Some(format!("guest-{}", uuid::Uuid::new_v4().simple())),
    }));
    let engine = ChatEngine::new(
        Arc::new(transport),
        store,
        identity,
        config.watchdog_config(),
    );

    let mut request = TurnRequest::new(
        &format!("cm-{}", uuid::Uuid::new_v4().simple()),
        prompt.trim(),
    );
    request.locale = config.chat.locale.clone();
    request.timezone = config.chat.timezone.clone();

    match engine.run_turn(request).await {
        Ok(report) => {
            println!("{}", report.text);
            if let Some(reason) = report.stats.client_finish_reason {
                tracing::info!(reason = reason.as_str(), "turn ended with client reason");
            }
        }
        Err(err) => {
            eprintln!("Turn failed: {err}");
            std::process::exit(1);
        }
    }
}
