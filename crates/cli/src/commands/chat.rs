//! `toolpilot chat`: interactive or single-message chat.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use toolpilot_agent::{AssistantReply, CancellationToken, ChatRequest, ChatService, ProgressCallback};
use toolpilot_config::AppConfig;
use toolpilot_core::message::Message;

pub struct ChatOptions {
    pub message: Option<String>,
    pub model: Option<String>,
    pub standard: bool,
    pub json: bool,
}

pub async fn run(options: ChatOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    if options.standard {
        config.agent.enabled = false;
    }

    if !config.has_api_key() && !is_local_provider(&config) {
        eprintln!();
        eprintln!("  WARNING: No API key configured for '{}'.", config.default_provider);
        eprintln!("  Set TOOLPILOT_API_KEY, OPENAI_API_KEY or OPENROUTER_API_KEY,");
        eprintln!("  or add api_key to {}", AppConfig::config_path().display());
        eprintln!();
    }

    tracing::debug!(
        provider = %config.default_provider,
        model = %options.model.as_deref().unwrap_or(&config.default_model),
        autonomous = config.agent.enabled,
        "Starting chat"
    );
    let service = ChatService::from_config(&config);
    let printed = Arc::new(Mutex::new(String::new()));
    let on_chunk = stdout_sink(printed.clone());

    if let Some(message) = options.message {
        let reply = ask(&service, request(message, &options.model, Vec::new()), on_chunk).await;
        finish_reply(&reply, &printed, options.json);
        service.shutdown().await;
        return Ok(());
    }

    println!();
    println!("  toolpilot: interactive mode");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", options.model.as_deref().unwrap_or(&config.default_model));
    println!(
        "  Mode:      {}",
        if config.agent.enabled { "autonomous" } else { "standard" }
    );
    println!("  Tools:     {}", service.available_tools().await.len());
    println!();
    println!("  Type your message and press Enter. Ctrl+C stops the current answer.");
    println!("  Type 'exit' to quit.");
    println!();

    let mut history: Vec<Message> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        println!();
        let reply = ask(&service, request(line.clone(), &options.model, history.clone()), on_chunk.clone()).await;
        finish_reply(&reply, &printed, options.json);

        history.push(Message::user(line));
        if !reply.content.is_empty() {
            history.push(Message::assistant(&reply.content));
        }
    }

    service.shutdown().await;
    println!();
    println!("  Goodbye!");
    Ok(())
}

fn request(message: String, model: &Option<String>, history: Vec<Message>) -> ChatRequest {
    let request = ChatRequest::new(message).with_history(history);
    match model {
        Some(model) => request.with_model(model),
        None => request,
    }
}

/// Send one message; Ctrl+C cancels it and keeps the partial answer.
async fn ask(service: &ChatService, request: ChatRequest, on_chunk: ProgressCallback) -> AssistantReply {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let reply = service.send_chat_message(request, Some(on_chunk), cancel).await;
    watcher.abort();
    reply
}

/// Writes chunks to stdout and remembers them until the reply is finished.
fn stdout_sink(printed: Arc<Mutex<String>>) -> ProgressCallback {
    Arc::new(move |chunk: &str| {
        if let Ok(mut seen) = printed.lock() {
            seen.push_str(chunk);
        }
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    })
}

/// Print the reply unless its text already went to stdout.
fn finish_reply(reply: &AssistantReply, printed: &Mutex<String>, json: bool) {
    let streamed = printed
        .lock()
        .map(|mut seen| std::mem::take(&mut *seen))
        .unwrap_or_default();
    let content = reply.content.trim();
    if !already_shown(&streamed, content) {
        if !streamed.is_empty() {
            println!();
        }
        println!("{content}");
    }
    println!();
    if reply.is_aborted() {
        eprintln!("  [stopped]");
    }
    if let Some(error) = &reply.metadata.error {
        eprintln!("  [error] {error}");
    }
    if json {
        match serde_json::to_string_pretty(&reply.metadata) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("  [error] could not render metadata: {e}"),
        }
    }
    println!();
}

/// Model text reaches the callback interleaved with narration, so only the
/// last paragraph of the reply is expected at the end of the output.
fn already_shown(streamed: &str, content: &str) -> bool {
    let tail = content.rsplit("\n\n").next().unwrap_or(content).trim();
    tail.is_empty() || streamed.trim_end().ends_with(tail)
}

fn is_local_provider(config: &AppConfig) -> bool {
    let kind = config
        .providers
        .get(&config.default_provider)
        .and_then(|p| p.kind.clone())
        .unwrap_or_else(|| config.default_provider.clone());
    matches!(kind.as_str(), "ollama" | "llamacpp" | "lmstudio")
}
