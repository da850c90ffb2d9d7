//! Chat service: everything between a user message and the reply envelope.
//!
//! Resolves the provider, gathers tools, builds the prompt and history,
//! picks standard or autonomous mode, and wraps the result. Callers always
//! get an [`AssistantReply`]; failures and aborts are described inside it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use toolpilot_config::AppConfig;
use toolpilot_core::event::EventBus;
use toolpilot_core::message::{Message, Role};
use toolpilot_core::provider::ToolDefinition;
use toolpilot_core::tool::ToolRegistry;
use toolpilot_core::{AgentPolicy, ProtocolToolClient, ScriptEvaluator};
use toolpilot_providers::ProviderRouter;
use toolpilot_providers::router::build_from_config;
use toolpilot_tools::{McpClientManager, StoredTool, SubprocessEvaluator, ToolCatalog, builtin_registry};
use tracing::{debug, info, warn};

use crate::assembler::{AssistantReply, ReplyContext, build_final_message};
use crate::context::{AgentExecutionContext, ProgressCallback};
use crate::invoker::{RetryPolicy, ToolInvoker};
use crate::loop_runner::{AgentLoop, LoopRequest};
use crate::prompt::{build_enhanced_prompt, standard_prompt};
use crate::turn::TurnExecutor;

/// Per-service settings, taken from the configuration once.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// Default model reference; may carry a `provider:` prefix
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub streaming: bool,
    pub tools_enabled: bool,
    pub mcp_enabled: bool,
    pub mcp_server_filter: Vec<String>,
    pub stored_tools: Vec<StoredTool>,
    pub policy: AgentPolicy,
}

impl ChatSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.default_model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.parameters.temperature,
            max_tokens: config.parameters.max_tokens,
            top_p: config.parameters.top_p,
            streaming: config.features.enable_streaming,
            tools_enabled: config.features.enable_tools,
            mcp_enabled: config.features.enable_mcp,
            mcp_server_filter: config.mcp_enabled_servers.clone(),
            stored_tools: config
                .stored_tools
                .iter()
                .filter(|t| t.enabled)
                .map(StoredTool::from_config)
                .collect(),
            policy: config.agent.clone(),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// One user message plus the conversation it belongs to.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub message: String,
    pub images: Vec<String>,

    /// Earlier messages, oldest first, excluding `message`
    pub history: Vec<Message>,

    /// Overrides the configured model
    pub model: Option<String>,

    /// Overrides the configured system prompt
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

pub struct ChatService {
    providers: ProviderRouter,
    builtin: Arc<ToolRegistry>,
    protocol: Option<Arc<dyn ProtocolToolClient>>,
    mcp: Option<Arc<McpClientManager>>,
    evaluator: Arc<dyn ScriptEvaluator>,
    settings: ChatSettings,
    events: Arc<EventBus>,
}

impl ChatService {
    pub fn new(providers: ProviderRouter, settings: ChatSettings) -> Self {
        Self {
            providers,
            builtin: Arc::new(builtin_registry()),
            protocol: None,
            mcp: None,
            evaluator: Arc::new(SubprocessEvaluator::default()),
            settings,
            events: Arc::new(EventBus::default()),
        }
    }

    /// Providers, tools and MCP servers as configured.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut service = Self::new(build_from_config(config), ChatSettings::from_config(config));
        let servers: Vec<_> = config.mcp_servers.iter().filter(|s| s.enabled).cloned().collect();
        if config.features.enable_mcp && !servers.is_empty() {
            let manager = Arc::new(McpClientManager::new(servers));
            service.protocol = Some(manager.clone() as Arc<dyn ProtocolToolClient>);
            service.mcp = Some(manager);
        }
        service
    }

    pub fn with_protocol_client(mut self, client: Arc<dyn ProtocolToolClient>) -> Self {
        self.protocol = Some(client);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_builtin_tools(mut self, registry: ToolRegistry) -> Self {
        self.builtin = Arc::new(registry);
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn providers(&self) -> &ProviderRouter {
        &self.providers
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Sanitized definitions of every tool a message would be offered.
    pub async fn available_tools(&self) -> Vec<ToolDefinition> {
        let mut ctx = AgentExecutionContext::new("").with_progress_tracking(false);
        self.collect_tools(&mut ctx).await.definitions()
    }

    /// Disconnect from MCP servers.
    pub async fn shutdown(&self) {
        if let Some(mcp) = &self.mcp {
            mcp.shutdown().await;
        }
    }

    /// Answer one user message.
    ///
    /// Streamed content and progress narration go to `on_chunk` as they
    /// arrive. Cancelling `cancel` ends the run early with the partial text
    /// and `metadata.aborted` set.
    pub async fn send_chat_message(
        &self,
        request: ChatRequest,
        on_chunk: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> AssistantReply {
        let policy = self.settings.policy.clone();
        let model_ref = request
            .model
            .clone()
            .unwrap_or_else(|| self.settings.model.clone());
        let reply_ctx = ReplyContext {
            model: model_ref.clone(),
            temperature: self.settings.temperature,
            autonomous: policy.enabled,
        };

        let Some((provider, _)) = self.providers.resolve(&model_ref) else {
            warn!(model = %model_ref, "No provider available");
            return AssistantReply::error(format!("No provider configured for model '{model_ref}'"), &reply_ctx);
        };
        let model = strip_provider_prefix(&model_ref, &self.providers.list());
        info!(
            provider = %provider.name(),
            model = %model,
            autonomous = policy.enabled,
            history = request.history.len(),
            "Handling chat message"
        );

        let mut ctx = AgentExecutionContext::new(&request.message)
            .with_callback(on_chunk)
            .with_progress_tracking(policy.enable_progress_tracking);

        let catalog = Arc::new(self.collect_tools(&mut ctx).await);
        let tools = catalog.definitions();

        let base_prompt = request
            .system_prompt
            .as_deref()
            .or(self.settings.system_prompt.as_deref());
        let system_prompt = if policy.enabled {
            build_enhanced_prompt(base_prompt, &tools, &policy)
        } else {
            standard_prompt(base_prompt)
        };
        let messages = build_messages(&system_prompt, &request.history, &request.message, request.images);

        let invoker = ToolInvoker::new(catalog, self.evaluator.clone())
            .with_protocol_client(self.protocol.clone())
            .with_retry(RetryPolicy::from_policy(&policy))
            .with_self_correction(policy.enable_self_correction)
            .with_events(self.events.clone());
        let agent = AgentLoop::new(
            TurnExecutor::new(provider, self.settings.streaming),
            invoker,
            policy.clone(),
            self.events.clone(),
        );
        let loop_request = LoopRequest {
            model,
            messages,
            tools,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
            top_p: self.settings.top_p,
        };

        let outcome = if policy.enabled {
            agent.run(loop_request, &mut ctx, &cancel).await
        } else {
            agent.run_single_pass(loop_request, &mut ctx, &cancel).await
        };
        build_final_message(outcome, &reply_ctx)
    }

    async fn collect_tools(&self, ctx: &mut AgentExecutionContext) -> ToolCatalog {
        if !self.settings.tools_enabled {
            debug!("Tools disabled in configuration");
            return ToolCatalog::new(ToolRegistry::new());
        }

        let mut catalog = ToolCatalog::new(self.builtin.clone());
        for tool in &self.settings.stored_tools {
            catalog.add_stored(tool.clone());
        }

        if !self.settings.mcp_enabled {
            ctx.narrate("MCP tools are disabled in configuration.\n");
            return catalog;
        }
        let Some(client) = &self.protocol else {
            return catalog;
        };

        let filter = &self.settings.mcp_server_filter;
        let availability = client.availability(filter).await;
        for (server, reason) in &availability.unavailable {
            ctx.narrate(format!("MCP server '{server}' is unavailable: {reason}\n"));
        }

        match client.list_available_tools(filter).await {
            Ok(tools) if tools.is_empty() => ctx.narrate("No MCP tools available.\n"),
            Ok(tools) => {
                let mut per_server: BTreeMap<String, usize> = BTreeMap::new();
                for tool in &tools {
                    *per_server.entry(tool.server.clone()).or_default() += 1;
                }
                for (server, count) in per_server {
                    ctx.narrate(format!("Loaded {count} MCP tools from {server}\n"));
                }
                catalog.add_protocol_tools(tools);
            }
            Err(e) => {
                warn!(error = %e, "Listing MCP tools failed");
                ctx.narrate(format!("Could not load MCP tools: {e}\n"));
            }
        }
        catalog
    }
}

/// Drop a leading `provider:` segment naming a known provider.
///
/// `ollama:qwen3:30b` becomes `qwen3:30b`; `qwen3:30b` is left alone
/// because `qwen3` is not a provider.
pub fn strip_provider_prefix(model: &str, providers: &[&str]) -> String {
    match model.split_once(':') {
        Some((prefix, rest)) if !rest.is_empty() && providers.contains(&prefix) => rest.to_string(),
        _ => model.to_string(),
    }
}

/// System prompt, prior user/assistant turns, then the new user message.
///
/// History keeps its text and images; tool traffic from earlier runs is
/// not replayed.
pub fn build_messages(
    system_prompt: &str,
    history: &[Message],
    message: &str,
    images: Vec<String>,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(
        history
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .filter(|m| !m.content.is_empty() || !m.images.is_empty())
            .map(|m| {
                let carried = match m.role {
                    Role::User => Message::user(&m.content),
                    _ => Message::assistant(&m.content),
                };
                carried.with_images(m.images.clone())
            }),
    );
    messages.push(Message::user(message).with_images(images));
    messages
}
