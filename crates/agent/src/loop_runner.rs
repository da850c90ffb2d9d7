//! The agent loop: bounded turn → tools → continuation cycle.
//!
//! Each step asks the model for a turn. Tool calls are executed in order,
//! answered with exactly one tool message each, and fed into the next step.
//! The loop ends on the first turn without tool calls, when the step budget
//! runs out, or when failures reach the retry ceiling.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use toolpilot_core::event::{DomainEvent, EventBus};
use toolpilot_core::message::{Message, MessageToolCall};
use toolpilot_core::provider::{ProviderRequest, ToolDefinition, Usage};
use toolpilot_core::AgentPolicy;
use tracing::{debug, info, warn};

use crate::assembler::{BUDGET_LEAD, DUPLICATE_LEAD, FAILURE_LEAD, best_effort_summary};
use crate::context::AgentExecutionContext;
use crate::invoker::{RetryPolicy, ToolInvoker, ToolOutcome};
use crate::turn::{Delivery, StepResult, TurnError, TurnExecutor};

/// What to send on every turn of one run.
#[derive(Debug, Clone)]
pub struct LoopRequest {
    pub model: String,

    /// System prompt, history and the user message
    pub messages: Vec<Message>,

    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

impl LoopRequest {
    fn provider_request(&self, messages: &[Message], with_tools: bool) -> ProviderRequest {
        let mut request = ProviderRequest::new(&self.model, messages.to_vec());
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;
        request.top_p = self.top_p;
        if with_tools {
            request.tools = self.tools.clone();
        }
        request
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Termination {
    /// The model answered without requesting tools
    #[default]
    Completed,
    BudgetExhausted,
    FailureCeiling,
    DuplicateToolCallId,
    Aborted,
    /// A single-pass run whose turn failed
    Failed,
}

/// Everything a run produced.
#[derive(Debug, Clone, Default)]
pub struct LoopOutcome {
    pub text: String,
    pub tool_outcomes: Vec<ToolOutcome>,
    pub steps_consumed: u32,
    pub usage: Usage,
    pub aborted: bool,
    pub error: Option<String>,

    /// Answered tool-call ids, in answer order
    pub processed_ids: Vec<String>,

    /// The conversation as sent on the last turn, plus the final answer
    pub transcript: Vec<Message>,

    pub termination: Termination,
}

pub struct AgentLoop {
    turns: TurnExecutor,
    invoker: ToolInvoker,
    policy: AgentPolicy,
    events: Arc<EventBus>,
}

impl AgentLoop {
    pub fn new(
        turns: TurnExecutor,
        invoker: ToolInvoker,
        policy: AgentPolicy,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            turns,
            invoker,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    /// Run the autonomous loop to completion.
    ///
    /// Never fails: provider errors, aborts and tool failures all end in a
    /// [`LoopOutcome`] describing what happened.
    pub async fn run(
        &self,
        request: LoopRequest,
        ctx: &mut AgentExecutionContext,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let with_tools = !request.tools.is_empty();
        ctx.step_budget = self.policy.step_budget(with_tools);
        ctx.tools_available = request.tools.iter().map(|t| t.name.clone()).collect();
        let failure_ceiling = self.policy.max_retries.max(1);

        info!(
            model = %request.model,
            step_budget = ctx.step_budget,
            tools = ctx.tools_available.len(),
            "Starting agent loop"
        );

        let mut messages = request.messages.clone();
        let mut answered: HashSet<String> = HashSet::new();
        let mut outcome = LoopOutcome::default();
        let mut failures = 0;
        let mut reply = ReplyText::default();
        let mut closing: Option<String> = None;

        let termination = 'steps: {
            for step in 1..=ctx.step_budget {
                ctx.current_step = step;
                outcome.steps_consumed = step;
                if step > 1 {
                    ctx.narrate(format!("\n\nStep {step}/{}\n", ctx.step_budget));
                }

                let turn = self
                    .turns
                    .execute(request.provider_request(&messages, with_tools), ctx.sink(), cancel)
                    .await;

                let result = match turn {
                    Ok(result) => result,
                    Err(TurnError::Aborted { partial_text }) => {
                        info!(step, "Agent loop aborted");
                        reply.push_streamed(&partial_text);
                        outcome.aborted = true;
                        break 'steps Termination::Aborted;
                    }
                    Err(TurnError::Provider(e)) if e.is_duplicate_tool_call_id() => {
                        warn!(step, error = %e, "Backend rejected a repeated tool-call id");
                        answered.clear();
                        let summary = best_effort_summary(&outcome.tool_outcomes, DUPLICATE_LEAD);
                        reply.deliver(&summary, ctx);
                        closing = Some(summary);
                        break 'steps Termination::DuplicateToolCallId;
                    }
                    Err(TurnError::Provider(e)) => {
                        failures += 1;
                        warn!(step, failures, error = %e, "Agent step failed");
                        self.events.publish(DomainEvent::ErrorOccurred {
                            context: format!("agent step {step}"),
                            error_message: e.to_string(),
                            timestamp: Utc::now(),
                        });
                        if failures >= failure_ceiling {
                            let summary = best_effort_summary(&outcome.tool_outcomes, FAILURE_LEAD);
                            reply.deliver(&summary, ctx);
                            closing = Some(summary);
                            outcome.error = Some(e.to_string());
                            break 'steps Termination::FailureCeiling;
                        }
                        ctx.narrate(format!("Step {step} failed ({e}), continuing...\n"));
                        messages.push(Message::user(format!(
                            "[The previous step failed with: {e}. Continue with the original task.]"
                        )));
                        continue;
                    }
                };

                if let Some(usage) = &result.usage {
                    outcome.usage.accumulate(usage);
                }
                self.publish_turn(step, &request.model, &result);
                reply.push_step(&result, ctx);

                if result.tool_calls.is_empty() {
                    debug!(step, "Model answered without tool calls");
                    closing = Some(result.text);
                    break 'steps Termination::Completed;
                }

                let calls = fresh_calls(result.tool_calls, &answered);
                if calls.is_empty() {
                    ctx.narrate("Every requested tool call was already answered.\n");
                    continue;
                }

                messages.push(Message::assistant_with_tool_calls(result.text, calls.clone()));
                let executed = self.execute_calls(&calls, &self.invoker, ctx).await;
                for answer in answer_calls(&calls, &executed) {
                    if let Some(id) = &answer.tool_call_id {
                        answered.insert(id.clone());
                        outcome.processed_ids.push(id.clone());
                    }
                    messages.push(answer);
                }
                outcome.tool_outcomes.extend(executed);
            }

            warn!(budget = ctx.step_budget, "Step budget exhausted");
            if outcome.tool_outcomes.iter().any(|o| o.success) || reply.is_blank() {
                let summary = best_effort_summary(&outcome.tool_outcomes, BUDGET_LEAD);
                reply.deliver(&summary, ctx);
                closing = Some(summary);
            }
            Termination::BudgetExhausted
        };

        outcome.termination = termination;
        outcome.text = reply.into_inner();
        if let Some(closing) = closing.filter(|c| !c.is_empty()) {
            messages.push(Message::assistant(closing));
        }
        outcome.transcript = messages;
        self.publish_finished(&request.model, &outcome);
        outcome
    }

    /// Standard mode: one turn, one pass of tools without retry, then one
    /// single-shot follow-up without tools.
    pub async fn run_single_pass(
        &self,
        request: LoopRequest,
        ctx: &mut AgentExecutionContext,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let with_tools = !request.tools.is_empty();
        ctx.step_budget = if with_tools { 2 } else { 1 };
        ctx.current_step = 1;
        ctx.tools_available = request.tools.iter().map(|t| t.name.clone()).collect();

        let mut messages = request.messages.clone();
        let mut reply = ReplyText::default();
        let mut outcome = LoopOutcome {
            steps_consumed: 1,
            ..Default::default()
        };

        let first = self
            .turns
            .execute(request.provider_request(&messages, with_tools), ctx.sink(), cancel)
            .await;
        let result = match first {
            Ok(result) => result,
            Err(e) => return self.fail_single_pass(&request.model, outcome, reply, e, messages),
        };
        if let Some(usage) = &result.usage {
            outcome.usage.accumulate(usage);
        }
        self.publish_turn(1, &request.model, &result);
        reply.push_step(&result, ctx);

        if result.tool_calls.is_empty() {
            outcome.text = reply.into_inner();
            messages.push(Message::assistant(result.text));
            outcome.transcript = messages;
            self.publish_finished(&request.model, &outcome);
            return outcome;
        }

        let calls = fresh_calls(result.tool_calls, &HashSet::new());
        messages.push(Message::assistant_with_tool_calls(result.text, calls.clone()));
        let once = self.invoker.clone().with_retry(RetryPolicy::single());
        let executed = self.execute_calls(&calls, &once, ctx).await;
        for answer in answer_calls(&calls, &executed) {
            if let Some(id) = &answer.tool_call_id {
                outcome.processed_ids.push(id.clone());
            }
            messages.push(answer);
        }
        outcome.tool_outcomes = executed;

        ctx.current_step = 2;
        outcome.steps_consumed = 2;
        let follow_up = self
            .turns
            .execute_single(request.provider_request(&messages, false), cancel)
            .await;
        match follow_up {
            Ok(result) => {
                if let Some(usage) = &result.usage {
                    outcome.usage.accumulate(usage);
                }
                self.publish_turn(2, &request.model, &result);
                reply.push_step(&result, ctx);
                outcome.text = reply.into_inner();
                messages.push(Message::assistant(result.text));
                outcome.transcript = messages;
                self.publish_finished(&request.model, &outcome);
                outcome
            }
            Err(e) => self.fail_single_pass(&request.model, outcome, reply, e, messages),
        }
    }

    fn fail_single_pass(
        &self,
        model: &str,
        mut outcome: LoopOutcome,
        mut reply: ReplyText,
        error: TurnError,
        transcript: Vec<Message>,
    ) -> LoopOutcome {
        match error {
            TurnError::Aborted { partial_text } => {
                reply.push_streamed(&partial_text);
                outcome.text = reply.into_inner();
                outcome.aborted = true;
                outcome.termination = Termination::Aborted;
            }
            TurnError::Provider(e) => {
                warn!(error = %e, "Standard-mode turn failed");
                outcome.error = Some(e.to_string());
                outcome.termination = Termination::Failed;
            }
        }
        outcome.transcript = transcript;
        self.publish_finished(model, &outcome);
        outcome
    }

    async fn execute_calls(
        &self,
        calls: &[MessageToolCall],
        invoker: &ToolInvoker,
        ctx: &mut AgentExecutionContext,
    ) -> Vec<ToolOutcome> {
        let mut executed = Vec::with_capacity(calls.len());
        for call in calls {
            ctx.narrate(format!("\nExecuting {}...\n", call.name));
            let outcome = invoker.invoke(call, ctx).await;
            if outcome.success {
                ctx.narrate(format!("{} completed\n", call.name));
            } else {
                ctx.narrate(format!(
                    "{} failed: {}\n",
                    call.name,
                    outcome.error.as_deref().unwrap_or("unknown error")
                ));
            }
            executed.push(outcome);
        }
        executed
    }

    fn publish_turn(&self, step: u32, model: &str, result: &StepResult) {
        self.events.publish(DomainEvent::TurnCompleted {
            step,
            model: model.to_string(),
            streamed: result.delivery == Delivery::Streamed,
            tool_calls: result.tool_calls.len(),
            timestamp: Utc::now(),
        });
    }

    fn publish_finished(&self, model: &str, outcome: &LoopOutcome) {
        info!(
            model = %model,
            steps = outcome.steps_consumed,
            tools = outcome.tool_outcomes.len(),
            termination = ?outcome.termination,
            "Agent loop finished"
        );
        self.events.publish(DomainEvent::AgentFinished {
            model: model.to_string(),
            steps_consumed: outcome.steps_consumed,
            tokens_used: outcome.usage.total_tokens,
            aborted: outcome.aborted,
            timestamp: Utc::now(),
        });
    }
}

/// Model text of one run, exactly as it reached the progress callback.
#[derive(Debug, Default)]
struct ReplyText(String);

impl ReplyText {
    /// Text the turn executor already streamed to the callback.
    fn push_streamed(&mut self, text: &str) {
        self.0.push_str(text);
    }

    /// Text the callback has not seen yet. Whole-turn texts are kept apart
    /// as paragraphs.
    fn deliver(&mut self, text: &str, ctx: &AgentExecutionContext) {
        if text.is_empty() {
            return;
        }
        let separated = self.0.is_empty()
            || self.0.ends_with(char::is_whitespace)
            || text.starts_with(char::is_whitespace);
        let piece = if separated { text.to_string() } else { format!("\n\n{text}") };
        ctx.stream_text(&piece);
        self.0.push_str(&piece);
    }

    fn push_step(&mut self, result: &StepResult, ctx: &AgentExecutionContext) {
        match result.delivery {
            Delivery::Streamed => self.push_streamed(&result.text),
            Delivery::Single | Delivery::StreamFallback => self.deliver(&result.text, ctx),
        }
    }

    fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    fn into_inner(self) -> String {
        self.0
    }
}

/// Calls not yet answered, each id at most once.
fn fresh_calls(calls: Vec<MessageToolCall>, answered: &HashSet<String>) -> Vec<MessageToolCall> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .filter(|call| {
            if answered.contains(&call.id) || !seen.insert(call.id.clone()) {
                warn!(call_id = %call.id, tool = %call.name, "Skipping already answered tool call");
                return false;
            }
            true
        })
        .collect()
}

/// One tool message per call, matched by id, in call order.
fn answer_calls(calls: &[MessageToolCall], executed: &[ToolOutcome]) -> Vec<Message> {
    calls
        .iter()
        .map(|call| {
            executed
                .iter()
                .find(|o| o.call_id == call.id)
                .map(|o| o.message.clone())
                .unwrap_or_else(|| {
                    Message::tool_result(
                        &call.id,
                        format!("Tool execution failed: No result returned for {}", call.name),
                    )
                    .with_name(&call.name)
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use crate::context::ProgressCallback;
    use toolpilot_core::error::{ProviderError, ToolError};
    use toolpilot_core::message::Role;
    use toolpilot_core::provider::{BackendProfile, StreamChunk};
    use toolpilot_core::tool::{Tool, ToolRegistry, ToolResult};
    use toolpilot_tools::{SubprocessEvaluator, ToolCatalog, builtin_registry};

    fn setup(
        script: Vec<Scripted>,
        registry: ToolRegistry,
        policy: AgentPolicy,
    ) -> (AgentLoop, LoopRequest, Arc<ScriptedProvider>) {
        setup_with(ScriptedProvider::new(script), registry, policy)
    }

    fn setup_with(
        provider: ScriptedProvider,
        registry: ToolRegistry,
        policy: AgentPolicy,
    ) -> (AgentLoop, LoopRequest, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let catalog = Arc::new(ToolCatalog::new(registry));
        let tools = catalog.definitions();
        let invoker = ToolInvoker::new(catalog, Arc::new(SubprocessEvaluator::default())).with_retry(
            RetryPolicy {
                max_attempts: policy.max_retries.max(1),
                delay: Duration::from_millis(1),
            },
        );
        let agent = AgentLoop::new(
            TurnExecutor::new(provider.clone(), true),
            invoker,
            policy,
            Arc::new(EventBus::default()),
        );
        let request = LoopRequest {
            model: "mock-model".into(),
            messages: vec![Message::system("You are helpful."), Message::user("hi")],
            tools,
            temperature: 0.7,
            max_tokens: None,
            top_p: None,
        };
        (agent, request, provider)
    }

    fn collecting_callback() -> (Option<ProgressCallback>, Arc<std::sync::Mutex<String>>) {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        let callback: ProgressCallback = Arc::new(move |s: &str| sink.lock().unwrap().push_str(s));
        (Some(callback), seen)
    }

    /// Cancels the run from inside tool execution.
    struct CancellingTool(CancellationToken);

    #[async_trait::async_trait]
    impl Tool for CancellingTool {
        fn name(&self) -> &str {
            "slow_lookup"
        }

        fn description(&self) -> &str {
            "Looks something up slowly"
        }

        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            self.0.cancel();
            Ok(ToolResult::ok("found it"))
        }
    }

    fn tool_messages_for(transcript: &[Message], id: &str) -> usize {
        transcript
            .iter()
            .filter(|m| m.role == Role::Tool && m.tool_call_id.as_deref() == Some(id))
            .count()
    }

    #[tokio::test]
    async fn no_tools_means_a_single_step() {
        let (agent, mut request, provider) = setup(
            vec![Scripted::Reply(make_text_response("4. Why did the crab never share? It was shellfish."))],
            ToolRegistry::new(),
            AgentPolicy::default(),
        );
        request.messages = vec![Message::user("What's 2+2, then tell a joke")];
        let mut ctx = AgentExecutionContext::new("What's 2+2, then tell a joke");

        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(ctx.step_budget, 1);
        assert_eq!(outcome.steps_consumed, 1);
        assert_eq!(outcome.termination, Termination::Completed);
        assert!(outcome.tool_outcomes.is_empty());
        assert!(outcome.text.starts_with("4."));
        assert_eq!(provider.call_count(), 1);
        assert!(provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn one_tool_then_answer_takes_two_steps() {
        let (agent, request, provider) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![make_tool_call("get_weather", json!({"city": "Paris"}))],
                    "",
                )),
                Scripted::Reply(make_text_response("It is mild in Paris.")),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("Weather in Paris?");

        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.steps_consumed, 2);
        assert_eq!(outcome.text, "It is mild in Paris.");
        assert_eq!(ctx.attempts.len(), 1);
        assert!(ctx.attempts[0].success);
        assert_eq!(outcome.processed_ids, vec!["call_get_weather".to_string()]);
        assert_eq!(outcome.usage.total_tokens, 30);

        let second = &provider.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.tool_call_id.as_deref(), Some("call_get_weather"));
        assert!(second.messages[second.messages.len() - 2].has_tool_calls());
    }

    #[tokio::test]
    async fn always_failing_tool_is_attempted_max_retries_times() {
        let (flaky, calls) = FlakyTool::new();
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(flaky));
        let (agent, request, _) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(vec![make_tool_call("flaky", json!({}))], "")),
                Scripted::Reply(make_text_response("The service is down.")),
            ],
            registry,
            AgentPolicy { max_retries: 3, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");

        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(ctx.attempts.len(), 3);
        assert_eq!(tool_messages_for(&outcome.transcript, "call_flaky"), 1);
        assert_eq!(outcome.text, "The service is down.");
    }

    #[tokio::test]
    async fn every_call_in_a_turn_gets_exactly_one_answer() {
        let (agent, request, provider) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![
                        make_tool_call("get_weather", json!({"city": "Oslo"})),
                        make_tool_call("nonexistent", json!({})),
                        make_tool_call("current_time", json!({})),
                    ],
                    "Let me check.",
                )),
                Scripted::Reply(make_text_response("Done.")),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("q");
        agent.run(request, &mut ctx, &CancellationToken::new()).await;

        let sent = &provider.requests()[1].messages;
        let answers: Vec<_> = sent
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(answers, vec!["call_get_weather", "call_nonexistent", "call_current_time"]);
    }

    #[tokio::test]
    async fn repeated_call_ids_are_answered_once() {
        let (agent, request, provider) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![make_tool_call("get_weather", json!({"city": "Paris"}))],
                    "",
                )),
                Scripted::Reply(make_tool_call_response(
                    vec![make_tool_call("get_weather", json!({"city": "Paris"}))],
                    "",
                )),
                Scripted::Reply(make_text_response("Paris is mild.")),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.steps_consumed, 3);
        assert_eq!(ctx.attempts.len(), 1);
        assert_eq!(tool_messages_for(&provider.requests()[2].messages, "call_get_weather"), 1);
        assert_eq!(outcome.text, "Paris is mild.");
    }

    #[tokio::test]
    async fn abort_mid_stream_returns_partial_text() {
        let (agent, request, _) = setup(
            vec![Scripted::Hang(vec![StreamChunk::text("The answer "), StreamChunk::text("is")])],
            ToolRegistry::new(),
            AgentPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut ctx = AgentExecutionContext::new("q").with_callback(Some(Arc::new(move |s: &str| {
            if s == "is" {
                trigger.cancel();
            }
        })));

        let outcome = agent.run(request, &mut ctx, &cancel).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.termination, Termination::Aborted);
        assert_eq!(outcome.text, "The answer is");
    }

    #[tokio::test]
    async fn abort_in_a_later_step_keeps_earlier_text() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Stream(vec![
                    Ok(StreamChunk::text("Checking the weather. ")),
                    Ok(call_delta(0, Some("c1"), Some("get_weather"), "{\"city\": \"Lima\"}")),
                ]),
                Scripted::Hang(vec![StreamChunk::text("Lima is ")]),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut ctx = AgentExecutionContext::new("q").with_callback(Some(Arc::new(move |s: &str| {
            if s == "Lima is " {
                trigger.cancel();
            }
        })));

        let outcome = agent.run(request, &mut ctx, &cancel).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.steps_consumed, 2);
        assert_eq!(outcome.text, "Checking the weather. Lima is ");
    }

    #[tokio::test]
    async fn abort_while_tools_run_keeps_streamed_text() {
        let cancel = CancellationToken::new();
        let registry = ToolRegistry::new().with(CancellingTool(cancel.clone()));
        let (agent, request, provider) = setup(
            vec![Scripted::Stream(vec![
                Ok(StreamChunk::text("Looking it up. ")),
                Ok(call_delta(0, Some("c1"), Some("slow_lookup"), "{}")),
            ])],
            registry,
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("q");

        let outcome = agent.run(request, &mut ctx, &cancel).await;

        assert!(outcome.aborted);
        assert_eq!(outcome.termination, Termination::Aborted);
        assert_eq!(outcome.text, "Looking it up. ");
        assert_eq!(outcome.tool_outcomes.len(), 1);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn single_shot_turns_reach_the_callback() {
        let provider = ScriptedProvider::new(vec![
            Scripted::Reply(make_tool_call_response(
                vec![make_tool_call("get_weather", json!({"city": "Paris"}))],
                "Let me check.",
            )),
            Scripted::Reply(make_text_response("It is mild in Paris.")),
        ])
        .with_profile(BackendProfile::new("openai", "https://api.openai.com/v1"));
        let (agent, request, provider) = setup_with(provider, builtin_registry(), AgentPolicy::default());
        let (callback, seen) = collecting_callback();
        let mut ctx = AgentExecutionContext::new("q").with_callback(callback);

        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert!(provider.requests().iter().all(|r| !r.stream));
        assert_eq!(outcome.text, "Let me check.\n\nIt is mild in Paris.");
        let seen = seen.lock().unwrap().clone();
        let thought = seen.find("Let me check.").unwrap();
        let executing = seen.find("Executing get_weather").unwrap();
        assert!(thought < executing);
        assert!(seen.ends_with("\n\nIt is mild in Paris."));
    }

    #[tokio::test]
    async fn failures_up_to_the_ceiling_are_survived() {
        let (agent, request, provider) = setup(
            vec![
                Scripted::Fail(ProviderError::Network("reset".into())),
                Scripted::Reply(make_text_response("Recovered.")),
            ],
            ToolRegistry::new(),
            AgentPolicy { max_tool_calls: 3, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.termination, Termination::Completed);
        assert_eq!(outcome.text, "Recovered.");
        let retried = &provider.requests()[1].messages;
        assert!(retried.last().unwrap().content.contains("previous step failed"));
    }

    #[tokio::test]
    async fn failure_ceiling_ends_with_best_effort_summary() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![make_tool_call("get_weather", json!({"city": "Rome"}))],
                    "",
                )),
                Scripted::Fail(ProviderError::Network("down".into())),
                Scripted::Fail(ProviderError::Network("down".into())),
            ],
            builtin_registry(),
            AgentPolicy { max_retries: 2, ..Default::default() },
        );
        let (callback, seen) = collecting_callback();
        let mut ctx = AgentExecutionContext::new("q").with_callback(callback);
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert!(seen.lock().unwrap().ends_with(&outcome.text));
        assert_eq!(outcome.termination, Termination::FailureCeiling);
        assert_eq!(outcome.steps_consumed, 3);
        assert!(outcome.text.starts_with(FAILURE_LEAD));
        assert!(outcome.text.contains("**get_weather**: Rome"));
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn duplicate_id_rejection_summarizes_and_stops() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![make_tool_call("current_time", json!({}))],
                    "",
                )),
                Scripted::Fail(ProviderError::DuplicateToolCallId("call_current_time".into())),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.termination, Termination::DuplicateToolCallId);
        assert!(outcome.text.starts_with(DUPLICATE_LEAD));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn budget_exhaustion_is_a_defined_end() {
        let call = || {
            Scripted::Reply(make_tool_call_response(
                vec![MessageToolCall::new(
                    uuid::Uuid::new_v4().to_string(),
                    "current_time",
                    "{}",
                )],
                "",
            ))
        };
        let (agent, request, provider) = setup(
            vec![call(), call()],
            builtin_registry(),
            AgentPolicy { max_tool_calls: 2, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.termination, Termination::BudgetExhausted);
        assert_eq!(outcome.steps_consumed, 2);
        assert_eq!(provider.call_count(), 2);
        assert!(outcome.text.starts_with(BUDGET_LEAD));
        assert_eq!(outcome.transcript.last().unwrap().content, outcome.text);
    }

    #[tokio::test]
    async fn tools_reserve_a_follow_up_step() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(vec![make_tool_call("current_time", json!({}))], "")),
                Scripted::Reply(make_text_response("It is noon.")),
            ],
            builtin_registry(),
            AgentPolicy { max_tool_calls: 0, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;
        assert_eq!(ctx.step_budget, 2);
        assert_eq!(outcome.text, "It is noon.");
    }

    #[tokio::test]
    async fn streamed_fragments_drive_tool_execution() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Stream(vec![
                    Ok(StreamChunk::text("Checking. ")),
                    Ok(call_delta(0, Some("c1"), Some("get_weather"), "{\"city\":")),
                    Ok(call_delta(0, None, None, " \"Lima\"}")),
                ]),
                Scripted::Stream(vec![Ok(StreamChunk::text("Lima is fine."))]),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(outcome.tool_outcomes.len(), 1);
        assert!(outcome.tool_outcomes[0].output.starts_with("Lima"));
        assert_eq!(outcome.text, "Checking. Lima is fine.");
        assert_eq!(outcome.transcript.last().unwrap().content, "Lima is fine.");
    }

    #[tokio::test]
    async fn narration_is_emitted_in_order() {
        let (agent, request, _) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(vec![make_tool_call("current_time", json!({}))], "")),
                Scripted::Reply(make_text_response("ok")),
            ],
            builtin_registry(),
            AgentPolicy::default(),
        );
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        let mut ctx = AgentExecutionContext::new("q")
            .with_callback(Some(Arc::new(move |s: &str| sink.lock().unwrap().push_str(s))));
        agent.run(request, &mut ctx, &CancellationToken::new()).await;

        let text = seen.lock().unwrap().clone();
        let executing = text.find("Executing current_time").unwrap();
        let step = text.find("Step 2/").unwrap();
        let answer = text.rfind("ok").unwrap();
        assert!(executing < step && step < answer);
    }

    #[tokio::test]
    async fn run_publishes_turn_and_finish_events() {
        let (agent, request, _) = setup(
            vec![Scripted::Reply(make_text_response("hi"))],
            ToolRegistry::new(),
            AgentPolicy::default(),
        );
        let mut rx = agent.events.subscribe();
        let mut ctx = AgentExecutionContext::new("q");
        agent.run(request, &mut ctx, &CancellationToken::new()).await;

        assert!(matches!(rx.recv().await.unwrap().as_ref(), DomainEvent::TurnCompleted { step: 1, .. }));
        match rx.recv().await.unwrap().as_ref() {
            DomainEvent::AgentFinished { steps_consumed, tokens_used, aborted, .. } => {
                assert_eq!(*steps_consumed, 1);
                assert_eq!(*tokens_used, 15);
                assert!(!aborted);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_pass_runs_tools_once_then_follows_up_without_tools() {
        let (flaky, calls) = FlakyTool::new();
        let mut registry = builtin_registry();
        registry.register(Box::new(flaky));
        let (agent, request, provider) = setup(
            vec![
                Scripted::Reply(make_tool_call_response(
                    vec![
                        make_tool_call("flaky", json!({})),
                        make_tool_call("get_weather", json!({"city": "Paris"})),
                    ],
                    "",
                )),
                Scripted::Reply(make_text_response("Partly sunny.")),
            ],
            registry,
            AgentPolicy { enabled: false, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run_single_pass(request, &mut ctx, &CancellationToken::new()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.steps_consumed, 2);
        assert_eq!(outcome.text, "Partly sunny.");
        let follow_up = &provider.requests()[1];
        assert!(follow_up.tools.is_empty());
        assert!(!follow_up.stream);
        assert_eq!(follow_up.messages.iter().filter(|m| m.role == Role::Tool).count(), 2);
    }

    #[tokio::test]
    async fn single_pass_failure_is_reported_not_raised() {
        let (agent, request, _) = setup(
            vec![Scripted::Fail(ProviderError::AuthenticationFailed("bad key".into()))],
            ToolRegistry::new(),
            AgentPolicy { enabled: false, ..Default::default() },
        );
        let mut ctx = AgentExecutionContext::new("q");
        let outcome = agent.run_single_pass(request, &mut ctx, &CancellationToken::new()).await;
        assert_eq!(outcome.termination, Termination::Failed);
        assert!(outcome.error.unwrap().contains("bad key"));
    }
}
