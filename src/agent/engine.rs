//! Agent iteration engine
//!
//! Drives one conversation turn as a bounded loop: build the prompt, call
//! the model, parse the reply, run the code in a sandbox and decide from the
//! stop type whether to continue. Model failures retry with group fallback;
//! sandbox outcomes never abort a turn, they feed the next iteration.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::agent::history::{HistoryBounds, InboundMessage, SessionHistory};
use crate::agent::parser::{parse_model_reply, parse_multimodal_output};
use crate::agent::prompt::{continuation_note, initial_messages};
use crate::config::CoreConfig;
use crate::metrics::{AGENT_ITERATIONS, AGENT_TURNS};
use crate::model::{ChatMessage, MessageSegment, ModelClient, ModelError, ModelResponse};
use crate::records::ExecutionRequest;
use crate::sandbox::{ExecStopType, SandboxError, SandboxOrchestrator, SandboxRun};

/// Result of one completed conversation turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// Iterations consumed, including the final one
    pub iterations: usize,
    /// Stop type of the last sandbox run, if any ran
    pub last_stop: Option<ExecStopType>,
    /// Whether the turn ended by its own decision rather than budget exhaustion
    pub completed: bool,
}

#[derive(Debug)]
pub enum AgentError {
    /// All model attempts exhausted, including the fallback group
    Model(ModelError),
    /// Container engine or workspace failure
    Sandbox(SandboxError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Model(e) => write!(f, "model attempts exhausted: {}", e),
            AgentError::Sandbox(e) => write!(f, "sandbox failure: {}", e),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<SandboxError> for AgentError {
    fn from(e: SandboxError) -> Self {
        AgentError::Sandbox(e)
    }
}

/// LLM-and-sandbox loop for one session at a time.
pub struct AgentEngine {
    model: Arc<dyn ModelClient>,
    orchestrator: Arc<SandboxOrchestrator>,
    history: Arc<SessionHistory>,
    config: CoreConfig,
}

impl AgentEngine {
    pub fn new(
        model: Arc<dyn ModelClient>,
        orchestrator: Arc<SandboxOrchestrator>,
        history: Arc<SessionHistory>,
        config: CoreConfig,
    ) -> Self {
        Self {
            model,
            orchestrator,
            history,
            config,
        }
    }

    pub fn history(&self) -> &Arc<SessionHistory> {
        &self.history
    }

    fn bounds(&self) -> HistoryBounds {
        let max_age = chrono::Duration::from_std(self.config.history_max_age)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        HistoryBounds {
            max_messages: self.config.history_max_messages,
            max_age,
            char_budget: self.config.history_char_budget,
            max_images: self.config.history_max_images,
        }
    }

    /// Run one conversation turn triggered by `trigger`.
    pub async fn run_turn(
        &self,
        session_key: &str,
        trigger: &InboundMessage,
    ) -> Result<TurnOutcome, AgentError> {
        let trace_id = Uuid::now_v7().to_string();
        let span = info_span!(
            "agent_turn",
            trace_id = %trace_id,
            session = %session_key,
            otel.name = "agent_turn"
        );
        self.run_turn_inner(session_key, trigger, &trace_id)
            .instrument(span)
            .await
    }

    async fn run_turn_inner(
        &self,
        session_key: &str,
        trigger: &InboundMessage,
        trace_id: &str,
    ) -> Result<TurnOutcome, AgentError> {
        info!(sender = %trigger.sender, "starting turn");

        let trust_token = Uuid::new_v4().to_string();
        let vision = self.config.primary_group.supports_vision;
        let rendered = self.history.render(session_key, &self.bounds(), vision);
        let mut messages = initial_messages(rendered, &trust_token);
        let mut history_mark = Utc::now();
        let mut last_stop: Option<ExecStopType> = None;

        for iteration in 1..=self.config.max_iterations {
            let last_iteration = iteration == self.config.max_iterations;

            let response = self.call_model(&messages, iteration).await?;
            messages.push(ChatMessage::assistant(response.text.clone()));

            let parsed = parse_model_reply(&response.text);

            let (run, stop_type) = if parsed.code.contains(&trust_token) {
                warn!(iteration, "trust token found in generated code");
                (None, ExecStopType::Security)
            } else {
                let request = ExecutionRequest {
                    session_key: session_key.to_string(),
                    trace_id: trace_id.to_string(),
                    code: parsed.code.clone(),
                    thoughts: parsed
                        .reasoning
                        .clone()
                        .or_else(|| response.reasoning.clone())
                        .unwrap_or_default(),
                    trigger_user: Some(trigger.sender.clone()),
                    trigger_message_id: Some(trigger.id.clone()),
                    generation_time_ms: response.latency_ms,
                    prompt_tokens: response.prompt_tokens,
                    completion_tokens: response.completion_tokens,
                };
                let run = self.orchestrator.execute(&request).await?;
                let stop = run.stop_type;
                (Some(run), stop)
            };
            last_stop = Some(stop_type);

            info!(iteration, stop_type = stop_type.as_str(), "sandbox iteration finished");

            if stop_type == ExecStopType::Normal {
                AGENT_TURNS.with_label_values(&["completed"]).inc();
                AGENT_ITERATIONS.observe(iteration as f64);
                return Ok(TurnOutcome {
                    iterations: iteration,
                    last_stop,
                    completed: true,
                });
            }

            if last_iteration {
                break;
            }

            // the note primes the next iteration, which may be the final one
            let next_is_final = iteration + 1 == self.config.max_iterations;
            messages.push(self.continuation_message(stop_type, run.as_ref(), next_is_final));

            // pick up anything users said while the sandbox ran
            let delta =
                self.history
                    .render_since(session_key, &self.bounds(), vision, history_mark);
            history_mark = Utc::now();
            if !delta.text().is_empty() || delta.has_images() {
                messages.push(delta);
            }
        }

        AGENT_TURNS.with_label_values(&["budget_exhausted"]).inc();
        AGENT_ITERATIONS.observe(self.config.max_iterations as f64);
        info!(iterations = self.config.max_iterations, "iteration budget exhausted");
        Ok(TurnOutcome {
            iterations: self.config.max_iterations,
            last_stop,
            completed: false,
        })
    }

    fn continuation_message(
        &self,
        stop_type: ExecStopType,
        run: Option<&SandboxRun>,
        last_iteration: bool,
    ) -> ChatMessage {
        let output = run.map(|r| r.final_output.as_str()).unwrap_or("");
        if stop_type == ExecStopType::MultimodalAgent {
            let note = continuation_note(stop_type, "", last_iteration);
            let mut segments = vec![MessageSegment::text(note)];
            segments.extend(parse_multimodal_output(output));
            return ChatMessage::user_parts(segments);
        }
        ChatMessage::user(continuation_note(stop_type, output, last_iteration))
    }

    /// Call the model with retry; the final attempt switches to the fallback
    /// group. Exhaustion is fatal for the turn and logs the full prompt.
    async fn call_model(
        &self,
        messages: &[ChatMessage],
        iteration: usize,
    ) -> Result<ModelResponse, AgentError> {
        let attempts = self.config.model_retries + 1;
        let mut last_err: Option<ModelError> = None;

        let fallback_allowed = attempts > 1 && self.config.primary_group.allow_fallback;

        let mut attempt = 0;
        while attempt < attempts {
            attempt += 1;
            let group = if attempt == attempts && fallback_allowed {
                &self.config.fallback_group
            } else {
                &self.config.primary_group
            };
            let span = info_span!(
                "model_call",
                iteration,
                attempt,
                group = %group.name,
                otel.name = "model_call"
            );
            let started = Instant::now();
            match self.model.send(group, messages).instrument(span).await {
                Ok(response) => {
                    info!(
                        iteration,
                        attempt,
                        group = %group.name,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "model call ok"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        iteration,
                        attempt,
                        group = %group.name,
                        retryable = e.retryable(),
                        error = %e,
                        "model call failed"
                    );
                    let retryable = e.retryable();
                    last_err = Some(e);
                    if !retryable {
                        if !fallback_allowed {
                            break;
                        }
                        // no point re-asking the same group; go straight to
                        // the fallback attempt
                        if attempt < attempts - 1 {
                            attempt = attempts - 1;
                        }
                    }
                }
            }
        }

        let err = match last_err {
            Some(e) => e,
            None => ModelError::EmptyResponse,
        };
        AGENT_TURNS.with_label_values(&["model_failed"]).inc();
        let prompt_dump = serde_json::to_string(messages).unwrap_or_default();
        error!(error = %err, prompt = %prompt_dump, "model attempts exhausted");
        Err(AgentError::Model(err))
    }
}
