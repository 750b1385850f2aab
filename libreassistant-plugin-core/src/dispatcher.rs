//! # Dispatcher Module
//!
//! Drives one user turn through the language model and the running plugins.
//!
//! The loop is bounded and cooperative: build the prompt from the running
//! plugin set, call the model, parse the structured reply, and either finish
//! with a user-facing message or invoke the requested plugin and feed its
//! result back for the next iteration. At most `max_steps` iterations run
//! per turn.
//!
//! Guard rails, in the order they apply:
//! - a request for a plugin that is not running becomes a system note in the
//!   history and consumes a step;
//! - a request identical to the immediately preceding invocation (same
//!   plugin, same canonical input) terminates the turn as a duplicate -
//!   repeats separated by other invocations are legitimate;
//! - a plugin failure is fed back to the model as error context exactly
//!   once per invocation; model transport failures are never retried here;
//! - cancellation aborts the in-flight outbound call, marks the in-flight
//!   record, and archives the session as cancelled.

use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::client::{PluginClient, INVOKE_OPERATION};
use crate::error::DispatchError;
use crate::fingerprint::fingerprint;
use crate::lm::{ChatMessage, LmClient};
use crate::protocol::{
    build_system_prompt, parse_reply, plugin_error_context, plugin_result_context,
    plugin_unavailable_note, AssistantReply,
};
use crate::supervisor::PluginDirectory;
use crate::tracker::{InvocationRecord, SessionOutcome, UsageTracker};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on model/plugin iterations per turn.
    pub max_steps: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { max_steps: 5 }
    }
}

/// One user turn to dispatch.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub request_id: String,
    pub message: String,
    /// Prior conversation, passed to the model unmodified.
    pub history: Vec<ChatMessage>,
    /// Optional per-turn model override.
    pub model: Option<String>,
    /// When false the turn runs without plugin access: the prompt
    /// advertises no plugins and invocation requests are refused.
    pub plugins_enabled: bool,
}

/// Successful turn result.
#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub markdown: bool,
    /// False when the model's final reply had to be surfaced through the
    /// protocol fallback instead of validating against the schema.
    pub schema_compliant: bool,
    pub invocations: Vec<InvocationRecord>,
}

pub struct Dispatcher {
    lm: Arc<LmClient>,
    directory: Arc<dyn PluginDirectory>,
    client: Arc<PluginClient>,
    tracker: Arc<UsageTracker>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        lm: Arc<LmClient>,
        directory: Arc<dyn PluginDirectory>,
        client: Arc<PluginClient>,
        tracker: Arc<UsageTracker>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            lm,
            directory,
            client,
            tracker,
            config,
        }
    }

    async fn finish(&self, request_id: &str, outcome: SessionOutcome) -> Vec<InvocationRecord> {
        self.tracker
            .finish_session(request_id, outcome)
            .await
            .map(|summary| summary.invocations.clone())
            .unwrap_or_default()
    }

    async fn cancelled(&self, request_id: &str) -> DispatchError {
        tracing::info!(request_id, "dispatch cancelled");
        DispatchError::Cancelled {
            invocations: self.finish(request_id, SessionOutcome::Cancelled).await,
        }
    }

    /// Dispatch one user turn.
    pub async fn dispatch(
        &self,
        turn: ChatTurn,
        cancel: CancellationToken,
    ) -> Result<TurnReply, DispatchError> {
        let request_id = turn.request_id.clone();
        self.tracker.start_session(&request_id);

        if self.config.max_steps == 0 {
            return Err(DispatchError::BudgetExceeded {
                max_steps: 0,
                invocations: self.finish(&request_id, SessionOutcome::BudgetExhausted).await,
            });
        }

        let mut history = turn.history.clone();
        history.push(ChatMessage::user(&turn.message));

        for step in 0..self.config.max_steps {
            if cancel.is_cancelled() {
                return Err(self.cancelled(&request_id).await);
            }

            let running = if turn.plugins_enabled {
                self.directory.running()
            } else {
                Vec::new()
            };
            let mut messages = Vec::with_capacity(history.len() + 1);
            messages.push(ChatMessage::system(build_system_prompt(&running)));
            messages.extend(history.iter().cloned());

            tracing::debug!(request_id = %request_id, step, plugins = running.len(), "dispatch step");

            let raw = tokio::select! {
                _ = cancel.cancelled() => return Err(self.cancelled(&request_id).await),
                result = self.lm.chat(&messages, turn.model.as_deref()) => match result {
                    Ok(raw) => raw,
                    Err(source) => {
                        tracing::error!(request_id = %request_id, error = %source, "language model call failed");
                        return Err(DispatchError::LmUnavailable {
                            source,
                            invocations: self.finish(&request_id, SessionOutcome::Failed).await,
                        });
                    }
                },
            };

            let parsed = parse_reply(&raw);
            match parsed.reply {
                AssistantReply::Message { text, markdown } => {
                    return Ok(TurnReply {
                        text,
                        markdown,
                        schema_compliant: parsed.schema_compliant,
                        invocations: self.finish(&request_id, SessionOutcome::Completed).await,
                    });
                }
                AssistantReply::Invoke {
                    plugin,
                    input,
                    reason,
                } => {
                    history.push(ChatMessage::assistant(raw));

                    if !turn.plugins_enabled || self.directory.find(&plugin).is_none() {
                        tracing::warn!(request_id = %request_id, plugin = %plugin, "model requested unavailable plugin");
                        history.push(ChatMessage::user(plugin_unavailable_note(&plugin)));
                        continue;
                    }

                    let input_value = Value::Object(input.clone());
                    let print = fingerprint(&plugin, &input_value);

                    if self
                        .tracker
                        .is_consecutive_duplicate(&request_id, &print)
                        .await
                    {
                        self.tracker
                            .record_duplicate_blocked(
                                &request_id,
                                &plugin,
                                input_value.clone(),
                                &reason,
                                print,
                            )
                            .await;
                        tracing::warn!(request_id = %request_id, plugin = %plugin, "consecutive duplicate invocation blocked");
                        return Err(DispatchError::DuplicatePluginCall {
                            plugin,
                            input: input_value,
                            reason,
                            invocations: self.finish(&request_id, SessionOutcome::Duplicate).await,
                        });
                    }

                    let index = self
                        .tracker
                        .record_invocation(&request_id, &plugin, input_value, &reason, print)
                        .await
                        .unwrap_or(0);

                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => {
                            self.tracker.mark_cancelled(&request_id, index).await;
                            return Err(self.cancelled(&request_id).await);
                        }
                        result = self.client.invoke(&plugin, INVOKE_OPERATION, &input) => result,
                    };

                    match outcome {
                        Ok(result) => {
                            self.tracker
                                .update_result(&request_id, index, Ok(&result))
                                .await;
                            history.push(ChatMessage::user(plugin_result_context(&plugin, &result)));
                        }
                        Err(error) => {
                            let message = error.to_string();
                            tracing::warn!(request_id = %request_id, plugin = %plugin, error = %message, "plugin invocation failed");
                            self.tracker
                                .update_result(&request_id, index, Err(&message))
                                .await;
                            history.push(ChatMessage::user(plugin_error_context(&plugin, &message)));
                        }
                    }
                }
            }
        }

        tracing::warn!(request_id = %request_id, max_steps = self.config.max_steps, "dispatch step budget exhausted");
        Err(DispatchError::BudgetExceeded {
            max_steps: self.config.max_steps,
            invocations: self
                .finish(&request_id, SessionOutcome::BudgetExhausted)
                .await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PluginClientConfig;
    use crate::lm::LmConfig;
    use crate::manifest::parse_manifest;
    use crate::supervisor::RunningPlugin;
    use crate::tracker::TrackerConfig;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StubDirectory {
        plugins: Vec<RunningPlugin>,
    }

    impl PluginDirectory for StubDirectory {
        fn running(&self) -> Vec<RunningPlugin> {
            self.plugins.clone()
        }
        fn find(&self, id: &str) -> Option<RunningPlugin> {
            self.plugins.iter().find(|p| p.descriptor.id == id).cloned()
        }
    }

    fn running_plugin(id: &str, port: u16) -> RunningPlugin {
        let source = format!(
            r#"
id = "{id}"
name = "{id}"
version = "0.1.0"
description = "test plugin"
author = "tests"
entrypoint = "true"
port = {port}
permissions = []
"#
        );
        RunningPlugin {
            descriptor: Arc::new(parse_manifest(&source, Path::new("/tmp/p")).unwrap()),
            port,
        }
    }

    fn lm_reply(content: &str) -> serde_json::Value {
        json!({"message": {"role": "assistant", "content": content}, "done": true})
    }

    struct Harness {
        dispatcher: Dispatcher,
        tracker: Arc<UsageTracker>,
        _lm_server: MockServer,
    }

    async fn harness(
        lm_server: MockServer,
        plugins: Vec<RunningPlugin>,
        max_steps: usize,
    ) -> Harness {
        let directory: Arc<dyn PluginDirectory> = Arc::new(StubDirectory { plugins });
        let tracker = Arc::new(UsageTracker::new(TrackerConfig::default()));
        let lm = Arc::new(LmClient::new(LmConfig {
            endpoint: lm_server.uri(),
            model: "llama3".to_string(),
            timeout: Duration::from_secs(5),
        }));
        let client = Arc::new(PluginClient::new(
            directory.clone(),
            PluginClientConfig::default(),
        ));
        let dispatcher = Dispatcher::new(
            lm,
            directory,
            client,
            tracker.clone(),
            DispatcherConfig { max_steps },
        );
        Harness {
            dispatcher,
            tracker,
            _lm_server: lm_server,
        }
    }

    fn turn(message: &str) -> ChatTurn {
        ChatTurn {
            request_id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            history: Vec::new(),
            model: None,
            plugins_enabled: true,
        }
    }

    #[tokio::test]
    async fn disabled_plugins_refuse_invocation() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"x"},"reason":"try"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"answered without tools"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![running_plugin("search", 59991)], 5).await;
        let mut request = turn("hi");
        request.plugins_enabled = false;
        let reply = harness
            .dispatcher
            .dispatch(request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "answered without tools");
        assert!(reply.invocations.is_empty());
    }

    #[tokio::test]
    async fn plain_answer_needs_no_plugins() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"hello"}}"#,
            )))
            .expect(1)
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![running_plugin("search", 59990)], 5).await;
        let reply = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "hello");
        assert!(reply.markdown);
        assert!(reply.schema_compliant);
        assert!(reply.invocations.is_empty());
    }

    #[tokio::test]
    async fn single_tool_flow_synthesises_result() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"hits": ["a", "b"]}
            })))
            .expect(1)
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"AI news"},"reason":"user asked"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"Top items: a, b"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("search", plugin_server.address().port())],
            5,
        )
        .await;
        let reply = harness
            .dispatcher
            .dispatch(turn("latest AI news"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "Top items: a, b");
        assert_eq!(reply.invocations.len(), 1);
        let record = &reply.invocations[0];
        assert_eq!(record.plugin_id, "search");
        assert_eq!(record.success, Some(true));
        assert_eq!(record.result, Some(json!({"hits": ["a", "b"]})));
    }

    #[tokio::test]
    async fn fenced_reply_parses_cleanly() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                "Sure:\n```json\n{\"action\":\"message\",\"content\":{\"text\":\"ok\"}}\n```",
            )))
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![], 5).await;
        let reply = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "ok");
        assert!(reply.schema_compliant);
    }

    #[tokio::test]
    async fn noncompliant_reply_falls_back_flagged() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(lm_reply("just plain prose, no JSON")),
            )
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![], 5).await;
        let reply = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "just plain prose, no JSON");
        assert!(!reply.schema_compliant);
    }

    #[tokio::test]
    async fn consecutive_duplicate_terminates_turn() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"hits": []}
            })))
            .expect(1)
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"x","n":1},"reason":"first"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        // Same canonical input, key order swapped.
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"n":1,"q":"x"},"reason":"again"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("search", plugin_server.address().port())],
            5,
        )
        .await;
        let err = harness
            .dispatcher
            .dispatch(turn("search for x"), CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            DispatchError::DuplicatePluginCall { plugin, invocations, .. } => {
                assert_eq!(plugin, "search");
                assert_eq!(invocations.len(), 2);
                assert_eq!(invocations[0].success, Some(true));
                assert!(!invocations[0].duplicate_blocked);
                assert!(invocations[1].duplicate_blocked);
            }
            other => panic!("expected DuplicatePluginCall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeat_with_different_input_is_allowed() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {}
            })))
            .expect(2)
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"x"},"reason":"first"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"y"},"reason":"second"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"done"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("search", plugin_server.address().port())],
            5,
        )
        .await;
        let reply = harness
            .dispatcher
            .dispatch(turn("two searches"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "done");
        assert_eq!(reply.invocations.len(), 2);
        assert!(reply.invocations.iter().all(|r| r.success == Some(true)));
    }

    #[tokio::test]
    async fn zero_step_budget_fails_without_calling_the_model() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply("unused")))
            .expect(0)
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![], 0).await;
        let err = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::BudgetExceeded { max_steps: 0, .. }
        ));
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_partial_session() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"step": 1}
            })))
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"x"},"reason":"go"}}"#,
            )))
            .expect(1)
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("search", plugin_server.address().port())],
            1,
        )
        .await;
        let err = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DispatchError::BudgetExceeded {
                max_steps,
                invocations,
            } => {
                assert_eq!(max_steps, 1);
                assert_eq!(invocations.len(), 1);
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unavailable_plugin_becomes_a_system_note() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"ghost","input":{},"reason":"try"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"cannot do that"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![], 5).await;
        let reply = harness
            .dispatcher
            .dispatch(turn("use ghost"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "cannot do that");
        assert!(reply.invocations.is_empty());
    }

    #[tokio::test]
    async fn plugin_failure_is_fed_back_once() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "index unavailable"
            })))
            .expect(1)
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"search","input":{"q":"x"},"reason":"go"}}"#,
            )))
            .up_to_n_times(1)
            .mount(&lm)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"message","content":{"text":"the search index is down"}}"#,
            )))
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("search", plugin_server.address().port())],
            5,
        )
        .await;
        let reply = harness
            .dispatcher
            .dispatch(turn("search x"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(reply.text, "the search index is down");
        assert_eq!(reply.invocations.len(), 1);
        assert_eq!(reply.invocations[0].success, Some(false));
        assert!(reply.invocations[0]
            .error
            .as_deref()
            .unwrap()
            .contains("index unavailable"));
    }

    #[tokio::test]
    async fn lm_failure_is_not_retried() {
        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({"error": "overloaded"})))
            .expect(1)
            .mount(&lm)
            .await;

        let harness = harness(lm, vec![], 5).await;
        let err = harness
            .dispatcher
            .dispatch(turn("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::LmUnavailable { .. }));
    }

    #[tokio::test]
    async fn cancellation_mid_invoke_archives_cancelled_session() {
        let plugin_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(10))
                    .set_body_json(json!({"success": true})),
            )
            .mount(&plugin_server)
            .await;

        let lm = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lm_reply(
                r#"{"action":"plugin_invoke","content":{"plugin":"slow","input":{},"reason":"long"}}"#,
            )))
            .expect(1)
            .mount(&lm)
            .await;

        let harness = harness(
            lm,
            vec![running_plugin("slow", plugin_server.address().port())],
            5,
        )
        .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let request = turn("slow call");
        let request_id = request.request_id.clone();
        let started = std::time::Instant::now();
        let err = harness.dispatcher.dispatch(request, cancel).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match &err {
            DispatchError::Cancelled { invocations } => {
                assert_eq!(invocations.len(), 1);
                assert!(invocations[0].cancelled);
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }

        let summary = harness.tracker.session_summary(&request_id).await.unwrap();
        assert_eq!(
            summary.outcome,
            Some(crate::tracker::SessionOutcome::Cancelled)
        );
    }
}
