//! Agent orchestrator: the event dispatch loop for one turn.
//!
//! ```text
//!   MessageReceived ──► handler(current state) ──► transition + follow-ups
//!          ▲                                              │
//!          │           outbox (local, drained first)  ◄───┤
//!          │                                              │
//!          └─────── mpsc channel ◄── workers (stream, approval, tool)
//! ```
//!
//! State is only ever mutated here, one event at a time. Workers run in
//! parallel but report back exclusively through the channel.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::approval::ApprovalPolicy;
use super::context::{AgentContext, MessageQueue, TurnState};
use super::events::AgentEvent;
use super::handlers::{HandlerSet, TurnContext};
use super::loop_events::ChatEvent;
use super::services::AgentServices;
use super::state::{AgentExecutionState, AgentStateMachine};
use crate::ai::types::ModelMessage;
use crate::config::InferConfig;
use crate::error::AgentError;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Bounded wait for in-flight workers when a turn ends
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-session settings for every turn the orchestrator runs
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub provider: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub max_turns: usize,
    pub stream_timeout: Duration,
    /// Interactive chat; `false` for unattended batch runs
    pub is_chat_mode: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            system_prompt: None,
            max_turns: 50,
            stream_timeout: Duration::from_secs(120),
            is_chat_mode: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(config: &InferConfig) -> Self {
        Self {
            provider: config.agent.provider.clone(),
            model: config.agent.model.clone(),
            system_prompt: config.agent.system_prompt.clone(),
            max_turns: config.agent.max_turns,
            stream_timeout: config.agent.stream_timeout(),
            is_chat_mode: true,
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub request_id: String,
    pub final_state: AgentExecutionState,
    /// Streaming rounds the turn used
    pub turns: usize,
    /// Cause when the turn ended in `Error`
    pub error: Option<String>,
}

impl TurnOutcome {
    pub fn is_success(&self) -> bool {
        self.final_state == AgentExecutionState::Completed
    }
}

/// Runs turns against one conversation
pub struct AgentOrchestrator {
    services: AgentServices,
    config: OrchestratorConfig,
    policy: RwLock<Arc<dyn ApprovalPolicy>>,
    queue: Arc<MessageQueue>,
    handlers: HandlerSet,
}

impl AgentOrchestrator {
    pub fn new(
        services: AgentServices,
        config: OrchestratorConfig,
        policy: Arc<dyn ApprovalPolicy>,
    ) -> Self {
        Self {
            services,
            config,
            policy: RwLock::new(policy),
            queue: Arc::new(MessageQueue::new()),
            handlers: HandlerSet::new(),
        }
    }

    /// Messages pushed here while a turn runs are folded in at the next
    /// safe point.
    pub fn queue(&self) -> Arc<MessageQueue> {
        self.queue.clone()
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.read().name()
    }

    pub fn set_policy(&self, policy: Arc<dyn ApprovalPolicy>) {
        *self.policy.write() = policy;
    }

    /// Drive one turn to a terminal state.
    ///
    /// Stream failures and the like end in `Error` and are reported in the
    /// outcome; only broken machine contracts come back as `Err`.
    pub async fn run_turn(
        &self,
        message: Option<ModelMessage>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut agent = AgentContext::new(
            request_id.clone(),
            self.services.conversation.clone(),
            self.policy.read().clone(),
            self.config.max_turns,
        )
        .with_queue(self.queue.clone())
        .with_cancel(cancel);
        if !self.config.is_chat_mode {
            agent = agent.batch_mode();
        }

        let state = TurnState {
            provider: self.config.provider.clone(),
            model: self.config.model.clone(),
            system_prompt: self.config.system_prompt.clone(),
            tool_definitions: self.services.tools.definitions().await,
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let machine = AgentStateMachine::new().with_publisher(self.services.events.clone());
        let mut turn = TurnContext::new(machine, agent, state, self.services.clone(), tx)
            .with_stream_timeout(self.config.stream_timeout);

        tracing::info!(request_id = %request_id, model = %self.config.model, "Turn started");
        turn.enqueue(AgentEvent::MessageReceived { message });

        let result = self.dispatch(&mut turn, &mut rx).await;

        // Auto-accept chosen during the turn sticks for the session
        *self.policy.write() = turn.agent.policy.clone();
        result
    }

    async fn dispatch(
        &self,
        turn: &mut TurnContext,
        rx: &mut mpsc::Receiver<AgentEvent>,
    ) -> Result<TurnOutcome, AgentError> {
        let cancel = turn.agent.cancel.clone();

        loop {
            let state = turn.current();
            if state.is_terminal() {
                break;
            }
            if cancel.is_cancelled() {
                self.cancel_turn(turn, rx).await;
                break;
            }

            let event = match turn.next_local() {
                Some(event) => event,
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => continue,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => return Err(AgentError::ChannelClosed),
                    },
                },
            };

            tracing::trace!(state = %state, event = event.name(), "Dispatching event");
            if let Err(error) = self.handlers.for_state(state).handle(event, turn) {
                self.fail_turn(turn, &error);
                turn.shutdown_workers(DRAIN_TIMEOUT).await;
                if error.is_contract_violation() {
                    return Err(error);
                }
                return Ok(outcome(turn, Some(error.to_string())));
            }
        }

        turn.shutdown_workers(DRAIN_TIMEOUT).await;
        Ok(outcome(turn, None))
    }

    fn fail_turn(&self, turn: &mut TurnContext, error: &AgentError) {
        tracing::error!(request_id = %turn.agent.request_id, state = %turn.current(), error = %error, "Turn failed");
        if let Err(e) = turn.transition(AgentExecutionState::Error) {
            tracing::warn!(error = %e, "Could not enter Error state");
        }
        turn.publish(ChatEvent::Error {
            request_id: turn.agent.request_id.clone(),
            error: error.to_string(),
        });
    }

    /// Enter `Cancelled`, let in-flight work finish within the drain
    /// window, and keep any tool result that arrives in time. Calls left
    /// without a result are closed as cancelled.
    async fn cancel_turn(&self, turn: &mut TurnContext, rx: &mut mpsc::Receiver<AgentEvent>) {
        let request_id = turn.agent.request_id.clone();
        tracing::info!(request_id = %request_id, state = %turn.current(), "Cancelling turn");
        if let Err(e) = turn.transition(AgentExecutionState::Cancelled) {
            tracing::warn!(error = %e, "Could not enter Cancelled state");
        }

        if !turn.shutdown_workers(DRAIN_TIMEOUT).await {
            tracing::warn!(request_id = %request_id, "Workers still running after drain timeout");
        }

        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::ToolsCompleted { results } = event {
                for entry in results {
                    if let Err(e) = turn.record_tool_result(entry) {
                        tracing::warn!(error = %e, "Failed to record drained tool result");
                    }
                }
            }
        }

        match turn.settle_outstanding_tools() {
            Ok(0) => {}
            Ok(settled) => {
                tracing::info!(request_id = %request_id, settled, "Closed unfinished tool calls")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to close unfinished tool calls"),
        }

        turn.publish(ChatEvent::Cancelled { request_id });
    }
}

fn outcome(turn: &TurnContext, error: Option<String>) -> TurnOutcome {
    TurnOutcome {
        request_id: turn.agent.request_id.clone(),
        final_state: turn.current(),
        turns: turn.agent.turns,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::approval::{AgentMode, AutoAcceptPolicy, StandardPolicy};
    use crate::agent::loop_events::ApprovalAction;
    use crate::ai::types::Content;
    use crate::agent::test_support::{
        CollectingPublisher, FakeChat, FakeTools, Script, ScriptedApprovals,
    };
    use crate::conversation::{
        ConversationEntry, ConversationSink, InMemoryConversation, ToolCallStatus,
    };
    use crate::error::ApprovalError;
    use AgentExecutionState as S;

    struct Harness {
        chat: Arc<FakeChat>,
        tools: Arc<FakeTools>,
        approvals: Arc<ScriptedApprovals>,
        events: Arc<CollectingPublisher>,
        conversation: Arc<InMemoryConversation>,
        config: OrchestratorConfig,
    }

    impl Harness {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                chat: Arc::new(FakeChat::new(scripts)),
                tools: Arc::new(FakeTools::new()),
                approvals: Arc::new(ScriptedApprovals::new(vec![])),
                events: Arc::new(CollectingPublisher::new()),
                conversation: Arc::new(InMemoryConversation::new()),
                config: OrchestratorConfig {
                    stream_timeout: Duration::from_secs(5),
                    max_turns: 10,
                    ..Default::default()
                },
            }
        }

        fn tools(mut self, tools: FakeTools) -> Self {
            self.tools = Arc::new(tools);
            self
        }

        fn approvals(mut self, approvals: ScriptedApprovals) -> Self {
            self.approvals = Arc::new(approvals);
            self
        }

        fn orchestrator(&self, policy: Arc<dyn ApprovalPolicy>) -> AgentOrchestrator {
            let services = AgentServices::builder()
                .chat(self.chat.clone())
                .tools(self.tools.clone())
                .approvals(self.approvals.clone())
                .conversation(self.conversation.clone())
                .events(self.events.clone())
                .build()
                .unwrap();
            AgentOrchestrator::new(services, self.config.clone(), policy)
        }

        fn tool_results(&self) -> Vec<(String, ToolCallStatus)> {
            self.conversation
                .messages()
                .into_iter()
                .filter_map(|e: ConversationEntry| e.tool_execution)
                .map(|r| (r.tool_call_id, r.status))
                .collect()
        }

        /// Tool calls sent in `request` that have no matching result.
        fn unanswered_calls(&self, request: usize) -> Vec<String> {
            let messages = self.chat.requests()[request].messages.clone();
            let answered: Vec<String> = messages
                .iter()
                .flat_map(|m| m.content.iter())
                .filter_map(|c| match c {
                    Content::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                })
                .collect();
            messages
                .iter()
                .flat_map(|m| m.tool_calls())
                .map(|call| call.id)
                .filter(|id| !answered.contains(id))
                .collect()
        }

        fn states(&self) -> Vec<S> {
            let transitions = self.events.transitions();
            let mut states = vec![S::Idle];
            states.extend(transitions.into_iter().map(|(_, to)| to));
            states
        }
    }

    fn standard() -> Arc<dyn ApprovalPolicy> {
        Arc::new(StandardPolicy::default())
    }

    async fn run(
        orchestrator: &AgentOrchestrator,
        text: &str,
    ) -> Result<TurnOutcome, AgentError> {
        orchestrator
            .run_turn(Some(ModelMessage::user(text)), CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_turn_without_tools_completes() {
        let h = Harness::new(vec![Script::text("hi there")]);
        let outcome = run(&h.orchestrator(standard()), "hello").await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.turns, 1);
        assert_eq!(
            h.states(),
            vec![S::Idle, S::Streaming, S::Completing, S::Completed]
        );
        let messages = h.conversation.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message.text_content(), "hi there");
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::Completed { turns: 1, .. })));
    }

    #[tokio::test]
    async fn test_rejected_tool_is_denied_and_turn_completes() {
        let h = Harness::new(vec![Script::tools(&[("c1", "write")]), Script::text("ok")])
            .approvals(ScriptedApprovals::new(vec![Ok(ApprovalAction::Reject)]));
        let outcome = run(&h.orchestrator(standard()), "write it").await.unwrap();

        assert_eq!(outcome.final_state, S::Completed);
        assert!(h.tools.started().is_empty());
        let results = h.tool_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "c1");
        assert!(matches!(results[0].1, ToolCallStatus::Denied));
        assert_eq!(
            h.states(),
            vec![
                S::Idle,
                S::Streaming,
                S::ToolsPending,
                S::WaitingApproval,
                S::ExecutingTools,
                S::Streaming,
                S::Completing,
                S::Completed,
            ]
        );
        assert!(h.events.events().iter().any(
            |e| matches!(e, ChatEvent::ToolDenied { id, reason } if id == "c1" && reason == "rejected by user")
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_tools_finishes_only_in_flight_call() {
        let h = Harness::new(vec![Script::tools(&[
            ("c1", "read"),
            ("c2", "read"),
            ("c3", "read"),
            ("c4", "read"),
        ])])
        .tools(FakeTools::new().with_delay("c1", Duration::from_millis(200)));
        let orchestrator = h.orchestrator(Arc::new(AutoAcceptPolicy));
        let cancel = CancellationToken::new();

        let canceller = async {
            while h.tools.started().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.run_turn(Some(ModelMessage::user("go")), cancel.clone()),
            canceller
        );
        let outcome = outcome.unwrap();

        assert_eq!(outcome.final_state, S::Cancelled);
        assert_eq!(h.tools.started(), vec!["c1".to_string()]);
        assert_eq!(
            h.tool_results(),
            vec![
                ("c1".to_string(), ToolCallStatus::Completed),
                ("c2".to_string(), ToolCallStatus::Cancelled),
                ("c3".to_string(), ToolCallStatus::Cancelled),
                ("c4".to_string(), ToolCallStatus::Cancelled),
            ]
        );
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_turn_limit_forces_completion() {
        let mut h = Harness::new(vec![
            Script::tools(&[("c1", "read")]),
            Script::tools(&[("c2", "read")]),
            Script::tools(&[("c3", "read")]),
        ]);
        h.config.max_turns = 2;
        let outcome = run(&h.orchestrator(standard()), "loop").await.unwrap();

        assert_eq!(outcome.final_state, S::Completed);
        assert_eq!(outcome.turns, 2);
        assert_eq!(h.chat.requests().len(), 2);
        assert_eq!(h.tools.started(), vec!["c1".to_string(), "c2".to_string()]);

        let messages = h.conversation.messages();
        let last = messages.last().unwrap();
        assert!(last
            .message
            .text_content()
            .contains("maximum of 2 turns"));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::TurnLimitReached { max_turns: 2 })));
    }

    #[tokio::test]
    async fn test_results_keep_emission_order_under_latency() {
        let h = Harness::new(vec![
            Script::tools(&[("c1", "read"), ("c2", "read"), ("c3", "read")]),
            Script::text("done"),
        ])
        .tools(
            FakeTools::new()
                .with_delay("c1", Duration::from_millis(80))
                .with_delay("c3", Duration::from_millis(30)),
        );
        let outcome = run(&h.orchestrator(standard()), "read all").await.unwrap();

        assert!(outcome.is_success());
        let ids: Vec<String> = h.tool_results().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert_eq!(h.tools.started(), ids);

        // Second request carries every result in order
        let second = &h.chat.requests()[1];
        assert_eq!(second.messages.len(), 5);
    }

    #[tokio::test]
    async fn test_failed_tool_is_reported_and_turn_continues() {
        let h = Harness::new(vec![Script::tools(&[("c1", "read")]), Script::text("sorry")])
            .tools(FakeTools::new().failing("c1"));
        let outcome = run(&h.orchestrator(standard()), "read").await.unwrap();

        assert!(outcome.is_success());
        assert!(matches!(h.tool_results()[0].1, ToolCallStatus::Failed));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::ToolFailed { id, .. } if id == "c1")));
    }

    #[tokio::test]
    async fn test_auto_accept_all_persists_for_session() {
        let h = Harness::new(vec![
            Script::tools(&[("c1", "write"), ("c2", "write")]),
            Script::text("done"),
        ])
        .approvals(ScriptedApprovals::new(vec![Ok(ApprovalAction::AutoAcceptAll)]));
        let orchestrator = h.orchestrator(standard());
        let outcome = run(&orchestrator, "write both").await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(h.approvals.requests().len(), 1);
        assert_eq!(h.tools.started(), vec!["c1".to_string(), "c2".to_string()]);
        assert_eq!(orchestrator.policy_name(), "auto_accept");
        assert!(h.events.events().iter().any(|e| matches!(
            e,
            ChatEvent::ModeChanged {
                mode: AgentMode::AutoAccept
            }
        )));
    }

    #[tokio::test]
    async fn test_approval_failure_denies_call() {
        let h = Harness::new(vec![Script::tools(&[("c1", "write")]), Script::text("ok")])
            .approvals(ScriptedApprovals::new(vec![Err(ApprovalError::Timeout(5))]));
        let outcome = run(&h.orchestrator(standard()), "write").await.unwrap();

        assert!(outcome.is_success());
        assert!(h.tools.started().is_empty());
        assert!(matches!(h.tool_results()[0].1, ToolCallStatus::Denied));
    }

    #[tokio::test]
    async fn test_stream_failure_ends_in_error() {
        let h = Harness::new(vec![Script::error("overloaded")]);
        let outcome = run(&h.orchestrator(standard()), "hi").await.unwrap();

        assert_eq!(outcome.final_state, S::Error);
        assert!(outcome.error.unwrap().contains("overloaded"));
        let events = h.events.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, ChatEvent::StreamError { error, .. } if error == "overloaded")));
        assert!(events.iter().any(|e| matches!(e, ChatEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_stream_that_cannot_start_ends_in_error() {
        let h = Harness::new(vec![Script::fail_start()]);
        let outcome = run(&h.orchestrator(standard()), "hi").await.unwrap();
        assert_eq!(outcome.final_state, S::Error);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn test_queued_messages_drain_at_turn_start() {
        let h = Harness::new(vec![Script::text("both seen")]);
        let orchestrator = h.orchestrator(standard());
        orchestrator.queue().push(ModelMessage::user("typed early"));

        let outcome = run(&orchestrator, "first").await.unwrap();
        assert!(outcome.is_success());

        let request = &h.chat.requests()[0];
        let texts: Vec<String> = request.messages.iter().map(|m| m.text_content()).collect();
        assert_eq!(texts, vec!["first", "typed early"]);
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, ChatEvent::QueueDrained { count: 1 })));
    }

    #[tokio::test]
    async fn test_queued_messages_drain_after_tool_batch() {
        let h = Harness::new(vec![Script::tools(&[("c1", "read")]), Script::text("noted")])
            .tools(FakeTools::new().with_delay("c1", Duration::from_millis(100)));
        let orchestrator = h.orchestrator(standard());
        let queue = orchestrator.queue();

        let typer = async {
            while h.tools.started().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            queue.push(ModelMessage::user("also this"));
        };
        let (outcome, ()) = tokio::join!(run(&orchestrator, "start"), typer);
        assert!(outcome.unwrap().is_success());

        let second = &h.chat.requests()[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.text_content(), "also this");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_batch_mode_never_asks() {
        let mut h = Harness::new(vec![Script::tools(&[("c1", "write")]), Script::text("done")]);
        h.config.is_chat_mode = false;
        let outcome = run(&h.orchestrator(standard()), "write").await.unwrap();

        assert!(outcome.is_success());
        assert!(h.approvals.requests().is_empty());
        assert_eq!(h.tools.started(), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_approval() {
        let h = Harness::new(vec![Script::tools(&[("c1", "write")])])
            .approvals(ScriptedApprovals::hanging());
        let orchestrator = h.orchestrator(standard());
        let cancel = CancellationToken::new();

        let canceller = async {
            while h.approvals.requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.run_turn(Some(ModelMessage::user("write")), cancel.clone()),
            canceller
        );

        let outcome = outcome.unwrap();
        assert_eq!(outcome.final_state, S::Cancelled);
        assert!(h.tools.started().is_empty());
        assert_eq!(
            h.events.transitions().last(),
            Some(&(S::WaitingApproval, S::Cancelled))
        );
        assert_eq!(
            h.tool_results(),
            vec![("c1".to_string(), ToolCallStatus::Cancelled)]
        );
    }

    #[tokio::test]
    async fn test_next_turn_after_cancelled_batch_answers_every_call() {
        let h = Harness::new(vec![
            Script::tools(&[("c1", "read"), ("c2", "read"), ("c3", "read")]),
            Script::text("picking up"),
        ])
        .tools(FakeTools::new().with_delay("c1", Duration::from_millis(100)));
        let orchestrator = h.orchestrator(Arc::new(AutoAcceptPolicy));
        let cancel = CancellationToken::new();

        let canceller = async {
            while h.tools.started().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.run_turn(Some(ModelMessage::user("go")), cancel.clone()),
            canceller
        );
        assert_eq!(outcome.unwrap().final_state, S::Cancelled);

        let outcome = run(&orchestrator, "carry on").await.unwrap();
        assert!(outcome.is_success());
        assert!(h.unanswered_calls(1).is_empty());
        assert_eq!(h.chat.requests()[1].messages.len(), 6);
    }

    #[tokio::test]
    async fn test_next_turn_after_cancelled_approval_answers_every_call() {
        let h = Harness::new(vec![
            Script::tools(&[("c1", "write"), ("c2", "read")]),
            Script::text("ok"),
        ])
        .approvals(ScriptedApprovals::hanging());
        let orchestrator = h.orchestrator(standard());
        let cancel = CancellationToken::new();

        let canceller = async {
            while h.approvals.requests().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.run_turn(Some(ModelMessage::user("write")), cancel.clone()),
            canceller
        );
        assert_eq!(outcome.unwrap().final_state, S::Cancelled);

        run(&orchestrator, "never mind").await.unwrap();
        assert!(h.unanswered_calls(1).is_empty());
        assert_eq!(
            h.tool_results(),
            vec![
                ("c1".to_string(), ToolCallStatus::Cancelled),
                ("c2".to_string(), ToolCallStatus::Cancelled),
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_call_keeps_denial_when_batch_is_cancelled() {
        let h = Harness::new(vec![Script::tools(&[("c1", "write"), ("c2", "read")])])
            .approvals(ScriptedApprovals::new(vec![Ok(ApprovalAction::Reject)]))
            .tools(FakeTools::new().with_delay("c2", Duration::from_millis(100)));
        let orchestrator = h.orchestrator(standard());
        let cancel = CancellationToken::new();

        let canceller = async {
            while h.tools.started().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.run_turn(Some(ModelMessage::user("go")), cancel.clone()),
            canceller
        );
        assert_eq!(outcome.unwrap().final_state, S::Cancelled);
        assert_eq!(
            h.tool_results(),
            vec![
                ("c1".to_string(), ToolCallStatus::Denied),
                ("c2".to_string(), ToolCallStatus::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_turns_share_one_conversation() {
        let h = Harness::new(vec![Script::text("one"), Script::text("two")]);
        let orchestrator = h.orchestrator(standard());
        run(&orchestrator, "first").await.unwrap();
        run(&orchestrator, "second").await.unwrap();

        assert_eq!(h.conversation.messages().len(), 4);
        assert_eq!(h.chat.requests()[1].messages.len(), 3);
    }
}
