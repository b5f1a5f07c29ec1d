//! Per-state event handlers
//!
//! Each [`AgentExecutionState`] has exactly one handler. Handlers run on the
//! dispatch loop and must not block: anything slow (the model stream, an
//! approval prompt, a tool) is spawned as a worker whose result comes back
//! through the event channel.

mod completing;
mod executing_tools;
mod idle;
mod streaming;
mod terminal;
mod tools_pending;
mod waiting_approval;

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::context::{AgentContext, ToolDecision, TurnState};
use super::events::AgentEvent;
use super::loop_events::ChatEvent;
use super::services::AgentServices;
use super::state::{AgentExecutionState, AgentStateMachine};
use crate::conversation::{ConversationEntry, ToolExecutionResult};
use crate::error::AgentError;

pub use completing::CompletingHandler;
pub use executing_tools::ExecutingToolsHandler;
pub use idle::IdleHandler;
pub use streaming::StreamingHandler;
pub use terminal::TerminalHandler;
pub use tools_pending::ToolsPendingHandler;
pub use waiting_approval::WaitingApprovalHandler;

/// Handles the events that arrive while the machine is in one state
pub trait StateHandler: Send + Sync {
    fn name(&self) -> AgentExecutionState;

    fn handle(&self, event: AgentEvent, turn: &mut TurnContext) -> Result<(), AgentError>;
}

/// Everything a handler can touch for one in-flight turn
pub struct TurnContext {
    pub machine: AgentStateMachine,
    pub agent: AgentContext,
    pub state: TurnState,
    pub services: AgentServices,
    pub stream_timeout: Duration,
    outbox: VecDeque<AgentEvent>,
    tx: mpsc::Sender<AgentEvent>,
    workers: TaskTracker,
    /// Child of the request token; also fired when the turn ends
    worker_cancel: CancellationToken,
}

impl TurnContext {
    pub fn new(
        machine: AgentStateMachine,
        agent: AgentContext,
        state: TurnState,
        services: AgentServices,
        tx: mpsc::Sender<AgentEvent>,
    ) -> Self {
        let worker_cancel = agent.cancel.child_token();
        Self {
            machine,
            agent,
            state,
            services,
            stream_timeout: Duration::from_secs(120),
            outbox: VecDeque::new(),
            tx,
            workers: TaskTracker::new(),
            worker_cancel,
        }
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn current(&self) -> AgentExecutionState {
        self.machine.current()
    }

    pub fn transition(&self, target: AgentExecutionState) -> Result<(), AgentError> {
        self.machine.transition(&self.agent, target)?;
        Ok(())
    }

    /// Queue a follow-up; processed before anything from the channel.
    pub fn enqueue(&mut self, event: AgentEvent) {
        self.outbox.push_back(event);
    }

    pub(crate) fn next_local(&mut self) -> Option<AgentEvent> {
        self.outbox.pop_front()
    }

    pub fn publish(&self, event: ChatEvent) {
        self.services.events.publish(event);
    }

    pub fn worker_cancel(&self) -> CancellationToken {
        self.worker_cancel.clone()
    }

    pub(crate) fn workers(&self) -> &TaskTracker {
        &self.workers
    }

    /// Run `work` off the loop and feed its event back in.
    pub fn spawn_worker<F>(&self, work: F)
    where
        F: Future<Output = Option<AgentEvent>> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.workers.spawn(async move {
            if let Some(event) = work.await {
                // Loop already gone: the turn ended and nobody wants this
                let _ = tx.send(event).await;
            }
        });
    }

    /// Append a tool result entry and stamp its final status on the call.
    pub fn record_tool_result(&mut self, entry: ConversationEntry) -> Result<(), AgentError> {
        if let Some(exec) = &entry.tool_execution {
            let index = self
                .agent
                .tool_calls
                .iter()
                .position(|call| call.id == exec.tool_call_id);
            if let Some(index) = index {
                self.state.set_status(index, exec.status);
            }
        }
        self.agent.record(entry.clone())?;
        self.state.results.push(entry);
        Ok(())
    }

    /// Give every call of the batch that has no result yet a closing
    /// entry, in emission order. The next request must not carry a tool
    /// call without its result.
    pub(crate) fn settle_outstanding_tools(&mut self) -> Result<usize, AgentError> {
        let calls = self.agent.tool_calls.clone();
        let mut settled = 0;
        for (index, call) in calls.iter().enumerate() {
            if self.state.has_result(&call.id) {
                continue;
            }
            let result = match self.state.decisions.get(index) {
                Some(ToolDecision::Denied { reason }) => {
                    ToolExecutionResult::denied(call, reason.clone())
                }
                _ => ToolExecutionResult::cancelled(call),
            };
            self.record_tool_result(ConversationEntry::tool_result(result))?;
            settled += 1;
        }
        Ok(settled)
    }

    /// Stop workers that honour cancellation and wait up to `grace` for
    /// the rest.
    pub(crate) async fn shutdown_workers(&self, grace: Duration) -> bool {
        self.worker_cancel.cancel();
        self.workers.close();
        tokio::time::timeout(grace, self.workers.wait()).await.is_ok()
    }
}

/// The fixed handler set, one per state
pub struct HandlerSet {
    idle: IdleHandler,
    streaming: StreamingHandler,
    tools_pending: ToolsPendingHandler,
    waiting_approval: WaitingApprovalHandler,
    executing_tools: ExecutingToolsHandler,
    completing: CompletingHandler,
    completed: TerminalHandler,
    error: TerminalHandler,
    cancelled: TerminalHandler,
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerSet {
    pub fn new() -> Self {
        Self {
            idle: IdleHandler,
            streaming: StreamingHandler,
            tools_pending: ToolsPendingHandler,
            waiting_approval: WaitingApprovalHandler,
            executing_tools: ExecutingToolsHandler,
            completing: CompletingHandler,
            completed: TerminalHandler::new(AgentExecutionState::Completed),
            error: TerminalHandler::new(AgentExecutionState::Error),
            cancelled: TerminalHandler::new(AgentExecutionState::Cancelled),
        }
    }

    pub fn for_state(&self, state: AgentExecutionState) -> &dyn StateHandler {
        match state {
            AgentExecutionState::Idle => &self.idle,
            AgentExecutionState::Streaming => &self.streaming,
            AgentExecutionState::ToolsPending => &self.tools_pending,
            AgentExecutionState::WaitingApproval => &self.waiting_approval,
            AgentExecutionState::ExecutingTools => &self.executing_tools,
            AgentExecutionState::Completing => &self.completing,
            AgentExecutionState::Completed => &self.completed,
            AgentExecutionState::Error => &self.error,
            AgentExecutionState::Cancelled => &self.cancelled,
        }
    }
}

/// Log and drop an event the current state has no use for.
fn unexpected(state: AgentExecutionState, event: &AgentEvent) {
    tracing::warn!(state = %state, event = event.name(), "Ignoring unexpected event");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::agent::loop_events::ApprovalAction;
    use crate::agent::test_support::{context, tool_call, FakeChat, FakeTools, ScriptedApprovals};
    use crate::ai::types::AiToolCall;
    use crate::conversation::{InMemoryConversation, ToolCallStatus};
    use AgentExecutionState as S;
    use ToolCallStatus::*;

    /// A turn that just received `calls` from the model.
    fn turn_with_calls(
        calls: Vec<AiToolCall>,
        approvals: ScriptedApprovals,
    ) -> (TurnContext, mpsc::Receiver<AgentEvent>) {
        let services = AgentServices::builder()
            .chat(Arc::new(FakeChat::new(vec![])))
            .tools(Arc::new(FakeTools::new()))
            .approvals(Arc::new(approvals))
            .conversation(Arc::new(InMemoryConversation::new()))
            .build()
            .unwrap();
        let (tx, rx) = mpsc::channel(16);
        let mut turn = TurnContext::new(
            AgentStateMachine::new(),
            context(),
            TurnState::default(),
            services,
            tx,
        );
        turn.transition(S::Streaming).unwrap();
        turn.state.reset_batch(calls.len());
        turn.agent.tool_calls = calls;
        turn.transition(S::ToolsPending).unwrap();
        turn.enqueue(AgentEvent::ProcessNextTool { index: 0 });
        (turn, rx)
    }

    async fn step(
        handlers: &HandlerSet,
        turn: &mut TurnContext,
        rx: &mut mpsc::Receiver<AgentEvent>,
    ) {
        let event = match turn.next_local() {
            Some(event) => event,
            None => rx.recv().await.unwrap(),
        };
        handlers
            .for_state(turn.current())
            .handle(event, turn)
            .unwrap();
    }

    #[tokio::test]
    async fn test_tool_status_lifecycle() {
        let handlers = HandlerSet::new();
        let (mut turn, mut rx) = turn_with_calls(
            vec![
                tool_call("c1", "write"),
                tool_call("c2", "write"),
                tool_call("c3", "read"),
            ],
            ScriptedApprovals::new(vec![
                Ok(ApprovalAction::Approve),
                Ok(ApprovalAction::Reject),
            ]),
        );
        assert_eq!(turn.state.statuses, vec![Pending, Pending, Pending]);

        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.current(), S::WaitingApproval);
        assert_eq!(
            turn.state.statuses,
            vec![WaitingApproval, WaitingApproval, Pending]
        );

        step(&handlers, &mut turn, &mut rx).await;
        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.current(), S::ExecutingTools);
        assert_eq!(turn.state.statuses, vec![WaitingApproval, Denied, Pending]);

        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.state.statuses, vec![Executing, Denied, Pending]);
        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.state.statuses, vec![Completed, Denied, Pending]);

        // Denied call is answered without running, then the last one runs
        step(&handlers, &mut turn, &mut rx).await;
        step(&handlers, &mut turn, &mut rx).await;
        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.state.statuses, vec![Completed, Denied, Executing]);
        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.state.statuses, vec![Completed, Denied, Completed]);
        assert_eq!(turn.state.results.len(), 3);
    }

    #[tokio::test]
    async fn test_settle_cancels_calls_without_results() {
        let handlers = HandlerSet::new();
        let (mut turn, mut rx) = turn_with_calls(
            vec![tool_call("c1", "read"), tool_call("c2", "read")],
            ScriptedApprovals::new(vec![]),
        );

        step(&handlers, &mut turn, &mut rx).await;
        step(&handlers, &mut turn, &mut rx).await;
        assert_eq!(turn.state.statuses, vec![Executing, Pending]);

        assert_eq!(turn.settle_outstanding_tools().unwrap(), 2);
        assert_eq!(turn.state.statuses, vec![Cancelled, Cancelled]);
        assert_eq!(turn.agent.messages.len(), 2);
        assert_eq!(turn.settle_outstanding_tools().unwrap(), 0);

        // A result arriving after settling does not reopen the call
        let late = rx.recv().await.unwrap();
        let AgentEvent::ToolsCompleted { results } = late else {
            panic!("expected tool result");
        };
        for entry in results {
            turn.record_tool_result(entry).unwrap();
        }
        assert_eq!(turn.state.status(0), Some(Cancelled));
    }

    #[test]
    fn test_every_state_has_its_own_handler() {
        let handlers = HandlerSet::new();
        for state in AgentExecutionState::ALL {
            assert_eq!(handlers.for_state(state).name(), state);
        }
    }
}
