//! Agent execution core
//!
//! ## State machine
//! - `AgentStateMachine` - Guarded transitions between `AgentExecutionState`s
//! - `HandlerSet` - One `StateHandler` per state
//!
//! ## Orchestrator
//! - `AgentOrchestrator` - Event dispatch loop for one turn
//! - `ChatEvent` - Everything published to the front end
//!
//! ## Collaborators
//! - `AgentServices` - Chat client, tool executor, approvals, conversation, events
//! - `ApprovalPolicy` - Which tool calls need a human

pub mod approval;
pub mod context;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod loop_events;
pub mod orchestrator;
pub mod services;
pub mod state;
mod stream;

#[cfg(test)]
pub(crate) mod test_support;

pub use approval::{
    policy_for_mode, AgentMode, ApprovalPolicy, AutoAcceptPolicy, PlanOnlyPolicy, StandardPolicy,
};
pub use context::{AgentContext, MessageQueue, ToolDecision, TurnState};
pub use events::AgentEvent;
pub use executor::RegistryExecutor;
pub use handlers::{HandlerSet, StateHandler, TurnContext};
pub use loop_events::{ApprovalAction, ApprovalRequest, ApprovalResponder, ChatEvent};
pub use orchestrator::{AgentOrchestrator, OrchestratorConfig, TurnOutcome};
pub use services::{
    AgentServices, ApprovalService, ChannelPublisher, EventApprovalService, EventPublisher,
    NoopPublisher, ToolExecutor,
};
pub use state::{AgentExecutionState, AgentStateMachine};
