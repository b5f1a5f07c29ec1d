//! Agent execution states and the guarded transition table
//!
//! The table is the single source of truth for which moves are legal.
//! Guards read the per-request [`AgentContext`] so that, for instance, a
//! stream that produced tool calls cannot skip straight to completion.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::context::AgentContext;
use super::loop_events::ChatEvent;
use super::services::EventPublisher;
use crate::error::TransitionError;

/// Where a turn currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentExecutionState {
    Idle,
    Streaming,
    ToolsPending,
    WaitingApproval,
    ExecutingTools,
    Completing,
    Completed,
    Error,
    Cancelled,
}

impl AgentExecutionState {
    pub const ALL: [AgentExecutionState; 9] = [
        AgentExecutionState::Idle,
        AgentExecutionState::Streaming,
        AgentExecutionState::ToolsPending,
        AgentExecutionState::WaitingApproval,
        AgentExecutionState::ExecutingTools,
        AgentExecutionState::Completing,
        AgentExecutionState::Completed,
        AgentExecutionState::Error,
        AgentExecutionState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentExecutionState::Completed
                | AgentExecutionState::Error
                | AgentExecutionState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentExecutionState::Idle => "Idle",
            AgentExecutionState::Streaming => "Streaming",
            AgentExecutionState::ToolsPending => "ToolsPending",
            AgentExecutionState::WaitingApproval => "WaitingApproval",
            AgentExecutionState::ExecutingTools => "ExecutingTools",
            AgentExecutionState::Completing => "Completing",
            AgentExecutionState::Completed => "Completed",
            AgentExecutionState::Error => "Error",
            AgentExecutionState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for AgentExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Guard = fn(&AgentContext) -> bool;

/// One edge of the transition table
#[derive(Clone, Copy)]
pub struct Transition {
    pub from: AgentExecutionState,
    pub to: AgentExecutionState,
    guard: Option<Guard>,
}

impl Transition {
    const fn open(from: AgentExecutionState, to: AgentExecutionState) -> Self {
        Self {
            from,
            to,
            guard: None,
        }
    }

    const fn guarded(from: AgentExecutionState, to: AgentExecutionState, guard: Guard) -> Self {
        Self {
            from,
            to,
            guard: Some(guard),
        }
    }

    pub fn is_guarded(&self) -> bool {
        self.guard.is_some()
    }

    fn allows(&self, ctx: &AgentContext) -> bool {
        self.guard.map_or(true, |guard| guard(ctx))
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)?;
        if self.guard.is_some() {
            f.write_str(" [guarded]")?;
        }
        Ok(())
    }
}

fn has_tool_calls(ctx: &AgentContext) -> bool {
    !ctx.tool_calls.is_empty()
}

fn has_no_tool_calls(ctx: &AgentContext) -> bool {
    ctx.tool_calls.is_empty()
}

fn needs_approval(ctx: &AgentContext) -> bool {
    ctx.tool_calls
        .iter()
        .any(|call| ctx.policy.should_require_approval(call, ctx.is_chat_mode))
}

fn no_approval_needed(ctx: &AgentContext) -> bool {
    !needs_approval(ctx)
}

fn turns_remaining(ctx: &AgentContext) -> bool {
    !ctx.max_turns_reached()
}

fn max_turns_reached(ctx: &AgentContext) -> bool {
    ctx.max_turns_reached()
}

use AgentExecutionState as S;

static TRANSITIONS: &[Transition] = &[
    Transition::open(S::Idle, S::Streaming),
    Transition::guarded(S::Streaming, S::ToolsPending, has_tool_calls),
    Transition::guarded(S::Streaming, S::Completing, has_no_tool_calls),
    Transition::guarded(S::ToolsPending, S::WaitingApproval, needs_approval),
    Transition::guarded(S::ToolsPending, S::ExecutingTools, no_approval_needed),
    Transition::open(S::WaitingApproval, S::ExecutingTools),
    Transition::open(S::WaitingApproval, S::Cancelled),
    Transition::guarded(S::ExecutingTools, S::Streaming, turns_remaining),
    Transition::guarded(S::ExecutingTools, S::Completing, max_turns_reached),
    Transition::open(S::Completing, S::Completed),
];

/// Every edge, including the implicit escape to Error/Cancelled from each
/// non-terminal state.
pub fn transition_table() -> Vec<Transition> {
    let mut table = TRANSITIONS.to_vec();
    for from in AgentExecutionState::ALL
        .into_iter()
        .filter(|s| !s.is_terminal())
    {
        for to in [S::Error, S::Cancelled] {
            if !table.iter().any(|t| t.from == from && t.to == to) {
                table.push(Transition::open(from, to));
            }
        }
    }
    table
}

fn find_edge(from: AgentExecutionState, to: AgentExecutionState) -> Option<Transition> {
    if let Some(edge) = TRANSITIONS.iter().find(|t| t.from == from && t.to == to) {
        return Some(*edge);
    }
    (!from.is_terminal() && matches!(to, S::Error | S::Cancelled)).then(|| Transition::open(from, to))
}

#[derive(Debug, Clone, Copy)]
struct Position {
    current: AgentExecutionState,
    previous: AgentExecutionState,
}

/// Thread-safe holder of the current and previous state
pub struct AgentStateMachine {
    position: RwLock<Position>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentStateMachine {
    pub fn new() -> Self {
        Self {
            position: RwLock::new(Position {
                current: S::Idle,
                previous: S::Idle,
            }),
            events: None,
        }
    }

    /// Publish a `StateTransition` event on every successful move.
    pub fn with_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn current(&self) -> AgentExecutionState {
        self.position.read().current
    }

    pub fn previous(&self) -> AgentExecutionState {
        self.position.read().previous
    }

    /// Move to `target` if the edge exists and its guard holds.
    ///
    /// On error the state is unchanged.
    pub fn transition(
        &self,
        ctx: &AgentContext,
        target: AgentExecutionState,
    ) -> Result<(), TransitionError> {
        let from = {
            let mut position = self.position.write();
            let from = position.current;
            let edge = find_edge(from, target).ok_or(TransitionError::Invalid { from, to: target })?;
            if !edge.allows(ctx) {
                return Err(TransitionError::GuardRejected { from, to: target });
            }
            position.previous = from;
            position.current = target;
            from
        };

        tracing::debug!(request_id = %ctx.request_id, from = %from, to = %target, "State transition");
        if let Some(events) = &self.events {
            events.publish(ChatEvent::StateTransition { from, to: target });
        }
        Ok(())
    }

    pub fn can_transition(&self, ctx: &AgentContext, target: AgentExecutionState) -> bool {
        let from = self.current();
        find_edge(from, target).is_some_and(|edge| edge.allows(ctx))
    }

    /// States reachable right now, in table order.
    pub fn valid_transitions(&self, ctx: &AgentContext) -> Vec<AgentExecutionState> {
        let from = self.current();
        transition_table()
            .into_iter()
            .filter(|t| t.from == from && t.allows(ctx))
            .map(|t| t.to)
            .collect()
    }

    /// Force `Idle`. Safe to call repeatedly.
    pub fn reset(&self) {
        let mut position = self.position.write();
        position.previous = position.current;
        position.current = S::Idle;
    }
}
