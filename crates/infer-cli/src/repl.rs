//! Interactive loop and unattended task runner

use std::io::Write;

use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use infer_core::agent::{
    policy_for_mode, AgentMode, ApprovalAction, ApprovalResponder, ChatEvent, TurnOutcome,
};
use infer_core::ai::types::ModelMessage;

use crate::render::{parse_approval, render, shell_line};
use crate::Session;

const HELP: &str = "\
/mode <standard|plan|auto_accept>  change approval mode
/shells                            list background shells
/kill <shell-id>                   stop a background shell
/exit                              quit
Ctrl-C cancels the running turn. Lines typed during a turn are queued.";

fn print_flush(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Forward stdin lines into a channel so they can be awaited next to events.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Print every event already waiting.
fn flush_events(session: &mut Session) {
    while let Ok(event) = session.events.try_recv() {
        if let Some(text) = render(&event) {
            print_flush(&text);
        }
    }
}

pub(crate) async fn run(session: &mut Session, mode: AgentMode) -> Result<()> {
    println!(
        "infer · {} · {} mode · /help for commands",
        session.config.agent.model, mode
    );
    let mut input = spawn_stdin_reader();

    loop {
        flush_events(session);
        print_flush("\n> ");
        let Some(line) = input.recv().await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('/') {
            if !slash_command(session, command).await {
                break;
            }
            continue;
        }

        let outcome = drive_turn(session, &mut input, ModelMessage::user(line)).await?;
        tracing::info!(
            request_id = %outcome.request_id,
            state = %outcome.final_state,
            turns = outcome.turns,
            "Turn finished"
        );
    }
    Ok(())
}

/// Returns false when the session should end.
async fn slash_command(session: &mut Session, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("exit" | "quit"), _) => return false,
        (Some("help"), _) => println!("{}", HELP),
        (Some("mode"), Some(mode)) => match mode.parse::<AgentMode>() {
            Ok(mode) => {
                let policy = policy_for_mode(mode, &session.config.approval);
                session.orchestrator.set_policy(policy);
                println!("[mode: {}]", mode);
            }
            Err(e) => println!("{}", e),
        },
        (Some("mode"), None) => println!("[mode: {}]", session.orchestrator.policy_name()),
        (Some("shells"), _) => {
            let shells = session.shells.shells();
            if shells.is_empty() {
                println!("No background shells");
            }
            for shell in &shells {
                println!("{}", shell_line(shell));
            }
        }
        (Some("kill"), Some(id)) => match session.shells.cancel_shell(id) {
            Ok(()) => println!("[stopping {}]", id),
            Err(e) => println!("{}", e),
        },
        _ => println!("Unknown command. /help lists commands."),
    }
    true
}

/// Run one turn while rendering events, answering approval prompts, and
/// queueing anything else the user types.
async fn drive_turn(
    session: &mut Session,
    input: &mut mpsc::UnboundedReceiver<String>,
    message: ModelMessage,
) -> Result<TurnOutcome> {
    let cancel = CancellationToken::new();
    let queue = session.orchestrator.queue();
    let mut pending: Option<ApprovalResponder> = None;

    let outcome = {
        let turn = session.orchestrator.run_turn(Some(message), cancel.clone());
        tokio::pin!(turn);
        let events = &mut session.events;
        loop {
            tokio::select! {
                result = &mut turn => break result,
                Some(event) = events.recv() => {
                    if let Some(text) = render(&event) {
                        print_flush(&text);
                    }
                    if let ChatEvent::ToolApprovalRequested { responder, .. } = event {
                        pending = Some(responder);
                    }
                }
                Some(line) = input.recv() => match pending.take() {
                    Some(responder) => match parse_approval(&line) {
                        Some(action) => {
                            if !responder.respond(action) {
                                println!("[approval no longer pending]");
                            }
                        }
                        None => {
                            print_flush("  [y]es / [n]o / [a]lways > ");
                            pending = Some(responder);
                        }
                    },
                    None if !line.trim().is_empty() => {
                        queue.push(ModelMessage::user(line.trim()));
                        println!("[queued]");
                    }
                    None => {}
                },
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    cancel.cancel();
                }
            }
        }
    };

    flush_events(session);
    // Only a broken state machine gets here as an error
    Ok(outcome?)
}

/// Run a task to completion with nobody answering prompts.
pub(crate) async fn run_task(session: &mut Session, task: String) -> Result<()> {
    let cancel = CancellationToken::new();

    let outcome = {
        let turn = session
            .orchestrator
            .run_turn(Some(ModelMessage::user(task)), cancel.clone());
        tokio::pin!(turn);
        let events = &mut session.events;
        loop {
            tokio::select! {
                result = &mut turn => break result?,
                Some(event) = events.recv() => {
                    if let Some(text) = render(&event) {
                        print_flush(&text);
                    }
                    if let ChatEvent::ToolApprovalRequested { responder, .. } = event {
                        responder.respond(ApprovalAction::Reject);
                    }
                }
                _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                    cancel.cancel();
                }
            }
        }
    };

    flush_events(session);
    if !outcome.is_success() {
        bail!(
            "task ended in {}{}",
            outcome.final_state,
            outcome
                .error
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}
