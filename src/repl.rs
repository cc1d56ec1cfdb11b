use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::controller::{ChatController, ExchangeOutcome, Snapshot, SwitchTarget};
use crate::error::Result;
use crate::session::Role;

const HELP: &str = "\
commands:
  /new [exercise-id]   start a fresh chat (current exercise by default)
  /open <id>           reopen a past conversation
  /delete <id>         delete a past conversation
  /list                past conversations
  /exercises           the exercise catalog
  /cancel              stop the reply being streamed
  /quit                leave
anything else is sent to the tutor";

/// Turns successive snapshots into terminal output. Assistant replies are
/// printed incrementally; the user's own lines are not echoed back.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    epoch: Option<u64>,
    printed: usize,
    open: bool,
    partial: usize,
}

impl TranscriptPrinter {
    pub fn render(&mut self, snap: &Snapshot) -> String {
        let mut out = String::new();
        let replay = self.epoch != Some(snap.epoch);
        if replay {
            self.epoch = Some(snap.epoch);
            self.printed = 0;
            self.open = false;
            self.partial = 0;
            match &snap.interaction_id {
                Some(id) => out.push_str(&format!("--- conversation {} ---\n", id)),
                None => out.push_str("--- new conversation ---\n"),
            }
        }

        let len = snap.transcript.len();
        while self.printed < len {
            let msg = &snap.transcript[self.printed];
            let in_progress = self.printed + 1 == len && snap.phase.is_sending();
            if msg.role == Role::User {
                if replay {
                    out.push_str(&format!("you> {}\n", msg.content));
                }
                self.printed += 1;
                continue;
            }

            if !msg.content.is_empty() {
                if !self.open {
                    out.push_str("tutor> ");
                    self.open = true;
                }
                match msg.content.get(self.partial..) {
                    Some(delta) => out.push_str(delta),
                    None => {
                        out.push('\n');
                        out.push_str(&msg.content);
                    }
                }
                self.partial = msg.content.len();
            }
            if in_progress {
                break;
            }
            if self.open {
                out.push('\n');
            }
            self.printed += 1;
            self.open = false;
            self.partial = 0;
        }
        out
    }
}

fn emit(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

async fn print_sidebar(controller: &ChatController) {
    match controller.sidebar().await {
        Ok(rows) if rows.is_empty() => println!("no past conversations"),
        Ok(rows) => {
            for row in rows {
                let level = row.level.map(|l| l.to_string()).unwrap_or_else(|| "-".into());
                println!("{}  {} [{}, level {}]", row.id, row.title, row.concept, level);
            }
        }
        Err(e) => println!("! {}", e),
    }
}

fn print_exercises(controller: &ChatController) {
    let current = controller.snapshot().exercise_id;
    for e in controller.exercises() {
        let marker = if current.as_deref() == Some(e.id.as_str()) { "*" } else { " " };
        println!("{} {}  {} ({}, {}, level {})", marker, e.id, e.title, e.subject, e.concept, e.level);
    }
}

fn print_exercise_header(controller: &ChatController) {
    if let Some(e) = controller.current_exercise() {
        println!("== {} ({}, level {}) ==", e.title, e.concept, e.level);
        if !e.statement.is_empty() {
            println!("{}", e.statement);
        }
        if let Some(image) = e.image {
            println!("[image: {}]", image);
        }
    }
}

/// Interactive chat until `/quit`, end of input or a completed exercise.
pub async fn run(controller: ChatController) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut changes = controller.subscribe();
    let (outcome_tx, mut outcomes) = mpsc::unbounded_channel();
    let mut printer = TranscriptPrinter::default();

    print_exercise_header(&controller);
    emit(&printer.render(&controller.snapshot()));
    println!("type /help for commands");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let (cmd, arg) = match line.split_once(char::is_whitespace) {
                    Some((c, a)) => (c, Some(a.trim()).filter(|a| !a.is_empty())),
                    None => (line.as_str(), None),
                };
                match cmd {
                    "/quit" | "/exit" => break,
                    "/help" => println!("{}", HELP),
                    "/cancel" => controller.cancel(),
                    "/list" => print_sidebar(&controller).await,
                    "/exercises" => print_exercises(&controller),
                    "/new" => {
                        let target = arg.map(str::to_string).or_else(|| controller.snapshot().exercise_id);
                        match target {
                            Some(id) => {
                                if let Err(e) = controller.switch_to(SwitchTarget::Exercise(id)).await {
                                    println!("! {}", e);
                                }
                                print_exercise_header(&controller);
                            }
                            None => println!("! no exercise to start"),
                        }
                    }
                    "/open" => match arg {
                        Some(id) => {
                            if let Err(e) = controller.switch_to(SwitchTarget::Interaction(id.to_string())).await {
                                println!("! {}", e);
                            }
                            print_exercise_header(&controller);
                        }
                        None => println!("usage: /open <id>"),
                    },
                    "/delete" => match arg {
                        Some(id) => match controller.delete_interaction(id).await {
                            Ok(()) => println!("deleted {}", id),
                            Err(e) => println!("! {}", e),
                        },
                        None => println!("usage: /delete <id>"),
                    },
                    c if c.starts_with('/') => println!("unknown command {}, try /help", c),
                    _ => {
                        let c = controller.clone();
                        let tx = outcome_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(c.send_message(&line).await);
                        });
                    }
                }
                emit(&printer.render(&controller.snapshot()));
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                emit(&printer.render(&controller.snapshot()));
            }
            Some(outcome) = outcomes.recv() => {
                emit(&printer.render(&controller.snapshot()));
                match outcome {
                    Ok(ExchangeOutcome::Completed { finished: true, .. }) => {
                        println!("exercise completed, back to the dashboard");
                        break;
                    }
                    Ok(ExchangeOutcome::Completed { .. }) | Ok(ExchangeOutcome::Cancelled) => {}
                    Ok(ExchangeOutcome::Failed(message)) => tracing::debug!(%message, "exchange failed"),
                    Ok(ExchangeOutcome::Stalled) => println!("! the tutor stopped answering, try again"),
                    Err(e) => println!("! {}", e),
                }
            }
        }
    }

    controller.cancel();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Phase;
    use crate::session::ChatMessage;

    fn snap(epoch: u64, phase: Phase, transcript: Vec<ChatMessage>) -> Snapshot {
        Snapshot {
            user_id: Some("u1".into()),
            exercise_id: Some("e1".into()),
            interaction_id: None,
            transcript,
            phase,
            epoch,
        }
    }

    #[test]
    fn streamed_reply_is_printed_as_deltas() {
        let mut p = TranscriptPrinter::default();
        assert_eq!(p.render(&snap(1, Phase::Idle, vec![])), "--- new conversation ---\n");

        let user = ChatMessage::user("hola");
        let out = p.render(&snap(1, Phase::AwaitingFirstToken, vec![user.clone(), ChatMessage::assistant("")]));
        assert_eq!(out, "");
        let out = p.render(&snap(1, Phase::Streaming, vec![user.clone(), ChatMessage::assistant("Hel")]));
        assert_eq!(out, "tutor> Hel");
        let out = p.render(&snap(1, Phase::Streaming, vec![user.clone(), ChatMessage::assistant("Hello")]));
        assert_eq!(out, "lo");
        let out = p.render(&snap(1, Phase::Idle, vec![user, ChatMessage::assistant("Hello")]));
        assert_eq!(out, "\n");
    }

    #[test]
    fn replaced_transcript_is_replayed_in_full() {
        let mut p = TranscriptPrinter::default();
        p.render(&snap(1, Phase::Idle, vec![]));
        let mut loaded = snap(2, Phase::Idle, vec![ChatMessage::user("a"), ChatMessage::assistant("b")]);
        loaded.interaction_id = Some("i1".into());
        assert_eq!(p.render(&loaded), "--- conversation i1 ---\nyou> a\ntutor> b\n");
        assert_eq!(p.render(&loaded), "");
    }

    #[test]
    fn cancelled_empty_placeholder_prints_nothing() {
        let mut p = TranscriptPrinter::default();
        p.render(&snap(1, Phase::Idle, vec![]));
        let out = p.render(&snap(1, Phase::Idle, vec![ChatMessage::user("x"), ChatMessage::assistant("")]));
        assert_eq!(out, "");
    }
}
