//! Slash-command interpreter
//!
//! Every reply goes back through [`Hub::send_to`], so a command issued by a
//! slow client is subject to the same drop policy as any other delivery.

use chrono::Utc;
use parlor_core::notice;
use std::sync::Arc;
use tracing::debug;

use crate::hub::Hub;
use crate::session::Session;

/// A parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Help,
    Users,
    Time,
    Exit,
    Whisper { target: &'a str, message: &'a str },
    /// `/whisper` with a missing target or body
    WhisperUsage,
    Unknown(&'a str),
}

/// What the reader pump should do after a command ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    Disconnect,
}

impl<'a> Command<'a> {
    /// Parse a line starting with `/`. Trailing whitespace is ignored.
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end();
        match line {
            "/help" => return Command::Help,
            "/users" => return Command::Users,
            "/time" => return Command::Time,
            "/exit" | "/quit" => return Command::Exit,
            "/whisper" => return Command::WhisperUsage,
            _ => {}
        }

        let Some(args) = line.strip_prefix("/whisper ") else {
            return Command::Unknown(line);
        };
        match args.split_once(' ') {
            Some((target, message)) if !target.trim().is_empty() && !message.trim().is_empty() => {
                Command::Whisper {
                    target: target.trim(),
                    message,
                }
            }
            _ => Command::WhisperUsage,
        }
    }
}

/// Run one command line on behalf of `session`
pub fn execute(hub: &Hub, session: &Arc<Session>, line: &str) -> Outcome {
    let command = Command::parse(line);
    debug!(username = %session.username(), ?command, "Executing command");

    match command {
        Command::Help => {
            hub.send_to(session, notice::HELP);
        }
        Command::Users => {
            let active = hub.list_active();
            let listing = notice::user_list(
                active
                    .iter()
                    .map(|member| (member.username.as_str(), member.connected)),
            );
            hub.send_to(session, listing);
        }
        Command::Time => {
            hub.send_to(session, notice::server_time(Utc::now()));
        }
        Command::Exit => {
            hub.send_to(session, notice::GOODBYE);
            return Outcome::Disconnect;
        }
        Command::Whisper { target, message } => whisper(hub, session, target, message),
        Command::WhisperUsage => {
            hub.send_to(session, notice::WHISPER_USAGE);
        }
        Command::Unknown(cmd) => {
            hub.send_to(session, notice::unknown_command(cmd));
        }
    }
    Outcome::Continue
}

fn whisper(hub: &Hub, session: &Arc<Session>, target: &str, message: &str) {
    let Some(recipient) = hub.find_by_username(target) else {
        hub.send_to(session, notice::user_not_found(target));
        return;
    };

    let sender = session.username().as_str();
    hub.send_to(&recipient, notice::pm_from(sender, message));
    hub.send_to(session, notice::pm_to(target, message));
}
