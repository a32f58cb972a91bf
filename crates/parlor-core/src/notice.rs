//! Texts sent by the hub
//!
//! Every line a client can see that did not come from another user is
//! built here, so the gateway and the tests agree on the exact wording.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Sent instead of registering when the name is already in use
pub const USERNAME_TAKEN: &str =
    "ERROR: Username already taken. Please try again with a different name.";

/// Sent instead of registering when the name fails validation
pub const USERNAME_INVALID: &str =
    "ERROR: Username must be 2-20 characters without spaces or special characters (/, \\, :)";

/// Sent instead of registering when the hub is at capacity
pub const SERVER_FULL: &str = "ERROR: Server is full. Please try again later.";

/// Sent to connections that arrive while the server is stopping
pub const SHUTTING_DOWN: &str = "ERROR: Server is shutting down.";

pub const WHISPER_USAGE: &str = "Usage: /whisper <username> <message>";

pub const GOODBYE: &str = "Goodbye!";

pub const HELP: &str = "
Available commands:
/help - Show this help message
/users - List all connected users
/time - Show current server time
/exit - Exit the chat
/whisper <username> <message> - Send private message to a user
";

pub fn welcome(username: &str, online: usize) -> String {
    format!(
        "Welcome {}! There are {} users online. Type /help for available commands.",
        username, online
    )
}

pub fn joined(username: &str) -> String {
    format!("*** {} joined the chat ***", username)
}

pub fn left(username: &str) -> String {
    format!("*** {} left the chat ***", username)
}

/// A regular chat line as seen by every member
pub fn chat_line(username: &str, text: &str) -> String {
    format!("{}: {}", username, text)
}

pub fn pm_from(sender: &str, message: &str) -> String {
    format!("[PM from {}]: {}", sender, message)
}

pub fn pm_to(target: &str, message: &str) -> String {
    format!("[PM to {}]: {}", target, message)
}

pub fn user_not_found(username: &str) -> String {
    format!("User '{}' not found", username)
}

pub fn unknown_command(command: &str) -> String {
    format!(
        "Unknown command: {}. Type /help for available commands.",
        command
    )
}

pub fn server_time(now: DateTime<Utc>) -> String {
    format!("Server time: {}", now.format("%a, %d %b %Y %H:%M:%S UTC"))
}

/// Numbered `/users` listing
pub fn user_list<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, Duration)>,
{
    let lines: Vec<String> = entries
        .into_iter()
        .enumerate()
        .map(|(i, (name, connected))| {
            format!(
                "{}. {} (connected for {})",
                i + 1,
                name,
                format_duration(connected)
            )
        })
        .collect();

    let mut out = format!("Connected users ({}):\n", lines.len());
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

/// Render whole seconds: `0s`, `42s`, `3m7s`, `1h0m5s`. Sub-second parts
/// are ignored; callers pass durations already rounded.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();

    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
        assert_eq!(format_duration(Duration::from_millis(999)), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m0s");
        assert_eq!(format_duration(Duration::from_secs(187)), "3m7s");
        assert_eq!(format_duration(Duration::from_secs(3605)), "1h0m5s");
    }

    #[test]
    fn test_user_list_is_numbered() {
        let listing = user_list(vec![
            ("alice", Duration::from_secs(65)),
            ("bob", Duration::from_secs(3)),
        ]);
        assert_eq!(
            listing,
            "Connected users (2):\n1. alice (connected for 1m5s)\n2. bob (connected for 3s)\n"
        );
    }

    #[test]
    fn test_server_time_format() {
        let at = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();
        assert_eq!(server_time(at), "Server time: Mon, 02 Jan 2006 15:04:05 UTC");
    }

    #[test]
    fn test_rejections_share_prefix() {
        for notice in [USERNAME_TAKEN, USERNAME_INVALID, SERVER_FULL, SHUTTING_DOWN] {
            assert!(notice.starts_with(crate::ERROR_PREFIX));
        }
    }
}
