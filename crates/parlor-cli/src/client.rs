//! Chat session over a WebSocket

use anyhow::Context;
use colored::{ColoredString, Colorize};
use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use parlor_core::{Username, ERROR_PREFIX};
use std::borrow::Cow;
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the server's close frame after we sent ours
const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The connection closed after a normal session
    Closed,
    /// The server refused the username
    Rejected(String),
}

/// What kind of line the server sent, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Error,
    Presence,
    Private,
    Chat,
    System,
}

fn classify(line: &str) -> LineKind {
    if line.starts_with(ERROR_PREFIX) {
        LineKind::Error
    } else if line.starts_with("*** ") && line.ends_with(" ***") {
        LineKind::Presence
    } else if line.starts_with("[PM ") {
        LineKind::Private
    } else if line
        .split_once(": ")
        .is_some_and(|(name, _)| Username::parse(name).is_ok())
    {
        LineKind::Chat
    } else {
        LineKind::System
    }
}

fn style(line: &str) -> ColoredString {
    match classify(line) {
        LineKind::Error => line.red().bold(),
        LineKind::Presence => line.yellow(),
        LineKind::Private => line.magenta(),
        LineKind::Chat => line.normal(),
        LineKind::System => line.cyan(),
    }
}

/// `host:port` becomes `ws://host:port/ws`; full URLs are kept
pub fn ws_url(server: &str) -> String {
    if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{}/ws", server.trim_end_matches('/'))
    }
}

/// Connect, identify and relay stdin and server lines until one side quits
pub async fn run(server: &str, username: &Username) -> anyhow::Result<SessionEnd> {
    let url = ws_url(server);
    println!("Connecting to {}...", url);

    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("connection error: {}", url))?;
    let (mut writer, reader) = socket.split();

    writer
        .send(Message::Text(username.to_string()))
        .await
        .context("error sending username")?;

    println!("{}", "=== Parlor Chat ===".green().bold());
    println!("Type /help for available commands");
    println!("Type /exit or press Ctrl+C to leave");
    println!("{}", "===================".green().bold());

    let mut incoming = tokio::spawn(read_server(reader));
    let mut lines = spawn_stdin_reader();
    prompt();

    loop {
        tokio::select! {
            end = &mut incoming => {
                return end.context("reader task failed");
            }

            line = lines.recv() => {
                let Some(line) = line else {
                    // stdin closed: leave like /exit
                    return close(&mut writer, incoming).await;
                };
                if line.trim().is_empty() {
                    prompt();
                    continue;
                }
                if line.trim_end() == "/exit" {
                    println!("Exiting chat...");
                    return close(&mut writer, incoming).await;
                }
                writer
                    .send(Message::Text(line))
                    .await
                    .context("error sending message")?;
                prompt();
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\rInterrupted, closing connection...");
                return close(&mut writer, incoming).await;
            }
        }
    }
}

/// Send a normal close frame and give the server a moment to answer it
async fn close<S>(
    writer: &mut S,
    incoming: tokio::task::JoinHandle<SessionEnd>,
) -> anyhow::Result<SessionEnd>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    writer
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        })))
        .await
        .context("write close error")?;

    match tokio::time::timeout(CLOSE_WAIT, incoming).await {
        Ok(end) => end.context("reader task failed"),
        Err(_) => Ok(SessionEnd::Closed),
    }
}

/// Print everything the server sends until it closes the connection
async fn read_server(mut reader: SplitStream<WsStream>) -> SessionEnd {
    let mut first = true;

    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                println!("\r{}", format!("Connection closed: {}", e).red());
                break;
            }
        };

        if first && text.starts_with(ERROR_PREFIX) {
            println!("\r{}", style(&text));
            return SessionEnd::Rejected(text);
        }
        first = false;

        for line in text.lines() {
            println!("\r{}", style(line));
        }
        prompt();
    }

    println!("\rDisconnected from server");
    SessionEnd::Closed
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Read stdin on a plain thread; tokio's stdin would keep the runtime
/// alive on exit.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}
