use clap::Parser;
use colored::Colorize;
use parlor_core::Username;
use std::io::{self, BufRead, Write};

mod client;

use client::SessionEnd;

const DEFAULT_SERVER: &str = "localhost:8080";

#[derive(Parser, Debug)]
#[command(name = "parlor")]
#[command(about = "Terminal client for the Parlor chat server")]
#[command(version)]
struct Cli {
    /// Server address (host:port)
    #[arg(long, short, env = "PARLOR_SERVER")]
    server: Option<String>,

    /// Your username
    #[arg(long, short)]
    user: Option<String>,

    /// Server address, when --server is not given
    #[arg(value_name = "SERVER")]
    server_arg: Option<String>,

    /// Username, when --user is not given
    #[arg(value_name = "USERNAME")]
    user_arg: Option<String>,
}

impl Cli {
    /// Flags win; positionals fill in whatever the flags left out
    fn resolve(self) -> (Option<String>, Option<String>) {
        let server = self.server.or(self.server_arg).filter(|s| !s.trim().is_empty());
        let user = self.user.or(self.user_arg).filter(|u| !u.trim().is_empty());
        (server, user)
    }
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(SessionEnd::Closed) => 0,
        Ok(SessionEnd::Rejected(_)) => 1,
        Err(e) => {
            eprintln!("{}", format!("Error: {:#}", e).red());
            1
        }
    };
    // stdin is read on a detached thread; do not wait for it
    std::process::exit(code);
}

async fn run() -> anyhow::Result<SessionEnd> {
    let (server, user) = Cli::parse().resolve();
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();

    let server = match server {
        Some(server) => server,
        None => prompt_server(&mut input, &mut output)?,
    };
    let username = match user {
        Some(user) => Username::parse(user.trim())
            .map_err(|e| anyhow::anyhow!("Invalid username {:?}: {}", user, e))?,
        None => prompt_username(&mut input, &mut output)?,
    };
    drop(input);

    println!("Connecting as {} to {}...", username, server);
    client::run(&server, &username).await
}

fn read_trimmed_line<R: BufRead>(input: &mut R) -> anyhow::Result<String> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        anyhow::bail!("stdin closed");
    }
    Ok(line.trim().to_string())
}

/// Ask for the server address; an empty answer means the default
fn prompt_server<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> anyhow::Result<String> {
    write!(output, "Enter server address (e.g., {}): ", DEFAULT_SERVER)?;
    output.flush()?;

    let server = read_trimmed_line(input)?;
    if server.is_empty() {
        writeln!(output, "Using default server: {}", DEFAULT_SERVER)?;
        return Ok(DEFAULT_SERVER.to_string());
    }
    Ok(server)
}

/// Ask for a username until a valid one is given
fn prompt_username<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> anyhow::Result<Username> {
    write!(output, "Enter your username: ")?;
    output.flush()?;

    loop {
        let answer = read_trimmed_line(input)?;
        match Username::parse(&answer) {
            Ok(username) => return Ok(username),
            Err(_) => {
                writeln!(
                    output,
                    "Username must be 2-20 characters without spaces or special chars (/, \\, :)"
                )?;
                write!(output, "Enter your username: ")?;
                output.flush()?;
            }
        }
    }
}
