//! cowrite terminal client
//!
//! Opens a collaboration session on a relay and edits the shared text from a
//! line REPL. Every plain line is appended to the document; lines starting
//! with `:` are commands.
//!
//! # Usage
//!
//! ```bash
//! # Join a document on a local relay
//! cowrite meeting-notes --name Ada
//!
//! # Remote relay with a share token and an offline cache
//! cowrite plan --relay wss://relay.example.com --token s3cret --cache ~/.cowrite.db
//!
//! # Try it without a relay
//! cowrite scratch --relay memory://local
//!
//! # With configuration file
//! cowrite --config ~/.config/cowrite.toml
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

use cowrite_session::{
    BufferSurface, CollabEvent, CollabSession, ConnectionManager, MemoryStyleSink, NetworkMonitor, Notice,
    SessionController, SessionError, TextSurface,
};
use cowrite_transport::{ConnectionStatus, Connector, MemoryRelay, WebSocketConnector};

use crate::config::{Args, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load(Args::parse())?;

    FmtSubscriber::builder()
        .with_max_level(settings.log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    if !settings.quiet {
        print_banner(&settings);
    }

    let connector = connector_for(&settings.manager.relay_url);
    let manager = Arc::new(ConnectionManager::new(settings.manager.clone(), connector));
    let network = NetworkMonitor::new(true);
    let controller = SessionController::new(manager, network.clone())
        .with_presence(settings.identity.clone(), Arc::new(MemoryStyleSink::new()));

    let session = controller.mount(settings.document.clone(), settings.token.clone()).await;
    let mut events = session.events();
    report_initial_state(&session);

    let surface = Arc::new(BufferSurface::new());
    let binding = match session.bind_editor(surface.clone()) {
        Ok(binding) => Some(binding),
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            None
        }
    };

    let mut lines = spawn_reader();
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                match Command::parse(&line) {
                    Command::Quit => break,
                    command => run_command(command, &session, &network, &surface),
                }
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => debug!(skipped, "Dropped session events"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    drop(binding);
    session.unmount().await;
    info!("Session closed");
    Ok(())
}

fn connector_for(relay_url: &str) -> Arc<dyn Connector> {
    if relay_url.starts_with("memory:") {
        Arc::new(MemoryRelay::new())
    } else {
        Arc::new(WebSocketConnector::new())
    }
}

/// A parsed REPL line
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Append(String),
    Text,
    Who,
    Status,
    Offline,
    Online,
    Reconnect,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let Some(command) = line.trim_end().strip_prefix(':') else {
            return Command::Append(line.to_string());
        };
        match command.trim().to_lowercase().as_str() {
            "text" => Command::Text,
            "who" => Command::Who,
            "status" => Command::Status,
            "offline" => Command::Offline,
            "online" => Command::Online,
            "reconnect" => Command::Reconnect,
            "help" | "h" | "?" => Command::Help,
            "quit" | "q" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

fn run_command(command: Command, session: &CollabSession, network: &NetworkMonitor, surface: &BufferSurface) {
    match command {
        Command::Append(line) => {
            let text = if surface.text().is_empty() {
                line
            } else {
                format!("\n{}", line)
            };
            match surface.append(&text) {
                Ok(()) => {}
                Err(SessionError::ReadOnly) => println!("{}", "Document is read-only.".yellow()),
                Err(e) => eprintln!("{} {}", "Error:".red(), e),
            }
        }
        Command::Text => {
            let text = surface.text();
            if text.is_empty() {
                println!("{}", "(empty)".dimmed());
            } else {
                println!("{}", text);
            }
        }
        Command::Who => print_roster(session),
        Command::Status => print_status(session),
        Command::Offline => {
            network.set_online(false);
            println!("{}", "Network marked offline; edits stay local.".yellow());
        }
        Command::Online => network.set_online(true),
        Command::Reconnect => session.reconnect(),
        Command::Help => print_help(),
        Command::Quit => {}
        Command::Unknown(name) => println!("{} :{} (try :help)", "Unknown command".red(), name),
    }
}

/// Read lines on a blocking thread; the channel closes on EOF or `:quit`
fn spawn_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("{} {}", "Error:".red(), e);
                return;
            }
        };
        let history_path = history_path();
        if let Some(path) = &history_path {
            let _ = rl.load_history(path);
        }

        loop {
            let prompt = format!("{}> ", "cowrite".green());
            match rl.readline(&prompt) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(line.as_str());
                    let quit = Command::parse(&line) == Command::Quit;
                    if tx.send(line).is_err() || quit {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("^D");
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {:?}", err);
                    break;
                }
            }
        }

        if let Some(path) = &history_path {
            let _ = rl.save_history(path);
        }
    });

    rx
}

fn history_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join(".cowrite_history"))
}

fn colored_status(status: ConnectionStatus) -> ColoredString {
    match status {
        ConnectionStatus::Connected => status.to_string().green(),
        ConnectionStatus::Connecting => status.to_string().yellow(),
        ConnectionStatus::Disconnected => status.to_string().red(),
    }
}

fn report_initial_state(session: &CollabSession) {
    let state = session.state();
    if let Some(warning) = &state.warning {
        println!("{}", warning.yellow());
    }
    if let Some(error) = &state.error {
        println!("{}", error.red());
    }
}

fn print_event(event: &CollabEvent) {
    match event {
        CollabEvent::Status(status) => println!("[{}]", colored_status(*status)),
        CollabEvent::Roster { count, .. } => {
            let noun = if *count == 1 { "participant" } else { "participants" };
            println!("{}", format!("{} {} here", count, noun).dimmed());
        }
        CollabEvent::Notice(Notice::Disconnected) => {
            println!("{}", "Lost connection to the relay. Edits are kept and will sync on reconnect.".red())
        }
        CollabEvent::Notice(Notice::AccessDegraded(reason)) => {
            println!("{}", format!("Could not verify access ({}); read-only.", reason).yellow())
        }
        CollabEvent::Notice(Notice::ConnectionFailed(reason)) => {
            println!("{}", format!("Unable to connect: {}", reason).red())
        }
        CollabEvent::Notice(Notice::PermissionDenied(reason)) => {
            println!("{}", format!("Access denied: {}", reason).red())
        }
        CollabEvent::Metadata(metadata) => {
            if let Some(title) = &metadata.title {
                println!("{} {}", "Title:".cyan(), title);
            }
        }
        CollabEvent::Synced => println!("{}", "Synced with relay.".dimmed()),
    }
}

fn print_status(session: &CollabSession) {
    let state = session.state();
    let document = state
        .document_id
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".into());
    println!("{} {}", "document:".cyan(), document);
    println!("{} {}", "status:".cyan(), colored_status(state.status));
    println!("{} {}", "synced:".cyan(), state.synced);
    println!(
        "{} {}",
        "access:".cyan(),
        if state.read_only { "read-only" } else { "edit" }
    );
    if let Some(title) = &state.title {
        println!("{} {}", "title:".cyan(), title);
    }
    if let Some(error) = &state.error {
        println!("{} {}", "error:".cyan(), error.red());
    }
}

fn print_roster(session: &CollabSession) {
    let state = session.state();
    if state.roster.is_empty() {
        println!("{}", "(nobody)".dimmed());
        return;
    }
    for (i, participant) in state.roster.participants().enumerate() {
        let name = participant.name.as_deref().unwrap_or("Anonymous");
        let connections = participant.client_ids.len();
        let suffix = if connections > 1 {
            format!(" ({} connections)", connections)
        } else {
            String::new()
        };
        println!("{}) {}{}", i + 1, name.bold(), suffix.dimmed());
    }
}

fn print_banner(settings: &Settings) {
    println!(
        "{}",
        format!(
            r#"
  cowrite    {}
             relay {}
             Type :help for commands, :quit to exit
"#,
            settings.document, settings.manager.relay_url
        )
        .cyan()
    );
}

fn print_help() {
    println!(
        r#"
{}
  <text>        Append a line to the document

{}
  :text         Print the document
  :who          List participants
  :status       Connection and access state

{}
  :offline      Pretend the network went away
  :online       Bring the network back
  :reconnect    Retry after a disconnect

{}
  :help         Show this help
  :quit         Close the session and exit
"#,
        "Editing".yellow().bold(),
        "Inspecting".yellow().bold(),
        "Connection".yellow().bold(),
        "Local".yellow().bold(),
    );
}
