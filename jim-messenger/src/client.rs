use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdin},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    config::{ClientConfig, TransportConfig},
    console::{ConsoleCommand, HELP},
    store::{Direction, MemoryPeerStore, PeerStore},
    transport::{PeerTransport, TransportEvent},
};

pub async fn run(config: ClientConfig) -> Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let name = match config.name {
        Some(name) => name,
        None => prompt_name(&mut stdin).await?,
    };

    let store = Arc::new(MemoryPeerStore::new());
    let (transport, mut events) = PeerTransport::connect(
        &config.host,
        config.port.get(),
        name.clone(),
        store.clone(),
        TransportConfig::default(),
    )
    .await
    .with_context(|| format!("failed to join {}:{} as {name}", config.host, config.port))?;

    write_stdout(&format!("*** connected as {name}")).await?;
    write_stdout("*** type HELP for commands").await?;

    let result = run_client_loop(&transport, store.as_ref(), &mut events, &mut stdin).await;
    transport.shutdown().await;
    result
}

async fn prompt_name(stdin: &mut BufReader<Stdin>) -> Result<String> {
    let mut input = String::new();
    loop {
        write_prompt("name: ").await?;
        input.clear();
        if stdin.read_line(&mut input).await? == 0 {
            bail!("no name given");
        }
        let name = input.trim();
        if !name.is_empty() {
            return Ok(name.to_string());
        }
    }
}

async fn run_client_loop(
    transport: &PeerTransport,
    store: &dyn PeerStore,
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    stdin: &mut BufReader<Stdin>,
) -> Result<()> {
    let mut input = String::new();
    loop {
        input.clear();
        select! {
            event = events.recv() => {
                if !handle_event(event).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                if !handle_line(&input, transport, store).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event(event: Option<TransportEvent>) -> Result<bool> {
    match event {
        Some(TransportEvent::Message { from, text }) => {
            write_stdout(&format!("<{from}> {text}")).await?;
            Ok(true)
        }
        Some(TransportEvent::ConnectionLost) | None => {
            write_stderr("!!! lost connection to the server").await?;
            Ok(false)
        }
    }
}

async fn handle_line(line: &str, transport: &PeerTransport, store: &dyn PeerStore) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }

    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    let outcome = match command {
        ConsoleCommand::Message { to, text } => {
            transport.send_message(&to, &text).await.map(|()| None)
        }
        ConsoleCommand::AddContact { name } => transport
            .add_contact(&name)
            .await
            .map(|()| Some(format!("*** {name} added to contacts"))),
        ConsoleCommand::RemoveContact { name } => transport
            .remove_contact(&name)
            .await
            .map(|()| Some(format!("*** {name} removed from contacts"))),
        ConsoleCommand::Contacts => transport
            .contacts()
            .await
            .map(|contacts| Some(format!("*** contacts: {}", listing(&contacts)))),
        ConsoleCommand::Users => transport
            .known_users()
            .await
            .map(|users| Some(format!("*** users: {}", listing(&users)))),
        ConsoleCommand::History { name } => {
            render_history(store, &name).await?;
            Ok(None)
        }
        ConsoleCommand::Help => {
            write_stdout(HELP).await?;
            Ok(None)
        }
        ConsoleCommand::Quit => {
            write_stdout("*** leaving").await?;
            return Ok(false);
        }
    };

    match outcome {
        Ok(Some(line)) => write_stdout(&line).await?,
        Ok(None) => {}
        Err(err) => write_stderr(&format!("!!! {err}")).await?,
    }
    Ok(transport.is_running())
}

fn listing(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

async fn render_history(store: &dyn PeerStore, contact: &str) -> io::Result<()> {
    let history = store.history(contact);
    if history.is_empty() {
        return write_stdout(&format!("*** no messages with {contact}")).await;
    }
    for entry in history {
        let arrow = match entry.direction {
            Direction::Incoming => "<-",
            Direction::Outgoing => "->",
        };
        let at = entry.at.format("%H:%M:%S");
        write_stdout(&format!("[{at}] {arrow} {contact}: {}", entry.text)).await?;
    }
    Ok(())
}

async fn write_prompt(prompt: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
