//! Command parsing for the interactive client.

use anyhow::{Result, anyhow};

pub const HELP: &str = "\
commands:
  MSG <user> <text>   (m)  send a message
  ADD <user>          (a)  add a contact
  DEL <user>          (d)  remove a contact
  CONTACTS            (c)  list contacts
  USERS               (u)  list known users
  HISTORY <user>      (h)  show the conversation with a user
  HELP                     print this reference
  QUIT                (q)  leave";

/// Commands that can be entered at the client prompt.
#[derive(Debug, PartialEq)]
pub enum ConsoleCommand {
    Message { to: String, text: String },
    AddContact { name: String },
    RemoveContact { name: String },
    Contacts,
    Users,
    History { name: String },
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parses one line of input. Command words are case-insensitive and
    /// accept single-letter aliases; message text keeps its spacing.
    pub fn parse(line: &str) -> Result<Self> {
        let trimmed = line.trim();
        let Some((word, rest)) = split_word(trimmed) else {
            return Err(anyhow!("empty command"));
        };

        let cmd = word.to_uppercase();
        let normalized = match cmd.as_str() {
            "M" => "MSG",
            "A" => "ADD",
            "D" => "DEL",
            "C" => "CONTACTS",
            "U" => "USERS",
            "H" => "HISTORY",
            "Q" | "EXIT" => "QUIT",
            other => other,
        };

        match normalized {
            "CONTACTS" => return Ok(ConsoleCommand::Contacts),
            "USERS" => return Ok(ConsoleCommand::Users),
            "HELP" => return Ok(ConsoleCommand::Help),
            "QUIT" => return Ok(ConsoleCommand::Quit),
            _ => {}
        }

        let target = split_word(rest);
        match (normalized, target) {
            ("MSG", Some((to, text))) if !text.is_empty() => Ok(ConsoleCommand::Message {
                to: to.to_string(),
                text: text.to_string(),
            }),
            ("MSG", _) => Err(anyhow!("MSG requires a recipient and text: MSG <user> <text>")),
            ("ADD", Some((name, ""))) => Ok(ConsoleCommand::AddContact {
                name: name.to_string(),
            }),
            ("DEL", Some((name, ""))) => Ok(ConsoleCommand::RemoveContact {
                name: name.to_string(),
            }),
            ("HISTORY", Some((name, ""))) => Ok(ConsoleCommand::History {
                name: name.to_string(),
            }),
            ("ADD" | "DEL" | "HISTORY", _) => {
                Err(anyhow!("{normalized} requires exactly one argument: {normalized} <user>"))
            }
            _ => Err(anyhow!(
                "invalid command. Try: MSG/m <user> <text>, ADD/a <user>, DEL/d <user>, CONTACTS/c, USERS/u, HISTORY/h <user>, HELP, QUIT/q"
            )),
        }
    }
}

/// Splits off the first whitespace-delimited word; the remainder is trimmed.
fn split_word(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => Some((word, rest.trim())),
        None => Some((input, "")),
    }
}
