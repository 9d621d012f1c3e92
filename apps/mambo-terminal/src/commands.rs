//! Line-oriented input parsing.

use std::path::PathBuf;

use chat_core::MessageId;

pub const HELP_TEXT: &str = "\
Type a message and press enter to send it. Commands:
  /gif [query]          show trending GIFs, or search
  /pick N               send GIF number N from the last results
  /image PATH [caption] upload and send an image
  /reply ID | /cancel   reply to a message, or stop replying
  /edit ID TEXT         edit one of your messages
  /delete ID            delete one of your messages
  /react ID EMOJI       react to a message
  /top /up /down /bottom  scroll the message list
  /jump ID              scroll to a message
  /login PHONE          text a one-time code to PHONE
  /otp CODE             verify the code and log in
  /logout               log out and get a fresh username
  /name NAME            change your device username
  /reconnect            reload messages after a connection problem
  /help /quit";

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Empty,
    Text(String),
    Gifs { query: Option<String> },
    PickGif(usize),
    Image { path: PathBuf, caption: Option<String> },
    Reply(MessageId),
    CancelReply,
    Edit { message_id: MessageId, text: String },
    Delete(MessageId),
    React { message_id: MessageId, emoji: String },
    Top,
    Up,
    Down,
    Bottom,
    Jump(MessageId),
    Login { phone: String },
    Otp { code: String },
    Logout,
    Name(String),
    Reconnect,
    Help,
    Quit,
}

/// Parse one line. A leading `//` sends the rest as text starting with `/`.
pub fn parse(line: &str) -> Result<UserInput, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(UserInput::Empty);
    }
    if let Some(text) = line.strip_prefix("//") {
        return Ok(UserInput::Text(format!("/{text}")));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(UserInput::Text(line.to_owned()));
    };

    let (name, rest) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };

    let input = match name.to_ascii_lowercase().as_str() {
        "gif" | "gifs" => UserInput::Gifs {
            query: non_empty(rest),
        },
        "pick" => UserInput::PickGif(
            rest.parse()
                .map_err(|_| "Usage: /pick N (a number from the GIF list)".to_owned())?,
        ),
        "image" | "img" => {
            let (path, caption) = split_first(rest);
            let path = non_empty(path).ok_or("Usage: /image PATH [caption]")?;
            UserInput::Image {
                path: PathBuf::from(path),
                caption: non_empty(caption),
            }
        }
        "reply" => UserInput::Reply(message_id(rest, "Usage: /reply ID")?),
        "cancel" => UserInput::CancelReply,
        "edit" => {
            let (id, text) = split_first(rest);
            let message_id = message_id(id, "Usage: /edit ID TEXT")?;
            let text = non_empty(text).ok_or("Usage: /edit ID TEXT")?;
            UserInput::Edit { message_id, text }
        }
        "delete" | "del" => UserInput::Delete(message_id(rest, "Usage: /delete ID")?),
        "react" => {
            let (id, emoji) = split_first(rest);
            let message_id = message_id(id, "Usage: /react ID EMOJI")?;
            let emoji = non_empty(emoji).ok_or("Usage: /react ID EMOJI")?;
            UserInput::React { message_id, emoji }
        }
        "top" => UserInput::Top,
        "up" => UserInput::Up,
        "down" => UserInput::Down,
        "bottom" => UserInput::Bottom,
        "jump" => UserInput::Jump(message_id(rest, "Usage: /jump ID")?),
        "login" => UserInput::Login {
            phone: non_empty(rest).ok_or("Usage: /login PHONE")?,
        },
        "otp" => UserInput::Otp {
            code: non_empty(rest).ok_or("Usage: /otp CODE")?,
        },
        "logout" => UserInput::Logout,
        "name" => UserInput::Name(non_empty(rest).ok_or("Usage: /name NAME")?),
        "reconnect" => UserInput::Reconnect,
        "help" | "?" => UserInput::Help,
        "quit" | "exit" => UserInput::Quit,
        other => return Err(format!("Unknown command /{other}. Type /help for a list.")),
    };
    Ok(input)
}

fn split_first(rest: &str) -> (&str, &str) {
    match rest.split_once(char::is_whitespace) {
        Some((first, tail)) => (first, tail.trim()),
        None => (rest, ""),
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_owned())
}

fn message_id(raw: &str, usage: &str) -> Result<MessageId, String> {
    raw.trim()
        .trim_start_matches('#')
        .parse()
        .map_err(|_| usage.to_owned())
}
