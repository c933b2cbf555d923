//! Terminal line to user intent.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Chat(String),
    Voice(bool),
    Image(PathBuf),
    /// `None` clears the avatar.
    Avatar(Option<PathBuf>),
    Who,
    Ip,
    Logout,
    Quit,
    Empty,
    Unknown(String),
}

pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if !line.starts_with('/') {
        return Input::Chat(line.to_string());
    }

    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match (command, rest) {
        ("/voice", "") => Input::Voice(true),
        ("/leave", "") => Input::Voice(false),
        ("/image", path) if !path.is_empty() => Input::Image(PathBuf::from(path)),
        ("/avatar", "") => Input::Avatar(None),
        ("/avatar", path) => Input::Avatar(Some(PathBuf::from(path))),
        ("/who", "") => Input::Who,
        ("/ip", "") => Input::Ip,
        ("/logout", "") => Input::Logout,
        ("/quit", "") | ("/exit", "") => Input::Quit,
        _ => Input::Unknown(command.to_string()),
    }
}

pub const HELP: &str = "commands: /voice /leave /image <path> /avatar [path] /who /ip /logout /quit";
