//! Line-oriented control protocol.
//!
//! ```text
//! Byte     Definition
//! -------------------
//! 0-3      Command
//! 4        Ignored
//! 5+       Arguments
//! ```

/// Length of the command token at the start of every line.
pub const TOKEN_LEN: usize = 4;

/// Longest accepted request line, newline excluded.
pub const MAX_LINE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Play,
    List,
    Ffwd,
    Help,
    Kthx,
    Stop,
    Stfu,
}

/// Every supported command with its token and help text, in help order.
pub const COMMAND_TABLE: [(CommandKind, &str, &str); 7] = [
    (CommandKind::Play, "PLAY", "PLAYLIST    - Switch to the specified playlist."),
    (CommandKind::List, "LIST", "[PLAYLIST]  - List playlists or contents of the specified list."),
    (CommandKind::Ffwd, "FFWD", "            - Skip to the next track in the playlist."),
    (CommandKind::Help, "HELP", "            - Display command help."),
    (CommandKind::Kthx, "KTHX", "            - Close the current connection."),
    (CommandKind::Stop, "STOP", "            - Stop the current track and stream silence."),
    (CommandKind::Stfu, "STFU", "            - Terminate the Croaker server."),
];

/// A parsed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Play(String),
    Ffwd,
    List(Option<String>),
    Help,
    Kthx,
    Stop,
    Stfu,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("ERR Command not understood '{0}'")]
    NotUnderstood(String),
    #[error("ERR Unknown Command '{0}'")]
    Unknown(String),
    #[error("ERR Command not understood (line longer than {0} bytes)")]
    LineTooLong(usize),
}

/// Parse one received line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &[u8]) -> Result<Option<Command>, ProtocolError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    if line.len() < TOKEN_LEN {
        return Err(ProtocolError::NotUnderstood(
            String::from_utf8_lossy(line).to_uppercase(),
        ));
    }

    let token = String::from_utf8_lossy(&line[..TOKEN_LEN]).trim().to_uppercase();
    let args = line
        .get(TOKEN_LEN + 1..)
        .map(|rest| String::from_utf8_lossy(rest.trim_ascii()).into_owned())
        .unwrap_or_default();

    let kind = COMMAND_TABLE
        .iter()
        .find(|(_, name, _)| *name == token)
        .map(|(kind, _, _)| *kind)
        .ok_or_else(|| ProtocolError::Unknown(token.clone()))?;

    let command = match kind {
        CommandKind::Play => Command::Play(args),
        CommandKind::List => Command::List((!args.is_empty()).then_some(args)),
        CommandKind::Ffwd => Command::Ffwd,
        CommandKind::Help => Command::Help,
        CommandKind::Kthx => Command::Kthx,
        CommandKind::Stop => Command::Stop,
        CommandKind::Stfu => Command::Stfu,
    };
    Ok(Some(command))
}

/// One `CMD help` line per supported command.
pub fn help_text() -> String {
    COMMAND_TABLE
        .iter()
        .map(|(_, name, help)| format!("{name} {help}"))
        .collect::<Vec<_>>()
        .join("\n")
}
