//! Stdin command parsing

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `set <json>`
    Set(Value),
    Get,
    Sync,
    Peers,
    Quit,
}

/// Parse one input line; blank lines yield `None`
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word {
        "set" => {
            if rest.is_empty() {
                return Err("usage: set <json>".into());
            }
            let value = serde_json::from_str(rest).map_err(|e| format!("invalid JSON: {}", e))?;
            Command::Set(value)
        }
        "get" => Command::Get,
        "sync" => Command::Sync,
        "peers" => Command::Peers,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{}'", other)),
    };

    if !matches!(command, Command::Set(_)) && !rest.is_empty() {
        return Err(format!("'{}' takes no arguments", word));
    }
    Ok(Some(command))
}
