//! Slash commands recognized in raw chat input.

/// Count used by `/count` without an argument.
pub const DEFAULT_COUNT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/dadjoke`: ask the hub for a joke.
    DadJoke,
    /// `/count [n]`: stream a countdown from the hub.
    Count(u32),
    /// `/cancel`: stop the running countdown.
    Cancel,
    /// Anything else is sent to everyone as a chat line.
    Broadcast(String),
}

/// Classify one line of input. Blank input yields `None`. Text that only
/// looks like a command (`/count abc`, `/unknown`) is broadcast as-is.
pub fn parse(input: &str) -> Option<Command> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut words = input.split_whitespace();
    let command = match (words.next(), words.next(), words.next()) {
        (Some("/dadjoke"), None, _) => Command::DadJoke,
        (Some("/cancel"), None, _) => Command::Cancel,
        (Some("/count"), None, _) => Command::Count(DEFAULT_COUNT),
        (Some("/count"), Some(n), None) => match n.parse() {
            Ok(n) => Command::Count(n),
            Err(_) => Command::Broadcast(input.to_string()),
        },
        _ => Command::Broadcast(input.to_string()),
    };
    Some(command)
}
