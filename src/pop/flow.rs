//! Connection state and the static command table.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Authorization,
    Transaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Capa,
    Stls,
    User,
    Pass,
    Quit,
    Stat,
    List,
    Uidl,
    Retr,
    Dele,
    Rset,
    Top,
    Noop,
}

pub struct CommandSpec {
    pub verb: &'static str,
    pub cmd: Verb,
    /// `None` means the command is legal in any state.
    pub state: Option<State>,
}

/// Verb -> handler + required state, built once. See RFC 1939 section 4
/// for the AUTHORIZATION/TRANSACTION split.
pub static COMMANDS: &[CommandSpec] = &[
    CommandSpec { verb: "CAPA", cmd: Verb::Capa, state: None },
    CommandSpec { verb: "STLS", cmd: Verb::Stls, state: Some(State::Authorization) },
    CommandSpec { verb: "USER", cmd: Verb::User, state: Some(State::Authorization) },
    CommandSpec { verb: "PASS", cmd: Verb::Pass, state: Some(State::Authorization) },
    CommandSpec { verb: "QUIT", cmd: Verb::Quit, state: None },
    CommandSpec { verb: "STAT", cmd: Verb::Stat, state: Some(State::Transaction) },
    CommandSpec { verb: "LIST", cmd: Verb::List, state: Some(State::Transaction) },
    CommandSpec { verb: "UIDL", cmd: Verb::Uidl, state: Some(State::Transaction) },
    CommandSpec { verb: "RETR", cmd: Verb::Retr, state: Some(State::Transaction) },
    CommandSpec { verb: "DELE", cmd: Verb::Dele, state: Some(State::Transaction) },
    CommandSpec { verb: "RSET", cmd: Verb::Rset, state: Some(State::Transaction) },
    CommandSpec { verb: "TOP", cmd: Verb::Top, state: Some(State::Transaction) },
    CommandSpec { verb: "NOOP", cmd: Verb::Noop, state: Some(State::Transaction) },
];

pub fn lookup(verb: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.verb == verb)
}

/// Message numbers are 1-based positive integers; a leading '+' is
/// tolerated because historical clients produce it. A parse failure is a
/// syntax error, distinct from "out of range".
pub fn parse_message_number(arg: Option<&str>) -> Option<usize> {
    let n = arg?.parse::<usize>().ok()?;
    (n >= 1).then_some(n)
}
