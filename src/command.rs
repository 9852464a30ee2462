//! Parses a single FTP command line into a [`Command`].
//!
//! Mirrors `FtpConnection::processNewCommand`'s grammar exactly: a
//! case-insensitive verb up to the first space (or end of line), followed
//! by an optional argument running to the end of the line. Lines are
//! expected to already have their trailing `\r\n` stripped by the caller.

/// A parsed command line, ready for `connection::Connection` to act on.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    User(String),
    Quit,
    Noop,
    Type { representation: char, format: char },
    Mode(char),
    Stru(char),
    Pasv,
    Pwd,
    Retr(String),
    Stor(String),
    List(Option<String>),
    /// The verb is not one this server implements at all.
    Unknown,
    /// The verb is recognized but the argument grammar was wrong; carries
    /// the reason to report back to the client verbatim.
    Invalid(&'static str),
}

pub fn parse(line: &str) -> Command {
    let (verb, rest) = match line.find(' ') {
        Some(i) => (&line[..i], line[i + 1..].trim_start()),
        None => (line, ""),
    };
    let verb = verb.to_ascii_uppercase();

    match verb.as_str() {
        // Unlike the other commands, an empty argument is not grammatically
        // invalid -- it is a `USER` command with an empty name, and must
        // still reach `dispatch`'s `Command::User` arm ahead of the
        // auth-guard arm so an unauthenticated empty `USER\r\n` gets its own
        // `501 Please, specify a username` reply rather than `530 Not logged
        // in` (see `connection::cmd_user`).
        "USER" => Command::User(rest.to_string()),
        "QUIT" => Command::Quit,
        "NOOP" => Command::Noop,
        "TYPE" => parse_type(rest),
        "MODE" => parse_single_char_arg(rest, Command::Mode, "Please, specify the mode"),
        "STRU" => parse_single_char_arg(rest, Command::Stru, "Please, specify the structure"),
        "PASV" => Command::Pasv,
        "PWD" => Command::Pwd,
        "RETR" => {
            if rest.is_empty() {
                Command::Invalid("Please, specify a file name")
            } else {
                Command::Retr(rest.to_string())
            }
        }
        "STOR" => {
            if rest.is_empty() {
                Command::Invalid("Please, specify a file name")
            } else {
                Command::Stor(rest.to_string())
            }
        }
        "LIST" => Command::List(if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }),
        _ => Command::Unknown,
    }
}

fn parse_single_char_arg(
    rest: &str,
    make: impl FnOnce(char) -> Command,
    empty_msg: &'static str,
) -> Command {
    let mut chars = rest.chars();
    match (chars.next(), chars.next()) {
        (None, _) => Command::Invalid(empty_msg),
        (Some(c), None) => make(c.to_ascii_uppercase()),
        _ => Command::Invalid("Invalid argument(s)"),
    }
}

fn parse_type(rest: &str) -> Command {
    let mut parts = rest.split_whitespace();
    let representation = match parts.next() {
        Some(r) if r.len() == 1 => r.chars().next().unwrap().to_ascii_uppercase(),
        _ => return Command::Invalid("Invalid argument(s)"),
    };
    let format = match parts.next() {
        None => 'N',
        Some(f) if f.len() == 1 => f.chars().next().unwrap().to_ascii_uppercase(),
        _ => return Command::Invalid("Invalid argument(s)"),
    };
    if parts.next().is_some() {
        return Command::Invalid("Invalid argument(s)");
    }
    match (representation, format) {
        ('A' | 'E' | 'I' | 'L', 'N' | 'T' | 'C') => Command::Type {
            representation,
            format,
        },
        _ => Command::Invalid("Invalid argument(s)"),
    }
}
