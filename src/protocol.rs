/*!
 * Command Codec
 *
 * This module implements the one textual command representation shared by
 * the append-only log, the replication stream, and the client protocol.
 * Mutations are encoded as single newline-terminated lines:
 *
 *   SET <key> <value-tokens...> [EX <ttl-seconds>]
 *   DELETE <key>
 *
 * Clients additionally send `GET <key>` and receive one response line per
 * command (`OK`, `NULL`, `NOT_FOUND`, the raw value, or `ERROR: <msg>`).
 */

use std::fmt;
use thiserror::Error;

/// A single replicable, loggable mutation.
///
/// This is the `LogEntry` of the system: the exact same value is written
/// to the on-disk log, fanned out to followers, and produced by parsing a
/// client's `SET`/`DELETE` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// SET key value [EX ttl] - insert or overwrite a key
    Set {
        key: String,
        value: String,
        /// Time-to-live in whole seconds, if any
        ttl: Option<u64>,
    },
    /// DELETE key - remove a key entirely (no tombstone)
    Delete { key: String },
}

/// A parsed client request: either a mutation or a read.
///
/// `GET` is client-only; it never appears in the log or on the
/// replication stream, so it is not a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Command(Command),
    Get { key: String },
}

/// One client response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    /// A `GET` hit; the value itself is the response line
    Value(String),
    Null,
    NotFound,
    Error(String),
}

/// A line that does not form a valid command.
///
/// During log replay the offending line is skipped, on the replication
/// stream it is ignored, and a client gets it back as `ERROR: <msg>`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0}")]
    MissingArgument(&'static str),
    #[error("invalid TTL: {0}")]
    BadTtl(String),
    #[error("unterminated quote")]
    UnterminatedQuote,
    #[error("dangling escape at end of line")]
    DanglingEscape,
}

impl Command {
    /// Decode one log/replication line.
    ///
    /// Splits on whitespace. For `SET`, the value is every token after the
    /// key up to a literal `EX` sentinel (or end of line), re-joined with
    /// single spaces; an integer TTL may follow `EX`. Known limitation: a
    /// value cannot contain the standalone token `EX`, since the first
    /// occurrence is always taken as the TTL sentinel. A trailing `EX`
    /// with nothing after it is consumed and yields no TTL.
    pub fn decode(line: &str) -> Result<Command, ProtocolError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        Self::from_tokens(&tokens)
    }

    /// Build a command from pre-split tokens (shared with the client
    /// request parser, which tokenizes with quoting rules instead).
    fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<Command, ProtocolError> {
        let Some(first) = tokens.first() else {
            return Err(ProtocolError::Empty);
        };
        match first.as_ref() {
            "SET" => {
                if tokens.len() < 3 {
                    return Err(ProtocolError::MissingArgument(
                        "SET requires a key and a value",
                    ));
                }
                let key = tokens[1].as_ref().to_string();

                // Value tokens run until the EX sentinel or end of line.
                let mut value = String::new();
                let mut i = 2;
                while i < tokens.len() {
                    let tok = tokens[i].as_ref();
                    if tok == "EX" {
                        break;
                    }
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(tok);
                    i += 1;
                }

                let mut ttl = None;
                if i < tokens.len() && i + 1 < tokens.len() {
                    let raw = tokens[i + 1].as_ref();
                    ttl = Some(
                        raw.parse::<u64>()
                            .map_err(|_| ProtocolError::BadTtl(raw.to_string()))?,
                    );
                }

                Ok(Command::Set { key, value, ttl })
            }
            "DELETE" => {
                if tokens.len() < 2 {
                    return Err(ProtocolError::MissingArgument("DELETE requires a key"));
                }
                Ok(Command::Delete {
                    key: tokens[1].as_ref().to_string(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    /// Encode the line form (no trailing newline; writers frame lines).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { key, value, ttl } => {
                write!(f, "SET {} {}", key, value)?;
                if let Some(t) = ttl {
                    write!(f, " EX {}", t)?;
                }
                Ok(())
            }
            Command::Delete { key } => write!(f, "DELETE {}", key),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok => f.write_str("OK"),
            Response::Value(v) => f.write_str(v),
            Response::Null => f.write_str("NULL"),
            Response::NotFound => f.write_str("NOT_FOUND"),
            Response::Error(msg) => write!(f, "ERROR: {}", msg),
        }
    }
}

/// Parse one client request line.
///
/// Unlike [`Command::decode`], client input is tokenized with support for
/// double-quoted substrings and backslash escapes, so keys and values may
/// contain spaces when quoted. `GET` is accepted here and only here.
pub fn parse_request(line: &str) -> Result<Request, ProtocolError> {
    let tokens = tokenize(line)?;
    let Some(first) = tokens.first() else {
        return Err(ProtocolError::Empty);
    };
    match first.as_str() {
        "GET" => {
            if tokens.len() < 2 {
                return Err(ProtocolError::MissingArgument("GET requires a key"));
            }
            Ok(Request::Get {
                key: tokens[1].clone(),
            })
        }
        "SET" => {
            let cmd = Command::from_tokens(&tokens)?;
            // The client grammar requires a real value token; an empty
            // value would encode to a line the codec cannot re-read.
            if let Command::Set { value, .. } = &cmd {
                if value.is_empty() {
                    return Err(ProtocolError::MissingArgument(
                        "SET requires a key and a value",
                    ));
                }
            }
            Ok(Request::Command(cmd))
        }
        "DELETE" => Ok(Request::Command(Command::from_tokens(&tokens)?)),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

/// Split a client line into tokens, honoring double quotes and backslash
/// escapes (`\"`, `\\`, `\n`, `\t`; any other escaped byte is itself).
fn tokenize(line: &str) -> Result<Vec<String>, ProtocolError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false; // a token is being built (may be empty, e.g. "")
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                let Some(escaped) = chars.next() else {
                    return Err(ProtocolError::DanglingEscape);
                };
                current.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                pending = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending {
                    tokens.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => {
                current.push(c);
                pending = true;
            }
        }
    }
    if in_quotes {
        return Err(ProtocolError::UnterminatedQuote);
    }
    if pending {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_plain_and_quoted() {
        assert_eq!(
            tokenize("SET a b").unwrap(),
            vec!["SET".to_string(), "a".into(), "b".into()]
        );
        assert_eq!(
            tokenize(r#"SET "big key" "a b c""#).unwrap(),
            vec!["SET".to_string(), "big key".into(), "a b c".into()]
        );
        // quotes can open mid-token
        assert_eq!(tokenize(r#"a"b c"d"#).unwrap(), vec!["ab cd".to_string()]);
    }

    #[test]
    fn tokenize_escapes() {
        assert_eq!(
            tokenize(r#"say \"hi\""#).unwrap(),
            vec!["say".to_string(), "\"hi\"".into()]
        );
        assert_eq!(tokenize(r"a\nb").unwrap(), vec!["a\nb".to_string()]);
        assert_eq!(tokenize(r"a\\b").unwrap(), vec![r"a\b".to_string()]);
    }

    #[test]
    fn tokenize_errors() {
        assert_eq!(tokenize(r#""open"#), Err(ProtocolError::UnterminatedQuote));
        assert_eq!(tokenize(r"end\"), Err(ProtocolError::DanglingEscape));
    }

    #[test]
    fn request_rejects_empty_value() {
        assert!(matches!(
            parse_request(r#"SET k """#),
            Err(ProtocolError::MissingArgument(_))
        ));
    }
}
