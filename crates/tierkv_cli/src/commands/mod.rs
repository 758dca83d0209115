//! Shell command parsing.
//!
//! One command per line, words separated by whitespace:
//!
//! - `START_TXN <client_id>`
//! - `TXN_GET <txn_id> <key>`
//! - `TXN_PUT <txn_id> <key> <value>`
//! - `COMMIT_TXN <txn_id>`

pub mod shell;

use thiserror::Error;

/// A parsed shell command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin a transaction for a client.
    StartTxn {
        /// Client id; also the routing key.
        client_id: String,
    },
    /// Read a key inside a transaction.
    Get {
        /// Transaction id.
        txn_id: String,
        /// Key to read.
        key: String,
    },
    /// Write a key inside a transaction.
    Put {
        /// Transaction id.
        txn_id: String,
        /// Key to write.
        key: String,
        /// Value to write.
        value: String,
    },
    /// Commit a transaction.
    Commit {
        /// Transaction id.
        txn_id: String,
    },
}

/// Result of parsing one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Blank input; the shell exits.
    Exit,
    /// A command to execute.
    Command(Command),
    /// A word that names no command.
    Unknown(String),
}

/// A command was given the wrong number of arguments.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command} expects {expected} argument(s), got {got}")]
pub struct UsageError {
    /// The command word.
    pub command: &'static str,
    /// Arguments the command takes.
    pub expected: usize,
    /// Arguments supplied.
    pub got: usize,
}

fn arity(command: &'static str, args: &[&str], expected: usize) -> Result<(), UsageError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(UsageError {
            command,
            expected,
            got: args.len(),
        })
    }
}

/// Parses one input line.
pub fn parse(input: &str) -> Result<Line, UsageError> {
    let words: Vec<&str> = input.split_whitespace().collect();
    let Some((&word, args)) = words.split_first() else {
        return Ok(Line::Exit);
    };

    let command = match word {
        "START_TXN" => {
            arity("START_TXN", args, 1)?;
            Command::StartTxn {
                client_id: args[0].to_string(),
            }
        }
        "TXN_GET" => {
            arity("TXN_GET", args, 2)?;
            Command::Get {
                txn_id: args[0].to_string(),
                key: args[1].to_string(),
            }
        }
        "TXN_PUT" => {
            arity("TXN_PUT", args, 3)?;
            Command::Put {
                txn_id: args[0].to_string(),
                key: args[1].to_string(),
                value: args[2].to_string(),
            }
        }
        "COMMIT_TXN" => {
            arity("COMMIT_TXN", args, 1)?;
            Command::Commit {
                txn_id: args[0].to_string(),
            }
        }
        other => return Ok(Line::Unknown(other.to_string())),
    };
    Ok(Line::Command(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(
            parse("START_TXN alice").unwrap(),
            Line::Command(Command::StartTxn {
                client_id: "alice".into()
            })
        );
        assert_eq!(
            parse("TXN_GET alice-1:2 k").unwrap(),
            Line::Command(Command::Get {
                txn_id: "alice-1:2".into(),
                key: "k".into()
            })
        );
        assert_eq!(
            parse("  TXN_PUT alice-1:2 k v  ").unwrap(),
            Line::Command(Command::Put {
                txn_id: "alice-1:2".into(),
                key: "k".into(),
                value: "v".into()
            })
        );
        assert_eq!(
            parse("COMMIT_TXN alice-1:2").unwrap(),
            Line::Command(Command::Commit {
                txn_id: "alice-1:2".into()
            })
        );
    }

    #[test]
    fn blank_line_exits() {
        assert_eq!(parse("").unwrap(), Line::Exit);
        assert_eq!(parse("   \t").unwrap(), Line::Exit);
    }

    #[test]
    fn wrong_argument_count_is_rejected() {
        let err = parse("TXN_PUT alice-1:2 k").unwrap_err();
        assert_eq!(err.expected, 3);
        assert_eq!(err.got, 2);
        assert_eq!(err.to_string(), "TXN_PUT expects 3 argument(s), got 2");

        assert!(parse("START_TXN").is_err());
        assert!(parse("COMMIT_TXN a b").is_err());
    }

    #[test]
    fn unknown_words_are_reported() {
        assert_eq!(parse("GET k").unwrap(), Line::Unknown("GET".into()));
    }
}
