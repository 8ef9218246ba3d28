//! MPD wire protocol primitives
//!
//! Request tokenizing (MPD quoting rules), ACK error frames, and the
//! `key: value` response blocks every command answers with. Terminator
//! lines (`OK`, `list_OK`) are appended by the session layer.

use std::fmt;
use std::fmt::Write as _;
use thiserror::Error;

/// Greeting sent to every client on connect. The version advertises the
/// protocol level this bridge emulates, not a real MPD release.
pub const GREETING: &str = "OK MPD 0.16.0";

/// Error classes from the MPD ACK grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    NotList = 1,
    Argument = 2,
    Password = 3,
    Permission = 4,
    UnknownCommand = 5,
    NoExist = 50,
    PlaylistMax = 51,
    System = 52,
    PlaylistLoad = 53,
    UpdateAlready = 54,
    PlayerSync = 55,
    Exist = 56,
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// A failed command, rendered on the wire as
/// `ACK [<code>@<index>] {<command>} <message>`.
///
/// `index` is the position of the failing command within a command list;
/// it stays 0 for standalone commands.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("ACK [{code}@{index}] {{{command}}} {message}")]
pub struct Ack {
    pub code: AckCode,
    pub index: usize,
    pub command: String,
    pub message: String,
}

impl Ack {
    pub fn new(code: AckCode, command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            index: 0,
            command: command.into(),
            message: message.into(),
        }
    }

    /// Re-home the error at a command-list index.
    pub fn at_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TokenizeError {
    #[error("unterminated quoted argument")]
    UnterminatedQuote,
    #[error("space expected after closing quote")]
    MissingSpaceAfterQuote,
}

/// Split a request line into tokens.
///
/// Words are separated by spaces or tabs. Double quotes group words into
/// one token; inside quotes a backslash escapes the next character, so
/// `\"` and `\\` produce literal `"` and `\`.
pub fn tokenize(line: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(' ') | Some('\t')) {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        if first == '"' {
            chars.next();
            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(escaped) => token.push(escaped),
                        None => return Err(TokenizeError::UnterminatedQuote),
                    },
                    Some('"') => break,
                    Some(c) => token.push(c),
                    None => return Err(TokenizeError::UnterminatedQuote),
                }
            }
            if !matches!(chars.peek(), None | Some(' ') | Some('\t')) {
                return Err(TokenizeError::MissingSpaceAfterQuote);
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' || c == '\t' {
                    break;
                }
                chars.next();
                token.push(c);
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}

/// Accumulates the `key: value` body of one response.
#[derive(Debug, Default)]
pub struct Response {
    buf: String,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(&mut self, key: &str, value: impl fmt::Display) {
        // Writing to a String cannot fail
        let _ = writeln!(self.buf, "{}: {}", key, value);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> String {
        self.buf
    }
}
