//! Command string parser.
//!
//! Grammar: `[sigil] name (WS arg)*`. The sigil marks a privileged (or, on
//! the client, local) command. An argument is either a run of alphanumerics
//! and dots or a double-quoted string without escapes. Runs of whitespace
//! between arguments are tolerated. Errors carry the input and the character
//! offset for diagnostic framing.

use thiserror::Error;

use crate::command::Command;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{kind} (at char {position})")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub command: String,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnexpectedEol,
    UnexpectedToken,
    ExpectedSpace,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseErrorKind::UnexpectedEol => write!(f, "Unexpected EOL"),
            ParseErrorKind::UnexpectedToken => write!(f, "Unexpected token"),
            ParseErrorKind::ExpectedSpace => write!(f, "Expected space or EOL"),
        }
    }
}

impl ParseError {
    /// Three-line diagnostic: message, offending input, caret.
    pub fn to_string_frame(&self) -> String {
        format!(
            "ParseError: {}\n{}\n{}^",
            self,
            self.command,
            " ".repeat(self.position)
        )
    }
}

pub struct CommandParser {
    local_symbol: char,
}

impl CommandParser {
    pub fn new(local_symbol: char) -> Self {
        Self { local_symbol }
    }

    pub fn parse(&self, input: &str) -> Result<Command, ParseError> {
        Parsing {
            chars: input.chars().collect(),
            input,
            position: 0,
            local_symbol: self.local_symbol,
        }
        .run()
    }
}

struct Parsing<'a> {
    chars: Vec<char>,
    input: &'a str,
    position: usize,
    local_symbol: char,
}

impl Parsing<'_> {
    fn run(mut self) -> Result<Command, ParseError> {
        self.skip_spaces();
        let local = match self.chars.get(self.position) {
            Some(&c) if c == self.local_symbol => {
                self.position += 1;
                true
            }
            Some(_) => false,
            None => return Err(self.error(ParseErrorKind::UnexpectedEol)),
        };

        let name = self.expect_section()?;
        let mut arguments = Vec::new();
        loop {
            self.skip_spaces();
            if self.position >= self.chars.len() {
                break;
            }
            arguments.push(self.expect_section()?);
        }

        Ok(Command {
            raw: self.input.to_string(),
            name,
            args: arguments,
            local,
        })
    }

    fn skip_spaces(&mut self) {
        while matches!(self.chars.get(self.position), Some(c) if c.is_whitespace()) {
            self.position += 1;
        }
    }

    fn expect_section(&mut self) -> Result<String, ParseError> {
        let Some(&first) = self.chars.get(self.position) else {
            return Err(self.error(ParseErrorKind::UnexpectedEol));
        };

        let token = if first == '"' {
            self.quoted_string()?
        } else if first.is_alphanumeric() || first == '.' {
            self.identifier()
        } else {
            return Err(self.error(ParseErrorKind::UnexpectedToken));
        };

        // A token must end at whitespace or the end of the line.
        match self.chars.get(self.position) {
            None => Ok(token),
            Some(c) if c.is_whitespace() => Ok(token),
            Some(_) => Err(self.error(ParseErrorKind::ExpectedSpace)),
        }
    }

    fn identifier(&mut self) -> String {
        let mut buffer = String::new();
        while let Some(&c) = self.chars.get(self.position) {
            if c.is_alphanumeric() || c == '.' {
                buffer.push(c);
                self.position += 1;
            } else {
                break;
            }
        }
        buffer
    }

    fn quoted_string(&mut self) -> Result<String, ParseError> {
        self.position += 1;
        let mut buffer = String::new();
        loop {
            match self.chars.get(self.position) {
                Some('"') => {
                    self.position += 1;
                    return Ok(buffer);
                }
                Some(&c) => {
                    buffer.push(c);
                    self.position += 1;
                }
                None => return Err(self.error(ParseErrorKind::UnexpectedEol)),
            }
        }
    }

    fn error(&self, kind: ParseErrorKind) -> ParseError {
        ParseError {
            kind,
            command: self.input.to_string(),
            position: self.position,
        }
    }
}
