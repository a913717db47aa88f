//! Compile-error values collected by the parser.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    /// No token to point at (an unrecognized character).
    Bare,
    /// The offending token's text.
    Token(String),
    /// The error was detected at end of input.
    Eof,
}

/// One diagnostic. Built where the parser detects the problem, rendered
/// `[line N] Error at 'tok': message` when reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    line: u32,
    location: Location,
    message: String,
}

impl CompileError {
    pub fn new(line: u32, message: impl Into<String>) -> CompileError {
        CompileError {
            line,
            location: Location::Bare,
            message: message.into(),
        }
    }

    pub fn at_token(mut self, lexeme: &str) -> Self {
        self.location = Location::Token(lexeme.to_owned());
        self
    }

    pub fn at_eof(mut self) -> Self {
        self.location = Location::Eof;
        self
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Location::Bare => {}
            Location::Token(lexeme) => write!(f, " at '{}'", lexeme)?,
            Location::Eof => write!(f, " at end")?,
        }
        write!(f, ": {}", self.message)
    }
}

#[cfg(test)]
mod test {
    use super::CompileError;

    #[test]
    fn rendering() {
        assert_eq!(
            CompileError::new(3, "Expect expression.")
                .at_token("+")
                .to_string(),
            "[line 3] Error at '+': Expect expression."
        );
        assert_eq!(
            CompileError::new(7, "Expect ';' after value.")
                .at_eof()
                .to_string(),
            "[line 7] Error at end: Expect ';' after value."
        );
        assert_eq!(
            CompileError::new(1, "Unexpected character.").to_string(),
            "[line 1] Error: Unexpected character."
        );
    }
}
