//! The Flint token set, lexed with [`logos`].

use logos::{Lexer, Logos, Skip};

/// Lexer state threaded through [`Lexer::extras`] to track source lines.
pub struct LexerState {
    pub line: u32,
}

impl Default for LexerState {
    fn default() -> LexerState {
        LexerState { line: 1 }
    }
}

fn newline(lex: &mut Lexer<Token>) -> Skip {
    lex.extras.line += 1;
    Skip
}

/// String literals may span lines; keep the line counter in step.
fn string_literal(lex: &mut Lexer<Token>) -> bool {
    let newlines = lex.slice().bytes().filter(|&b| b == b'\n').count();
    lex.extras.line += newlines as u32;
    true
}

#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq)]
#[logos(extras = LexerState)]
pub enum Token {
    /// Anything no other pattern matches.
    #[error]
    #[regex(r"[ \t\r\f]+", logos::skip)]
    #[regex(r"//[^\n]*", logos::skip)]
    Error,

    /// Never yielded; exists to bump the line counter.
    #[token("\n", newline)]
    Newline,

    /// Synthesized by the scanner once input runs out.
    #[token("\0")]
    Eof,

    // === Punctuation and operators ===
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token(";")]
    Semicolon,
    #[token("/")]
    Slash,
    #[token("*")]
    Star,
    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    // === Keywords ===
    #[token("and")]
    And,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("nil")]
    Nil,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("super")]
    Super,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,

    // === Literals ===
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,
    #[regex(r#""[^"]*""#, string_literal)]
    String,
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,
}

/// A token together with its source text and line.
#[derive(Clone, Copy, Debug)]
pub struct Scanned<'src> {
    pub token: Token,
    pub lexeme: &'src str,
    pub line: u32,
}

pub struct Scanner<'src> {
    lexer: Lexer<'src, Token>,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Scanner<'src> {
        Scanner {
            lexer: Token::lexer(source),
        }
    }

    /// The next token, or an endless stream of [`Token::Eof`] once the
    /// input is exhausted.
    pub fn next_token(&mut self) -> Scanned<'src> {
        match self.lexer.next() {
            Some(token) => Scanned {
                token,
                lexeme: self.lexer.slice(),
                line: self.lexer.extras.line,
            },
            None => Scanned {
                token: Token::Eof,
                lexeme: "",
                line: self.lexer.extras.line,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(source);
        let mut out = Vec::new();
        loop {
            let scanned = scanner.next_token();
            if scanned.token == Token::Eof {
                return out;
            }
            out.push(scanned.token);
        }
    }

    #[test]
    fn keywords_beat_identifiers() {
        assert_eq!(
            kinds("class classy var variable"),
            vec![Token::Class, Token::Identifier, Token::Var, Token::Identifier]
        );
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds("= == ! != < <= > >="),
            vec![
                Token::Equal,
                Token::EqualEqual,
                Token::Bang,
                Token::BangEqual,
                Token::Less,
                Token::LessEqual,
                Token::Greater,
                Token::GreaterEqual,
            ]
        );
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        assert_eq!(
            kinds("1 // the rest is noise\n+ 2"),
            vec![Token::Number, Token::Plus, Token::Number]
        );
    }

    #[test]
    fn lines_are_tracked() {
        let mut scanner = Scanner::new("a\nb\n\nc");
        assert_eq!(scanner.next_token().line, 1);
        assert_eq!(scanner.next_token().line, 2);
        assert_eq!(scanner.next_token().line, 4);
    }

    #[test]
    fn strings_may_span_lines() {
        let mut scanner = Scanner::new("\"one\ntwo\" x");
        let s = scanner.next_token();
        assert_eq!(s.token, Token::String);
        assert_eq!(s.lexeme, "\"one\ntwo\"");
        assert_eq!(scanner.next_token().line, 2);
    }

    #[test]
    fn unexpected_characters_become_error_tokens() {
        assert_eq!(kinds("1 @ 2"), vec![Token::Number, Token::Error, Token::Number]);
    }
}
