//! Lexical analysis.
//!
//! The lexer scans the source reader one byte at a time and keeps a single
//! token of lookahead, plus a decoded payload for numbers (`toknum`) and for
//! strings/identifiers (`tokstr`). It tracks the source location and a
//! `newline` flag (set when at least one line feed was consumed before the
//! current token), which the parser uses as an implicit statement
//! terminator.
//!
//! Keyword recognition is explicit prefix matching per first letter,
//! finished with an identifier scan so that `debugger` lexes as one
//! identifier rather than `debug` + `ger`.

use std::rc::Rc;

use crate::error::{CompileError, IssueHandler, Reporter, SourceLoc};
use crate::source::{SourceReader, SOURCE_EOF};

/// Token kinds. Value payloads live on the lexer (`tokstr`, `toknum`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Token {
    Eos,
    Number,
    Str,
    Identifier,

    // keywords
    KwDebug,
    KwDo,
    KwElse,
    KwFalse,
    KwFunc,
    KwFor,
    KwGlobals,
    KwIf,
    KwIn,
    KwNil,
    KwReturn,
    KwThis,
    KwThrow,
    KwTrue,
    KwVar,
    KwWhile,

    // punctuation
    Comma,
    Semicolon,
    Colon,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Bang,
    Assign,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Shl,
    Shr,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Caret,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    FatArrow,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Token::Eos => "end-of-stream",
            Token::Number => "number",
            Token::Str => "string",
            Token::Identifier => "identifier",
            Token::KwDebug => "debug",
            Token::KwDo => "do",
            Token::KwElse => "else",
            Token::KwFalse => "false",
            Token::KwFunc => "func",
            Token::KwFor => "for",
            Token::KwGlobals => "globals",
            Token::KwIf => "if",
            Token::KwIn => "in",
            Token::KwNil => "nil",
            Token::KwReturn => "return",
            Token::KwThis => "this",
            Token::KwThrow => "throw",
            Token::KwTrue => "true",
            Token::KwVar => "var",
            Token::KwWhile => "while",
            Token::Comma => "','",
            Token::Semicolon => "';'",
            Token::Colon => "':'",
            Token::Dot => "'.'",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::LBrace => "'{'",
            Token::RBrace => "'}'",
            Token::Bang => "'!'",
            Token::Assign => "'='",
            Token::EqEq => "'=='",
            Token::NotEq => "'!='",
            Token::Less => "'<'",
            Token::LessEq => "'<='",
            Token::Greater => "'>'",
            Token::GreaterEq => "'>='",
            Token::Shl => "'<<'",
            Token::Shr => "'>>'",
            Token::Amp => "'&'",
            Token::AmpAmp => "'&&'",
            Token::Pipe => "'|'",
            Token::PipePipe => "'||'",
            Token::Caret => "'^'",
            Token::Plus => "'+'",
            Token::Minus => "'-'",
            Token::Star => "'*'",
            Token::Slash => "'/'",
            Token::Percent => "'%'",
            Token::PlusEq => "'+='",
            Token::MinusEq => "'-='",
            Token::StarEq => "'*='",
            Token::SlashEq => "'/='",
            Token::FatArrow => "'=>'",
        };
        write!(f, "{text}")
    }
}

/// Initial capacity of the token string buffer.
const TOKSTR_INITIAL_CAPACITY: usize = 128;

/// The scanner: one token of lookahead over a byte source.
pub struct Lexer<'a> {
    /// The lookahead token.
    pub tok: Token,
    /// Payload of a `Number` lookahead.
    pub toknum: f64,
    /// Payload of a `Str`/`Identifier` lookahead (also the raw scanned text
    /// of punctuation, for diagnostics).
    pub tokstr: Vec<u8>,
    /// At least one newline was consumed before the current lookahead.
    pub newline: bool,
    /// Location of the scanning cursor.
    pub loc: SourceLoc,
    /// Issue sink, shared with the parser.
    pub issues: IssueHandler<'a>,
    source: Box<dyn SourceReader + 'a>,
    curr: i32,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer and scans the first lookahead token.
    pub fn new(
        source_name: &str,
        source: Box<dyn SourceReader + 'a>,
        reporter: Reporter<'a>,
    ) -> Result<Lexer<'a>, CompileError> {
        let mut lexer = Lexer {
            tok: Token::Eos,
            toknum: 0.0,
            tokstr: Vec::with_capacity(TOKSTR_INITIAL_CAPACITY),
            newline: false,
            loc: SourceLoc {
                source_name: Rc::from(source_name),
                line: 1,
                column: 0,
            },
            issues: IssueHandler::new(reporter),
            source,
            curr: 0,
        };
        lexer.skip();
        lexer.scan()?;
        Ok(lexer)
    }

    /// A readable rendering of the current lookahead for error messages.
    pub fn ahead_str(&self) -> String {
        if self.tok == Token::Eos {
            "end-of-stream".to_string()
        } else {
            String::from_utf8_lossy(&self.tokstr).into_owned()
        }
    }

    /// Skips the current byte and returns the next one.
    fn skip(&mut self) -> i32 {
        if self.curr == '\n' as i32 {
            self.loc.line += 1;
            self.loc.column = 0;
        }
        self.loc.column += 1;
        self.curr = self.source.read_byte();
        self.curr
    }

    /// Pushes the current byte onto the token string and skips it.
    fn push(&mut self) -> i32 {
        self.tokstr.push(self.curr as u8);
        self.skip()
    }

    /// Consumes `ch` if it is the current byte.
    fn accept_char(&mut self, ch: u8) -> bool {
        if self.curr == ch as i32 {
            self.push();
            true
        } else {
            false
        }
    }

    /// Consumes as much of `rest` as matches; true if all of it matched.
    fn accept_str(&mut self, rest: &str) -> bool {
        let mut bytes = rest.bytes();
        for b in &mut bytes {
            if self.curr != b as i32 {
                return false;
            }
            self.push();
        }
        true
    }

    fn is_id_char(ch: i32, first: bool) -> bool {
        (ch >= 'A' as i32 && ch <= 'Z' as i32)
            || (ch >= 'a' as i32 && ch <= 'z' as i32)
            || ch == '_' as i32
            || (!first && ch >= '0' as i32 && ch <= '9' as i32)
    }

    /// Scans the remainder of an identifier; leaves `tok` untouched if no
    /// identifier character follows (so a fully-matched keyword stays a
    /// keyword).
    fn scan_id(&mut self, mut first: bool) -> Token {
        while Lexer::is_id_char(self.curr, first) {
            self.push();
            self.tok = Token::Identifier;
            first = false;
        }
        self.tok
    }

    /// Scans the next token into the lookahead and returns it.
    pub fn scan(&mut self) -> Result<Token, CompileError> {
        self.tok = Token::Eos;
        self.tokstr.clear();

        loop {
            match self.curr {
                SOURCE_EOF => return Ok(Token::Eos),

                c if c == '\n' as i32 => {
                    self.newline = true;
                    self.skip();
                }
                c if c == ' ' as i32 || c == '\r' as i32 || c == '\t' as i32 => {
                    self.skip();
                }

                c if c == ',' as i32 => return Ok(self.punct(Token::Comma)),
                c if c == ';' as i32 => return Ok(self.punct(Token::Semicolon)),
                c if c == ':' as i32 => return Ok(self.punct(Token::Colon)),
                c if c == '(' as i32 => return Ok(self.punct(Token::LParen)),
                c if c == ')' as i32 => return Ok(self.punct(Token::RParen)),
                c if c == '[' as i32 => return Ok(self.punct(Token::LBracket)),
                c if c == ']' as i32 => return Ok(self.punct(Token::RBracket)),
                c if c == '{' as i32 => return Ok(self.punct(Token::LBrace)),
                c if c == '}' as i32 => return Ok(self.punct(Token::RBrace)),
                c if c == '^' as i32 => return Ok(self.punct(Token::Caret)),
                c if c == '%' as i32 => return Ok(self.punct(Token::Percent)),

                // strings
                c if c == '"' as i32 || c == '\'' as i32 => {
                    let delimiter = self.curr;
                    self.skip();
                    while self.curr != SOURCE_EOF && self.curr != delimiter {
                        self.push();
                    }
                    if self.curr != delimiter {
                        let loc = self.loc.clone();
                        return Err(self
                            .issues
                            .error(&loc, "end-of-stream while scanning string."));
                    }
                    self.skip();
                    self.tok = Token::Str;
                    return Ok(self.tok);
                }

                // numbers, optionally starting with a dot
                c if c == '.' as i32 || (c >= '0' as i32 && c <= '9' as i32) => {
                    let mut decimal = false;
                    if self.curr == '.' as i32 {
                        self.push();
                        if self.curr < '0' as i32 || self.curr > '9' as i32 {
                            self.tok = Token::Dot;
                            return Ok(self.tok);
                        }
                        decimal = true;
                    }
                    if !decimal {
                        while self.curr >= '0' as i32 && self.curr <= '9' as i32 {
                            self.push();
                        }
                        if self.curr == '.' as i32 {
                            self.push();
                            decimal = true;
                        }
                    }
                    if decimal {
                        while self.curr >= '0' as i32 && self.curr <= '9' as i32 {
                            self.push();
                        }
                    }
                    if self.curr == 'e' as i32 {
                        self.push();
                        while self.curr >= '0' as i32 && self.curr <= '9' as i32 {
                            self.push();
                        }
                    }
                    self.toknum = String::from_utf8_lossy(&self.tokstr)
                        .parse::<f64>()
                        .unwrap_or(0.0);
                    self.tok = Token::Number;
                    return Ok(self.tok);
                }

                c if c == '!' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::NotEq
                    } else {
                        Token::Bang
                    };
                    return Ok(self.tok);
                }
                c if c == '&' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'&') {
                        Token::AmpAmp
                    } else {
                        Token::Amp
                    };
                    return Ok(self.tok);
                }
                c if c == '|' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'|') {
                        Token::PipePipe
                    } else {
                        Token::Pipe
                    };
                    return Ok(self.tok);
                }
                c if c == '=' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::EqEq
                    } else if self.accept_char(b'>') {
                        Token::FatArrow
                    } else {
                        Token::Assign
                    };
                    return Ok(self.tok);
                }
                c if c == '<' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::LessEq
                    } else if self.accept_char(b'<') {
                        Token::Shl
                    } else {
                        Token::Less
                    };
                    return Ok(self.tok);
                }
                c if c == '>' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::GreaterEq
                    } else if self.accept_char(b'>') {
                        Token::Shr
                    } else {
                        Token::Greater
                    };
                    return Ok(self.tok);
                }
                c if c == '+' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::PlusEq
                    } else {
                        Token::Plus
                    };
                    return Ok(self.tok);
                }
                c if c == '-' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::MinusEq
                    } else {
                        Token::Minus
                    };
                    return Ok(self.tok);
                }
                c if c == '*' as i32 => {
                    self.push();
                    self.tok = if self.accept_char(b'=') {
                        Token::StarEq
                    } else {
                        Token::Star
                    };
                    return Ok(self.tok);
                }
                c if c == '/' as i32 => {
                    self.push();
                    if self.accept_char(b'=') {
                        self.tok = Token::SlashEq;
                        return Ok(self.tok);
                    } else if self.curr == '/' as i32 {
                        // line comment
                        self.skip();
                        self.tokstr.clear();
                        while self.curr != '\n' as i32 && self.curr != SOURCE_EOF {
                            self.skip();
                        }
                    } else if self.curr == '*' as i32 {
                        // block comment (no nesting)
                        self.tokstr.clear();
                        loop {
                            self.skip();
                            while self.curr != '*' as i32 && self.curr != SOURCE_EOF {
                                self.skip();
                            }
                            if self.curr == SOURCE_EOF {
                                let loc = self.loc.clone();
                                return Err(self.issues.error(
                                    &loc,
                                    "end-of-stream found while scanning comment block.",
                                ));
                            }
                            self.skip();
                            if self.curr == '/' as i32 {
                                break;
                            }
                        }
                        self.skip();
                    } else {
                        self.tok = Token::Slash;
                        return Ok(self.tok);
                    }
                }

                // keywords, by first letter, finished with an identifier scan
                c if c == 'd' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    match self.curr {
                        c if c == 'e' as i32 => {
                            self.push();
                            if self.accept_str("bug") {
                                self.tok = Token::KwDebug;
                            }
                        }
                        c if c == 'o' as i32 => {
                            self.push();
                            self.tok = Token::KwDo;
                        }
                        _ => {}
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'e' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_str("lse") {
                        self.tok = Token::KwElse;
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'f' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    match self.curr {
                        c if c == 'a' as i32 => {
                            self.push();
                            if self.accept_str("lse") {
                                self.tok = Token::KwFalse;
                            }
                        }
                        c if c == 'o' as i32 => {
                            self.push();
                            if self.accept_str("r") {
                                self.tok = Token::KwFor;
                            }
                        }
                        c if c == 'u' as i32 => {
                            self.push();
                            if self.accept_str("nc") {
                                self.tok = Token::KwFunc;
                            }
                        }
                        _ => {}
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'g' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_str("lobals") {
                        self.tok = Token::KwGlobals;
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'i' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    match self.curr {
                        c if c == 'f' as i32 => {
                            self.push();
                            self.tok = Token::KwIf;
                        }
                        c if c == 'n' as i32 => {
                            self.push();
                            self.tok = Token::KwIn;
                        }
                        _ => {}
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'n' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_char(b'i') && self.accept_char(b'l') {
                        self.tok = Token::KwNil;
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'r' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_str("eturn") {
                        self.tok = Token::KwReturn;
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 't' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    match self.curr {
                        c if c == 'h' as i32 => {
                            self.push();
                            if self.curr == 'r' as i32 {
                                self.push();
                                if self.accept_str("ow") {
                                    self.tok = Token::KwThrow;
                                }
                            } else if self.accept_str("is") {
                                self.tok = Token::KwThis;
                            }
                        }
                        c if c == 'r' as i32 => {
                            self.push();
                            if self.accept_str("ue") {
                                self.tok = Token::KwTrue;
                            }
                        }
                        _ => {}
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'v' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_str("ar") {
                        self.tok = Token::KwVar;
                    }
                    return Ok(self.scan_id(false));
                }
                c if c == 'w' as i32 => {
                    self.push();
                    self.tok = Token::Identifier;
                    if self.accept_str("hile") {
                        self.tok = Token::KwWhile;
                    }
                    return Ok(self.scan_id(false));
                }

                _ => {
                    self.scan_id(true);
                    if self.tok != Token::Identifier {
                        let ch = self.curr;
                        let loc = self.loc.clone();
                        return Err(self.issues.error(
                            &loc,
                            format!(
                                "unexpected character '{}' found.",
                                char::from_u32(ch.max(0) as u32).unwrap_or('?')
                            ),
                        ));
                    }
                    return Ok(self.tok);
                }
            }
        }
    }

    fn punct(&mut self, tok: Token) -> Token {
        self.tok = tok;
        self.push();
        tok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StrSource;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut sink = |_: &SourceLoc, _: &str| {};
        let mut lexer =
            Lexer::new("<test>", Box::new(StrSource::new(source)), &mut sink).unwrap();
        let mut toks = vec![lexer.tok];
        while lexer.tok != Token::Eos {
            lexer.scan().unwrap();
            toks.push(lexer.tok);
        }
        toks
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            lex_all("var debug debugger fortune if ifx"),
            vec![
                Token::KwVar,
                Token::KwDebug,
                Token::Identifier,
                Token::Identifier,
                Token::KwIf,
                Token::Identifier,
                Token::Eos
            ]
        );
    }

    #[test]
    fn multi_character_punctuation() {
        assert_eq!(
            lex_all("== != <= >= << >> && || += -= *= /= => = < >"),
            vec![
                Token::EqEq,
                Token::NotEq,
                Token::LessEq,
                Token::GreaterEq,
                Token::Shl,
                Token::Shr,
                Token::AmpAmp,
                Token::PipePipe,
                Token::PlusEq,
                Token::MinusEq,
                Token::StarEq,
                Token::SlashEq,
                Token::FatArrow,
                Token::Assign,
                Token::Less,
                Token::Greater,
                Token::Eos
            ]
        );
    }

    #[test]
    fn numbers() {
        let mut sink = |_: &SourceLoc, _: &str| {};
        let mut lexer = Lexer::new(
            "<test>",
            Box::new(StrSource::new("42 3.25 .5 1e3")),
            &mut sink,
        )
        .unwrap();
        assert_eq!(lexer.tok, Token::Number);
        assert_eq!(lexer.toknum, 42.0);
        lexer.scan().unwrap();
        assert_eq!(lexer.toknum, 3.25);
        lexer.scan().unwrap();
        assert_eq!(lexer.toknum, 0.5);
        lexer.scan().unwrap();
        assert_eq!(lexer.toknum, 1000.0);
    }

    #[test]
    fn strings_and_both_delimiters() {
        let mut sink = |_: &SourceLoc, _: &str| {};
        let mut lexer = Lexer::new(
            "<test>",
            Box::new(StrSource::new("\"hi\" 'there'")),
            &mut sink,
        )
        .unwrap();
        assert_eq!(lexer.tok, Token::Str);
        assert_eq!(lexer.tokstr, b"hi");
        lexer.scan().unwrap();
        assert_eq!(lexer.tokstr, b"there");
    }

    #[test]
    fn unterminated_string_is_fatal() {
        let mut reported = false;
        let mut sink = |_: &SourceLoc, _: &str| reported = true;
        let result = Lexer::new("<test>", Box::new(StrSource::new("\"oops")), &mut sink);
        let is_err = result.is_err();
        drop(result);
        assert!(is_err);
        assert!(reported);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            lex_all("1 // comment\n2 /* block\nstill */ 3"),
            vec![Token::Number, Token::Number, Token::Number, Token::Eos]
        );
    }

    #[test]
    fn unterminated_block_comment_is_fatal() {
        let mut sink = |_: &SourceLoc, _: &str| {};
        let mut lexer =
            Lexer::new("<test>", Box::new(StrSource::new("1 /* never")), &mut sink).unwrap();
        assert!(lexer.scan().is_err());
    }

    #[test]
    fn newline_flag_marks_statement_boundaries() {
        let mut sink = |_: &SourceLoc, _: &str| {};
        let mut lexer =
            Lexer::new("<test>", Box::new(StrSource::new("a\nb c")), &mut sink).unwrap();
        assert!(!lexer.newline);
        lexer.newline = false;
        lexer.scan().unwrap(); // b, after a newline
        assert!(lexer.newline);
        lexer.newline = false;
        lexer.scan().unwrap(); // c, same line
        assert!(!lexer.newline);
    }

    #[test]
    fn dot_alone_is_a_dot() {
        assert_eq!(
            lex_all("a.b"),
            vec![Token::Identifier, Token::Dot, Token::Identifier, Token::Eos]
        );
    }
}
