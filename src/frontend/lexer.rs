use crate::frontend::token::{Token, KEYWORDS};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Span {
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

#[derive(Debug)]
pub struct LexerError {
    pub message: String,
    pub line: usize,
}

impl std::fmt::Display for LexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Tokenizer for the hybrid dialect.
///
/// The lexer recognizes both block styles at once: with `python_mode` on it
/// tracks leading indentation and emits `Indent`/`Dedent` markers, while
/// brace tokens pass through unchanged so C-style blocks keep working in
/// the same file. F-string literals are decomposed here, by re-lexing each
/// interpolation expression recursively.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    python_mode: bool,
    indent_stack: Vec<usize>,
    at_line_start: bool,
}

impl Lexer {
    pub fn new(source: &str, python_mode: bool) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            python_mode,
            indent_stack: vec![0],
            at_line_start: true,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.source.get(self.pos + 2).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.at_line_start = true;
        }
        self.pos += 1;
        ch
    }

    fn spanned(&self, token: Token) -> Spanned {
        Spanned {
            token,
            span: Span { line: self.line },
        }
    }

    fn error(&self, message: impl Into<String>) -> LexerError {
        LexerError {
            message: message.into(),
            line: self.line,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexerError> {
        let mut tokens = Vec::new();

        while self.pos < self.source.len() {
            if self.python_mode && self.at_line_start {
                self.handle_indentation(&mut tokens);
                if self.pos >= self.source.len() {
                    break;
                }
            }

            let current = match self.current() {
                Some(c) => c,
                None => break,
            };

            if current.is_whitespace() {
                self.advance();
                continue;
            }

            // Stray preprocessor lines are swallowed here; the real work
            // happens in the preprocessor before lexing.
            if current == '#' {
                self.advance();
                let mut directive = String::new();
                while let Some(c) = self.current() {
                    if c.is_whitespace() {
                        break;
                    }
                    directive.push(c);
                    self.advance();
                }
                if directive == "define" || directive == "include" {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                continue;
            }

            if current == '/' && self.peek() == Some('/') {
                while let Some(c) = self.current() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
                continue;
            }
            if current == '/' && self.peek() == Some('*') {
                self.advance();
                self.advance();
                loop {
                    match self.current() {
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            self.advance();
                            break;
                        }
                        Some(_) => {
                            self.advance();
                        }
                        None => break,
                    }
                }
                continue;
            }

            if current.is_ascii_digit() {
                let tok = self.read_number();
                tokens.push(tok);
            } else if current == '"' {
                if self.peek() == Some('"') && self.peek2() == Some('"') {
                    let tok = self.read_triple_string()?;
                    tokens.push(tok);
                } else {
                    let tok = self.read_string()?;
                    tokens.push(tok);
                }
            } else if current == 'f' && self.peek() == Some('"') {
                self.advance(); // skip 'f'
                self.tokenize_fstring(&mut tokens)?;
            } else if current.is_alphabetic() || current == '_' {
                let tok = self.read_identifier();
                tokens.push(tok);
            } else {
                let tok = self.read_operator();
                tokens.push(tok);
            }
        }

        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            tokens.push(self.spanned(Token::Dedent));
        }
        tokens.push(self.spanned(Token::Eof));
        Ok(tokens)
    }

    /// Measure the leading indent of the current line and adjust the
    /// indent stack. Tabs count as 4 columns; mixed tabs and spaces are
    /// accepted by conversion. Blank and comment-only lines leave the
    /// stack untouched.
    fn handle_indentation(&mut self, tokens: &mut Vec<Spanned>) {
        self.at_line_start = false;

        let mut indent = 0usize;
        while let Some(c) = self.current() {
            match c {
                ' ' => indent += 1,
                '\t' => indent += 4,
                _ => break,
            }
            self.pos += 1;
        }

        // Blank line or comment-only line: no block structure change.
        match self.current() {
            None | Some('\n') | Some('\r') => return,
            Some('/') if self.peek() == Some('/') || self.peek() == Some('*') => return,
            _ => {}
        }

        let top = *self.indent_stack.last().unwrap_or(&0);
        if indent > top {
            self.indent_stack.push(indent);
            tokens.push(self.spanned(Token::Indent(indent)));
        } else {
            while indent < *self.indent_stack.last().unwrap_or(&0) {
                self.indent_stack.pop();
                tokens.push(self.spanned(Token::Dedent));
            }
        }
    }

    /// Decimal integer literal. A trailing `.digits` fragment is consumed
    /// with the literal but truncates: the token keeps the integer prefix.
    fn read_number(&mut self) -> Spanned {
        let mut digits = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.current() == Some('.') && self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        let value = digits.parse::<i64>().unwrap_or(0);
        self.spanned(Token::Int(value))
    }

    fn read_identifier(&mut self) -> Spanned {
        let mut word = String::new();
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }

        // Alternative operator spellings become operator tokens outright.
        let token = match word.as_str() {
            "and" => Token::AndAnd,
            "or" => Token::OrOr,
            "not" => Token::Not,
            "not_eq" => Token::NotEq,
            "bitand" => Token::Amp,
            "bitor" => Token::Pipe,
            "compl" => Token::Tilde,
            "xor" => Token::Caret,
            "and_eq" => Token::AndEq,
            "or_eq" => Token::OrEq,
            "xor_eq" => Token::XorEq,
            _ if KEYWORDS.contains(&word.as_str()) => Token::Keyword(word),
            _ => Token::Ident(word),
        };
        self.spanned(token)
    }

    fn read_string(&mut self) -> Result<Spanned, LexerError> {
        let start_line = self.line;
        self.advance(); // opening quote

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Spanned {
                        token: Token::Str(string),
                        span: Span { line: start_line },
                    });
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        // Unrecognized escapes pass through untouched; C
                        // sources lean on more of them than we interpret.
                        Some(other) => {
                            string.push('\\');
                            string.push(other);
                        }
                        None => {
                            return Err(self.error("unexpected EOF in escape sequence"));
                        }
                    }
                    self.advance();
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexerError {
                        message: "unterminated string literal".to_string(),
                        line: start_line,
                    });
                }
            }
        }
    }

    fn read_triple_string(&mut self) -> Result<Spanned, LexerError> {
        let start_line = self.line;
        self.advance();
        self.advance();
        self.advance();

        let mut string = String::new();
        loop {
            if self.current() == Some('"')
                && self.peek() == Some('"')
                && self.peek2() == Some('"')
            {
                self.advance();
                self.advance();
                self.advance();
                return Ok(Spanned {
                    token: Token::Str(string),
                    span: Span { line: start_line },
                });
            }
            match self.current() {
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexerError {
                        message: "unterminated triple-quoted string".to_string(),
                        line: start_line,
                    });
                }
            }
        }
    }

    /// Decompose an f-string. Plain text becomes `FStringPart` tokens;
    /// each `{...}` interpolation is brace-balanced, re-lexed with a fresh
    /// lexer, and framed by `LBraceExp`/`RBraceExp`.
    fn tokenize_fstring(&mut self, tokens: &mut Vec<Spanned>) -> Result<(), LexerError> {
        let start_line = self.line;
        self.advance(); // opening quote

        let mut part = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('{') => {
                    if !part.is_empty() {
                        tokens.push(self.spanned(Token::FStringPart(std::mem::take(&mut part))));
                    }
                    tokens.push(self.spanned(Token::LBraceExp));
                    self.advance();

                    let mut expr = String::new();
                    let mut depth = 1usize;
                    while depth > 0 {
                        match self.current() {
                            Some('{') => {
                                depth += 1;
                                expr.push('{');
                                self.advance();
                            }
                            Some('}') => {
                                depth -= 1;
                                if depth > 0 {
                                    expr.push('}');
                                }
                                self.advance();
                            }
                            Some(ch) => {
                                expr.push(ch);
                                self.advance();
                            }
                            None => {
                                return Err(LexerError {
                                    message: "unterminated f-string interpolation".to_string(),
                                    line: start_line,
                                });
                            }
                        }
                    }

                    let mut inner = Lexer::new(&expr, self.python_mode);
                    let mut inner_tokens = inner.tokenize()?;
                    while matches!(
                        inner_tokens.last().map(|s| &s.token),
                        Some(Token::Eof) | Some(Token::Dedent)
                    ) {
                        inner_tokens.pop();
                    }
                    tokens.extend(inner_tokens);
                    tokens.push(self.spanned(Token::RBraceExp));
                }
                Some(ch) => {
                    part.push(ch);
                    self.advance();
                }
                None => {
                    return Err(LexerError {
                        message: "unterminated f-string literal".to_string(),
                        line: start_line,
                    });
                }
            }
        }
        if !part.is_empty() {
            tokens.push(self.spanned(Token::FStringPart(part)));
        }
        Ok(())
    }

    fn read_operator(&mut self) -> Spanned {
        let current = self.current().unwrap_or('\0');
        self.pos += 1;

        macro_rules! two {
            ($next:expr, $tok:expr, $fallback:expr) => {
                if self.current() == Some($next) {
                    self.pos += 1;
                    $tok
                } else {
                    $fallback
                }
            };
        }

        let token = match current {
            '+' => match self.current() {
                Some('+') => {
                    self.pos += 1;
                    Token::PlusPlus
                }
                Some('=') => {
                    self.pos += 1;
                    Token::PlusEq
                }
                _ => Token::Plus,
            },
            '-' => match self.current() {
                Some('-') => {
                    self.pos += 1;
                    Token::MinusMinus
                }
                Some('>') => {
                    self.pos += 1;
                    Token::Arrow
                }
                Some('=') => {
                    self.pos += 1;
                    Token::MinusEq
                }
                _ => Token::Minus,
            },
            '*' => two!('=', Token::StarEq, Token::Star),
            '/' => two!('=', Token::SlashEq, Token::Slash),
            '%' => two!('=', Token::PercentEq, Token::Percent),
            '<' => match self.current() {
                Some('<') => {
                    self.pos += 1;
                    two!('=', Token::ShlEq, Token::Shl)
                }
                Some('=') => {
                    self.pos += 1;
                    Token::Le
                }
                _ => Token::Lt,
            },
            '>' => match self.current() {
                Some('>') => {
                    self.pos += 1;
                    two!('=', Token::ShrEq, Token::Shr)
                }
                Some('=') => {
                    self.pos += 1;
                    Token::Ge
                }
                _ => Token::Gt,
            },
            '&' => match self.current() {
                Some('&') => {
                    self.pos += 1;
                    Token::AndAnd
                }
                Some('=') => {
                    self.pos += 1;
                    Token::AndEq
                }
                _ => Token::Amp,
            },
            '|' => match self.current() {
                Some('|') => {
                    self.pos += 1;
                    Token::OrOr
                }
                Some('=') => {
                    self.pos += 1;
                    Token::OrEq
                }
                _ => Token::Pipe,
            },
            '!' => two!('=', Token::NotEq, Token::Not),
            '~' => Token::Tilde,
            '^' => two!('=', Token::XorEq, Token::Caret),
            '.' => Token::Dot,
            '=' => two!('=', Token::EqEq, Token::Eq),
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ':' => two!('=', Token::ColonEq, Token::Colon),
            ';' => Token::Semicolon,
            ',' => Token::Comma,
            other => Token::Unknown(other),
        };
        self.spanned(token)
    }
}
