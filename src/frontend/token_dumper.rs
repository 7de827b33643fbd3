use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints a nicer value for some tokens
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        for s in tokens {
            self.print_one(s);
        }
    }

    fn print_one(&self, s: &Spanned) {
        let line = s.span.line;

        let kind = self.kind(&s.token);
        let colr = if self.color { self.color(&s.token) } else { "" };
        let reset = if self.color { Self::RESET } else { "" };

        if self.show_debug_repr {
            // Uniform: always print Debug token
            println!("[{:03}] {}{:<8} {:?}{}", line, colr, kind, s.token, reset);
        } else {
            println!("[{:03}] {}{:<8} {}{}", line, colr, kind, s.token, reset);
        }
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof => "EOF",
            Indent(_) => "INDENT",
            Dedent => "DEDENT",

            // literals
            Int(_) => "INT",
            Str(_) => "STRING",
            FStringPart(_) => "FSTRING",
            LBraceExp | RBraceExp => "FSTRING",

            // names
            Ident(_) => "IDENT",
            Keyword(_) => "KEYWORD",

            // structure
            LParen | RParen => "PAREN",
            LBracket | RBracket => "BRACKET",
            LBrace | RBrace => "BRACE",
            Comma | Semicolon | Colon | Dot | Arrow => "PUNCT",

            // ops / comparisons
            EqEq | NotEq | Lt | Le | Gt | Ge => "CMP",
            Unknown(_) => "UNKNOWN",
            _ => "OP",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof | Indent(_) | Dedent => Self::DIM,
            Str(_) | FStringPart(_) => Self::GRN,
            Int(_) => Self::CYN,
            Ident(_) => Self::YEL,
            Keyword(_) => Self::RESET,
            EqEq | NotEq | Lt | Le | Gt | Ge => Self::MAG,
            Plus | Minus | Star | Slash | Percent | Dot => Self::MAG,
            _ => Self::RESET,
        }
    }
}
