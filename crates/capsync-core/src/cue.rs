//! Parser for the subset of CUE used by capability templates.
//!
//! Produces a syntax tree only; nothing is evaluated here. Package clauses,
//! imports, `let` clauses, comprehensions and attributes are parsed and
//! dropped. Doc comments directly above a field are kept on the field.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct CueError {
    /// 1-based source line.
    pub line: usize,
    pub message: String,
}

impl CueError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CueError>;

// --- Syntax tree ---

/// A struct literal, or the top level of a file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructLit {
    pub fields: Vec<Field>,
    /// Embedded expressions such as `#Base` or `close({...})`.
    pub embeds: Vec<Expr>,
    /// Set when the struct contains `...`.
    pub open: bool,
}

impl StructLit {
    /// First regular field with the given name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.label.name() == Some(name))
    }

    /// First field, regular or definition, whose label text matches `name`.
    pub fn lookup(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.label.text() == Some(name))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub label: Label,
    /// Marked with `?`.
    pub optional: bool,
    pub value: Expr,
    /// Comment lines directly above the field, without the `//` marker.
    pub docs: Vec<String>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Label {
    Regular(String),
    /// `#Name`
    Definition(String),
    /// `_name` or `_#Name`
    Hidden(String),
    /// `[pattern]: value`
    Pattern(Box<Expr>),
    /// `(expr): value`
    Dynamic(Box<Expr>),
}

impl Label {
    fn from_ident(name: String) -> Self {
        if name.starts_with('#') {
            Self::Definition(name)
        } else if name.starts_with('_') && name.len() > 1 {
            Self::Hidden(name)
        } else {
            Self::Regular(name)
        }
    }

    /// Name of a regular field.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Regular(name) => Some(name),
            _ => None,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Self::Regular(name) | Self::Definition(name) | Self::Hidden(name) => Some(name),
            Self::Pattern(_) | Self::Dynamic(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Struct(StructLit),
    List {
        elems: Vec<Expr>,
        /// Element type of an open list (`[...T]`).
        tail: Option<Box<Expr>>,
    },
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(String),
    /// String containing `\(...)`; never concrete.
    Interpolation(String),
    /// `_|_`
    Bottom,
    Ident(String),
    Selector(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Disjunction(Vec<Disjunct>),
    Conjunction(Vec<Expr>),
    /// `for`/`if` comprehension; only its presence is recorded.
    Comprehension,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Disjunct {
    /// Marked with `*`.
    pub default: bool,
    pub expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// `*` default marker.
    Default,
    Neg,
    Pos,
    Not,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    Match,
    NotMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq
            | Self::Ne
            | Self::Lt
            | Self::Le
            | Self::Gt
            | Self::Ge
            | Self::Match
            | Self::NotMatch => 3,
            Self::Add | Self::Sub => 4,
            Self::Mul | Self::Div => 5,
        }
    }
}

/// Parse a CUE source file into its top-level struct.
pub fn parse(source: &str) -> Result<StructLit> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let file = parser.parse_struct_body(true)?;
    Ok(file)
}

// --- Lexer ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Punct {
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
    Question,
    Bang,
    Star,
    Pipe,
    Amp,
    Dot,
    Ellipsis,
    Assign,
    Plus,
    Minus,
    Slash,
    OrOr,
    AndAnd,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
}

impl Punct {
    fn as_str(self) -> &'static str {
        match self {
            Self::LBrace => "{",
            Self::RBrace => "}",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::Colon => ":",
            Self::Comma => ",",
            Self::Question => "?",
            Self::Bang => "!",
            Self::Star => "*",
            Self::Pipe => "|",
            Self::Amp => "&",
            Self::Dot => ".",
            Self::Ellipsis => "...",
            Self::Assign => "=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Slash => "/",
            Self::OrOr => "||",
            Self::AndAnd => "&&",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Match => "=~",
            Self::NotMatch => "!~",
        }
    }
}

// Longest operators first.
const OPERATORS: [(&str, Punct); 29] = [
    ("...", Punct::Ellipsis),
    ("||", Punct::OrOr),
    ("&&", Punct::AndAnd),
    ("==", Punct::EqEq),
    ("!=", Punct::NotEq),
    ("<=", Punct::Le),
    (">=", Punct::Ge),
    ("=~", Punct::Match),
    ("!~", Punct::NotMatch),
    ("{", Punct::LBrace),
    ("}", Punct::RBrace),
    ("[", Punct::LBracket),
    ("]", Punct::RBracket),
    ("(", Punct::LParen),
    (")", Punct::RParen),
    (":", Punct::Colon),
    (",", Punct::Comma),
    ("?", Punct::Question),
    ("!", Punct::Bang),
    ("*", Punct::Star),
    ("|", Punct::Pipe),
    ("&", Punct::Amp),
    (".", Punct::Dot),
    ("=", Punct::Assign),
    ("+", Punct::Plus),
    ("-", Punct::Minus),
    ("/", Punct::Slash),
    ("<", Punct::Lt),
    (">", Punct::Gt),
];

#[derive(Debug, Clone, PartialEq)]
struct StrLit {
    value: String,
    bytes: bool,
    interpolated: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(StrLit),
    Int(i64),
    Float(f64),
    Punct(Punct),
    /// `@attr(...)`, dropped by the parser.
    Attr,
    Comment(String),
    Newline,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "identifier '{name}'"),
            Self::Str(_) => f.write_str("string literal"),
            Self::Int(_) | Self::Float(_) => f.write_str("number"),
            Self::Punct(p) => write!(f, "'{}'", p.as_str()),
            Self::Attr => f.write_str("attribute"),
            Self::Comment(_) => f.write_str("comment"),
            Self::Newline => f.write_str("newline"),
            Self::Eof => f.write_str("end of file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    tok: Tok,
    line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn push(&mut self, tok: Tok, line: usize) {
        self.tokens.push(Token { tok, line });
    }

    fn tokenize(mut self) -> Result<Vec<Token>> {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.push(Tok::Newline, self.line);
                    self.line += 1;
                    self.pos += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '/' if self.peek_at(1) == Some('/') => self.lex_comment(),
                '"' | '\'' => self.lex_string(0)?,
                '#' if matches!(self.peek_at(1), Some('"' | '\'' | '#')) => {
                    let mut hashes = 0;
                    while self.peek() == Some('#') {
                        hashes += 1;
                        self.pos += 1;
                    }
                    if !matches!(self.peek(), Some('"' | '\'')) {
                        return Err(CueError::new(self.line, "expected quote after '#'"));
                    }
                    self.lex_string(hashes)?;
                }
                '@' => self.lex_attribute()?,
                '.' if self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                    self.lex_number()?;
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                c if is_ident_char(c) || c == '#' => self.lex_ident()?,
                _ => self.lex_punct()?,
            }
        }
        self.push(Tok::Eof, self.line);
        Ok(self.tokens)
    }

    fn lex_comment(&mut self) {
        let line = self.line;
        self.pos += 2;
        let start = self.pos;
        while self.peek().is_some_and(|c| c != '\n') {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        self.push(Tok::Comment(text.trim().to_string()), line);
    }

    fn lex_ident(&mut self) -> Result<()> {
        let line = self.line;
        if self.starts_with("_|_") && !self.peek_at(3).is_some_and(is_ident_char) {
            self.pos += 3;
            self.push(Tok::Ident("_|_".to_string()), line);
            return Ok(());
        }
        let start = self.pos;
        if self.peek() == Some('_') && self.peek_at(1) == Some('#') {
            self.pos += 2;
        } else if self.peek() == Some('#') {
            self.pos += 1;
        }
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if name == "#" || name == "_#" {
            return Err(CueError::new(line, "expected identifier after '#'"));
        }
        self.push(Tok::Ident(name), line);
        Ok(())
    }

    fn lex_punct(&mut self) -> Result<()> {
        for (text, punct) in OPERATORS {
            if self.starts_with(text) {
                self.pos += text.len();
                self.push(Tok::Punct(punct), self.line);
                return Ok(());
            }
        }
        let c = self.peek().unwrap_or_default();
        Err(CueError::new(self.line, format!("unexpected character '{c}'")))
    }

    fn lex_attribute(&mut self) -> Result<()> {
        let line = self.line;
        self.pos += 1;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if self.peek() == Some('(') {
            self.skip_balanced_parens(line)?;
        }
        self.push(Tok::Attr, line);
        Ok(())
    }

    /// Skip from an opening `(` to its matching `)`, returning the skipped text.
    fn skip_balanced_parens(&mut self, line: usize) -> Result<String> {
        let start = self.pos;
        let mut depth = 0usize;
        loop {
            let Some(c) = self.peek() else {
                return Err(CueError::new(line, "unbalanced parentheses"));
            };
            self.pos += 1;
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                '\n' => self.line += 1,
                _ => {}
            }
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn closes(&self, quote: &str, hashes: usize) -> bool {
        self.starts_with(quote)
            && (0..hashes).all(|i| self.peek_at(quote.chars().count() + i) == Some('#'))
    }

    fn lex_string(&mut self, hashes: usize) -> Result<()> {
        let line = self.line;
        let q = self.peek().unwrap_or('"');
        let triple: String = [q, q, q].iter().collect();
        let single = q.to_string();
        let multiline = self.starts_with(&triple);

        if multiline {
            self.pos += 3;
            while matches!(self.peek(), Some(' ' | '\t' | '\r')) {
                self.pos += 1;
            }
            if self.peek() != Some('\n') {
                return Err(CueError::new(line, "expected newline after multiline quote"));
            }
            self.pos += 1;
            self.line += 1;
        } else {
            self.pos += 1;
        }

        let close = if multiline { &triple } else { &single };
        let mut value = String::new();
        let mut interpolated = false;
        loop {
            let Some(c) = self.peek() else {
                return Err(CueError::new(line, "string literal not terminated"));
            };
            if self.closes(close, hashes) {
                self.pos += close.chars().count() + hashes;
                break;
            }
            if c == '\n' {
                if !multiline {
                    return Err(CueError::new(line, "string literal not terminated"));
                }
                self.line += 1;
            }
            let escape = c == '\\' && (1..=hashes).all(|i| self.peek_at(i) == Some('#'));
            if !escape {
                value.push(c);
                self.pos += 1;
                continue;
            }

            self.pos += 1 + hashes;
            let Some(e) = self.peek() else {
                return Err(CueError::new(line, "string literal not terminated"));
            };
            self.pos += 1;
            match e {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                '\\' | '"' | '\'' | '/' => value.push(e),
                'u' => {
                    let hex: String = (0..4).filter_map(|i| self.peek_at(i)).collect();
                    let decoded = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| CueError::new(self.line, "invalid unicode escape"))?;
                    value.push(decoded);
                    self.pos += 4;
                }
                '(' => {
                    self.pos -= 1;
                    interpolated = true;
                    value.push('\\');
                    value.push_str(&self.skip_balanced_parens(line)?);
                }
                other => {
                    return Err(CueError::new(
                        self.line,
                        format!("unknown escape sequence '\\{other}'"),
                    ))
                }
            }
        }

        if multiline {
            value = dedent(&value);
        }
        self.push(
            Tok::Str(StrLit {
                value,
                bytes: q == '\'',
                interpolated,
            }),
            line,
        );
        Ok(())
    }

    fn lex_number(&mut self) -> Result<()> {
        let line = self.line;
        let start = self.pos;
        let radix = match (self.peek(), self.peek_at(1)) {
            (Some('0'), Some('x' | 'X')) => 16,
            (Some('0'), Some('o' | 'O')) => 8,
            (Some('0'), Some('b' | 'B')) => 2,
            _ => 10,
        };
        if radix != 10 {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit() || c == '_') {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos]
                .iter()
                .filter(|c| **c != '_')
                .collect();
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|e| CueError::new(line, format!("invalid number: {e}")))?;
            self.push(Tok::Int(value), line);
            return Ok(());
        }

        let mut is_float = false;
        self.take_digits();
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.pos += 1;
            self.take_digits();
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = usize::from(matches!(self.peek_at(1), Some('+' | '-')));
            if self.peek_at(1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                self.pos += 1 + sign;
                self.take_digits();
            }
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();

        let multiplier = self.take_multiplier();
        let tok = match multiplier {
            Some(m) => {
                let base: f64 = text
                    .parse()
                    .map_err(|e| CueError::new(line, format!("invalid number: {e}")))?;
                Tok::Int((base * m) as i64)
            }
            None if is_float => Tok::Float(
                text.parse()
                    .map_err(|e| CueError::new(line, format!("invalid number: {e}")))?,
            ),
            None => Tok::Int(
                text.parse()
                    .map_err(|e| CueError::new(line, format!("invalid number: {e}")))?,
            ),
        };
        self.push(tok, line);
        Ok(())
    }

    fn take_digits(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.pos += 1;
        }
    }

    /// SI (`K`) and binary (`Ki`) multiplier suffixes.
    fn take_multiplier(&mut self) -> Option<f64> {
        let exponent = match self.peek()? {
            'K' => 1,
            'M' => 2,
            'G' => 3,
            'T' => 4,
            'P' => 5,
            _ => return None,
        };
        let binary = self.peek_at(1) == Some('i');
        let len = if binary { 2 } else { 1 };
        if self.peek_at(len).is_some_and(is_ident_char) {
            return None;
        }
        self.pos += len;
        let base: f64 = if binary { 1024.0 } else { 1000.0 };
        Some(base.powi(exponent))
    }
}

/// Strip the closing line's indentation from every line of a multiline string.
fn dedent(raw: &str) -> String {
    let (body, indent) = match raw.rfind('\n') {
        Some(idx) if raw[idx + 1..].chars().all(|c| c == ' ' || c == '\t') => {
            (&raw[..idx], &raw[idx + 1..])
        }
        _ => (raw, ""),
    };
    body.split('\n')
        .map(|line| line.strip_prefix(indent).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n")
}

// --- Parser ---

static EOF: Tok = Tok::Eof;

/// Deepest expression nesting accepted before parsing gives up.
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    /// Run `parse` one nesting level deeper, failing past [`MAX_NESTING`].
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map_or(&EOF, |t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn is_punct(&self, punct: Punct) -> bool {
        self.peek() == &Tok::Punct(punct)
    }

    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Ident(name) if name == keyword)
    }

    fn error(&self, message: impl Into<String>) -> CueError {
        CueError::new(self.line(), message)
    }

    fn unexpected(&self, expected: &str) -> CueError {
        self.error(format!("expected {expected}, found {}", self.peek()))
    }

    fn expect(&mut self, punct: Punct) -> Result<()> {
        if self.is_punct(punct) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{}'", punct.as_str())))
        }
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.peek().clone() {
            Tok::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("identifier")),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.advance();
        }
    }

    /// Skip newlines, comments and attributes.
    fn skip_trivia(&mut self) {
        while matches!(self.peek(), Tok::Newline | Tok::Comment(_) | Tok::Attr) {
            self.advance();
        }
    }

    /// Index just past the bracket group opening at `start`, if balanced.
    fn matching_close(&self, start: usize) -> Option<usize> {
        let mut depth = 0usize;
        for (offset, token) in self.tokens[start..].iter().enumerate() {
            match token.tok {
                Tok::Punct(Punct::LBracket | Punct::LParen | Punct::LBrace) => depth += 1,
                Tok::Punct(Punct::RBracket | Punct::RParen | Punct::RBrace) => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(start + offset + 1);
                    }
                }
                Tok::Eof => return None,
                _ => {}
            }
        }
        None
    }

    fn is_field_start(&self) -> bool {
        match self.peek() {
            Tok::Ident(_) | Tok::Str(_) => match self.peek_at(1) {
                Tok::Punct(Punct::Colon) => true,
                Tok::Punct(Punct::Question | Punct::Bang) => {
                    self.peek_at(2) == &Tok::Punct(Punct::Colon)
                }
                _ => false,
            },
            Tok::Punct(Punct::LBracket | Punct::LParen) => {
                self.matching_close(self.pos).is_some_and(|end| {
                    self.tokens
                        .get(end)
                        .is_some_and(|t| matches!(t.tok, Tok::Punct(Punct::Colon | Punct::Question)))
                })
            }
            _ => false,
        }
    }

    fn parse_struct_body(&mut self, top: bool) -> Result<StructLit> {
        let mut lit = StructLit::default();
        let mut docs: Vec<String> = Vec::new();
        let mut newline_run = 0;

        loop {
            match self.peek() {
                Tok::Newline => {
                    self.advance();
                    newline_run += 1;
                    if newline_run >= 2 {
                        docs.clear();
                    }
                    continue;
                }
                Tok::Comment(text) => {
                    docs.push(text.clone());
                    self.advance();
                    newline_run = 0;
                    continue;
                }
                Tok::Punct(Punct::Comma) | Tok::Attr => {
                    self.advance();
                    continue;
                }
                Tok::Punct(Punct::RBrace) if !top => break,
                Tok::Eof if top => break,
                Tok::Eof => return Err(self.unexpected("'}'")),
                Tok::Punct(Punct::RBrace) => return Err(self.error("unexpected '}'")),
                _ => {}
            }

            newline_run = 0;
            self.parse_decl(std::mem::take(&mut docs), &mut lit, top)?;

            if matches!(self.peek(), Tok::Comment(_)) {
                self.advance();
            }
            match self.peek() {
                Tok::Punct(Punct::Comma) => {
                    self.advance();
                }
                Tok::Newline | Tok::Eof | Tok::Punct(Punct::RBrace) => {}
                _ => return Err(self.unexpected("',' or newline")),
            }
        }
        Ok(lit)
    }

    fn parse_decl(&mut self, docs: Vec<String>, lit: &mut StructLit, top: bool) -> Result<()> {
        if self.is_field_start() {
            let field = self.parse_field(docs)?;
            lit.fields.push(field);
            return Ok(());
        }

        match self.peek().clone() {
            Tok::Ident(kw) if kw == "package" && top => {
                self.advance();
                self.expect_ident()?;
            }
            Tok::Ident(kw) if kw == "import" => {
                self.advance();
                if self.is_punct(Punct::LParen) {
                    let end = self
                        .matching_close(self.pos)
                        .ok_or_else(|| self.error("unterminated import block"))?;
                    self.pos = end;
                } else {
                    match self.advance() {
                        Tok::Str(_) => {}
                        _ => return Err(self.error("expected import path")),
                    }
                }
            }
            Tok::Ident(kw) if kw == "let" => {
                self.advance();
                self.expect_ident()?;
                self.expect(Punct::Assign)?;
                self.parse_expr()?;
            }
            Tok::Ident(kw) if kw == "for" || kw == "if" => {
                self.parse_comprehension()?;
                lit.embeds.push(Expr::Comprehension);
            }
            Tok::Punct(Punct::Ellipsis) => {
                self.advance();
                lit.open = true;
                if !matches!(
                    self.peek(),
                    Tok::Newline | Tok::Eof | Tok::Comment(_) | Tok::Punct(Punct::Comma | Punct::RBrace)
                ) {
                    self.parse_expr()?;
                }
            }
            _ => {
                let expr = self.parse_expr()?;
                lit.embeds.push(expr);
            }
        }
        Ok(())
    }

    fn parse_field(&mut self, docs: Vec<String>) -> Result<Field> {
        let line = self.line();
        let label = self.parse_label()?;
        let optional = match self.peek() {
            Tok::Punct(Punct::Question) => {
                self.advance();
                true
            }
            Tok::Punct(Punct::Bang) => {
                self.advance();
                false
            }
            _ => false,
        };
        self.expect(Punct::Colon)?;
        self.skip_newlines();

        let value = if self.is_field_start() {
            let inner = self.nested(|p| p.parse_field(Vec::new()))?;
            Expr::Struct(StructLit {
                fields: vec![inner],
                ..StructLit::default()
            })
        } else {
            self.parse_expr()?
        };

        while matches!(self.peek(), Tok::Attr) {
            self.advance();
        }

        Ok(Field {
            label,
            optional,
            value,
            docs,
            line,
        })
    }

    fn parse_label(&mut self) -> Result<Label> {
        match self.advance() {
            Tok::Ident(name) => Ok(Label::from_ident(name)),
            Tok::Str(lit) => Ok(Label::Regular(lit.value)),
            Tok::Punct(Punct::LBracket) => {
                self.skip_newlines();
                // `[Name=pattern]` binds an alias we do not need.
                if matches!(self.peek(), Tok::Ident(_)) && self.peek_at(1) == &Tok::Punct(Punct::Assign) {
                    self.advance();
                    self.advance();
                }
                let pattern = self.parse_expr()?;
                self.skip_newlines();
                self.expect(Punct::RBracket)?;
                Ok(Label::Pattern(Box::new(pattern)))
            }
            Tok::Punct(Punct::LParen) => {
                let expr = self.parse_expr()?;
                self.expect(Punct::RParen)?;
                Ok(Label::Dynamic(Box::new(expr)))
            }
            other => Err(self.error(format!("expected label, found {other}"))),
        }
    }

    /// `for`/`if`/`let` clauses followed by a struct body.
    fn parse_comprehension(&mut self) -> Result<()> {
        loop {
            if self.is_keyword("for") {
                self.advance();
                self.expect_ident()?;
                if self.is_punct(Punct::Comma) {
                    self.advance();
                    self.expect_ident()?;
                }
                if !self.is_keyword("in") {
                    return Err(self.unexpected("'in'"));
                }
                self.advance();
                self.parse_expr()?;
            } else if self.is_keyword("if") {
                self.advance();
                self.parse_expr()?;
            } else if self.is_keyword("let") {
                self.advance();
                self.expect_ident()?;
                self.expect(Punct::Assign)?;
                self.parse_expr()?;
            } else {
                break;
            }
            self.skip_newlines();
        }
        self.expect(Punct::LBrace)?;
        self.nested(|p| p.parse_struct_body(false))?;
        self.expect(Punct::RBrace)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.nested(Self::parse_disjunction)
    }

    fn parse_disjunction(&mut self) -> Result<Expr> {
        let first = self.parse_conjunction()?;
        if !self.is_punct(Punct::Pipe) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.is_punct(Punct::Pipe) {
            self.advance();
            self.skip_newlines();
            parts.push(self.parse_conjunction()?);
        }
        let disjuncts = parts
            .into_iter()
            .map(|expr| match expr {
                Expr::Unary(UnaryOp::Default, inner) => Disjunct {
                    default: true,
                    expr: *inner,
                },
                expr => Disjunct {
                    default: false,
                    expr,
                },
            })
            .collect();
        Ok(Expr::Disjunction(disjuncts))
    }

    fn parse_conjunction(&mut self) -> Result<Expr> {
        let first = self.parse_binary(1)?;
        if !self.is_punct(Punct::Amp) {
            return Ok(first);
        }
        let mut parts = vec![first];
        while self.is_punct(Punct::Amp) {
            self.advance();
            self.skip_newlines();
            parts.push(self.parse_binary(1)?);
        }
        Ok(Expr::Conjunction(parts))
    }

    fn binary_op(&self) -> Option<BinaryOp> {
        let Tok::Punct(punct) = self.peek() else {
            return None;
        };
        Some(match punct {
            Punct::OrOr => BinaryOp::Or,
            Punct::AndAnd => BinaryOp::And,
            Punct::EqEq => BinaryOp::Eq,
            Punct::NotEq => BinaryOp::Ne,
            Punct::Lt => BinaryOp::Lt,
            Punct::Le => BinaryOp::Le,
            Punct::Gt => BinaryOp::Gt,
            Punct::Ge => BinaryOp::Ge,
            Punct::Match => BinaryOp::Match,
            Punct::NotMatch => BinaryOp::NotMatch,
            Punct::Plus => BinaryOp::Add,
            Punct::Minus => BinaryOp::Sub,
            Punct::Star => BinaryOp::Mul,
            Punct::Slash => BinaryOp::Div,
            _ => return None,
        })
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(op) = self.binary_op() {
            if op.precedence() < min_precedence {
                break;
            }
            self.advance();
            self.skip_newlines();
            let rhs = self.parse_binary(op.precedence() + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Tok::Punct(Punct::Star) => UnaryOp::Default,
            Tok::Punct(Punct::Minus) => UnaryOp::Neg,
            Tok::Punct(Punct::Plus) => UnaryOp::Pos,
            Tok::Punct(Punct::Bang) => UnaryOp::Not,
            Tok::Punct(Punct::Lt) => UnaryOp::Lt,
            Tok::Punct(Punct::Le) => UnaryOp::Le,
            Tok::Punct(Punct::Gt) => UnaryOp::Gt,
            Tok::Punct(Punct::Ge) => UnaryOp::Ge,
            Tok::Punct(Punct::NotEq) => UnaryOp::Ne,
            Tok::Punct(Punct::Match) => UnaryOp::Match,
            Tok::Punct(Punct::NotMatch) => UnaryOp::NotMatch,
            _ => return self.parse_postfix(),
        };
        self.advance();
        let operand = self.nested(Self::parse_unary)?;
        Ok(Expr::Unary(op, Box::new(operand)))
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Tok::Punct(Punct::Dot) => {
                    self.advance();
                    let name = match self.advance() {
                        Tok::Ident(name) => name,
                        Tok::Str(lit) => lit.value,
                        other => return Err(self.error(format!("expected selector, found {other}"))),
                    };
                    expr = Expr::Selector(Box::new(expr), name);
                }
                Tok::Punct(Punct::LParen) => {
                    self.advance();
                    let mut args = Vec::new();
                    loop {
                        self.skip_trivia();
                        if self.is_punct(Punct::RParen) {
                            self.advance();
                            break;
                        }
                        args.push(self.parse_expr()?);
                        self.skip_trivia();
                        if self.is_punct(Punct::Comma) {
                            self.advance();
                        } else if !self.is_punct(Punct::RParen) {
                            return Err(self.unexpected("',' or ')'"));
                        }
                    }
                    expr = Expr::Call(Box::new(expr), args);
                }
                Tok::Punct(Punct::LBracket) => {
                    self.advance();
                    self.skip_newlines();
                    let index = self.parse_expr()?;
                    self.skip_newlines();
                    self.expect(Punct::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                "null" => Expr::Null,
                "_|_" => Expr::Bottom,
                _ => Expr::Ident(name),
            }),
            Tok::Str(lit) if lit.interpolated => Ok(Expr::Interpolation(lit.value)),
            Tok::Str(lit) if lit.bytes => Ok(Expr::Bytes(lit.value)),
            Tok::Str(lit) => Ok(Expr::String(lit.value)),
            Tok::Int(value) => Ok(Expr::Int(value)),
            Tok::Float(value) => Ok(Expr::Float(value)),
            Tok::Punct(Punct::LParen) => {
                self.skip_trivia();
                let expr = self.parse_expr()?;
                self.skip_trivia();
                self.expect(Punct::RParen)?;
                Ok(expr)
            }
            Tok::Punct(Punct::LBrace) => {
                let body = self.parse_struct_body(false)?;
                self.expect(Punct::RBrace)?;
                Ok(Expr::Struct(body))
            }
            Tok::Punct(Punct::LBracket) => self.parse_list(),
            other => Err(CueError::new(line, format!("expected expression, found {other}"))),
        }
    }

    /// List body after the opening `[`.
    fn parse_list(&mut self) -> Result<Expr> {
        let mut elems = Vec::new();
        let mut tail = None;
        loop {
            self.skip_trivia();
            if self.is_punct(Punct::RBracket) {
                self.advance();
                break;
            }
            if self.is_punct(Punct::Ellipsis) {
                self.advance();
                let element = if matches!(
                    self.peek(),
                    Tok::Newline | Tok::Comment(_) | Tok::Punct(Punct::RBracket | Punct::Comma)
                ) {
                    Expr::Ident("_".to_string())
                } else {
                    self.parse_expr()?
                };
                tail = Some(Box::new(element));
            } else if self.is_keyword("for") || self.is_keyword("if") {
                self.parse_comprehension()?;
                elems.push(Expr::Comprehension);
            } else {
                elems.push(self.parse_expr()?);
            }

            if matches!(self.peek(), Tok::Comment(_)) {
                self.advance();
            }
            match self.peek() {
                Tok::Punct(Punct::Comma) | Tok::Newline => {
                    self.advance();
                }
                Tok::Punct(Punct::RBracket) => {}
                _ => return Err(self.unexpected("',' or ']'")),
            }
        }
        Ok(Expr::List { elems, tail })
    }
}
