//! Extraction of AMD dependency declarations from module source
//!
//! Only a few facts are needed from each module: the string literals in the
//! array passed to `define(...)`, those passed to `require([...], ...)`, and the
//! feature names tested with `has("...")` or referenced from `has!` plugin ids.
//! [`AmdDependencyParser`] gets them from a lightweight JavaScript tokenizer that
//! understands comments, string, template and regular expression literals, which is
//! enough to find calls reliably without building a syntax tree.
//!
//! All declaration forms are recognized:
//!
//! ```js
//! define(["a", "b"], function (a, b) {});          // anonymous
//! define("my/id", ["a"], function (a) {});         // named
//! define({ plain: "object" });                     // no dependencies
//! (function () { define(["c"], factory); })();     // wrapped
//! ```
//!
//! Array entries that are not plain string literals are ignored, as are ids the
//! loader could never resolve (see [`validate_module_id`]).

use std::collections::BTreeSet;

use super::node::DeclaredDeps;
use super::paths::validate_module_id;
use crate::core::AggrError;
use crate::formula::HasNode;
use crate::formula::has::{is_has_plugin, split_plugin};

/// Number of leading `define` arguments searched for the dependency array.
const DEFINE_ARRAY_ARG_LIMIT: usize = 3;

/// Extracts dependency declarations from module source text.
pub trait SourceParser: Send + Sync + 'static {
    /// Parse `source`, read from `uri`, into its declared dependencies.
    fn parse(&self, source: &str, uri: &str) -> Result<DeclaredDeps, AggrError>;
}

/// Default [`SourceParser`] for AMD JavaScript modules.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmdDependencyParser;

impl AmdDependencyParser {
    /// Create a parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    Str(String),
    Punct(char),
    Other,
}

impl Token<'_> {
    fn is_punct(&self, c: char) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }
}

/// Keywords after which a `/` starts a regular expression rather than a division.
const REGEX_PRECEDING_KEYWORDS: [&str; 8] =
    ["return", "typeof", "instanceof", "in", "of", "new", "delete", "void"];

struct Lexer<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    uri: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str, uri: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().collect(),
            pos: 0,
            uri,
        }
    }

    fn error(&self, reason: &str) -> AggrError {
        let line = self
            .chars
            .get(self.pos.min(self.chars.len().saturating_sub(1)))
            .map_or(0, |(offset, _)| self.source[..*offset].lines().count().max(1));
        AggrError::ParseError {
            uri: self.uri.to_string(),
            reason: format!("{reason} near line {line}"),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars.get(self.pos).map_or(self.source.len(), |(o, _)| *o)
    }

    fn tokenize(mut self) -> Result<Vec<Token<'a>>, AggrError> {
        let mut tokens: Vec<Token<'a>> = Vec::new();
        while let Some(c) = self.peek(0) {
            match c {
                c if c.is_whitespace() => self.pos += 1,
                '/' if self.peek(1) == Some('/') => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '/' if self.peek(1) == Some('*') => {
                    self.pos += 2;
                    loop {
                        match (self.peek(0), self.peek(1)) {
                            (Some('*'), Some('/')) => {
                                self.pos += 2;
                                break;
                            }
                            (Some(_), _) => self.pos += 1,
                            (None, _) => return Err(self.error("unterminated comment")),
                        }
                    }
                }
                '/' if regex_allowed(tokens.last()) => {
                    self.skip_regex()?;
                    tokens.push(Token::Other);
                }
                '"' | '\'' => {
                    let value = self.read_string(c)?;
                    tokens.push(Token::Str(value));
                }
                '`' => {
                    self.skip_template()?;
                    tokens.push(Token::Other);
                }
                c if c.is_alphabetic() || c == '_' || c == '$' => {
                    let start = self.offset();
                    while self
                        .peek(0)
                        .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
                    {
                        self.pos += 1;
                    }
                    let source = self.source;
                    tokens.push(Token::Ident(&source[start..self.offset()]));
                }
                c if c.is_ascii_digit() => {
                    while self
                        .peek(0)
                        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_')
                    {
                        self.pos += 1;
                    }
                    tokens.push(Token::Other);
                }
                other => {
                    self.pos += 1;
                    tokens.push(Token::Punct(other));
                }
            }
        }
        Ok(tokens)
    }

    fn read_string(&mut self, quote: char) -> Result<String, AggrError> {
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek(0) {
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some('\\') => {
                    match self.peek(1) {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('\n') => {}
                        Some(other) => value.push(other),
                        None => return Err(self.error("unterminated string literal")),
                    }
                    self.pos += 2;
                }
                Some('\n') | None => return Err(self.error("unterminated string literal")),
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn skip_template(&mut self) -> Result<(), AggrError> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                Some('`') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some('\\') => self.pos += 2,
                Some(_) => self.pos += 1,
                None => return Err(self.error("unterminated template literal")),
            }
        }
    }

    fn skip_regex(&mut self) -> Result<(), AggrError> {
        self.pos += 1;
        let mut in_class = false;
        loop {
            match self.peek(0) {
                Some('\\') => self.pos += 2,
                Some('[') => {
                    in_class = true;
                    self.pos += 1;
                }
                Some(']') => {
                    in_class = false;
                    self.pos += 1;
                }
                Some('/') if !in_class => {
                    self.pos += 1;
                    while self.peek(0).is_some_and(char::is_alphabetic) {
                        self.pos += 1;
                    }
                    return Ok(());
                }
                Some('\n') | None => return Err(self.error("unterminated regular expression")),
                Some(_) => self.pos += 1,
            }
        }
    }
}

fn regex_allowed(previous: Option<&Token<'_>>) -> bool {
    match previous {
        None => true,
        Some(Token::Punct(c)) => !matches!(c, ')' | ']' | '}'),
        Some(Token::Ident(word)) => REGEX_PRECEDING_KEYWORDS.contains(word),
        Some(Token::Str(_) | Token::Other) => false,
    }
}

/// Split the arguments of the call whose `(` is at `open`.
///
/// Returns token ranges for each top-level argument.
fn call_arguments(tokens: &[Token<'_>], open: usize) -> Vec<(usize, usize)> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    for (i, token) in tokens.iter().enumerate().skip(open + 1) {
        match token {
            Token::Punct('(' | '[' | '{') => depth += 1,
            Token::Punct(')') if depth == 0 => {
                if i > start {
                    args.push((start, i));
                }
                return args;
            }
            Token::Punct(')' | ']' | '}') => depth = depth.saturating_sub(1),
            Token::Punct(',') if depth == 0 => {
                args.push((start, i));
                start = i + 1;
            }
            _ => {}
        }
    }
    if tokens.len() > start {
        args.push((start, tokens.len()));
    }
    args
}

/// String literals that make up whole elements of the array literal in `range`.
fn array_strings(tokens: &[Token<'_>], (start, end): (usize, usize)) -> Option<Vec<String>> {
    if !tokens.get(start)?.is_punct('[') {
        return None;
    }

    let mut values = Vec::new();
    let mut depth = 0usize;
    let mut element: Vec<&Token<'_>> = Vec::new();
    for token in &tokens[start + 1..end] {
        match token {
            Token::Punct('(' | '[' | '{') => {
                depth += 1;
                element.push(token);
            }
            Token::Punct(']') if depth == 0 => break,
            Token::Punct(')' | ']' | '}') => {
                depth = depth.saturating_sub(1);
                element.push(token);
            }
            Token::Punct(',') if depth == 0 => {
                if let [Token::Str(value)] = element.as_slice() {
                    values.push(value.clone());
                }
                element.clear();
            }
            _ => element.push(token),
        }
    }
    if let [Token::Str(value)] = element.as_slice() {
        values.push(value.clone());
    }
    Some(values)
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}

fn accept_ids(uri: &str, ids: Vec<String>, into: &mut Vec<String>) {
    for id in ids {
        match validate_module_id(&id) {
            Ok(()) => push_unique(into, id),
            Err(e) => tracing::debug!(target: "deps::parser", "Ignoring dependency in {}: {}", uri, e),
        }
    }
}

impl SourceParser for AmdDependencyParser {
    fn parse(&self, source: &str, uri: &str) -> Result<DeclaredDeps, AggrError> {
        let tokens = Lexer::new(source, uri).tokenize()?;
        let mut deps = DeclaredDeps::default();
        let mut features = BTreeSet::new();

        for (i, token) in tokens.iter().enumerate() {
            let Token::Ident(name) = token else {
                continue;
            };
            if !tokens.get(i + 1).is_some_and(|t| t.is_punct('(')) {
                continue;
            }
            if i > 0 && tokens[i - 1].is_punct('.') {
                continue;
            }

            match *name {
                "define" => {
                    let args = call_arguments(&tokens, i + 1);
                    if let Some(ids) = args
                        .iter()
                        .take(DEFINE_ARRAY_ARG_LIMIT)
                        .find_map(|range| array_strings(&tokens, *range))
                    {
                        accept_ids(uri, ids, &mut deps.define);
                    }
                }
                "require" => {
                    let args = call_arguments(&tokens, i + 1);
                    if let Some(ids) = args.first().and_then(|range| array_strings(&tokens, *range)) {
                        accept_ids(uri, ids, &mut deps.require);
                    }
                }
                "has" => {
                    if let (Some(Token::Str(feature)), Some(close)) = (tokens.get(i + 2), tokens.get(i + 3))
                        && close.is_punct(')')
                    {
                        features.insert(feature.clone());
                    }
                }
                _ => {}
            }
        }

        for id in deps.define.iter().chain(deps.require.iter()) {
            if let Some((plugin, resource)) = split_plugin(id)
                && is_has_plugin(plugin)
            {
                features.extend(HasNode::parse(resource).features());
            }
        }
        deps.features = features.into_iter().collect();
        Ok(deps)
    }
}
