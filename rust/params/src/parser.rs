//! Line-oriented parameter file parser.
//!
//! ```text
//! ¤ heights = np.arange(1, 5)
//! # comment
//! nx          40
//! grooveSize  [6, 8]          # swept
//! grooveHeight heights
//! title       grooved surface
//! ```

use std::path::{Path, PathBuf};

use crate::{
    expr::{Evaluator, ExprError},
    value::{ParameterSet, Value},
};

/// How a line is split into key and value tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Delimiter {
    /// Any run of whitespace.
    #[default]
    Whitespace,
    /// A literal separator string.
    Literal(String),
}

impl Delimiter {
    fn split_key<'a>(&self, line: &'a str) -> (&'a str, &'a str) {
        match self {
            Self::Whitespace => line
                .split_once(char::is_whitespace)
                .map_or((line, ""), |(k, rest)| (k, rest.trim())),
            Self::Literal(sep) => line
                .split_once(sep.as_str())
                .map_or((line, ""), |(k, rest)| (k.trim(), rest.trim())),
        }
    }

    fn count_tokens(&self, rest: &str) -> usize {
        match self {
            Self::Whitespace => rest.split_whitespace().count(),
            Self::Literal(sep) => rest.split(sep.as_str()).filter(|t| !t.trim().is_empty()).count(),
        }
    }
}

/// Parses parameter files into a [`ParameterSet`].
#[derive(Debug, Clone)]
pub struct ConfigParser {
    delimiter: Delimiter,
    comment: char,
    metachar: char,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::Whitespace,
            comment: '#',
            metachar: '¤',
        }
    }
}

impl ConfigParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: char) -> Self {
        self.comment = comment;
        self
    }

    #[must_use]
    pub fn with_metachar(mut self, metachar: char) -> Self {
        self.metachar = metachar;
        self
    }

    /// Parse a parameter file.
    pub fn parse_file(&self, path: impl AsRef<Path>) -> Result<ParameterSet, ParseError> {
        let path = path.as_ref();
        tracing::info!("Parsing parameter file {}", path.display());
        let source = std::fs::read_to_string(path)
            .map_err(|e| ParseError::Io(path.to_path_buf(), e))?;
        let parameters = self.parse_named(&source, &path.display().to_string())?;
        tracing::info!("Parsed {} parameters", parameters.len());
        Ok(parameters)
    }

    /// Parse parameter file contents held in memory.
    pub fn parse_str(&self, source: &str) -> Result<ParameterSet, ParseError> {
        self.parse_named(source, "<string>")
    }

    fn parse_named(&self, source: &str, file: &str) -> Result<ParameterSet, ParseError> {
        let lines: Vec<(usize, &str)> = source
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim()))
            .collect();

        // Directives run first so that every value line can see their bindings
        let mut evaluator = Evaluator::new();
        for &(line, text) in &lines {
            let Some(directive) = text.strip_prefix(self.metachar) else {
                continue;
            };
            let directive = strip_comment(directive, self.comment);
            tracing::debug!("Executing directive on line {line}: {directive}");
            evaluator
                .execute(directive)
                .map_err(|source| ParseError::Directive {
                    file: file.to_string(),
                    line,
                    source,
                })?;
        }

        let mut parameters = ParameterSet::new();
        for &(line, text) in &lines {
            if text.is_empty() || text.starts_with(self.comment) || text.starts_with(self.metachar)
            {
                continue;
            }
            let text = strip_comment(text, self.comment);
            if text.is_empty() {
                continue;
            }

            let (key, rest) = self.delimiter.split_key(text);
            if rest.is_empty() {
                return Err(ParseError::MissingValue {
                    file: file.to_string(),
                    line,
                    key: key.to_string(),
                });
            }

            // A lone token that does not evaluate is a plain string, and so is
            // prose. Hitting an evaluator limit always fails the line.
            let single = self.delimiter.count_tokens(rest) < 2;
            let value = match evaluator.eval(rest) {
                Ok(value) => value,
                Err(source) if source.is_limit() || (!single && looks_like_expression(rest)) => {
                    return Err(ParseError::Expression {
                        file: file.to_string(),
                        line,
                        key: key.to_string(),
                        source,
                    });
                }
                Err(_) => Value::Str(rest.to_string()),
            };

            tracing::debug!("{key} = {value}");
            if parameters.insert(key, value).is_some() {
                tracing::warn!("{file}:{line}: '{key}' redefined, keeping the later value");
            }
        }

        Ok(parameters)
    }
}

/// Cut an inline comment, ignoring comment characters inside quotes.
fn strip_comment(line: &str, comment: char) -> &str {
    let mut quote = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, c) if c == comment => return line[..i].trim_end(),
            _ => {}
        }
    }
    line.trim_end()
}

/// Whether a multi-token value was meant as an expression rather than prose.
fn looks_like_expression(text: &str) -> bool {
    if text.starts_with(['[', '(', '\'', '"']) {
        return true;
    }
    let head = text
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .next()
        .unwrap_or_default();
    !head.is_empty() && text[head.len()..].trim_start().starts_with('(')
}

/// Errors that can occur when parsing a parameter file.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read parameter file {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("{file}:{line}: directive failed: {source}")]
    Directive {
        file: String,
        line: usize,
        source: ExprError,
    },
    #[error("{file}:{line}: malformed value for '{key}': {source}")]
    Expression {
        file: String,
        line: usize,
        key: String,
        source: ExprError,
    },
    #[error("{file}:{line}: '{key}' has no value")]
    MissingValue {
        file: String,
        line: usize,
        key: String,
    },
}
