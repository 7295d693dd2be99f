//! Query template compiler using nom.
//!
//! Rewrites `{name}`-style placeholders into the driver's `$N` positional
//! markers and records the parameter order.
//!
//! # Grammar
//!
//! ```text
//! SELECT * FROM users WHERE id = {id} AND org = {org}
//!                                 ──┬─           ──┬─
//!                                   │              └── second parameter → $2
//!                                   └── first parameter → $1
//! ```
//!
//! Parameters are deduplicated in first-occurrence order: a name used three
//! times occupies one slot and every occurrence maps to the same marker.
//! `{{` and `}}` escape a literal brace.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::map,
    multi::many0,
    sequence::delimited,
    IResult,
};

use crate::error::{HubError, HubResult};
use crate::value::{Args, SqlValue};

/// A query template compiled into driver-executable form.
///
/// Immutable once built: `sql()` contains exactly `parameters().len()`
/// distinct positional markers, numbered `$1..$N` with no gaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    text: String,
    parameters: Vec<String>,
}

impl CompiledQuery {
    /// The rewritten query text with `$N` positional markers.
    pub fn sql(&self) -> &str {
        &self.text
    }

    /// Distinct parameter names in first-occurrence order.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    /// Build the positional argument vector from named arguments.
    ///
    /// Binding is permissive: a declared parameter missing from `args`
    /// binds to `SqlValue::Null` rather than failing.
    pub fn positional(&self, args: &Args) -> Vec<SqlValue> {
        self.parameters
            .iter()
            .map(|name| args.get(name).cloned().unwrap_or(SqlValue::Null))
            .collect()
    }
}

enum Segment<'a> {
    Literal(&'a str),
    OpenBrace,
    CloseBrace,
    Parameter(&'a str),
}

/// Parse a run of ordinary query text.
fn literal(input: &str) -> IResult<&str, Segment<'_>> {
    map(take_while1(|c: char| c != '{' && c != '}'), Segment::Literal)(input)
}

/// Parse a `{{` escape for a literal `{`.
fn open_brace(input: &str) -> IResult<&str, Segment<'_>> {
    map(tag("{{"), |_| Segment::OpenBrace)(input)
}

/// Parse a `}}` escape for a literal `}`.
fn close_brace(input: &str) -> IResult<&str, Segment<'_>> {
    map(tag("}}"), |_| Segment::CloseBrace)(input)
}

/// Parse a parameter name (alphanumeric or underscore).
fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

/// Parse a `{identifier}` placeholder.
fn placeholder(input: &str) -> IResult<&str, Segment<'_>> {
    map(
        delimited(char('{'), identifier, char('}')),
        Segment::Parameter,
    )(input)
}

fn segments(input: &str) -> IResult<&str, Vec<Segment<'_>>> {
    many0(alt((open_brace, close_brace, placeholder, literal)))(input)
}

/// Compile a raw query template into a [`CompiledQuery`].
///
/// Pure and deterministic, no I/O. Fails only on a malformed template:
/// an unclosed `{`, a stray `}`, or an empty/invalid placeholder name.
pub fn compile(raw: &str) -> HubResult<CompiledQuery> {
    let (rest, parsed) = segments(raw)
        .map_err(|error| HubError::Template(format!("unparseable template: {error:?}")))?;

    if !rest.is_empty() {
        let offset = raw.len() - rest.len();
        let message = if rest.starts_with('{') {
            "unclosed or malformed placeholder"
        } else {
            "single '}' encountered"
        };
        return Err(HubError::template_at(offset, message));
    }

    let mut text = String::with_capacity(raw.len());
    let mut parameters: Vec<String> = Vec::new();

    for segment in parsed {
        match segment {
            Segment::Literal(run) => text.push_str(run),
            Segment::OpenBrace => text.push('{'),
            Segment::CloseBrace => text.push('}'),
            Segment::Parameter(name) => {
                let index = match parameters.iter().position(|p| p == name) {
                    Some(index) => index,
                    None => {
                        parameters.push(name.to_string());
                        parameters.len() - 1
                    }
                };
                text.push_str(&format!("${}", index + 1));
            }
        }
    }

    Ok(CompiledQuery { text, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dedup_first_occurrence_order() {
        let compiled =
            compile("SELECT {a}, {b} FROM t WHERE x = {a} AND y = {c}").unwrap();
        assert_eq!(compiled.parameters(), &["a", "b", "c"]);
        assert_eq!(
            compiled.sql(),
            "SELECT $1, $2 FROM t WHERE x = $1 AND y = $3"
        );
    }

    #[test]
    fn test_no_placeholders_passthrough() {
        let compiled = compile("SELECT count(*) FROM users").unwrap();
        assert!(compiled.parameters().is_empty());
        assert_eq!(compiled.sql(), "SELECT count(*) FROM users");
    }

    #[test]
    fn test_brace_escapes() {
        let compiled = compile("SELECT '{{\"k\": 1}}'::jsonb, {x}").unwrap();
        assert_eq!(compiled.parameters(), &["x"]);
        assert_eq!(compiled.sql(), "SELECT '{\"k\": 1}'::jsonb, $1");
    }

    #[test]
    fn test_malformed_templates() {
        assert!(matches!(
            compile("SELECT {"),
            Err(HubError::Template(_))
        ));
        assert!(matches!(
            compile("SELECT {unclosed FROM t"),
            Err(HubError::Template(_))
        ));
        assert!(matches!(compile("SELECT }"), Err(HubError::Template(_))));
        assert!(matches!(compile("SELECT {}"), Err(HubError::Template(_))));
        assert!(matches!(
            compile("SELECT {bad-name}"),
            Err(HubError::Template(_))
        ));
    }

    #[test]
    fn test_positional_binding_fills_missing_with_null() {
        let compiled = compile("UPDATE t SET a = {a}, b = {b} WHERE id = {id}").unwrap();
        let args = Args::new().set("a", 1).set("id", 9);
        assert_eq!(
            compiled.positional(&args),
            vec![SqlValue::Int(1), SqlValue::Null, SqlValue::Int(9)]
        );
    }

    #[test]
    fn test_positional_repeated_parameter_binds_once() {
        let compiled = compile("SELECT {a} + {a}").unwrap();
        let args = Args::new().set("a", 2);
        assert_eq!(compiled.positional(&args), vec![SqlValue::Int(2)]);
        assert_eq!(compiled.sql(), "SELECT $1 + $1");
    }
}
