//! Named placeholder scanning and native dialect rendering.
//!
//! Callers write SQL with named placeholders (`:name`, or `@name` on MySQL).
//! The scanner finds them while skipping string literals, quoted identifiers
//! and comments; `::` casts and `@@` system variables are never placeholders.
//! [`render`] then rewrites the named text into the driver's dialect.

use std::fmt::Write;

use super::command::BoundParam;
use super::types::Value;

/// A placeholder occurrence in SQL text. `start..end` covers the prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Placeholder<'a> {
    pub start: usize,
    pub end: usize,
    pub name: &'a str,
}

/// How native placeholders are numbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering {
    /// One native parameter per distinct name; repeats reuse the number.
    PerName,
    /// One native parameter per occurrence; values are duplicated.
    PerOccurrence,
}

/// Native placeholder dialect of a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStyle {
    pub sigil: &'static str,
    pub numbered: bool,
    pub numbering: Numbering,
}

impl NativeStyle {
    /// `$1..$n` (PostgreSQL).
    pub const DOLLAR: Self = Self {
        sigil: "$",
        numbered: true,
        numbering: Numbering::PerName,
    };
    /// `?1..?n` (SQLite).
    pub const QUESTION_NUMBERED: Self = Self {
        sigil: "?",
        numbered: true,
        numbering: Numbering::PerName,
    };
    /// `@P1..@Pn` (SQL Server).
    pub const AT_P: Self = Self {
        sigil: "@P",
        numbered: true,
        numbering: Numbering::PerName,
    };
    /// Bare `?` per occurrence (MySQL).
    pub const QUESTION: Self = Self {
        sigil: "?",
        numbered: false,
        numbering: Numbering::PerOccurrence,
    };
    /// `:1..:n` per occurrence (Oracle).
    pub const COLON: Self = Self {
        sigil: ":",
        numbered: true,
        numbering: Numbering::PerOccurrence,
    };
}

fn is_ident(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    bytes[start + 1..]
        .iter()
        .position(|&b| b == quote)
        .map_or(bytes.len(), |p| start + 1 + p + 1)
}

fn skip_past(bytes: &[u8], from: usize, terminator: &[u8]) -> usize {
    bytes
        .get(from..)
        .and_then(|rest| {
            rest.windows(terminator.len())
                .position(|w| w == terminator)
        })
        .map_or(bytes.len(), |p| from + p + terminator.len())
}

/// Finds every placeholder with the given prefix, in textual order.
pub(crate) fn placeholders(text: &str, prefix: char) -> Vec<Placeholder<'_>> {
    let bytes = text.as_bytes();
    let mut marker = [0u8; 4];
    let marker = prefix.encode_utf8(&mut marker).as_bytes();
    let Some(&prefix) = marker.first().filter(|_| marker.len() == 1) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' | b'`' => {
                i = skip_quoted(bytes, i, b);
                continue;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = skip_past(bytes, i + 2, b"\n");
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_past(bytes, i + 2, b"*/");
                continue;
            }
            _ if b == prefix => {
                let prev_ok = i == 0 || (!is_ident(bytes[i - 1]) && bytes[i - 1] != prefix);
                let next_ok = bytes
                    .get(i + 1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == b'_');
                if prev_ok && next_ok {
                    let mut end = i + 1;
                    while end < bytes.len() && is_ident(bytes[end]) {
                        end += 1;
                    }
                    found.push(Placeholder {
                        start: i,
                        end,
                        name: &text[i + 1..end],
                    });
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// First whole-word occurrence of `name`.
pub(crate) fn first_occurrence<'a>(
    text: &'a str,
    prefix: char,
    name: &str,
) -> Option<Placeholder<'a>> {
    placeholders(text, prefix)
        .into_iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
}

fn lookup<'p>(params: &'p [BoundParam], name: &str) -> Option<&'p BoundParam> {
    params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
}

/// Rewrites bound placeholders into the native dialect.
///
/// Returns the native text and the argument list in native order. Names with
/// no bound parameter are left untouched.
pub(crate) fn render(
    text: &str,
    prefix: char,
    params: &[BoundParam],
    style: NativeStyle,
) -> (String, Vec<Value>) {
    let mut out = String::with_capacity(text.len());
    let mut args: Vec<Value> = Vec::new();
    let mut numbered: Vec<(&str, usize)> = Vec::new();
    let mut last = 0;

    for ph in placeholders(text, prefix) {
        let Some(param) = lookup(params, ph.name) else {
            continue;
        };
        out.push_str(&text[last..ph.start]);

        let number = match style.numbering {
            Numbering::PerOccurrence => {
                args.push(param.value.clone());
                args.len()
            }
            Numbering::PerName => match numbered
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(ph.name))
            {
                Some(&(_, n)) => n,
                None => {
                    args.push(param.value.clone());
                    numbered.push((ph.name, args.len()));
                    args.len()
                }
            },
        };

        out.push_str(style.sigil);
        if style.numbered {
            let _ = write!(out, "{number}");
        }
        last = ph.end;
    }
    out.push_str(&text[last..]);
    (out, args)
}

/// Substitutes bound values as literals and collapses whitespace.
///
/// Used for logging only.
pub(crate) fn audit(text: &str, prefix: char, params: &[BoundParam]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for ph in placeholders(text, prefix) {
        if let Some(param) = lookup(params, ph.name) {
            out.push_str(&text[last..ph.start]);
            out.push_str(&param.value.to_sql_literal());
            last = ph.end;
        }
    }
    out.push_str(&text[last..]);
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Direction;

    fn bound(name: &str, value: impl Into<Value>) -> BoundParam {
        BoundParam {
            name: name.to_string(),
            value: value.into(),
            size: None,
            direction: Direction::In,
        }
    }

    fn names(text: &str, prefix: char) -> Vec<&str> {
        placeholders(text, prefix).iter().map(|p| p.name).collect()
    }

    #[test]
    fn test_scan_finds_named_placeholders() {
        assert_eq!(
            names("SELECT * FROM t WHERE a = :a AND b=:b_2", ':'),
            vec!["a", "b_2"]
        );
    }

    #[test]
    fn test_scan_skips_literals_and_comments() {
        let sql = "SELECT ':no', \":nope\" -- :comment\n, /* :block */ :yes FROM t";
        assert_eq!(names(sql, ':'), vec!["yes"]);
    }

    #[test]
    fn test_scan_ignores_casts_and_system_variables() {
        assert_eq!(names("SELECT :v::text, x::int", ':'), vec!["v"]);
        assert_eq!(names("SELECT @@version, @id", '@'), vec!["id"]);
        assert_eq!(names("SELECT a:b FROM t", ':'), Vec::<&str>::new());
        assert_eq!(names("SELECT arr[1:2]", ':'), Vec::<&str>::new());
    }

    #[test]
    fn test_render_per_name_reuses_numbers() {
        let params = [bound("a", 1), bound("b", 2)];
        let (text, args) = render(
            "SELECT :a, :b, :a",
            ':',
            &params,
            NativeStyle::DOLLAR,
        );
        assert_eq!(text, "SELECT $1, $2, $1");
        assert_eq!(args, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_render_per_occurrence_duplicates_values() {
        let params = [bound("a", 1), bound("b", 2)];
        let (text, args) = render("SELECT :a, :b, :a", ':', &params, NativeStyle::COLON);
        assert_eq!(text, "SELECT :1, :2, :3");
        assert_eq!(args, vec![Value::Int(1), Value::Int(2), Value::Int(1)]);

        let (text, args) = render("SELECT @a, @b, @a", '@', &params, NativeStyle::QUESTION);
        assert_eq!(text, "SELECT ?, ?, ?");
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn test_render_leaves_unbound_names() {
        let params = [bound("a", 1)];
        let (text, args) = render(
            "SELECT :a, :other",
            ':',
            &params,
            NativeStyle::AT_P,
        );
        assert_eq!(text, "SELECT @P1, :other");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn test_audit_substitutes_and_collapses() {
        let params = [bound("name", "O'Hara"), bound("id", 3)];
        let text = audit(
            "SELECT *\n  FROM users\n WHERE name = :name\tAND id = :id",
            ':',
            &params,
        );
        assert_eq!(
            text,
            "SELECT * FROM users WHERE name = 'O''Hara' AND id = 3"
        );
    }

    #[test]
    fn test_first_occurrence() {
        let ph = first_occurrence("a :ids b :ids", ':', "ids").unwrap();
        assert_eq!(ph.start, 2);
        assert!(first_occurrence("a :idsx", ':', "ids").is_none());
    }
}
