//! The reusable native command and the shared binding algorithm.

use std::time::Duration;

use super::error::DbError;
use super::params::{Direction, ParamBind, ParamValue};
use super::placeholder::{self, NativeStyle};
use super::types::Value;

/// Whether a command is SQL text or a stored-procedure name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandKind {
    #[default]
    Text,
    StoredProcedure,
}

/// A parameter after name normalization and array expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    /// Name without the placeholder prefix.
    pub name: String,
    pub value: Value,
    /// Positive size hint, if any.
    pub size: Option<u32>,
    pub direction: Direction,
}

impl From<&BoundParam> for ParamBind {
    fn from(p: &BoundParam) -> Self {
        let mut bind = ParamBind::new(p.name.clone(), p.value.clone()).with_direction(p.direction);
        bind.size = p.size;
        bind
    }
}

/// The session's reusable command.
///
/// Rebinding clears everything bound before. The named text keeps the
/// caller's placeholders (with arrays expanded); `native_text` and
/// `native_args` are what the driver actually receives.
#[derive(Debug, Clone, Default)]
pub struct Command {
    text: String,
    kind: CommandKind,
    params: Vec<BoundParam>,
    native_text: String,
    native_args: Vec<Value>,
    audit_text: String,
    timeout: Duration,
}

impl Command {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn params(&self) -> &[BoundParam] {
        &self.params
    }

    /// Looks up a bound parameter by name, ignoring ASCII case.
    pub fn param(&self, name: &str) -> Option<&BoundParam> {
        self.params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn native_text(&self) -> &str {
        &self.native_text
    }

    pub fn native_args(&self) -> &[Value] {
        &self.native_args
    }

    /// Fully substituted, whitespace-collapsed text. Never executed.
    pub fn audit_text(&self) -> &str {
        &self.audit_text
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub(crate) fn clear(&mut self) {
        self.text.clear();
        self.kind = CommandKind::Text;
        self.params.clear();
        self.native_text.clear();
        self.native_args.clear();
        self.audit_text.clear();
    }

    /// Renders the named text into `style` and stores the result.
    pub(crate) fn render(&mut self, prefix: char, style: NativeStyle) {
        let (text, args) = placeholder::render(&self.text, prefix, &self.params, style);
        self.native_text = text;
        self.native_args = args;
    }

    /// Stores native text that needs no placeholder rendering.
    pub(crate) fn set_native(&mut self, text: String, args: Vec<Value>) {
        self.native_text = text;
        self.native_args = args;
    }
}

fn strip_prefix(name: &str, prefix: char) -> &str {
    let name = name.trim();
    name.strip_prefix(prefix).unwrap_or(name)
}

/// Binds `params` into `command` under the shared contract.
///
/// Clears the command, strips `prefix` from names, expands arrays into
/// `name_1..name_k` (rewriting only the first occurrence of the original
/// placeholder) and records the audit text. Rendering into the native
/// dialect is left to the adapter.
pub(crate) fn bind_named(
    command: &mut Command,
    prefix: char,
    text: &str,
    kind: CommandKind,
    params: &[ParamBind],
) -> Result<(), DbError> {
    command.clear();

    let caller_names: Vec<&str> = params.iter().map(|p| strip_prefix(&p.name, prefix)).collect();
    let mut text = text.to_string();

    for (param, name) in params.iter().zip(&caller_names) {
        if name.is_empty() {
            return Err(DbError::Bind("parameter name is empty".to_string()));
        }
        let size = param.size.filter(|s| *s > 0);
        let direction = param.direction.unwrap_or_default();

        match &param.value {
            ParamValue::Array(items) => {
                let mut expanded = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    let sub = format!("{name}_{}", i + 1);
                    let taken = command.param(&sub).is_some()
                        || caller_names.iter().any(|n| n.eq_ignore_ascii_case(&sub));
                    if taken {
                        return Err(DbError::Bind(format!(
                            "expanded parameter {sub} collides with an existing parameter"
                        )));
                    }
                    expanded.push(format!("{prefix}{sub}"));
                    command.params.push(BoundParam {
                        name: sub,
                        value: item.clone(),
                        size,
                        direction,
                    });
                }
                let replacement = if expanded.is_empty() {
                    "NULL".to_string()
                } else {
                    expanded.join(", ")
                };
                if let Some(range) =
                    placeholder::first_occurrence(&text, prefix, name).map(|ph| ph.start..ph.end)
                {
                    text.replace_range(range, &replacement);
                }
            }
            scalar => {
                if command.param(name).is_some() {
                    return Err(DbError::Bind(format!("parameter {name} is bound twice")));
                }
                let value = match scalar {
                    ParamValue::Scalar(v) => v.clone(),
                    _ => Value::Null,
                };
                command.params.push(BoundParam {
                    name: name.to_string(),
                    value,
                    size,
                    direction,
                });
            }
        }
    }

    command.audit_text = match kind {
        CommandKind::Text => placeholder::audit(&text, prefix, &command.params),
        CommandKind::StoredProcedure => procedure_audit(&text, &command.params),
    };
    command.text = text;
    command.kind = kind;
    Ok(())
}

fn procedure_audit(name: &str, params: &[BoundParam]) -> String {
    let args: Vec<String> = params
        .iter()
        .map(|p| format!("{}={}", p.name, p.value.to_sql_literal()))
        .collect();
    format!("{name}({})", args.join(", "))
}
