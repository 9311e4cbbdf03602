//! Directive grammar for vMCP composite prompt templates.
//!
//! A composite prompt is plain text with embedded directives:
//!
//! ```text
//! @param.<name>
//! @config.<name>
//! @tool.<tool>(<arg>: <type> = <value>, ...)
//! @tool.<server>.<tool>(<arg>: <type> = <value>, ...)
//! @resource.<server>://<path>
//! @prompt.<name>
//! ```
//!
//! [`parse`] turns text into a flat [`Template`]. Parsing is total: anything
//! that is not a complete directive stays literal text, so authors can use
//! `@` in prose. The crate performs no I/O and has no notion of backends,
//! which makes a parsed template safe to cache per prompt revision.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod parser;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use parser::parse;

/// One node of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Node {
    /// Verbatim text, whitespace and newlines included
    Literal(String),
    /// `@param.<name>`
    ParamRef(String),
    /// `@config.<name>`
    ConfigRef(String),
    /// `@tool.[<server>.]<tool>(...)`
    ToolCall(ToolCall),
    /// `@resource.<server>://<path>`
    ResourceRef(ResourceRef),
    /// `@prompt.<name>`
    PromptRef(String),
}

impl Node {
    /// Short name of the directive kind, used in logs and lint output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Literal(_) => "literal",
            Self::ParamRef(_) => "param",
            Self::ConfigRef(_) => "config",
            Self::ToolCall(_) => "tool",
            Self::ResourceRef(_) => "resource",
            Self::PromptRef(_) => "prompt",
        }
    }
}

/// Inline backend tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Owning backend when the directive is qualified
    pub server: Option<String>,
    /// Tool name as the backend declares it
    pub tool: String,
    /// Arguments in declaration order
    pub args: Vec<ToolArg>,
}

impl ToolCall {
    /// Reference text as written (`server.tool` or `tool`).
    #[must_use]
    pub fn reference(&self) -> String {
        match &self.server {
            Some(server) => format!("{server}.{}", self.tool),
            None => self.tool.clone(),
        }
    }
}

/// One `<arg>: <type> = <value>` entry of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolArg {
    /// Argument name
    pub name: String,
    /// Advisory type annotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<TypeHint>,
    /// Inline value; `None` when the directive leaves it to declared defaults
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ArgValue>,
}

/// Value of a tool argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArgValue {
    /// A literal, quoted or bare
    Literal {
        /// Unescaped text
        text: String,
        /// Whether the author quoted it
        quoted: bool,
    },
    /// Nested `@param.<name>`, bound at resolution time
    ParamRef {
        /// Parameter name
        name: String,
    },
}

/// Advisory argument type annotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeHint {
    /// `int`
    Int,
    /// `float`
    Float,
    /// `bool`
    Bool,
    /// `str`
    Str,
    /// `list` or any `[T]`
    List,
    /// `dict`
    Dict,
    /// Anything else, kept verbatim
    Other(String),
}

impl TypeHint {
    /// Parse the annotation text following `:`.
    #[must_use]
    pub fn from_annotation(raw: &str) -> Self {
        match raw {
            "int" | "integer" => Self::Int,
            "float" | "number" => Self::Float,
            "bool" | "boolean" => Self::Bool,
            "str" | "string" => Self::Str,
            "list" | "array" => Self::List,
            "dict" | "object" => Self::Dict,
            s if s.starts_with('[') && s.ends_with(']') => Self::List,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Convert literal argument text to the JSON value sent to a backend.
///
/// With a hint the text is coerced to that type and falls back to a JSON
/// string when it does not fit. Without a hint, quoted text stays a string
/// and bare text is read as a number or boolean when it looks like one.
#[must_use]
pub fn coerce_argument(text: &str, quoted: bool, hint: Option<&TypeHint>) -> Value {
    let fallback = || Value::String(text.to_string());
    match hint {
        Some(TypeHint::Int) => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| fallback()),
        Some(TypeHint::Float) => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(fallback),
        Some(TypeHint::Bool) => match text.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => fallback(),
        },
        Some(TypeHint::List | TypeHint::Dict) => {
            serde_json::from_str(text.trim()).unwrap_or_else(|_| fallback())
        }
        Some(TypeHint::Str | TypeHint::Other(_)) => fallback(),
        None if quoted => fallback(),
        None => {
            let trimmed = text.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::from(i)
            } else if let Some(n) = trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                Value::Number(n)
            } else if trimmed == "true" || trimmed == "false" {
                Value::Bool(trimmed == "true")
            } else {
                fallback()
            }
        }
    }
}

/// `@resource.<server>://<path>` target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Backend name, or the reserved local scheme
    pub server: String,
    /// Everything after `://`
    pub path: String,
}

impl ResourceRef {
    /// The locator as written, `server://path`.
    #[must_use]
    pub fn uri(&self) -> String {
        format!("{}://{}", self.server, self.path)
    }
}

/// An immutable parsed template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Wrap a node sequence.
    #[must_use]
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Nodes in template order.
    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// `true` when the template holds no directives at all.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.nodes.iter().all(|n| matches!(n, Node::Literal(_)))
    }

    /// Number of directive (non-literal) nodes.
    #[must_use]
    pub fn directive_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| !matches!(n, Node::Literal(_)))
            .count()
    }

    /// Every parameter name the template reads, nested tool arguments included.
    pub fn param_refs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().flat_map(|node| {
            let names: Vec<&str> = match node {
                Node::ParamRef(name) => vec![name.as_str()],
                Node::ToolCall(call) => call
                    .args
                    .iter()
                    .filter_map(|arg| match &arg.value {
                        Some(ArgValue::ParamRef { name }) => Some(name.as_str()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            names
        })
    }

    /// Every `@config` key the template reads.
    pub fn config_refs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| match node {
            Node::ConfigRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Every `@prompt` reference in the template.
    pub fn prompt_refs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| match node {
            Node::PromptRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Every inline tool call in the template.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.nodes.iter().filter_map(|node| match node {
            Node::ToolCall(call) => Some(call),
            _ => None,
        })
    }
}
