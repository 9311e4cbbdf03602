//! Single-pass scanner for template directives.
//!
//! The scanner walks the text looking for `@`. Each candidate is matched
//! against the directive heads; a candidate that does not form a complete
//! directive is left in the surrounding literal and scanning resumes one
//! byte later.

use crate::{ArgValue, Node, ResourceRef, Template, ToolArg, ToolCall, TypeHint};

/// Characters trimmed from the end of a resource path. They are almost
/// always sentence punctuation rather than part of the locator.
const RESOURCE_TRAILING: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"'];

/// Parse template text into its node sequence.
///
/// Never fails. Adjacent literal runs are merged, so a template with no
/// directives parses to at most one [`Node::Literal`].
#[must_use]
pub fn parse(text: &str) -> Template {
    let mut nodes = Vec::new();
    let mut literal_start = 0;
    let mut pos = 0;

    while let Some(offset) = text[pos..].find('@') {
        let at = pos + offset;
        if !follows_word(text, at) {
            if let Some((node, end)) = directive(text, at) {
                if literal_start < at {
                    nodes.push(Node::Literal(text[literal_start..at].to_string()));
                }
                nodes.push(node);
                literal_start = end;
                pos = end;
                continue;
            }
        }
        pos = at + 1;
    }

    if literal_start < text.len() {
        nodes.push(Node::Literal(text[literal_start..].to_string()));
    }
    Template::new(nodes)
}

/// `true` when the `@` at `at` is glued to a preceding word (`user@host`).
fn follows_word(text: &str, at: usize) -> bool {
    text[..at]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_segment(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Try to read one directive starting at the `@` at byte offset `at`.
/// Returns the node and the byte offset just past it.
fn directive(text: &str, at: usize) -> Option<(Node, usize)> {
    let mut cur = Cursor::new(text, at + 1);
    let node = if cur.eat("param.") {
        Node::ParamRef(cur.take_while(is_ident)?.to_string())
    } else if cur.eat("config.") {
        Node::ConfigRef(cur.take_while(is_ident)?.to_string())
    } else if cur.eat("tool.") {
        Node::ToolCall(tool_call(&mut cur)?)
    } else if cur.eat("resource.") {
        Node::ResourceRef(resource(&mut cur)?)
    } else if cur.eat("prompt.") {
        Node::PromptRef(prompt_name(&mut cur)?)
    } else {
        return None;
    };
    Some((node, cur.pos))
}

fn tool_call(cur: &mut Cursor<'_>) -> Option<ToolCall> {
    let first = cur.take_while(is_segment)?.to_string();
    let (server, tool) = if cur.eat(".") {
        let second = cur.take_while(is_segment)?.to_string();
        (Some(first), second)
    } else {
        (None, first)
    };
    if !cur.eat("(") {
        return None;
    }

    let mut args = Vec::new();
    cur.skip_ws();
    if cur.eat(")") {
        return Some(ToolCall { server, tool, args });
    }
    loop {
        cur.skip_ws();
        let name = cur.take_while(is_segment)?.to_string();
        cur.skip_ws();
        let type_hint = if cur.eat(":") {
            cur.skip_ws();
            Some(TypeHint::from_annotation(type_annotation(cur)?))
        } else {
            None
        };
        cur.skip_ws();
        let value = if cur.eat("=") {
            cur.skip_ws();
            Some(arg_value(cur)?)
        } else {
            None
        };
        args.push(ToolArg {
            name,
            type_hint,
            value,
        });

        cur.skip_ws();
        if cur.eat(",") {
            cur.skip_ws();
            if cur.eat(")") {
                break;
            }
            continue;
        }
        if cur.eat(")") {
            break;
        }
        return None;
    }
    Some(ToolCall { server, tool, args })
}

/// `int`, `str`, `[str]`, `List[int]`, ...
fn type_annotation<'a>(cur: &mut Cursor<'a>) -> Option<&'a str> {
    let start = cur.pos;
    let _ = cur.take_while(is_ident);
    if cur.peek() == Some('[') {
        let mut depth = 0usize;
        while let Some(c) = cur.bump() {
            match c {
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                ',' | ')' | '\n' => return None,
                _ => {}
            }
        }
        if depth != 0 {
            return None;
        }
    }
    let raw = &cur.src[start..cur.pos];
    (!raw.is_empty()).then_some(raw)
}

fn arg_value(cur: &mut Cursor<'_>) -> Option<ArgValue> {
    match cur.peek()? {
        quote @ ('"' | '\'') => {
            cur.bump();
            let text = quoted(cur, quote)?;
            // A quoted value that is exactly a parameter reference still binds.
            if let Some(name) = text.strip_prefix("@param.") {
                if !name.is_empty() && name.chars().all(is_ident) {
                    return Some(ArgValue::ParamRef {
                        name: name.to_string(),
                    });
                }
            }
            Some(ArgValue::Literal { text, quoted: true })
        }
        '@' if cur.rest().starts_with("@param.") => {
            let mark = cur.pos;
            cur.eat("@param.");
            if let Some(name) = cur.take_while(is_ident) {
                let name = name.to_string();
                let mut probe = cur.clone();
                probe.skip_ws();
                if matches!(probe.peek(), Some(',' | ')')) {
                    return Some(ArgValue::ParamRef { name });
                }
            }
            cur.pos = mark;
            bare(cur)
        }
        _ => bare(cur),
    }
}

/// Body of a quoted string after its opening quote. Backslash escapes the
/// next character; `\n` and `\t` expand.
fn quoted(cur: &mut Cursor<'_>, quote: char) -> Option<String> {
    let mut out = String::new();
    loop {
        match cur.bump()? {
            '\\' => match cur.bump()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                other => out.push(other),
            },
            c if c == quote => return Some(out),
            c => out.push(c),
        }
    }
}

/// Unquoted value: runs to the next top-level `,` or `)`, with bracket
/// nesting respected so `[1, 2]` and `{"a": 1}` stay whole.
fn bare(cur: &mut Cursor<'_>) -> Option<ArgValue> {
    let start = cur.pos;
    let mut depth = 0usize;
    loop {
        match cur.peek()? {
            ',' | ')' if depth == 0 => break,
            '\n' if depth == 0 => break,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.checked_sub(1)?,
            _ => {}
        }
        cur.bump();
    }
    let text = cur.src[start..cur.pos].trim_end();
    if text.is_empty() {
        return None;
    }
    Some(ArgValue::Literal {
        text: text.to_string(),
        quoted: false,
    })
}

fn resource(cur: &mut Cursor<'_>) -> Option<ResourceRef> {
    let server = cur.take_while(is_segment)?.to_string();
    if !cur.eat("://") {
        return None;
    }
    let start = cur.pos;
    let raw = cur.rest();
    let token_len = raw.find(char::is_whitespace).unwrap_or(raw.len());
    let path = raw[..token_len].trim_end_matches(RESOURCE_TRAILING);
    if path.is_empty() {
        return None;
    }
    cur.pos = start + path.len();
    Some(ResourceRef {
        server,
        path: path.to_string(),
    })
}

/// Dotted prompt name. A trailing `.` ends the sentence, not the name.
fn prompt_name(cur: &mut Cursor<'_>) -> Option<String> {
    let mut name = cur.take_while(is_segment)?.to_string();
    loop {
        let mut probe = cur.clone();
        if !probe.eat(".") {
            break;
        }
        match probe.take_while(is_segment) {
            Some(segment) => {
                name.push('.');
                name.push_str(segment);
                *cur = probe;
            }
            None => break,
        }
    }
    Some(name)
}

#[derive(Clone)]
struct Cursor<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str, pos: usize) -> Self {
        Self { src, pos }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    /// Consume the longest prefix matching `pred`; `None` if it is empty.
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest.find(|c: char| !pred(c)).unwrap_or(rest.len());
        if len == 0 {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !c.is_whitespace())
            .unwrap_or(rest.len());
        self.pos += len;
    }
}
