//! Resolution Engine
//!
//! Turns a custom prompt plus caller arguments into text. Directives are
//! evaluated strictly left to right, one at a time; the first failure aborts
//! the whole resolution and no partial text is returned.
//!
//! `@prompt` references recurse with an empty argument binding. The chain of
//! prompts being expanded travels down the call as an owned stack, so cycle
//! detection never shares state between concurrent resolutions.

mod cache;
mod lint;

pub use cache::TemplateCache;
pub use lint::{LintIssue, PromptReport, lint};

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vmcp_core::{ArgValue, Node, ResourceRef, ToolCall, TypeHint, coerce_argument};

use crate::aggregator::Namespace;
use crate::config::ResolutionConfig;
use crate::protocol::{Content, PromptMessage, ToolsCallResult};
use crate::virtual_server::{BlobStore, CustomPrompt, LOCAL_SCHEME, VirtualServer, is_textual};
use crate::{Error, Result};

/// Everything one top-level resolution reads. The namespace is a single
/// snapshot taken when the request started.
pub struct ResolutionContext<'a> {
    /// Owning virtual server
    pub server: &'a VirtualServer,
    /// Aggregated namespace snapshot
    pub namespace: Arc<Namespace>,
    /// Storage for virtual-server-local resources
    pub blobs: &'a dyn BlobStore,
    /// Caller cancellation
    pub cancel: CancellationToken,
}

/// The engine; holds only the parse cache and limits
pub struct Resolver {
    limits: ResolutionConfig,
    templates: TemplateCache,
}

impl Resolver {
    /// Engine with the given limits
    #[must_use]
    pub fn new(limits: ResolutionConfig) -> Self {
        Self {
            limits,
            templates: TemplateCache::new(),
        }
    }

    /// Parse cache
    #[must_use]
    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    /// Resolve `prompt` with `args` into the final text.
    ///
    /// Caller cancellation and the configured timeout both end the
    /// resolution at its next suspension point with [`Error::Cancelled`].
    /// Tool calls already dispatched are not rolled back.
    ///
    /// # Errors
    ///
    /// Any error of the resolution taxonomy; the first failing directive
    /// aborts the resolution.
    pub async fn resolve(
        &self,
        ctx: &ResolutionContext<'_>,
        prompt: &str,
        args: HashMap<String, String>,
    ) -> Result<String> {
        let custom = ctx
            .server
            .prompt(prompt)
            .ok_or_else(|| Error::PromptNotFound(prompt.to_string()))?;
        self.templates
            .retain_prompts(&ctx.server.name, |name| ctx.server.prompt(name).is_some());
        let work = self.expand(ctx, custom, args, vec![custom.name.clone()]);

        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.limits.timeout, work) => {
                result.unwrap_or(Err(Error::Cancelled))
            }
        };
        if let Err(e) = &outcome {
            warn!(prompt, kind = e.kind(), error = %e, "Prompt resolution failed");
        }
        outcome
    }

    /// Resolve and wrap as a single user message
    ///
    /// # Errors
    ///
    /// As [`resolve`](Self::resolve).
    pub async fn resolve_message(
        &self,
        ctx: &ResolutionContext<'_>,
        prompt: &str,
        args: HashMap<String, String>,
    ) -> Result<PromptMessage> {
        self.resolve(ctx, prompt, args)
            .await
            .map(PromptMessage::user)
    }

    fn expand<'a>(
        &'a self,
        ctx: &'a ResolutionContext<'a>,
        prompt: &'a CustomPrompt,
        args: HashMap<String, String>,
        stack: Vec<String>,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let bindings = bind_arguments(prompt, args)?;
            let template = self.templates.get(&ctx.server.name, &prompt.name, &prompt.text);
            let mut out = String::with_capacity(prompt.text.len());

            for node in template.nodes() {
                if ctx.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                if !matches!(node, Node::Literal(_)) {
                    debug!(prompt = %prompt.name, kind = node.kind(), "Resolving directive");
                }
                match node {
                    Node::Literal(text) => out.push_str(text),
                    Node::ParamRef(name) => out.push_str(param(prompt, &bindings, name)?),
                    Node::ConfigRef(name) => out.push_str(config(ctx.server, prompt, name)?),
                    Node::ToolCall(call) => {
                        let text = self.call_tool(ctx, prompt, &bindings, call).await?;
                        out.push_str(&text);
                    }
                    Node::ResourceRef(resource) => {
                        out.push_str(&read_resource(ctx, resource).await?);
                    }
                    Node::PromptRef(name) => {
                        let text = self.expand_reference(ctx, name, &stack).await?;
                        out.push_str(&text);
                    }
                }
            }
            Ok(out)
        })
    }

    async fn expand_reference(
        &self,
        ctx: &ResolutionContext<'_>,
        name: &str,
        stack: &[String],
    ) -> Result<String> {
        let Some(target) = ctx.server.prompt(name) else {
            return backend_prompt(ctx, name).await;
        };
        if stack.iter().any(|s| s == name) {
            let mut chain = stack.to_vec();
            chain.push(name.to_string());
            return Err(Error::CyclicPromptReference { chain });
        }
        if stack.len() > self.limits.max_depth {
            return Err(Error::RecursionDepthExceeded(self.limits.max_depth));
        }
        let mut next = stack.to_vec();
        next.push(name.to_string());
        self.expand(ctx, target, HashMap::new(), next).await
    }

    async fn call_tool(
        &self,
        ctx: &ResolutionContext<'_>,
        prompt: &CustomPrompt,
        bindings: &HashMap<String, String>,
        call: &ToolCall,
    ) -> Result<String> {
        let reference = call.reference();
        let arguments = tool_arguments(prompt, bindings, call, &reference)?;
        let target = ctx.namespace.resolve_tool(&reference)?;
        let result = target
            .connection
            .call_tool(&target.local_name, Value::Object(arguments))
            .await?;
        Ok(render_tool_result(&result))
    }
}

/// Validate caller arguments against the declared variables and apply
/// defaults.
fn bind_arguments(
    prompt: &CustomPrompt,
    args: HashMap<String, String>,
) -> Result<HashMap<String, String>> {
    if let Some(unknown) = args.keys().find(|k| prompt.variable(k).is_none()) {
        return Err(Error::UnknownParameter {
            prompt: prompt.name.clone(),
            name: unknown.clone(),
        });
    }
    let mut bindings = args;
    for variable in &prompt.variables {
        if bindings.contains_key(&variable.name) {
            continue;
        }
        match &variable.default {
            Some(default) => {
                bindings.insert(variable.name.clone(), default.clone());
            }
            None if variable.required => {
                return Err(Error::MissingRequiredParameter {
                    prompt: prompt.name.clone(),
                    name: variable.name.clone(),
                });
            }
            None => {}
        }
    }
    Ok(bindings)
}

fn param<'b>(
    prompt: &CustomPrompt,
    bindings: &'b HashMap<String, String>,
    name: &str,
) -> Result<&'b str> {
    if prompt.variable(name).is_none() {
        return Err(Error::UnknownParameter {
            prompt: prompt.name.clone(),
            name: name.to_string(),
        });
    }
    bindings
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::MissingRequiredParameter {
            prompt: prompt.name.clone(),
            name: name.to_string(),
        })
}

fn config<'s>(server: &'s VirtualServer, prompt: &CustomPrompt, name: &str) -> Result<&'s str> {
    if !prompt.allows_config(name) {
        return Err(Error::UnauthorizedConfigAccess {
            prompt: prompt.name.clone(),
            name: name.to_string(),
        });
    }
    server
        .environment_variables
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::UnknownConfig(name.to_string()))
}

/// Inline arguments first, then the prompt's declared defaults for this
/// tool. Nested `@param` values bind from the caller's arguments.
fn tool_arguments(
    prompt: &CustomPrompt,
    bindings: &HashMap<String, String>,
    call: &ToolCall,
    reference: &str,
) -> Result<Map<String, Value>> {
    let defaults = prompt.tool_defaults(reference, &call.tool);
    let mut arguments = Map::new();

    for arg in &call.args {
        let hint = arg.type_hint.as_ref();
        let value = match &arg.value {
            Some(ArgValue::Literal { text, quoted }) => Some(coerce_argument(text, *quoted, hint)),
            Some(ArgValue::ParamRef { name }) => {
                let bound = param(prompt, bindings, name)?;
                Some(coerce_argument(bound, hint.is_none(), hint))
            }
            None => defaults
                .and_then(|d| d.get(&arg.name))
                .map(|v| default_value(prompt, bindings, v, hint))
                .transpose()?,
        };
        if let Some(value) = value {
            arguments.insert(arg.name.clone(), value);
        }
    }

    if let Some(defaults) = defaults {
        for (name, value) in defaults {
            if !arguments.contains_key(name) {
                let value = default_value(prompt, bindings, value, None)?;
                arguments.insert(name.clone(), value);
            }
        }
    }
    Ok(arguments)
}

fn default_value(
    prompt: &CustomPrompt,
    bindings: &HashMap<String, String>,
    value: &Value,
    hint: Option<&TypeHint>,
) -> Result<Value> {
    match value {
        Value::String(s) => match s.strip_prefix("@param.") {
            Some(name) => {
                let bound = param(prompt, bindings, name)?;
                Ok(coerce_argument(bound, hint.is_none(), hint))
            }
            None => Ok(hint.map_or_else(|| value.clone(), |h| coerce_argument(s, true, Some(h)))),
        },
        other => Ok(other.clone()),
    }
}

/// Text blocks joined by newlines; structured content when there is no text
fn render_tool_result(result: &ToolsCallResult) -> String {
    let texts: Vec<&str> = result.content.iter().filter_map(Content::as_text).collect();
    if texts.is_empty() {
        if let Some(structured) = &result.structured_content {
            return structured.to_string();
        }
    }
    texts.join("\n")
}

async fn read_resource(ctx: &ResolutionContext<'_>, resource: &ResourceRef) -> Result<String> {
    let uri = resource.uri();
    let (bytes, content_type) = if resource.server == LOCAL_SCHEME {
        let local = ctx
            .server
            .resource(&resource.path)
            .ok_or_else(|| Error::ResourceNotFound(uri.clone()))?;
        let (bytes, stored_type) = ctx.blobs.get(&local.blob_id).await?;
        let content_type = if stored_type.is_empty() {
            local.content_type.clone()
        } else {
            stored_type
        };
        (bytes, content_type)
    } else {
        let target = ctx
            .namespace
            .resolve_locator(&resource.server, &resource.path)?;
        target
            .connection
            .read_resource_bytes(&target.local_name)
            .await?
    };

    if !is_textual(&content_type) {
        return Err(Error::UnrenderableResource { uri, content_type });
    }
    String::from_utf8(bytes).map_err(|_| Error::UnrenderableResource { uri, content_type })
}

async fn backend_prompt(ctx: &ResolutionContext<'_>, name: &str) -> Result<String> {
    let target = ctx.namespace.resolve_prompt(name)?;
    let result = target.connection.get_prompt(&target.local_name, None).await?;
    Ok(result
        .messages
        .iter()
        .filter_map(|m| m.content.as_text())
        .collect::<Vec<_>>()
        .join("\n"))
}
