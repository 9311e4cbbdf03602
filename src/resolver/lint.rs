//! Static checks over custom prompt templates
//!
//! Finds what would fail at resolution time without contacting any
//! backend. Tool and backend-prompt references are only checked for a
//! plausible owner, since catalogs are not known offline. Resource seeds
//! count as uploaded.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::Serialize;

use super::TemplateCache;
use crate::config::ResourceSeed;
use crate::virtual_server::{CustomPrompt, LOCAL_SCHEME, VirtualServer};

/// One finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", content = "name", rename_all = "snake_case")]
pub enum LintIssue {
    /// `@param` name not in `variables`
    UndeclaredParam(String),
    /// `@config` key not in `environment_variables`
    UndeclaredConfig(String),
    /// Declared `@config` key with no value on the virtual server
    MissingConfigValue(String),
    /// `@prompt` target that is neither a custom prompt nor qualified by a
    /// composed backend
    UnknownPrompt(String),
    /// `@tool.<server>.<tool>` where `<server>` is not a composed backend
    UnknownToolServer(String),
    /// `@resource.vmcp://` file that is not uploaded
    MissingResource(String),
    /// `@prompt` chain that loops back
    Cycle(Vec<String>),
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndeclaredParam(n) => write!(f, "@param.{n} is not a declared variable"),
            Self::UndeclaredConfig(n) => {
                write!(f, "@config.{n} is not listed in environment_variables")
            }
            Self::MissingConfigValue(n) => write!(f, "config '{n}' has no value"),
            Self::UnknownPrompt(n) => write!(f, "@prompt.{n} matches no custom prompt or backend"),
            Self::UnknownToolServer(n) => write!(f, "@tool.{n} names an unknown backend"),
            Self::MissingResource(n) => write!(f, "vmcp://{n} is not uploaded"),
            Self::Cycle(chain) => write!(f, "cyclic reference {}", chain.join(" -> ")),
        }
    }
}

/// Findings for one prompt
#[derive(Debug, Clone, Serialize)]
pub struct PromptReport {
    /// Prompt name
    pub prompt: String,
    /// Number of directives in the template
    pub directives: usize,
    /// Findings, in template order
    pub issues: Vec<LintIssue>,
}

/// Check every custom prompt of `server`
#[must_use]
pub fn lint(
    server: &VirtualServer,
    seeds: &[ResourceSeed],
    templates: &TemplateCache,
) -> Vec<PromptReport> {
    let backends: HashSet<&str> = server.backends.iter().map(|b| b.name.as_str()).collect();
    let seeded: HashSet<String> = seeds.iter().filter_map(ResourceSeed::exposed_name).collect();
    server
        .prompts
        .iter()
        .map(|prompt| {
            let template = templates.get(&server.name, &prompt.name, &prompt.text);
            let mut issues = Vec::new();

            for name in template.param_refs().collect::<BTreeSet<_>>() {
                if prompt.variable(name).is_none() {
                    issues.push(LintIssue::UndeclaredParam(name.to_string()));
                }
            }
            for key in template.config_refs().collect::<BTreeSet<_>>() {
                if !prompt.allows_config(key) {
                    issues.push(LintIssue::UndeclaredConfig(key.to_string()));
                } else if !server.environment_variables.contains_key(key) {
                    issues.push(LintIssue::MissingConfigValue(key.to_string()));
                }
            }
            for call in template.tool_calls() {
                if let Some(owner) = &call.server {
                    if !backends.contains(owner.as_str()) {
                        issues.push(LintIssue::UnknownToolServer(call.reference()));
                    }
                }
            }
            for node in template.nodes() {
                if let vmcp_core::Node::ResourceRef(r) = node {
                    if r.server == LOCAL_SCHEME
                        && server.resource(&r.path).is_none()
                        && !seeded.contains(&r.path)
                    {
                        issues.push(LintIssue::MissingResource(r.path.clone()));
                    }
                }
            }
            for name in template.prompt_refs() {
                let qualified = name
                    .split_once('.')
                    .is_some_and(|(prefix, _)| backends.contains(prefix));
                if server.prompt(name).is_none() && !qualified {
                    issues.push(LintIssue::UnknownPrompt(name.to_string()));
                }
            }
            if let Some(chain) = find_cycle(server, prompt, templates) {
                issues.push(LintIssue::Cycle(chain));
            }

            PromptReport {
                prompt: prompt.name.clone(),
                directives: template.directive_count(),
                issues,
            }
        })
        .collect()
}

/// Depth-first walk of custom `@prompt` references starting at `start`
fn find_cycle(
    server: &VirtualServer,
    start: &CustomPrompt,
    templates: &TemplateCache,
) -> Option<Vec<String>> {
    fn walk(
        server: &VirtualServer,
        prompt: &CustomPrompt,
        templates: &TemplateCache,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        let template = templates.get(&server.name, &prompt.name, &prompt.text);
        for name in template.prompt_refs() {
            let Some(next) = server.prompt(name) else {
                continue;
            };
            if stack.iter().any(|s| s == name) {
                let mut chain = stack.clone();
                chain.push(name.to_string());
                return Some(chain);
            }
            stack.push(name.to_string());
            if let Some(chain) = walk(server, next, templates, stack) {
                return Some(chain);
            }
            stack.pop();
        }
        None
    }

    let mut stack = vec![start.name.clone()];
    walk(server, start, templates, &mut stack).filter(|chain| chain.first() == chain.last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_server::PromptVariable;
    use pretty_assertions::assert_eq;

    fn prompt(name: &str, text: &str) -> CustomPrompt {
        CustomPrompt {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    #[test]
    fn clean_prompt_has_no_issues() {
        let mut greet = prompt("greet", "Hello @param.name");
        greet.variables = vec![PromptVariable {
            name: "name".into(),
            required: true,
            ..Default::default()
        }];
        let server = VirtualServer {
            prompts: vec![greet],
            ..Default::default()
        };
        let reports = lint(&server, &[], &TemplateCache::new());
        assert_eq!(reports[0].directives, 1);
        assert!(reports[0].issues.is_empty());
    }

    #[test]
    fn reports_undeclared_names() {
        let mut p = prompt(
            "p",
            "@param.who @config.api_key @config.region @prompt.nowhere @tool.ghost.add(a = 1)",
        );
        p.environment_variables = vec!["region".into()];
        let server = VirtualServer {
            prompts: vec![p],
            ..Default::default()
        };
        let issues = &lint(&server, &[], &TemplateCache::new())[0].issues;
        assert_eq!(
            issues,
            &vec![
                LintIssue::UndeclaredParam("who".into()),
                LintIssue::UndeclaredConfig("api_key".into()),
                LintIssue::MissingConfigValue("region".into()),
                LintIssue::UnknownToolServer("ghost.add".into()),
                LintIssue::UnknownPrompt("nowhere".into()),
            ]
        );
    }

    #[test]
    fn detects_cycles() {
        let server = VirtualServer {
            prompts: vec![
                prompt("a", "@prompt.b"),
                prompt("b", "@prompt.a"),
                prompt("c", "@prompt.a"),
            ],
            ..Default::default()
        };
        let reports = lint(&server, &[], &TemplateCache::new());
        assert_eq!(
            reports[0].issues,
            vec![LintIssue::Cycle(vec!["a".into(), "b".into(), "a".into()])]
        );
        // c leads into a cycle but is not part of it
        assert!(reports[2].issues.is_empty());
    }
}
