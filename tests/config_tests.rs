//! Configuration file to running gateway state

use std::fs;

use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vmcp_gateway::config::Config;
use vmcp_gateway::gateway::Gateway;
use vmcp_gateway::protocol::Content;
use vmcp_gateway::resolver::{LintIssue, TemplateCache, lint};
use vmcp_gateway::virtual_server::VirtualServer;

fn write_config(dir: &TempDir) -> std::path::PathBuf {
    fs::write(dir.path().join("style.md"), "Be concise.").unwrap();
    let yaml = format!(
        r#"
server:
  port: 39501
resolution:
  max_depth: 4
  timeout: 10s
blobs:
  dir: {blobs}
virtual_servers:
  - name: writer
    environment_variables:
      tone: formal
    resources:
      - path: {style}
    prompts:
      - name: brief
        text: "Tone: @config.tone. @resource.vmcp://style.md"
        environment_variables: [tone]
      - name: sloppy
        text: "@param.topic @config.secret"
"#,
        blobs = dir.path().join("blobs").display(),
        style = dir.path().join("style.md").display(),
    );
    let path = dir.path().join("gateway.yaml");
    fs::write(&path, yaml).unwrap();
    path
}

#[tokio::test]
async fn seeds_resources_and_resolves_from_file_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(Some(&write_config(&dir))).unwrap();
    assert_eq!(config.server.port, 39501);
    assert_eq!(config.resolution.max_depth, 4);

    let gateway = Gateway::new(config).await.unwrap();
    let writer = gateway.servers().get("writer").await.unwrap();

    let uris: Vec<_> = writer
        .list_resources()
        .await
        .unwrap()
        .resources
        .into_iter()
        .map(|r| r.uri)
        .collect();
    assert_eq!(uris, vec!["vmcp://style.md"]);

    let result = writer
        .get_prompt("brief", None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        result.messages[0].content,
        Content::text("Tone: formal. Be concise.")
    );

    // Content-addressed blob landed on disk
    let stored = fs::read_dir(dir.path().join("blobs")).unwrap().count();
    assert!(stored >= 1);
}

#[test]
fn lint_flags_undeclared_references_in_file_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(Some(&write_config(&dir))).unwrap();
    let server = VirtualServer::from_config(&config.virtual_servers[0]);
    let definition = &config.virtual_servers[0];

    let reports = lint(&server, &definition.resources, &TemplateCache::new());
    assert_eq!(reports[0].prompt, "brief");
    assert!(reports[0].issues.is_empty());
    assert_eq!(
        reports[1].issues,
        vec![
            LintIssue::UndeclaredParam("topic".into()),
            LintIssue::UndeclaredConfig("secret".into()),
        ]
    );
}

#[test]
fn unseeded_local_resource_is_reported() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(Some(&write_config(&dir))).unwrap();
    let server = VirtualServer::from_config(&config.virtual_servers[0]);
    let reports = lint(&server, &[], &TemplateCache::new());
    assert_eq!(
        reports[0].issues,
        vec![LintIssue::MissingResource("style.md".into())]
    );
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.yaml"))).is_err());
}
