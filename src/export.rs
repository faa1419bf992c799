//! Export of a generated app to an external git repository.
//!
//! The push runs inside the session's sandbox instance via the command
//! gateway, so the orchestration core never needs git or the repository
//! credentials locally. Best-effort: a failed step aborts with the failing
//! command's diagnostic and leaves session state untouched.

use std::time::Duration;

use anyhow::{bail, Result};
use serde::Deserialize;
use tracing::info;

use crate::sandbox::SandboxGateway;

const EXPORT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_BRANCH: &str = "main";
const DEFAULT_COMMIT_MESSAGE: &str = "Generated application export";

#[derive(Debug, Clone, Deserialize)]
pub struct ExportRequest {
    #[serde(rename = "repoUrl")]
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default, rename = "commitMessage")]
    pub commit_message: Option<String>,
}

/// Commit the instance's working tree and push it to the requested remote.
/// Returns a short human-readable summary on success.
pub async fn push_to_repo(
    sandbox: &dyn SandboxGateway,
    instance_id: &str,
    request: &ExportRequest,
) -> Result<String> {
    let repo_url = request.repo_url.trim();
    if repo_url.is_empty() {
        bail!("Export requires a repository URL");
    }
    let branch = request.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
    let message = request
        .commit_message
        .as_deref()
        .unwrap_or(DEFAULT_COMMIT_MESSAGE);

    let commands = vec![
        "git init".to_string(),
        "git add -A".to_string(),
        format!("git commit -m {}", shell_quote(message)),
        format!("git branch -M {}", shell_quote(branch)),
        // Re-adding an existing remote fails; reset it instead.
        "git remote remove origin || true".to_string(),
        format!("git remote add origin {}", shell_quote(repo_url)),
        format!("git push -u origin {}", shell_quote(branch)),
    ];

    let results = sandbox
        .execute_commands(instance_id, &commands, EXPORT_TIMEOUT)
        .await?;

    for result in &results {
        if !result.success() {
            bail!("Export failed: {}", result.diagnostic());
        }
    }

    info!(
        "exported instance {} to {} ({})",
        instance_id, repo_url, branch
    );
    Ok(format!("Pushed generated app to {} on {}", repo_url, branch))
}

/// Single-quote a value for the sandbox shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::errors::SandboxError;
    use crate::sandbox::{
        AnalysisFinding, CommandResult, DeployResult, RuntimeErrorReport, SandboxFile,
        TemplateInfo,
    };
    use crate::session::state::TemplateDetails;

    /// Records executed commands; fails the command containing `fail_on`.
    struct RecordingSandbox {
        commands: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl RecordingSandbox {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                fail_on: fail_on.map(String::from),
            }
        }
    }

    #[async_trait]
    impl SandboxGateway for RecordingSandbox {
        async fn list_templates(&self) -> Result<Vec<TemplateInfo>, SandboxError> {
            Ok(vec![])
        }
        async fn template_details(&self, name: &str) -> Result<TemplateDetails, SandboxError> {
            Ok(TemplateDetails {
                name: name.into(),
                description: String::new(),
                files: vec![],
            })
        }
        async fn create_instance(&self, _template: &str) -> Result<String, SandboxError> {
            Ok("inst-1".into())
        }
        async fn write_files(
            &self,
            _instance_id: &str,
            _files: &[SandboxFile],
        ) -> Result<(), SandboxError> {
            Ok(())
        }
        async fn execute_commands(
            &self,
            _instance_id: &str,
            commands: &[String],
            _timeout: Duration,
        ) -> Result<Vec<CommandResult>, SandboxError> {
            let mut recorded = self.commands.lock().unwrap();
            recorded.extend(commands.iter().cloned());
            Ok(commands
                .iter()
                .map(|c| {
                    let failed = self
                        .fail_on
                        .as_deref()
                        .is_some_and(|needle| c.contains(needle));
                    CommandResult {
                        command: c.clone(),
                        exit_code: if failed { 128 } else { 0 },
                        stdout: String::new(),
                        stderr: if failed {
                            "fatal: could not read from remote".into()
                        } else {
                            String::new()
                        },
                        timed_out: false,
                    }
                })
                .collect())
        }
        async fn instance_errors(
            &self,
            _instance_id: &str,
        ) -> Result<Vec<RuntimeErrorReport>, SandboxError> {
            Ok(vec![])
        }
        async fn run_static_analysis(
            &self,
            _instance_id: &str,
            _files: &[String],
        ) -> Result<Vec<AnalysisFinding>, SandboxError> {
            Ok(vec![])
        }
        async fn deploy(&self, _instance_id: &str) -> Result<DeployResult, SandboxError> {
            Ok(DeployResult {
                preview_url: "https://p".into(),
                tunnel_url: None,
            })
        }
        async fn shutdown(&self, _instance_id: &str) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    fn request() -> ExportRequest {
        ExportRequest {
            repo_url: "https://github.com/user/app.git".into(),
            branch: None,
            commit_message: None,
        }
    }

    #[tokio::test]
    async fn test_push_runs_git_sequence_with_defaults() {
        let sandbox = RecordingSandbox::new(None);
        let summary = push_to_repo(&sandbox, "inst-1", &request()).await.unwrap();
        assert!(summary.contains("https://github.com/user/app.git"));
        assert!(summary.contains("main"));

        let commands = sandbox.commands.lock().unwrap();
        assert_eq!(commands[0], "git init");
        assert!(commands.iter().any(|c| c.contains("git push -u origin 'main'")));
        assert!(commands
            .iter()
            .any(|c| c.contains(DEFAULT_COMMIT_MESSAGE)));
    }

    #[tokio::test]
    async fn test_push_honors_branch_and_message() {
        let sandbox = RecordingSandbox::new(None);
        let req = ExportRequest {
            repo_url: "git@github.com:user/app.git".into(),
            branch: Some("release".into()),
            commit_message: Some("v1 snapshot".into()),
        };
        push_to_repo(&sandbox, "inst-1", &req).await.unwrap();

        let commands = sandbox.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c == "git branch -M 'release'"));
        assert!(commands.iter().any(|c| c.contains("'v1 snapshot'")));
    }

    #[tokio::test]
    async fn test_push_failure_surfaces_diagnostic() {
        let sandbox = RecordingSandbox::new(Some("git push"));
        let err = push_to_repo(&sandbox, "inst-1", &request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not read from remote"));
    }

    #[tokio::test]
    async fn test_push_rejects_empty_repo_url() {
        let sandbox = RecordingSandbox::new(None);
        let req = ExportRequest {
            repo_url: "  ".into(),
            branch: None,
            commit_message: None,
        };
        assert!(push_to_repo(&sandbox, "inst-1", &req).await.is_err());
        assert!(sandbox.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's done"), r"'it'\''s done'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }
}
