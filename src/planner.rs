//! Template selection and blueprint generation.
//!
//! Both calls round-trip through the inference gateway and are
//! schema-validated on the way back. A template outside the candidate set or
//! a blueprint that fails validation is a fatal planning error; nothing
//! partial is committed.

use std::sync::Arc;

use serde::Deserialize;

use crate::errors::PlannerError;
use crate::inference::{infer_json, InferenceClient, InferenceRequest, ModelSettings};
use crate::sandbox::TemplateInfo;
use crate::session::state::{Blueprint, TemplateDetails};

/// File extensions the generator must not plan as phase-0 artifacts. These
/// are filtered out of the initial phase rather than failing the blueprint.
const DISALLOWED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "bin", "exe", "woff", "woff2", "ttf",
    "mp4", "mp3", "webm",
];

const TEMPLATE_SYSTEM_PROMPT: &str = r#"You are a project-template classifier. Given a product request and a list of available starter templates, choose the single best template.

Respond with valid JSON only, matching this schema:
{"template": "<name from the provided list>"}

Rules:
- The template name MUST be copied verbatim from the provided list.
- Do not invent template names.
"#;

const BLUEPRINT_SYSTEM_PROMPT: &str = r#"You are a software architect. Given a product request and a starter template, produce a phased implementation blueprint.

Respond with valid JSON only, matching this schema:
{
  "title": "Short product title",
  "description": "One-paragraph product description",
  "phases": [
    {
      "name": "Short phase name",
      "description": "What this phase builds",
      "files": [
        {"path": "src/relative/path.ts", "purpose": "What this file does"}
      ]
    }
  ]
}

Rules:
- Phase 0 lays down the complete project skeleton; later phases extend it incrementally.
- Every phase must list at least one file.
- Use paths relative to the template root.
- Only plan source/text files; never binary assets.
"#;

#[derive(Debug, Deserialize)]
struct TemplateChoice {
    template: String,
}

pub struct Planner {
    inference: Arc<dyn InferenceClient>,
}

impl Planner {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    /// Pick a starting template for the request. The result must be drawn
    /// from the supplied candidate set — anything else is fatal, never
    /// silently coerced.
    pub async fn select_template(
        &self,
        query: &str,
        candidates: &[TemplateInfo],
    ) -> Result<String, PlannerError> {
        if candidates.is_empty() {
            return Err(PlannerError::NoTemplates);
        }

        let listing = candidates
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n");
        let user = format!(
            "## Product request\n{}\n\n## Available templates\n{}\n\nRespond with JSON only.",
            query, listing
        );

        let choice: TemplateChoice = infer_json(
            self.inference.as_ref(),
            InferenceRequest::new(TEMPLATE_SYSTEM_PROMPT, user, ModelSettings::standard()),
        )
        .await?;

        if !candidates.iter().any(|t| t.name == choice.template) {
            return Err(PlannerError::TemplateNotInCandidates {
                name: choice.template,
            });
        }
        Ok(choice.template)
    }

    /// Produce a schema-validated blueprint. Validation failure propagates;
    /// no partial blueprint is ever accepted. Disallowed artifact types are
    /// filtered from the initial phase.
    pub async fn generate_blueprint(
        &self,
        query: &str,
        template: &TemplateDetails,
    ) -> Result<Blueprint, PlannerError> {
        let user = format!(
            "## Product request\n{}\n\n## Starter template\n{} — {}\n\nTemplate files:\n{}\n\nRespond with JSON only.",
            query,
            template.name,
            template.description,
            template.files.join("\n"),
        );

        let mut blueprint: Blueprint = infer_json(
            self.inference.as_ref(),
            InferenceRequest::new(BLUEPRINT_SYSTEM_PROMPT, user, ModelSettings::high_fidelity()),
        )
        .await?;

        validate_blueprint(&blueprint)?;
        filter_disallowed_artifacts(&mut blueprint);
        Ok(blueprint)
    }
}

fn validate_blueprint(blueprint: &Blueprint) -> Result<(), PlannerError> {
    if blueprint.title.trim().is_empty() {
        return Err(PlannerError::InvalidBlueprint("empty title".into()));
    }
    if blueprint.phases.is_empty() {
        return Err(PlannerError::InvalidBlueprint("no phases".into()));
    }
    for (i, phase) in blueprint.phases.iter().enumerate() {
        if phase.files.is_empty() {
            return Err(PlannerError::InvalidBlueprint(format!(
                "phase {} ('{}') lists no files",
                i, phase.name
            )));
        }
        if phase.files.iter().any(|f| f.path.trim().is_empty()) {
            return Err(PlannerError::InvalidBlueprint(format!(
                "phase {} contains an empty file path",
                i
            )));
        }
    }
    Ok(())
}

pub fn is_disallowed_artifact(path: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    DISALLOWED_EXTENSIONS.contains(&ext.as_str())
}

/// Drop binary/document artifacts from phase 0. Later phases are produced
/// incrementally against real feedback, so only the skeleton phase needs
/// the guard.
fn filter_disallowed_artifacts(blueprint: &mut Blueprint) {
    if let Some(phase0) = blueprint.phases.first_mut() {
        phase0.files.retain(|f| !is_disallowed_artifact(&f.path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::errors::InferenceError;
    use crate::session::state::{PhasePlan, PlannedFile};

    struct CannedClient {
        output: String,
    }

    #[async_trait]
    impl InferenceClient for CannedClient {
        async fn complete(&self, _req: InferenceRequest) -> Result<String, InferenceError> {
            Ok(self.output.clone())
        }
    }

    fn candidates() -> Vec<TemplateInfo> {
        vec![
            TemplateInfo {
                name: "vite-react".into(),
                description: "React starter".into(),
            },
            TemplateInfo {
                name: "astro-static".into(),
                description: "Static site starter".into(),
            },
        ]
    }

    fn planner(output: &str) -> Planner {
        Planner::new(Arc::new(CannedClient {
            output: output.into(),
        }))
    }

    #[tokio::test]
    async fn test_select_template_returns_candidate() {
        let p = planner(r#"{"template": "vite-react"}"#);
        let name = p.select_template("a todo app", &candidates()).await.unwrap();
        assert_eq!(name, "vite-react");
    }

    #[tokio::test]
    async fn test_select_template_outside_candidates_is_fatal() {
        let p = planner(r#"{"template": "nextjs-enterprise"}"#);
        let err = p
            .select_template("a todo app", &candidates())
            .await
            .unwrap_err();
        match err {
            PlannerError::TemplateNotInCandidates { name } => {
                assert_eq!(name, "nextjs-enterprise");
            }
            other => panic!("Expected TemplateNotInCandidates, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_select_template_empty_candidates() {
        let p = planner(r#"{"template": "vite-react"}"#);
        let err = p.select_template("a todo app", &[]).await.unwrap_err();
        assert!(matches!(err, PlannerError::NoTemplates));
    }

    fn template() -> TemplateDetails {
        TemplateDetails {
            name: "vite-react".into(),
            description: "React starter".into(),
            files: vec!["package.json".into(), "src/main.tsx".into()],
        }
    }

    #[tokio::test]
    async fn test_generate_blueprint_happy_path() {
        let p = planner(
            r#"{
                "title": "Todo App",
                "description": "Simple todo tracker",
                "phases": [
                    {"name": "skeleton", "description": "Project skeleton",
                     "files": [{"path": "src/App.tsx", "purpose": "root component"}]},
                    {"name": "storage", "description": "Persistence",
                     "files": [{"path": "src/store.ts", "purpose": "state store"}]}
                ]
            }"#,
        );
        let bp = p.generate_blueprint("a todo app", &template()).await.unwrap();
        assert_eq!(bp.title, "Todo App");
        assert_eq!(bp.phases.len(), 2);
    }

    #[tokio::test]
    async fn test_generate_blueprint_schema_failure_propagates() {
        let p = planner(r#"{"title": "Todo App"}"#); // missing phases
        let err = p
            .generate_blueprint("a todo app", &template())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::Inference(_)));
    }

    #[tokio::test]
    async fn test_generate_blueprint_rejects_empty_phase_list() {
        let p = planner(r#"{"title": "Todo App", "description": "d", "phases": []}"#);
        let err = p
            .generate_blueprint("a todo app", &template())
            .await
            .unwrap_err();
        assert!(matches!(err, PlannerError::InvalidBlueprint(_)));
    }

    #[tokio::test]
    async fn test_generate_blueprint_filters_binary_artifacts_from_phase_0() {
        let p = planner(
            r#"{
                "title": "Todo App",
                "description": "d",
                "phases": [
                    {"name": "skeleton", "description": "d",
                     "files": [
                        {"path": "src/App.tsx", "purpose": "root"},
                        {"path": "public/logo.png", "purpose": "logo"},
                        {"path": "docs/manual.pdf", "purpose": "manual"}
                     ]}
                ]
            }"#,
        );
        let bp = p.generate_blueprint("a todo app", &template()).await.unwrap();
        let paths: Vec<&str> = bp.phases[0].files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/App.tsx"]);
    }

    #[test]
    fn test_is_disallowed_artifact() {
        assert!(is_disallowed_artifact("assets/hero.PNG"));
        assert!(is_disallowed_artifact("report.pdf"));
        assert!(!is_disallowed_artifact("src/main.ts"));
        assert!(!is_disallowed_artifact("README.md"));
    }

    #[test]
    fn test_validate_blueprint_rejects_phase_without_files() {
        let bp = Blueprint {
            title: "T".into(),
            description: "d".into(),
            phases: vec![PhasePlan {
                name: "p0".into(),
                description: "d".into(),
                files: vec![],
            }],
        };
        assert!(validate_blueprint(&bp).is_err());

        let ok = Blueprint {
            title: "T".into(),
            description: "d".into(),
            phases: vec![PhasePlan {
                name: "p0".into(),
                description: "d".into(),
                files: vec![PlannedFile {
                    path: "a.ts".into(),
                    purpose: "x".into(),
                }],
            }],
        };
        assert!(validate_blueprint(&ok).is_ok());
    }
}
