//! Pipeline definition files.
//!
//! Pipelines normally come from the repository collaborator, but operators
//! can also author them as YAML or JSON documents (single pipeline, or a
//! bundle keyed by name under `pipelines:`). Format detection mirrors the
//! request path: the bundle shape is tried first so bundles are never
//! misread as single definitions with ignored fields.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result};
use conduit_types::Pipeline;
use serde::Deserialize;

/// A set of named pipeline definitions loaded from one file.
#[derive(Debug, Clone)]
pub struct PipelineBundle {
    pub pipelines: HashMap<String, Pipeline>,
}

/// Loads a pipeline file with automatic format detection.
///
/// YAML and JSON are both accepted (JSON is a YAML subset). Returns an error
/// when the file cannot be read or matches neither document shape.
pub fn parse_pipeline_file(file_path: impl AsRef<Path>) -> Result<PipelineBundle> {
    let file_path = file_path.as_ref();
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read pipeline file: {}", file_path.display()))?;
    parse_pipeline_document(&content)
}

/// Parses a pipeline document from a string.
pub fn parse_pipeline_document(content: &str) -> Result<PipelineBundle> {
    #[derive(Deserialize)]
    struct MultiPipelineDocument {
        pipelines: HashMap<String, Pipeline>,
    }

    if let Ok(document) = serde_yaml::from_str::<MultiPipelineDocument>(content) {
        return Ok(PipelineBundle {
            pipelines: document.pipelines,
        });
    }

    if let Ok(pipeline) = serde_yaml::from_str::<Pipeline>(content) {
        let mut pipelines = HashMap::new();
        pipelines.insert(pipeline.slug.clone(), pipeline);
        return Ok(PipelineBundle { pipelines });
    }

    anyhow::bail!(
        "unsupported pipeline document format; expected a single pipeline definition \
         or a multi-pipeline document with definitions under a 'pipelines' key"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::PipelineStatus;

    const SINGLE: &str = r#"
id: pipe-1
tenant_id: tenant-a
slug: onboard_user
name: Onboard user
status: active
steps:
  - step_number: 1
    slug: create
    target:
      kind: action
      integration_slug: crm
      action_slug: create_user
  - step_number: 2
    slug: notify
    target:
      kind: composite_tool
      slug: messenger
    input_mapping:
      user: "${steps.create.output.id}"
"#;

    #[test]
    fn parses_a_single_pipeline_definition() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pipeline.yaml");
        fs::write(&path, SINGLE).unwrap();

        let bundle = parse_pipeline_file(&path).expect("parse single pipeline");
        assert_eq!(bundle.pipelines.len(), 1);
        let pipeline = &bundle.pipelines["onboard_user"];
        assert_eq!(pipeline.status, PipelineStatus::Active);
        assert_eq!(pipeline.steps.len(), 2);
        assert_eq!(pipeline.steps[1].slug, "notify");
    }

    #[test]
    fn parses_a_multi_pipeline_bundle() {
        let content = r#"
pipelines:
  onboard:
    id: pipe-1
    tenant_id: tenant-a
    slug: onboard
    name: Onboard
    status: active
    steps:
      - step_number: 1
        slug: create
        target:
          kind: action
          integration_slug: crm
          action_slug: create_user
  offboard:
    id: pipe-2
    tenant_id: tenant-a
    slug: offboard
    name: Offboard
    status: draft
    steps: []
"#;
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bundle.yaml");
        fs::write(&path, content).unwrap();

        let bundle = parse_pipeline_file(&path).expect("parse bundle");
        assert_eq!(bundle.pipelines.len(), 2);
        assert_eq!(bundle.pipelines["offboard"].status, PipelineStatus::Draft);
    }

    #[test]
    fn rejects_unrecognized_documents() {
        let error = parse_pipeline_document("just: a\nrandom: mapping\n").unwrap_err();
        assert!(error.to_string().contains("unsupported pipeline document"));
    }

    #[test]
    fn json_documents_parse_too() {
        let content = serde_json::json!({
            "id": "pipe-9",
            "tenant_id": "tenant-a",
            "slug": "sync",
            "name": "Sync",
            "status": "active",
            "steps": [{
                "step_number": 1,
                "slug": "pull",
                "target": {"kind": "action", "integration_slug": "crm", "action_slug": "export"}
            }]
        })
        .to_string();
        let bundle = parse_pipeline_document(&content).expect("parse json");
        assert!(bundle.pipelines.contains_key("sync"));
    }
}
