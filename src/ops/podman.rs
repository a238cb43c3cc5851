//! Seed image operations run with podman on the host.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::info;

use crate::host::HostExecutor;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

pub async fn pull(executor: &HostExecutor, image: &str, auth_file: &Path) -> Result<()> {
    let auth_file = auth_file.to_string_lossy();
    executor
        .execute("podman", &["pull", "--authfile", &auth_file, image])
        .await?;
    info!(image, "Pulled image");
    Ok(())
}

pub async fn inspect_labels(executor: &HostExecutor, image: &str) -> Result<HashMap<String, String>> {
    let output = executor
        .execute("podman", &["inspect", "--format", "json", image])
        .await?;
    parse_inspect_labels(image, &output)
}

/// Labels of the single image in `podman inspect` JSON output.
fn parse_inspect_labels(image: &str, output: &str) -> Result<HashMap<String, String>> {
    let mut entries: Vec<InspectEntry> = serde_json::from_str(output)
        .with_context(|| format!("failed to parse podman inspect output for {image}"))?;

    if entries.len() != 1 {
        bail!(
            "expected exactly one image for {image}, podman inspect returned {}",
            entries.len()
        );
    }

    let entry = entries.remove(0);
    Ok(entry
        .labels
        .or_else(|| entry.config.and_then(|c| c.labels))
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_image_labels() {
        let output = r#"[{"Id":"abc","Labels":{"com.openshift.lifecycle-agent.seed_format_version":"3"}}]"#;
        let labels = parse_inspect_labels("seed", output).unwrap();
        assert_eq!(
            labels.get("com.openshift.lifecycle-agent.seed_format_version"),
            Some(&"3".to_string())
        );
    }

    #[test]
    fn test_parse_labels_from_config() {
        let output = r#"[{"Id":"abc","Labels":null,"Config":{"Labels":{"a":"b"}}}]"#;
        let labels = parse_inspect_labels("seed", output).unwrap();
        assert_eq!(labels.get("a"), Some(&"b".to_string()));
    }

    #[test]
    fn test_parse_requires_exactly_one_image() {
        let err = parse_inspect_labels("seed", "[]").unwrap_err();
        assert!(err.to_string().contains("returned 0"));

        let err = parse_inspect_labels("seed", r#"[{"Labels":{}},{"Labels":{}}]"#).unwrap_err();
        assert!(err.to_string().contains("returned 2"));
    }

    #[test]
    fn test_parse_invalid_output() {
        assert!(parse_inspect_labels("seed", "not json").is_err());
    }
}
