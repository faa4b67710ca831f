//! Chart rendering for Terraformer inputs
//!
//! A chart is a directory with a `templates/` folder. Every file in it is a
//! Tera template rendered with `Values` (the value map) and `Release`
//! (`Name`, `Namespace`) in scope.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;
use tera::{Context, Tera};
use tracing::debug;

use crate::{CoreError, Result};

/// Rendered chart files keyed by file name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderedChart {
    pub files: BTreeMap<String, String>,
}

impl RenderedChart {
    /// Content of a rendered file, failing if the chart did not produce it
    pub fn file(&self, name: &str) -> Result<&str> {
        self.files
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| CoreError::ChartRender(format!("chart did not render {}", name)))
    }
}

/// Renders charts into files
#[async_trait]
pub trait ChartRenderer: Send + Sync {
    async fn render(
        &self,
        chart_path: &Path,
        release_name: &str,
        namespace: &str,
        values: &serde_json::Value,
    ) -> Result<RenderedChart>;
}

/// Chart renderer backed by Tera templates on disk
#[derive(Clone, Debug, Default)]
pub struct TeraChartRenderer;

impl TeraChartRenderer {
    pub fn new() -> Self {
        Self
    }

    fn load(chart_path: &Path) -> Result<Vec<(String, String)>> {
        let templates_dir: PathBuf = chart_path.join("templates");
        let entries = std::fs::read_dir(&templates_dir).map_err(|e| {
            CoreError::ChartRender(format!("cannot read {}: {}", templates_dir.display(), e))
        })?;

        let mut templates = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CoreError::ChartRender(e.to_string()))?
                .path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    CoreError::ChartRender(format!("invalid template name {}", path.display()))
                })?
                .to_string();
            let content = std::fs::read_to_string(&path).map_err(|e| {
                CoreError::ChartRender(format!("cannot read {}: {}", path.display(), e))
            })?;
            templates.push((name, content));
        }
        Ok(templates)
    }

    /// Render in-memory templates; exposed for charts embedded in binaries
    pub fn render_templates(
        templates: &[(String, String)],
        release_name: &str,
        namespace: &str,
        values: &serde_json::Value,
    ) -> Result<RenderedChart> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        tera.add_raw_templates(templates.iter().map(|(n, c)| (n.as_str(), c.as_str())))
            .map_err(|e| CoreError::ChartRender(format_tera_error(&e)))?;

        let context = Context::from_serialize(json!({
            "Values": values,
            "Release": {"Name": release_name, "Namespace": namespace},
        }))
        .map_err(|e| CoreError::ChartRender(format_tera_error(&e)))?;

        let mut files = BTreeMap::new();
        for (name, _) in templates {
            let rendered = tera
                .render(name, &context)
                .map_err(|e| CoreError::ChartRender(format!("{}: {}", name, format_tera_error(&e))))?;
            files.insert(name.clone(), rendered);
        }

        Ok(RenderedChart { files })
    }
}

#[async_trait]
impl ChartRenderer for TeraChartRenderer {
    async fn render(
        &self,
        chart_path: &Path,
        release_name: &str,
        namespace: &str,
        values: &serde_json::Value,
    ) -> Result<RenderedChart> {
        let templates = Self::load(chart_path)?;
        debug!(
            chart = %chart_path.display(),
            templates = templates.len(),
            "Rendering chart"
        );
        Self::render_templates(&templates, release_name, namespace, values)
    }
}

// Tera hides the interesting part of an error in its source chain
fn format_tera_error(e: &tera::Error) -> String {
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn templates() -> Vec<(String, String)> {
        vec![
            (
                "main.tf".to_string(),
                r#"region = "{{ Values.region }}"
{% if Values.extra is defined %}extra = "{{ Values.extra }}"{% endif %}
ns = "{{ Release.Namespace }}""#
                    .to_string(),
            ),
            ("variables.tf".to_string(), "variable \"X\" {}".to_string()),
        ]
    }

    #[test]
    fn test_render_templates() {
        let chart = TeraChartRenderer::render_templates(
            &templates(),
            "infra",
            "shoot--foo--bar",
            &json!({"region": "eu-west-1", "extra": "<raw>"}),
        )
        .unwrap();

        let main = chart.file("main.tf").unwrap();
        assert!(main.contains(r#"region = "eu-west-1""#));
        assert!(main.contains(r#"extra = "<raw>""#));
        assert!(main.contains(r#"ns = "shoot--foo--bar""#));
        assert_eq!(chart.file("variables.tf").unwrap(), "variable \"X\" {}");
    }

    #[test]
    fn test_optional_value_absent() {
        let chart = TeraChartRenderer::render_templates(
            &templates(),
            "infra",
            "ns",
            &json!({"region": "eu-west-1"}),
        )
        .unwrap();

        assert!(!chart.file("main.tf").unwrap().contains("extra"));
    }

    #[test]
    fn test_missing_required_value() {
        let result =
            TeraChartRenderer::render_templates(&templates(), "infra", "ns", &json!({}));
        assert!(matches!(result, Err(CoreError::ChartRender(_))));
    }

    #[test]
    fn test_missing_file() {
        let chart = RenderedChart::default();
        assert!(matches!(chart.file("main.tf"), Err(CoreError::ChartRender(_))));
    }

    #[tokio::test]
    async fn test_missing_chart_directory() {
        let result = TeraChartRenderer::new()
            .render(Path::new("/nonexistent/chart"), "infra", "ns", &json!({}))
            .await;
        assert!(matches!(result, Err(CoreError::ChartRender(_))));
    }
}
