//! Tera rendering engine: [`ReportKind`] enum and [`Renderer`].
//!
//! | Report     | Template                  |
//! |------------|---------------------------|
//! | Comparison | `reports/comparison.md.tera` |
//! | Queue      | `reports/queue.md.tera`      |
//!
//! A user template directory (`~/.sprintsync/templates/`) may override any
//! embedded template by relative name, e.g. `reports/queue.md.tera`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tera::Tera;

use sprintsync_core::types::Queue;
use sprintsync_engine::ComparisonResult;

use crate::context::{ComparisonCtx, QueueCtx};
use crate::error::RenderError;

// ---------------------------------------------------------------------------
// Embedded templates: baked into the binary at compile time via include_str!
// ---------------------------------------------------------------------------

const TPLS: &[(&str, &str)] = &[
    ("shared/_header.tera", include_str!("templates/_partials/header.tera")),
    ("shared/_macros.tera", include_str!("templates/_partials/macros.tera")),
    (
        "reports/comparison.md.tera",
        include_str!("templates/comparison.md.tera"),
    ),
    ("reports/queue.md.tera", include_str!("templates/queue.md.tera")),
];

// ---------------------------------------------------------------------------
// Template loading helpers
// ---------------------------------------------------------------------------

fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RenderError {
    RenderError::Io {
        path: path.into(),
        source,
    }
}

fn normalize_template_name(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/").to_lowercase()
}

/// Every `*.tera` file below `dir`, keyed by its normalised relative path.
/// A missing directory yields no overrides.
fn load_user_templates(dir: &Path) -> Result<Vec<(String, String)>, RenderError> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut templates = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| io_err(&current, e))?;
        for entry in entries {
            let path = entry.map_err(|e| io_err(&current, e))?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|s| s.to_str()) != Some("tera") {
                continue;
            }
            let rel = path.strip_prefix(dir).unwrap_or(path.as_path());
            let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            templates.push((normalize_template_name(rel), contents));
        }
    }
    Ok(templates)
}

fn build_tera(user_template_dir: Option<&Path>) -> Result<Tera, RenderError> {
    let mut templates: HashMap<String, String> = TPLS
        .iter()
        .map(|(name, content)| (normalize_template_name(Path::new(name)), (*content).to_string()))
        .collect();
    if let Some(dir) = user_template_dir {
        templates.extend(load_user_templates(dir)?);
    }

    let mut tera = Tera::default();
    tera.add_raw_templates(templates)?;
    Ok(tera)
}

// ---------------------------------------------------------------------------
// ReportKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    Comparison,
    Queue,
}

impl ReportKind {
    pub fn all() -> &'static [ReportKind] {
        &[ReportKind::Comparison, ReportKind::Queue]
    }

    pub fn template_name(&self) -> &'static str {
        match self {
            ReportKind::Comparison => "reports/comparison.md.tera",
            ReportKind::Queue => "reports/queue.md.tera",
        }
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Markdown renderer for comparisons and queues.
///
/// Template names are normalised to lowercase relative paths, so an
/// override at `reports/Queue.md.tera` still replaces the embedded queue
/// template. Create once and reuse.
pub struct Renderer {
    tera: Tera,
}

impl Renderer {
    /// Embedded templates only.
    pub fn new() -> Result<Self, RenderError> {
        Ok(Renderer {
            tera: build_tera(None)?,
        })
    }

    /// Embedded templates plus overrides from `dir`.
    pub fn with_overrides(dir: &Path) -> Result<Self, RenderError> {
        Ok(Renderer {
            tera: build_tera(Some(dir))?,
        })
    }

    pub fn render(&self, kind: ReportKind, ctx: &tera::Context) -> Result<String, RenderError> {
        Ok(self.tera.render(kind.template_name(), ctx)?)
    }

    pub fn render_comparison(&self, result: &ComparisonResult) -> Result<String, RenderError> {
        let ctx = ComparisonCtx::from_result(result).to_tera_context()?;
        self.render(ReportKind::Comparison, &ctx)
    }

    pub fn render_queue(&self, queue: &Queue) -> Result<String, RenderError> {
        let ctx = QueueCtx::from_queue(queue).to_tera_context()?;
        self.render(ReportKind::Queue, &ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn renderer_new_succeeds() {
        Renderer::new().expect("Renderer::new should succeed with embedded templates");
    }

    #[test]
    fn every_report_kind_has_an_embedded_template() {
        let names: Vec<_> = TPLS.iter().map(|(name, _)| *name).collect();
        for kind in ReportKind::all() {
            assert!(
                names.contains(&kind.template_name()),
                "missing template for {kind:?}"
            );
        }
    }

    #[test]
    fn user_template_overrides_embedded_one() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("reports")).unwrap();
        std::fs::write(
            dir.path().join("reports").join("queue.md.tera"),
            "custom queue for {{ sprint_id }}",
        )
        .unwrap();

        let renderer = Renderer::with_overrides(dir.path()).unwrap();
        let mut ctx = tera::Context::new();
        ctx.insert("sprint_id", "S-9");
        let out = renderer.render(ReportKind::Queue, &ctx).unwrap();
        assert_eq!(out, "custom queue for S-9");
    }

    #[test]
    fn non_tera_files_in_override_dir_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "{{ broken").unwrap();
        Renderer::with_overrides(dir.path()).expect("txt files must be skipped");
    }

    #[test]
    fn nested_override_names_are_lowercased() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("Reports")).unwrap();
        std::fs::write(
            dir.path().join("Reports").join("Comparison.md.tera"),
            "override",
        )
        .unwrap();

        let renderer = Renderer::with_overrides(dir.path()).unwrap();
        let out = renderer
            .render(ReportKind::Comparison, &tera::Context::new())
            .unwrap();
        assert_eq!(out, "override");
    }

    #[test]
    fn missing_override_dir_is_fine() {
        let dir = TempDir::new().unwrap();
        Renderer::with_overrides(&dir.path().join("absent")).expect("renderer");
    }
}
