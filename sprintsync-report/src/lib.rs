//! # sprintsync-report
//!
//! Tera-based Markdown reports for snapshot comparisons and work queues.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sprintsync_engine::ComparisonResult;
//! use sprintsync_report::Renderer;
//!
//! fn print_report(result: &ComparisonResult) {
//!     if let Ok(renderer) = Renderer::new() {
//!         if let Ok(markdown) = renderer.render_comparison(result) {
//!             println!("{markdown}");
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod engine;
pub mod error;

pub use context::{ComparisonCtx, QueueCtx};
pub use engine::{Renderer, ReportKind};
pub use error::RenderError;
