//! Pipeline orchestration: land, cleanse, aggregate, analyse, audit.

pub mod aggregate;
pub mod audit;
pub mod cleanse;
pub mod config;
pub mod control;
pub mod insight;
pub mod pipeline;
pub mod snapshot;

pub use aggregate::{pivot_monthly, rebuild_monthly_aggregates};
pub use audit::{render_audit_report, RunRecorder};
pub use cleanse::{cleanse, compute_period_changes, CleanseReport};
pub use config::{load_registry_file, CleanseScope, PipelineConfig, SourceMode};
pub use control::{apply_control, ControlAction};
pub use insight::{
    GeminiInsightGenerator, InsightGenerator, InsightRequest, InsightStageOutcome,
    NoopInsightGenerator,
};
pub use pipeline::{Pipeline, PipelineStatus, TriggerOutcome};
pub use snapshot::{export_monthly_snapshot, SnapshotManifest};

pub const CRATE_NAME: &str = "eip-sync";
