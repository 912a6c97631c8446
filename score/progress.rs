use std::fmt;

/// Stages reported while precomputing turbo tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TurboBuildStage {
    Evaluation,
    Persistence,
}

impl TurboBuildStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Evaluation => "noise model evaluation",
            Self::Persistence => "table persistence",
        }
    }
}

impl fmt::Display for TurboBuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting incremental progress while building or saving tables.
///
/// Tables for different molecule counts are produced on different threads, so the
/// callbacks take `&self` and implementations must be `Sync`.
pub trait TurboBuildObserver: Sync {
    fn on_stage_start(&self, stage: TurboBuildStage, total_tables: usize) {
        let _ = (stage, total_tables);
    }
    fn on_table_finished(&self, stage: TurboBuildStage, molecules: u32) {
        let _ = (stage, molecules);
    }
    fn on_stage_finish(&self, stage: TurboBuildStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopTurboProgress;

impl TurboBuildObserver for NoopTurboProgress {}
