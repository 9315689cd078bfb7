use crate::mapper::PeakSkip;
use serde::Serialize;

/// Outcome for one deblend candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Deblended { nchild: usize, skips: Vec<PeakSkip> },
    Failed { cause: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    /// Position of the parent in the catalog
    pub index: usize,
    pub parent_id: i64,
    pub npeaks: usize,
    pub too_many_peaks: bool,
    #[serde(flatten)]
    pub status: SourceStatus,
}

impl SourceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self.status, SourceStatus::Failed { .. })
    }

    pub fn nchild(&self) -> usize {
        match &self.status {
            SourceStatus::Deblended { nchild, .. } => *nchild,
            SourceStatus::Failed { .. } => 0,
        }
    }
}

/// Summary of one orchestrator run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeblendReport {
    /// Rows in the catalog when the run started
    pub n_input: usize,
    /// Rows with at least two peaks
    pub n_parents: usize,
    /// Child rows appended during the run
    pub n_children: usize,
    /// Rows in the catalog when the run finished
    pub n_total: usize,
    /// Noise level shared by every candidate
    pub sigma1: f64,
    /// One entry per candidate, in catalog order
    pub outcomes: Vec<SourceOutcome>,
}

impl DeblendReport {
    pub fn n_failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SourceOutcome> + '_ {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn outcome_for(&self, parent_id: i64) -> Option<&SourceOutcome> {
        self.outcomes.iter().find(|o| o.parent_id == parent_id)
    }

    pub fn summary(&self) -> String {
        let summary = format!(
            "Deblended: of {} sources, {} were deblended, creating {} children, total {} sources",
            self.n_input, self.n_parents, self.n_children, self.n_total
        );
        match self.n_failed() {
            0 => summary,
            n => format!("{} ({} failed)", summary, n),
        }
    }
}
