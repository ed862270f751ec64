pub mod orchestrator;
pub mod state;

pub use orchestrator::{
    CsvImportReport, CycleOutcome, CyclePhase, CycleReport, SyncOrchestrator,
};
pub use state::SyncStateTracker;
