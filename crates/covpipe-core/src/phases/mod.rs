//! Concrete phases of the standard job pipeline.

pub mod install;
pub mod report;
pub mod session;
pub mod test_run;

pub use install::InstallPhase;
pub use report::{CloseSessionPhase, ExportCoveragePhase};
pub use session::OpenSessionPhase;
pub use test_run::TestRunPhase;
