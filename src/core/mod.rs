pub mod cache;
pub mod category;
pub mod corner;
pub mod digest;
pub mod executor;
pub mod fingerprint;
pub mod history;
pub mod matcher;
pub mod report;
pub mod retention;
pub mod scanner;

pub use category::CategoryLabel;
pub use executor::{Executor, RemovalMode};
pub use history::History;
pub use report::CleanupReport;
pub use scanner::{CleanupPlan, ScanError, ScannerService};
