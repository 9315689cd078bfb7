pub mod deblend_sources;
pub mod list_runs;
pub mod show_catalog;

pub use deblend_sources::{deblend_sources, DeblendOptions};
pub use list_runs::list_runs;
pub use show_catalog::show_catalog;
