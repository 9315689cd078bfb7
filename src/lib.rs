pub mod baseline;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod deblend;
pub mod footprint;
pub mod geom;
pub mod image;
pub mod mapper;
pub mod models;
pub mod noise;
pub mod psf;
pub mod report;
pub mod task;
pub mod utils;

#[cfg(test)]
mod test_deblend;

// Re-export commonly used items
pub use baseline::NearestPeakDeblender;
pub use catalog::{Schema, SourceCatalog, SourceRecord};
pub use config::SourceDeblendConfig;
pub use deblend::{DeblendResult, Deblender, PeakOutcome};
pub use image::MaskedImage;
pub use noise::estimate_noise;
pub use psf::{GaussianPsf, Psf};
pub use report::DeblendReport;
pub use task::{DeblendKeys, SourceDeblendTask};
