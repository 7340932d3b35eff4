//! Ingestion of benchmark result directories into indexed per-family datasets.
//!
//! A directory of raw logs is scanned once: every log is classified by its file
//! name, its summary lines, memory statistics and histogram side-cars are
//! extracted and joined into one [`dataset::DataTable`] per benchmark family.
//! The resulting [`corpus::Corpus`] is cached as a single blob.

pub mod config;
pub mod corpus;
pub mod dataset;
pub mod experiment;
pub mod histogram;
pub mod memory;
pub mod migration;
pub mod summary;
