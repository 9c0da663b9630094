//! Legacy SPEC file export for Bluesky-style run documents.
//!
//! This library converts the documents emitted by a data-acquisition run
//! (start, descriptor, event, event page, stop) into the plain-text SPEC format
//! read by long-standing beamline analysis tools. Output matches the retired
//! reference writer line for line for counts, absolute scans and relative scans.
//!
//! ```rust,no_run
//! use daq_specfile::{config::ExportConfig, document::Document, export::export};
//!
//! let documents: Vec<Document> = Vec::new();
//! let manifest = export(documents, "/tmp/spec", Some("{start[scan_id]}"), &ExportConfig::default())?;
//! println!("{:?}", manifest.get("stream_data"));
//! # Ok::<(), daq_specfile::error::SpecError>(())
//! ```

pub mod config;
pub mod document;
pub mod error;
pub mod export;
pub mod specfile;
pub mod storage;

pub use error::{SpecError, SpecResult};
pub use specfile::Serializer;
