//! SPEC file serialization.
//!
//! - [`classifier`]: maps a run start onto `ct`, `ascan` or `dscan` style scans
//! - [`record`]: builds the text block of one scan
//! - [`serializer`]: the document-stream state machine that owns the output file

pub mod classifier;
pub mod record;
pub mod serializer;

pub use classifier::{classify, Axis, ScanClassification, ScanKind};
pub use record::{ColumnLayout, FormatRules, ScanRecord};
pub use serializer::Serializer;
