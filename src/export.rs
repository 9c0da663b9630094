//! Export driver.
//!
//! Wires a document source to a [`Serializer`], closes it, and returns the
//! manifest of produced files keyed by artifact label (`"stream_data"`).

use crate::config::ExportConfig;
use crate::document::Document;
use crate::error::{SpecError, SpecResult};
use crate::specfile::Serializer;
use crate::storage::{FileManager, Manifest, MultiFileManager};
use std::io::BufRead;
use std::path::PathBuf;

/// Files written by an export, and the error that stopped it early, if any.
#[derive(Debug)]
pub struct ExportOutcome {
    /// Files on disk when the export ended.
    pub manifest: Manifest,
    /// First error; documents after it were not read.
    pub error: Option<SpecError>,
}

impl ExportOutcome {
    /// The manifest, or the error if the export stopped early.
    pub fn into_result(self) -> SpecResult<Manifest> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.manifest),
        }
    }
}

/// Export `documents` as a SPEC file in `directory`.
///
/// `file_prefix` overrides the configured template. The first error stops the
/// export; the serializer is closed first so scans already completed stay on
/// disk. An `UnsupportedPlanKind` error is returned as-is so callers can skip
/// the run. Use [`export_outcome`] to also learn which files were written
/// before the error.
pub fn export<I>(
    documents: I,
    directory: impl Into<PathBuf>,
    file_prefix: Option<&str>,
    config: &ExportConfig,
) -> SpecResult<Manifest>
where
    I: IntoIterator<Item = Document>,
{
    export_outcome(documents, directory, file_prefix, config)?.into_result()
}

/// Like [`export`], but keeps the manifest when the export stops early.
///
/// Only an invalid configuration fails outright.
pub fn export_outcome<I>(
    documents: I,
    directory: impl Into<PathBuf>,
    file_prefix: Option<&str>,
    config: &ExportConfig,
) -> SpecResult<ExportOutcome>
where
    I: IntoIterator<Item = Document>,
{
    let mut config = config.clone();
    if let Some(prefix) = file_prefix {
        config.file_prefix = prefix.to_string();
    }
    config.validate()?;
    Ok(run(documents, MultiFileManager::new(directory), config))
}

/// Export through an arbitrary file manager.
pub fn export_with<I, M>(documents: I, manager: M, config: ExportConfig) -> SpecResult<Manifest>
where
    I: IntoIterator<Item = Document>,
    M: FileManager,
{
    run(documents, manager, config).into_result()
}

fn run<I, M>(documents: I, manager: M, config: ExportConfig) -> ExportOutcome
where
    I: IntoIterator<Item = Document>,
    M: FileManager,
{
    let mut serializer = Serializer::with_manager(manager, config);
    let mut error = None;
    for doc in documents {
        if let Err(err) = serializer.handle(doc) {
            error = Some(err);
            break;
        }
    }
    if let Err(close_err) = serializer.close() {
        if error.is_none() {
            error = Some(close_err);
        } else {
            tracing::warn!(error = %close_err, "failed to close serializer after error");
        }
    }
    let manifest = serializer.artifacts().clone();
    let files = manifest.values().map(Vec::len).sum::<usize>();
    match &error {
        None => tracing::info!(files, "export complete"),
        Some(err) => tracing::warn!(files, error = %err, "export stopped early"),
    }
    ExportOutcome { manifest, error }
}

/// Read newline-delimited `["kind", {...}]` documents. Blank lines are skipped.
pub fn read_jsonl(reader: impl BufRead) -> SpecResult<Vec<Document>> {
    reader
        .lines()
        .enumerate()
        .filter(|(_, line)| line.as_ref().map_or(true, |l| !l.trim().is_empty()))
        .map(|(i, line)| {
            let line = line?;
            Document::from_json_line(&line).map_err(|err| match err {
                SpecError::Json(json) => SpecError::Json(serde::de::Error::custom(format!(
                    "line {}: {json}",
                    i + 1
                ))),
                other => other,
            })
        })
        .collect()
}
