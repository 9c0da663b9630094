//! Document-stream state machine that writes SPEC files.
//!
//! # States
//!
//! ```text
//!            start (supported)                 stop
//!   Idle ─────────────────────────▶ InRun ───────────────▶ Idle
//!    │  start (unsupported)           │ column mismatch
//!    └─────────────▶ Skipping ◀───────┘
//!                       │ stop of the skipped run
//!                       └────────────────────────────────▶ Idle
//!
//!   any state ── close() / out-of-order document ──▶ Closed
//! ```
//!
//! The output file is named after the first accepted run start but only created
//! when its first scan is written, together with the file preamble. Every later
//! run appends to it and continues the scan numbering, so scans appear in the
//! file in the order their runs completed. A run discarded before its scan is
//! written leaves nothing on disk.

use super::classifier::classify;
use super::record::{file_header, ColumnLayout, FormatRules, ScanRecord};
use crate::config::ExportConfig;
use crate::document::{Document, Event, RunStart, RunStop, StreamDescriptor};
use crate::error::{SpecError, SpecResult};
use crate::storage::prefix::resolve_prefix;
use crate::storage::{FileManager, Manifest, MultiFileManager, STREAM_DATA};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

/// Extension of written SPEC files.
pub const SPEC_EXTENSION: &str = "spec";

/// Per-run bookkeeping alongside the scan being accumulated.
#[derive(Debug)]
struct OpenRun {
    record: ScanRecord,
    /// descriptor uid -> stream name
    descriptors: HashMap<String, String>,
    /// stream name -> uid of the first descriptor seen for it
    first_descriptor: HashMap<String, String>,
    /// stream name -> last accepted seq_num
    last_seq: HashMap<String, u64>,
}

enum State {
    Idle,
    InRun(Box<OpenRun>),
    Skipping { run_uid: String },
    Closed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::InRun(_) => "in run",
            State::Skipping { .. } => "skipping a rejected run",
            State::Closed => "closed",
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Output {
    writer: Box<dyn Write + Send>,
    file_name: String,
}

/// Output resolved from the first accepted run start, not yet created.
#[derive(Debug)]
struct PendingOutput {
    file_name: String,
    start_time: f64,
    owner: String,
}

/// Serializes run documents into a single SPEC file.
///
/// Documents must be fed in stream order through [`Serializer::handle`]. Call
/// [`Serializer::close`] when the stream ends; dropping an unclosed serializer
/// closes it on a best-effort basis.
pub struct Serializer<M: FileManager = MultiFileManager> {
    manager: M,
    config: ExportConfig,
    rules: FormatRules,
    state: State,
    output: Option<Output>,
    pending: Option<PendingOutput>,
    next_scan_number: u64,
}

impl Serializer<MultiFileManager> {
    /// Serializer writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>, config: ExportConfig) -> Self {
        Self::with_manager(MultiFileManager::new(directory), config)
    }
}

impl<M: FileManager> Serializer<M> {
    /// Serializer writing through a custom file manager.
    pub fn with_manager(manager: M, config: ExportConfig) -> Self {
        let rules = FormatRules {
            default_precision: config.default_precision,
        };
        Self {
            manager,
            config,
            rules,
            state: State::Idle,
            output: None,
            pending: None,
            next_scan_number: 1,
        }
    }

    /// Artifacts produced so far.
    pub fn artifacts(&self) -> &Manifest {
        self.manager.artifacts()
    }

    /// The file manager, e.g. to read back in-memory buffers.
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Number the next completed scan will carry.
    pub fn next_scan_number(&self) -> u64 {
        self.next_scan_number
    }

    /// Whether the serializer accepts no further documents.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Decode a `(kind, body)` pair and handle it.
    pub fn handle_pair(&mut self, kind: &str, body: serde_json::Value) -> SpecResult<()> {
        self.handle(Document::from_pair(kind, body)?)
    }

    /// Accept the next document of the stream.
    pub fn handle(&mut self, doc: Document) -> SpecResult<()> {
        tracing::trace!(kind = doc.kind(), state = self.state.name(), "document");
        match (&mut self.state, doc) {
            (State::Closed, doc) => Err(self.out_of_order(doc.kind())),
            (_, Document::Other(kind)) => {
                tracing::trace!(kind = %kind, "ignoring document without scan data");
                Ok(())
            }

            (State::Idle, Document::Start(start)) => self.start(start),
            (State::Idle, doc) => Err(self.fail(doc.kind())),

            (State::Skipping { run_uid }, Document::Stop(stop)) if stop.run_start == *run_uid => {
                tracing::debug!(run = %stop.run_start, "end of skipped run");
                self.state = State::Idle;
                Ok(())
            }
            (State::Skipping { run_uid }, doc) => {
                if doc.run_uid().is_some_and(|uid| uid != run_uid.as_str()) {
                    return Err(self.fail(doc.kind()));
                }
                Ok(())
            }

            (State::InRun(_), Document::Start(_)) => Err(self.fail("start")),
            (State::InRun(run), Document::Descriptor(descriptor)) => {
                if descriptor.run_start != run.record.run_uid {
                    return Err(self.fail("descriptor"));
                }
                let result = register_descriptor(run, descriptor, &self.config, &self.rules);
                self.skip_on_mismatch(result)
            }
            (State::InRun(run), Document::Event(event)) => {
                let result = accept_event(run, &event, &self.config.stream_name);
                self.check_event_result(result)
            }
            (State::InRun(run), Document::EventPage(page)) => {
                let result = page.events().and_then(|events| {
                    events
                        .iter()
                        .try_for_each(|event| accept_event(run, event, &self.config.stream_name))
                });
                self.check_event_result(result)
            }
            (State::InRun(run), Document::Stop(stop)) => {
                if stop.run_start != run.record.run_uid {
                    return Err(self.fail("stop"));
                }
                self.stop(stop)
            }
        }
    }

    /// Flush and release the output file.
    ///
    /// A scan still open is finalized with the rows accumulated so far.
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> SpecResult<()> {
        let state = std::mem::replace(&mut self.state, State::Closed);
        let result = match state {
            State::InRun(run) => {
                tracing::warn!(
                    run = %run.record.run_uid,
                    rows = run.record.rows.len(),
                    "closing before run stop; writing partial scan"
                );
                self.finalize(run.record)
            }
            State::Skipping { run_uid } => {
                tracing::debug!(run = %run_uid, "closing while skipping run");
                Ok(())
            }
            State::Idle | State::Closed => Ok(()),
        };
        let released = self.release();
        result.and(released)
    }

    fn start(&mut self, start: RunStart) -> SpecResult<()> {
        let classification = match classify(&start) {
            Ok(classification) => classification,
            Err(err) => {
                tracing::info!(run = %start.uid, error = %err, "skipping run");
                self.state = State::Skipping { run_uid: start.uid };
                return Err(err);
            }
        };

        if self.output.is_none() && self.pending.is_none() {
            self.pending = Some(self.plan_output(&start)?);
        }

        tracing::debug!(
            run = %start.uid,
            scan = self.next_scan_number,
            kind = ?classification.kind,
            "run accepted"
        );
        let record = ScanRecord::new(self.next_scan_number, &start.uid, classification, start.time);
        self.state = State::InRun(Box::new(OpenRun {
            record,
            descriptors: HashMap::new(),
            first_descriptor: HashMap::new(),
            last_seq: HashMap::new(),
        }));
        Ok(())
    }

    fn plan_output(&self, start: &RunStart) -> SpecResult<PendingOutput> {
        let prefix = resolve_prefix(&self.config.file_prefix, start)?;
        Ok(PendingOutput {
            file_name: format!("{prefix}.{SPEC_EXTENSION}"),
            start_time: start.time,
            owner: start
                .owner
                .clone()
                .unwrap_or_else(|| self.config.owner.clone()),
        })
    }

    /// Create the file and write its preamble.
    fn open_output(&mut self) -> SpecResult<&mut Output> {
        if self.output.is_none() {
            let pending = self.pending.take().ok_or_else(|| {
                SpecError::Io(std::io::Error::other("no output file planned for scan"))
            })?;
            let mut writer = self.manager.open(STREAM_DATA, &pending.file_name)?;
            let base_name = pending
                .file_name
                .rsplit('/')
                .next()
                .unwrap_or(&pending.file_name);
            writer.write_all(
                file_header(base_name, pending.start_time, &pending.owner).as_bytes(),
            )?;
            tracing::info!(file = %pending.file_name, "opened SPEC file");
            self.output = Some(Output {
                writer,
                file_name: pending.file_name,
            });
        }
        self.output.as_mut().ok_or_else(|| {
            SpecError::Io(std::io::Error::other("no output file open for scan"))
        })
    }

    fn stop(&mut self, stop: RunStop) -> SpecResult<()> {
        let State::InRun(run) = std::mem::replace(&mut self.state, State::Idle) else {
            return Err(self.fail("stop"));
        };
        if stop.exit_status != "success" {
            tracing::warn!(
                run = %stop.run_start,
                status = %stop.exit_status,
                reason = stop.reason.as_deref().unwrap_or(""),
                "run did not succeed; writing recorded points"
            );
        }
        self.finalize(run.record)
    }

    fn finalize(&mut self, record: ScanRecord) -> SpecResult<()> {
        let text = record.to_text(&self.rules);
        let output = self.open_output()?;
        output.writer.write_all(text.as_bytes())?;
        output.writer.flush()?;
        tracing::info!(
            file = %output.file_name,
            scan = record.scan_number,
            rows = record.rows.len(),
            "wrote scan"
        );
        self.next_scan_number += 1;
        Ok(())
    }

    fn release(&mut self) -> SpecResult<()> {
        self.pending = None;
        if let Some(mut output) = self.output.take() {
            output.writer.flush()?;
            tracing::debug!(file = %output.file_name, "closed SPEC file");
        }
        self.manager.close()
    }

    fn out_of_order(&self, kind: &str) -> SpecError {
        SpecError::OutOfOrderDocument {
            state: self.state.name().to_string(),
            kind: kind.to_string(),
        }
    }

    /// Reject a document that breaks the protocol and shut the serializer down.
    /// The scan in flight is discarded.
    fn fail(&mut self, kind: &str) -> SpecError {
        let err = self.out_of_order(kind);
        tracing::error!(error = %err, "protocol violation; closing serializer");
        self.state = State::Closed;
        if let Err(release_err) = self.release() {
            tracing::warn!(error = %release_err, "failed to release output");
        }
        err
    }

    /// On a column mismatch, drop the scan and ignore the rest of its run.
    fn skip_on_mismatch(&mut self, result: SpecResult<()>) -> SpecResult<()> {
        if let Err(err @ SpecError::ColumnMismatch { .. }) = result {
            if let State::InRun(run) = &self.state {
                tracing::error!(run = %run.record.run_uid, error = %err, "discarding scan");
                self.state = State::Skipping {
                    run_uid: run.record.run_uid.clone(),
                };
                if self.output.is_none() {
                    // The next accepted run names the file.
                    self.pending = None;
                }
            }
            return Err(err);
        }
        result
    }

    fn check_event_result(&mut self, result: SpecResult<()>) -> SpecResult<()> {
        match result {
            Err(SpecError::OutOfOrderDocument { kind, .. }) => Err(self.fail(&kind)),
            other => self.skip_on_mismatch(other),
        }
    }
}

fn register_descriptor(
    run: &mut OpenRun,
    descriptor: StreamDescriptor,
    config: &ExportConfig,
    rules: &FormatRules,
) -> SpecResult<()> {
    run.descriptors
        .insert(descriptor.uid.clone(), descriptor.name.clone());

    if let Some(first) = run.first_descriptor.get(&descriptor.name) {
        tracing::debug!(
            stream = %descriptor.name,
            first = %first,
            descriptor = %descriptor.uid,
            "additional descriptor; column layout unchanged"
        );
        return Ok(());
    }
    run.first_descriptor
        .insert(descriptor.name.clone(), descriptor.uid.clone());

    if descriptor.name == config.stream_name {
        let layout =
            ColumnLayout::from_descriptor(&descriptor, &run.record.classification, rules)?;
        tracing::debug!(
            stream = %descriptor.name,
            columns = layout.len(),
            "registered column layout"
        );
        run.record.layout = Some(layout);
    }
    Ok(())
}

fn accept_event(run: &mut OpenRun, event: &Event, data_stream: &str) -> SpecResult<()> {
    let stream = run.descriptors.get(&event.descriptor).ok_or_else(|| {
        SpecError::mismatch(
            &event.descriptor,
            format!("event {} references an unknown descriptor", event.seq_num),
        )
    })?;

    if let Some(last) = run.last_seq.get(stream) {
        if event.seq_num <= *last {
            return Err(SpecError::OutOfOrderDocument {
                state: format!("seq_num {last} already seen in stream '{stream}'"),
                kind: "event".to_string(),
            });
        }
    }

    if stream == data_stream {
        let layout = run.record.layout.as_ref().ok_or_else(|| {
            SpecError::mismatch(stream, "event arrived before the stream's column layout")
        })?;
        let row = layout.row(stream, event)?;
        run.record.rows.push(row);
    }
    run.last_seq.insert(stream.clone(), event.seq_num);
    Ok(())
}

impl<M: FileManager> Drop for Serializer<M> {
    fn drop(&mut self) {
        if !self.is_closed() {
            if let Err(err) = self.close() {
                tracing::warn!(error = %err, "failed to close SPEC serializer on drop");
            }
        }
    }
}

impl<M: FileManager> fmt::Debug for Serializer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Serializer")
            .field("state", &self.state)
            .field(
                "file",
                &self
                    .output
                    .as_ref()
                    .map(|o| o.file_name.as_str())
                    .or(self.pending.as_ref().map(|p| p.file_name.as_str())),
            )
            .field("next_scan_number", &self.next_scan_number)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DataKey, Event, EventPage, RunStop, StreamDescriptor};
    use crate::storage::MemoryBuffersManager;
    use serde_json::json;
    use tracing_test::traced_test;

    fn config(prefix: &str) -> ExportConfig {
        ExportConfig {
            file_prefix: prefix.to_string(),
            ..ExportConfig::default()
        }
    }

    fn memory_serializer() -> Serializer<MemoryBuffersManager> {
        Serializer::with_manager(MemoryBuffersManager::new(), config("out"))
    }

    fn count_run(run: &str, values: &[f64]) -> Vec<Document> {
        let desc = format!("{run}-desc");
        let mut docs = vec![
            Document::Start(RunStart::new(run, "count", 0.0).with_arg("num", values.len().max(1) as u64)),
            Document::Descriptor(
                StreamDescriptor::new(&desc, run, "primary")
                    .with_data_key("det", DataKey::scalar("SIM:det").with_precision(2)),
            ),
        ];
        for (i, v) in values.iter().enumerate() {
            docs.push(Document::Event(
                Event::new(&desc, i as u64 + 1, 1.0).with_datum("det", *v),
            ));
        }
        docs.push(Document::Stop(RunStop::success(&format!("{run}-stop"), run, 2.0)));
        docs
    }

    fn scan_lines(text: &str) -> Vec<&str> {
        text.lines().filter(|l| l.starts_with("#S")).collect()
    }

    #[test]
    fn test_count_run_written() {
        let mut serializer = memory_serializer();
        for doc in count_run("r1", &[1.0, 2.5]) {
            serializer.handle(doc).unwrap();
        }
        serializer.close().unwrap();

        let text = serializer.manager().contents("out.spec").unwrap();
        let expected = "#F out.spec\n#E 0\n#D Thu Jan 01 00:00:00 1970\n#C unknown  User = unknown\n\
                        \n#S 1 ct 2\n#D Thu Jan 01 00:00:00 1970\n#N 1\n#L det\n1.00\n2.50\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_scan_numbers_increase_across_runs() {
        let mut serializer = memory_serializer();
        for run in ["a", "b", "c"] {
            for doc in count_run(run, &[1.0]) {
                serializer.handle(doc).unwrap();
            }
        }
        assert_eq!(serializer.next_scan_number(), 4);
        serializer.close().unwrap();
        let text = serializer.manager().contents("out.spec").unwrap();
        assert_eq!(scan_lines(&text), vec!["#S 1 ct 1", "#S 2 ct 1", "#S 3 ct 1"]);
        assert_eq!(serializer.artifacts()[STREAM_DATA].len(), 1);
    }

    #[test]
    fn test_second_start_is_out_of_order() {
        let mut serializer = memory_serializer();
        serializer
            .handle(Document::Start(RunStart::new("a", "count", 0.0)))
            .unwrap();
        let err = serializer
            .handle(Document::Start(RunStart::new("b", "count", 0.0)))
            .unwrap_err();
        assert!(matches!(err, SpecError::OutOfOrderDocument { .. }));
        assert!(serializer.is_closed());
        assert!(serializer
            .handle(Document::Stop(RunStop::success("s", "a", 1.0)))
            .is_err());
    }

    #[test]
    fn test_unsupported_run_is_skipped() {
        let mut serializer = memory_serializer();
        let err = serializer
            .handle(Document::Start(RunStart::new("g", "grid_scan", 0.0)))
            .unwrap_err();
        assert!(matches!(err, SpecError::UnsupportedPlanKind { .. }));
        serializer
            .handle(Document::Descriptor(StreamDescriptor::new("d", "g", "primary")))
            .unwrap();
        serializer
            .handle(Document::Event(Event::new("d", 1, 0.0)))
            .unwrap();
        serializer
            .handle(Document::Stop(RunStop::success("s", "g", 1.0)))
            .unwrap();
        assert!(serializer.artifacts().is_empty());

        // The next supported run is accepted normally.
        for doc in count_run("ok", &[3.0]) {
            serializer.handle(doc).unwrap();
        }
        serializer.close().unwrap();
        let text = serializer.manager().contents("out.spec").unwrap();
        assert_eq!(scan_lines(&text), vec!["#S 1 ct 1"]);
    }

    #[test]
    fn test_column_mismatch_discards_scan() {
        let mut serializer = memory_serializer();
        let mut docs = count_run("bad", &[1.0]);
        if let Document::Event(event) = &mut docs[2] {
            event.data.clear();
        }
        serializer.handle(docs[0].clone()).unwrap();
        serializer.handle(docs[1].clone()).unwrap();
        let err = serializer.handle(docs[2].clone()).unwrap_err();
        assert!(matches!(err, SpecError::ColumnMismatch { .. }));
        serializer.handle(docs[3].clone()).unwrap();

        for doc in count_run("good", &[4.0]) {
            serializer.handle(doc).unwrap();
        }
        serializer.close().unwrap();
        let text = serializer.manager().contents("out.spec").unwrap();
        assert_eq!(scan_lines(&text), vec!["#S 1 ct 1"]);
        assert!(text.ends_with("#L det\n4.00\n"));
    }

    #[test]
    fn test_discarded_first_run_writes_nothing() {
        let mut serializer = memory_serializer();
        let mut docs = count_run("mm", &[1.0]);
        if let Document::Event(event) = &mut docs[2] {
            event.data.insert("det".to_string(), json!("not a number"));
        }
        serializer.handle(docs[0].clone()).unwrap();
        serializer.handle(docs[1].clone()).unwrap();
        let err = serializer.handle(docs[2].clone()).unwrap_err();
        assert!(matches!(err, SpecError::ColumnMismatch { .. }));
        serializer.handle(docs[3].clone()).unwrap();
        serializer.close().unwrap();

        assert!(serializer.artifacts().is_empty());
        assert_eq!(serializer.manager().contents("out.spec"), None);
    }

    #[test]
    fn test_failed_run_keeps_recorded_rows() {
        let mut serializer = memory_serializer();
        let mut docs = count_run("ab", &[1.0, 2.0]);
        docs.pop();
        docs.push(Document::Stop(RunStop::abort("ab-stop", "ab", 3.0, "user abort")));
        for doc in docs {
            serializer.handle(doc).unwrap();
        }
        serializer.close().unwrap();
        let text = serializer.manager().contents("out.spec").unwrap();
        assert!(text.ends_with("#S 1 ct 2\n#D Thu Jan 01 00:00:00 1970\n#N 1\n#L det\n1.00\n2.00\n"));
    }

    #[test]
    fn test_event_page_and_repeated_seq_num() {
        let mut serializer = memory_serializer();
        let docs = count_run("p", &[]);
        serializer.handle(docs[0].clone()).unwrap();
        serializer.handle(docs[1].clone()).unwrap();
        let page = EventPage::from(vec![
            Event::new("p-desc", 1, 1.0).with_datum("det", 1.0),
            Event::new("p-desc", 2, 1.0).with_datum("det", 2.0),
        ]);
        serializer.handle(Document::EventPage(page)).unwrap();

        let replay = Event::new("p-desc", 2, 1.0).with_datum("det", 9.0);
        let err = serializer.handle(Document::Event(replay)).unwrap_err();
        assert!(matches!(err, SpecError::OutOfOrderDocument { .. }));
        assert!(serializer.is_closed());
    }

    #[test]
    fn test_close_in_run_writes_partial_scan() {
        let mut serializer = memory_serializer();
        let docs = count_run("t", &[1.0, 2.0, 3.0]);
        for doc in docs.iter().take(4) {
            serializer.handle(doc.clone()).unwrap();
        }
        serializer.close().unwrap();
        let text = serializer.manager().contents("out.spec").unwrap();
        assert!(text.ends_with("#S 1 ct 3\n#D Thu Jan 01 00:00:00 1970\n#N 1\n#L det\n1.00\n2.00\n"));
        serializer.close().unwrap();
    }

    #[test]
    #[traced_test]
    fn test_close_in_run_logs_partial_write() {
        let mut serializer = memory_serializer();
        for doc in count_run("w", &[1.0]).into_iter().take(2) {
            serializer.handle(doc).unwrap();
        }
        serializer.close().unwrap();
        assert!(logs_contain("writing partial scan"));
    }

    #[test]
    fn test_handle_pair_ignores_resources() {
        let mut serializer = memory_serializer();
        serializer.handle_pair("resource", json!({})).unwrap();
        assert!(serializer.handle_pair("mystery", json!({})).is_err());
        assert!(!serializer.is_closed());
    }
}
