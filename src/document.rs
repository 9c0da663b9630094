//! Document model for run data streams.
//!
//! A data-acquisition run is described by a sequence of Bluesky-style documents:
//!
//! - **RunStart**: Plan identity, plan arguments and run metadata
//! - **StreamDescriptor**: Schema for one data stream (field names, dtypes, shapes)
//! - **Event / EventPage**: Measurements at one point, or a columnar batch of points
//! - **RunStop**: Completion status
//!
//! # Document Flow
//!
//! ```text
//! RunStart (1)
//!    │
//!    ├── StreamDescriptor (1+, one or more per stream)
//!    │       │
//!    │       └── Event / EventPage (N, measurements)
//!    │
//! RunStop (1)
//! ```
//!
//! On the wire every document is a `(kind, body)` pair, serialized in JSON as a
//! two-element array such as `["start", {"uid": "...", ...}]`.

use crate::error::{SpecError, SpecResult};
use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Stream name used by acquisition plans for their main measurements.
pub const PRIMARY_STREAM: &str = "primary";

/// Document kinds that carry no information the SPEC writer needs.
const IGNORED_KINDS: &[&str] = &["resource", "datum", "datum_page"];

/// A single document of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    /// `start`
    Start(RunStart),
    /// `descriptor`
    Descriptor(StreamDescriptor),
    /// `event`
    Event(Event),
    /// `event_page`
    EventPage(EventPage),
    /// `stop`
    Stop(RunStop),
    /// Recognised kind the writer ignores (resources and datums).
    Other(String),
}

impl Document {
    /// Decode a document from its wire kind and JSON body.
    pub fn from_pair(kind: &str, body: Value) -> SpecResult<Self> {
        let doc = match kind {
            "start" => Document::Start(serde_json::from_value(body)?),
            "descriptor" => Document::Descriptor(serde_json::from_value(body)?),
            "event" => Document::Event(serde_json::from_value(body)?),
            "event_page" => Document::EventPage(serde_json::from_value(body)?),
            "stop" => Document::Stop(serde_json::from_value(body)?),
            other if IGNORED_KINDS.contains(&other) => Document::Other(other.to_string()),
            other => {
                return Err(SpecError::Json(<serde_json::Error as serde::de::Error>::custom(
                    format!("unknown document kind '{other}'"),
                )))
            }
        };
        Ok(doc)
    }

    /// Decode one line of newline-delimited JSON (`["kind", {...}]`).
    pub fn from_json_line(line: &str) -> SpecResult<Self> {
        Ok(serde_json::from_str(line)?)
    }

    /// Wire name of this document kind.
    pub fn kind(&self) -> &str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::EventPage(_) => "event_page",
            Document::Stop(_) => "stop",
            Document::Other(kind) => kind.as_str(),
        }
    }

    /// Run uid this document belongs to, when it carries one directly.
    ///
    /// Events only reference their descriptor, so they return `None`.
    pub fn run_uid(&self) -> Option<&str> {
        match self {
            Document::Start(d) => Some(&d.uid),
            Document::Descriptor(d) => Some(&d.run_start),
            Document::Stop(d) => Some(&d.run_start),
            Document::Event(_) | Document::EventPage(_) | Document::Other(_) => None,
        }
    }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, body): (String, Value) = Deserialize::deserialize(deserializer)?;
        Document::from_pair(&kind, body).map_err(D::Error::custom)
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match self {
            Document::Start(d) => serde_json::to_value(d),
            Document::Descriptor(d) => serde_json::to_value(d),
            Document::Event(d) => serde_json::to_value(d),
            Document::EventPage(d) => serde_json::to_value(d),
            Document::Stop(d) => serde_json::to_value(d),
            Document::Other(_) => Ok(Value::Object(Map::new())),
        }
        .map_err(S::Error::custom)?;
        (self.kind(), body).serialize(serializer)
    }
}

/// Run start document - emitted at the beginning of a run
///
/// Carries the plan identity the scan classifier inspects and any metadata
/// referenced by file prefix templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStart {
    /// Unique run identifier
    pub uid: String,
    /// Start time, seconds since the Unix epoch
    pub time: f64,
    /// Name of the plan that produced the run
    #[serde(default)]
    pub plan_name: String,
    /// Plan arguments, as recorded by the plan
    #[serde(default)]
    pub plan_args: Map<String, Value>,
    /// Facility scan identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_id: Option<i64>,
    /// Names of the scanned axes, in declaration order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub motors: Vec<String>,
    /// User that owns the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Axis positions at run start, used to resolve relative scans
    #[serde(
        default,
        alias = "baseline",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub initial_positions: BTreeMap<String, f64>,
    /// Any other metadata recorded with the run
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunStart {
    pub fn new(uid: &str, plan_name: &str, time: f64) -> Self {
        Self {
            uid: uid.to_string(),
            time,
            plan_name: plan_name.to_string(),
            plan_args: Map::new(),
            scan_id: None,
            motors: Vec::new(),
            owner: None,
            initial_positions: BTreeMap::new(),
            extra: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.plan_args.insert(key.to_string(), value.into());
        self
    }

    pub fn with_motor(mut self, name: &str) -> Self {
        self.motors.push(name.to_string());
        self
    }

    pub fn with_initial_position(mut self, axis: &str, position: f64) -> Self {
        self.initial_positions.insert(axis.to_string(), position);
        self
    }

    pub fn with_owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Look up a top-level field by name, typed fields included.
    pub fn field(&self, key: &str) -> Option<Value> {
        match key {
            "uid" => Some(Value::from(self.uid.clone())),
            "time" => Some(Value::from(self.time)),
            "plan_name" => Some(Value::from(self.plan_name.clone())),
            "plan_args" => Some(Value::Object(self.plan_args.clone())),
            "scan_id" => self.scan_id.map(Value::from),
            "motors" if !self.motors.is_empty() => Some(Value::from(self.motors.clone())),
            "owner" => self.owner.clone().map(Value::from),
            _ => self.extra.get(key).cloned(),
        }
    }
}

/// Schema for a data field within events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data type: "number", "integer", "boolean", "string", "array"
    pub dtype: String,
    /// Shape for arrays (empty for scalars)
    #[serde(default)]
    pub shape: Vec<i64>,
    /// Source identifier (e.g. a PV name)
    #[serde(default)]
    pub source: String,
    /// Device that produced the field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    /// Number of decimal places to display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<usize>,
    /// Physical units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl DataKey {
    /// Create a scalar number data key
    pub fn scalar(source: &str) -> Self {
        Self {
            dtype: "number".to_string(),
            shape: vec![],
            source: source.to_string(),
            object_name: None,
            precision: None,
            units: None,
        }
    }

    /// Create a scalar integer data key
    pub fn integer(source: &str) -> Self {
        Self {
            dtype: "integer".to_string(),
            ..Self::scalar(source)
        }
    }

    /// Create an array data key
    pub fn array(source: &str, shape: Vec<i64>) -> Self {
        Self {
            dtype: "array".to_string(),
            shape,
            ..Self::scalar(source)
        }
    }

    pub fn with_object_name(mut self, name: &str) -> Self {
        self.object_name = Some(name.to_string());
        self
    }

    pub fn with_precision(mut self, precision: usize) -> Self {
        self.precision = Some(precision);
        self
    }

    /// Scalar numeric fields are the only ones a SPEC data line can hold.
    pub fn is_numeric_scalar(&self) -> bool {
        self.shape.is_empty() && matches!(self.dtype.as_str(), "number" | "integer" | "boolean")
    }
}

/// Stream descriptor document - defines the schema of a data stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// Unique descriptor ID
    pub uid: String,
    /// Links to RunStart
    pub run_start: String,
    /// Stream name (e.g., "primary", "baseline")
    #[serde(default = "default_stream_name")]
    pub name: String,
    /// Schema for data fields
    #[serde(default)]
    pub data_keys: BTreeMap<String, DataKey>,
    /// Timestamp
    #[serde(default)]
    pub time: f64,
}

fn default_stream_name() -> String {
    PRIMARY_STREAM.to_string()
}

impl StreamDescriptor {
    pub fn new(uid: &str, run_start: &str, name: &str) -> Self {
        Self {
            uid: uid.to_string(),
            run_start: run_start.to_string(),
            name: name.to_string(),
            data_keys: BTreeMap::new(),
            time: 0.0,
        }
    }

    pub fn with_data_key(mut self, name: &str, key: DataKey) -> Self {
        self.data_keys.insert(name.to_string(), key);
        self
    }
}

/// Event document - one measured point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    #[serde(default)]
    pub uid: String,
    /// Links to the StreamDescriptor that defines the schema
    pub descriptor: String,
    /// Sequence number within the descriptor's stream
    pub seq_num: u64,
    /// Timestamp, seconds since the Unix epoch
    pub time: f64,
    /// Field values
    pub data: BTreeMap<String, Value>,
    /// Per-field timestamps
    #[serde(default)]
    pub timestamps: BTreeMap<String, f64>,
}

impl Event {
    pub fn new(descriptor: &str, seq_num: u64, time: f64) -> Self {
        Self {
            uid: format!("{descriptor}-{seq_num}"),
            descriptor: descriptor.to_string(),
            seq_num,
            time,
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    pub fn with_datum(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.data.insert(field.to_string(), value.into());
        self.timestamps.insert(field.to_string(), self.time);
        self
    }
}

/// Event page document - a columnar batch of events from one descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    #[serde(default)]
    pub uid: Vec<String>,
    pub descriptor: String,
    pub seq_num: Vec<u64>,
    pub time: Vec<f64>,
    pub data: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub timestamps: BTreeMap<String, Vec<f64>>,
}

impl EventPage {
    /// Number of points in the page.
    pub fn len(&self) -> usize {
        self.seq_num.len()
    }

    /// Whether the page holds no points.
    pub fn is_empty(&self) -> bool {
        self.seq_num.is_empty()
    }

    /// Unpack the page into individual events, preserving page order.
    pub fn events(&self) -> SpecResult<Vec<Event>> {
        let len = self.len();
        if self.time.len() != len {
            return Err(SpecError::mismatch(
                &self.descriptor,
                format!("page has {len} seq_num entries but {} times", self.time.len()),
            ));
        }
        if let Some((field, column)) = self.data.iter().find(|(_, c)| c.len() != len) {
            return Err(SpecError::mismatch(
                &self.descriptor,
                format!("page column '{field}' has {} of {len} values", column.len()),
            ));
        }

        let events = (0..len)
            .map(|i| Event {
                uid: self
                    .uid
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("{}-{}", self.descriptor, self.seq_num[i])),
                descriptor: self.descriptor.clone(),
                seq_num: self.seq_num[i],
                time: self.time[i],
                data: self
                    .data
                    .iter()
                    .map(|(k, column)| (k.clone(), column[i].clone()))
                    .collect(),
                timestamps: self
                    .timestamps
                    .iter()
                    .filter_map(|(k, column)| column.get(i).map(|ts| (k.clone(), *ts)))
                    .collect(),
            })
            .collect();
        Ok(events)
    }
}

impl From<Vec<Event>> for EventPage {
    fn from(events: Vec<Event>) -> Self {
        let mut page = EventPage {
            uid: Vec::with_capacity(events.len()),
            descriptor: events.first().map(|e| e.descriptor.clone()).unwrap_or_default(),
            seq_num: Vec::with_capacity(events.len()),
            time: Vec::with_capacity(events.len()),
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        };
        for event in events {
            page.uid.push(event.uid);
            page.seq_num.push(event.seq_num);
            page.time.push(event.time);
            for (k, v) in event.data {
                page.data.entry(k).or_default().push(v);
            }
            for (k, ts) in event.timestamps {
                page.timestamps.entry(k).or_default().push(ts);
            }
        }
        page
    }
}

/// Run stop document - emitted at the end of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStop {
    /// Unique stop doc ID
    #[serde(default)]
    pub uid: String,
    /// Links to RunStart
    pub run_start: String,
    /// Timestamp when run ended
    #[serde(default)]
    pub time: f64,
    /// Exit status: "success", "abort", "fail"
    #[serde(default = "default_exit_status")]
    pub exit_status: String,
    /// Reason for abort/failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Events emitted per stream
    #[serde(default)]
    pub num_events: BTreeMap<String, u64>,
}

fn default_exit_status() -> String {
    "success".to_string()
}

impl RunStop {
    pub fn success(uid: &str, run_start: &str, time: f64) -> Self {
        Self {
            uid: uid.to_string(),
            run_start: run_start.to_string(),
            time,
            exit_status: default_exit_status(),
            reason: None,
            num_events: BTreeMap::new(),
        }
    }

    pub fn abort(uid: &str, run_start: &str, time: f64, reason: &str) -> Self {
        Self {
            exit_status: "abort".to_string(),
            reason: Some(reason.to_string()),
            ..Self::success(uid, run_start, time)
        }
    }
}

/// Interpret a JSON event value as a number for a data line.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_start_builder() {
        let start = RunStart::new("run-1", "scan", 1.0)
            .with_arg("num", 5)
            .with_motor("motor")
            .with_initial_position("motor", 0.5)
            .with_metadata("sample", "Si");

        assert_eq!(start.plan_args.get("num"), Some(&json!(5)));
        assert_eq!(start.motors, vec!["motor".to_string()]);
        assert_eq!(start.field("sample"), Some(json!("Si")));
        assert_eq!(start.field("uid"), Some(json!("run-1")));
        assert_eq!(start.field("scan_id"), None);
    }

    #[test]
    fn test_decode_json_line() {
        let line = r#"["start", {"uid": "abc", "time": 1.5, "plan_name": "count",
            "plan_args": {"num": 3}, "scan_id": 7, "baseline": {"m": 1.0}, "sample": "Si"}]"#;
        let doc = Document::from_json_line(line).unwrap();
        let Document::Start(start) = doc else {
            panic!("expected a start document");
        };
        assert_eq!(start.scan_id, Some(7));
        assert_eq!(start.initial_positions.get("m"), Some(&1.0));
        assert_eq!(start.extra.get("sample"), Some(&json!("Si")));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        assert!(Document::from_pair("bogus", json!({})).is_err());
        assert_eq!(
            Document::from_pair("datum", json!({})).unwrap(),
            Document::Other("datum".to_string())
        );
    }

    #[test]
    fn test_document_wire_roundtrip_keeps_kind() {
        let stop = Document::Stop(RunStop::success("s", "r", 2.0));
        let text = serde_json::to_string(&stop).unwrap();
        assert!(text.starts_with("[\"stop\","));
        assert_eq!(Document::from_json_line(&text).unwrap(), stop);
        assert_eq!(stop.run_uid(), Some("r"));
    }

    #[test]
    fn test_event_page_unpacks_in_order() {
        let events = vec![
            Event::new("d", 1, 10.0).with_datum("det", 1.0),
            Event::new("d", 2, 11.0).with_datum("det", 2.0),
        ];
        let page = EventPage::from(events.clone());
        assert_eq!(page.len(), 2);
        assert_eq!(page.events().unwrap(), events);
    }

    #[test]
    fn test_event_page_ragged_columns() {
        let mut page = EventPage::from(vec![Event::new("d", 1, 1.0).with_datum("det", 1.0)]);
        page.data.insert("other".to_string(), vec![]);
        assert!(matches!(
            page.events(),
            Err(SpecError::ColumnMismatch { .. })
        ));
    }

    #[test]
    fn test_numeric_scalar_keys() {
        assert!(DataKey::scalar("PV:1").is_numeric_scalar());
        assert!(DataKey::integer("PV:2").is_numeric_scalar());
        assert!(!DataKey::array("CAM", vec![512, 512]).is_numeric_scalar());
        assert_eq!(as_number(&json!(true)), Some(1.0));
        assert_eq!(as_number(&json!("x")), None);
    }
}
