//! SPEC text records.
//!
//! A [`ScanRecord`] holds everything the serializer accumulated for one run; this
//! module turns it into the legacy text block:
//!
//! ```text
//!
//! #S 2 ascan motor -1.000 1.000 2
//! #D Tue Mar 19 14:10:07 2019
//! #N 2
//! #L motor  det
//! -1.000 0.606531
//! ```
//!
//! Decimal places are decided per column by [`FormatRules`] from the first
//! descriptor of the data stream and stay fixed for every row of the scan.

use super::classifier::{ScanClassification, ScanKind};
use crate::config::MAX_PRECISION;
use crate::document::{as_number, DataKey, Event, StreamDescriptor};
use crate::error::{SpecError, SpecResult};
use chrono::{DateTime, Utc};

/// `#D` line layout, e.g. `Tue Mar 19 14:10:07 2019`.
const SPEC_TIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

/// Separator between `#L` labels; labels may themselves contain single spaces.
const LABEL_SEPARATOR: &str = "  ";

/// Decimal-place rules for data columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRules {
    /// Decimal places for `number` fields without an explicit precision.
    pub default_precision: usize,
}

impl Default for FormatRules {
    fn default() -> Self {
        Self {
            default_precision: 6,
        }
    }
}

impl FormatRules {
    /// Decimal places for a field: its declared precision, none for integral
    /// dtypes, otherwise the default.
    pub fn decimals_for(&self, key: &DataKey) -> usize {
        match (key.precision, key.dtype.as_str()) {
            (Some(precision), _) => precision,
            (None, "integer" | "boolean") => 0,
            (None, _) => self.default_precision,
        }
    }
}

/// One data column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Event field and `#L` label.
    pub field: String,
    /// Fixed decimal places for every value in the column.
    pub decimals: usize,
}

impl Column {
    fn format(&self, value: f64) -> String {
        format!("{:.*}", self.decimals, value)
    }
}

/// Axis columns followed by dependent-variable columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    /// One column per scanned axis, in declaration order.
    pub axes: Vec<Column>,
    /// Dependent-variable columns, ordered by field name.
    pub dependents: Vec<Column>,
}

impl ColumnLayout {
    /// Layout used when no descriptor for the data stream ever arrived.
    pub fn axes_only(classification: &ScanClassification, rules: &FormatRules) -> Self {
        Self {
            axes: classification
                .axis_names()
                .map(|name| Column {
                    field: name.to_string(),
                    decimals: rules.default_precision,
                })
                .collect(),
            dependents: Vec::new(),
        }
    }

    /// Build the layout from the first descriptor of the data stream.
    ///
    /// Dependent columns are the scalar numeric fields that are neither axes nor
    /// owned by an axis device (setpoints), ordered by field name.
    pub fn from_descriptor(
        descriptor: &StreamDescriptor,
        classification: &ScanClassification,
        rules: &FormatRules,
    ) -> SpecResult<Self> {
        let axes = classification
            .axis_names()
            .map(|name| {
                let key = descriptor.data_keys.get(name).ok_or_else(|| {
                    SpecError::mismatch(
                        &descriptor.name,
                        format!("descriptor {} has no field for axis '{name}'", descriptor.uid),
                    )
                })?;
                column(descriptor, name, key, rules)
            })
            .collect::<SpecResult<Vec<_>>>()?;

        let is_axis = |name: &str| classification.axis_names().any(|axis| axis == name);
        // BTreeMap iteration keeps dependents sorted by field name.
        let dependents = descriptor
            .data_keys
            .iter()
            .filter(|(field, key)| {
                key.is_numeric_scalar()
                    && !is_axis(field.as_str())
                    && !key.object_name.as_deref().is_some_and(is_axis)
            })
            .map(|(field, key)| column(descriptor, field, key, rules))
            .collect::<SpecResult<Vec<_>>>()?;

        Ok(Self { axes, dependents })
    }

    /// All columns in output order.
    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.axes.iter().chain(self.dependents.iter())
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.axes.len() + self.dependents.len()
    }

    /// Whether the layout has no columns at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract one row from an event, in column order.
    pub fn row(&self, stream: &str, event: &Event) -> SpecResult<Vec<f64>> {
        self.columns()
            .map(|column| {
                let value = event.data.get(&column.field).ok_or_else(|| {
                    SpecError::mismatch(
                        stream,
                        format!("event {} has no value for '{}'", event.seq_num, column.field),
                    )
                })?;
                as_number(value).ok_or_else(|| {
                    SpecError::mismatch(
                        stream,
                        format!(
                            "event {} value for '{}' is not numeric: {value}",
                            event.seq_num, column.field
                        ),
                    )
                })
            })
            .collect()
    }
}

fn column(
    descriptor: &StreamDescriptor,
    field: &str,
    key: &DataKey,
    rules: &FormatRules,
) -> SpecResult<Column> {
    let decimals = rules.decimals_for(key);
    if decimals > MAX_PRECISION {
        return Err(SpecError::mismatch(
            &descriptor.name,
            format!("field '{field}' asks for {decimals} decimal places, maximum is {MAX_PRECISION}"),
        ));
    }
    Ok(Column {
        field: field.to_string(),
        decimals,
    })
}

/// Accumulated state of one scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    /// Number written on the `#S` line.
    pub scan_number: u64,
    /// Uid of the run this scan belongs to.
    pub run_uid: String,
    /// Scan kind, axes and point count from the run start.
    pub classification: ScanClassification,
    /// Fixed by the first descriptor of the data stream.
    pub layout: Option<ColumnLayout>,
    /// Data rows, aligned with the layout's columns.
    pub rows: Vec<Vec<f64>>,
    /// Run start time, seconds since the Unix epoch.
    pub start_time: f64,
}

impl ScanRecord {
    /// Empty record; the layout is set once the data stream's descriptor arrives.
    pub fn new(
        scan_number: u64,
        run_uid: &str,
        classification: ScanClassification,
        start_time: f64,
    ) -> Self {
        Self {
            scan_number,
            run_uid: run_uid.to_string(),
            classification,
            layout: None,
            rows: Vec::new(),
            start_time,
        }
    }

    /// SPEC command text for the `#S` line, e.g. `dscan motor 4.0 6.0 2`.
    pub fn command(&self, layout: &ColumnLayout) -> String {
        let class = &self.classification;
        let mut parts = vec![class.kind.spec_command(class.axes.len())];
        if class.kind == ScanKind::Count {
            parts.push(class.num_points.to_string());
        } else {
            for (axis, column) in class.axes.iter().zip(&layout.axes) {
                parts.push(axis.name.clone());
                parts.push(column.format(axis.start));
                parts.push(column.format(axis.stop));
            }
            parts.push(class.intervals().to_string());
        }
        parts.join(" ")
    }

    /// Render the scan block, preceded by its blank separator line.
    pub fn to_text(&self, rules: &FormatRules) -> String {
        let fallback;
        let layout = match &self.layout {
            Some(layout) => layout,
            None => {
                fallback = ColumnLayout::axes_only(&self.classification, rules);
                &fallback
            }
        };

        let labels: Vec<&str> = layout.columns().map(|c| c.field.as_str()).collect();
        let mut text = format!(
            "\n#S {} {}\n#D {}\n#N {}\n#L {}\n",
            self.scan_number,
            self.command(layout),
            spec_time(self.start_time),
            layout.len(),
            labels.join(LABEL_SEPARATOR),
        );
        for row in &self.rows {
            let values: Vec<String> = layout
                .columns()
                .zip(row)
                .map(|(column, value)| column.format(*value))
                .collect();
            text.push_str(&values.join(" "));
            text.push('\n');
        }
        text
    }
}

/// File preamble written once, before the first scan of a file.
pub fn file_header(file_name: &str, start_time: f64, owner: &str) -> String {
    format!(
        "#F {file_name}\n#E {}\n#D {}\n#C {owner}  User = {owner}\n",
        start_time.trunc() as i64,
        spec_time(start_time),
    )
}

/// Format epoch seconds as a SPEC `#D` date, in UTC.
pub fn spec_time(epoch_seconds: f64) -> String {
    let secs = epoch_seconds.floor();
    let nanos = ((epoch_seconds - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos)
        .unwrap_or_default()
        .format(SPEC_TIME_FORMAT)
        .to_string()
}
