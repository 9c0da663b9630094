//! Scan classification from run start documents.
//!
//! The SPEC format only knows three motion patterns: counting in place (`ct`),
//! absolute step scans (`ascan`, `a2scan`, ...) and relative step scans
//! (`dscan`, `d2scan`, ...). [`classify`] maps a run start onto one of them.

use crate::document::RunStart;
use crate::error::{SpecError, SpecResult};
use serde_json::Value;

/// Motion pattern of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Repeated reads without moving any axis.
    Count,
    /// Step scan over absolute axis positions.
    Scan,
    /// Step scan over offsets from each axis's position at run start.
    RelativeScan,
}

impl ScanKind {
    /// Map a plan name to a scan kind.
    pub fn from_plan_name(plan_name: &str) -> Option<Self> {
        match plan_name {
            "count" | "ct" => Some(ScanKind::Count),
            "scan" | "ascan" => Some(ScanKind::Scan),
            "rel_scan" | "relative_scan" | "dscan" => Some(ScanKind::RelativeScan),
            _ => None,
        }
    }

    /// SPEC macro name for this kind over `num_axes` axes.
    pub fn spec_command(&self, num_axes: usize) -> String {
        let prefix = match self {
            ScanKind::Count => return "ct".to_string(),
            ScanKind::Scan => "a",
            ScanKind::RelativeScan => "d",
        };
        if num_axes > 1 {
            format!("{prefix}{num_axes}scan")
        } else {
            format!("{prefix}scan")
        }
    }
}

/// One scanned axis with absolute bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Axis {
    /// Field name of the axis readback.
    pub name: String,
    /// First position.
    pub start: f64,
    /// Last position.
    pub stop: f64,
}

/// Result of classifying a run start.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanClassification {
    /// Motion pattern.
    pub kind: ScanKind,
    /// Axes in declaration order; empty for counts.
    pub axes: Vec<Axis>,
    /// Number of points the plan declared.
    pub num_points: u64,
}

impl ScanClassification {
    /// Number of intervals between points, as SPEC scan commands state it.
    pub fn intervals(&self) -> u64 {
        self.num_points.saturating_sub(1)
    }

    /// Names of the scanned axes.
    pub fn axis_names(&self) -> impl Iterator<Item = &str> {
        self.axes.iter().map(|a| a.name.as_str())
    }
}

/// Classify a run start by its plan name and arguments.
pub fn classify(start: &RunStart) -> SpecResult<ScanClassification> {
    let plan_name = start.plan_name.as_str();
    let kind = ScanKind::from_plan_name(plan_name)
        .ok_or_else(|| SpecError::unsupported(plan_name, "no SPEC equivalent for this plan"))?;

    if kind == ScanKind::Count {
        let num_points = match start.plan_args.get("num") {
            None | Some(Value::Null) => 1,
            Some(value) => positive_count(plan_name, "num", value)?,
        };
        return Ok(ScanClassification {
            kind,
            axes: Vec::new(),
            num_points,
        });
    }

    let (triples, num_points) = step_triples(start)?;
    if !start.motors.is_empty() && start.motors.len() != triples.len() {
        return Err(SpecError::unsupported(
            plan_name,
            format!(
                "{} motors recorded but {} axis triples in plan arguments",
                start.motors.len(),
                triples.len()
            ),
        ));
    }

    let mut axes = Vec::with_capacity(triples.len());
    for (i, (motor, rel_start, rel_stop)) in triples.into_iter().enumerate() {
        let name = match start.motors.get(i) {
            Some(name) => name.clone(),
            None => motor_name(motor).ok_or_else(|| {
                SpecError::unsupported(plan_name, format!("cannot name axis {}", i + 1))
            })?,
        };
        let offset = if kind == ScanKind::RelativeScan {
            baseline(start, &name)
        } else {
            0.0
        };
        axes.push(Axis {
            name,
            start: rel_start + offset,
            stop: rel_stop + offset,
        });
    }

    Ok(ScanClassification {
        kind,
        axes,
        num_points,
    })
}

type Triple<'a> = (&'a Value, f64, f64);

/// Collect `(motor, start, stop)` triples and the point count.
fn step_triples(start: &RunStart) -> SpecResult<(Vec<Triple<'_>>, u64)> {
    let plan_name = start.plan_name.as_str();
    let args = &start.plan_args;

    if let Some(Value::Array(positional)) = args.get("args") {
        if positional.is_empty() || positional.len() % 3 != 0 {
            return Err(SpecError::unsupported(
                plan_name,
                format!(
                    "expected motor/start/stop triples, got {} positional arguments",
                    positional.len()
                ),
            ));
        }
        let triples = positional
            .chunks(3)
            .map(|chunk| -> SpecResult<Triple<'_>> {
                Ok((
                    &chunk[0],
                    number(plan_name, "start", &chunk[1])?,
                    number(plan_name, "stop", &chunk[2])?,
                ))
            })
            .collect::<SpecResult<Vec<_>>>()?;
        let num = args
            .get("num")
            .ok_or_else(|| SpecError::unsupported(plan_name, "missing 'num'"))?;
        return Ok((triples, positive_count(plan_name, "num", num)?));
    }

    let field = |key: &str| {
        args.get(key)
            .ok_or_else(|| SpecError::unsupported(plan_name, format!("missing '{key}'")))
    };
    let motor = field("motor")?;
    let first = number(plan_name, "start", field("start")?)?;
    let last = number(plan_name, "stop", field("stop")?)?;
    let num_points = match (args.get("num"), args.get("step")) {
        (Some(num), _) if !num.is_null() => positive_count(plan_name, "num", num)?,
        (_, Some(step)) => {
            let step = number(plan_name, "step", step)?;
            if step == 0.0 {
                return Err(SpecError::unsupported(plan_name, "'step' is zero"));
            }
            let intervals = ((last - first) / step).abs().round();
            if !intervals.is_finite() || intervals >= u64::MAX as f64 {
                return Err(SpecError::unsupported(plan_name, "point count out of range"));
            }
            (intervals as u64)
                .checked_add(1)
                .ok_or_else(|| SpecError::unsupported(plan_name, "point count out of range"))?
        }
        _ => return Err(SpecError::unsupported(plan_name, "missing 'num' or 'step'")),
    };
    Ok((vec![(motor, first, last)], num_points))
}

fn number(plan_name: &str, what: &str, value: &Value) -> SpecResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| SpecError::unsupported(plan_name, format!("'{what}' is not a number: {value}")))
}

fn positive_count(plan_name: &str, what: &str, value: &Value) -> SpecResult<u64> {
    let count = value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64));
    match count {
        Some(n) if n >= 1 => Ok(n),
        _ => Err(SpecError::unsupported(
            plan_name,
            format!("'{what}' must be a positive integer, got {value}"),
        )),
    }
}

/// Axis name from a plan argument: a bare name, or a device repr with `name='...'`.
fn motor_name(motor: &Value) -> Option<String> {
    let text = motor.as_str()?;
    if let Some(pos) = text.find("name='") {
        let rest = &text[pos + "name='".len()..];
        return rest.find('\'').map(|end| rest[..end].to_string());
    }
    let is_identifier = !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    is_identifier.then(|| text.to_string())
}

fn baseline(start: &RunStart, axis: &str) -> f64 {
    match start.initial_positions.get(axis) {
        Some(position) => *position,
        None => {
            tracing::warn!(
                run = %start.uid,
                axis,
                "no initial position recorded for relative axis; using 0.0"
            );
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracing_test::traced_test;

    #[test]
    fn test_count_defaults_to_one_point() {
        let start = RunStart::new("r", "count", 0.0).with_arg("num", Value::Null);
        let class = classify(&start).unwrap();
        assert_eq!(class.kind, ScanKind::Count);
        assert!(class.axes.is_empty());
        assert_eq!(class.num_points, 1);

        let start = RunStart::new("r", "count", 0.0).with_arg("num", 3);
        assert_eq!(classify(&start).unwrap().num_points, 3);
    }

    #[test]
    fn test_positional_scan() {
        let start = RunStart::new("r", "scan", 0.0)
            .with_arg("args", json!(["SynAxis(name='motor')", -1, 1]))
            .with_arg("num", 5);
        let class = classify(&start).unwrap();
        assert_eq!(class.kind, ScanKind::Scan);
        assert_eq!(
            class.axes,
            vec![Axis {
                name: "motor".to_string(),
                start: -1.0,
                stop: 1.0
            }]
        );
        assert_eq!(class.intervals(), 4);
    }

    #[test]
    fn test_multi_axis_names_from_motors() {
        let start = RunStart::new("r", "scan", 0.0)
            .with_arg("args", json!(["m1", 0, 1, "m2", 10, 20]))
            .with_arg("num", 3)
            .with_motor("motor1")
            .with_motor("motor2");
        let class = classify(&start).unwrap();
        assert_eq!(class.axis_names().collect::<Vec<_>>(), vec!["motor1", "motor2"]);
        assert_eq!(class.kind.spec_command(class.axes.len()), "a2scan");
    }

    #[test]
    fn test_named_args_with_step() {
        let start = RunStart::new("r", "ascan", 0.0)
            .with_arg("motor", "th")
            .with_arg("start", 0.0)
            .with_arg("stop", 1.0)
            .with_arg("step", 0.25);
        let class = classify(&start).unwrap();
        assert_eq!(class.num_points, 5);
        assert_eq!(class.axes[0].name, "th");
    }

    #[test]
    fn test_relative_scan_resolves_absolute_bounds() {
        let start = RunStart::new("r", "rel_scan", 0.0)
            .with_arg("args", json!(["motor", -1, 1]))
            .with_arg("num", 3)
            .with_motor("motor")
            .with_initial_position("motor", 5.0);
        let class = classify(&start).unwrap();
        assert_eq!(class.kind, ScanKind::RelativeScan);
        assert_eq!(class.axes[0].start, 4.0);
        assert_eq!(class.axes[0].stop, 6.0);
        assert_eq!(class.kind.spec_command(1), "dscan");
    }

    #[test]
    fn test_tiny_step_is_rejected() {
        let start = RunStart::new("r", "ascan", 0.0)
            .with_arg("motor", "th")
            .with_arg("start", 0.0)
            .with_arg("stop", 1.0)
            .with_arg("step", 1e-300);
        assert!(matches!(
            classify(&start),
            Err(SpecError::UnsupportedPlanKind { .. })
        ));
    }

    #[test]
    #[traced_test]
    fn test_relative_scan_without_baseline_uses_zero() {
        let start = RunStart::new("r", "rel_scan", 0.0)
            .with_arg("args", json!(["motor", -1, 1]))
            .with_arg("num", 3)
            .with_motor("motor");
        let class = classify(&start).unwrap();
        assert_eq!(class.axes[0].start, -1.0);
        assert_eq!(class.axes[0].stop, 1.0);
        assert!(logs_contain("no initial position recorded"));
    }

    #[test]
    fn test_unsupported_plans() {
        let grid = RunStart::new("r", "grid_scan", 0.0);
        assert!(matches!(
            classify(&grid),
            Err(SpecError::UnsupportedPlanKind { .. })
        ));

        let ragged = RunStart::new("r", "scan", 0.0)
            .with_arg("args", json!(["motor", -1]))
            .with_arg("num", 3);
        assert!(matches!(
            classify(&ragged),
            Err(SpecError::UnsupportedPlanKind { .. })
        ));

        let zero = RunStart::new("r", "count", 0.0).with_arg("num", 0);
        assert!(classify(&zero).is_err());
    }

    #[test]
    fn test_motor_name_parsing() {
        assert_eq!(motor_name(&json!("motor")), Some("motor".to_string()));
        assert_eq!(
            motor_name(&json!("EpicsMotor(prefix='XF:1', name='th', settle_time=0.0)")),
            Some("th".to_string())
        );
        assert_eq!(motor_name(&json!("not a name")), None);
        assert_eq!(motor_name(&json!(3)), None);
    }
}
