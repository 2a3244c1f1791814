//! The aggregate pipeline: an ordered sequence of stages executed over an
//! in-memory record set. Stages run strictly in command order; sorting and
//! grouping declare that the command requires complete results, which
//! disables per-shard trimming upstream.

use std::collections::{HashMap, HashSet, VecDeque};

use smallvec::SmallVec;

use crate::error::{Result, UserError};
use crate::expr::{compare, CompileContext, Expr, Ordering, RecordFields, Value};

/// One pipeline record: values addressed by the slot indexes assigned at
/// parse time.
#[derive(Debug, Default, Clone)]
pub struct Record {
    pub fields: Vec<Value>,
}

impl Record {
    pub fn with_width(width: usize) -> Self {
        Record { fields: vec![Value::nil("unset field"); width] }
    }

    pub fn set_field(&mut self, slot: usize, value: Value) {
        if self.fields.len() <= slot {
            self.fields.resize(slot + 1, Value::nil("unset field"));
        }
        self.fields[slot] = value;
    }
}

impl RecordFields for Record {
    fn field(&self, slot: usize) -> Value {
        self.fields.get(slot).cloned().unwrap_or(Value::nil("missing field"))
    }
}

pub type RecordSet = VecDeque<Record>;

/// Maps attribute names to record slots. LOAD and APPLY allocate slots at
/// parse time so evaluation never looks names up per record.
#[derive(Debug, Default)]
pub struct AttributeMap {
    slots: HashMap<String, usize>,
    names: Vec<String>,
}

impl AttributeMap {
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots.get(name).copied()
    }

    pub fn slot_or_create(&mut self, name: &str) -> usize {
        if let Some(slot) = self.slots.get(name) {
            return *slot;
        }
        let slot = self.names.len();
        self.slots.insert(name.to_string(), slot);
        self.names.push(name.to_string());
        slot
    }

    pub fn width(&self) -> usize {
        self.names.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Compile context rejecting unknown attributes (FILTER, SORTBY,
    /// GROUPBY reference existing fields only).
    pub fn lookup(&mut self) -> LookupContext<'_> {
        LookupContext { map: self }
    }
}

pub struct LookupContext<'a> {
    map: &'a mut AttributeMap,
}

impl<'a> CompileContext for LookupContext<'a> {
    fn resolve_attribute(&mut self, name: &str) -> Option<usize> {
        self.map.slot_of(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerKind {
    Count,
    CountDistinct,
    Sum,
    Min,
    Max,
    Avg,
    Stddev,
}

impl ReducerKind {
    /// Returns the reducer and its (min, max) argument count.
    pub fn from_name(name: &str) -> Option<(ReducerKind, usize, usize)> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some((ReducerKind::Count, 0, 0)),
            "COUNT_DISTINCT" => Some((ReducerKind::CountDistinct, 1, 1)),
            "SUM" => Some((ReducerKind::Sum, 1, 1)),
            "MIN" => Some((ReducerKind::Min, 1, 1)),
            "MAX" => Some((ReducerKind::Max, 1, 1)),
            "AVG" => Some((ReducerKind::Avg, 1, 1)),
            "STDDEV" => Some((ReducerKind::Stddev, 1, 1)),
            _ => None,
        }
    }
}

pub struct Reducer {
    pub kind: ReducerKind,
    pub args: Vec<Expr>,
    pub output_slot: usize,
    pub output_name: String,
}

enum ReducerInstance {
    Count(u64),
    CountDistinct(HashSet<Value>),
    Sum(f64),
    Min(Value),
    Max(Value),
    Avg { sum: f64, count: u64 },
    Stddev { sum: f64, sq_sum: f64, count: u64 },
}

impl ReducerInstance {
    fn new(kind: ReducerKind) -> Self {
        match kind {
            ReducerKind::Count => ReducerInstance::Count(0),
            ReducerKind::CountDistinct => ReducerInstance::CountDistinct(HashSet::new()),
            ReducerKind::Sum => ReducerInstance::Sum(0.0),
            ReducerKind::Min => ReducerInstance::Min(Value::nil("no samples")),
            ReducerKind::Max => ReducerInstance::Max(Value::nil("no samples")),
            ReducerKind::Avg => ReducerInstance::Avg { sum: 0.0, count: 0 },
            ReducerKind::Stddev => ReducerInstance::Stddev { sum: 0.0, sq_sum: 0.0, count: 0 },
        }
    }

    fn process(&mut self, values: &[Value]) {
        match self {
            ReducerInstance::Count(count) => *count += 1,
            ReducerInstance::CountDistinct(seen) => {
                if !values[0].is_nil() {
                    seen.insert(values[0].clone());
                }
            }
            ReducerInstance::Sum(sum) => {
                // non-convertible values are skipped silently
                if let Some(v) = values[0].as_f64() {
                    *sum += v;
                }
            }
            ReducerInstance::Min(min) => {
                if !values[0].is_nil()
                    && (min.is_nil() || compare(&values[0], min) == Ordering::Less)
                {
                    *min = values[0].clone();
                }
            }
            ReducerInstance::Max(max) => {
                if !values[0].is_nil()
                    && (max.is_nil() || compare(&values[0], max) == Ordering::Greater)
                {
                    *max = values[0].clone();
                }
            }
            ReducerInstance::Avg { sum, count } => {
                if let Some(v) = values[0].as_f64() {
                    *sum += v;
                    *count += 1;
                }
            }
            ReducerInstance::Stddev { sum, sq_sum, count } => {
                if let Some(v) = values[0].as_f64() {
                    *sum += v;
                    *sq_sum += v * v;
                    *count += 1;
                }
            }
        }
    }

    fn result(&self) -> Value {
        match self {
            ReducerInstance::Count(count) => Value::num(*count as f64),
            ReducerInstance::CountDistinct(seen) => Value::num(seen.len() as f64),
            ReducerInstance::Sum(sum) => Value::num(*sum),
            ReducerInstance::Min(min) => min.clone(),
            ReducerInstance::Max(max) => max.clone(),
            // zero samples average to 0, not Nil
            ReducerInstance::Avg { sum, count } => {
                Value::num(if *count == 0 { 0.0 } else { sum / *count as f64 })
            }
            ReducerInstance::Stddev { sum, sq_sum, count } => {
                if *count == 0 {
                    Value::num(0.0)
                } else {
                    let mean = sum / *count as f64;
                    let variance = (sq_sum / *count as f64) - mean * mean;
                    Value::num(variance.max(0.0).sqrt())
                }
            }
        }
    }
}

pub struct SortKey {
    pub expr: Expr,
    pub ascending: bool,
}

pub enum Stage {
    Limit { offset: usize, count: usize },
    Apply { name: String, slot: usize, expr: Expr },
    Filter { expr: Expr },
    SortBy { keys: Vec<SortKey>, max: Option<usize> },
    GroupBy { group_slots: Vec<usize>, reducers: Vec<Reducer> },
}

impl Stage {
    pub fn execute(&self, records: &mut RecordSet) -> Result<()> {
        match self {
            Stage::Limit { offset, count } => {
                for _ in 0..*offset {
                    if records.pop_front().is_none() {
                        break;
                    }
                }
                records.truncate(*count);
                Ok(())
            }
            Stage::Apply { slot, expr, .. } => {
                for record in records.iter_mut() {
                    let value = expr.evaluate(record);
                    record.set_field(*slot, value);
                }
                Ok(())
            }
            Stage::Filter { expr } => {
                records.retain(|record| expr.evaluate(record).is_truthy());
                Ok(())
            }
            Stage::SortBy { keys, max } => {
                sort_records(records, keys, *max);
                Ok(())
            }
            Stage::GroupBy { group_slots, reducers } => {
                group_records(records, group_slots, reducers)
            }
        }
    }
}

/// Evaluated sort keys of one record, ordered so a max-heap pops the worst
/// record first.
struct Sortable {
    keys: SmallVec<[(Value, bool); 4]>,
    record: Record,
}

impl Sortable {
    fn new(record: Record, keys: &[SortKey]) -> Self {
        let keys = keys
            .iter()
            .map(|k| (k.expr.evaluate(&record), k.ascending))
            .collect();
        Sortable { keys, record }
    }

    fn cmp_keys(&self, other: &Self) -> std::cmp::Ordering {
        for ((l, ascending), (r, _)) in self.keys.iter().zip(&other.keys) {
            match compare(l, r) {
                Ordering::Equal | Ordering::Unordered => continue,
                Ordering::Less => {
                    return if *ascending {
                        std::cmp::Ordering::Less
                    } else {
                        std::cmp::Ordering::Greater
                    }
                }
                Ordering::Greater => {
                    return if *ascending {
                        std::cmp::Ordering::Greater
                    } else {
                        std::cmp::Ordering::Less
                    }
                }
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl PartialEq for Sortable {
    fn eq(&self, other: &Self) -> bool {
        self.cmp_keys(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Sortable {}

impl PartialOrd for Sortable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp_keys(other))
    }
}

impl Ord for Sortable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cmp_keys(other)
    }
}

fn sort_records(records: &mut RecordSet, keys: &[SortKey], max: Option<usize>) {
    match max {
        Some(max) if records.len() > max => {
            // bounded selection: a max-heap of size `max` sheds the worst
            // record on every overflow
            let mut heap: std::collections::BinaryHeap<Sortable> =
                std::collections::BinaryHeap::with_capacity(max + 1);
            while let Some(record) = records.pop_front() {
                heap.push(Sortable::new(record, keys));
                if heap.len() > max {
                    heap.pop();
                }
            }
            let sorted = heap.into_sorted_vec();
            records.extend(sorted.into_iter().map(|s| s.record));
        }
        _ => {
            let mut sorted: Vec<Sortable> =
                records.drain(..).map(|r| Sortable::new(r, keys)).collect();
            sorted.sort_by(Sortable::cmp_keys);
            records.extend(sorted.into_iter().map(|s| s.record));
        }
    }
}

fn group_records(
    records: &mut RecordSet,
    group_slots: &[usize],
    reducers: &[Reducer],
) -> Result<()> {
    let mut groups: HashMap<Vec<Value>, Vec<ReducerInstance>> = HashMap::new();
    while let Some(record) = records.pop_front() {
        let key: Vec<Value> = group_slots.iter().map(|&slot| record.field(slot)).collect();
        let instances = groups
            .entry(key)
            .or_insert_with(|| reducers.iter().map(|r| ReducerInstance::new(r.kind)).collect());
        for (reducer, instance) in reducers.iter().zip(instances.iter_mut()) {
            let args: SmallVec<[Value; 4]> =
                reducer.args.iter().map(|a| a.evaluate(&record)).collect();
            instance.process(&args);
        }
    }
    let width = group_slots
        .iter()
        .copied()
        .chain(reducers.iter().map(|r| r.output_slot))
        .max()
        .map_or(0, |m| m + 1);
    for (key, instances) in groups {
        let mut record = Record::with_width(width);
        for (&slot, value) in group_slots.iter().zip(key) {
            record.set_field(slot, value);
        }
        if reducers.len() != instances.len() {
            return Err(UserError::InvalidQuerySyntax(
                "reducer instance count mismatch".to_string(),
            )
            .into());
        }
        for (reducer, instance) in reducers.iter().zip(&instances) {
            record.set_field(reducer.output_slot, instance.result());
        }
        records.push_back(record);
    }
    Ok(())
}

/// Runs the pipeline in command order.
pub fn execute(stages: &[Stage], records: &mut RecordSet) -> Result<()> {
    for stage in stages {
        stage.execute(records)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records_from(values: &[&[f64]]) -> RecordSet {
        values
            .iter()
            .map(|fields| Record {
                fields: fields.iter().map(|&f| Value::num(f)).collect(),
            })
            .collect()
    }

    fn compile(map: &mut AttributeMap, input: &str) -> Expr {
        Expr::compile(&mut map.lookup(), input).unwrap()
    }

    fn map_with(names: &[&str]) -> AttributeMap {
        let mut map = AttributeMap::default();
        for name in names {
            map.slot_or_create(name);
        }
        map
    }

    #[test]
    fn limit_stage() {
        let mut records = records_from(&[&[1.0], &[2.0], &[3.0], &[4.0]]);
        Stage::Limit { offset: 1, count: 2 }.execute(&mut records).unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.field(0).as_f64().unwrap()).collect();
        assert_eq!(values, vec![2.0, 3.0]);

        let mut records = records_from(&[&[1.0]]);
        Stage::Limit { offset: 5, count: 2 }.execute(&mut records).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn apply_writes_new_fields_in_order() {
        let mut map = map_with(&["x"]);
        let double = compile(&mut map, "@x * 2");
        let double_slot = map.slot_or_create("doubled");
        // a second APPLY may reference the first one's output
        let plus_one = compile(&mut map, "@doubled + 1");
        let plus_slot = map.slot_or_create("plus");

        let mut records = records_from(&[&[3.0]]);
        Stage::Apply { name: "doubled".into(), slot: double_slot, expr: double }
            .execute(&mut records)
            .unwrap();
        Stage::Apply { name: "plus".into(), slot: plus_slot, expr: plus_one }
            .execute(&mut records)
            .unwrap();
        assert_eq!(records[0].field(double_slot).as_f64(), Some(6.0));
        assert_eq!(records[0].field(plus_slot).as_f64(), Some(7.0));
    }

    #[test]
    fn filter_stage() {
        let mut map = map_with(&["x"]);
        let expr = compile(&mut map, "@x > 2");
        let mut records = records_from(&[&[1.0], &[3.0], &[5.0]]);
        Stage::Filter { expr }.execute(&mut records).unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.field(0).as_f64().unwrap()).collect();
        assert_eq!(values, vec![3.0, 5.0]);
    }

    #[test]
    fn sortby_directions() {
        let mut map = map_with(&["x"]);
        let expr = compile(&mut map, "@x");
        let mut records = records_from(&[&[3.0], &[1.0], &[2.0]]);
        Stage::SortBy {
            keys: vec![SortKey { expr, ascending: false }],
            max: None,
        }
        .execute(&mut records)
        .unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.field(0).as_f64().unwrap()).collect();
        assert_eq!(values, vec![3.0, 2.0, 1.0]);
    }

    #[test]
    fn sortby_max_bounds_results() {
        let mut map = map_with(&["x"]);
        let expr = compile(&mut map, "@x");
        let mut records =
            records_from(&[&[5.0], &[1.0], &[4.0], &[2.0], &[3.0]]);
        Stage::SortBy {
            keys: vec![SortKey { expr, ascending: true }],
            max: Some(3),
        }
        .execute(&mut records)
        .unwrap();
        let values: Vec<f64> = records.iter().map(|r| r.field(0).as_f64().unwrap()).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn groupby_reducers() {
        // fields: [group, value]
        let mut records = records_from(&[
            &[1.0, 10.0],
            &[1.0, 20.0],
            &[2.0, 5.0],
            &[1.0, 30.0],
            &[2.0, 5.0],
        ]);
        let mut map = map_with(&["g", "v"]);
        let arg = |map: &mut AttributeMap| compile(map, "@v");
        let count_slot = map.slot_or_create("n");
        let sum_slot = map.slot_or_create("total");
        let avg_slot = map.slot_or_create("mean");
        let distinct_slot = map.slot_or_create("uniq");
        let reducers = vec![
            Reducer { kind: ReducerKind::Count, args: vec![], output_slot: count_slot, output_name: "n".into() },
            Reducer { kind: ReducerKind::Sum, args: vec![arg(&mut map)], output_slot: sum_slot, output_name: "total".into() },
            Reducer { kind: ReducerKind::Avg, args: vec![arg(&mut map)], output_slot: avg_slot, output_name: "mean".into() },
            Reducer { kind: ReducerKind::CountDistinct, args: vec![arg(&mut map)], output_slot: distinct_slot, output_name: "uniq".into() },
        ];
        Stage::GroupBy { group_slots: vec![0], reducers }.execute(&mut records).unwrap();
        assert_eq!(records.len(), 2);
        let mut rows: Vec<(f64, f64, f64, f64, f64)> = records
            .iter()
            .map(|r| {
                (
                    r.field(0).as_f64().unwrap(),
                    r.field(count_slot).as_f64().unwrap(),
                    r.field(sum_slot).as_f64().unwrap(),
                    r.field(avg_slot).as_f64().unwrap(),
                    r.field(distinct_slot).as_f64().unwrap(),
                )
            })
            .collect();
        rows.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        assert_eq!(rows[0], (1.0, 3.0, 60.0, 20.0, 3.0));
        assert_eq!(rows[1], (2.0, 2.0, 10.0, 5.0, 1.0));
    }

    #[test]
    fn reducers_handle_nil_and_empty() {
        let mut min = ReducerInstance::new(ReducerKind::Min);
        min.process(&[Value::nil("x")]);
        assert!(min.result().is_nil());
        min.process(&[Value::num(5.0)]);
        min.process(&[Value::nil("x")]);
        min.process(&[Value::num(3.0)]);
        assert_eq!(min.result().as_f64(), Some(3.0));

        let avg = ReducerInstance::new(ReducerKind::Avg);
        assert_eq!(avg.result().as_f64(), Some(0.0));
        let stddev = ReducerInstance::new(ReducerKind::Stddev);
        assert_eq!(stddev.result().as_f64(), Some(0.0));

        let mut sum = ReducerInstance::new(ReducerKind::Sum);
        sum.process(&[Value::str("not-a-number")]);
        sum.process(&[Value::num(2.0)]);
        assert_eq!(sum.result().as_f64(), Some(2.0));
    }

    #[test]
    fn stddev_value() {
        let mut stddev = ReducerInstance::new(ReducerKind::Stddev);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stddev.process(&[Value::num(v)]);
        }
        assert!((stddev.result().as_f64().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn commutable_applies_are_order_independent() {
        let build = |first_doubled: bool| {
            let mut map = map_with(&["x"]);
            let d = compile(&mut map, "@x * 2");
            let d_slot = map.slot_or_create("d");
            let t = compile(&mut map, "@x * 3");
            let t_slot = map.slot_or_create("t");
            let mut records = records_from(&[&[2.0], &[5.0]]);
            let a = Stage::Apply { name: "d".into(), slot: d_slot, expr: d };
            let b = Stage::Apply { name: "t".into(), slot: t_slot, expr: t };
            let stages = if first_doubled { [a, b] } else { [b, a] };
            execute(&stages, &mut records).unwrap();
            records
                .iter()
                .map(|r| (r.field(d_slot).as_f64(), r.field(t_slot).as_f64()))
                .collect::<Vec<_>>()
        };
        assert_eq!(build(true), build(false));
    }

    #[test]
    fn groupby_stddev_of_uniq() {
        // the SUM reducer over nil-only args stays 0
        let mut records = records_from(&[&[1.0]]);
        let reducers = vec![Reducer {
            kind: ReducerKind::Sum,
            args: vec![Expr::Const(Value::nil("missing"))],
            output_slot: 1,
            output_name: "s".into(),
        }];
        Stage::GroupBy { group_slots: vec![0], reducers }.execute(&mut records).unwrap();
        assert_eq!(records[0].field(1).as_f64(), Some(0.0));
    }
}
