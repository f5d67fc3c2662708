//! Work chunks, their ranges and the layout rules that divide a table.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::schema::KeyValue;
use crate::error::{MigrateError, Result};

/// Rows covered by a chunk.
///
/// Key ranges are half-open `[lower, upper)`; a missing bound is unbounded,
/// so the first and last chunk of a table also pick up keys outside the
/// `[min, max]` observed when the pool was populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkRange {
    Key {
        lower: Option<KeyValue>,
        upper: Option<KeyValue>,
    },
    /// Row-position window for tables without a usable key.
    Position { offset: i64, limit: Option<i64> },
}

impl ChunkRange {
    /// The whole table as one chunk.
    pub fn full_key() -> Self {
        ChunkRange::Key {
            lower: None,
            upper: None,
        }
    }

    /// Whether `key` falls inside a key range.
    pub fn contains(&self, key: &KeyValue) -> bool {
        match self {
            ChunkRange::Key { lower, upper } => {
                lower.as_ref().map(|l| key >= l).unwrap_or(true)
                    && upper.as_ref().map(|u| key < u).unwrap_or(true)
            }
            ChunkRange::Position { .. } => false,
        }
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkRange::Key { lower, upper } => {
                match lower {
                    Some(l) => write!(f, "[{}, ", l)?,
                    None => write!(f, "(-inf, ")?,
                }
                match upper {
                    Some(u) => write!(f, "{})", u),
                    None => write!(f, "+inf)"),
                }
            }
            ChunkRange::Position { offset, limit } => match limit {
                Some(limit) => write!(f, "rows {}..{}", offset, offset + limit),
                None => write!(f, "rows {}..", offset),
            },
        }
    }
}

/// Lifecycle of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Done => "done",
            ChunkStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ChunkStatus::Pending),
            "in_progress" => Ok(ChunkStatus::InProgress),
            "done" => Ok(ChunkStatus::Done),
            "failed" => Ok(ChunkStatus::Failed),
            other => Err(MigrateError::State(format!("unknown chunk status '{}'", other))),
        }
    }
}

/// One independently retryable slice of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkChunk {
    /// Source table name.
    pub table: String,
    /// Position of the chunk within its table, starting at 1.
    pub chunk_id: i64,
    pub range: ChunkRange,
    pub estimated_rows: i64,
    pub status: ChunkStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Claims so far; identifies the current claim.
    pub attempt: u32,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Not claimable before this instant (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkChunk {
    pub fn new(table: impl Into<String>, chunk_id: i64, range: ChunkRange, estimated_rows: i64) -> Self {
        Self {
            table: table.into(),
            chunk_id,
            range,
            estimated_rows,
            status: ChunkStatus::Pending,
            retry_count: 0,
            attempt: 0,
            worker_id: None,
            claimed_at: None,
            not_before: None,
            error: None,
        }
    }

    /// Whether an earlier claim of this chunk may have committed rows.
    pub fn is_reattempt(&self) -> bool {
        self.attempt > 1
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        format!("{}#{}", self.table, self.chunk_id)
    }
}

/// Evenly spaced integer ranges over `[min, max]`.
///
/// The width is chosen so each range is expected to hold at most
/// `chunk_rows` rows given the observed density. The first range is open
/// below and the last open above.
pub fn integer_ranges(min: i64, max: i64, row_count: i64, chunk_rows: i64) -> Vec<(ChunkRange, i64)> {
    if row_count <= 0 || max < min {
        return vec![(ChunkRange::full_key(), row_count.max(0))];
    }

    let span = max as i128 - min as i128 + 1;
    let rows = row_count as i128;
    let target = chunk_rows.max(1) as i128;
    let width = ((target * span + rows - 1) / rows).max(1);

    let end = max as i128 + 1;
    let mut ranges = Vec::new();
    let mut lower = min as i128;
    while lower < end {
        let upper = (lower + width).min(end);
        let estimate = ((upper - lower) * rows + span - 1) / span;
        ranges.push((lower, upper, estimate.min(target) as i64));
        lower = upper;
    }

    let last = ranges.len() - 1;
    ranges
        .into_iter()
        .enumerate()
        .map(|(i, (lower, upper, estimate))| {
            let range = ChunkRange::Key {
                lower: (i > 0).then(|| KeyValue::Int(lower as i64)),
                upper: (i < last).then(|| KeyValue::Int(upper as i64)),
            };
            (range, estimate)
        })
        .collect()
}

/// Ranges between sampled boundary keys.
///
/// `boundaries` are the keys at every `step`-th row in the source's key
/// order (its collation, not Rust's); they become the lower bounds of
/// chunks 2..=n and are never re-sorted here.
pub fn sampled_ranges(mut boundaries: Vec<KeyValue>, row_count: i64, step: i64) -> Vec<(ChunkRange, i64)> {
    boundaries.dedup();
    if boundaries.is_empty() {
        return vec![(ChunkRange::full_key(), row_count.max(0))];
    }

    let mut ranges = Vec::with_capacity(boundaries.len() + 1);
    let mut lower: Option<KeyValue> = None;
    let mut assigned = 0i64;
    for boundary in boundaries {
        ranges.push((
            ChunkRange::Key {
                lower: lower.take(),
                upper: Some(boundary.clone()),
            },
            step,
        ));
        assigned += step;
        lower = Some(boundary);
    }
    ranges.push((
        ChunkRange::Key { lower, upper: None },
        (row_count - assigned).max(0),
    ));
    ranges
}

/// LIMIT/OFFSET windows; the last window is unbounded.
pub fn position_ranges(row_count: i64, chunk_rows: i64) -> Vec<(ChunkRange, i64)> {
    let chunk_rows = chunk_rows.max(1);
    if row_count <= chunk_rows {
        return vec![(
            ChunkRange::Position {
                offset: 0,
                limit: None,
            },
            row_count.max(0),
        )];
    }

    let count = (row_count + chunk_rows - 1) / chunk_rows;
    (0..count)
        .map(|i| {
            let offset = i * chunk_rows;
            let last = i == count - 1;
            let range = ChunkRange::Position {
                offset,
                limit: (!last).then_some(chunk_rows),
            };
            let estimate = if last { row_count - offset } else { chunk_rows };
            (range, estimate)
        })
        .collect()
}

/// Turn planned ranges into numbered pending chunks.
pub fn number_chunks(table: &str, ranges: Vec<(ChunkRange, i64)>) -> Vec<WorkChunk> {
    ranges
        .into_iter()
        .enumerate()
        .map(|(i, (range, estimate))| WorkChunk::new(table, i as i64 + 1, range, estimate))
        .collect()
}

/// Check that a table's chunks cover its domain exactly once.
///
/// Key chunks, taken in chunk id order, must chain `upper == next.lower`
/// from an open lower end to an open upper end; position chunks must chain `offset + limit == next.offset`
/// from offset 0 to an unbounded window.
pub fn validate_coverage(table: &str, chunks: &[WorkChunk]) -> Result<()> {
    let fail = |msg: String| Err(MigrateError::PoolConsistency(format!("{}: {}", table, msg)));

    if chunks.is_empty() {
        return fail("no chunks".into());
    }

    let mut ids = HashSet::new();
    for chunk in chunks {
        if chunk.table != table {
            return fail(format!("chunk {} belongs to {}", chunk.chunk_id, chunk.table));
        }
        if !ids.insert(chunk.chunk_id) {
            return fail(format!("duplicate chunk id {}", chunk.chunk_id));
        }
    }

    let mut keyed: Vec<(&Option<KeyValue>, &Option<KeyValue>, i64)> = Vec::new();
    let mut positional: Vec<(i64, Option<i64>, i64)> = Vec::new();
    for chunk in chunks {
        match &chunk.range {
            ChunkRange::Key { lower, upper } => keyed.push((lower, upper, chunk.chunk_id)),
            ChunkRange::Position { offset, limit } => positional.push((*offset, *limit, chunk.chunk_id)),
        }
    }
    if !keyed.is_empty() && !positional.is_empty() {
        return fail("mixes key and position chunks".into());
    }

    if !keyed.is_empty() {
        // Text keys follow the source collation, so chain by chunk id
        // rather than comparing bounds.
        keyed.sort_by_key(|k| k.2);
        if keyed[0].0.is_some() {
            return fail("gap below the first chunk".into());
        }
        for pair in keyed.windows(2) {
            let (_, upper, id) = pair[0];
            let (next_lower, _, next_id) = pair[1];
            match (upper, next_lower) {
                (Some(u), Some(l)) if u == l => {}
                _ => {
                    return fail(format!(
                        "gap or overlap between chunks {} and {}",
                        id, next_id
                    ))
                }
            }
        }
        for (lower, upper, id) in &keyed {
            if let (Some(KeyValue::Int(l)), Some(KeyValue::Int(u))) = (lower, upper) {
                if l >= u {
                    return fail(format!("chunk {} has an empty range", id));
                }
            }
        }
        if keyed[keyed.len() - 1].1.is_some() {
            return fail("gap above the last chunk".into());
        }
    } else {
        positional.sort_by_key(|p| p.0);
        if positional[0].0 != 0 {
            return fail("first window does not start at row 0".into());
        }
        for pair in positional.windows(2) {
            let (offset, limit, id) = pair[0];
            let (next_offset, _, next_id) = pair[1];
            match limit {
                Some(limit) if limit > 0 && offset + limit == next_offset => {}
                Some(limit) if limit > 0 && offset + limit < next_offset => {
                    return fail(format!("gap between chunks {} and {}", id, next_id))
                }
                _ => return fail(format!("chunks {} and {} overlap", id, next_id)),
            }
        }
        if positional[positional.len() - 1].1.is_some() {
            return fail("last window is bounded".into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(ranges: &[(ChunkRange, i64)]) -> Vec<(Option<i64>, Option<i64>)> {
        ranges
            .iter()
            .map(|(r, _)| match r {
                ChunkRange::Key { lower, upper } => (
                    lower.as_ref().and_then(|k| k.as_int()),
                    upper.as_ref().and_then(|k| k.as_int()),
                ),
                ChunkRange::Position { .. } => panic!("expected key range"),
            })
            .collect()
    }

    #[test]
    fn test_integer_ranges_250_rows() {
        let ranges = integer_ranges(1, 250, 250, 100);
        assert_eq!(
            bounds(&ranges),
            vec![(None, Some(101)), (Some(101), Some(201)), (Some(201), None)]
        );
        let estimates: Vec<i64> = ranges.iter().map(|(_, e)| *e).collect();
        assert_eq!(estimates, vec![100, 100, 50]);
    }

    #[test]
    fn test_integer_ranges_sparse_keys() {
        // 100 rows spread over ids 1..=1000: ranges are 10x wider
        let ranges = integer_ranges(1, 1000, 100, 50);
        assert_eq!(ranges.len(), 2);
        assert_eq!(bounds(&ranges), vec![(None, Some(501)), (Some(501), None)]);
        let total: i64 = ranges.iter().map(|(_, e)| *e).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_integer_ranges_extreme_span() {
        let ranges = integer_ranges(i64::MIN, i64::MAX, 4, 2);
        assert_eq!(ranges.len(), 2);
        let chunks = number_chunks("t", ranges);
        validate_coverage("t", &chunks).unwrap();
    }

    #[test]
    fn test_integer_ranges_empty_table() {
        let ranges = integer_ranges(0, 0, 0, 100);
        assert_eq!(ranges, vec![(ChunkRange::full_key(), 0)]);
    }

    #[test]
    fn test_sampled_ranges() {
        let ranges = sampled_ranges(
            vec![KeyValue::from("f"), KeyValue::from("f"), KeyValue::from("m")],
            25,
            10,
        );
        assert_eq!(ranges.len(), 3);
        assert_eq!(
            ranges[1].0,
            ChunkRange::Key {
                lower: Some(KeyValue::from("f")),
                upper: Some(KeyValue::from("m")),
            }
        );
        assert_eq!(ranges[2].1, 5);
        validate_coverage("t", &number_chunks("t", ranges)).unwrap();
    }

    #[test]
    fn test_position_ranges() {
        let ranges = position_ranges(250, 100);
        assert_eq!(
            ranges.iter().map(|(r, _)| r.clone()).collect::<Vec<_>>(),
            vec![
                ChunkRange::Position { offset: 0, limit: Some(100) },
                ChunkRange::Position { offset: 100, limit: Some(100) },
                ChunkRange::Position { offset: 200, limit: None },
            ]
        );
        validate_coverage("t", &number_chunks("t", ranges)).unwrap();
    }

    #[test]
    fn test_validate_coverage_detects_overlap_and_gap() {
        let mut chunks = number_chunks("t", integer_ranges(1, 300, 300, 100));
        chunks[1].range = ChunkRange::Key {
            lower: Some(KeyValue::Int(90)),
            upper: Some(KeyValue::Int(201)),
        };
        let err = validate_coverage("t", &chunks).unwrap_err();
        assert!(matches!(err, MigrateError::PoolConsistency(_)));

        let mut chunks = number_chunks("t", integer_ranges(1, 300, 300, 100));
        chunks[1].range = ChunkRange::Key {
            lower: Some(KeyValue::Int(110)),
            upper: Some(KeyValue::Int(201)),
        };
        assert!(validate_coverage("t", &chunks)
            .unwrap_err()
            .to_string()
            .contains("gap"));

        let mut chunks = number_chunks("t", integer_ranges(1, 300, 300, 100));
        chunks.pop();
        assert!(validate_coverage("t", &chunks).is_err());
    }

    #[test]
    fn test_range_contains() {
        let range = ChunkRange::Key {
            lower: Some(KeyValue::Int(10)),
            upper: Some(KeyValue::Int(20)),
        };
        assert!(range.contains(&KeyValue::Int(10)));
        assert!(!range.contains(&KeyValue::Int(20)));
        assert!(ChunkRange::full_key().contains(&KeyValue::Int(-5)));
    }

    #[test]
    fn test_chunk_status_round_trip() {
        for status in [
            ChunkStatus::Pending,
            ChunkStatus::InProgress,
            ChunkStatus::Done,
            ChunkStatus::Failed,
        ] {
            assert_eq!(ChunkStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ChunkStatus::parse("bogus").is_err());
    }
}
