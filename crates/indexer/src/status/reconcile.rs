//! Reconciled tick intervals and the archiver-compatible status derived from
//! them. Pure functions; the service feeds them from Elasticsearch, the
//! archiver and its own cursor.

use serde::Serialize;
use std::collections::BTreeMap;

use qubic_publisher::model::TickInterval;

/// Clamps `intervals` to the verified tick: intervals ending at or before it
/// are kept, the one containing it is cut at it, later ones are dropped.
fn clamp(intervals: impl IntoIterator<Item = TickInterval>, last_processed_tick: u32) -> Vec<TickInterval> {
    intervals
        .into_iter()
        .filter_map(|i| {
            if i.to <= last_processed_tick {
                Some(i)
            } else if i.contains(last_processed_tick) {
                Some(TickInterval::new(i.epoch, i.from, last_processed_tick))
            } else {
                None
            }
        })
        .collect()
}

/// Historical intervals (epochs before the current one) plus the current
/// epoch's intervals from the archiver, clamped and sorted by `(epoch, from)`.
pub fn reconcile_intervals(
    historical: &[TickInterval],
    current: &[TickInterval],
    last_processed_tick: u32,
) -> Vec<TickInterval> {
    let mut out = clamp(historical.iter().copied(), last_processed_tick);
    out.extend(clamp(current.iter().copied(), last_processed_tick));
    out.sort_by_key(|i| (i.epoch, i.from));
    out.dedup_by_key(|i| (i.epoch, i.from));
    out
}

/// Inclusive range of ticks no interval covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTicksInterval {
    pub start_tick: u32,
    pub end_tick: u32,
}

/// Gaps between `intervals` (sorted by `from`), starting at tick 1 and ending
/// at the last interval.
pub fn skipped_ticks(intervals: &[TickInterval]) -> Vec<SkippedTicksInterval> {
    let mut sorted: Vec<TickInterval> = intervals.to_vec();
    sorted.sort_by_key(|i| i.from);
    let mut gaps = Vec::new();
    let mut covered_to = 0u32;
    for i in sorted {
        if i.from > covered_to.saturating_add(1) {
            gaps.push(SkippedTicksInterval {
                start_tick: covered_to + 1,
                end_tick: i.from - 1,
            });
        }
        covered_to = covered_to.max(i.to);
    }
    gaps
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickInfoView {
    pub tick_number: u32,
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedIntervalView {
    pub initial_processed_tick: u32,
    pub last_processed_tick: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochIntervalsView {
    pub epoch: u32,
    pub intervals: Vec<ProcessedIntervalView>,
}

/// Archiver-compatible status as served by `GET /v1/archiver/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedStatus {
    pub last_processed_tick: TickInfoView,
    pub last_processed_ticks_per_epoch: BTreeMap<u32, u32>,
    pub skipped_ticks: Vec<SkippedTicksInterval>,
    pub processed_tick_intervals_per_epoch: Vec<EpochIntervalsView>,
}

/// Derives the archiver-style view from reconciled intervals.
pub fn derive_status(intervals: &[TickInterval], last_processed_tick: u32) -> DerivedStatus {
    let epoch = intervals
        .iter()
        .find(|i| i.contains(last_processed_tick))
        .or_else(|| intervals.last())
        .map(|i| i.epoch)
        .unwrap_or_default();

    let mut last_processed_ticks_per_epoch = BTreeMap::new();
    for i in intervals {
        last_processed_ticks_per_epoch.insert(i.epoch, i.to);
    }

    let mut per_epoch: Vec<EpochIntervalsView> = Vec::new();
    for i in intervals {
        let view = ProcessedIntervalView {
            initial_processed_tick: i.from,
            last_processed_tick: i.to,
        };
        match per_epoch.last_mut() {
            Some(group) if group.epoch == i.epoch => group.intervals.push(view),
            _ => per_epoch.push(EpochIntervalsView {
                epoch: i.epoch,
                intervals: vec![view],
            }),
        }
    }
    if let Some(last) = per_epoch.last_mut().and_then(|g| g.intervals.last_mut()) {
        last.last_processed_tick = last_processed_tick;
    }

    DerivedStatus {
        last_processed_tick: TickInfoView {
            tick_number: last_processed_tick,
            epoch,
        },
        last_processed_ticks_per_epoch,
        skipped_ticks: skipped_ticks(intervals),
        processed_tick_intervals_per_epoch: per_epoch,
    }
}
