//! Range planner: turns the archiver's sparse processed intervals and a stored
//! cursor into the next bounded unit of work.
//!
//! Everything here is pure; planning twice against the same status and cursor
//! yields the same plan.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use thiserror::Error;

use crate::archiver::ArchiverStatus;
use crate::model::TickInterval;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("invalid interval in epoch {epoch}: from {from} > to {to}")]
    InvalidInterval { epoch: u32, from: u32, to: u32 },
    #[error("data rewind: {0}")]
    Rewind(String),
}

/// Contiguous ticks `[start, end]` of one epoch, never crossing an interval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRange {
    pub epoch: u32,
    pub start: u32,
    pub end: u32,
}

impl TickRange {
    pub fn ticks(&self) -> RangeInclusive<u32> {
        self.start..=self.end
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Where an epoch worker resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochStart {
    From(u32),
    /// Cursor already sits on the epoch's last processed tick.
    Done,
}

/// Rejects intervals with `from > to`.
pub fn validate_status(status: &ArchiverStatus) -> Result<(), PlanError> {
    for i in status.intervals() {
        if i.from > i.to {
            return Err(PlanError::InvalidInterval {
                epoch: i.epoch,
                from: i.from,
                to: i.to,
            });
        }
    }
    Ok(())
}

/// Single-cursor planning: the first interval whose `to` is past the cursor,
/// clipped to `[cursor + 1, latest tick]`.
pub fn next_tick_range(status: &ArchiverStatus, last_processed_tick: u32) -> Option<TickRange> {
    let latest = status.latest_tick();
    let interval = status
        .intervals()
        .into_iter()
        .find(|i| i.to > last_processed_tick)?;
    let start = interval.from.max(last_processed_tick.saturating_add(1));
    let end = interval.to.min(latest);
    (start <= end).then_some(TickRange {
        epoch: interval.epoch,
        start,
        end,
    })
}

/// Per-epoch starting ticks for the epoch fan-out.
///
/// No cursor: the epoch's first interval start. Cursor on the last interval's
/// end: [EpochStart::Done]. Otherwise `cursor + 1`. A cursor past the epoch's
/// last tick means the archiver went backwards.
pub fn epoch_starting_ticks(
    status: &ArchiverStatus,
    cursors: &BTreeMap<u32, u32>,
) -> Result<BTreeMap<u32, EpochStart>, PlanError> {
    let mut starts = BTreeMap::new();
    for epoch in status.epochs() {
        let intervals = status.epoch_intervals(epoch);
        let (Some(first), Some(last)) = (intervals.first(), intervals.last()) else {
            continue;
        };
        let start = match cursors.get(&epoch) {
            None => EpochStart::From(first.from),
            Some(&cursor) if cursor == last.to => EpochStart::Done,
            Some(&cursor) if cursor > last.to => {
                return Err(PlanError::Rewind(format!(
                    "epoch {epoch} cursor {cursor} is past last processed tick {}",
                    last.to
                )))
            }
            Some(&cursor) => EpochStart::From(cursor + 1),
        };
        starts.insert(epoch, start);
    }
    Ok(starts)
}

/// Remaining ranges of `epoch` from `start`, clamped to the archiver's latest tick.
pub fn epoch_ranges(status: &ArchiverStatus, epoch: u32, start: u32) -> Vec<TickRange> {
    let latest = status.latest_tick();
    status
        .epoch_intervals(epoch)
        .into_iter()
        .filter_map(|i| {
            let s = i.from.max(start);
            let e = i.to.min(latest);
            (s <= e).then_some(TickRange { epoch, start: s, end: e })
        })
        .collect()
}

/// Takes up to `size` ticks off the front of `ranges` (in order), removing what was taken.
pub fn take_batch(ranges: &mut Vec<TickRange>, size: usize) -> Vec<u32> {
    let mut batch = Vec::with_capacity(size);
    while batch.len() < size {
        let Some(range) = ranges.first_mut() else {
            break;
        };
        let room = (size - batch.len()) as u32;
        let take_end = range.end.min(range.start.saturating_add(room - 1));
        batch.extend(range.start..=take_end);
        if take_end == range.end {
            ranges.remove(0);
        } else {
            range.start = take_end + 1;
        }
    }
    batch
}

/// Epochs whose data is final (strictly below the latest epoch) and past the cursor.
pub fn finalized_epochs(status: &ArchiverStatus, last_processed_epoch: u32) -> Result<Vec<u32>, PlanError> {
    check_epoch_cursor(status, last_processed_epoch)?;
    let latest = status.latest_epoch();
    Ok(status
        .epochs()
        .into_iter()
        .filter(|&e| e > last_processed_epoch && e < latest)
        .collect())
}

/// Epochs past the cursor, including the latest one.
pub fn pending_epochs(status: &ArchiverStatus, last_processed_epoch: u32) -> Result<Vec<u32>, PlanError> {
    check_epoch_cursor(status, last_processed_epoch)?;
    Ok(status
        .epochs()
        .into_iter()
        .filter(|&e| e > last_processed_epoch)
        .collect())
}

fn check_epoch_cursor(status: &ArchiverStatus, last_processed_epoch: u32) -> Result<(), PlanError> {
    if status.processed_tick_intervals_per_epoch.is_empty() {
        return Ok(());
    }
    if last_processed_epoch > status.latest_epoch() {
        return Err(PlanError::Rewind(format!(
            "last processed epoch {last_processed_epoch} is ahead of archiver epoch {}",
            status.latest_epoch()
        )));
    }
    Ok(())
}

/// Remembers the previous archiver status and rejects any that went backwards:
/// a smaller latest tick, or an interval whose `to` shrank.
#[derive(Debug, Default)]
pub struct RewindGuard {
    previous: Option<(u32, HashMap<(u32, u32), u32>)>,
}

impl RewindGuard {
    pub fn check(&mut self, status: &ArchiverStatus) -> Result<(), PlanError> {
        let ends: HashMap<(u32, u32), u32> = status
            .intervals()
            .iter()
            .map(|i: &TickInterval| ((i.epoch, i.from), i.to))
            .collect();
        if let Some((prev_latest, prev_ends)) = &self.previous {
            if status.latest_tick() < *prev_latest {
                return Err(PlanError::Rewind(format!(
                    "latest tick went from {prev_latest} to {}",
                    status.latest_tick()
                )));
            }
            for (&(epoch, from), &prev_to) in prev_ends {
                if let Some(&to) = ends.get(&(epoch, from)) {
                    if to < prev_to {
                        return Err(PlanError::Rewind(format!(
                            "interval {epoch}-{from} shrank from {prev_to} to {to}"
                        )));
                    }
                }
            }
        }
        self.previous = Some((status.latest_tick(), ends));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::{EpochIntervals, ProcessedInterval, TickInfo};
    use proptest::prelude::*;

    fn status(latest: (u32, u32), epochs: &[(u32, &[(u32, u32)])]) -> ArchiverStatus {
        ArchiverStatus {
            last_processed_tick: TickInfo {
                tick_number: latest.0,
                epoch: latest.1,
            },
            processed_tick_intervals_per_epoch: epochs
                .iter()
                .map(|(epoch, intervals)| EpochIntervals {
                    epoch: *epoch,
                    intervals: intervals
                        .iter()
                        .map(|&(from, to)| ProcessedInterval {
                            initial_processed_tick: from,
                            last_processed_tick: to,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn s3() -> ArchiverStatus {
        status(
            (50000017, 103),
            &[
                (100, &[(10000001, 10000002)]),
                (103, &[(40000001, 40000002), (50000016, 50000017)]),
            ],
        )
    }

    #[test]
    fn single_cursor_cold_start() {
        let st = status((10000002, 100), &[(100, &[(10000001, 10000002)])]);
        assert_eq!(
            next_tick_range(&st, 0),
            Some(TickRange { epoch: 100, start: 10000001, end: 10000002 })
        );
    }

    #[test]
    fn single_cursor_never_crosses_intervals() {
        let st = s3();
        assert_eq!(
            next_tick_range(&st, 10000002),
            Some(TickRange { epoch: 103, start: 40000001, end: 40000002 })
        );
        assert_eq!(
            next_tick_range(&st, 40000002),
            Some(TickRange { epoch: 103, start: 50000016, end: 50000017 })
        );
        assert_eq!(next_tick_range(&st, 50000017), None);
    }

    #[test]
    fn single_cursor_clamps_to_latest_tick() {
        let st = status((15, 1), &[(1, &[(10, 20)])]);
        assert_eq!(next_tick_range(&st, 12), Some(TickRange { epoch: 1, start: 13, end: 15 }));
        assert_eq!(next_tick_range(&st, 15), None);
    }

    #[test]
    fn single_tick_range() {
        let st = status((10, 1), &[(1, &[(10, 10)])]);
        let r = next_tick_range(&st, 0).unwrap();
        assert_eq!((r.start, r.end, r.len()), (10, 10, 1));
    }

    #[test]
    fn no_epochs_means_no_work() {
        let st = status((0, 0), &[]);
        assert_eq!(next_tick_range(&st, 0), None);
        assert!(epoch_starting_ticks(&st, &BTreeMap::new()).unwrap().is_empty());
        assert!(finalized_epochs(&st, 5).unwrap().is_empty());
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let st = status((20, 1), &[(1, &[(20, 10)])]);
        assert_eq!(
            validate_status(&st),
            Err(PlanError::InvalidInterval { epoch: 1, from: 20, to: 10 })
        );
    }

    #[test]
    fn starting_ticks_resume_and_done() {
        let st = s3();
        let cold = epoch_starting_ticks(&st, &BTreeMap::new()).unwrap();
        assert_eq!(cold[&100], EpochStart::From(10000001));
        assert_eq!(cold[&103], EpochStart::From(40000001));

        let cursors = BTreeMap::from([(100, 10000002), (103, 40000002)]);
        let warm = epoch_starting_ticks(&st, &cursors).unwrap();
        assert_eq!(warm[&100], EpochStart::Done);
        assert_eq!(warm[&103], EpochStart::From(40000003));
        assert_eq!(
            epoch_ranges(&st, 103, 40000003),
            vec![TickRange { epoch: 103, start: 50000016, end: 50000017 }]
        );
    }

    #[test]
    fn cursor_past_epoch_end_is_rewind() {
        let st = s3();
        let cursors = BTreeMap::from([(100, 10000009)]);
        assert!(matches!(
            epoch_starting_ticks(&st, &cursors),
            Err(PlanError::Rewind(_))
        ));
    }

    #[test]
    fn take_batch_spans_ranges_in_order() {
        let mut ranges = vec![
            TickRange { epoch: 1, start: 1, end: 3 },
            TickRange { epoch: 1, start: 10, end: 12 },
        ];
        assert_eq!(take_batch(&mut ranges, 2), vec![1, 2]);
        assert_eq!(take_batch(&mut ranges, 3), vec![3, 10, 11]);
        assert_eq!(take_batch(&mut ranges, 5), vec![12]);
        assert!(ranges.is_empty());
        assert!(take_batch(&mut ranges, 5).is_empty());
    }

    #[test]
    fn epoch_cursors_exclude_current_epoch_when_finalized_only() {
        let st = s3();
        assert_eq!(finalized_epochs(&st, 0).unwrap(), vec![100]);
        assert_eq!(pending_epochs(&st, 0).unwrap(), vec![100, 103]);
        assert_eq!(pending_epochs(&st, 100).unwrap(), vec![103]);
        assert!(matches!(finalized_epochs(&st, 104), Err(PlanError::Rewind(_))));
    }

    #[test]
    fn rewind_guard_detects_shrinking_interval() {
        let mut guard = RewindGuard::default();
        guard.check(&status((20, 1), &[(1, &[(10, 20)])])).unwrap();
        guard.check(&status((25, 1), &[(1, &[(10, 25)])])).unwrap();
        assert!(matches!(
            guard.check(&status((25, 1), &[(1, &[(10, 22)])])),
            Err(PlanError::Rewind(_))
        ));
        let mut guard = RewindGuard::default();
        guard.check(&status((20, 1), &[(1, &[(10, 20)])])).unwrap();
        assert!(guard.check(&status((19, 1), &[(1, &[(10, 20)])])).is_err());
    }

    fn arb_status() -> impl Strategy<Value = ArchiverStatus> {
        // Up to 3 epochs, each with up to 3 disjoint ascending intervals.
        prop::collection::vec(prop::collection::vec((1u32..20, 0u32..10), 1..4), 1..4).prop_map(
            |epochs| {
                let mut next = 1u32;
                let mut out = Vec::new();
                for (i, intervals) in epochs.into_iter().enumerate() {
                    let mut ivs = Vec::new();
                    for (gap, len) in intervals {
                        let from = next + gap;
                        let to = from + len;
                        ivs.push(ProcessedInterval {
                            initial_processed_tick: from,
                            last_processed_tick: to,
                        });
                        next = to + 1;
                    }
                    out.push(EpochIntervals {
                        epoch: 100 + i as u32,
                        intervals: ivs,
                    });
                }
                let latest_epoch = out.last().map(|e| e.epoch).unwrap_or(0);
                ArchiverStatus {
                    last_processed_tick: TickInfo {
                        tick_number: next - 1,
                        epoch: latest_epoch,
                    },
                    processed_tick_intervals_per_epoch: out,
                }
            },
        )
    }

    /// Drives the per-epoch plan to exhaustion, committing after every batch.
    fn crawl(st: &ArchiverStatus, cursors: &mut BTreeMap<u32, u32>, batch: usize) -> Vec<(u32, u32)> {
        let mut emitted = Vec::new();
        for (epoch, start) in epoch_starting_ticks(st, cursors).unwrap() {
            let EpochStart::From(start) = start else { continue };
            let mut ranges = epoch_ranges(st, epoch, start);
            loop {
                let ticks = take_batch(&mut ranges, batch);
                let Some(&max) = ticks.last() else { break };
                emitted.extend(ticks.iter().map(|&t| (epoch, t)));
                cursors.insert(epoch, max);
            }
        }
        emitted
    }

    proptest! {
        #[test]
        fn crawl_emits_exactly_the_ticks_past_each_cursor(
            st in arb_status(),
            batch in 1usize..7,
            cut in 0u32..120,
        ) {
            // Seed per-epoch cursors from a prefix of the tick space.
            let mut cursors = BTreeMap::new();
            for i in st.intervals() {
                for t in i.from..=i.to {
                    if t <= cut {
                        cursors.insert(i.epoch, t);
                    }
                }
            }
            let expected: Vec<(u32, u32)> = st
                .intervals()
                .iter()
                .flat_map(|i| (i.from..=i.to).map(move |t| (i.epoch, t)))
                .filter(|&(e, t)| cursors.get(&e).map_or(true, |&c| t > c))
                .collect();
            let mut emitted = crawl(&st, &mut cursors, batch);
            emitted.sort_unstable();
            prop_assert_eq!(emitted, expected);
            // Second pass over the final cursors finds nothing left.
            prop_assert!(crawl(&st, &mut cursors, batch).is_empty());
        }

        #[test]
        fn planning_is_idempotent(st in arb_status(), cursor in 0u32..120) {
            prop_assert_eq!(next_tick_range(&st, cursor), next_tick_range(&st, cursor));
            let cursors = BTreeMap::from([(100, cursor)]);
            prop_assert_eq!(
                epoch_starting_ticks(&st, &cursors),
                epoch_starting_ticks(&st, &cursors)
            );
        }

        #[test]
        fn single_cursor_ranges_stay_inside_one_interval(st in arb_status(), cursor in 0u32..120) {
            if let Some(r) = next_tick_range(&st, cursor) {
                prop_assert!(r.start > cursor);
                prop_assert!(r.end <= st.latest_tick());
                prop_assert!(st.intervals().iter().any(|i| i.epoch == r.epoch && i.from <= r.start && r.end <= i.to));
            }
        }
    }
}
