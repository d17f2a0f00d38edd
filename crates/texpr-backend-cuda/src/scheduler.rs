//! The stream/event scheduler.
//!
//! Partitions the execution-unit DAG onto concurrent streams and inserts
//! event synchronization for every cross-stream dependency. Placement is
//! greedy: a unit stays on the stream whose tail is its most recent
//! dependency, otherwise a new stream opens. Event objects are pooled: a
//! physical event becomes reusable once all waiters of its correlation have
//! drained. Rerun fences use prebound objects.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::unit::{ExecUnit, PrimOp, UnitId};

/// A logical event: the physical object, the correlation grouping the emit
/// with its waiters, and the emitting unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSlot {
    pub event_object: usize,
    /// Correlation id; equals the producing unit's id.
    pub correlation: usize,
    pub emitting_unit: UnitId,
}

/// One entry of a per-stream command list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamCmd {
    Perform(PrimOp),
    EmitEvent(EventSlot),
    WaitOnEvent(EventSlot),
    EmitRerunEvent { event_object: usize, unit: UnitId },
    WaitOnRerunEvent { event_object: usize, unit: UnitId },
    ExecUnitStart(UnitId),
    ExecUnitEnd(UnitId),
    RerunSatisfied(UnitId),
}

/// Scheduler output: ordered command lists per stream and the number of
/// physical event objects the recipe must create.
#[derive(Debug, Clone, Default)]
pub struct StreamSchedule {
    pub streams: Vec<Vec<StreamCmd>>,
    pub event_object_count: usize,
}

pub fn schedule(units: &[ExecUnit]) -> StreamSchedule {
    let mut stream_of = vec![0usize; units.len()];
    let mut stream_tails: Vec<Option<UnitId>> = Vec::new();

    // Pass 1: greedy stream assignment. Staying behind the most recently
    // scheduled dependency avoids a synchronization event entirely.
    for unit in units {
        let mut choice: Option<usize> = None;
        let mut best_tail = 0;
        for (stream, tail) in stream_tails.iter().enumerate() {
            if let Some(tail) = tail {
                if unit.depends_on.contains(tail)
                    && (choice.is_none() || *tail > best_tail)
                {
                    choice = Some(stream);
                    best_tail = *tail;
                }
            }
        }
        let stream = match choice {
            Some(stream) => stream,
            None => {
                stream_tails.push(None);
                stream_tails.len() - 1
            }
        };
        stream_of[unit.id] = stream;
        stream_tails[stream] = Some(unit.id);
    }

    // Rerun fences: a unit overwriting storage read on another stream must
    // wait for that reader's previous-iteration completion. Same-stream
    // pairs are already serialized by in-order execution. Every cross-stream
    // fence target gets one prebound event object.
    let mut rerun_events: HashMap<UnitId, usize> = HashMap::new();
    for unit in units {
        for &fence in &unit.rerun_after {
            if stream_of[fence] != stream_of[unit.id] {
                let next = rerun_events.len();
                rerun_events.entry(fence).or_insert(next);
            }
        }
    }

    // Cross-stream waiter counts per producer.
    let mut waiters: HashMap<UnitId, usize> = HashMap::new();
    for unit in units {
        for &dep in &unit.depends_on {
            if stream_of[dep] != stream_of[unit.id] {
                *waiters.entry(dep).or_insert(0) += 1;
            }
        }
    }

    // Pass 2: build the per-stream command lists in unit order, assigning
    // pooled event objects as correlations open and close.
    let mut streams: Vec<Vec<StreamCmd>> =
        vec![Vec::new(); stream_tails.len().max(1)];
    let mut free_objects: Vec<usize> = Vec::new();
    let mut next_object = rerun_events.len();
    let mut open_events: HashMap<UnitId, (usize, usize)> = HashMap::new();
    let mut max_objects = rerun_events.len();

    for unit in units {
        let stream = stream_of[unit.id];
        let cmds = &mut streams[stream];
        cmds.push(StreamCmd::ExecUnitStart(unit.id));

        for &dep in &unit.depends_on {
            if stream_of[dep] == stream {
                continue;
            }
            let (object, remaining) = open_events
                .get_mut(&dep)
                .map(|entry| {
                    entry.1 -= 1;
                    (entry.0, entry.1)
                })
                .expect("cross-stream dependency must have an open event");
            cmds.push(StreamCmd::WaitOnEvent(EventSlot {
                event_object: object,
                correlation: dep,
                emitting_unit: dep,
            }));
            if remaining == 0 {
                open_events.remove(&dep);
                free_objects.push(object);
            }
        }

        let mut had_rerun_fence = false;
        for &fence in &unit.rerun_after {
            if stream_of[fence] == stream {
                continue;
            }
            had_rerun_fence = true;
            cmds.push(StreamCmd::WaitOnRerunEvent {
                event_object: rerun_events[&fence],
                unit: fence,
            });
        }
        if had_rerun_fence {
            cmds.push(StreamCmd::RerunSatisfied(unit.id));
        }

        for op in &unit.ops {
            cmds.push(StreamCmd::Perform(op.clone()));
        }

        if let Some(&waiter_count) = waiters.get(&unit.id) {
            let object = free_objects.pop().unwrap_or_else(|| {
                let object = next_object;
                next_object += 1;
                object
            });
            max_objects = max_objects.max(object + 1);
            open_events.insert(unit.id, (object, waiter_count));
            cmds.push(StreamCmd::EmitEvent(EventSlot {
                event_object: object,
                correlation: unit.id,
                emitting_unit: unit.id,
            }));
        }

        if rerun_events.contains_key(&unit.id) {
            cmds.push(StreamCmd::EmitRerunEvent {
                event_object: rerun_events[&unit.id],
                unit: unit.id,
            });
        }

        cmds.push(StreamCmd::ExecUnitEnd(unit.id));
    }

    StreamSchedule {
        streams,
        event_object_count: max_objects,
    }
}
