//! The call sequencer.
//!
//! Linearizes the per-stream command lists into one deterministic device API
//! call list. A stream's head command runs only when it is ready: waits need
//! their event to be active, emits need their physical event object to be
//! free. Among ready streams the least recently used wins, nudged so that
//! waits sequence early and emits late, which interleaves synchronization
//! instead of batching it. Finding no ready stream while work remains is a
//! scheduler invariant violation and is reported as a deadlock.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

use crate::calls::DriverCall;
use crate::error::ScheduleError;
use crate::instantiate::TemplateCache;
use crate::scheduler::{StreamCmd, StreamSchedule};
use crate::unit::{ExecUnit, PrimOp};

const EMIT_PENALTY: i64 = 1000;
const WAIT_REWARD: i64 = -1000;

pub fn sequence(
    schedule: &StreamSchedule,
    cache: &mut TemplateCache,
) -> Result<Vec<DriverCall>, ScheduleError> {
    // Waiter multiplicity per correlation, fixed at scheduling time.
    let mut waiter_counts: HashMap<usize, usize> = HashMap::new();
    for cmd in schedule.streams.iter().flatten() {
        if let StreamCmd::WaitOnEvent(slot) = cmd {
            *waiter_counts.entry(slot.correlation).or_insert(0) += 1;
        }
    }

    let mut heads = vec![0usize; schedule.streams.len()];
    let mut last_used: Vec<Option<u64>> = vec![None; schedule.streams.len()];
    let mut step: u64 = 0;
    // correlation -> (event object, waiters not yet drained)
    let mut active: HashMap<usize, (usize, usize)> = HashMap::new();
    let mut occupied: HashSet<usize> = HashSet::new();
    let mut calls = Vec::new();

    loop {
        let mut exhausted = true;
        let mut choice: Option<(i64, usize)> = None;
        for (stream, cmds) in schedule.streams.iter().enumerate() {
            let Some(head) = cmds.get(heads[stream]) else {
                continue;
            };
            exhausted = false;
            let ready = match head {
                StreamCmd::WaitOnEvent(slot) => active.contains_key(&slot.correlation),
                StreamCmd::EmitEvent(slot) => !occupied.contains(&slot.event_object),
                _ => true,
            };
            if !ready {
                continue;
            }
            let mut score = last_used[stream].map(|at| at as i64).unwrap_or(-1);
            score += match head {
                StreamCmd::EmitEvent(_) => EMIT_PENALTY,
                StreamCmd::WaitOnEvent(_) => WAIT_REWARD,
                _ => 0,
            };
            if choice.map(|(best, _)| score < best).unwrap_or(true) {
                choice = Some((score, stream));
            }
        }
        if exhausted {
            break;
        }
        let Some((_, stream)) = choice else {
            return Err(ScheduleError::Deadlock {
                state: render_state(schedule, &heads, &active),
            });
        };

        let cmd = &schedule.streams[stream][heads[stream]];
        heads[stream] += 1;
        last_used[stream] = Some(step);
        step += 1;

        match cmd {
            StreamCmd::Perform(op) => calls.push(translate_op(op, stream, cache)),
            StreamCmd::EmitEvent(slot) => {
                let waiters = waiter_counts.get(&slot.correlation).copied().unwrap_or(0);
                occupied.insert(slot.event_object);
                active.insert(slot.correlation, (slot.event_object, waiters));
                calls.push(DriverCall::EventRecord {
                    event: slot.event_object,
                    stream,
                });
            }
            StreamCmd::WaitOnEvent(slot) => {
                calls.push(DriverCall::StreamWaitEvent {
                    stream,
                    event: slot.event_object,
                });
                if let Some(entry) = active.get_mut(&slot.correlation) {
                    entry.1 -= 1;
                    if entry.1 == 0 {
                        occupied.remove(&entry.0);
                        active.remove(&slot.correlation);
                    }
                }
            }
            StreamCmd::EmitRerunEvent { event_object, .. } => {
                calls.push(DriverCall::EventRecord {
                    event: *event_object,
                    stream,
                });
            }
            StreamCmd::WaitOnRerunEvent { event_object, .. } => {
                calls.push(DriverCall::StreamWaitEvent {
                    stream,
                    event: *event_object,
                });
            }
            StreamCmd::ExecUnitStart(_)
            | StreamCmd::ExecUnitEnd(_)
            | StreamCmd::RerunSatisfied(_) => {}
        }
    }
    Ok(calls)
}

/// One-shot init units run in order on stream zero.
pub fn sequence_init(
    units: &[ExecUnit],
    cache: &mut TemplateCache,
) -> Vec<DriverCall> {
    units
        .iter()
        .flat_map(|unit| unit.ops.iter())
        .map(|op| translate_op(op, 0, cache))
        .collect()
}

fn work_dim3(work: &[u64]) -> [u64; 3] {
    match work.len() {
        0 => [1, 1, 1],
        1 => [work[0], 1, 1],
        2 => [work[0], work[1], 1],
        3 => [work[0], work[1], work[2]],
        n => {
            let folded: u64 = work[..n - 2].iter().product();
            [folded, work[n - 2], work[n - 1]]
        }
    }
}

pub(crate) fn translate_op(
    op: &PrimOp,
    stream: usize,
    cache: &mut TemplateCache,
) -> DriverCall {
    match op {
        PrimOp::LaunchKernel { inst, work, args } => DriverCall::LaunchCKernel {
            name: cache.instantiate(inst),
            work_dim: work_dim3(work),
            shared_bytes: 0,
            stream,
            args: args.clone(),
        },
        PrimOp::CallCFunc {
            inst,
            delegate,
            args,
        } => DriverCall::CallCFunc {
            name: cache.instantiate(inst),
            delegate: delegate.clone(),
            stream,
            args: args.clone(),
        },
        PrimOp::MemcpyDtoD { src, dst } => DriverCall::MemcpyAsync {
            dst: dst.clone(),
            src: src.clone(),
            stream,
        },
        PrimOp::MemcpyHtoD { src, dst } => DriverCall::MemcpyHtoDAsync {
            dst: dst.clone(),
            host_src: src.clone(),
            stream,
        },
        PrimOp::MemcpyDtoH { src, dst } => DriverCall::MemcpyDtoHAsync {
            host_dst: dst.clone(),
            src: src.clone(),
            stream,
        },
        PrimOp::Memset { value, dst } => DriverCall::MemsetD32Async {
            dst: dst.clone(),
            value: *value,
            stream,
        },
        PrimOp::BlasGemm {
            op_a,
            op_b,
            alpha,
            a,
            b,
            beta,
            c,
        } => DriverCall::BlasGemm {
            op_a: *op_a,
            op_b: *op_b,
            alpha: *alpha,
            a: a.clone(),
            b: b.clone(),
            beta: *beta,
            c: c.clone(),
            stream,
        },
        PrimOp::Trace { uexpr, result } => DriverCall::Trace {
            uexpr: uexpr.clone(),
            result: result.clone(),
        },
    }
}

fn render_state(
    schedule: &StreamSchedule,
    heads: &[usize],
    active: &HashMap<usize, (usize, usize)>,
) -> String {
    let mut state = String::new();
    for (stream, cmds) in schedule.streams.iter().enumerate() {
        let head = heads[stream];
        match cmds.get(head) {
            Some(cmd) => {
                let _ = writeln!(
                    state,
                    "stream {stream}: {}/{} done, head = {cmd:?}",
                    head,
                    cmds.len()
                );
            }
            None => {
                let _ = writeln!(state, "stream {stream}: drained ({} commands)", cmds.len());
            }
        }
    }
    let mut correlations: Vec<_> = active.iter().collect();
    correlations.sort();
    for (correlation, (object, remaining)) in correlations {
        let _ = writeln!(
            state,
            "active event: correlation {correlation} on object {object}, {remaining} waiters left"
        );
    }
    state
}
