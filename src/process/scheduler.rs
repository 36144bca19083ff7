//! Cooperative round-robin scheduling over the thread table.
//!
//! The emulator multiplexes all guest threads onto one host thread; switches only
//! happen at defined yield points (waiting syscalls, quantum expiry, explicit
//! yields, the active thread becoming non-runnable). This module contributes the
//! scheduling operations of [`ProcessContext`]: the ready queue, wait bookkeeping,
//! wait re-evaluation with timeout handling, and the next-thread decision
//! including virtual-clock fast-forward and deadlock detection.
//!
//! Expired waits complete with `STATUS_TIMEOUT` before runnable threads are
//! considered, so timed waiters are never starved by a busy thread.

use crate::{
    process::{
        context::ProcessContext,
        object::KernelObject,
        thread::{WaitKind, WaitRequest, WaitState},
    },
    syscalls::NtStatus,
};

/// What the scheduler decided at a scheduling point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Run (or keep running) this thread.
    Run(u32),
    /// Nothing is runnable; fast-forward the steady clock to this tick, after
    /// which at least one wait times out.
    FastForward(u64),
    /// Nothing is runnable and no waiter has a deadline.
    Deadlock,
    /// Every thread has terminated.
    AllExited,
}

impl ProcessContext {
    /// Appends a thread to the ready queue if it is not already queued.
    pub fn enqueue_ready(&mut self, tid: u32) {
        if !self.ready_queue.contains(&tid) {
            self.ready_queue.push_back(tid);
        }
    }

    /// Moves the active thread into a wait. The caller (the dispatcher) performs
    /// the actual thread switch afterwards.
    pub fn begin_wait(&mut self, tid: u32, request: WaitRequest) {
        if let Some(thread) = self.threads.get_mut(&tid) {
            thread.state = WaitState::Waiting;
            thread.wait = Some(request);
        }
        self.ready_queue.retain(|queued| *queued != tid);
    }

    /// Re-evaluates every waiting thread: due timers signal, satisfied waits
    /// acquire their objects and complete, expired waits complete with
    /// `STATUS_TIMEOUT`, and alertable waits complete with `STATUS_USER_APC`
    /// when a user APC is queued.
    pub fn check_waits(&mut self) {
        let now = self.clocks.steady_time();

        // Due timers become signaled before waits are evaluated.
        let due: Vec<_> = self
            .objects
            .iter()
            .filter_map(|(id, entry)| match &entry.object {
                KernelObject::Timer(timer)
                    if !timer.signaled && timer.due_time.is_some_and(|due| due <= now) =>
                {
                    Some(id)
                }
                _ => None,
            })
            .collect();
        for id in due {
            if let Some(KernelObject::Timer(timer)) = self.objects.get_mut(id) {
                timer.signaled = true;
            }
        }

        let waiting: Vec<u32> = self
            .threads
            .iter()
            .filter(|(_, thread)| thread.state == WaitState::Waiting)
            .map(|(tid, _)| *tid)
            .collect();

        for tid in waiting {
            if let Some(status) = self.evaluate_wait(tid, now) {
                self.complete_wait(tid, status);
            }
        }
    }

    /// Picks the next thread to run.
    ///
    /// The active thread does not sit in the ready queue; callers requeue it (or
    /// not) before asking for a decision. Expired waits must have been completed
    /// via [`check_waits`](Self::check_waits) first.
    pub fn select_next(&mut self) -> ScheduleDecision {
        while let Some(tid) = self.ready_queue.pop_front() {
            if self
                .threads
                .get(&tid)
                .is_some_and(super::thread::EmulatedThread::is_runnable)
            {
                return ScheduleDecision::Run(tid);
            }
        }

        if self.threads.values().all(super::thread::EmulatedThread::is_terminated) {
            return ScheduleDecision::AllExited;
        }

        let earliest_deadline = self
            .threads
            .values()
            .filter(|thread| thread.state == WaitState::Waiting)
            .filter_map(|thread| thread.wait.as_ref().and_then(|wait| wait.deadline))
            .min();

        match earliest_deadline {
            Some(deadline) => ScheduleDecision::FastForward(deadline),
            None => ScheduleDecision::Deadlock,
        }
    }

    /// Evaluates one thread's wait; returns the completion status if it is over.
    ///
    /// Order of checks follows NT: queued user APCs complete alertable waits
    /// first, then object signal states, then the deadline.
    fn evaluate_wait(&mut self, tid: u32, now: u64) -> Option<NtStatus> {
        let thread = self.threads.get(&tid)?;
        let wait = thread.wait.as_ref()?.clone();

        if wait.alertable && !thread.user_apcs.is_empty() {
            return Some(NtStatus::USER_APC);
        }

        match wait.kind {
            WaitKind::Any => {
                let satisfied = wait
                    .objects
                    .iter()
                    .position(|&object| self.object_signaled(object));
                if let Some(index) = satisfied {
                    let abandoned = self.acquire_object(wait.objects[index], tid);
                    let base = if abandoned {
                        NtStatus::ABANDONED_WAIT_0
                    } else {
                        NtStatus::WAIT_0
                    };
                    return Some(base.biased(index));
                }
            }
            WaitKind::All => {
                if wait
                    .objects
                    .iter()
                    .all(|&object| self.object_signaled(object))
                {
                    let mut abandoned = false;
                    for &object in &wait.objects {
                        abandoned |= self.acquire_object(object, tid);
                    }
                    return Some(if abandoned {
                        NtStatus::ABANDONED_WAIT_0
                    } else {
                        NtStatus::SUCCESS
                    });
                }
            }
        }

        if wait.deadline.is_some_and(|deadline| now >= deadline) {
            // Pure sleeps (no objects) finish normally; object waits time out.
            return Some(if wait.objects.is_empty() {
                NtStatus::SUCCESS
            } else {
                NtStatus::TIMEOUT
            });
        }

        None
    }

    /// Completes a wait: clears the request, records the status for delivery in
    /// RAX at the next switch-in, and requeues the thread.
    pub(crate) fn complete_wait(&mut self, tid: u32, status: NtStatus) {
        let Some(thread) = self.threads.get_mut(&tid) else {
            return;
        };
        thread.wait = None;
        thread.state = WaitState::Runnable;
        thread.pending_status = Some(status);
        thread.last_status = status;
        let runnable = thread.suspend_count == 0;
        if runnable {
            self.enqueue_ready(tid);
        }
        log::trace!("wait of thread {tid} completed with {status}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryManager,
        process::{
            object::{EventObject, KernelObject},
            thread::Apc,
        },
        test::cpu::FakeCpu,
    };

    fn process_with_threads(count: usize) -> (ProcessContext, MemoryManager, FakeCpu, Vec<u32>) {
        let mut process = ProcessContext::new(true);
        let mut memory = MemoryManager::new();
        let mut cpu = FakeCpu::new();
        let tids = (0..count)
            .map(|i| {
                process
                    .create_thread(&mut cpu, &mut memory, 0x1000 + i as u64 * 0x100, 0, 0, false)
                    .unwrap()
            })
            .collect();
        (process, memory, cpu, tids)
    }

    fn event_object(process: &mut ProcessContext, signaled: bool) -> crate::process::ObjectId {
        let handle = process.insert_object(
            KernelObject::Event(EventObject {
                manual_reset: false,
                signaled,
            }),
            0x1F0003,
            false,
        );
        process.handles.get(handle).unwrap().object
    }

    #[test]
    fn test_round_robin_order() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(3);

        assert_eq!(process.select_next(), ScheduleDecision::Run(tids[0]));
        process.enqueue_ready(tids[0]);
        assert_eq!(process.select_next(), ScheduleDecision::Run(tids[1]));
        assert_eq!(process.select_next(), ScheduleDecision::Run(tids[2]));
        assert_eq!(process.select_next(), ScheduleDecision::Run(tids[0]));
    }

    #[test]
    fn test_wait_completes_on_signal() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let event = event_object(&mut process, false);

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![event],
                kind: WaitKind::Any,
                deadline: None,
                alertable: false,
            },
        );
        process.check_waits();
        assert_eq!(process.threads[&tids[0]].state, WaitState::Waiting);

        if let Some(KernelObject::Event(event)) = process.objects.get_mut(event) {
            event.signaled = true;
        }
        process.check_waits();

        let thread = &process.threads[&tids[0]];
        assert_eq!(thread.state, WaitState::Runnable);
        assert_eq!(thread.pending_status, Some(NtStatus::WAIT_0));
        // The auto-reset event was consumed by the completing wait.
        assert!(!process.object_signaled(event));
    }

    #[test]
    fn test_wait_all_requires_every_object() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let first = event_object(&mut process, true);
        let second = event_object(&mut process, false);

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![first, second],
                kind: WaitKind::All,
                deadline: None,
                alertable: false,
            },
        );
        process.check_waits();
        assert_eq!(process.threads[&tids[0]].state, WaitState::Waiting);
        // The first event must not have been consumed by the incomplete wait.
        assert!(process.object_signaled(first));

        if let Some(KernelObject::Event(event)) = process.objects.get_mut(second) {
            event.signaled = true;
        }
        process.check_waits();
        assert_eq!(
            process.threads[&tids[0]].pending_status,
            Some(NtStatus::SUCCESS)
        );
        assert!(!process.object_signaled(first));
        assert!(!process.object_signaled(second));
    }

    #[test]
    fn test_timeout_and_fast_forward() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let event = event_object(&mut process, false);

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![event],
                kind: WaitKind::Any,
                deadline: Some(5_000),
                alertable: false,
            },
        );
        process.check_waits();

        // Nothing runnable; the scheduler asks for a fast-forward to the deadline.
        assert_eq!(process.select_next(), ScheduleDecision::FastForward(5_000));
        process.clocks.fast_forward_to(5_000);
        process.check_waits();

        let thread = &process.threads[&tids[0]];
        assert_eq!(thread.pending_status, Some(NtStatus::TIMEOUT));
        assert_eq!(process.select_next(), ScheduleDecision::Run(tids[0]));
    }

    #[test]
    fn test_deadlock_detection() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let event = event_object(&mut process, false);

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![event],
                kind: WaitKind::Any,
                deadline: None,
                alertable: false,
            },
        );
        process.check_waits();
        assert_eq!(process.select_next(), ScheduleDecision::Deadlock);
    }

    #[test]
    fn test_all_exited() {
        let (mut process, mut memory, mut cpu, tids) = process_with_threads(2);
        for tid in &tids {
            process
                .terminate_thread(&mut cpu, &mut memory, *tid, 0)
                .unwrap();
        }
        assert_eq!(process.select_next(), ScheduleDecision::AllExited);
    }

    #[test]
    fn test_alertable_wait_completes_on_apc() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let event = event_object(&mut process, false);

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![event],
                kind: WaitKind::Any,
                deadline: None,
                alertable: true,
            },
        );
        process.check_waits();
        assert_eq!(process.threads[&tids[0]].state, WaitState::Waiting);

        process
            .threads
            .get_mut(&tids[0])
            .unwrap()
            .user_apcs
            .push_back(Apc {
                routine: 0x5000,
                argument1: 0,
                argument2: 0,
                argument3: 0,
            });
        process.check_waits();
        assert_eq!(
            process.threads[&tids[0]].pending_status,
            Some(NtStatus::USER_APC)
        );
    }

    #[test]
    fn test_timer_signals_at_due_time() {
        let (mut process, _memory, _cpu, tids) = process_with_threads(1);
        let handle = process.insert_object(
            KernelObject::Timer(crate::process::object::TimerObject {
                manual_reset: true,
                signaled: false,
                due_time: Some(1_000),
            }),
            0x1F0003,
            false,
        );
        let timer = process.handles.get(handle).unwrap().object;

        process.begin_wait(
            tids[0],
            WaitRequest {
                objects: vec![timer],
                kind: WaitKind::Any,
                deadline: None,
                alertable: false,
            },
        );
        process.check_waits();
        assert_eq!(process.threads[&tids[0]].state, WaitState::Waiting);

        process.clocks.fast_forward_to(1_000);
        process.check_waits();
        assert_eq!(
            process.threads[&tids[0]].pending_status,
            Some(NtStatus::WAIT_0)
        );
    }
}
