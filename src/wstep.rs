//! Per-thread while-stepping bookkeeping.

use crate::target::{CoreAddr, ThreadId};
use std::collections::{HashMap, VecDeque};

/// One tracepoint a thread is single-stepping for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct WhileSteppingState {
    pub tp_number: u32,
    pub tp_address: CoreAddr,
    /// Steps collected so far.
    pub current_step: u64,
}

impl WhileSteppingState {
    pub fn new(tp_number: u32, tp_address: CoreAddr) -> WhileSteppingState {
        WhileSteppingState {
            tp_number,
            tp_address,
            current_step: 0,
        }
    }
}

/// The threads that are stepping, and for which tracepoints. A thread
/// with no entry is idle.
#[derive(Clone, Debug, Default)]
pub struct WhileStepping {
    threads: HashMap<ThreadId, VecDeque<WhileSteppingState>>,
}

impl WhileStepping {
    pub fn new() -> WhileStepping {
        WhileStepping::default()
    }

    /// The newest state goes first.
    pub fn add(&mut self, tid: ThreadId, tp_number: u32, tp_address: CoreAddr) {
        self.threads
            .entry(tid)
            .or_insert_with(VecDeque::new)
            .push_front(WhileSteppingState::new(tp_number, tp_address));
    }

    pub fn is_stepping(&self, tid: ThreadId) -> bool {
        self.threads.get(&tid).map_or(false, |states| !states.is_empty())
    }

    pub fn states(&self, tid: ThreadId) -> impl Iterator<Item = &WhileSteppingState> {
        self.threads.get(&tid).into_iter().flatten()
    }

    /// Take the thread's list out so the caller can walk it while
    /// collecting. Hand back what survives with `restore`.
    pub fn take(&mut self, tid: ThreadId) -> VecDeque<WhileSteppingState> {
        self.threads.remove(&tid).unwrap_or_default()
    }

    pub fn restore(&mut self, tid: ThreadId, states: VecDeque<WhileSteppingState>) {
        if !states.is_empty() {
            self.threads.insert(tid, states);
        }
    }

    pub fn release_thread(&mut self, tid: ThreadId) {
        self.threads.remove(&tid);
    }

    pub fn clear(&mut self) {
        self.threads.clear();
    }

    pub fn stepping_threads(&self) -> usize {
        self.threads.values().filter(|s| !s.is_empty()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_release_test() {
        let mut ws = WhileStepping::new();
        assert!(!ws.is_stepping(10));
        ws.add(10, 1, 0x1000);
        ws.add(10, 2, 0x2000);
        ws.add(11, 1, 0x1000);
        assert!(ws.is_stepping(10));
        let numbers: Vec<u32> = ws.states(10).map(|s| s.tp_number).collect();
        assert_eq!(numbers, vec![2, 1]);
        assert_eq!(ws.stepping_threads(), 2);

        ws.release_thread(10);
        assert!(!ws.is_stepping(10));
        assert!(ws.is_stepping(11));
        ws.clear();
        assert_eq!(ws.stepping_threads(), 0);
    }

    #[test]
    fn take_restore_test() {
        let mut ws = WhileStepping::new();
        ws.add(5, 3, 0x30);
        let mut states = ws.take(5);
        assert!(!ws.is_stepping(5));
        states[0].current_step += 1;
        ws.restore(5, states);
        assert_eq!(ws.states(5).next().unwrap().current_step, 1);
        ws.restore(6, VecDeque::new());
        assert!(!ws.is_stepping(6));
    }
}
