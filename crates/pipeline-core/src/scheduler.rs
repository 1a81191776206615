//! Pipeline-wide state that doesn't belong to any single stage: the abort
//! signal, the current bitrate estimate, which processors are suspended,
//! and joint-termination bookkeeping.
//!
//! "Joint termination" means the pipeline stops once every stage that
//! opted into the joint-termination set has reported it is done, rather
//! than the instant any one stage's input plugin hits end of stream —
//! some processors (e.g. the encapsulator) need to flush buffered state
//! after their own upstream is exhausted, so termination is a barrier,
//! not a single edge.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Shared control state for one pipeline instance. Cheap to clone behind
/// an `Arc` since the actual data lives in interior-mutable fields.
pub struct Scheduler {
    abort: AtomicBool,
    bitrate: Mutex<Option<u64>>,
    bitrate_changed: AtomicBool,
    joint_termination_members: Mutex<HashSet<usize>>,
    joint_termination_done: Mutex<HashSet<usize>>,
    suspended: Mutex<HashSet<usize>>,
    restart_requests: Mutex<HashMap<usize, Vec<String>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            abort: AtomicBool::new(false),
            bitrate: Mutex::new(None),
            bitrate_changed: AtomicBool::new(false),
            joint_termination_members: Mutex::new(HashSet::new()),
            joint_termination_done: Mutex::new(HashSet::new()),
            suspended: Mutex::new(HashSet::new()),
            restart_requests: Mutex::new(HashMap::new()),
        }
    }

    pub fn signal_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn set_bitrate(&self, bps: u64) {
        let mut guard = self.bitrate.lock();
        if *guard != Some(bps) {
            self.bitrate_changed.store(true, Ordering::SeqCst);
        }
        *guard = Some(bps);
    }

    pub fn bitrate(&self) -> Option<u64> {
        *self.bitrate.lock()
    }

    /// Consume the "bitrate changed since last check" flag.
    pub fn take_bitrate_changed(&self) -> bool {
        self.bitrate_changed.swap(false, Ordering::SeqCst)
    }

    /// Register `stage_index` as a participant in joint termination: the
    /// pipeline is not considered finished until this stage also reports
    /// done via [`Self::mark_terminated`].
    pub fn join_termination_set(&self, stage_index: usize) {
        self.joint_termination_members.lock().insert(stage_index);
    }

    /// Withdraw `stage_index` from the joint-termination set (the plugin
    /// called `use_joint_termination(false)`).
    pub fn join_termination_unset(&self, stage_index: usize) {
        self.joint_termination_members.lock().remove(&stage_index);
        self.joint_termination_done.lock().remove(&stage_index);
    }

    pub fn mark_terminated(&self, stage_index: usize) {
        self.joint_termination_done.lock().insert(stage_index);
    }

    /// True if `stage_index` has opted into joint termination.
    pub fn is_joint_member(&self, stage_index: usize) -> bool {
        self.joint_termination_members.lock().contains(&stage_index)
    }

    /// True once every joint-termination member has reported done. If no
    /// stage ever joined the set, the pipeline relies purely on its
    /// input's own end-of-stream signal and this is vacuously false.
    pub fn joint_termination_reached(&self) -> bool {
        let members = self.joint_termination_members.lock();
        if members.is_empty() {
            return false;
        }
        let done = self.joint_termination_done.lock();
        members.iter().all(|m| done.contains(m))
    }

    pub fn suspend(&self, stage_index: usize) {
        self.suspended.lock().insert(stage_index);
    }

    pub fn resume(&self, stage_index: usize) {
        self.suspended.lock().remove(&stage_index);
    }

    pub fn is_suspended(&self, stage_index: usize) -> bool {
        self.suspended.lock().contains(&stage_index)
    }

    pub fn suspended_stages(&self) -> Vec<usize> {
        self.suspended.lock().iter().copied().collect()
    }

    /// Ask the supervisor to stop and re-start stage `stage_index` with
    /// `new_args` the next time its worker thread is between packets.
    pub fn request_restart(&self, stage_index: usize, new_args: Vec<String>) {
        self.restart_requests.lock().insert(stage_index, new_args);
    }

    /// Consume a pending restart request for `stage_index`, if any.
    pub fn take_restart_request(&self, stage_index: usize) -> Option<Vec<String>> {
        self.restart_requests.lock().remove(&stage_index)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_is_observed_after_signal() {
        let s = Scheduler::new();
        assert!(!s.is_aborted());
        s.signal_abort();
        assert!(s.is_aborted());
    }

    #[test]
    fn bitrate_change_flag_clears_on_read() {
        let s = Scheduler::new();
        s.set_bitrate(1_000_000);
        assert!(s.take_bitrate_changed());
        assert!(!s.take_bitrate_changed());
        s.set_bitrate(1_000_000);
        assert!(!s.take_bitrate_changed());
        s.set_bitrate(2_000_000);
        assert!(s.take_bitrate_changed());
    }

    #[test]
    fn joint_termination_requires_all_members() {
        let s = Scheduler::new();
        s.join_termination_set(1);
        s.join_termination_set(2);
        assert!(!s.joint_termination_reached());
        s.mark_terminated(1);
        assert!(!s.joint_termination_reached());
        s.mark_terminated(2);
        assert!(s.joint_termination_reached());
    }

    #[test]
    fn suspend_resume_roundtrip() {
        let s = Scheduler::new();
        s.suspend(3);
        assert!(s.is_suspended(3));
        s.resume(3);
        assert!(!s.is_suspended(3));
    }

    #[test]
    fn joint_member_membership_is_queryable() {
        let s = Scheduler::new();
        assert!(!s.is_joint_member(1));
        s.join_termination_set(1);
        assert!(s.is_joint_member(1));
        s.join_termination_unset(1);
        assert!(!s.is_joint_member(1));
    }

    #[test]
    fn restart_request_round_trips_once() {
        let s = Scheduler::new();
        assert_eq!(s.take_restart_request(2), None);
        s.request_restart(2, vec!["--pid".into(), "0x100".into()]);
        assert_eq!(s.take_restart_request(2), Some(vec!["--pid".into(), "0x100".into()]));
        assert_eq!(s.take_restart_request(2), None);
    }
}
