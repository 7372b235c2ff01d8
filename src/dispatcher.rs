use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use hashbrown::HashMap;
use tracing::{debug, trace, warn};

use crate::vm::Vm;

/// Upper bound on concurrently live sibling VMs.
pub const VM_POOL_SIZE: usize = 32;

/// How long slot acquisition sleeps between polls when the pool is full.
const ACQUIRE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct PoolSlot {
    assigned: bool,
    /// Set by [`Dispatcher::terminate_all`]; the VM in this slot polls it at
    /// loop back-edges and calls and abandons execution once it is set.
    failure: Arc<AtomicBool>,
}

/// Hands out sibling VMs for `async` blocks and futures, one OS thread per
/// sibling. The pool slots, the thread-to-slot map and the active-thread
/// list are the only state shared between threads, each behind its own lock.
#[derive(Debug)]
pub struct Dispatcher {
    pool: Mutex<Vec<PoolSlot>>,
    id_to_vm: Mutex<HashMap<ThreadId, usize>>,
    active: Mutex<Vec<(ThreadId, Arc<AtomicBool>)>>,
}

/// A forked VM moving to its worker thread.
///
/// SAFETY: Vm is !Send because it is full of raw pointers into its heap. A
/// forked VM's heap is a deep copy owned exclusively by that VM; no pointer
/// into it exists anywhere else, so moving the whole VM to another thread
/// hands over the entire object graph at once.
struct ChildVm(Vm);

unsafe impl Send for ChildVm {}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        let pool = (0..VM_POOL_SIZE)
            .map(|_| PoolSlot {
                assigned: false,
                failure: Arc::new(AtomicBool::new(false)),
            })
            .collect();

        Arc::new(Self {
            pool: Mutex::new(pool),
            id_to_vm: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
        })
    }

    /// Forks `parent` into a free pool slot and starts a thread running the
    /// child's dispatch loop. The child resumes at the parent's current
    /// instruction pointer, which rests on the first instruction of the
    /// async block. Blocks while the pool is saturated.
    pub fn spawn_async(self: &Arc<Self>, parent: &Vm) -> JoinHandle<()> {
        let slot = self.acquire_slot();
        let failure = self.slot_failure(slot);
        let child = ChildVm(parent.fork(Arc::clone(&failure)));

        let dispatcher = Arc::clone(self);
        thread::Builder::new()
            .name(format!("alox-vm-{slot}"))
            .spawn(move || {
                let mut child = child;
                let thread_id = thread::current().id();
                dispatcher.set_id(thread_id, slot);
                dispatcher.set_active(thread_id, Arc::clone(&child.0.failure));
                debug!(slot, "sibling VM started");

                if let Err(err) = child.0.run() {
                    child.0.report_runtime_error(&err);
                    dispatcher.terminate_all();
                }

                dispatcher.free_active(thread_id);
                dispatcher.clear_id(thread_id);
                dispatcher.release_slot(slot);
                debug!(slot, "sibling VM finished");
            })
            .expect("failed to spawn a sibling VM thread")
    }

    /// Reserved entry point for `future` expressions: runs a forked sibling
    /// to completion on the calling thread, discards its result, and returns
    /// the slot index that identifies the future.
    pub fn launch_future(self: &Arc<Self>, parent: &Vm) -> usize {
        let slot = self.acquire_slot();
        let failure = self.slot_failure(slot);
        let mut child = parent.fork(Arc::clone(&failure));
        debug!(slot, "future VM started");

        if let Err(err) = child.run() {
            child.report_runtime_error(&err);
            self.terminate_all();
        }

        self.release_slot(slot);
        debug!(slot, "future VM finished");
        slot
    }

    /// Raises the failure flag of every active VM. Called by a worker whose
    /// VM hit a runtime error; the other dispatch loops observe the flag and
    /// abandon their computation.
    pub fn terminate_all(&self) {
        let active = self.lock_active();
        warn!(threads = active.len(), "terminating all sibling VMs");
        for (_, failure) in active.iter() {
            failure.store(true, Ordering::SeqCst);
        }
    }

    fn acquire_slot(&self) -> usize {
        loop {
            {
                let mut pool = self.lock_pool();
                if let Some(slot) = pool.iter().position(|slot| !slot.assigned) {
                    pool[slot].assigned = true;
                    pool[slot].failure.store(false, Ordering::SeqCst);
                    return slot;
                }
            }

            trace!("VM pool saturated, polling for a free slot");
            thread::sleep(ACQUIRE_POLL);
        }
    }

    fn release_slot(&self, slot: usize) {
        self.lock_pool()[slot].assigned = false;
    }

    fn slot_failure(&self, slot: usize) -> Arc<AtomicBool> {
        Arc::clone(&self.lock_pool()[slot].failure)
    }

    fn set_id(&self, thread_id: ThreadId, slot: usize) {
        self.lock_ids().insert(thread_id, slot);
    }

    fn clear_id(&self, thread_id: ThreadId) {
        self.lock_ids().remove(&thread_id);
    }

    /// Pool slot currently assigned to a host thread, if any.
    pub fn vm_for_thread(&self, thread_id: ThreadId) -> Option<usize> {
        self.lock_ids().get(&thread_id).copied()
    }

    /// Adds a VM's failure flag to the set reached by
    /// [`Dispatcher::terminate_all`]. Root VMs register themselves for the
    /// duration of an interpretation; worker threads are registered by their
    /// spawn wrapper.
    pub(crate) fn set_active(&self, thread_id: ThreadId, failure: Arc<AtomicBool>) {
        self.lock_active().push((thread_id, failure));
    }

    pub(crate) fn free_active(&self, thread_id: ThreadId) {
        self.lock_active().retain(|(id, _)| *id != thread_id);
    }

    fn lock_pool(&self) -> MutexGuard<'_, Vec<PoolSlot>> {
        self.pool
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_ids(&self) -> MutexGuard<'_, HashMap<ThreadId, usize>> {
        self.id_to_vm
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_active(&self) -> MutexGuard<'_, Vec<(ThreadId, Arc<AtomicBool>)>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SharedWriter;

    fn idle_vm() -> Vm {
        // an idle VM has no frames, so its forked children finish instantly
        Vm::with_output(SharedWriter::new(Vec::new()))
    }

    #[test]
    fn slots_recycle_after_release() {
        let vm = idle_vm();
        let dispatcher = Arc::clone(&vm.dispatcher);

        // more spawns than the pool holds only works if slots are released
        for _ in 0..VM_POOL_SIZE + 8 {
            let handle = dispatcher.spawn_async(&vm);
            handle.join().unwrap();
        }

        assert!(dispatcher.lock_pool().iter().all(|slot| !slot.assigned));
    }

    #[test]
    fn thread_ids_are_unmapped_on_exit() {
        let vm = idle_vm();
        let dispatcher = Arc::clone(&vm.dispatcher);

        dispatcher.spawn_async(&vm).join().unwrap();
        assert!(dispatcher.lock_ids().is_empty());
        assert!(dispatcher.lock_active().is_empty());
    }

    #[test]
    fn launch_future_returns_the_slot_and_frees_it() {
        let vm = idle_vm();
        let dispatcher = Arc::clone(&vm.dispatcher);

        let first = dispatcher.launch_future(&vm);
        let second = dispatcher.launch_future(&vm);

        // the slot was released in between, so it is handed out again
        assert_eq!(first, second);
        assert!(dispatcher.lock_pool().iter().all(|slot| !slot.assigned));
    }

    #[test]
    fn terminate_all_raises_every_active_flag() {
        let dispatcher = Dispatcher::new();
        let flag_a = Arc::new(AtomicBool::new(false));
        let flag_b = Arc::new(AtomicBool::new(false));

        let id = thread::current().id();
        dispatcher.set_active(id, Arc::clone(&flag_a));
        dispatcher.set_active(id, Arc::clone(&flag_b));

        dispatcher.terminate_all();

        assert!(flag_a.load(Ordering::SeqCst));
        assert!(flag_b.load(Ordering::SeqCst));
    }
}
