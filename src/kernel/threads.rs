// Guest threads and the scheduler: 32 priority ready queues, six hardware
// thread slots, one host worker per slot. Workers pull ready threads whose
// affinity matches their slot, run them for a time slice through the
// recompiler, and route syscalls to the kernel between slices.

use super::objects::{object_type, DispatcherHeader, SyncObject};
use super::Kernel;
use crate::context::{interrupt, ThreadContext, NUM_HW_THREADS};
use crate::jit::JitCompiler;
use crate::memory::GuestMemory;
use log::{debug, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const NUM_PRIORITIES: usize = 32;
pub const TIME_SLICE_CYCLES: u64 = 10_000;
pub const DEFAULT_STACK_SIZE: u32 = 64 * 1024;
pub const ALL_THREADS_AFFINITY: u32 = 0x3F;

// Magic return addresses recognized by the workers. They sit in a high
// MMIO-only window no real code occupies.
pub const THREAD_EXIT_ADDRESS: u32 = 0xFFFF_0000;
pub const APC_RETURN_ADDRESS: u32 = 0xFFFF_0004;
pub const DPC_RETURN_ADDRESS: u32 = 0xFFFF_0008;

// Guest stacks grow down from here; each allocation leaves a guard page.
const STACK_REGION_TOP: u32 = 0x7F00_0000;
const DPC_STACK_TOP: u32 = 0x7F08_0000;

/// NT status values the guest sees from waits.
pub mod status {
    pub const SUCCESS: u32 = 0;
    pub const WAIT_0: u32 = 0;
    pub const TIMEOUT: u32 = 0x0000_0102;
    pub const UNSUCCESSFUL: u32 = 0xC000_0001;
}

pub const INFINITE_TIMEOUT: u64 = u64::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Waiting,
    Suspended,
    Terminated,
}

bitflags::bitflags! {
    pub struct CreationFlags: u32 {
        const SUSPENDED = 1 << 0;
    }
}

/// Saved caller state while an asynchronous procedure call runs.
#[derive(Debug, Clone)]
pub struct ApcFrame {
    pc: u64,
    lr: u64,
    gpr3: u64,
    gpr4: u64,
    gpr5: u64,
}

#[derive(Debug, Clone)]
pub struct Apc {
    pub routine: u32,
    pub arg1: u32,
    pub arg2: u32,
    pub kernel_mode: bool,
}

#[derive(Debug, Clone)]
pub struct Dpc {
    pub routine: u32,
    pub context: u32,
    pub arg1: u32,
    pub arg2: u32,
}

pub struct GuestThread {
    pub thread_id: u32,
    pub handle: u32,
    pub context: ThreadContext,
    pub state: ThreadState,
    pub priority: i32,
    pub affinity: u32,
    pub stack_base: u32,
    pub stack_size: u32,
    pub tls: [u64; 64],
    pub suspend_count: u32,
    pub wait_object: u32,
    pub wait_deadline_ns: u64,
    pub exit_code: u32,
    pub execution_time: u64,
    // APCs carry their own lock so delivery does not contend with the
    // scheduler's queues lock.
    pub apcs: Mutex<VecDeque<Apc>>,
    apc_frames: Vec<ApcFrame>,
}

impl GuestThread {
    fn new(thread_id: u32, handle: u32) -> Self {
        GuestThread {
            thread_id,
            handle,
            context: ThreadContext::new(thread_id),
            state: ThreadState::Created,
            priority: 0,
            affinity: ALL_THREADS_AFFINITY,
            stack_base: 0,
            stack_size: 0,
            tls: [0; 64],
            suspend_count: 0,
            wait_object: 0,
            wait_deadline_ns: 0,
            exit_code: 0,
            execution_time: 0,
            apcs: Mutex::new(VecDeque::new()),
            apc_frames: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulerStats {
    pub threads_created: u64,
    pub context_switches: u64,
    pub total_cycles_executed: u64,
    pub ready_count: u32,
    pub waiting_count: u32,
}

struct SchedInner {
    threads: HashMap<u32, GuestThread>,
    ready: Vec<VecDeque<u32>>,
    objects: HashMap<u32, SyncObject>,
    dpcs: VecDeque<Dpc>,
    next_thread_id: u32,
    stack_bump: u32,
    stats: SchedulerStats,
}

struct HwSlot {
    cv: Condvar,
    state: Mutex<SlotState>,
}

struct SlotState {
    current: Option<u32>,
}

pub struct Scheduler {
    memory: Arc<GuestMemory>,
    jit: Arc<JitCompiler>,
    kernel: Arc<Kernel>,
    inner: Mutex<SchedInner>,
    slots: Vec<HwSlot>,
    stop: AtomicBool,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
    epoch: Instant,
    trace_threads: bool,
}

fn queue_index(priority: i32) -> usize {
    (priority.clamp(-15, 15) + 16) as usize
}

impl Scheduler {
    pub fn new(
        memory: Arc<GuestMemory>,
        jit: Arc<JitCompiler>,
        kernel: Arc<Kernel>,
        trace_threads: bool,
    ) -> Self {
        let slots = (0..NUM_HW_THREADS)
            .map(|_| HwSlot { cv: Condvar::new(), state: Mutex::new(SlotState { current: None }) })
            .collect();
        Scheduler {
            memory,
            jit,
            kernel,
            inner: Mutex::new(SchedInner {
                threads: HashMap::new(),
                ready: (0..NUM_PRIORITIES).map(|_| VecDeque::new()).collect(),
                objects: HashMap::new(),
                dpcs: VecDeque::new(),
                next_thread_id: 1,
                stack_bump: STACK_REGION_TOP,
                stats: SchedulerStats::default(),
            }),
            slots,
            stop: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            epoch: Instant::now(),
            trace_threads,
        }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock().unwrap();
        let mut stats = inner.stats;
        stats.ready_count = inner.ready.iter().map(|q| q.len() as u32).sum();
        stats.waiting_count = inner
            .threads
            .values()
            .filter(|t| t.state == ThreadState::Waiting)
            .count() as u32;
        stats
    }

    // ----- thread lifecycle -----

    /// Create a guest thread ready to run at `entry`. Returns its id.
    pub fn create_thread(
        &self,
        entry: u32,
        param: u64,
        stack_size: u32,
        flags: CreationFlags,
        handle: u32,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let tid = inner.next_thread_id;
        inner.next_thread_id += 1;

        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        // Guard page sits above the stack top.
        inner.stack_bump -= stack_size + crate::memory::PAGE_SIZE;
        let stack_base = inner.stack_bump;
        let stack_top = stack_base + stack_size;

        let mut thread = GuestThread::new(tid, handle);
        thread.stack_base = stack_base;
        thread.stack_size = stack_size;
        thread.context.pc = entry as u64;
        thread.context.gpr[1] = (stack_top - 0x80) as u64;
        thread.context.gpr[3] = param;
        thread.context.lr = THREAD_EXIT_ADDRESS as u64;
        thread.context.running = true;
        if flags.contains(CreationFlags::SUSPENDED) {
            thread.state = ThreadState::Suspended;
            thread.suspend_count = 1;
        } else {
            thread.state = ThreadState::Ready;
        }
        let state = thread.state;
        let affinity = thread.affinity;
        let priority = thread.priority;
        inner.threads.insert(tid, thread);
        inner.stats.threads_created += 1;
        if state == ThreadState::Ready {
            inner.ready[queue_index(priority)].push_back(tid);
        }
        drop(inner);
        if state == ThreadState::Ready {
            self.notify_slots(affinity);
        }
        if self.trace_threads {
            debug!("thread {} created at {:#010x}", tid, entry);
        }
        tid
    }

    /// Loader entry point: a thread pinned to one hardware thread with a
    /// caller-provided stack.
    pub fn start_thread(&self, hw_thread: u32, entry: u32, stack_top: u32) -> u32 {
        let tid = self.create_thread(entry, 0, DEFAULT_STACK_SIZE, CreationFlags::empty(), 0);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(thread) = inner.threads.get_mut(&tid) {
                thread.affinity = 1 << (hw_thread % NUM_HW_THREADS);
                if stack_top != 0 {
                    thread.context.gpr[1] = (stack_top - 0x80) as u64;
                    thread.stack_base = stack_top.saturating_sub(DEFAULT_STACK_SIZE);
                }
            }
        }
        self.notify_slots(1 << (hw_thread % NUM_HW_THREADS));
        tid
    }

    pub fn terminate_thread(&self, tid: u32, exit_code: u32) {
        let mut inner = self.inner.lock().unwrap();
        self.remove_from_queues(&mut inner, tid);
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.state = ThreadState::Terminated;
            thread.exit_code = exit_code;
            thread.context.running = false;
            if self.trace_threads {
                debug!("thread {} terminated with {:#x}", tid, exit_code);
            }
        }
        for obj in inner.objects.values_mut() {
            obj.waiters.retain(|&w| w != tid);
        }
    }

    pub fn suspend_thread(&self, tid: u32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        self.remove_from_queues(&mut inner, tid);
        match inner.threads.get_mut(&tid) {
            Some(thread) => {
                let old = thread.suspend_count;
                thread.suspend_count += 1;
                if thread.state == ThreadState::Ready || thread.state == ThreadState::Created {
                    thread.state = ThreadState::Suspended;
                }
                old
            }
            None => 0,
        }
    }

    pub fn resume_thread(&self, tid: u32) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let (old, runnable, affinity, priority) = match inner.threads.get_mut(&tid) {
            Some(thread) => {
                let old = thread.suspend_count;
                if thread.suspend_count > 0 {
                    thread.suspend_count -= 1;
                }
                let runnable = thread.suspend_count == 0
                    && thread.state == ThreadState::Suspended;
                if runnable {
                    thread.state = ThreadState::Ready;
                }
                (old, runnable, thread.affinity, thread.priority)
            }
            None => return 0,
        };
        if runnable {
            inner.ready[queue_index(priority)].push_back(tid);
            drop(inner);
            self.notify_slots(affinity);
        }
        old
    }

    pub fn set_priority(&self, tid: u32, priority: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.priority = priority.clamp(-15, 15);
        }
    }

    pub fn set_affinity(&self, tid: u32, affinity: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.affinity = affinity & ALL_THREADS_AFFINITY;
        }
    }

    pub fn thread_state(&self, tid: u32) -> Option<ThreadState> {
        self.inner.lock().unwrap().threads.get(&tid).map(|t| t.state)
    }

    /// Guest thread currently held by a hardware-thread slot.
    pub fn current_thread(&self, slot: usize) -> Option<u32> {
        self.slots.get(slot).and_then(|s| s.state.lock().unwrap().current)
    }

    pub fn thread_exit_code(&self, tid: u32) -> Option<u32> {
        self.inner.lock().unwrap().threads.get(&tid).map(|t| t.exit_code)
    }

    pub fn tls_get(&self, tid: u32, slot: usize) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.threads.get(&tid).map(|t| t.tls[slot & 63]).unwrap_or(0)
    }

    pub fn tls_set(&self, tid: u32, slot: usize, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.tls[slot & 63] = value;
        }
    }

    /// Put a thread back at the end of its priority queue.
    pub fn yield_thread(&self, tid: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&tid) {
            if thread.state == ThreadState::Running {
                // The owning worker will observe Ready and re-enqueue.
                thread.state = ThreadState::Ready;
            }
        }
    }

    pub fn sleep_thread(&self, tid: u32, nanoseconds: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.state = ThreadState::Waiting;
            thread.wait_object = 0;
            thread.wait_deadline_ns = self.now_ns().saturating_add(nanoseconds);
        }
    }

    // ----- APCs and DPCs -----

    pub fn queue_apc(&self, tid: u32, apc: Apc) {
        let inner = self.inner.lock().unwrap();
        if let Some(thread) = inner.threads.get(&tid) {
            thread.apcs.lock().unwrap().push_back(apc);
        }
    }

    pub fn queue_dpc(&self, dpc: Dpc) {
        self.inner.lock().unwrap().dpcs.push_back(dpc);
    }

    // ----- synchronization -----

    fn object_entry<'a>(
        inner: &'a mut SchedInner,
        mem: &GuestMemory,
        addr: u32,
    ) -> &'a mut SyncObject {
        inner.objects.entry(addr).or_insert_with(|| {
            let header = DispatcherHeader::read(mem, addr);
            SyncObject::new(addr, header.obj_type)
        })
    }

    /// Register host-side state for an object the guest just initialized.
    pub fn register_object(&self, addr: u32, obj_type: u8, maximum: i32) {
        let mut inner = self.inner.lock().unwrap();
        let obj = inner.objects.entry(addr).or_insert_with(|| SyncObject::new(addr, obj_type));
        obj.obj_type = obj_type;
        obj.maximum = maximum;
    }

    pub fn set_timer(&self, addr: u32, due_ns: u64, period_ms: u32) {
        let mut inner = self.inner.lock().unwrap();
        let now = self.now_ns();
        let obj = Self::object_entry(&mut inner, &self.memory, addr);
        obj.due_time_ns = now.saturating_add(due_ns);
        obj.period_ms = period_ms;
        obj.timer_armed = true;
        DispatcherHeader::set_signal_state(&self.memory, addr, 0);
    }

    pub fn cancel_timer(&self, addr: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(obj) = inner.objects.get_mut(&addr) {
            obj.timer_armed = false;
        }
    }

    // Try to satisfy a wait against the current signal state, consuming it
    // per object type. Caller holds the inner lock.
    fn try_satisfy(&self, inner: &mut SchedInner, tid: u32, addr: u32) -> bool {
        let state = DispatcherHeader::signal_state(&self.memory, addr);
        let obj = Self::object_entry(inner, &self.memory, addr);
        match obj.obj_type {
            object_type::MUTANT => {
                if obj.owner == Some(tid) {
                    if obj.pending_transfer {
                        obj.pending_transfer = false;
                    } else {
                        obj.recursion += 1;
                    }
                    return true;
                }
                if obj.owner.is_none() && state > 0 {
                    obj.owner = Some(tid);
                    DispatcherHeader::set_signal_state(&self.memory, addr, 0);
                    return true;
                }
                false
            }
            object_type::SEMAPHORE => {
                if state > 0 {
                    DispatcherHeader::set_signal_state(&self.memory, addr, state - 1);
                    return true;
                }
                false
            }
            _ => {
                if state > 0 {
                    if obj.auto_resets() {
                        DispatcherHeader::set_signal_state(&self.memory, addr, 0);
                    }
                    return true;
                }
                false
            }
        }
    }

    /// Wait on one dispatcher object. Polling model: a wait that cannot be
    /// satisfied records the waiter and reports timeout; the caller retries
    /// after the object signals it back to Ready.
    pub fn wait_for_object(&self, tid: u32, addr: u32, timeout_ns: u64) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if self.try_satisfy(&mut inner, tid, addr) {
            return status::SUCCESS;
        }
        if timeout_ns == 0 {
            return status::TIMEOUT;
        }
        let deadline = if timeout_ns == INFINITE_TIMEOUT {
            INFINITE_TIMEOUT
        } else {
            self.now_ns().saturating_add(timeout_ns)
        };
        {
            let obj = Self::object_entry(&mut inner, &self.memory, addr);
            if !obj.waiters.contains(&tid) {
                obj.waiters.push_back(tid);
            }
        }
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.state = ThreadState::Waiting;
            thread.wait_object = addr;
            thread.wait_deadline_ns = deadline;
        }
        status::TIMEOUT
    }

    /// Wait on several objects; returns the index of the satisfying object,
    /// SUCCESS when `wait_all` and everything is signaled, TIMEOUT otherwise.
    pub fn wait_for_multiple(
        &self,
        tid: u32,
        addrs: &[u32],
        wait_all: bool,
        timeout_ns: u64,
    ) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if wait_all {
            let all = addrs
                .iter()
                .all(|&a| DispatcherHeader::signal_state(&self.memory, a) > 0);
            if all {
                for &a in addrs {
                    self.try_satisfy(&mut inner, tid, a);
                }
                return status::SUCCESS;
            }
        } else {
            for (i, &a) in addrs.iter().enumerate() {
                if self.try_satisfy(&mut inner, tid, a) {
                    return status::WAIT_0 + i as u32;
                }
            }
        }
        if timeout_ns == 0 {
            return status::TIMEOUT;
        }
        let deadline = if timeout_ns == INFINITE_TIMEOUT {
            INFINITE_TIMEOUT
        } else {
            self.now_ns().saturating_add(timeout_ns)
        };
        for &a in addrs {
            let obj = Self::object_entry(&mut inner, &self.memory, a);
            if !obj.waiters.contains(&tid) {
                obj.waiters.push_back(tid);
            }
        }
        if let Some(thread) = inner.threads.get_mut(&tid) {
            thread.state = ThreadState::Waiting;
            thread.wait_object = addrs.first().copied().unwrap_or(0);
            thread.wait_deadline_ns = deadline;
        }
        status::TIMEOUT
    }

    /// Signal a dispatcher object, waking waiters per its type.
    pub fn signal_object(&self, addr: u32) {
        let mut inner = self.inner.lock().unwrap();
        let obj_type = Self::object_entry(&mut inner, &self.memory, addr).obj_type;
        let mut woken = Vec::new();
        match obj_type {
            object_type::NOTIFICATION_EVENT | object_type::TIMER_NOTIFICATION => {
                DispatcherHeader::set_signal_state(&self.memory, addr, 1);
                let obj = Self::object_entry(&mut inner, &self.memory, addr);
                woken.extend(obj.waiters.drain(..));
            }
            object_type::SYNCHRONIZATION_EVENT | object_type::TIMER_SYNCHRONIZATION => {
                let obj = Self::object_entry(&mut inner, &self.memory, addr);
                match obj.waiters.pop_front() {
                    Some(w) => {
                        woken.push(w);
                        DispatcherHeader::set_signal_state(&self.memory, addr, 0);
                    }
                    None => DispatcherHeader::set_signal_state(&self.memory, addr, 1),
                }
            }
            object_type::SEMAPHORE => {
                let maximum = {
                    let obj = Self::object_entry(&mut inner, &self.memory, addr);
                    obj.maximum
                };
                let state = DispatcherHeader::signal_state(&self.memory, addr);
                let mut state = if maximum > 0 { (state + 1).min(maximum) } else { state + 1 };
                let obj = Self::object_entry(&mut inner, &self.memory, addr);
                while state > 0 {
                    match obj.waiters.pop_front() {
                        Some(w) => {
                            woken.push(w);
                            state -= 1;
                        }
                        None => break,
                    }
                }
                DispatcherHeader::set_signal_state(&self.memory, addr, state);
            }
            object_type::MUTANT => {
                let obj = Self::object_entry(&mut inner, &self.memory, addr);
                if obj.recursion > 0 {
                    obj.recursion -= 1;
                } else {
                    match obj.waiters.pop_front() {
                        Some(next) => {
                            obj.owner = Some(next);
                            obj.pending_transfer = true;
                            woken.push(next);
                            DispatcherHeader::set_signal_state(&self.memory, addr, 0);
                        }
                        None => {
                            obj.owner = None;
                            DispatcherHeader::set_signal_state(&self.memory, addr, 1);
                        }
                    }
                }
            }
            other => {
                DispatcherHeader::set_signal_state(&self.memory, addr, 1);
                let obj = Self::object_entry(&mut inner, &self.memory, addr);
                woken.extend(obj.waiters.drain(..));
                trace!("signal of unclassified object type {} at {:#010x}", other, addr);
            }
        }
        let mut affinity = 0;
        for tid in woken {
            affinity |= self.make_ready(&mut inner, tid);
        }
        drop(inner);
        if affinity != 0 {
            self.notify_slots(affinity);
        }
    }

    // Transition a waiter to Ready and enqueue; returns its affinity mask.
    fn make_ready(&self, inner: &mut SchedInner, tid: u32) -> u32 {
        match inner.threads.get_mut(&tid) {
            Some(thread) if thread.state == ThreadState::Waiting => {
                thread.state = ThreadState::Ready;
                thread.wait_object = 0;
                let priority = thread.priority;
                let affinity = thread.affinity;
                inner.ready[queue_index(priority)].push_back(tid);
                affinity
            }
            _ => 0,
        }
    }

    fn remove_from_queues(&self, inner: &mut SchedInner, tid: u32) {
        for queue in inner.ready.iter_mut() {
            queue.retain(|&t| t != tid);
        }
    }

    fn notify_slots(&self, affinity: u32) {
        for (i, slot) in self.slots.iter().enumerate() {
            if affinity & (1 << i) != 0 {
                slot.cv.notify_one();
            }
        }
    }

    // ----- the worker side -----

    /// Spawn one host worker per hardware-thread slot.
    pub fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return;
        }
        for slot in 0..NUM_HW_THREADS as usize {
            let sched = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("hwthread-{}", slot))
                .spawn(move || sched.worker_main(slot))
                .expect("spawn hardware-thread worker");
            workers.push(handle);
        }
        info!("{} hardware-thread workers started", NUM_HW_THREADS);
    }

    /// Stop the workers and join them.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        for slot in self.slots.iter() {
            slot.cv.notify_all();
        }
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
        info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// True while any thread can still make progress.
    pub fn has_live_threads(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .threads
            .values()
            .any(|t| t.state != ThreadState::Terminated)
    }

    fn acquire_thread(&self, slot: usize) -> Option<u32> {
        let mask = 1u32 << slot;
        let mut inner = self.inner.lock().unwrap();
        for priority in (0..NUM_PRIORITIES).rev() {
            let queue = &inner.ready[priority];
            let pos = queue.iter().position(|&tid| {
                inner
                    .threads
                    .get(&tid)
                    .map(|t| t.affinity & mask != 0)
                    .unwrap_or(false)
            });
            if let Some(pos) = pos {
                let tid = inner.ready[priority].remove(pos).unwrap();
                let thread = inner.threads.get_mut(&tid).unwrap();
                thread.state = ThreadState::Running;
                inner.stats.context_switches += 1;
                return Some(tid);
            }
        }
        None
    }

    // Deliver one pending APC by synthesizing a call frame in the context.
    fn deliver_apc(&self, inner: &mut SchedInner, tid: u32) {
        let thread = match inner.threads.get_mut(&tid) {
            Some(t) => t,
            None => return,
        };
        let apc = match thread.apcs.lock().unwrap().pop_front() {
            Some(a) => a,
            None => return,
        };
        let ctx = &mut thread.context;
        thread.apc_frames.push(ApcFrame {
            pc: ctx.pc,
            lr: ctx.lr,
            gpr3: ctx.gpr[3],
            gpr4: ctx.gpr[4],
            gpr5: ctx.gpr[5],
        });
        ctx.gpr[3] = apc.arg1 as u64;
        ctx.gpr[4] = apc.arg2 as u64;
        ctx.lr = APC_RETURN_ADDRESS as u64;
        ctx.pc = apc.routine as u64;
        if self.trace_threads {
            trace!("APC delivered to thread {} at {:#010x}", tid, apc.routine);
        }
    }

    fn finish_apc(&self, tid: u32, ctx: &mut ThreadContext) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let thread = match inner.threads.get_mut(&tid) {
            Some(t) => t,
            None => return false,
        };
        match thread.apc_frames.pop() {
            Some(frame) => {
                ctx.pc = frame.pc;
                ctx.lr = frame.lr;
                ctx.gpr[3] = frame.gpr3;
                ctx.gpr[4] = frame.gpr4;
                ctx.gpr[5] = frame.gpr5;
                true
            }
            None => false,
        }
    }

    fn worker_main(self: Arc<Self>, slot: usize) {
        while !self.stop.load(Ordering::SeqCst) {
            let tid = match self.acquire_thread(slot) {
                Some(tid) => tid,
                None => {
                    let guard = self.slots[slot].state.lock().unwrap();
                    let _ = self
                        .slots[slot]
                        .cv
                        .wait_timeout(guard, Duration::from_millis(2))
                        .unwrap();
                    self.tick(slot);
                    continue;
                }
            };

            // Context switch in: copy into this slot's buffer.
            let mut ctx = {
                let mut inner = self.inner.lock().unwrap();
                self.deliver_apc(&mut inner, tid);
                let thread = inner.threads.get_mut(&tid).unwrap();
                let mut ctx = thread.context.clone();
                ctx.hw_thread = slot as u32;
                ctx
            };
            {
                self.slots[slot].state.lock().unwrap().current = Some(tid);
            }

            let mut executed = 0u64;
            loop {
                executed += self.jit.execute(&mut ctx, TIME_SLICE_CYCLES.saturating_sub(executed));
                if ctx.interrupted {
                    ctx.interrupted = false;
                    let reason = ctx.interrupt_reason;
                    ctx.interrupt_reason = interrupt::NONE;
                    match reason {
                        interrupt::SYSCALL => {
                            self.kernel.dispatch_syscall(&mut ctx, &self);
                        }
                        interrupt::TRAP => {
                            warn!(
                                "thread {} trapped at {:#010x}",
                                tid, ctx.fault_pc
                            );
                            self.kernel.dispatch_syscall(&mut ctx, &self);
                        }
                        _ => {}
                    }
                    break;
                }
                let pc = ctx.pc as u32;
                if pc == THREAD_EXIT_ADDRESS {
                    let code = ctx.gpr[3] as u32;
                    ctx.running = false;
                    self.terminate_thread(tid, code);
                    break;
                }
                if pc == APC_RETURN_ADDRESS {
                    if self.finish_apc(tid, &mut ctx) {
                        continue;
                    }
                    break;
                }
                break;
            }

            {
                self.slots[slot].state.lock().unwrap().current = None;
            }

            // Context switch out.
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            inner.stats.total_cycles_executed += executed;
            if let Some(thread) = inner.threads.get_mut(&tid) {
                thread.execution_time += executed;
                if thread.state != ThreadState::Terminated {
                    ctx.hw_thread = 0;
                    thread.context = ctx;
                    if !thread.context.running {
                        thread.state = ThreadState::Terminated;
                    } else {
                        match thread.state {
                            ThreadState::Waiting | ThreadState::Suspended => {}
                            _ => {
                                thread.state = ThreadState::Ready;
                                let priority = thread.priority;
                                inner.ready[queue_index(priority)].push_back(tid);
                            }
                        }
                    }
                }
            }
            drop(guard);
            self.tick(slot);
        }
    }

    /// Scheduler housekeeping: expire waits, fire timers, drain DPCs.
    pub fn tick(&self, slot: usize) {
        let now = self.now_ns();
        let mut wake_affinity = 0u32;
        {
            let mut guard = self.inner.lock().unwrap();
            // Expired waits go back to Ready; the waiter re-polls its object.
            let expired: Vec<u32> = guard
                .threads
                .values()
                .filter(|t| t.state == ThreadState::Waiting && t.wait_deadline_ns <= now)
                .map(|t| t.thread_id)
                .collect();
            {
                let inner = &mut *guard;
                for tid in expired {
                    if let Some(thread) = inner.threads.get_mut(&tid) {
                        thread.state = ThreadState::Ready;
                        let addr = std::mem::take(&mut thread.wait_object);
                        let priority = thread.priority;
                        wake_affinity |= thread.affinity;
                        inner.ready[queue_index(priority)].push_back(tid);
                        if let Some(obj) = inner.objects.get_mut(&addr) {
                            obj.waiters.retain(|&w| w != tid);
                        }
                    }
                }
            }
            // Timers
            let due: Vec<(u32, u32)> = guard
                .objects
                .values()
                .filter(|o| o.timer_armed && o.due_time_ns <= now)
                .map(|o| (o.guest_addr, o.period_ms))
                .collect();
            for (addr, period_ms) in due {
                if let Some(obj) = guard.objects.get_mut(&addr) {
                    if period_ms != 0 {
                        obj.due_time_ns = now + period_ms as u64 * 1_000_000;
                    } else {
                        obj.timer_armed = false;
                    }
                }
                drop(guard);
                self.signal_object(addr);
                guard = self.inner.lock().unwrap();
            }
        }
        if wake_affinity != 0 {
            self.notify_slots(wake_affinity);
        }
        // DPCs drain at tick boundaries, on whichever worker got here first.
        self.run_dpcs(slot);
    }

    fn run_dpcs(&self, slot: usize) {
        loop {
            let dpc = {
                let mut inner = self.inner.lock().unwrap();
                inner.dpcs.pop_front()
            };
            let dpc = match dpc {
                Some(d) => d,
                None => return,
            };
            let mut ctx = ThreadContext::new(u32::MAX);
            ctx.hw_thread = slot as u32;
            ctx.running = true;
            ctx.pc = dpc.routine as u64;
            ctx.lr = DPC_RETURN_ADDRESS as u64;
            ctx.gpr[1] = (DPC_STACK_TOP - 0x80) as u64;
            ctx.gpr[3] = dpc.context as u64;
            ctx.gpr[4] = dpc.arg1 as u64;
            ctx.gpr[5] = dpc.arg2 as u64;
            let mut budget = 100_000u64;
            while budget > 0 && ctx.running && ctx.pc as u32 != DPC_RETURN_ADDRESS {
                let ran = self.jit.execute(&mut ctx, budget.min(1024));
                budget = budget.saturating_sub(ran.max(1));
                if ctx.interrupted {
                    ctx.interrupted = false;
                    self.kernel.dispatch_syscall(&mut ctx, self);
                }
            }
        }
    }
}
