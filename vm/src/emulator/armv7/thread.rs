use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::emulator::{error::EmulationError, memory::GuestMemory};

use super::{
    active,
    context::{Armv7Context, InstructionSet, NUM_GPRS},
    process::ProcessImage,
    tls::TlsAllocator,
};

/// Run state of a guest thread, observed by the execution loop between
/// instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Spawn-time parameters for a guest thread. A zero stack size or priority
/// selects the process default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadParams {
    pub entry: u32,
    pub name: String,
    pub stack_size: u32,
    pub priority: u32,
}

/// The external fetch-decode-execute loop.
///
/// `run` dispatches guest instructions for `thread` until the thread leaves
/// the [`RunStatus::Running`] state or the committed program counter reaches
/// the process stop sentinel, then returns. The loop picks up branch
/// requests through [`Armv7Context::commit_branch`].
pub trait ExecutionLoop {
    fn run(
        &mut self,
        thread: &mut ArmThread,
        mem: &dyn GuestMemory,
    ) -> Result<(), EmulationError>;
}

impl<F> ExecutionLoop for F
where
    F: FnMut(&mut ArmThread, &dyn GuestMemory) -> Result<(), EmulationError>,
{
    fn run(
        &mut self,
        thread: &mut ArmThread,
        mem: &dyn GuestMemory,
    ) -> Result<(), EmulationError> {
        self(thread, mem)
    }
}

/// Snapshot of the state a fast call clobbers, restored when the nested run
/// unwinds.
struct SavedFrame {
    status: RunStatus,
    pc: u32,
    branch: Option<u32>,
    sp: u32,
    lr: u32,
    active: u32,
}

/// One guest ARMv7 thread: its execution context plus the lifecycle glue
/// driven by the thread manager.
pub struct ArmThread {
    pub id: u32,
    pub name: String,
    pub status: RunStatus,
    pub context: Armv7Context,
    entry: u32,
    priority: u32,
    stack_addr: u32,
    stack_size: u32,
    process: Arc<ProcessImage>,
    tls: Arc<TlsAllocator>,
}

impl ArmThread {
    pub fn new(
        id: u32,
        params: ThreadParams,
        process: Arc<ProcessImage>,
        tls: Arc<TlsAllocator>,
    ) -> Self {
        debug_assert_ne!(id, 0);
        let stack_size = if params.stack_size != 0 {
            params.stack_size
        } else {
            process.primary_stack_size
        };
        let priority = if params.priority != 0 {
            params.priority
        } else {
            process.primary_priority
        };
        debug!(
            thread = id,
            name = %params.name,
            entry = params.entry,
            stack_size,
            priority,
            "spawning guest thread"
        );
        Self {
            id,
            name: params.name,
            status: RunStatus::Stopped,
            context: Armv7Context::default(),
            entry: params.entry,
            priority,
            stack_addr: 0,
            stack_size,
            process,
            tls,
        }
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn stack_addr(&self) -> u32 {
        self.stack_addr
    }

    pub fn stack_size(&self) -> u32 {
        self.stack_size
    }

    /// The process stop sentinel this thread's fast calls return through.
    pub fn stop_addr(&self) -> u32 {
        self.process.stop_addr
    }

    /// Allocates the stack region if none is assigned yet; keeps an
    /// existing allocation otherwise.
    pub fn init_stack(&mut self, mem: &dyn GuestMemory) -> Result<(), EmulationError> {
        if self.stack_addr == 0 {
            self.stack_addr = mem.alloc_aligned(self.stack_size, 4096)?;
            trace!(
                thread = self.id,
                addr = self.stack_addr,
                size = self.stack_size,
                "allocated stack"
            );
        }
        Ok(())
    }

    /// Resets the register file for a fresh run: zeroed general-purpose
    /// registers and flags, default encoding mode, no pending conditional
    /// group, SP at the stack top (full-descending), and the TLS base
    /// acquired for this thread's identity.
    pub fn init_regs(&mut self, mem: &dyn GuestMemory) -> Result<(), EmulationError> {
        self.context.gpr = [0; NUM_GPRS];
        self.context.apsr.clear();
        self.context.ipsr = 0;
        self.context.iset = InstructionSet::default();
        self.context.itstate.clear();
        self.context.sp = self.stack_addr + self.stack_size;
        self.context.tls = self.tls.acquire(self.id, mem)?;
        Ok(())
    }

    // Lifecycle boundaries for the thread manager. No decode or dispatch
    // happens here; the execution loop observes `status` between
    // instructions.

    pub fn reset(&mut self) {
        debug!(thread = self.id, "reset");
        self.status = RunStatus::Stopped;
        self.context.pc = self.entry;
        self.context.branch_target = None;
    }

    pub fn run(&mut self) {
        debug!(thread = self.id, "run");
        self.status = RunStatus::Running;
    }

    pub fn pause(&mut self) {
        debug!(thread = self.id, "pause");
        if self.status == RunStatus::Running {
            self.status = RunStatus::Paused;
        }
    }

    pub fn resume(&mut self) {
        debug!(thread = self.id, "resume");
        if self.status == RunStatus::Paused {
            self.status = RunStatus::Running;
        }
    }

    pub fn stop(&mut self) {
        debug!(thread = self.id, "stop");
        self.status = RunStatus::Stopped;
    }

    pub fn step(&mut self) {
        trace!(thread = self.id, pc = self.context.read_pc(), "step");
    }

    /// Invokes the guest function at `addr` as if synchronously called from
    /// host code: the link register is pointed at the process stop sentinel
    /// and `exec` is driven until it returns, either by reaching the
    /// sentinel or through [`fast_stop`]. The interrupted {status, pc,
    /// pending branch, sp, lr, active-binding} state is restored on every
    /// exit path, so fast calls nest to arbitrary depth.
    ///
    /// A nested run that never reaches the sentinel and is never stopped
    /// blocks indefinitely; guaranteeing guest termination is the caller's
    /// contract.
    ///
    /// [`fast_stop`]: ArmThread::fast_stop
    #[instrument(level = "debug", skip_all, fields(thread = self.id, addr = addr))]
    pub fn fast_call(
        &mut self,
        addr: u32,
        exec: &mut dyn ExecutionLoop,
        mem: &dyn GuestMemory,
    ) -> Result<(), EmulationError> {
        let saved = SavedFrame {
            status: self.status,
            pc: self.context.pc,
            branch: self.context.branch_target,
            sp: self.context.sp,
            lr: self.context.lr,
            active: active::bind_active(self.id),
        };

        self.status = RunStatus::Running;
        self.context.pc = addr;
        self.context.branch_target = None;
        self.context.lr = self.process.stop_addr;

        let result = exec.run(self, mem);

        self.status = saved.status;
        self.context.pc = saved.pc;
        self.context.branch_target = saved.branch;
        self.context.sp = saved.sp;
        self.context.lr = saved.lr;
        active::bind_active(saved.active);

        result
    }

    /// Unwinds the innermost nested call without reaching the stop
    /// sentinel, e.g. from a trap handler.
    pub fn fast_stop(&mut self) {
        trace!(thread = self.id, "fast stop");
        self.status = RunStatus::Stopped;
    }

    /// Diagnostic register dump; see [`Armv7Context::dump`] for the format.
    pub fn dump_regs(&self) -> String {
        self.context.dump()
    }
}

impl Drop for ArmThread {
    fn drop(&mut self) {
        self.tls.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{
        armv7::{active::active_thread_id, process::ProcessImage, tls::TlsAllocator},
        memory::LinearMemory,
    };

    const TLS_REGION: u32 = 0x20;

    /// Pins a closure's signature to the [`ExecutionLoop`] blanket impl.
    fn as_loop<F>(f: F) -> F
    where
        F: FnMut(&mut ArmThread, &dyn GuestMemory) -> Result<(), EmulationError>,
    {
        f
    }

    fn fixture() -> (Arc<ProcessImage>, Arc<TlsAllocator>, LinearMemory) {
        let mem = LinearMemory::new(0x200000);
        let image_addr = mem.alloc_aligned(4, 4).unwrap();
        mem.write_bytes(image_addr, &[1, 2, 3, 4]).unwrap();

        let process = Arc::new(ProcessImage {
            tls_image_addr: image_addr,
            tls_file_size: 4,
            tls_region_size: TLS_REGION,
            ..Default::default()
        });
        let tls = Arc::new(TlsAllocator::new(&process, &mem).unwrap());
        (process, tls, mem)
    }

    fn spawn(id: u32, process: &Arc<ProcessImage>, tls: &Arc<TlsAllocator>) -> ArmThread {
        ArmThread::new(
            id,
            ThreadParams {
                entry: 0x8100,
                name: format!("worker-{id}"),
                stack_size: 0,
                priority: 0,
            },
            Arc::clone(process),
            Arc::clone(tls),
        )
    }

    #[test]
    fn params_fall_back_to_process_defaults() {
        let (process, tls, _mem) = fixture();
        let thread = spawn(7, &process, &tls);
        assert_eq!(thread.stack_size(), process.primary_stack_size);
        assert_eq!(thread.priority(), process.primary_priority);

        let explicit = ArmThread::new(
            8,
            ThreadParams {
                entry: 0x8100,
                name: "io".into(),
                stack_size: 0x4000,
                priority: 64,
            },
            Arc::clone(&process),
            Arc::clone(&tls),
        );
        assert_eq!(explicit.stack_size(), 0x4000);
        assert_eq!(explicit.priority(), 64);
    }

    #[test]
    fn init_stack_allocates_exactly_once() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);

        thread.init_stack(&mem).unwrap();
        let first = thread.stack_addr();
        assert_ne!(first, 0);

        thread.init_stack(&mem).unwrap();
        assert_eq!(thread.stack_addr(), first);
    }

    #[test]
    fn init_regs_resets_the_context_and_acquires_tls() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        thread.init_stack(&mem).unwrap();

        thread.context.gpr[4] = 0xffff_ffff;
        thread.context.apsr.n = true;
        thread.init_regs(&mem).unwrap();

        assert_eq!(thread.context.gpr, [0; NUM_GPRS]);
        assert_eq!(thread.context.apsr.bits(), 0);
        assert_eq!(thread.context.iset, InstructionSet::Thumb);
        assert!(!thread.context.itstate.is_active());
        assert_eq!(
            thread.context.sp,
            thread.stack_addr() + thread.stack_size()
        );
        assert_ne!(thread.context.tls, 0);

        // Repeated initialization re-acquires the same region.
        let tls_base = thread.context.tls;
        thread.init_regs(&mem).unwrap();
        assert_eq!(thread.context.tls, tls_base);
    }

    #[test]
    fn lifecycle_transitions() {
        let (process, tls, _mem) = fixture();
        let mut thread = spawn(7, &process, &tls);

        thread.reset();
        assert_eq!(thread.status, RunStatus::Stopped);
        assert_eq!(thread.context.read_pc(), thread.entry());

        thread.run();
        assert_eq!(thread.status, RunStatus::Running);
        thread.pause();
        assert_eq!(thread.status, RunStatus::Paused);
        thread.resume();
        assert_eq!(thread.status, RunStatus::Running);
        thread.stop();
        assert_eq!(thread.status, RunStatus::Stopped);

        // Pausing a stopped thread is a no-op.
        thread.pause();
        assert_eq!(thread.status, RunStatus::Stopped);
    }

    #[test]
    fn dropping_the_thread_releases_its_tls_slot() {
        let (process, tls, mem) = fixture();
        let first = {
            let mut thread = spawn(7, &process, &tls);
            thread.init_stack(&mem).unwrap();
            thread.init_regs(&mem).unwrap();
            thread.context.tls
        };
        // The slot is free again, so the next identity claims the same one.
        assert_eq!(tls.acquire(99, &mem).unwrap(), first);
    }

    #[test]
    fn fast_call_runs_the_loop_on_the_target_and_restores_the_frame() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        let stop_addr = thread.stop_addr();

        thread.status = RunStatus::Paused;
        thread.context.pc = 0x1000;
        thread.context.sp = 0x2000;
        thread.context.lr = 0x3000;
        thread.context.write_pc(0x1234);

        let mut observed = None;
        let mut exec = as_loop(|t, _m| {
            observed = Some((
                t.status,
                t.context.read_pc(),
                t.context.pending_branch(),
                t.context.sp,
                t.context.lr,
                active_thread_id(),
            ));
            // The nested call clobbers everything it is allowed to touch.
            t.context.sp -= 0x40;
            t.context.lr = 0xdead_0000;
            t.context.write_pc(0xdead_0004);
            Ok(())
        });
        thread.fast_call(0x5000, &mut exec, &mem).unwrap();

        assert_eq!(
            observed,
            Some((RunStatus::Running, 0x5000, None, 0x2000, stop_addr, 7))
        );
        assert_eq!(thread.status, RunStatus::Paused);
        assert_eq!(thread.context.read_pc(), 0x1000);
        assert_eq!(thread.context.pending_branch(), Some(0x1234));
        assert_eq!(thread.context.sp, 0x2000);
        assert_eq!(thread.context.lr, 0x3000);
        assert_eq!(active_thread_id(), 0);
    }

    struct NestedCalls {
        depth: u32,
    }

    impl ExecutionLoop for NestedCalls {
        fn run(
            &mut self,
            thread: &mut ArmThread,
            mem: &dyn GuestMemory,
        ) -> Result<(), EmulationError> {
            // Each nesting level leaves its own fingerprint...
            thread.context.sp = 0x9000 + self.depth;
            thread.context.lr = 0xa000 + self.depth;
            if self.depth < 3 {
                let before = (
                    thread.context.read_pc(),
                    thread.context.sp,
                    thread.context.lr,
                    thread.status,
                );
                let target = 0x6000 + self.depth * 0x100;
                thread.fast_call(target, &mut NestedCalls { depth: self.depth + 1 }, mem)?;
                // ...and finds it intact when the inner call unwinds.
                assert_eq!(
                    (
                        thread.context.read_pc(),
                        thread.context.sp,
                        thread.context.lr,
                        thread.status,
                    ),
                    before
                );
            }
            Ok(())
        }
    }

    #[test]
    fn nested_fast_calls_restore_each_enclosing_frame() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        thread.context.pc = 0x1000;
        thread.context.sp = 0x2000;
        thread.context.lr = 0x3000;

        thread
            .fast_call(0x5000, &mut NestedCalls { depth: 1 }, &mem)
            .unwrap();

        assert_eq!(thread.context.read_pc(), 0x1000);
        assert_eq!(thread.context.sp, 0x2000);
        assert_eq!(thread.context.lr, 0x3000);
        assert_eq!(thread.status, RunStatus::Stopped);
        assert_eq!(active_thread_id(), 0);
    }

    #[test]
    fn fast_stop_unwinds_early_and_still_restores() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        thread.status = RunStatus::Paused;
        thread.context.pc = 0x1000;

        let mut exec = as_loop(|t, _m| {
            t.fast_stop();
            assert_eq!(t.status, RunStatus::Stopped);
            Ok(())
        });
        thread.fast_call(0x5000, &mut exec, &mem).unwrap();

        assert_eq!(thread.status, RunStatus::Paused);
        assert_eq!(thread.context.read_pc(), 0x1000);
    }

    #[test]
    fn loop_errors_propagate_after_restoration() {
        let (process, tls, mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        thread.context.sp = 0x2000;

        let mut exec = as_loop(|t, _m| {
            t.context.sp = 0;
            Err(EmulationError::Stopped)
        });
        let err = thread.fast_call(0x5000, &mut exec, &mem).unwrap_err();

        assert!(matches!(err, EmulationError::Stopped));
        assert_eq!(thread.context.sp, 0x2000);
        assert_eq!(active_thread_id(), 0);
    }

    #[test]
    fn dump_reflects_the_context() {
        let (process, tls, _mem) = fixture();
        let mut thread = spawn(7, &process, &tls);
        thread.context.gpr[1] = 0x1111_2222;

        let dump = thread.dump_regs();
        assert!(dump.contains("r1 = 0x11112222"));
        assert!(dump.contains("APSR = 0x00000000 [N: 0, Z: 0, C: 0, V: 0, Q: 0]"));
    }
}
