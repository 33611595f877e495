//! 宿主机测试使用的模拟环境
//!
//! - [`HartLease`] 从一个共享的 hart 池中租用 hart，测试线程借此扮演某个 hart 的调度器；
//! - [`TestEnv`] 用 `Vec<u8>` 模拟用户地址空间，并在 `return_to_user` 中执行一段模拟的 initcode；
//! - [`spawn`] 和 [`enter_process`] 让测试把普通函数作为进程的内核线程运行。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::arch::{self, hosted};
use crate::consts::{KSTACK_PAGES, NCPU, PGSIZE};
use crate::env::{AddressSpace, File, Inode, KernelEnv};
use crate::process::syscall::{SYS_EXIT, SYS_FORK, SYS_SLEEP, SYS_WAIT};
use crate::process::{Proc, ProcManager, ProcState, CPU_MANAGER};
use crate::trap::{self, TrapCause};

static HARTS: Mutex<[bool; NCPU]> = Mutex::new([false; NCPU]);
static HART_FREED: Condvar = Condvar::new();

/// 独占一个 hart，释放时恢复它的描述符和中断状态
pub struct HartLease {
    id: usize,
    bound: bool,
}

impl HartLease {
    /// 租用一个 hart 并把当前线程绑定上去
    pub fn acquire() -> Self {
        let mut lease = match Self::acquire_many(1).pop() {
            Some(lease) => lease,
            None => unreachable!(),
        };
        hosted::bind_hart(lease.id);
        lease.bound = true;
        lease
    }

    /// 一次租用 `n` 个 hart，不绑定当前线程
    pub fn acquire_many(n: usize) -> Vec<Self> {
        assert!(n <= NCPU);
        let mut harts = HARTS.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let free: Vec<usize> = (0..NCPU).filter(|&i| !harts[i]).take(n).collect();
            if free.len() == n {
                return free.into_iter().map(|id| {
                    harts[id] = true;
                    reset(id);
                    HartLease { id, bound: false }
                }).collect()
            }
            harts = HART_FREED.wait(harts).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HartLease {
    fn drop(&mut self) {
        if self.bound {
            hosted::unbind_hart();
        }
        reset(self.id);
        let mut harts = HARTS.lock().unwrap_or_else(|e| e.into_inner());
        harts[self.id] = false;
        HART_FREED.notify_all();
    }
}

fn reset(id: usize) {
    unsafe { CPU_MANAGER.reset(id); }
    hosted::reset_hart(id);
}

/// 当前线程绑定在某个 hart 上，离开作用域时解除
pub struct Bound(());

impl Drop for Bound {
    fn drop(&mut self) {
        hosted::unbind_hart();
    }
}

pub fn bind(id: usize) -> Bound {
    hosted::bind_hart(id);
    Bound(())
}

/// 模拟地址空间的大小上限，超过它的扩展一律失败
pub const SPACE_LIMIT: usize = 64 * PGSIZE;

const SATP_SV39: usize = 8 << 60;

/// 用一段连续内存模拟的用户地址空间，虚拟地址即下标
pub struct VecSpace {
    mem: Vec<u8>,
    satp: usize,
}

impl VecSpace {
    pub fn new(trapframe: usize) -> Self {
        Self {
            mem: Vec::new(),
            satp: SATP_SV39 | (trapframe >> 12),
        }
    }
}

impl AddressSpace for VecSpace {
    fn satp(&self) -> usize {
        self.satp
    }

    fn copy_out(&mut self, dst: usize, src: &[u8]) -> Result<(), ()> {
        let end = dst.checked_add(src.len()).ok_or(())?;
        self.mem.get_mut(dst..end).ok_or(())?.copy_from_slice(src);
        Ok(())
    }

    fn copy_in(&self, src: usize, dst: &mut [u8]) -> Result<(), ()> {
        let end = src.checked_add(dst.len()).ok_or(())?;
        dst.copy_from_slice(self.mem.get(src..end).ok_or(())?);
        Ok(())
    }

    fn grow(&mut self, _old_size: usize, new_size: usize) -> Result<(), ()> {
        if new_size > SPACE_LIMIT {
            return Err(())
        }
        self.mem.resize(new_size, 0);
        Ok(())
    }

    fn shrink(&mut self, _old_size: usize, new_size: usize) {
        self.mem.truncate(new_size);
    }

    fn release(&mut self, _size: usize) {
        self.mem = Vec::new();
    }
}

struct TestFile;
impl File for TestFile {}

struct TestInode;
impl Inode for TestInode {}

pub fn test_file() -> Arc<dyn File> {
    Arc::new(TestFile)
}

/// 第一个用户程序的机器码，只用来检查它被装到了地址 0
pub static INITCODE: [u8; 51] = [
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x05, 0x02, 0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x05, 0x02,
    0x9d, 0x48, 0x73, 0x00, 0x00, 0x00, 0x89, 0x48, 0x73, 0x00, 0x00, 0x00, 0xef, 0xf0, 0xbf, 0xff,
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x01, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00,
];

pub const KERNEL_TRAP: usize = 0x8000_2000;
pub const KERNEL_VEC: usize = 0x8000_3000;
pub const USER_VEC: usize = 0x3f_ffff_f000;
const KSTACK_BASE: usize = 0x3f_ffff_0000;

/// 模拟 initcode 中 `wait` 写入子进程退出状态的地址
pub const WAIT_STATUS_ADDR: usize = 0x100;

pub static FS_INITS: AtomicUsize = AtomicUsize::new(0);
pub static DEVICE_INTERRUPTS: AtomicUsize = AtomicUsize::new(0);

/// 最近一次设备中断处理时 hart 的陷阱向量
pub static STVEC_AT_DEVICE: AtomicUsize = AtomicUsize::new(0);

/// 一次返回用户态时陷阱帧里的内容
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserReturn {
    pub pid: usize,
    pub epc: usize,
    pub satp: usize,
    pub a0: usize,
    pub kernel_sp: usize,
    pub kernel_trap: usize,
    pub kernel_hartid: usize,
    pub intr_on: bool,
    pub stvec: usize,
}

pub static USER_RETURNS: Mutex<Vec<UserReturn>> = Mutex::new(Vec::new());

pub struct TestEnv {
    memory: bool,
}

pub static TEST_ENV: TestEnv = TestEnv { memory: true };

/// 创建地址空间总是失败的环境
pub static NO_MEMORY_ENV: TestEnv = TestEnv { memory: false };

impl KernelEnv for TestEnv {
    fn kernel_stack(&self, slot: usize) -> usize {
        KSTACK_BASE - (slot + 1) * (KSTACK_PAGES + 1) * PGSIZE
    }

    fn create_address_space(&self, trapframe: usize) -> Option<Box<dyn AddressSpace>> {
        if !self.memory {
            return None
        }
        Some(Box::new(VecSpace::new(trapframe)))
    }

    fn load_init(&self, pagetable: &mut dyn AddressSpace) -> usize {
        if pagetable.grow(0, PGSIZE).is_err() || pagetable.copy_out(0, &INITCODE).is_err() {
            panic!("load_init(): out of memory");
        }
        PGSIZE
    }

    fn root_dir(&self) -> Option<Arc<dyn Inode>> {
        Some(Arc::new(TestInode))
    }

    fn fs_init(&self) {
        FS_INITS.fetch_add(1, Ordering::SeqCst);
    }

    fn kernel_trap_entry(&self) -> usize {
        KERNEL_TRAP
    }

    fn kernel_trap_vector(&self) -> usize {
        KERNEL_VEC
    }

    fn user_trap_vector(&self) -> usize {
        USER_VEC
    }

    fn device_interrupt(&self) {
        STVEC_AT_DEVICE.store(hosted::read_stvec(), Ordering::SeqCst);
        DEVICE_INTERRUPTS.fetch_add(1, Ordering::SeqCst);
    }

    /// 记录陷阱帧，然后“执行”用户代码直到下一次陷入
    unsafe fn return_to_user(&self, epc: usize, satp: usize) -> ! {
        let intr_on = arch::intr_get();
        let stvec = hosted::read_stvec();
        let pm = match ProcManager::installed() {
            Some(pm) => pm,
            None => panic!("return_to_user(): no process manager installed"),
        };
        let p = CPU_MANAGER.my_proc();
        let tf = p.data_mut().tf();
        let ret = UserReturn {
            pid: p.pid(),
            epc,
            satp,
            a0: tf.a0,
            kernel_sp: tf.kernel_sp,
            kernel_trap: tf.kernel_trap,
            kernel_hartid: tf.kernel_hartid,
            intr_on,
            stvec,
        };
        USER_RETURNS.lock().unwrap_or_else(|e| e.into_inner()).push(ret);

        let cause = run_initcode(p);
        trap::user_trap(pm, cause)
    }
}

/// 模拟的 initcode：先被一次设备中断打断，然后 fork；
/// 子进程以 7 退出，父进程等待它，之后一直睡眠。
fn run_initcode(p: &Proc) -> TrapCause {
    let tf = unsafe { p.data_mut().tf_mut() };
    match tf.epc {
        0 if DEVICE_INTERRUPTS.load(Ordering::SeqCst) == 0 => TrapCause::External,
        0 => {
            tf.a7 = SYS_FORK;
            TrapCause::UserEcall
        }
        4 if tf.a0 == 0 => {
            tf.a7 = SYS_EXIT;
            tf.a0 = 7;
            TrapCause::UserEcall
        }
        4 => {
            tf.a7 = SYS_WAIT;
            tf.a0 = WAIT_STATUS_ADDR;
            TrapCause::UserEcall
        }
        8 => {
            tf.a7 = SYS_SLEEP;
            tf.a0 = 1_000_000;
            TrapCause::UserEcall
        }
        // illegal instruction
        _ => TrapCause::Unknown(2),
    }
}

pub fn new_manager() -> &'static ProcManager {
    new_manager_with(&TEST_ENV)
}

pub fn new_manager_with(env: &'static dyn KernelEnv) -> &'static ProcManager {
    let pm: &'static ProcManager = Box::leak(Box::new(ProcManager::new(env)));
    pm.proc_init();
    pm
}

/// 沿合法的迁移路径把一个 `USED` 进程放到 `channel` 上睡眠
pub fn force_sleep(p: &Proc, channel: usize) {
    let mut guard = p.excl.lock();
    guard.set_state(ProcState::RUNNABLE);
    guard.set_state(ProcState::RUNNING);
    guard.channel = channel;
    guard.set_state(ProcState::SLEEPING);
}

/// 分配一个以 `entry` 为内核线程入口的可运行进程，父进程为 `parent`
pub fn spawn(pm: &'static ProcManager, parent: &Proc, entry: unsafe fn() -> !) -> &'static Proc {
    let p = pm.alloc_proc().unwrap();
    unsafe { p.data_mut().context_mut().set_ra(entry as usize); }
    pm.set_parent(p.index(), parent.index());
    p.excl.lock().set_state(ProcState::RUNNABLE);
    p
}

/// 进程内核线程的第一步：释放调度器替它持有的进程锁
///
/// # 安全性
/// 只能在 [`spawn`] 指定的入口开头调用一次。
pub unsafe fn enter_process() -> &'static Proc {
    let p = CPU_MANAGER.my_proc();
    p.excl.unlock();
    p
}
