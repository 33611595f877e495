//! 进程控制模块

use array_macro::array;

use core::num::Wrapping;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::consts::NPROC;
use crate::env::KernelEnv;
use crate::spinlock::{LockRank, SpinLock, SpinLockGuard};
use crate::trap::user_trap_ret;

pub use cpu::{CPU_MANAGER, CpuManager, Cpu};
pub use cpu::{push_off, pop_off};
pub use context::Context;
pub use proc::{Alarm, Proc, ProcData, ProcExcl, ProcState, SysResult, Syscall};
pub use proc::syscall;
pub use trapframe::{TrapFrame, UserRegs};

mod context;
mod cpu;
mod proc;
mod trapframe;

/// 已安装的进程管理器，供 `fork_ret` 这类没有参数的入口找到它
static INSTALLED: AtomicPtr<ProcManager> = AtomicPtr::new(ptr::null_mut());

/// 分配进程槽位失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// 进程表已满
    NoFreeSlot,
    /// 陷阱帧或用户地址空间分配失败
    OutOfMemory,
}

/// 一次非阻塞回收的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    /// 回收了一个已退出的子进程
    Reaped { pid: usize, status: i32 },
    /// 有子进程，但都还没有退出
    Pending,
    /// 没有子进程
    NoChildren,
}

/// 进程管理器（Process Manager）
///
/// 负责维护系统中所有进程的状态、父子关系、PID 分配以及调度相关操作。
///
/// 主要功能包括：
/// - 存储固定数量的进程表，每个元素代表一个进程槽位，槽位在启动后永不移动。
/// - 管理进程的父子关系映射，由全局唯一的等待锁保护。
/// - 维护初始进程索引（第一个分配的进程）。
/// - 分配并维护全局唯一的进程标识符（PID）。
/// - 维护时钟 tick 计数。
///
/// 并发控制方面，每个进程的共享字段由各自的进程锁保护，父子关系由等待锁保护。
/// 等待锁必须先于任何进程锁获取。
pub struct ProcManager {
    /// 进程表，存放系统中所有的进程结构体，数量固定为 `NPROC`。
    table: [Proc; NPROC],

    /// 进程父子关系映射表，索引为子进程，值为对应父进程的索引。
    parents: SpinLock<[Option<usize>; NPROC]>,

    /// 初始进程在进程表中的索引。
    init_proc: usize,

    /// 下一个分配的 PID，从 1 开始单调递增。
    pid: SpinLock<usize>,

    /// 启动以来的时钟 tick 数。
    pub(crate) ticks: SpinLock<Wrapping<usize>>,

    /// 内存、文件系统等外部子系统。
    env: &'static dyn KernelEnv,
}

// 跨 hart 共享的字段都由锁保护
unsafe impl Sync for ProcManager {}

impl ProcManager {
    pub const fn new(env: &'static dyn KernelEnv) -> Self {
        Self {
            table: array![i => Proc::new(i); NPROC],
            parents: SpinLock::new_ranked(array![_ => None; NPROC], "wait_lock", LockRank::WaitLock),
            init_proc: 0,
            pid: SpinLock::new(1, "nextpid"),
            ticks: SpinLock::new(Wrapping(0), "time"),
            env,
        }
    }

    /// # 功能说明
    /// 为每个进程槽位记录内核栈地址。内核栈本身由外部子系统映射，
    /// 每个槽位一段 `KSTACK_PAGES` 页的栈，上方留有保护页。
    ///
    /// 该函数由系统启动时第一个 CPU 核心调用一次，此时没有并发访问进程表。
    pub fn proc_init(&self) {
        for p in self.table.iter() {
            let kstack = self.env.kernel_stack(p.index());
            unsafe { p.data_mut().set_kstack(kstack); }
        }

        #[cfg(feature = "verbose_init_info")]
        println!("process table initialized: {} slots", NPROC);
    }

    /// 把自身设为全局进程管理器，之后新进程的 `fork_ret` 通过它返回用户态
    pub fn install(&'static self) {
        INSTALLED.store(self as *const ProcManager as *mut ProcManager, Ordering::Release);
    }

    pub fn installed() -> Option<&'static ProcManager> {
        unsafe { INSTALLED.load(Ordering::Acquire).as_ref() }
    }

    #[inline]
    pub fn env(&self) -> &'static dyn KernelEnv {
        self.env
    }

    /// 槽位 `index` 上的进程
    #[inline]
    pub fn proc(&self, index: usize) -> &Proc {
        &self.table[index]
    }

    #[inline]
    pub fn init_proc(&self) -> &Proc {
        &self.table[self.init_proc]
    }

    /// 分配一个唯一的进程标识符（PID），第一个为 1，之后严格递增。
    fn alloc_pid(&self) -> usize {
        let mut pid = self.pid.lock();
        let ret_pid = *pid;
        *pid += 1;
        drop(pid);
        ret_pid
    }

    /// # 功能说明
    /// 在进程表中找到一个空闲槽位并初始化为新进程，状态为 `USED`。
    ///
    /// # 流程解释
    /// 1. 依次检查每个槽位，持有它的锁判断是否为 `UNUSED`。
    /// 2. 分配陷阱帧和用户地址空间，任何一步失败都把已分配的资源释放，槽位保持空闲。
    /// 3. 设置上下文，使调度器第一次切换过来时进入 `fork_ret`。
    /// 4. 分配 PID，状态置为 `USED`。
    ///
    /// # 返回值
    /// - `Ok(&Proc)`：新进程，调用者负责完成初始化并置为 `RUNNABLE`。
    /// - `Err(AllocError)`：进程表已满或内存不足。
    pub fn alloc_proc(&self) -> Result<&Proc, AllocError> {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state() != ProcState::UNUSED {
                drop(guard);
                continue;
            }

            // 持有进程的排他锁，因此管理器可以修改其私有数据
            let pd = unsafe { p.data_mut() };
            let tf_addr = pd.install_trapframe();

            debug_assert!(!pd.has_pagetable());
            match self.env.create_address_space(tf_addr) {
                Some(pgt) => pd.install_pagetable(pgt),
                None => {
                    pd.cleanup();
                    return Err(AllocError::OutOfMemory)
                },
            }
            pd.init_context();
            guard.pid = self.alloc_pid();
            guard.set_state(ProcState::USED);

            drop(guard);
            return Ok(p)
        }

        Err(AllocError::NoFreeSlot)
    }

    /// # 功能说明
    /// 为调度器认领一个 `RUNNABLE` 进程。
    ///
    /// 选中的进程在持有其锁的情况下被置为 `RUNNING`，锁随返回值一起交给调度器，
    /// 直到进程切换回来才释放，因此两个 hart 不可能认领同一个进程。
    pub fn alloc_runnable(&self) -> Option<(&Proc, SpinLockGuard<'_, ProcExcl>)> {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state() == ProcState::RUNNABLE {
                guard.set_state(ProcState::RUNNING);
                return Some((p, guard))
            }
            drop(guard);
        }

        None
    }

    /// # 功能说明
    /// 创建第一个用户进程。
    ///
    /// # 可能的错误
    /// 进程表在启动时必然为空，分配失败直接 panic。
    pub fn user_init(&self) {
        let p = match self.alloc_proc() {
            Ok(p) => p,
            Err(e) => panic!("user_init(): {:?}", e),
        };
        debug_assert_eq!(p.index(), self.init_proc);
        unsafe { p.data_mut().user_init(self.env); }
        let mut guard = p.excl.lock();
        guard.set_state(ProcState::RUNNABLE);
        drop(guard);

        #[cfg(feature = "verbose_init_info")]
        println!("first user process created: pid {}", p.pid());
    }

    /// 唤醒所有在 `channel` 上睡眠的进程。
    /// 调用者不能持有任何进程锁。
    pub fn wakeup(&self, channel: usize) {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.state() == ProcState::SLEEPING && guard.channel == channel {
                guard.set_state(ProcState::RUNNABLE);
            }
            drop(guard);
        }
    }

    /// 记录 `child_i` 的父进程
    pub fn set_parent(&self, child_i: usize, parent_i: usize) {
        let mut guard = self.parents.lock();
        let ret = guard[child_i].replace(parent_i);
        debug_assert!(ret.is_none());
        drop(guard);
    }

    pub fn parent_of(&self, child_i: usize) -> Option<usize> {
        self.parents.lock()[child_i]
    }

    /// # 功能说明
    /// 退出槽位 `exit_pi` 上的当前进程，永不返回。
    ///
    /// # 流程解释
    /// 1. 关闭打开的文件，释放工作目录。
    /// 2. 持有等待锁，把所有子进程过继给 init 进程，必要时唤醒 init。
    /// 3. 唤醒可能正在 `waiting` 中睡眠的父进程。
    /// 4. 持有自身进程锁，记录退出状态并置为 `ZOMBIE`，然后释放等待锁。
    ///    父进程在拿到等待锁之前看不到这个状态，因此不会错过。
    /// 5. 切换到调度器，不再返回。用户地址空间和陷阱帧在父进程回收时释放。
    ///
    /// # 可能的错误
    /// init 进程退出或者进程没有父进程时 panic。
    pub fn exiting(&self, exit_pi: usize, exit_status: i32) -> ! {
        if exit_pi == self.init_proc {
            panic!("init process exiting");
        }

        let p = &self.table[exit_pi];
        unsafe { p.data_mut().close_files(); }

        let mut parent_map = self.parents.lock();

        // 将子进程的父进程设置为 init 进程。
        let mut have_child = false;
        for child in parent_map.iter_mut() {
            match child {
                Some(parent) if *parent == exit_pi => {
                    *parent = self.init_proc;
                    have_child = true;
                },
                _ => {},
            }
        }
        if have_child {
            self.wakeup(self.table[self.init_proc].wait_channel());
        }
        match parent_map[exit_pi] {
            Some(exit_parenti) => self.wakeup(self.table[exit_parenti].wait_channel()),
            None => panic!("exiting(): process {} has no parent", exit_pi),
        }

        let mut exit_pexcl = p.excl.lock();
        exit_pexcl.exit_status = exit_status;
        exit_pexcl.set_state(ProcState::ZOMBIE);
        drop(parent_map);

        let _exit_pexcl = unsafe { CPU_MANAGER.sched(exit_pexcl, p.context_ptr()) };

        unreachable!("exiting {}", exit_pi);
    }

    /// # 功能说明
    /// 在已持有等待锁的情况下查找并回收 `pi` 的一个 `ZOMBIE` 子进程。
    ///
    /// 回收前先调用 `copy_status` 把退出状态交给调用者，它失败时子进程保持原样。
    fn reap_locked<F>(&self, parent_map: &mut [Option<usize>; NPROC], pi: usize, mut copy_status: F)
        -> Result<Reap, ()>
    where
        F: FnMut(i32) -> Result<(), ()>,
    {
        let mut have_child = false;
        for i in 0..NPROC {
            if parent_map[i] != Some(pi) {
                continue;
            }

            let mut child_excl = self.table[i].excl.lock();
            have_child = true;
            if child_excl.state() != ProcState::ZOMBIE {
                continue;
            }
            let child_pid = child_excl.pid;
            let status = child_excl.exit_status;
            copy_status(status)?;

            parent_map[i].take();
            let child_data = unsafe { self.table[i].data_mut() };
            child_data.cleanup();
            child_excl.cleanup();
            return Ok(Reap::Reaped { pid: child_pid, status })
        }

        Ok(if have_child { Reap::Pending } else { Reap::NoChildren })
    }

    /// 不阻塞地尝试回收 `pi` 的一个已退出子进程
    pub fn try_reap(&self, pi: usize) -> Reap {
        let mut parent_map = self.parents.lock();
        match self.reap_locked(&mut parent_map, pi, |_| Ok(())) {
            Ok(reap) => reap,
            Err(()) => unreachable!("try_reap(): status is never copied out"),
        }
    }

    /// # 功能说明
    /// 等待 `pi` 的任意一个子进程退出并回收它。
    /// `addr` 非 0 时把子进程的退出状态写到当前进程用户空间的该地址。
    ///
    /// # 返回值
    /// - `Ok(pid)`：被回收的子进程的 PID。
    /// - `Err(())`：没有子进程、状态写入失败或自身已被杀死。
    pub fn waiting(&self, pi: usize, addr: usize) -> Result<usize, ()> {
        let p = &self.table[pi];
        let mut parent_map = self.parents.lock();

        loop {
            let reap = self.reap_locked(&mut parent_map, pi, |status| {
                if addr == 0 {
                    return Ok(())
                }
                unsafe { p.data_mut().copy_out(addr, &status.to_ne_bytes()) }
            })?;
            match reap {
                Reap::Reaped { pid, .. } => return Ok(pid),
                Reap::NoChildren => return Err(()),
                Reap::Pending => {},
            }

            if p.killed() {
                return Err(())
            }

            // have children, but none of them exit
            p.sleep(p.wait_channel(), parent_map);
            parent_map = self.parents.lock();
        }
    }

    /// # 功能说明
    /// 杀死进程号为 `pid` 的进程：设置终止标志，如果它在睡眠则唤醒它。
    /// 进程在下一个检查点（例如返回用户态前）自行退出。
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        for p in self.table.iter() {
            let mut guard = p.excl.lock();
            if guard.pid == pid && guard.state() != ProcState::UNUSED {
                guard.killed = true;
                if guard.state() == ProcState::SLEEPING {
                    guard.set_state(ProcState::RUNNABLE);
                }
                return Ok(())
            }
        }

        Err(())
    }
}

/// 新进程第一次被调度时从这里开始执行
///
/// # 安全性
/// 只能作为上下文入口由 `swtch` 进入，此时调度器持有当前进程的锁。
unsafe fn fork_ret() -> ! {
    static INITIALIZED: AtomicBool = AtomicBool::new(false);

    // Still holding p->lock from scheduler
    CPU_MANAGER.my_proc().excl.unlock();

    let pm = match ProcManager::installed() {
        Some(pm) => pm,
        None => panic!("fork_ret(): no process manager installed"),
    };

    // 文件系统初始化需要睡眠，只能在进程上下文中进行
    if !INITIALIZED.swap(true, Ordering::AcqRel) {
        pm.env().fs_init();
    }

    user_trap_ret(pm);
}
