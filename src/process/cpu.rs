//! 处理器状态管理，用于控制正在执行的进程与中断开关

use array_macro::array;

use core::cell::UnsafeCell;
use core::ptr;

use crate::arch;
use crate::consts::NCPU;
use crate::spinlock::SpinLockGuard;
use super::{Context, Proc, ProcManager, ProcState, proc::ProcExcl};

/// 全局 CPU 管理器实例
///
/// 系统中每个硬件线程（hart）对应表中的一个 [`Cpu`]，按 hart 编号索引。
/// 启动时一次性构造，永不销毁；每个 `Cpu` 只由它所属的 hart 访问。
pub static CPU_MANAGER: CpuManager = CpuManager::new();

/// CPU 管理器，维护系统中所有 CPU 核心的状态信息。
///
/// `CpuManager` 通过固定大小数组 `table` 存储每个 CPU 对应的 `Cpu` 结构体，
/// 用于跟踪每个 CPU 的运行状态、调度上下文以及当前运行的进程。
pub struct CpuManager {
    table: [UnsafeCell<Cpu>; NCPU],
}

// 每个 hart 只访问自己那一项
unsafe impl Sync for CpuManager {}

impl CpuManager {
    const fn new() -> Self {
        Self {
            table: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
        }
    }

    /// 必须在禁用中断的情况下调用，
    /// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
    #[inline]
    pub unsafe fn cpu_id() -> usize {
        arch::hart_id()
    }

    /// 返回当前 CPU 的 cpu 结构体的引用。
    /// 必须禁用中断。
    pub unsafe fn my_cpu(&self) -> &Cpu {
        &*self.table[Self::cpu_id()].get()
    }

    /// 返回当前 CPU 的 cpu 结构体的可变引用。
    /// 必须禁用中断。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn my_cpu_mut(&self) -> &mut Cpu {
        &mut *self.table[Self::cpu_id()].get()
    }

    fn my_cpu_ptr(&self) -> *mut Cpu {
        self.table[unsafe { Self::cpu_id() }].get()
    }

    /// 把 hart `id` 的描述符恢复到启动时的状态
    ///
    /// # 安全性
    /// 调用时该 hart 上不能有任何执行流。
    pub unsafe fn reset(&self, id: usize) {
        *self.table[id].get() = Cpu::new();
    }

    /// 当前 CPU 上正在运行的进程，空闲时返回 `None`。
    pub fn my_proc_opt(&self) -> Option<&Proc> {
        push_off();
        let p = unsafe { self.my_cpu().proc.as_ref() };
        pop_off();
        p
    }

    /// # 功能说明
    /// 获取当前 CPU 上正在运行的进程的引用。
    ///
    /// # 可能的错误
    /// - 如果当前 CPU 上没有运行的进程，则会触发 panic。
    pub fn my_proc(&self) -> &Proc {
        match self.my_proc_opt() {
            Some(p) => p,
            None => panic!("my_proc(): no process running"),
        }
    }

    /// # 功能说明
    /// CPU 调度器主循环。每个 hart 在启动的最后进入这里，永不返回。
    ///
    /// # 安全性
    /// 调用者必须保证当前 CPU 和进程表已正确初始化。
    pub unsafe fn scheduler(&self, pm: &ProcManager) -> ! {
        loop {
            self.run_once(pm);
        }
    }

    /// # 功能说明
    /// 调度器循环的一轮：打开中断，向进程表认领一个 `RUNNABLE` 进程并切换过去，
    /// 直到该进程切换回调度器。
    ///
    /// # 流程解释
    /// 1. 确保设备能够中断。
    /// 2. `alloc_runnable()` 在持有进程锁的情况下把选中的进程置为 `RUNNING`，
    ///    锁一直持有到切换回来，因此同一个进程不可能同时在两个 hart 上运行。
    /// 3. 记录 `proc` 指针并调用 `swtch` 切换到进程上下文。
    /// 4. 进程在切换回来之前已经修改了自己的状态，这里清空 `proc` 并释放锁。
    ///
    /// # 返回值
    /// 本轮是否运行了某个进程。
    ///
    /// # 安全性
    /// 调用者必须是当前 hart 的调度器执行流。
    pub unsafe fn run_once(&self, pm: &ProcManager) -> bool {
        arch::intr_on();

        let c = self.my_cpu_ptr();
        match pm.alloc_runnable() {
            Some((p, guard)) => {
                (*c).proc = p as *const Proc;

                arch::swtch(&mut (*c).scheduler as *mut Context, p.context_ptr());

                // 进程可能在别的 hart 上继续，这里仍是同一个 hart 的调度器
                let c = self.my_cpu_ptr();
                if (*c).proc.is_null() {
                    panic!("context switch back with no process reference");
                }
                (*c).proc = ptr::null();
                drop(guard);
                true
            },
            None => false,
        }
    }

    /// # 功能说明
    /// 从当前运行的进程上下文切换回调度器上下文。
    /// 该函数在切换期间保持进程的锁（`SpinLockGuard`），
    /// 确保进程状态的一致性和并发安全。
    ///
    /// # 流程解释
    /// 1. 检查当前持有的锁是否是进程锁，确保调用前已加锁。
    /// 2. 确认 CPU 当前只持有一个锁（`noff == 1`）。
    /// 3. 验证进程状态不是运行中。
    /// 4. 确保中断被禁止。
    /// 5. 保存 `intena`，调用 `swtch`，在返回后所在的 hart 上恢复。
    ///
    /// # 返回值
    /// 返回传入的进程锁，切换回来时它由新的调度器重新持有。
    ///
    /// # 安全性
    /// 调用者必须保证 `ctx` 指向当前进程的上下文。
    pub unsafe fn sched<'a>(&self, guard: SpinLockGuard<'a, ProcExcl>, ctx: *mut Context)
        -> SpinLockGuard<'a, ProcExcl>
    {
        let c = self.my_cpu_ptr();

        // 中断已关闭
        if !guard.holding() {
            panic!("sched(): not holding proc's lock");
        }
        // 只持有 self.proc 的锁
        if (*c).noff != 1 {
            panic!("sched(): cpu hold multi locks");
        }
        // 进程不在运行中
        if guard.state() == ProcState::RUNNING {
            panic!("sched(): proc is running");
        }
        // 不应被中断
        if arch::intr_get() {
            panic!("sched(): interruptible");
        }

        let intena = (*c).intena;
        arch::swtch(ctx, &(*c).scheduler as *const Context);
        (*self.my_cpu_ptr()).intena = intena;

        guard
    }

    /// # 功能说明
    /// 内核态时钟中断：如果当前 CPU 上有进程且处于运行状态，就让它让出 CPU。
    pub fn try_yield_proc(&self) {
        if let Some(p) = self.my_proc_opt() {
            let guard = p.excl.lock();
            if guard.state() == ProcState::RUNNING {
                drop(guard);
                p.yielding();
            } else {
                drop(guard);
            }
        }
    }
}

/// CPU 结构体，保存当前 CPU 核心的状态信息。
///
/// 该结构体设计为单核独占访问，不需要额外的锁保护，
/// 只由对应 CPU 核心本地访问，确保访问安全性。
pub struct Cpu {
    /// 当前在该 CPU 上运行的进程，空闲时为 null。
    /// 只是观察用的弱引用，进程槽位归进程表所有。
    proc: *const Proc,

    /// 调度器上下文，进程通过 `sched` 切换到这里进入调度循环。
    scheduler: Context,

    /// 关闭中断的嵌套计数。
    noff: u8,

    /// 第一层 `push_off` 之前的中断使能状态。
    intena: bool,

    /// 当前持有的进程锁数量，用于检查加锁顺序。
    proc_locks: u8,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null(),
            scheduler: Context::new(),
            noff: 0,
            intena: false,
            proc_locks: 0,
        }
    }

    #[inline]
    pub fn noff(&self) -> u8 {
        self.noff
    }

    #[inline]
    pub fn intena(&self) -> bool {
        self.intena
    }

    #[inline]
    pub fn proc_locks(&self) -> u8 {
        self.proc_locks
    }

    pub(crate) fn proc_lock_acquired(&mut self) {
        self.proc_locks += 1;
    }

    pub(crate) fn proc_lock_released(&mut self) {
        if self.proc_locks.checked_sub(1).is_none() {
            panic!("proc lock count not match");
        }
        self.proc_locks -= 1;
    }
}

/// # 功能说明
/// 关闭当前 CPU 的中断，并记录中断关闭的嵌套次数。
/// 与 `intr_off()` 类似，但支持成对使用，
/// 多次调用 `push_off()` 需要相应次数的 `pop_off()` 才能恢复中断状态。
/// 如果中断原本就是关闭状态，调用后保持关闭。
pub fn push_off() {
    let old = arch::intr_get();
    arch::intr_off();
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff == 0 {
        c.intena = old;
    }
    c.noff += 1;
}

/// # 功能说明
/// 解除之前通过 `push_off()` 关闭的中断，
/// 只有所有嵌套的关闭操作都对应调用后，
/// 才真正重新开启中断。
///
/// # 可能的错误
/// - 如果在中断已开启时调用，会 panic。
/// - 如果调用次数与 `push_off()` 不匹配，panic。
pub fn pop_off() {
    if arch::intr_get() {
        panic!("pop_off(): interruptable");
    }
    let c = unsafe { CPU_MANAGER.my_cpu_mut() };
    if c.noff.checked_sub(1).is_none() {
        panic!("pop_off(): count not match");
    }
    c.noff -= 1;
    if c.noff == 0 && c.intena {
        arch::intr_on();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HartLease;

    #[test]
    fn nesting_restores_only_at_outermost_level() {
        let _hart = HartLease::acquire();
        arch::intr_on();
        push_off();
        push_off();
        assert!(!arch::intr_get());
        assert_eq!(unsafe { CPU_MANAGER.my_cpu().noff() }, 2);
        assert!(unsafe { CPU_MANAGER.my_cpu().intena() });
        pop_off();
        assert!(!arch::intr_get());
        pop_off();
        assert!(arch::intr_get());
    }

    #[test]
    fn interrupts_stay_off_when_they_were_off() {
        let _hart = HartLease::acquire();
        arch::intr_off();
        push_off();
        pop_off();
        assert!(!arch::intr_get());
    }

    #[test]
    #[should_panic(expected = "count not match")]
    fn unbalanced_pop_off_panics() {
        let _hart = HartLease::acquire();
        pop_off();
    }

    #[test]
    fn idle_hart_has_no_process() {
        let _hart = HartLease::acquire();
        assert!(CPU_MANAGER.my_proc_opt().is_none());
    }
}
