//! 进程控制块：状态机、私有数据以及 fork、sleep、yield 等进程自身的操作

use array_macro::array;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::cmp;

use crate::arch;
use crate::consts::{KILLED_EXIT_STATUS, KSTACK_PAGES, NOFILE, PGSIZE, PROC_NAME_LEN};
use crate::env::{AddressSpace, File, Inode, KernelEnv};
use crate::spinlock::{LockRank, SpinLock, SpinLockGuard};

use super::{fork_ret, pop_off, push_off, Context, CpuManager, ProcManager, TrapFrame, CPU_MANAGER};

pub use self::alarm::Alarm;
pub use self::syscall::{SysResult, Syscall};

mod alarm;
pub mod syscall;

/// 进程状态枚举类型，表示操作系统内核中进程的不同生命周期状态。
///
/// 合法的状态迁移只有下面几条，其余一律视为内核错误：
///
/// ```text
/// UNUSED   -> USED                  分配槽位
/// USED     -> RUNNABLE | UNUSED     初始化完成 / 初始化失败回滚
/// RUNNABLE -> RUNNING               被调度器选中
/// RUNNING  -> RUNNABLE              让出 CPU
/// RUNNING  -> SLEEPING              在通道上睡眠
/// RUNNING  -> ZOMBIE                退出
/// SLEEPING -> RUNNABLE              被唤醒或被杀死
/// ZOMBIE   -> UNUSED                被父进程回收
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ProcState {
    /// 该进程槽位未被占用，空闲状态。
    UNUSED,
    /// 槽位已被分配，正在初始化，尚不能被调度。
    USED,
    /// 进程处于睡眠状态，等待某事件或资源唤醒。
    SLEEPING,
    /// 进程处于可运行状态，等待调度器调度执行。
    RUNNABLE,
    /// 进程当前正在某个 CPU 上运行。
    RUNNING,
    /// 进程已退出，处于僵尸状态，等待父进程回收。
    ZOMBIE,
}

impl ProcState {
    /// 从 `self` 迁移到 `next` 是否合法
    pub fn can_become(self, next: ProcState) -> bool {
        use ProcState::*;
        matches!(
            (self, next),
            (UNUSED, USED)
                | (USED, RUNNABLE)
                | (USED, UNUSED)
                | (RUNNABLE, RUNNING)
                | (RUNNING, RUNNABLE)
                | (RUNNING, SLEEPING)
                | (RUNNING, ZOMBIE)
                | (SLEEPING, RUNNABLE)
                | (ZOMBIE, UNUSED)
        )
    }
}

/// 进程的排他信息结构体，包含进程的核心状态和控制字段。
///
/// 由进程自己的锁保护。状态只能通过 [`ProcExcl::set_state`] 修改，
/// 非法迁移会直接 panic。
#[derive(Debug)]
pub struct ProcExcl {
    /// 进程当前的状态
    state: ProcState,
    /// 进程退出时的状态码，只在 `ZOMBIE` 状态下有意义。
    pub exit_status: i32,
    /// 进程睡眠等待的通道，只在 `SLEEPING` 状态下有意义。
    pub channel: usize,
    /// 进程的唯一标识符（进程ID），槽位空闲时为 0。
    pub pid: usize,
    /// 是否已被要求终止。进程在下一个检查点自行退出。
    pub killed: bool,
}

impl ProcExcl {
    pub(crate) const fn new() -> Self {
        Self {
            state: ProcState::UNUSED,
            exit_status: 0,
            channel: 0,
            pid: 0,
            killed: false,
        }
    }

    #[inline]
    pub fn state(&self) -> ProcState {
        self.state
    }

    /// 迁移到 `next`，非法迁移 panic
    pub fn set_state(&mut self, next: ProcState) {
        if !self.state.can_become(next) {
            panic!("illegal process state transition {:?} -> {:?} (pid {})",
                self.state, next, self.pid);
        }
        self.state = next;
    }

    /// 清除 [`ProcExcl`] 的内容，槽位回到 `UNUSED`
    pub fn cleanup(&mut self) {
        self.pid = 0;
        self.channel = 0;
        self.exit_status = 0;
        self.killed = false;
        self.set_state(ProcState::UNUSED);
    }
}

/// 进程私有数据结构，保存进程运行时的核心信息。
///
/// 该结构体仅在进程自己运行时访问，或在进程尚不可调度（`USED`）、
/// 已不再运行（`ZOMBIE`）时由分配者或回收者访问，因此不需要锁。
pub struct ProcData {
    /// 进程内核栈的起始虚拟地址。
    kstack: usize,
    /// 进程使用的用户内存大小（字节数）。
    pub sz: usize,
    /// 进程上下文，用于上下文切换。
    context: Context,
    /// 进程名称，通常用于调试和显示。
    name: [u8; PROC_NAME_LEN],
    /// 进程打开的文件，下标即文件描述符。
    open_files: [Option<Arc<dyn File>>; NOFILE],
    /// 进程的陷阱帧，占一整页。
    tf: Option<Box<TrapFrame>>,
    /// 进程的用户地址空间。
    pagetable: Option<Box<dyn AddressSpace>>,
    /// 进程当前工作目录。
    pub cwd: Option<Arc<dyn Inode>>,
    alarm: Alarm,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            context: Context::new(),
            name: [0; PROC_NAME_LEN],
            open_files: array![_ => None; NOFILE],
            tf: None,
            pagetable: None,
            cwd: None,
            alarm: Alarm::new(),
        }
    }

    pub fn set_kstack(&mut self, kstack: usize) {
        self.kstack = kstack;
    }

    #[inline]
    pub fn kstack(&self) -> usize {
        self.kstack
    }

    /// 内核栈栈顶
    #[inline]
    pub fn kstack_top(&self) -> usize {
        self.kstack + KSTACK_PAGES * PGSIZE
    }

    /// # 功能说明
    /// 初始化进程的上下文信息。该函数在进程槽位分配后调用，
    /// 将进程上下文清零，并设置返回地址为 `fork_ret`，栈指针为内核栈顶，
    /// 使得调度器第一次切换过来时从 `fork_ret` 开始执行。
    pub fn init_context(&mut self) {
        // 槽位上一个主人切走后留下的上下文不会再被恢复
        arch::retire_context(&self.context);
        self.context.clear();
        self.context.set_ra(fork_ret as unsafe fn() -> ! as usize);
        self.context.set_sp(self.kstack_top());
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[inline]
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// 返回陷阱帧的引用
    ///
    /// # 可能的错误
    /// 槽位未分配时没有陷阱帧，panic。
    pub fn tf(&self) -> &TrapFrame {
        match self.tf.as_deref() {
            Some(tf) => tf,
            None => panic!("process has no trapframe"),
        }
    }

    pub fn tf_mut(&mut self) -> &mut TrapFrame {
        match self.tf.as_deref_mut() {
            Some(tf) => tf,
            None => panic!("process has no trapframe"),
        }
    }

    /// 分配一个清零的陷阱帧，返回它的地址，供用户地址空间映射
    pub fn install_trapframe(&mut self) -> usize {
        debug_assert!(self.tf.is_none());
        let tf = Box::new(TrapFrame::new());
        let addr = &*tf as *const TrapFrame as usize;
        self.tf = Some(tf);
        addr
    }

    #[inline]
    pub fn has_pagetable(&self) -> bool {
        self.pagetable.is_some()
    }

    pub fn install_pagetable(&mut self, pgt: Box<dyn AddressSpace>) {
        self.pagetable = Some(pgt);
    }

    pub fn pagetable(&self) -> &dyn AddressSpace {
        match self.pagetable.as_deref() {
            Some(pgt) => pgt,
            None => panic!("process has no address space"),
        }
    }

    pub fn pagetable_mut(&mut self) -> &mut dyn AddressSpace {
        match self.pagetable.as_deref_mut() {
            Some(pgt) => pgt,
            None => panic!("process has no address space"),
        }
    }

    /// 设置进程名称，超出长度的部分被截断，末尾至少保留一个 0
    pub fn set_name(&mut self, name: &[u8]) {
        let len = cmp::min(name.len(), PROC_NAME_LEN - 1);
        self.name = [0; PROC_NAME_LEN];
        self.name[..len].copy_from_slice(&name[..len]);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    #[inline]
    pub fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    #[inline]
    pub fn alarm_mut(&mut self) -> &mut Alarm {
        &mut self.alarm
    }

    /// # 功能说明
    /// 准备进程从内核态返回到用户态所需的陷阱帧内核字段，
    /// 并返回用户地址空间的 satp 值。
    ///
    /// # 流程解释
    /// 1. 记录内核页表，下一次陷入时由跳板代码恢复。
    /// 2. 设置内核栈指针为本进程内核栈栈顶，之前的内核栈内容已无用。
    /// 3. 设置内核陷阱处理入口和当前 CPU 编号。
    /// 4. 返回用户地址空间的 satp 值，供跳板代码切换页表。
    pub fn user_ret_prepare(&mut self, env: &dyn KernelEnv) -> usize {
        let kstack_top = self.kstack_top();
        let tf = self.tf_mut();
        tf.kernel_satp = arch::read_satp();
        tf.kernel_sp = kstack_top;
        tf.kernel_trap = env.kernel_trap_entry();
        tf.kernel_hartid = unsafe { CpuManager::cpu_id() };

        self.pagetable().satp()
    }

    /// 把第一个用户程序装进地址空间，准备从地址 0 开始执行
    pub fn user_init(&mut self, env: &dyn KernelEnv) {
        let size = env.load_init(self.pagetable_mut());
        self.sz = size;

        // 准备返回程序计数器和栈指针
        let tf = self.tf_mut();
        tf.epc = 0;
        tf.sp = size;

        self.set_name(b"initcode");

        debug_assert!(self.cwd.is_none());
        self.cwd = match env.root_dir() {
            Some(root) => Some(root),
            None => panic!("user_init(): cannot find root inode"),
        };
    }

    /// 将 `src` 复制到用户虚拟地址 `dst`
    #[inline]
    pub fn copy_out(&mut self, dst: usize, src: &[u8]) -> Result<(), ()> {
        self.pagetable_mut().copy_out(dst, src)
    }

    /// 从用户虚拟地址 `src` 读取 `dst.len()` 字节
    #[inline]
    pub fn copy_in(&self, src: usize, dst: &mut [u8]) -> Result<(), ()> {
        self.pagetable().copy_in(src, dst)
    }

    /// 把 `file` 放进第一个空闲的描述符，表满时返回 `None`
    pub fn alloc_fd(&mut self, file: Arc<dyn File>) -> Option<usize> {
        let fd = self.open_files.iter().position(|f| f.is_none())?;
        self.open_files[fd] = Some(file);
        Some(fd)
    }

    /// 让一个新的描述符指向 `fd` 打开的同一个文件
    pub fn dup_fd(&mut self, fd: usize) -> Option<usize> {
        let file = self.file(fd)?.clone();
        self.alloc_fd(file)
    }

    /// 取出并关闭描述符 `fd`
    pub fn close_fd(&mut self, fd: usize) -> Option<Arc<dyn File>> {
        self.open_files.get_mut(fd)?.take()
    }

    pub fn file(&self, fd: usize) -> Option<&Arc<dyn File>> {
        self.open_files.get(fd)?.as_ref()
    }

    /// 关闭进程打开的所有文件，并释放当前工作目录的引用。
    /// 该函数在进程退出时调用。
    pub fn close_files(&mut self) {
        for f in self.open_files.iter_mut() {
            drop(f.take())
        }
        drop(self.cwd.take());
    }

    /// # 功能说明
    /// 调整进程的用户内存大小。正数扩展，负数收缩。
    ///
    /// # 返回值
    /// - `Ok(usize)`：调整前的大小。
    /// - `Err(())`：分配失败，或收缩超过了当前大小。
    pub fn sbrk(&mut self, increment: i32) -> Result<usize, ()> {
        let old_size = self.sz;
        if increment > 0 {
            let new_size = old_size + (increment as usize);
            self.pagetable_mut().grow(old_size, new_size)?;
            self.sz = new_size;
        } else if increment < 0 {
            let new_size = old_size.checked_sub(increment.unsigned_abs() as usize).ok_or(())?;
            self.pagetable_mut().shrink(old_size, new_size);
            self.sz = new_size;
        }
        Ok(old_size)
    }

    /// 处理一个送达的时钟 tick，返回是否开始了一次 alarm 回调
    pub fn alarm_tick(&mut self) -> bool {
        let tf = match self.tf.as_deref_mut() {
            Some(tf) => tf,
            None => panic!("process has no trapframe"),
        };
        self.alarm.tick(tf)
    }

    /// 结束 alarm 回调，恢复被打断时的用户寄存器
    pub fn alarm_restore(&mut self) -> bool {
        let tf = match self.tf.as_deref_mut() {
            Some(tf) => tf,
            None => panic!("process has no trapframe"),
        };
        self.alarm.restore(tf)
    }

    /// # 功能说明
    /// 释放进程私有数据中的资源，槽位回收或初始化失败时调用。
    ///
    /// # 流程解释
    /// 1. 清空进程名称。
    /// 2. 释放陷阱帧。
    /// 3. 释放用户地址空间及其中的用户内存，重置内存大小。
    /// 4. 清空 alarm 状态。
    pub fn cleanup(&mut self) {
        self.name = [0; PROC_NAME_LEN];
        drop(self.tf.take());
        if let Some(mut pgt) = self.pagetable.take() {
            pgt.release(self.sz);
        }
        self.sz = 0;
        self.alarm.reset();
    }
}

/// 进程结构体，代表操作系统内核中的一个进程槽位。
///
/// - `excl` 中的字段可能被其他 hart 上的执行流读写，访问前必须持有锁；
/// - `data` 中的字段只由进程自己，或在进程不可调度时由分配者、回收者访问。
pub struct Proc {
    /// 进程在进程表中的索引，唯一标识该进程槽位。
    index: usize,
    /// 进程排它锁保护的状态信息，包括状态、pid、等待通道等。
    pub excl: SpinLock<ProcExcl>,
    /// 进程私有数据，包含内存、上下文、文件描述符等。
    data: UnsafeCell<ProcData>,
}

// 跨 hart 共享的字段都在 `excl` 中，由锁保护
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            excl: SpinLock::new_ranked(ProcExcl::new(), "proc", LockRank::Proc),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// 进程私有数据的可变引用
    ///
    /// # 安全性
    /// 调用者必须是该进程自己，或者进程此时不可能被调度（`USED`、`ZOMBIE`
    /// 或被回收过程持有锁）。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        &mut *self.data.get()
    }

    /// 保存上下文的位置，交给 `swtch` 使用
    pub fn context_ptr(&self) -> *mut Context {
        unsafe { &mut (*self.data.get()).context as *mut Context }
    }

    /// 其它进程在这个进程上睡眠时使用的通道，例如等待它的子进程退出
    #[inline]
    pub fn wait_channel(&self) -> usize {
        self as *const Proc as usize
    }

    pub fn pid(&self) -> usize {
        self.excl.lock().pid
    }

    pub fn state(&self) -> ProcState {
        self.excl.lock().state()
    }

    pub fn channel(&self) -> usize {
        self.excl.lock().channel
    }

    pub fn exit_status(&self) -> i32 {
        self.excl.lock().exit_status
    }

    pub fn killed(&self) -> bool {
        self.excl.lock().killed
    }

    /// 只设置终止标志，不改变状态
    pub fn set_killed(&self) {
        self.excl.lock().killed = true;
    }

    /// 如果 killed 标志为 true，则终止当前进程
    pub fn exit_if_killed(&self, pm: &ProcManager) {
        if self.killed() {
            pm.exiting(self.index, KILLED_EXIT_STATUS);
        }
    }

    /// 通过以下方式终止当前进程：
    /// 1. 将其 killed 标志设置为 true
    /// 2. 然后退出
    pub fn abondon(&self, pm: &ProcManager, exit_status: i32) -> ! {
        self.set_killed();
        pm.exiting(self.index, exit_status);
    }

    /// # 功能说明
    /// 让出当前进程的 CPU 使用权，将进程状态从 `RUNNING` 改为 `RUNNABLE`，
    /// 并切换回调度器，以便其他进程获得执行机会。
    ///
    /// # 可能的错误
    /// - 若进程当前状态不是 `RUNNING`，会导致内核 panic。
    pub fn yielding(&self) {
        let mut guard = self.excl.lock();
        assert_eq!(guard.state(), ProcState::RUNNING);
        guard.set_state(ProcState::RUNNABLE);
        guard = unsafe { CPU_MANAGER.sched(guard, self.context_ptr()) };
        drop(guard);
    }

    /// # 功能说明
    /// 原子地释放传入的自旋锁（非进程自身的锁），使当前进程在 `channel` 上睡眠，
    /// 等待被唤醒。返回时不会重新获取传入的锁，调用者需要时自行获取。
    ///
    /// # 流程解释
    /// 1. 先获取进程自身的锁，再释放传入的锁。
    ///    唤醒者必须获取进程锁才能检查状态，因此在这之间不会丢失唤醒。
    /// 2. 设置等待通道，状态改为 `SLEEPING`，切换到调度器。
    /// 3. 被唤醒并再次调度后清空等待通道，释放进程锁。
    ///
    /// # 可能的错误
    /// - 传入的 `guard` 若为进程自身的锁，会在重复获取时 panic。
    pub fn sleep<T>(&self, channel: usize, guard: SpinLockGuard<'_, T>) {
        let mut excl_guard = self.excl.lock();
        drop(guard);

        // 进入睡眠
        excl_guard.channel = channel;
        excl_guard.set_state(ProcState::SLEEPING);

        excl_guard = unsafe { CPU_MANAGER.sched(excl_guard, self.context_ptr()) };

        excl_guard.channel = 0;
        drop(excl_guard);
    }

    /// 送达一个时钟 tick 给 alarm 子系统
    ///
    /// 只能在进程自己的内核上下文中调用（用户态时钟陷阱），
    /// 这时没有别的 hart 会访问它的私有数据。
    pub(crate) fn alarm_tick(&self) -> bool {
        unsafe { self.data_mut().alarm_tick() }
    }

    /// # 功能说明
    /// 结束一次 alarm 回调：把保存的用户寄存器放回陷阱帧。
    /// 整个恢复过程关闭中断，不会与时钟 tick 交错。
    ///
    /// # 返回值
    /// 恢复后的 `a0`，系统调用把它原样作为返回值写回，不会破坏被打断时的 `a0`。
    ///
    /// 与 [`Proc::alarm_tick`] 一样只在进程自己的上下文中调用。
    pub(crate) fn alarm_restore(&self) -> usize {
        push_off();
        let pd = unsafe { self.data_mut() };
        pd.alarm_restore();
        let a0 = pd.tf().a0;
        pop_off();
        a0
    }

    /// # 功能说明
    /// 创建当前进程的一个子进程，
    /// 复制父进程的用户内存、陷阱帧、打开文件、当前工作目录和名称，
    /// 并将子进程状态设置为可运行。alarm 状态不会被继承。
    ///
    /// # 返回值
    /// - `Ok(usize)`：子进程的进程 ID。
    /// - `Err(())`：分配子进程或复制内存失败，此时子进程槽位已回滚为空闲。
    pub fn fork(&self, pm: &ProcManager) -> Result<usize, ()> {
        let pdata = unsafe { self.data_mut() };
        let child = pm.alloc_proc().map_err(|_| ())?;
        let mut cexcl = child.excl.lock();
        let cdata = unsafe { child.data_mut() };

        // 克隆内存
        let size = pdata.sz;
        if pdata.pagetable().duplicate_into(cdata.pagetable_mut(), size).is_err() {
            cdata.cleanup();
            cexcl.cleanup();
            return Err(())
        }
        cdata.sz = size;

        // 克隆陷阱帧并在 a0 寄存器上返回 0
        cdata.tf_mut().clone_from(pdata.tf());
        cdata.tf_mut().a0 = 0;

        // 克隆已打开的文件和当前工作目录
        cdata.open_files.clone_from(&pdata.open_files);
        cdata.cwd.clone_from(&pdata.cwd);

        cdata.name = pdata.name;

        let cpid = cexcl.pid;

        drop(cexcl);

        pm.set_parent(child.index, self.index);

        let mut cexcl = child.excl.lock();
        cexcl.set_state(ProcState::RUNNABLE);
        drop(cexcl);

        Ok(cpid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{self, HartLease};

    #[test]
    fn legal_transitions() {
        use ProcState::*;
        let all = [UNUSED, USED, SLEEPING, RUNNABLE, RUNNING, ZOMBIE];
        let legal = [
            (UNUSED, USED),
            (USED, RUNNABLE),
            (USED, UNUSED),
            (RUNNABLE, RUNNING),
            (RUNNING, RUNNABLE),
            (RUNNING, SLEEPING),
            (RUNNING, ZOMBIE),
            (SLEEPING, RUNNABLE),
            (ZOMBIE, UNUSED),
        ];
        for &from in all.iter() {
            for &to in all.iter() {
                assert_eq!(from.can_become(to), legal.contains(&(from, to)),
                    "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    #[should_panic(expected = "illegal process state transition")]
    fn runnable_cannot_sleep() {
        let mut excl = ProcExcl::new();
        excl.set_state(ProcState::USED);
        excl.set_state(ProcState::RUNNABLE);
        excl.set_state(ProcState::SLEEPING);
    }

    #[test]
    #[should_panic(expected = "illegal process state transition")]
    fn unused_slot_cannot_be_scheduled() {
        let mut excl = ProcExcl::new();
        excl.set_state(ProcState::RUNNING);
    }

    #[test]
    fn cleanup_returns_slot_to_unused() {
        let mut excl = ProcExcl::new();
        excl.set_state(ProcState::USED);
        excl.pid = 9;
        excl.killed = true;
        excl.cleanup();
        assert_eq!(excl.state(), ProcState::UNUSED);
        assert_eq!(excl.pid, 0);
        assert!(!excl.killed);
    }

    #[test]
    fn name_is_truncated_and_terminated() {
        let mut pd = ProcData::new();
        pd.set_name(b"initcode");
        assert_eq!(pd.name(), "initcode");
        pd.set_name(b"a-very-long-process-name");
        assert_eq!(pd.name().len(), PROC_NAME_LEN - 1);
        assert_eq!(pd.name(), "a-very-long-pro");
    }

    #[test]
    fn descriptor_table_allocates_lowest_free_slot() {
        let mut pd = ProcData::new();
        let file = testing::test_file();
        assert_eq!(pd.alloc_fd(file.clone()), Some(0));
        assert_eq!(pd.alloc_fd(file.clone()), Some(1));
        assert_eq!(pd.dup_fd(0), Some(2));
        assert!(pd.close_fd(1).is_some());
        assert_eq!(pd.alloc_fd(file.clone()), Some(1));
        assert!(pd.close_fd(NOFILE).is_none());
        assert!(pd.dup_fd(7).is_none());

        for _ in 3..NOFILE {
            assert!(pd.alloc_fd(file.clone()).is_some());
        }
        assert_eq!(pd.alloc_fd(file.clone()), None);

        pd.close_files();
        assert!(pd.file(0).is_none());
        assert_eq!(Arc::strong_count(&file), 1);
    }

    #[test]
    fn sbrk_grows_and_shrinks_user_memory() {
        let _hart = HartLease::acquire();
        let pm = testing::new_manager();
        let p = pm.alloc_proc().unwrap();
        let pd = unsafe { p.data_mut() };

        assert_eq!(pd.sbrk(2 * PGSIZE as i32), Ok(0));
        assert_eq!(pd.sz, 2 * PGSIZE);
        assert_eq!(pd.sbrk(-(PGSIZE as i32)), Ok(2 * PGSIZE));
        assert_eq!(pd.sz, PGSIZE);
        assert_eq!(pd.sbrk(0), Ok(PGSIZE));
        assert_eq!(pd.sbrk(-(2 * PGSIZE as i32)), Err(()));
        assert_eq!(pd.sz, PGSIZE);
    }

    #[test]
    fn fork_copies_memory_registers_and_files_but_not_alarm() {
        let _hart = HartLease::acquire();
        let pm = testing::new_manager();
        let init = pm.alloc_proc().unwrap();
        let parent = pm.alloc_proc().unwrap();
        pm.set_parent(parent.index(), init.index());

        let pd = unsafe { parent.data_mut() };
        pd.sbrk(PGSIZE as i32).unwrap();
        pd.copy_out(0x80, b"hello").unwrap();
        pd.tf_mut().epc = 0x1234;
        pd.tf_mut().a0 = 77;
        pd.tf_mut().s3 = 0x5353;
        pd.set_name(b"sh");
        pd.alloc_fd(testing::test_file()).unwrap();
        pd.alarm_mut().configure(3, 0x400);

        let cpid = parent.fork(pm).unwrap();
        let child = pm.proc(2);
        assert_eq!(child.pid(), cpid);
        assert_ne!(cpid, parent.pid());
        assert_eq!(child.state(), ProcState::RUNNABLE);
        assert_eq!(pm.parent_of(child.index()), Some(parent.index()));

        let cd = unsafe { child.data_mut() };
        assert_eq!(cd.sz, PGSIZE);
        let mut buf = [0u8; 5];
        cd.copy_in(0x80, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        assert_eq!(cd.tf().epc, 0x1234);
        assert_eq!(cd.tf().s3, 0x5353);
        assert_eq!(cd.tf().a0, 0);
        assert_eq!(pd.tf().a0, 77);
        assert_eq!(cd.name(), "sh");
        assert!(cd.file(0).is_some());
        assert_eq!(cd.alarm().interval(), 0);
    }

    #[test]
    fn failed_fork_rolls_the_child_slot_back() {
        let _hart = HartLease::acquire();
        let pm = testing::new_manager();
        let parent = pm.alloc_proc().unwrap();
        let pd = unsafe { parent.data_mut() };
        pd.sbrk(PGSIZE as i32).unwrap();
        // 声称的大小超出了地址空间的上限，复制必然失败
        pd.sz = testing::SPACE_LIMIT + PGSIZE;

        assert_eq!(parent.fork(pm), Err(()));
        let slot = pm.proc(1);
        assert_eq!(slot.state(), ProcState::UNUSED);
        assert_eq!(slot.pid(), 0);
        assert_eq!(pm.parent_of(1), None);

        // 槽位可以再次使用
        let again = pm.alloc_proc().unwrap();
        assert_eq!(again.index(), 1);
    }

    #[test]
    fn kill_flag_alone_does_not_change_state() {
        let _hart = HartLease::acquire();
        let pm = testing::new_manager();
        let p = pm.alloc_proc().unwrap();
        p.set_killed();
        assert!(p.killed());
        assert_eq!(p.state(), ProcState::USED);
    }
}
