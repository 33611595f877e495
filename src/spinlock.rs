//! 自旋锁模块
//! 自旋锁将数据包裹在自身内部以保护这些数据。

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut, Drop};
use core::sync::atomic::{fence, AtomicBool, AtomicIsize, Ordering};

use crate::process::{pop_off, push_off, CPU_MANAGER};

/// 锁在全局加锁顺序中的类别。
///
/// 进程核心只有一条跨锁的顺序约束：等待锁（父子关系）必须先于任何进程锁获取。
/// 持有进程锁时再去获取等待锁会直接 panic。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockRank {
    /// 不参与顺序检查的普通锁
    Plain,
    /// 全局唯一的等待锁，保护所有父子关系
    WaitLock,
    /// 单个进程控制块的锁
    Proc,
}

/// 表示一个自旋锁结构，用于在多核环境下保护共享数据。
///
/// `SpinLock` 提供了互斥访问内部数据的能力，通过忙等待（busy-waiting）实现锁机制。
/// 当锁被占用时，尝试获取锁的CPU将在循环中等待，直到锁被释放。
/// 该锁还跟踪持有锁的CPU ID，用于调试和死锁检测。
///
/// 锁的持有者是 hart 而不是某个执行流：进程可以持有自己的锁切换到调度器，
/// 由调度器在同一个 hart 上释放。
///
/// # 字段说明
/// - `lock`: 原子布尔值，表示锁的状态（`false`=未锁定，`true`=已锁定）；
/// - `name`: 锁的名称，用于调试和标识；
/// - `rank`: 加锁顺序类别；
/// - `cpuid`: 当前持有锁的CPU ID（-1表示无CPU持有）；
/// - `data`: 被保护的数据，通过`UnsafeCell`实现内部可变性。
#[derive(Debug)]
pub struct SpinLock<T: ?Sized> {
    lock: AtomicBool,
    name: &'static str,
    rank: LockRank,
    cpuid: AtomicIsize,
    data: UnsafeCell<T>,
}

// 为SpinLock实现Sync trait，允许跨线程共享（要求T是Send）
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// 创建一个新的自旋锁实例。
    ///
    /// # 参数
    /// - `data`: 需要被保护的数据；
    /// - `name`: 锁的标识名称，用于调试。
    pub const fn new(data: T, name: &'static str) -> Self {
        Self::new_ranked(data, name, LockRank::Plain)
    }

    /// 创建一个参与加锁顺序检查的自旋锁
    pub const fn new_ranked(data: T, name: &'static str, rank: LockRank) -> Self {
        Self {
            lock: AtomicBool::new(false),
            name,
            rank,
            cpuid: AtomicIsize::new(-1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// 获取自旋锁并返回一个守卫对象。
    ///
    /// 守卫对象实现了`Deref`和`DerefMut`，允许直接访问被保护数据。
    /// 当守卫对象离开作用域时，自动释放锁。
    ///
    /// # 示例
    /// ```ignore
    /// let lock = SpinLock::new(0, "test");
    /// {
    ///     let mut guard = lock.lock(); // 获取锁
    ///     *guard = 42; // 修改受保护数据
    /// } // 守卫离开作用域，自动释放锁
    /// ```
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard {
            lock: self,
            data: unsafe { &mut *self.data.get() },
        }
    }

    /// 检查当前CPU是否持有此锁。
    ///
    /// # 安全性
    /// 必须在禁用中断的上下文中调用。
    pub unsafe fn holding(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
            && self.cpuid.load(Ordering::Relaxed) == crate::arch::hart_id() as isize
    }

    /// 获取锁的核心实现（内部方法）。
    ///
    /// # 流程解释
    /// 1. 调用`push_off()`禁用中断；
    /// 2. 检查是否已持有锁（防止死锁）；
    /// 3. 检查加锁顺序；
    /// 4. 使用原子比较交换（CAS）忙等待获取锁；
    /// 5. 获取成功后设置内存屏障，记录当前CPU ID。
    fn acquire(&self) {
        push_off();
        if unsafe { self.holding() } {
            panic!("spinlock {} acquire", self.name);
        }
        if self.rank == LockRank::WaitLock && unsafe { CPU_MANAGER.my_cpu().proc_locks() } != 0 {
            panic!("spinlock {} acquired while holding a process lock", self.name);
        }
        while self.lock.compare_exchange(false, true,
            Ordering::Acquire, Ordering::Acquire).is_err() {
            core::hint::spin_loop();
        }
        fence(Ordering::SeqCst);
        unsafe {
            self.cpuid.store(crate::arch::hart_id() as isize, Ordering::Relaxed);
            if self.rank == LockRank::Proc {
                CPU_MANAGER.my_cpu_mut().proc_lock_acquired();
            }
        }
    }

    /// 释放锁的核心实现（内部方法）。
    fn release(&self) {
        if unsafe { !self.holding() } {
            panic!("spinlock {} release", self.name);
        }
        if self.rank == LockRank::Proc {
            unsafe { CPU_MANAGER.my_cpu_mut().proc_lock_released(); }
        }
        self.cpuid.store(-1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        self.lock.store(false, Ordering::Release);
        pop_off();
    }

    /// 手动释放锁的特殊接口。
    ///
    /// 用于特殊场景如`fork_ret()`：锁由调度器在切换前获取，守卫留在调度器的栈上。
    ///
    /// # 安全性
    /// - 调用者必须确保当前CPU确实持有该锁；
    /// - 释放后不得再访问受保护数据。
    pub unsafe fn unlock(&self) {
        self.release();
    }
}

/// 自旋锁守卫对象，提供对受保护数据的访问。
///
/// 当守卫对象存在时，表示锁已被持有。
/// 守卫离开作用域时自动释放锁，确保锁的释放。
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    data: &'a mut T,
}

impl<'a, T: ?Sized> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.data
    }
}

impl<'a, T: ?Sized> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.data
    }
}

impl<'a, T: ?Sized> Drop for SpinLockGuard<'a, T> {
    /// 当守卫离开作用域时自动释放锁，
    /// 并恢复中断状态（通过`pop_off`）
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// 检查当前CPU是否持有此锁。
    ///
    /// # 安全性
    /// 必须在禁用中断的上下文中调用。
    pub unsafe fn holding(&self) -> bool {
        self.lock.holding()
    }
}
