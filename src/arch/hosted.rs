//! 宿主机上的硬件线程模拟
//!
//! 每个内核执行流（进程的内核线程或某个 hart 上的调度器循环）都是一个宿主线程。
//! 宿主线程需先通过 [`bind_hart`] 绑定到一个 hart 编号，之后才能读取 hart 编号、
//! 开关“中断”或获取自旋锁。每个 hart 有一个模拟的 sstatus 字。
//!
//! [`swtch`] 与真实的汇编例程一样把现场写进 `old`：`ra` 槽写入 [`PARKED`]，
//! `sp` 槽写入一个唤醒令牌，然后把 hart 交给 `new` 对应的线程并挂起自己。
//! 若 `new.ra` 是一个真实的入口地址（从未被换出过，例如刚由 `init_context`
//! 构造），则在该 hart 上启动一个新线程执行这个入口。
//!
//! 被换出后再也不会恢复的现场（例如已退出的进程）对应的宿主线程会一直挂起。
//! 槽位被 `init_context` 重新初始化时，[`retire_context`] 把它从挂起表中移除，
//! 但那个线程本身不会结束，测试进程退出时才随之回收。

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use array_macro::array;

use crate::consts::NCPU;
use crate::process::Context;
use crate::register::sstatus::Sstatus;

/// 被换出的上下文在 `ra` 槽中保存的标记值
pub const PARKED: usize = usize::MAX;

thread_local! {
    static HART: Cell<Option<usize>> = Cell::new(None);
}

static SSTATUS: [AtomicUsize; NCPU] = array![_ => AtomicUsize::new(0); NCPU];

static STVEC: [AtomicUsize; NCPU] = array![_ => AtomicUsize::new(0); NCPU];

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

static PARKED_THREADS: Mutex<Vec<(usize, Arc<Baton>)>> = Mutex::new(Vec::new());

/// 交接 hart 所有权的接力棒
struct Baton {
    hart: Mutex<Option<usize>>,
    cv: Condvar,
}

impl Baton {
    fn new() -> Self {
        Self {
            hart: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn pass(&self, hart: usize) {
        let mut guard = self.hart.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(hart);
        self.cv.notify_one();
    }

    fn wait(&self) -> usize {
        let mut guard = self.hart.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(hart) = guard.take() {
                return hart
            }
            guard = self.cv.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// 把当前宿主线程绑定到 hart `id`
pub fn bind_hart(id: usize) {
    assert!(id < NCPU, "bind_hart(): hart {} out of range", id);
    HART.with(|h| h.set(Some(id)));
}

/// 解除当前宿主线程与 hart 的绑定
pub fn unbind_hart() {
    HART.with(|h| h.set(None));
}

/// 清除 hart `id` 的模拟 sstatus 和 stvec
pub fn reset_hart(id: usize) {
    SSTATUS[id].store(0, Ordering::SeqCst);
    STVEC[id].store(0, Ordering::SeqCst);
}

pub unsafe fn hart_id() -> usize {
    match HART.with(|h| h.get()) {
        Some(id) => id,
        None => panic!("hart_id(): host thread is not bound to a hart"),
    }
}

fn sstatus() -> &'static AtomicUsize {
    &SSTATUS[unsafe { hart_id() }]
}

pub fn intr_on() {
    sstatus().fetch_or(Sstatus::SIE.bits(), Ordering::SeqCst);
}

pub fn intr_off() {
    sstatus().fetch_and(!Sstatus::SIE.bits(), Ordering::SeqCst);
}

pub fn intr_get() -> bool {
    Sstatus::from_bits_truncate(sstatus().load(Ordering::SeqCst)).contains(Sstatus::SIE)
}

pub fn write_stvec(addr: usize) {
    STVEC[unsafe { hart_id() }].store(addr, Ordering::SeqCst);
}

/// 当前 hart 的模拟 stvec
pub fn read_stvec() -> usize {
    STVEC[unsafe { hart_id() }].load(Ordering::SeqCst)
}

/// 宿主机上没有内核页表
pub fn read_satp() -> usize {
    0
}

/// `ctx` 即将被重新初始化：若它是一个被换出的现场，丢弃对应的挂起记录
pub fn retire_context(ctx: &Context) {
    if ctx.ra != PARKED {
        return
    }
    let mut parked = PARKED_THREADS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(i) = parked.iter().position(|(t, _)| *t == ctx.sp) {
        drop(parked.swap_remove(i));
    }
}

/// 令牌 `token` 对应的线程是否仍在挂起表中
pub fn is_parked(token: usize) -> bool {
    PARKED_THREADS.lock().unwrap_or_else(|e| e.into_inner())
        .iter().any(|(t, _)| *t == token)
}

/// 模拟的上下文切换，见模块文档。
///
/// # 安全性
/// 与真实实现相同：`old` 与 `new` 必须指向有效的 [`Context`]，
/// 且 `new` 要么是被换出的现场，要么 `ra` 是一个 `unsafe fn() -> !` 入口。
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    let hart = hart_id();
    let new_ra = (*new).ra;
    let new_sp = (*new).sp;

    let me = Arc::new(Baton::new());
    let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
    let target = {
        let mut parked = PARKED_THREADS.lock().unwrap_or_else(|e| e.into_inner());
        let target = if new_ra == PARKED {
            match parked.iter().position(|(t, _)| *t == new_sp) {
                Some(i) => Some(parked.swap_remove(i).1),
                None => panic!("swtch(): no parked thread for token {}", new_sp),
            }
        } else {
            None
        };
        parked.push((token, me.clone()));
        (*old).ra = PARKED;
        (*old).sp = token;
        target
    };

    unbind_hart();
    match target {
        Some(baton) => baton.pass(hart),
        None => {
            let entry: unsafe fn() -> ! = core::mem::transmute(new_ra);
            thread::spawn(move || {
                bind_hart(hart);
                unsafe { entry(); }
            });
        }
    }

    let hart = me.wait();
    bind_hart(hart);
}
