//! riscv64 裸机实现

use core::arch::global_asm;

use crate::process::Context;
use crate::register::{satp, sstatus, stvec, tp};

// 保存 ra、sp 与 s0-s11 到 old，再从 new 载入。
// 偏移必须与 Context 的 #[repr(C)] 布局一致。
global_asm!(
    r#"
    .section .text
    .globl __swtch
__swtch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)

    ret
"#
);

extern "C" {
    fn __swtch(old: *mut Context, new: *const Context);
}

/// 必须在禁用中断的情况下调用，
/// 以防止与进程被迁移到另一个 CPU 时出现竞争条件。
#[inline]
pub unsafe fn hart_id() -> usize {
    // explicitly use tp::read here
    tp::read()
}

#[inline]
pub fn intr_on() {
    sstatus::intr_on();
}

#[inline]
pub fn intr_off() {
    sstatus::intr_off();
}

#[inline]
pub fn intr_get() -> bool {
    sstatus::intr_get()
}

#[inline]
pub fn read_satp() -> usize {
    satp::read()
}

/// 设置陷阱向量基址
#[inline]
pub fn write_stvec(addr: usize) {
    unsafe { stvec::write(addr); }
}

/// 裸机上被换出的现场没有额外的记录需要清理
#[inline]
pub fn retire_context(_ctx: &Context) {}

/// 保存调用者的被调用者保存寄存器到 `old`，从 `new` 恢复并跳转到其 `ra`。
///
/// # 安全性
/// 两个指针都必须指向有效的 [`Context`]；`new` 必须是某个内核执行流
/// 此前由 `swtch` 保存的现场，或由 `init_context` 构造的入口现场。
#[inline]
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    __swtch(old, new);
}
