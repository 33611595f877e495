//! 进程核心依赖的外部子系统
//!
//! 物理内存与页表、文件系统、设备中断以及跳板代码都不属于进程核心，
//! 这里只规定进程核心需要它们提供的操作。

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cmp;

/// 一个进程的用户地址空间
pub trait AddressSpace: Send {
    /// 切换到该地址空间时写入 satp 的值
    fn satp(&self) -> usize;

    /// 把 `src` 复制到用户虚拟地址 `dst`
    fn copy_out(&mut self, dst: usize, src: &[u8]) -> Result<(), ()>;

    /// 从用户虚拟地址 `src` 读取 `dst.len()` 字节
    fn copy_in(&self, src: usize, dst: &mut [u8]) -> Result<(), ()>;

    /// 把用户内存从 `old_size` 扩展到 `new_size`，新内存清零
    fn grow(&mut self, old_size: usize, new_size: usize) -> Result<(), ()>;

    /// 把用户内存从 `old_size` 收缩到 `new_size`
    fn shrink(&mut self, old_size: usize, new_size: usize);

    /// 释放全部 `size` 字节的用户内存和页表本身
    fn release(&mut self, size: usize);

    /// # 功能说明
    /// 把前 `size` 字节的用户内存复制到 `child` 中，用于 fork。
    ///
    /// 默认实现先扩展 `child`，再分块拷贝内容；
    /// 具体实现可以换成直接复制页表项。
    fn duplicate_into(&self, child: &mut dyn AddressSpace, size: usize) -> Result<(), ()> {
        const CHUNK: usize = 512;

        child.grow(0, size)?;
        let mut buf = [0u8; CHUNK];
        let mut va = 0;
        while va < size {
            let n = cmp::min(CHUNK, size - va);
            self.copy_in(va, &mut buf[..n])?;
            child.copy_out(va, &buf[..n])?;
            va += n;
        }
        Ok(())
    }
}

/// 打开的文件，进程只持有引用
pub trait File: Send + Sync {}

/// 目录项，进程用它记录当前工作目录
pub trait Inode: Send + Sync {}

/// 内核其余部分提供给进程核心的服务
pub trait KernelEnv: Sync {
    /// 槽位 `slot` 的内核栈起始地址，栈大小为 `KSTACK_PAGES` 页
    fn kernel_stack(&self, slot: usize) -> usize;

    /// 为新进程创建用户地址空间，`trapframe` 是陷阱帧所在的地址。
    /// 内存不足时返回 `None`。
    fn create_address_space(&self, trapframe: usize) -> Option<Box<dyn AddressSpace>>;

    /// 把第一个用户程序装入 `pagetable`，返回用户内存大小
    fn load_init(&self, pagetable: &mut dyn AddressSpace) -> usize;

    /// 根目录
    fn root_dir(&self) -> Option<Arc<dyn Inode>>;

    /// 文件系统初始化，第一个进程开始运行时在进程上下文中调用一次
    fn fs_init(&self);

    /// 用户态陷入内核时的处理入口地址
    fn kernel_trap_entry(&self) -> usize;

    /// 内核态的陷阱向量（kernelvec），进入内核后立即写入 stvec
    fn kernel_trap_vector(&self) -> usize;

    /// 跳板页中用户态陷阱向量（uservec）的虚拟地址，返回用户态前写入 stvec
    fn user_trap_vector(&self) -> usize;

    /// 处理一次外部设备中断
    fn device_interrupt(&self);

    /// 经由跳板代码回到用户态，从 `epc` 开始执行，使用页表 `satp`
    ///
    /// # 安全性
    /// 当前进程的陷阱帧必须已经由 `user_ret_prepare` 填好。
    unsafe fn return_to_user(&self, epc: usize, satp: usize) -> !;
}
