//! 机器相关的最小边界
//!
//! 进程核心的其余部分只通过这里的几个函数接触硬件：
//! 读取当前 hart 编号、开关中断、读取内核页表、设置陷阱向量以及 [`swtch`] 上下文切换。
//! riscv64 裸机目标上它们是 CSR 访问和一段汇编；宿主机上则由
//! [`hosted`] 用宿主线程模拟，供测试驱动调度器和进程内核线程。

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod riscv;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::riscv::*;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod hosted;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use self::hosted::{hart_id, intr_get, intr_off, intr_on, read_satp, retire_context, swtch, write_stvec};
