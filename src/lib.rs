//! 多核教学内核的进程执行核心：进程控制块、硬件线程描述符、陷阱帧协议、
//! 内核上下文切换约定、进程生命周期状态机以及周期性 alarm 回调。

#![cfg_attr(target_os = "none", no_std)]
#![allow(dead_code)]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate bitflags;

extern crate alloc;

#[macro_use]
pub mod printf;

pub mod arch;
pub mod consts;
pub mod env;
pub mod process;
pub mod register;
pub mod spinlock;
pub mod trap;

#[cfg(test)]
mod testing;

pub use env::{AddressSpace, File, Inode, KernelEnv};
pub use process::{AllocError, CpuManager, Proc, ProcManager, ProcState, CPU_MANAGER};
pub use process::{Context, TrapFrame, UserRegs};
pub use trap::TrapCause;
