//! 定义操作所需RISC-V寄存器的接口
//!
//! 只有 [`sstatus`] 的位定义是平台无关的，宿主机上的硬件线程模拟也使用它；
//! 其余 CSR 访问只在 riscv64 裸机目标上编译。

pub mod sstatus;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod satp {
    #[inline]
    pub fn read() -> usize {
        let ret;
        unsafe {
            core::arch::asm!("csrr {}, satp", out(reg) ret);
        }
        ret
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod scause {
    #[inline]
    pub fn read() -> usize {
        let ret: usize;
        unsafe {core::arch::asm!("csrr {}, scause", out(reg) ret);}
        ret
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod tp {
    pub unsafe fn read() -> usize {
        let ret: usize;
        core::arch::asm!("mv {}, tp",out(reg)ret);
        ret
    }
}

/// 监督陷阱向量基址寄存器 (stvec) 操作
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod stvec {
    /// 设置 stvec 寄存器值
    ///
    /// # 安全性
    /// `stvec` 必须是一个有效的陷阱入口地址。
    pub unsafe fn write(stvec: usize) {
        core::arch::asm!("csrw stvec, {}", in(reg)stvec);
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod sepc {
    pub fn read() -> usize {
        let ret: usize;
        unsafe {core::arch::asm!("csrr {}, sepc", out(reg)ret);}
        ret
    }

    pub fn write(sepc: usize) {
        unsafe {core::arch::asm!("csrw sepc, {}", in(reg)sepc);}
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod sip {
    const SSIP: usize = 1 << 1;

    /// 清除监督者软件中断的挂起位，确认已处理转发来的时钟中断
    pub fn clear_ssip() {
        unsafe { core::arch::asm!("csrc sip, {}", in(reg) SSIP); }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod stval {
    pub fn read() -> usize {
        let ret: usize;
        unsafe { core::arch::asm!("csrr {}, stval", out(reg)ret);}
        ret
    }
}
