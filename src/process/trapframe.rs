//! 定义用户进程的陷阱帧（Trap Frame）

/// 用户进程的陷阱帧，每个进程一页。
///
/// 该结构体保存用户态程序在发生陷阱（系统调用、中断、异常）时的 CPU 寄存器上下文，
/// 用于内核在进入和返回用户态时保存和恢复用户进程状态。
///
/// 跳板代码按固定偏移读写这里：先是内核恢复元数据，再是通用寄存器。
/// 由于返回用户态时并不沿着触发它的内核调用栈逐层返回，
/// 陷阱帧必须独立保存恢复用户执行所需的全部寄存器，包括 s0-s11 这类被调用者保存寄存器。
#[repr(C, align(4096))]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    /// 内核页表的物理页目录基址 (SATP寄存器值)
    /*   0 */ pub kernel_satp: usize,   // 内核页表

    /// 进程内核栈的栈顶虚拟地址
    /*   8 */ pub kernel_sp: usize,     // 进程内核栈的栈顶

    /// 内核陷阱处理函数地址（如 `usertrap`）
    /*  16 */ pub kernel_trap: usize,   // usertrap()

    /// 用户程序计数器（程序执行到的下一条指令地址）
    /*  24 */ pub epc: usize,           // 保存的用户程序计数器

    /// 内核线程指针寄存器（`tp`），保存当前 CPU ID
    /*  32 */ pub kernel_hartid: usize, // 保存的内核线程指针（tp）
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            kernel_satp: 0, kernel_sp: 0, kernel_trap: 0, epc: 0, kernel_hartid: 0,
            ra: 0, sp: 0, gp: 0, tp: 0, t0: 0, t1: 0, t2: 0, s0: 0, s1: 0,
            a0: 0, a1: 0, a2: 0, a3: 0, a4: 0, a5: 0, a6: 0, a7: 0,
            s2: 0, s3: 0, s4: 0, s5: 0, s6: 0, s7: 0, s8: 0, s9: 0, s10: 0, s11: 0,
            t3: 0, t4: 0, t5: 0, t6: 0,
        }
    }

    /// 跳过 `ecall` 指令，系统调用返回后从下一条指令继续
    #[inline]
    pub fn admit_ecall(&mut self) {
        self.epc += 4;
    }

    /// 读取第 `n` 个系统调用参数寄存器（a0-a5）
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("arg(): n is larger than 5"),
        }
    }

    /// 系统调用号所在的寄存器
    #[inline]
    pub fn syscall_num(&self) -> usize {
        self.a7
    }
}

/// 由寄存器名列表同时生成 [`UserRegs`] 以及陷阱帧与它之间的保存、恢复，
/// 保证两边覆盖的字段始终一致。
macro_rules! user_register_file {
    ($($reg:ident),* $(,)?) => {
        /// 陷阱帧中的用户寄存器文件：用户程序计数器和全部通用寄存器。
        ///
        /// 不包含内核恢复元数据（kernel_satp、kernel_sp、kernel_trap、kernel_hartid），
        /// 它们归内核所有，从不参与面向用户的保存与恢复。
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct UserRegs {
            $(pub $reg: usize,)*
        }

        impl TrapFrame {
            /// 拍下当前的用户寄存器文件
            pub fn user_regs(&self) -> UserRegs {
                UserRegs { $($reg: self.$reg,)* }
            }

            /// 用 `regs` 覆盖用户寄存器文件，内核恢复元数据保持不变
            pub fn set_user_regs(&mut self, regs: &UserRegs) {
                $(self.$reg = regs.$reg;)*
            }
        }
    };
}

user_register_file!(
    epc,
    ra, sp, gp, tp,
    t0, t1, t2,
    s0, s1,
    a0, a1, a2, a3, a4, a5, a6, a7,
    s2, s3, s4, s5, s6, s7, s8, s9, s10, s11,
    t3, t4, t5, t6,
);

#[cfg(test)]
mod tests {
    use core::mem::offset_of;

    use super::*;

    fn patterned() -> UserRegs {
        // 每个寄存器一个不同的值
        let mut x: usize = 0x9e37_79b9_7f4a_7c15;
        let mut next = || {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            x
        };
        UserRegs {
            epc: next(), ra: next(), sp: next(), gp: next(), tp: next(),
            t0: next(), t1: next(), t2: next(), s0: next(), s1: next(),
            a0: next(), a1: next(), a2: next(), a3: next(), a4: next(), a5: next(),
            a6: next(), a7: next(), s2: next(), s3: next(), s4: next(), s5: next(),
            s6: next(), s7: next(), s8: next(), s9: next(), s10: next(), s11: next(),
            t3: next(), t4: next(), t5: next(), t6: next(),
        }
    }

    #[test]
    fn layout_matches_trampoline_offsets() {
        assert_eq!(offset_of!(TrapFrame, kernel_satp), 0);
        assert_eq!(offset_of!(TrapFrame, kernel_sp), 8);
        assert_eq!(offset_of!(TrapFrame, kernel_trap), 16);
        assert_eq!(offset_of!(TrapFrame, epc), 24);
        assert_eq!(offset_of!(TrapFrame, kernel_hartid), 32);
        assert_eq!(offset_of!(TrapFrame, ra), 40);
        assert_eq!(offset_of!(TrapFrame, a0), 112);
        assert_eq!(offset_of!(TrapFrame, a7), 168);
        assert_eq!(offset_of!(TrapFrame, s2), 176);
        assert_eq!(offset_of!(TrapFrame, s11), 248);
        assert_eq!(offset_of!(TrapFrame, t6), 280);
        assert_eq!(core::mem::align_of::<TrapFrame>(), 4096);
    }

    #[test]
    fn restore_of_save_is_identity() {
        let regs = patterned();
        let mut tf = TrapFrame::new();
        tf.set_user_regs(&regs);
        let saved = tf.user_regs();

        tf.set_user_regs(&UserRegs::default());
        assert_eq!(tf.user_regs(), UserRegs::default());

        tf.set_user_regs(&saved);
        assert_eq!(tf.user_regs(), regs);
    }

    #[test]
    fn user_restore_leaves_kernel_fields_alone() {
        let mut tf = TrapFrame::new();
        tf.kernel_satp = 0x8000_0000_0008_0000;
        tf.kernel_sp = 0x3f_ffff_e000;
        tf.kernel_trap = 0x8000_2000;
        tf.kernel_hartid = 3;

        tf.set_user_regs(&patterned());

        assert_eq!(tf.kernel_satp, 0x8000_0000_0008_0000);
        assert_eq!(tf.kernel_sp, 0x3f_ffff_e000);
        assert_eq!(tf.kernel_trap, 0x8000_2000);
        assert_eq!(tf.kernel_hartid, 3);
    }

    #[test]
    fn ecall_advances_epc_and_args_read_a_registers() {
        let mut tf = TrapFrame::new();
        tf.epc = 0x1000;
        tf.a0 = 5;
        tf.a1 = 0x2000;
        tf.a7 = 22;
        tf.admit_ecall();
        assert_eq!(tf.epc, 0x1004);
        assert_eq!(tf.arg(0), 5);
        assert_eq!(tf.arg(1), 0x2000);
        assert_eq!(tf.syscall_num(), 22);
    }
}
