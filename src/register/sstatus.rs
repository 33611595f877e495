//! 监督状态寄存器 (sstatus) 操作模块

bitflags! {
    /// sstatus 中内核关心的位
    pub struct Sstatus: usize {
        /// supervisor interrupt enable
        const SIE = 1 << 1;
        /// supervisor previous interrupt enable
        const SPIE = 1 << 5;
        /// previous mode, is from supervisor?
        const SPP = 1 << 8;
    }
}

impl Sstatus {
    /// 返回用户态前需要的 sstatus：清除 SPP（回到用户模式），
    /// 置位 SPIE（进入用户态后开启中断）。
    #[inline]
    pub fn user_ret(self) -> Self {
        (self - Sstatus::SPP) | Sstatus::SPIE
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::csr::*;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod csr {
    use core::arch::asm;

    use super::Sstatus;

    #[inline]
    pub fn read() -> usize {
        let ret: usize;
        unsafe {asm!("csrr {}, sstatus", out(reg) ret);}
        ret
    }

    #[inline]
    pub fn write(x: usize) {
        unsafe {asm!("csrw sstatus, {}", in(reg) x);}
    }

    #[inline]
    fn flags() -> Sstatus {
        Sstatus::from_bits_truncate(read())
    }

    #[inline]
    pub fn intr_on() {
        write(read() | Sstatus::SIE.bits());
    }

    #[inline]
    pub fn intr_off() {
        write(read() & !Sstatus::SIE.bits());
    }

    #[inline]
    pub fn intr_get() -> bool {
        flags().contains(Sstatus::SIE)
    }

    #[inline]
    pub fn is_from_supervisor() -> bool {
        flags().contains(Sstatus::SPP)
    }

    #[inline]
    pub fn is_from_user() -> bool {
        !is_from_supervisor()
    }

    /// 设置下一次 sret 返回用户模式并在用户态开启中断
    #[inline]
    pub fn user_ret_prepare() {
        let keep = read() & !Sstatus::all().bits();
        write(keep | flags().user_ret().bits());
    }
}

#[cfg(test)]
mod tests {
    use super::Sstatus;

    #[test]
    fn user_ret_clears_spp_and_sets_spie() {
        let s = Sstatus::SPP | Sstatus::SIE;
        let r = s.user_ret();
        assert!(!r.contains(Sstatus::SPP));
        assert!(r.contains(Sstatus::SPIE));
        assert!(r.contains(Sstatus::SIE));
        assert_eq!(Sstatus::from_bits_truncate(0x122), Sstatus::all());
    }
}
