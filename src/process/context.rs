//! 内核上下文切换时保存的寄存器

/// 内核执行流之间协作式切换所需的寄存器现场。
///
/// 只包含返回地址、栈指针和被调用者保存寄存器 s0-s11：
/// `swtch` 以普通函数调用的形式出现，调用者保存寄存器在调用点已被视为破坏。
/// 布局被 `swtch` 按固定偏移读写，不可调整字段顺序。
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /*   0 */ pub ra: usize,
    /*   8 */ pub sp: usize,

    // callee-saved
    /*  16 */ pub s0: usize,
    /*  24 */ pub s1: usize,
    /*  32 */ pub s2: usize,
    /*  40 */ pub s3: usize,
    /*  48 */ pub s4: usize,
    /*  56 */ pub s5: usize,
    /*  64 */ pub s6: usize,
    /*  72 */ pub s7: usize,
    /*  80 */ pub s8: usize,
    /*  88 */ pub s9: usize,
    /*  96 */ pub s10: usize,
    /* 104 */ pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// 设置 `swtch` 返回后跳转的地址
    pub fn set_ra(&mut self, ra: usize) {
        self.ra = ra;
    }

    pub fn set_sp(&mut self, sp: usize) {
        self.sp = sp;
    }
}

#[cfg(test)]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::Context;

    #[test]
    fn layout_matches_swtch_offsets() {
        assert_eq!(offset_of!(Context, ra), 0);
        assert_eq!(offset_of!(Context, sp), 8);
        assert_eq!(offset_of!(Context, s0), 16);
        assert_eq!(offset_of!(Context, s11), 104);
        assert_eq!(size_of::<Context>(), 14 * 8);
    }

    #[test]
    fn clear_resets_entry() {
        let mut c = Context::new();
        c.set_ra(0x8000_1000);
        c.set_sp(0x3f_ffff_f000);
        c.s5 = 7;
        c.clear();
        assert_eq!(c, Context::new());
    }
}
