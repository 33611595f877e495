//! 进程的周期性 alarm 回调
//!
//! 进程通过 `sigalarm(interval, handler)` 登记一个间隔和处理函数入口。
//! 每个送达运行中进程的时钟 tick 都会计数；计数达到间隔、并且没有尚未结束的回调时，
//! 把当前用户寄存器文件存下来，把陷阱帧的返回地址改成处理函数入口。
//! 处理函数结束时调用 `sigreturn`，寄存器文件被原样放回，进程从被打断的位置继续。
//!
//! 回调尚未结束时到来的 tick 只计数、不触发，保存槽只有一个。

use crate::process::{TrapFrame, UserRegs};

/// 单个进程的 alarm 状态，属于进程私有数据，只在进程自己的上下文中访问。
#[derive(Debug)]
pub struct Alarm {
    /// 每隔多少个 tick 调用一次处理函数，0 表示未启用
    interval: usize,
    /// 处理函数在用户地址空间中的入口地址。
    /// 内核从不调用它，只把它写进陷阱帧的返回地址。
    handler: usize,
    /// 距上次触发以来的 tick 数
    ticks: usize,
    /// 被打断时的用户寄存器文件；`Some` 表示有一次回调尚未结束
    saved: Option<UserRegs>,
}

impl Alarm {
    pub const fn new() -> Self {
        Self {
            interval: 0,
            handler: 0,
            ticks: 0,
            saved: None,
        }
    }

    /// 登记新的间隔和处理函数并清零计数。
    ///
    /// 已经在进行中的回调不受影响，它仍可以通过 [`Alarm::restore`] 返回。
    pub fn configure(&mut self, interval: usize, handler: usize) {
        self.interval = interval;
        self.handler = handler;
        self.ticks = 0;
    }

    #[inline]
    pub fn interval(&self) -> usize {
        self.interval
    }

    #[inline]
    pub fn handler(&self) -> usize {
        self.handler
    }

    #[inline]
    pub fn ticks(&self) -> usize {
        self.ticks
    }

    /// 是否有一次回调尚未结束
    #[inline]
    pub fn outstanding(&self) -> bool {
        self.saved.is_some()
    }

    /// 回调开始时保存的寄存器文件
    #[inline]
    pub fn saved_frame(&self) -> Option<&UserRegs> {
        self.saved.as_ref()
    }

    /// # 功能说明
    /// 处理送达运行中进程的一个时钟 tick。
    ///
    /// # 流程解释
    /// 1. 未启用时直接返回。
    /// 2. 计数加一。
    /// 3. 若已有回调在进行，到此为止。
    /// 4. 计数达到间隔时保存寄存器文件，把 `epc` 改成处理函数入口并清零计数。
    ///
    /// # 返回值
    /// 本次 tick 是否开始了一次回调。
    pub fn tick(&mut self, tf: &mut TrapFrame) -> bool {
        if self.interval == 0 {
            return false
        }

        self.ticks += 1;
        if self.saved.is_some() || self.ticks < self.interval {
            return false
        }

        self.saved = Some(tf.user_regs());
        tf.epc = self.handler;
        self.ticks = 0;
        true
    }

    /// 回调结束：把保存的寄存器文件放回陷阱帧并清除进行中标志。
    /// 没有进行中的回调时什么也不做。
    ///
    /// # 返回值
    /// 是否真的恢复了寄存器。
    pub fn restore(&mut self, tf: &mut TrapFrame) -> bool {
        match self.saved.take() {
            Some(regs) => {
                tf.set_user_regs(&regs);
                true
            },
            None => false,
        }
    }

    /// 进程槽位回收时清空
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
