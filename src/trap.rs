//! 中断处理模块，用户模式下发生中断或异常时进行处理

use bit_field::BitField;

use core::num::Wrapping;

use crate::consts::KILLED_EXIT_STATUS;
use crate::process::{CpuManager, Proc, ProcManager, CPU_MANAGER};

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::register::{scause, sepc, sip, sstatus, stval};

/// scause 最高位为 1 表示中断，否则为异常
const INTERRUPT_BIT: usize = usize::BIT_LENGTH - 1;

const SUPERVISOR_SOFTWARE: usize = 1;
const SUPERVISOR_TIMER: usize = 5;
const SUPERVISOR_EXTERNAL: usize = 9;
const USER_ECALL: usize = 8;

/// 进程核心区分的陷阱原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    /// 时钟中断。机器模式的计时器以监督者软件中断的形式转发过来
    Timer,
    /// 外部设备中断
    External,
    /// 用户态执行了 `ecall`
    UserEcall,
    /// 其他异常，携带原始的 scause
    Unknown(usize),
}

impl TrapCause {
    /// 解码 scause
    pub fn from_scause(scause: usize) -> Self {
        let code = scause.get_bits(0..INTERRUPT_BIT);
        if scause.get_bit(INTERRUPT_BIT) {
            match code {
                SUPERVISOR_SOFTWARE | SUPERVISOR_TIMER => TrapCause::Timer,
                SUPERVISOR_EXTERNAL => TrapCause::External,
                _ => TrapCause::Unknown(scause),
            }
        } else {
            match code {
                USER_ECALL => TrapCause::UserEcall,
                _ => TrapCause::Unknown(scause),
            }
        }
    }
}

/// # 功能说明
/// 处理当前进程在用户态触发的一次陷阱，返回后由调用者回到用户态。
///
/// # 流程解释
/// - 外部中断：交给设备中断处理，然后检查终止标志。
/// - 时钟中断：hart 0 推进时钟；检查终止标志；
///   把 tick 送达 alarm，必要时改写返回地址；最后让出 CPU。
/// - 系统调用：前后各检查一次终止标志，调用过程中可能被杀死。
/// - 其他异常：打印原因并终止进程。
pub fn handle_user_trap(pm: &ProcManager, cause: TrapCause) {
    let p = CPU_MANAGER.my_proc();

    match cause {
        TrapCause::External => {
            pm.env().device_interrupt();
            p.exit_if_killed(pm);
        }
        TrapCause::Timer => {
            // 仅在CPU 0上更新时钟计数
            if unsafe { CpuManager::cpu_id() } == 0 {
                clock_intr(pm);
            }
            p.exit_if_killed(pm);
            p.alarm_tick();
            p.yielding();
        }
        TrapCause::UserEcall => {
            p.exit_if_killed(pm);
            p.syscall(pm);
            p.exit_if_killed(pm);
        }
        TrapCause::Unknown(scause) => {
            println!("usertrap(): unexpected scause {:#x} pid={}", scause, p.pid());
            println!("            epc={:#x}", unsafe { p.data_mut().tf().epc });
            p.abondon(pm, KILLED_EXIT_STATUS);
        }
    }
}

/// 处理一次用户态陷阱并返回用户空间
///
/// # 安全性
/// 必须在当前进程的内核栈上、由陷阱入口调用。
pub unsafe fn user_trap(pm: &ProcManager, cause: TrapCause) -> ! {
    enter_kernel(pm);
    handle_user_trap(pm, cause);
    user_trap_ret(pm);
}

/// 已经进入内核：把陷阱向量换成内核态的 kernelvec，
/// 之后打开中断时内核态的中断不会再进入用户态的陷阱入口。
#[inline]
fn enter_kernel(pm: &ProcManager) {
    crate::arch::write_stvec(pm.env().kernel_trap_vector());
}

/// 返回用户空间
///
/// # 功能说明
/// 关闭中断，填好陷阱帧中下一次陷入需要的内核字段，
/// 然后经由跳板代码切换到用户页表并从 `epc` 继续执行。
///
/// # 安全性
/// - 必须在当前进程的内核上下文中调用
/// - 涉及页表和地址空间切换
pub unsafe fn user_trap_ret(pm: &ProcManager) -> ! {
    // 从这里开始到回到用户态之前不能再被中断，
    // 陷阱入口此时仍指向内核，而陷阱帧即将被改写。
    crate::arch::intr_off();

    // 把陷阱向量换回跳板页中的 uservec
    crate::arch::write_stvec(pm.env().user_trap_vector());

    let pd = CPU_MANAGER.my_proc().data_mut();
    let satp = pd.user_ret_prepare(pm.env());
    let epc = pd.tf().epc;

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        sstatus::user_ret_prepare();
        sepc::write(epc);
    }

    pm.env().return_to_user(epc, satp)
}

/// 用户模式陷阱入口，由跳板代码保存用户寄存器后跳转过来
///
/// # 安全性
/// - 必须由跳板代码在正确上下文中调用
/// - 进程管理器必须已经安装
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    // 验证中断来源：必须来自用户模式
    if !sstatus::is_from_user() {
        panic!("usertrap(): not from user mode, sstatus={:#x}", sstatus::read());
    }

    let pm = match ProcManager::installed() {
        Some(pm) => pm,
        None => panic!("usertrap(): no process manager installed"),
    };

    // 现在处于内核态，中断和异常应交给 kernelvec
    enter_kernel(pm);

    // 保存用户程序计数器，处理过程中可能切换到其他进程
    CPU_MANAGER.my_proc().data_mut().tf_mut().epc = sepc::read();

    let cause = TrapCause::from_scause(scause::read());
    match cause {
        TrapCause::Timer => sip::clear_ssip(),
        TrapCause::Unknown(_) => println!("usertrap(): stval={:#x}", stval::read()),
        _ => {},
    }

    handle_user_trap(pm, cause);
    user_trap_ret(pm);
}

/// 内核态时钟中断：推进时钟，并让当前进程让出 CPU
pub fn kernel_timer_tick(pm: &ProcManager) {
    // 仅在CPU 0上更新时钟计数
    if unsafe { CpuManager::cpu_id() } == 0 {
        clock_intr(pm);
    }
    CPU_MANAGER.try_yield_proc();
}

/// 时钟 tick 的睡眠通道
#[inline]
fn ticks_channel(pm: &ProcManager) -> usize {
    &pm.ticks as *const _ as usize
}

/// 处理时钟中断（更新全局计数器）
///
/// # 功能说明
/// 增加时钟计数并唤醒等待时钟的进程。
pub fn clock_intr(pm: &ProcManager) {
    let mut guard = pm.ticks.lock();
    *guard += Wrapping(1);
    pm.wakeup(ticks_channel(pm));
    drop(guard);
}

/// 使进程休眠指定时钟周期
///
/// # 返回值
/// - `Ok(())`: 成功休眠指定周期
/// - `Err(())`: 休眠期间进程被终止
pub fn clock_sleep(pm: &ProcManager, p: &Proc, count: usize) -> Result<(), ()> {
    let mut guard = pm.ticks.lock();
    let old_ticks = *guard;

    // 等待指定周期
    while (*guard - old_ticks) < Wrapping(count) {
        if p.killed() {
            return Err(())
        }

        p.sleep(ticks_channel(pm), guard);
        // 被唤醒后重新获取锁
        guard = pm.ticks.lock();
    }
    Ok(())
}

/// 读取当前时钟计数值
pub fn clock_read(pm: &ProcManager) -> usize {
    pm.ticks.lock().0
}
