//! 进程相关的系统调用实现

use crate::process::ProcManager;
use crate::trap;

use super::Proc;

/// 系统调用结果类型，`Err(())` 在用户态表现为返回 -1
pub type SysResult = Result<usize, ()>;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_SIGALARM: usize = 22;
pub const SYS_SIGRETURN: usize = 23;

/// 系统调用 trait 定义
///
/// 包含进程管理相关的系统调用方法，由 `Proc` 结构体实现具体功能。
/// 参数从当前进程陷阱帧的 a0-a5 中读取。
pub trait Syscall {
    fn sys_fork(&self, pm: &ProcManager) -> SysResult;
    fn sys_exit(&self, pm: &ProcManager) -> SysResult;
    fn sys_wait(&self, pm: &ProcManager) -> SysResult;
    fn sys_kill(&self, pm: &ProcManager) -> SysResult;
    fn sys_getpid(&self, pm: &ProcManager) -> SysResult;
    fn sys_sbrk(&self, pm: &ProcManager) -> SysResult;
    fn sys_sleep(&self, pm: &ProcManager) -> SysResult;
    fn sys_uptime(&self, pm: &ProcManager) -> SysResult;
    fn sys_sigalarm(&self, pm: &ProcManager) -> SysResult;
    fn sys_sigreturn(&self, pm: &ProcManager) -> SysResult;
}

impl Syscall for Proc {
    /// 创建当前进程的副本（子进程）
    ///
    /// # 返回值
    /// - 父进程：返回子进程 PID
    /// - 子进程：返回 0
    /// - 错误：返回 Err(())
    fn sys_fork(&self, pm: &ProcManager) -> SysResult {
        let ret = self.fork(pm);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].fork() = {:?}(pid)", self.pid(), ret);

        ret
    }

    /// 终止当前进程，不会返回
    fn sys_exit(&self, pm: &ProcManager) -> SysResult {
        let exit_status = self.arg_i32(0);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].exit(status={})", self.pid(), exit_status);

        pm.exiting(self.index, exit_status);
    }

    /// 等待任意一个子进程退出并回收它
    ///
    /// # 参数
    /// - `status_addr`: 用户空间地址，非 0 时写入子进程的退出状态
    ///
    /// # 返回值
    /// - 成功：返回结束的子进程 PID
    /// - 错误：没有子进程、写入状态失败或自身被杀死
    fn sys_wait(&self, pm: &ProcManager) -> SysResult {
        let addr = self.arg_addr(0);
        let ret = pm.waiting(self.index, addr);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].wait(addr={:#x}) = {:?}(pid)", self.pid(), addr, ret);

        ret
    }

    fn sys_kill(&self, pm: &ProcManager) -> SysResult {
        let pid = self.arg_i32(0);
        if pid < 0 {
            return Err(())
        }
        let pid = pid as usize;
        let ret = pm.kill(pid);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].kill(pid={}) = {:?}", self.pid(), pid, ret);

        ret.map(|()| 0)
    }

    fn sys_getpid(&self, _pm: &ProcManager) -> SysResult {
        let pid = self.pid();

        #[cfg(feature = "trace_syscall")]
        println!("[{}].getpid() = {}", pid, pid);

        Ok(pid)
    }

    /// 调整进程堆大小，返回原堆顶地址
    fn sys_sbrk(&self, _pm: &ProcManager) -> SysResult {
        let increment = self.arg_i32(0);
        let ret = unsafe { self.data_mut().sbrk(increment) };

        #[cfg(feature = "trace_syscall")]
        println!("[{}].sbrk({}) = {:?}", self.pid(), increment, ret);

        ret
    }

    /// 睡眠指定数量的时钟 tick，期间被杀死则返回错误
    fn sys_sleep(&self, pm: &ProcManager) -> SysResult {
        let count = self.arg_i32(0);
        if count < 0 {
            return Err(())
        }
        let count = count as usize;
        let ret = trap::clock_sleep(pm, self, count);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].sleep({}) = {:?}", self.pid(), count, ret);

        ret.map(|()| 0)
    }

    /// 系统启动以来的时钟 tick 数
    fn sys_uptime(&self, pm: &ProcManager) -> SysResult {
        let ret = trap::clock_read(pm);

        #[cfg(feature = "trace_syscall")]
        println!("[{}].uptime() = {}", self.pid(), ret);

        Ok(ret)
    }

    /// 登记 alarm：每 `interval` 个 tick 调用一次 `handler`，`interval` 为 0 时关闭
    fn sys_sigalarm(&self, _pm: &ProcManager) -> SysResult {
        let interval = self.arg_i32(0);
        if interval < 0 {
            return Err(())
        }
        let handler = self.arg_addr(1);
        unsafe { self.data_mut().alarm_mut().configure(interval as usize, handler); }

        #[cfg(feature = "trace_syscall")]
        println!("[{}].sigalarm(interval={}, handler={:#x})", self.pid(), interval, handler);

        Ok(0)
    }

    /// 从 alarm 处理函数返回。
    /// 返回值是恢复后的 `a0`，这样写回 `a0` 时不会覆盖被打断时的值。
    fn sys_sigreturn(&self, _pm: &ProcManager) -> SysResult {
        let ret = self.alarm_restore();

        #[cfg(feature = "trace_syscall")]
        println!("[{}].sigreturn()", self.pid());

        Ok(ret)
    }
}

impl Proc {
    /// # 功能说明
    /// 处理当前进程发起的系统调用请求。根据陷阱帧中 a7 指定的系统调用号，
    /// 调用对应的系统调用处理函数，并将返回结果写回 a0。
    ///
    /// # 流程解释
    /// 1. 使能中断，陷阱相关的寄存器此前已经读取完毕。
    /// 2. 读取系统调用号，并让 `epc` 越过 `ecall` 指令。
    /// 3. 分发到具体的系统调用。未知的调用号返回 -1。
    /// 4. 将结果写入 a0，失败写入 -1。
    pub fn syscall(&self, pm: &ProcManager) {
        crate::arch::intr_on();

        let tf = unsafe { self.data_mut().tf_mut() };
        let a7 = tf.syscall_num();
        tf.admit_ecall();
        let sys_result = match a7 {
            SYS_FORK => self.sys_fork(pm),
            SYS_EXIT => self.sys_exit(pm),
            SYS_WAIT => self.sys_wait(pm),
            SYS_KILL => self.sys_kill(pm),
            SYS_GETPID => self.sys_getpid(pm),
            SYS_SBRK => self.sys_sbrk(pm),
            SYS_SLEEP => self.sys_sleep(pm),
            SYS_UPTIME => self.sys_uptime(pm),
            SYS_SIGALARM => self.sys_sigalarm(pm),
            SYS_SIGRETURN => self.sys_sigreturn(pm),
            _ => {
                #[cfg(feature = "kernel_warning")]
                println!("kernel warning: pid {} {}: unknown sys call {}",
                    self.pid(), unsafe { self.data_mut().name() }, a7);
                Err(())
            }
        };

        let tf = unsafe { self.data_mut().tf_mut() };
        tf.a0 = match sys_result {
            Ok(ret) => ret,
            Err(()) => -1isize as usize,
        };
    }

    /// 第 `n` 个系统调用参数的原始值
    fn arg_raw(&self, n: usize) -> usize {
        unsafe { self.data_mut().tf().arg(n) }
    }

    /// 获取 32 位寄存器的值。
    /// 注意：在 usize 和 i32 之间会进行as转换
    #[inline]
    fn arg_i32(&self, n: usize) -> i32 {
        self.arg_raw(n) as i32
    }

    /// 从寄存器值中获取原始用户虚拟地址，可能为 0
    #[inline]
    fn arg_addr(&self, n: usize) -> usize {
        self.arg_raw(n)
    }
}
