//! 定义系统内核的输出方法
//!
//! 裸机上字符经由控制台驱动通过 [`set_console`] 注册的 `putc` 输出，
//! 多个 hart 的输出由一把自旋锁排序；宿主机上直接转给标准输出。

use core::fmt;
#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[cfg(target_os = "none")]
use crate::spinlock::SpinLock;

/// 某个 hart 已经 panic，此后的输出不再加锁
#[cfg(target_os = "none")]
pub static PANICKED: AtomicBool = AtomicBool::new(false);

/// 控制台驱动注册的 `fn(u8)`，为 0 时丢弃输出
#[cfg(target_os = "none")]
static CONSOLE: AtomicUsize = AtomicUsize::new(0);

/// 注册控制台的字符输出函数
#[cfg(target_os = "none")]
pub fn set_console(putc: fn(u8)) {
    CONSOLE.store(putc as usize, Ordering::Release);
}

/// 零大小类型（ZST）的打印结构体，用于在多个 CPU 之间对打印操作进行排序。
#[cfg(target_os = "none")]
struct Print;

#[cfg(target_os = "none")]
impl fmt::Write for Print {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let putc = CONSOLE.load(Ordering::Acquire);
        if putc == 0 {
            return Ok(())
        }
        let putc: fn(u8) = unsafe { core::mem::transmute(putc) };
        for byte in s.bytes() {
            putc(byte);
        }
        Ok(())
    }
}

/// 核心打印函数（被宏调用）
///
/// # 功能说明
/// 根据系统状态决定是否加锁输出：
/// - 当系统处于panic状态时，直接输出（不加锁）
/// - 正常状态下使用自旋锁保证多核输出同步
#[cfg(target_os = "none")]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    static PRINT: SpinLock<()> = SpinLock::new((), "print");

    if PANICKED.load(Ordering::Relaxed) {
        // no need to lock
        let _ = Print.write_fmt(args);
    } else {
        let guard = PRINT.lock();
        let _ = Print.write_fmt(args);
        drop(guard);
    }
}

#[cfg(not(target_os = "none"))]
pub fn _print(args: fmt::Arguments<'_>) {
    std::print!("{}", args);
}

/// 在终端输出一串字符
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::printf::_print(format_args!($($arg)*));
    };
}

/// 在终端输出一行字符
#[macro_export]
macro_rules! println {
    () => {$crate::print!("\n")};
    ($fmt:expr) => {$crate::print!(concat!($fmt, "\n"))};
    ($fmt:expr, $($arg:tt)*) => {
        $crate::print!(concat!($fmt, "\n"), $($arg)*)
    };
}

/// 全局panic处理函数：打印信息，标记 panic 状态后挂起当前 hart
#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    crate::println!("{}", info);
    PANICKED.store(true, Ordering::Relaxed);
    loop {}
}
