//! 内核编译期常量

/// 系统支持的最大硬件线程（hart）数量
pub const NCPU: usize = 8;

/// 进程表的固定容量
pub const NPROC: usize = 64;

/// 每个进程可同时打开的文件数量
pub const NOFILE: usize = 16;

/// 页大小（字节）
pub const PGSIZE: usize = 4096;

/// 每个进程内核栈占用的页数，栈上方另有一个无效的保护页
pub const KSTACK_PAGES: usize = 4;

/// 进程名称缓冲区长度（包含结尾的 0）
pub const PROC_NAME_LEN: usize = 16;

/// 进程因 kill 而终止时上报给父进程的退出码
pub const KILLED_EXIT_STATUS: i32 = -1;
