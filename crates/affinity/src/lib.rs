#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! CPU affinity for `mapforge` worker threads.
//!
//! Pinning is Linux best-effort; on other platforms [`pin_current_thread`]
//! reports `Unsupported` and callers are expected to carry on unpinned.

use std::io;

/// Pin the calling thread to the given set of CPU ids.
///
/// The set must be non-empty. CPU ids are the kernel's logical ids, the same
/// numbering reported by `/proc/cpuinfo`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu_ids: &[usize]) -> io::Result<()> {
    if cpu_ids.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty CPU set",
        ));
    }

    // Safety: CPU_ZERO/CPU_SET only write into the local cpu_set_t, and
    // sched_setaffinity reads it for the calling thread (pid 0).
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &cpu in cpu_ids {
            if cpu >= libc::CPU_SETSIZE as usize {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("CPU id {cpu} out of range"),
                ));
            }
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Pin the calling thread to the given set of CPU ids.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu_ids: &[usize]) -> io::Result<()> {
    if cpu_ids.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty CPU set",
        ));
    }
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "CPU pinning is only supported on Linux",
    ))
}

/// Number of CPUs available to this process.
pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_rejected() {
        assert!(pin_current_thread(&[]).is_err());
    }

    #[test]
    fn available_cpus_is_positive() {
        assert!(available_cpus() >= 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn pin_to_cpu_zero() {
        pin_current_thread(&[0]).expect("pin to CPU 0");
    }
}
