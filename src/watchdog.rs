//! Hardware watchdog: kicks `/dev/watchdog0` (falling back to
//! `/dev/watchdog`) on every main-loop iteration, and writes the magic
//! close character on shutdown so the watchdog driver disarms cleanly
//! instead of firing a reboot moments after a graceful exit.
//!
//! Ports `watchdog.c`'s device probing and `WDIOC_SETTIMEOUT` ioctl.

use std::ffi::CString;
use std::os::unix::io::RawFd;

const WATCHDOG_DEVICES: &[&str] = &["/dev/watchdog0", "/dev/watchdog"];

// WDIOC_SETTIMEOUT = _IOWR('W', 6, int) from <linux/watchdog.h>.
const WDIOC_SETTIMEOUT: libc::c_ulong = 0xc0045706;

pub struct Watchdog {
    fd: RawFd,
}

impl Watchdog {
    /// Opens the first available watchdog device and sets its timeout.
    /// Returns `None` if no watchdog device node exists, matching the
    /// original firmware's "log and run without one" behavior rather than
    /// failing startup.
    pub fn start(timeout_s: i32) -> Option<Self> {
        for path in WATCHDOG_DEVICES {
            if !std::path::Path::new(path).exists() {
                continue;
            }
            let cpath = CString::new(*path).expect("watchdog device path has no interior NUL");
            let fd = unsafe { libc::open(cpath.as_ptr(), libc::O_WRONLY) };
            if fd < 0 {
                tracing::error!(path, "could not open watchdog device");
                continue;
            }
            let mut timeout = timeout_s;
            unsafe { libc::ioctl(fd, WDIOC_SETTIMEOUT, &mut timeout as *mut i32) };
            tracing::info!(path, timeout_s, "watchdog started");
            return Some(Watchdog { fd });
        }
        tracing::warn!("no watchdog device found, running without one");
        None
    }

    /// Kicks the watchdog. Call once per main-loop iteration.
    pub fn reset(&self) {
        unsafe {
            libc::write(self.fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        unsafe {
            libc::write(self.fd, [b'V'].as_ptr() as *const libc::c_void, 1);
            libc::close(self.fd);
        }
        tracing::info!("watchdog stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_when_no_device_node_exists() {
        // This test environment has no /dev/watchdog*, matching the common
        // case for CI and non-embedded hosts.
        if !WATCHDOG_DEVICES.iter().any(|p| std::path::Path::new(p).exists()) {
            assert!(Watchdog::start(15).is_none());
        }
    }
}
