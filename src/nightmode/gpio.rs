//! Linux GPIO access: sysfs-first with a character-device fallback, plus the
//! pulse-pair primitive used to drive an IR-cut motor's two coils together.
//!
//! Ports `gpio.c`'s backend preference (sysfs for global pin numbering and
//! held-output semantics; `/dev/gpiochipN` via `GPIOHANDLE_*` ioctls when
//! sysfs is unavailable) using `libc` raw syscalls, matching how the rest of
//! this codebase reaches for `libc` at other kernel-interface seams
//! (pidfile flock, watchdog ioctl).

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::Path;

const SYSFS_EXPORT: &str = "/sys/class/gpio/export";
const SYSFS_UNEXPORT: &str = "/sys/class/gpio/unexport";

fn sysfs_available() -> bool {
    Path::new(SYSFS_EXPORT).exists()
}

fn sysfs_export(pin: u32) -> std::io::Result<()> {
    let mut f = match OpenOptions::new().write(true).open(SYSFS_EXPORT) {
        Ok(f) => f,
        Err(e) => return Err(e),
    };
    match f.write_all(pin.to_string().as_bytes()) {
        Ok(()) => Ok(()),
        // Already exported; sysfs returns EBUSY in that case.
        Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(()),
        Err(e) => Err(e),
    }
}

fn sysfs_unexport(pin: u32) {
    if let Ok(mut f) = OpenOptions::new().write(true).open(SYSFS_UNEXPORT) {
        let _ = f.write_all(pin.to_string().as_bytes());
    }
}

fn sysfs_direction(pin: u32, mode: &str) -> std::io::Result<()> {
    let path = format!("/sys/class/gpio/gpio{pin}/direction");
    let mut f = OpenOptions::new().write(true).open(path)?;
    f.write_all(mode.as_bytes())
}

fn sysfs_write_value(pin: u32, value: bool) -> std::io::Result<()> {
    let path = format!("/sys/class/gpio/gpio{pin}/value");
    let mut f = OpenOptions::new().write(true).open(path)?;
    f.write_all(if value { b"1" } else { b"0" })
}

fn sysfs_read_value(pin: u32) -> std::io::Result<bool> {
    let path = format!("/sys/class/gpio/gpio{pin}/value");
    let mut f = OpenOptions::new().read(true).open(path)?;
    let mut buf = [0u8; 1];
    f.read_exact(&mut buf)?;
    Ok(buf[0] != b'0')
}

fn sysfs_read(pin: u32) -> std::io::Result<bool> {
    sysfs_export(pin)?;
    sysfs_direction(pin, "in")?;
    let result = sysfs_read_value(pin);
    sysfs_unexport(pin);
    result
}

fn sysfs_write(pin: u32, value: bool) -> std::io::Result<()> {
    sysfs_export(pin)?;
    sysfs_direction(pin, "out")?;
    // Line is left exported so the driven level is held, matching the
    // original's steady IR/white LED output behavior.
    sysfs_write_value(pin, value)
}

/// Reads the logic level of `pin`. Falls back silently to `false` plus a
/// logged error if no backend can service the request — day/night sampling
/// treats that the same as "sensor idle".
pub fn read(pin: u32) -> std::io::Result<bool> {
    if sysfs_available() {
        return sysfs_read(pin);
    }
    cdev_read(pin)
}

pub fn write(pin: u32, value: bool) -> std::io::Result<()> {
    if sysfs_available() {
        if sysfs_write(pin, value).is_ok() {
            return Ok(());
        }
    }
    cdev_write(pin, value)
}

/// Drives two pins together for `pulse_us` microseconds then releases both,
/// used to pulse an IR-cut filter motor's two coils. Prefers sysfs so both
/// lines stay exported (and thus actively driven) for the whole pulse.
pub fn pulse_pair(pin1: u32, val1: bool, pin2: u32, val2: bool, pulse_us: u32) -> std::io::Result<()> {
    if sysfs_available() {
        sysfs_export(pin1)?;
        if let Err(e) = sysfs_export(pin2) {
            sysfs_unexport(pin1);
            return Err(e);
        }
        let result = (|| {
            sysfs_direction(pin1, "out")?;
            sysfs_direction(pin2, "out")?;
            sysfs_write_value(pin1, val1)?;
            sysfs_write_value(pin2, val2)?;
            std::thread::sleep(std::time::Duration::from_micros(pulse_us as u64));
            let _ = sysfs_write_value(pin1, false);
            let _ = sysfs_write_value(pin2, false);
            Ok(())
        })();
        sysfs_unexport(pin1);
        sysfs_unexport(pin2);
        return result;
    }
    cdev_pulse_pair(pin1, val1, pin2, val2, pulse_us)
}

/// Maps a global pin number to a `(chip_index, line_offset)` pair by
/// scanning `/sys/class/gpio/gpiochipN/base`/`ngpio`, falling back to
/// `(0, pin)` when the mapping can't be resolved — matching
/// `gpio_map_global_to_chip()`'s legacy behavior.
fn map_global_to_chip(pin: u32) -> (u32, u32) {
    let Ok(entries) = std::fs::read_dir("/sys/class/gpio") else {
        return (0, pin);
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(idx_str) = name.strip_prefix("gpiochip") else { continue };
        let Ok(idx) = idx_str.parse::<u32>() else { continue };
        let base = read_u32_file(&format!("/sys/class/gpio/{name}/base"));
        let ngpio = read_u32_file(&format!("/sys/class/gpio/{name}/ngpio"));
        if let (Some(base), Some(ngpio)) = (base, ngpio) {
            if ngpio > 0 && pin >= base && pin < base + ngpio {
                return (idx, pin - base);
            }
        }
    }
    (0, pin)
}

fn read_u32_file(path: &str) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[repr(C)]
struct GpioHandleRequest {
    line_offsets: [u32; 64],
    flags: u32,
    default_values: [u8; 64],
    consumer_label: [u8; 32],
    lines: u32,
    fd: i32,
}

#[repr(C)]
struct GpioHandleData {
    values: [u8; 64],
}

const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
// ioctl numbers for GPIO_GET_LINEHANDLE_IOCTL / GPIOHANDLE_GET_LINE_VALUES_IOCTL
// / GPIOHANDLE_SET_LINE_VALUES_IOCTL from <linux/gpio.h>.
const GPIO_GET_LINEHANDLE_IOCTL: libc::c_ulong = 0xc16cb403;
const GPIOHANDLE_GET_LINE_VALUES_IOCTL: libc::c_ulong = 0xc040b408;
const GPIOHANDLE_SET_LINE_VALUES_IOCTL: libc::c_ulong = 0xc040b409;

fn cdev_request_handle(pin: u32, output: bool, default_value: bool) -> std::io::Result<i32> {
    let (chip, offset) = map_global_to_chip(pin);
    let dev = format!("/dev/gpiochip{chip}");
    let path = std::ffi::CString::new(dev).expect("gpio device path has no interior NUL");
    let chip_fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
    if chip_fd < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let mut req: GpioHandleRequest = unsafe { std::mem::zeroed() };
    req.line_offsets[0] = offset;
    req.lines = 1;
    req.flags = if output { GPIOHANDLE_REQUEST_OUTPUT } else { GPIOHANDLE_REQUEST_INPUT };
    req.default_values[0] = default_value as u8;

    let rc = unsafe { libc::ioctl(chip_fd, GPIO_GET_LINEHANDLE_IOCTL, &mut req as *mut GpioHandleRequest) };
    unsafe { libc::close(chip_fd) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(req.fd)
}

fn cdev_read(pin: u32) -> std::io::Result<bool> {
    let fd = cdev_request_handle(pin, false, false)?;
    let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::ioctl(fd, GPIOHANDLE_GET_LINE_VALUES_IOCTL, &mut data as *mut GpioHandleData) };
    unsafe { libc::close(fd) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(data.values[0] != 0)
}

fn cdev_write(pin: u32, value: bool) -> std::io::Result<()> {
    let fd = cdev_request_handle(pin, true, value)?;
    unsafe { libc::close(fd) };
    Ok(())
}

fn cdev_pulse_pair(pin1: u32, val1: bool, pin2: u32, val2: bool, pulse_us: u32) -> std::io::Result<()> {
    let fd1 = cdev_request_handle(pin1, true, val1)?;
    let fd2 = match cdev_request_handle(pin2, true, val2) {
        Ok(fd) => fd,
        Err(e) => {
            unsafe { libc::close(fd1) };
            return Err(e);
        }
    };
    std::thread::sleep(std::time::Duration::from_micros(pulse_us as u64));
    let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
    data.values[0] = 0;
    unsafe {
        libc::ioctl(fd1, GPIOHANDLE_SET_LINE_VALUES_IOCTL, &mut data as *mut GpioHandleData);
        libc::ioctl(fd2, GPIOHANDLE_SET_LINE_VALUES_IOCTL, &mut data as *mut GpioHandleData);
        libc::close(fd1);
        libc::close(fd2);
    }
    Ok(())
}
