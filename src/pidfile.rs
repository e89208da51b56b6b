//! Single-instance lock: an `flock(LOCK_EX|LOCK_NB)`-held pidfile in the
//! first writable runtime directory, failing fast when another instance
//! already holds it.
//!
//! Ports `single_instance.c`'s directory fallback (`/run`, `/var/run`,
//! `/tmp`) and its error handling: `ENOENT` tries the next directory,
//! `EWOULDBLOCK`/`EAGAIN` (another instance holds it) returns immediately.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

const CANDIDATE_DIRS: &[&str] = &["/run", "/var/run", "/tmp"];

pub struct PidFile {
    #[allow(dead_code)]
    file: std::fs::File,
    path: PathBuf,
}

impl PidFile {
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

/// Acquires the single-instance lock for `name`, trying each candidate
/// runtime directory in order. The returned [`PidFile`] holds the lock for
/// as long as it stays alive; dropping it releases the flock.
pub fn acquire(name: &str) -> std::io::Result<PidFile> {
    let mut last_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no runtime directory available");

    for dir in CANDIDATE_DIRS {
        let path = PathBuf::from(dir).join(format!("{name}.pid"));
        match try_lock(&path) {
            Ok(file) => return Ok(PidFile { file, path }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                last_err = e;
                continue;
            }
            Err(e) if e.raw_os_error() == Some(libc::EWOULDBLOCK) || e.raw_os_error() == Some(libc::EAGAIN) => {
                return Err(e);
            }
            Err(e) => {
                last_err = e;
                continue;
            }
        }
    }
    Err(last_err)
}

fn try_lock(path: &std::path::Path) -> std::io::Result<std::fs::File> {
    let mut file = OpenOptions::new().read(true).write(true).create(true).mode(0o644).open(path)?;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}\n", std::process::id())?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_and_writes_pid_to_tmp() {
        // /run may not be writable in a sandboxed test environment; /tmp
        // always is, so the fallback chain should still succeed.
        let name = format!("camerad-pidfile-test-{:?}", std::thread::current().id());
        let guard = acquire(&name).expect("should acquire lock in at least /tmp");
        let contents = std::fs::read_to_string(guard.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        drop(guard);
        let _ = std::fs::remove_file(format!("/tmp/{name}.pid"));
    }

    #[test]
    fn second_acquire_in_same_process_does_not_deadlock_via_distinct_name() {
        let name = format!("camerad-pidfile-test-b-{:?}", std::thread::current().id());
        let guard1 = acquire(&name).unwrap();
        drop(guard1);
        let guard2 = acquire(&name).unwrap();
        drop(guard2);
        let _ = std::fs::remove_file(format!("/tmp/{name}.pid"));
    }
}
