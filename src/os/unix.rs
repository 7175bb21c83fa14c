//! Unix VFS implementation
//!
//! Files are accessed with pread/pwrite, locks are POSIX advisory byte-range
//! locks, and the WAL index lives in a `-shm` file mapped with MAP_SHARED so
//! every connection observes the same bytes.
//!
//! POSIX locks are owned by the process, not the file handle, so two
//! connections inside one process would never conflict through fcntl alone.
//! A process-local inode table arbitrates between them first; fcntl is only
//! invoked when the process-wide aggregate lock state changes.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{
    AccessFlags, LockLevel, OpenFlags, ShmLockFlags, SyncFlags, Vfs, VfsFile, SHM_REGION_SIZE,
};
use crate::types::DbOffset;

// ============================================================================
// Lock geometry
// ============================================================================

/// Byte locked while a writer waits for readers to drain
const PENDING_BYTE: i64 = 0x4000_0000;
/// Byte locked by a connection that intends to write
const RESERVED_BYTE: i64 = PENDING_BYTE + 1;
/// First byte of the shared-lock range
const SHARED_FIRST: i64 = PENDING_BYTE + 2;
/// Length of the shared-lock range
const SHARED_SIZE: i64 = 510;

/// Number of shared-memory lock slots (WRITE, CKPT, RECOVER, READ0..READ4)
pub const SHM_NLOCK: usize = 8;
/// Offset of the lock bytes within the shm file
const SHM_LOCK_BASE: i64 = 120;

// ============================================================================
// Platform helpers
// ============================================================================

#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

/// fdatasync where available, fsync elsewhere (macOS)
#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

fn error_from_errno() -> Error {
    let errno = get_errno();
    let msg = std::io::Error::from_raw_os_error(errno).to_string();
    match errno {
        libc::EACCES | libc::EAGAIN | libc::EBUSY => Error::busy_retry(),
        libc::ENOMEM => Error::no_memory(),
        _ => Error::with_message(ErrorCode::IoErr, msg),
    }
}

/// Apply an fcntl byte-range lock. `lock_type` is F_RDLCK, F_WRLCK or
/// F_UNLCK. Returns Busy (Retry) when the range is held elsewhere.
fn posix_lock(fd: RawFd, lock_type: i16, start: i64, len: i64) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = start;
    fl.l_len = len;
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLK, &fl) };
    if rc < 0 {
        let errno = get_errno();
        if errno == libc::EACCES || errno == libc::EAGAIN {
            return Err(Error::busy_retry());
        }
        return Err(error_from_errno());
    }
    Ok(())
}

/// Probe whether another process holds a write lock on the given byte
fn posix_lock_held(fd: RawFd, start: i64, len: i64) -> Result<bool> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as i16;
    fl.l_whence = libc::SEEK_SET as i16;
    fl.l_start = start;
    fl.l_len = len;
    let rc = unsafe { libc::fcntl(fd, libc::F_GETLK, &mut fl) };
    if rc < 0 {
        return Err(error_from_errno());
    }
    Ok(fl.l_type != libc::F_UNLCK as i16)
}

// ============================================================================
// In-process inode lock table
// ============================================================================

type InodeKey = (u64, u64);

#[derive(Default)]
struct ShmSlotState {
    n_shared: u32,
    exclusive: bool,
}

#[derive(Default)]
struct InodeState {
    n_shared: u32,
    reserved: bool,
    pending: bool,
    exclusive: bool,
    shm: [ShmSlotState; SHM_NLOCK],
}

lazy_static! {
    static ref INODE_TABLE: Mutex<HashMap<InodeKey, InodeState>> = Mutex::new(HashMap::new());
}

fn with_inode_state<R>(key: InodeKey, f: impl FnOnce(&mut InodeState) -> R) -> R {
    let mut table = INODE_TABLE.lock().unwrap();
    let state = table.entry(key).or_default();
    let result = f(state);
    let empty = state.n_shared == 0
        && !state.reserved
        && !state.pending
        && !state.exclusive
        && state.shm.iter().all(|s| s.n_shared == 0 && !s.exclusive);
    if empty {
        table.remove(&key);
    }
    result
}

fn inode_key(fd: RawFd) -> Result<InodeKey> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(error_from_errno());
    }
    Ok((st.st_dev as u64, st.st_ino as u64))
}

// ============================================================================
// Shared memory
// ============================================================================

struct ShmHandle {
    fd: RawFd,
    path: String,
    regions: Vec<*mut u8>,
    /// Lock state held by this handle: 0 none, 1 shared, 2 exclusive
    held: [u8; SHM_NLOCK],
}

impl ShmHandle {
    fn open(db_path: &str) -> Result<Self> {
        let path = format!("{}-shm", db_path);
        let c_path = CString::new(path.as_str())
            .map_err(|_| Error::new(ErrorCode::InvalidArgument))?;
        let fd = unsafe {
            libc::open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_CLOEXEC,
                0o644 as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(error_from_errno());
        }
        Ok(ShmHandle {
            fd,
            path,
            regions: Vec::new(),
            held: [0; SHM_NLOCK],
        })
    }

    fn map_region(&mut self, region: usize, extend: bool) -> Result<*mut u8> {
        while self.regions.len() <= region {
            let next = self.regions.len();
            let needed = ((next + 1) * SHM_REGION_SIZE) as i64;

            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(self.fd, &mut st) } < 0 {
                return Err(error_from_errno());
            }
            if (st.st_size as i64) < needed {
                if !extend {
                    return Err(Error::new(ErrorCode::NotFound));
                }
                if unsafe { libc::ftruncate(self.fd, needed) } < 0 {
                    return Err(error_from_errno());
                }
            }

            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    SHM_REGION_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd,
                    (next * SHM_REGION_SIZE) as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(error_from_errno());
            }
            self.regions.push(ptr as *mut u8);
        }
        Ok(self.regions[region])
    }

    fn close(&mut self, key: InodeKey, delete: bool) {
        // Release any slots this handle still holds.
        with_inode_state(key, |state| {
            for (i, held) in self.held.iter_mut().enumerate() {
                match *held {
                    1 => state.shm[i].n_shared = state.shm[i].n_shared.saturating_sub(1),
                    2 => state.shm[i].exclusive = false,
                    _ => {}
                }
                *held = 0;
            }
        });
        for &ptr in &self.regions {
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, SHM_REGION_SIZE);
            }
        }
        self.regions.clear();
        unsafe {
            libc::close(self.fd);
        }
        if delete {
            if let Ok(c_path) = CString::new(self.path.as_str()) {
                unsafe {
                    libc::unlink(c_path.as_ptr());
                }
            }
        }
    }
}

// ============================================================================
// Unix file
// ============================================================================

pub struct UnixFile {
    fd: RawFd,
    path: String,
    key: InodeKey,
    lock_state: Cell<LockLevel>,
    readonly: bool,
    shm: RefCell<Option<ShmHandle>>,
}

impl UnixFile {
    fn take_shared_kernel_lock(&self) -> Result<()> {
        posix_lock(self.fd, libc::F_RDLCK as i16, SHARED_FIRST, SHARED_SIZE)
    }

    fn drop_kernel_locks(&self) -> Result<()> {
        posix_lock(self.fd, libc::F_UNLCK as i16, 0, 0)
    }

    fn shm_handle<R>(&self, f: impl FnOnce(&mut ShmHandle) -> Result<R>) -> Result<R> {
        let mut slot = self.shm.borrow_mut();
        if slot.is_none() {
            *slot = Some(ShmHandle::open(&self.path)?);
        }
        f(slot.as_mut().unwrap())
    }
}

impl VfsFile for UnixFile {
    fn read(&self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = unsafe {
                libc::pread(
                    self.fd,
                    buf[total..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - total,
                    offset + total as i64,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(error_from_errno());
            }
            if n == 0 {
                break;
            }
            total += n as usize;
        }
        Ok(total)
    }

    fn write(&self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let mut total = 0;
        while total < buf.len() {
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    buf[total..].as_ptr() as *const libc::c_void,
                    buf.len() - total,
                    offset + total as i64,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(error_from_errno());
            }
            total += n as usize;
        }
        Ok(())
    }

    fn truncate(&self, size: DbOffset) -> Result<()> {
        if unsafe { libc::ftruncate(self.fd, size) } < 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };
        if rc < 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd, &mut st) } < 0 {
            return Err(error_from_errno());
        }
        Ok(st.st_size as DbOffset)
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
        let current = self.lock_state.get();
        if level <= current {
            return Ok(());
        }
        if self.readonly && level > LockLevel::Shared {
            return Err(Error::new(ErrorCode::NotSupported));
        }

        match level {
            LockLevel::Shared => {
                let acquired = with_inode_state(self.key, |state| {
                    if state.exclusive || state.pending {
                        return Err(Error::busy_retry());
                    }
                    if state.n_shared == 0 {
                        self.take_shared_kernel_lock()?;
                    }
                    state.n_shared += 1;
                    Ok(())
                });
                acquired?;
                self.lock_state.set(LockLevel::Shared);
            }
            LockLevel::Reserved => {
                if current < LockLevel::Shared {
                    self.lock(LockLevel::Shared)?;
                }
                with_inode_state(self.key, |state| {
                    if state.reserved || state.exclusive {
                        return Err(Error::busy_retry());
                    }
                    posix_lock(self.fd, libc::F_WRLCK as i16, RESERVED_BYTE, 1)?;
                    state.reserved = true;
                    Ok(())
                })?;
                self.lock_state.set(LockLevel::Reserved);
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if current < LockLevel::Shared {
                    self.lock(LockLevel::Shared)?;
                }
                with_inode_state(self.key, |state| {
                    // Another handle in this process still reading.
                    if state.n_shared > 1 || (state.reserved && current < LockLevel::Reserved) {
                        return Err(Error::busy_retry());
                    }
                    posix_lock(self.fd, libc::F_WRLCK as i16, PENDING_BYTE, 1)?;
                    state.pending = true;
                    if let Err(err) =
                        posix_lock(self.fd, libc::F_WRLCK as i16, SHARED_FIRST, SHARED_SIZE)
                    {
                        state.pending = false;
                        let _ = posix_lock(self.fd, libc::F_UNLCK as i16, PENDING_BYTE, 1);
                        return Err(err);
                    }
                    state.exclusive = true;
                    Ok(())
                })?;
                self.lock_state.set(LockLevel::Exclusive);
            }
            LockLevel::None => {}
        }
        Ok(())
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        let current = self.lock_state.get();
        if level >= current {
            return Ok(());
        }

        with_inode_state(self.key, |state| {
            if current >= LockLevel::Reserved {
                if state.exclusive {
                    state.exclusive = false;
                    state.pending = false;
                    // Drop back to a kernel shared lock before releasing the
                    // write ranges, so no window exists with nothing held.
                    self.take_shared_kernel_lock()?;
                }
                if state.reserved && current >= LockLevel::Reserved {
                    state.reserved = false;
                }
                posix_lock(self.fd, libc::F_UNLCK as i16, PENDING_BYTE, 2)?;
            }
            if level == LockLevel::None && current >= LockLevel::Shared {
                state.n_shared = state.n_shared.saturating_sub(1);
                if state.n_shared == 0 {
                    self.drop_kernel_locks()?;
                }
            }
            Ok::<(), Error>(())
        })?;
        self.lock_state.set(level);
        Ok(())
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        let local = with_inode_state(self.key, |state| state.reserved || state.exclusive);
        if local {
            return Ok(true);
        }
        posix_lock_held(self.fd, RESERVED_BYTE, 1)
    }

    fn shm_map(&self, region: usize, extend: bool) -> Result<*mut u8> {
        self.shm_handle(|shm| shm.map_region(region, extend))
    }

    fn shm_lock(&self, offset: usize, n: usize, flags: ShmLockFlags) -> Result<()> {
        if offset + n > SHM_NLOCK || n == 0 {
            return Err(Error::new(ErrorCode::InvalidArgument));
        }
        let key = self.key;
        self.shm_handle(|shm| {
            if flags.contains(ShmLockFlags::UNLOCK) {
                with_inode_state(key, |state| {
                    for i in offset..offset + n {
                        match shm.held[i] {
                            1 => state.shm[i].n_shared = state.shm[i].n_shared.saturating_sub(1),
                            2 => state.shm[i].exclusive = false,
                            _ => {}
                        }
                        shm.held[i] = 0;
                        if state.shm[i].n_shared == 0 && !state.shm[i].exclusive {
                            let _ = posix_lock(
                                shm.fd,
                                libc::F_UNLCK as i16,
                                SHM_LOCK_BASE + i as i64,
                                1,
                            );
                        }
                    }
                });
                return Ok(());
            }

            let exclusive = flags.contains(ShmLockFlags::EXCLUSIVE);
            with_inode_state(key, |state| {
                // Check every requested slot before taking any of them.
                for i in offset..offset + n {
                    if shm.held[i] != 0 {
                        return Err(Error::new(ErrorCode::InvalidArgument));
                    }
                    if state.shm[i].exclusive || (exclusive && state.shm[i].n_shared > 0) {
                        return Err(Error::busy_retry());
                    }
                }
                for i in offset..offset + n {
                    let lock_type = if exclusive {
                        libc::F_WRLCK as i16
                    } else {
                        libc::F_RDLCK as i16
                    };
                    if state.shm[i].n_shared == 0 && !state.shm[i].exclusive {
                        if let Err(err) =
                            posix_lock(shm.fd, lock_type, SHM_LOCK_BASE + i as i64, 1)
                        {
                            // Roll back slots taken so far.
                            for j in offset..i {
                                match shm.held[j] {
                                    1 => {
                                        state.shm[j].n_shared =
                                            state.shm[j].n_shared.saturating_sub(1)
                                    }
                                    2 => state.shm[j].exclusive = false,
                                    _ => {}
                                }
                                shm.held[j] = 0;
                            }
                            return Err(err);
                        }
                    }
                    if exclusive {
                        state.shm[i].exclusive = true;
                        shm.held[i] = 2;
                    } else {
                        state.shm[i].n_shared += 1;
                        shm.held[i] = 1;
                    }
                }
                Ok(())
            })
        })
    }

    fn shm_unmap(&self, delete: bool) -> Result<()> {
        if let Some(mut shm) = self.shm.borrow_mut().take() {
            shm.close(self.key, delete);
        }
        Ok(())
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        let _ = self.unlock(LockLevel::None);
        let _ = self.shm_unmap(false);
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ============================================================================
// Unix VFS
// ============================================================================

pub struct UnixVfs {
    name: String,
}

impl UnixVfs {
    pub fn new() -> Self {
        UnixVfs {
            name: "unix".to_string(),
        }
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, path: &str, flags: OpenFlags) -> Result<Rc<dyn VfsFile>> {
        let c_path =
            CString::new(path).map_err(|_| Error::new(ErrorCode::InvalidArgument))?;
        let mut oflags = libc::O_CLOEXEC;
        let readonly = flags.contains(OpenFlags::READONLY);
        oflags |= if readonly { libc::O_RDONLY } else { libc::O_RDWR };
        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }
        let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644 as libc::c_int) };
        if fd < 0 {
            let errno = get_errno();
            if errno == libc::ENOENT {
                return Err(Error::with_message(
                    ErrorCode::InvalidArgument,
                    format!("no such file: {}", path),
                ));
            }
            if errno == libc::EEXIST {
                return Err(Error::with_message(
                    ErrorCode::InvalidArgument,
                    format!("file exists: {}", path),
                ));
            }
            return Err(error_from_errno());
        }
        let key = inode_key(fd)?;
        Ok(Rc::new(UnixFile {
            fd,
            path: path.to_string(),
            key,
            lock_state: Cell::new(LockLevel::None),
            readonly,
            shm: RefCell::new(None),
        }))
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path =
            CString::new(path).map_err(|_| Error::new(ErrorCode::InvalidArgument))?;
        if unsafe { libc::unlink(c_path.as_ptr()) } < 0 && get_errno() != libc::ENOENT {
            return Err(error_from_errno());
        }
        if sync_dir {
            if let Some(dir) = std::path::Path::new(path).parent() {
                if let Ok(c_dir) = CString::new(dir.to_string_lossy().as_ref()) {
                    let dfd =
                        unsafe { libc::open(c_dir.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
                    if dfd >= 0 {
                        unsafe {
                            libc::fsync(dfd);
                            libc::close(dfd);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let c_path =
            CString::new(path).map_err(|_| Error::new(ErrorCode::InvalidArgument))?;
        let mode = if flags.contains(AccessFlags::READWRITE) {
            libc::R_OK | libc::W_OK
        } else {
            libc::F_OK
        };
        Ok(unsafe { libc::access(c_path.as_ptr(), mode) } == 0)
    }

    fn full_pathname(&self, path: &str) -> Result<String> {
        let p = std::path::Path::new(path);
        if p.is_absolute() {
            return Ok(path.to_string());
        }
        let cwd = std::env::current_dir()
            .map_err(|e| Error::with_message(ErrorCode::IoErr, e.to_string()))?;
        Ok(cwd.join(p).to_string_lossy().into_owned())
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        if let Ok(c_path) = CString::new("/dev/urandom") {
            let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
            if fd >= 0 {
                let n = unsafe {
                    libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                unsafe {
                    libc::close(fd);
                }
                if n > 0 {
                    return n as usize;
                }
            }
        }
        // Fallback: derive bytes from the clock.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = ((nanos >> ((i % 16) * 8)) & 0xff) as u8;
        }
        buf.len()
    }

    fn sleep(&self, microseconds: u32) {
        std::thread::sleep(std::time::Duration::from_micros(u64::from(microseconds)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_file(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("otterdb-unix-{}", name));
        let _ = std::fs::remove_file(&dir);
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn test_read_write_roundtrip() {
        let path = scratch_file("rw");
        let vfs = UnixVfs::new();
        let file = vfs
            .open(&path, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        file.write(b"hello otterdb", 0).unwrap();
        file.write(b"XYZ", 6).unwrap();

        let mut buf = [0u8; 13];
        let n = file.read(&mut buf, 0).unwrap();
        assert_eq!(n, 13);
        assert_eq!(&buf, b"hello XYZerdb");

        // Read past EOF is a short read, not an error.
        let n = file.read(&mut buf, 1000).unwrap();
        assert_eq!(n, 0);

        drop(file);
        vfs.delete(&path, false).unwrap();
    }

    #[test]
    fn test_truncate_and_size() {
        let path = scratch_file("trunc");
        let vfs = UnixVfs::new();
        let file = vfs
            .open(&path, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        file.write(&[0xAAu8; 1024], 0).unwrap();
        assert_eq!(file.file_size().unwrap(), 1024);
        file.truncate(100).unwrap();
        assert_eq!(file.file_size().unwrap(), 100);
        drop(file);
        vfs.delete(&path, false).unwrap();
    }

    #[test]
    fn test_lock_conflicts_between_handles() {
        let path = scratch_file("locks");
        let vfs = UnixVfs::new();
        let a = vfs
            .open(&path, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        let b = vfs.open(&path, OpenFlags::READWRITE).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        // Two reserved holders cannot coexist.
        a.lock(LockLevel::Reserved).unwrap();
        assert!(b.lock(LockLevel::Reserved).unwrap_err().is_busy());
        assert!(a.check_reserved_lock().unwrap());

        // Exclusive blocked while b still reads.
        assert!(a.lock(LockLevel::Exclusive).unwrap_err().is_busy());
        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();

        a.unlock(LockLevel::None).unwrap();
        assert!(!a.check_reserved_lock().unwrap());
        drop(a);
        drop(b);
        vfs.delete(&path, false).unwrap();
    }

    #[test]
    fn test_shm_map_shared_between_handles() {
        let path = scratch_file("shm");
        let vfs = UnixVfs::new();
        let a = vfs
            .open(&path, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        let b = vfs.open(&path, OpenFlags::READWRITE).unwrap();

        let pa = a.shm_map(0, true).unwrap();
        let pb = b.shm_map(0, true).unwrap();
        unsafe {
            std::ptr::write_volatile(pa.add(100), 0x5A);
            assert_eq!(std::ptr::read_volatile(pb.add(100)), 0x5A);
        }

        a.shm_unmap(false).unwrap();
        b.shm_unmap(true).unwrap();
        drop(a);
        drop(b);
        vfs.delete(&path, false).unwrap();
    }

    #[test]
    fn test_shm_lock_exclusion() {
        let path = scratch_file("shmlock");
        let vfs = UnixVfs::new();
        let a = vfs
            .open(&path, OpenFlags::READWRITE | OpenFlags::CREATE)
            .unwrap();
        let b = vfs.open(&path, OpenFlags::READWRITE).unwrap();
        a.shm_map(0, true).unwrap();
        b.shm_map(0, true).unwrap();

        a.shm_lock(0, 1, ShmLockFlags::LOCK | ShmLockFlags::EXCLUSIVE)
            .unwrap();
        assert!(b
            .shm_lock(0, 1, ShmLockFlags::LOCK | ShmLockFlags::SHARED)
            .unwrap_err()
            .is_busy());
        a.shm_lock(0, 1, ShmLockFlags::UNLOCK | ShmLockFlags::EXCLUSIVE)
            .unwrap();

        // Shared locks coexist.
        a.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::SHARED)
            .unwrap();
        b.shm_lock(3, 1, ShmLockFlags::LOCK | ShmLockFlags::SHARED)
            .unwrap();

        a.shm_unmap(false).unwrap();
        b.shm_unmap(true).unwrap();
        drop(a);
        drop(b);
        vfs.delete(&path, false).unwrap();
    }
}
