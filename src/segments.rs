// BWMAN SEGMENT HANDOFF
// THE BE WORKLOAD ADVERTISES ITS MIGRATABLE ADDRESS RANGES THROUGH A
// POSIX SHARED-MEMORY REGION. THE CONTROLLER POLLS FOR THE REGION AT
// STARTUP, COPIES THE RECORDS OUT, AND TREATS THE RANGES AS OPAQUE
// (pid, addr, len) TRIPLES FROM THEN ON.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};

pub const SHM_NAME: &str = "/bwman_segments";
const SHM_MAGIC: [u8; 8] = *b"BWSEGMT1";
const POLL_PERIOD: Duration = Duration::from_millis(100);
const MAX_SEGMENTS: u64 = 4096;

// WIRE LAYOUT OF THE HANDOFF REGION. RECORDS FOLLOW THE HEADER BACK TO
// BACK; ALL FIELDS ARE NATIVE-ENDIAN.
#[repr(C)]
struct ShmHeader {
    magic: [u8; 8],
    count: u64,
}

#[repr(C)]
struct ShmRecord {
    pid: i32,
    _pad: u32,
    addr: u64,
    len: u64,
}

// AN ADDRESS RANGE THE CONTROLLER MAY MIGRATE. CONTENTS ARE NEVER
// INSPECTED; ONLY BOUNDS AND OWNERSHIP MATTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub pid: i32,
    pub addr: u64,
    pub len: u64,
}

impl MemorySegment {
    pub fn new(pid: i32, addr: u64, len: u64, page_size: usize) -> Result<Self> {
        if len == 0 {
            bail!("segment for pid {} has zero length", pid);
        }
        if addr % page_size as u64 != 0 || len % page_size as u64 != 0 {
            bail!(
                "segment {:#x}+{:#x} for pid {} is not page-aligned",
                addr,
                len,
                pid
            );
        }
        Ok(Self { pid, addr, len })
    }

    pub fn page_count(&self, page_size: usize) -> usize {
        (self.len / page_size as u64) as usize
    }
}

// BLOCK UNTIL THE BE WORKLOAD PUBLISHES ITS SEGMENTS OR SHUTDOWN IS
// REQUESTED. RETURNS THE VALIDATED RECORDS; AN EMPTY REGION IS FATAL
// BECAUSE THE CONTROLLER WOULD HAVE NOTHING TO STEER.
pub fn wait_for_segments(shutdown: &AtomicBool, page_size: usize) -> Result<Vec<MemorySegment>> {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            bail!("shutdown requested before segments were published");
        }
        match try_read_segments(page_size) {
            Ok(Some(segments)) => return Ok(segments),
            Ok(None) => std::thread::sleep(POLL_PERIOD),
            Err(e) => return Err(e),
        }
    }
}

// Ok(None) WHEN THE REGION DOES NOT EXIST YET
fn try_read_segments(page_size: usize) -> Result<Option<Vec<MemorySegment>>> {
    let name = std::ffi::CString::new(SHM_NAME).context("shm name")?;
    let fd = unsafe { libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0) };
    if fd < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Ok(None);
        }
        bail!("shm_open({}) failed: {}", SHM_NAME, err);
    }

    let result = read_region(fd, page_size);
    unsafe { libc::close(fd) };
    result.map(Some)
}

fn read_region(fd: libc::c_int, page_size: usize) -> Result<Vec<MemorySegment>> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } < 0 {
        bail!("fstat on segment region: {}", std::io::Error::last_os_error());
    }
    let region_len = stat.st_size as usize;
    let header_len = std::mem::size_of::<ShmHeader>();
    if region_len < header_len {
        bail!("segment region truncated: {} bytes", region_len);
    }

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            region_len,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        bail!("mmap of segment region: {}", std::io::Error::last_os_error());
    }

    let result = (|| {
        let header = unsafe { &*(base as *const ShmHeader) };
        if header.magic != SHM_MAGIC {
            bail!("segment region has bad magic {:?}", header.magic);
        }
        if header.count == 0 {
            bail!("segment region advertises zero segments");
        }
        if header.count > MAX_SEGMENTS {
            bail!("segment region advertises {} segments", header.count);
        }
        let needed = header_len + header.count as usize * std::mem::size_of::<ShmRecord>();
        if region_len < needed {
            bail!(
                "segment region too small: {} bytes for {} records",
                region_len,
                header.count
            );
        }

        let records = unsafe {
            std::slice::from_raw_parts(
                (base as *const u8).add(header_len) as *const ShmRecord,
                header.count as usize,
            )
        };
        let mut segments = Vec::with_capacity(records.len());
        for r in records {
            segments.push(MemorySegment::new(r.pid, r.addr, r.len, page_size)?);
        }
        Ok(segments)
    })();

    unsafe { libc::munmap(base, region_len) };
    result
}

// TEAR DOWN THE HANDOFF REGION AT SHUTDOWN. BEST EFFORT; THE REGION MAY
// ALREADY BE GONE IF THE BE WORKLOAD EXITED FIRST.
pub fn destroy() {
    if let Ok(name) = std::ffi::CString::new(SHM_NAME) {
        unsafe { libc::shm_unlink(name.as_ptr()) };
    }
}
