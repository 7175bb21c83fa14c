//! Write-ahead log
//!
//! Committed pages are appended to `${db}-wal` as frames; the main database
//! file is only rewritten at checkpoint. Readers pin a snapshot by claiming
//! a read-mark slot in the shared-memory index, the single writer appends
//! frames and publishes a new `max_frame` through the twin-header protocol,
//! and the checkpointer copies frames back into the database file, resetting
//! the log once no reader needs it.

use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::{SyncFlags, Vfs, VfsFile};
use crate::storage::wal_index::{
    WalIndex, WalIndexHdr, WAL_CKPT_LOCK, WAL_NREADER, WAL_READ_LOCK0, WAL_RECOVER_LOCK,
    WAL_WRITE_LOCK,
};
use crate::types::{Pgno, SyncMode};
use crate::util::encoding::checksum_pair;

// ============================================================================
// Constants
// ============================================================================

/// WAL file magic number
pub const WAL_MAGIC: u32 = 0x57414c31; // "WAL1"

/// WAL file format version
pub const WAL_VERSION: u32 = 1;

/// WAL file header size in bytes
pub const WAL_HEADER_SIZE: usize = 32;

/// WAL frame header size in bytes
pub const WAL_FRAME_HEADER_SIZE: usize = 24;

/// Read lock value meaning "no lock held"
const NO_READ_LOCK: i32 = -1;

// ============================================================================
// WAL file header
// ============================================================================

/// Header at the start of the WAL file (32 bytes)
#[derive(Debug, Clone, Copy)]
pub struct WalHeader {
    pub magic: u32,
    pub version: u32,
    pub page_size: u32,
    pub checkpoint_seq: u32,
    pub salt1: u32,
    pub salt2: u32,
    pub checksum: [u32; 2],
}

impl WalHeader {
    pub fn new(page_size: u32, checkpoint_seq: u32, salt1: u32, salt2: u32) -> Self {
        let mut hdr = WalHeader {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            page_size,
            checkpoint_seq,
            salt1,
            salt2,
            checksum: [0, 0],
        };
        let bytes = hdr.to_bytes();
        let (c1, c2) = checksum_pair(&bytes[..24], (0, 0));
        hdr.checksum = [c1, c2];
        hdr
    }

    pub fn to_bytes(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.checkpoint_seq.to_le_bytes());
        buf[16..20].copy_from_slice(&self.salt1.to_le_bytes());
        buf[20..24].copy_from_slice(&self.salt2.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum[0].to_le_bytes());
        buf[28..32].copy_from_slice(&self.checksum[1].to_le_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_HEADER_SIZE {
            return Err(Error::corruption("WAL header truncated"));
        }
        let hdr = WalHeader {
            magic: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            version: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            page_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            checkpoint_seq: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            salt1: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
            salt2: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            checksum: [
                u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
                u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
            ],
        };
        if hdr.magic != WAL_MAGIC {
            return Err(Error::corruption("bad WAL magic"));
        }
        if hdr.version != WAL_VERSION {
            return Err(Error::corruption("unsupported WAL version"));
        }
        let (c1, c2) = checksum_pair(&data[..24], (0, 0));
        if hdr.checksum != [c1, c2] {
            return Err(Error::corruption("WAL header checksum mismatch"));
        }
        Ok(hdr)
    }
}

// ============================================================================
// WAL frame header
// ============================================================================

/// Header preceding each page image in the WAL (24 bytes, big-endian)
#[derive(Debug, Clone, Copy)]
pub struct WalFrameHdr {
    /// Page number this frame contains
    pub pgno: Pgno,
    /// Database size in pages after commit (0 for non-commit frames)
    pub db_size: Pgno,
    /// Salts, which must match the WAL header
    pub salt: [u32; 2],
    /// Cumulative checksum through this frame
    pub checksum: [u32; 2],
}

impl WalFrameHdr {
    pub fn is_commit(&self) -> bool {
        self.db_size > 0
    }

    pub fn to_bytes(&self) -> [u8; WAL_FRAME_HEADER_SIZE] {
        let mut buf = [0u8; WAL_FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.pgno.to_be_bytes());
        buf[4..8].copy_from_slice(&self.db_size.to_be_bytes());
        buf[8..12].copy_from_slice(&self.salt[0].to_be_bytes());
        buf[12..16].copy_from_slice(&self.salt[1].to_be_bytes());
        buf[16..20].copy_from_slice(&self.checksum[0].to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum[1].to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < WAL_FRAME_HEADER_SIZE {
            return Err(Error::corruption("WAL frame header truncated"));
        }
        Ok(WalFrameHdr {
            pgno: u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            db_size: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            salt: [
                u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            ],
            checksum: [
                u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
                u32::from_be_bytes([data[20], data[21], data[22], data[23]]),
            ],
        })
    }
}

// ============================================================================
// WAL connection
// ============================================================================

/// Per-connection WAL state
pub struct Wal {
    vfs: Rc<dyn Vfs>,
    wal_file: Rc<dyn VfsFile>,
    db_file: Rc<dyn VfsFile>,
    index: WalIndex,
    page_size: u32,

    /// Local snapshot of the index header for the current transaction
    hdr: WalIndexHdr,
    /// Header state as of begin_write, restored by undo
    txn_hdr: WalIndexHdr,
    /// First frame this connection must consult (frames below are
    /// backfilled into the database file)
    min_frame: u32,
    checkpoint_seq: u32,

    read_lock: i32,
    write_lock: bool,
}

impl Wal {
    /// Open the WAL for a database connection. The WAL file is created if
    /// missing; recovery runs lazily on the first read transaction.
    pub fn open(
        vfs: Rc<dyn Vfs>,
        db_file: Rc<dyn VfsFile>,
        wal_path: &str,
        page_size: u32,
    ) -> Result<Self> {
        use crate::os::vfs::OpenFlags;
        let wal_file = vfs.open(wal_path, OpenFlags::READWRITE | OpenFlags::CREATE)?;
        let index = WalIndex::new(Rc::clone(&db_file));
        Ok(Wal {
            vfs,
            wal_file,
            db_file,
            index,
            page_size,
            hdr: WalIndexHdr::new(page_size),
            txn_hdr: WalIndexHdr::new(page_size),
            min_frame: 1,
            checkpoint_seq: 0,
            read_lock: NO_READ_LOCK,
            write_lock: false,
        })
    }

    pub fn max_frame(&self) -> u32 {
        self.hdr.max_frame
    }

    /// Change counter of the current snapshot's index header
    pub fn change_counter(&self) -> u32 {
        self.hdr.change
    }

    pub fn salts(&self) -> [u32; 2] {
        self.hdr.salt
    }

    /// Database size in pages at the last commit, 0 if the WAL is empty
    pub fn db_size(&self) -> Pgno {
        if self.hdr.is_init != 0 && self.hdr.max_frame > 0 {
            self.hdr.n_page
        } else {
            0
        }
    }

    fn frame_offset(&self, frame: u32) -> i64 {
        let frame_size = (WAL_FRAME_HEADER_SIZE + self.page_size as usize) as i64;
        WAL_HEADER_SIZE as i64 + i64::from(frame - 1) * frame_size
    }

    // ========================================================================
    // Read transactions
    // ========================================================================

    /// Begin a read transaction: validate the index header (running
    /// recovery if needed) and pin a read-mark slot.
    pub fn begin_read(&mut self) -> Result<()> {
        if self.read_lock != NO_READ_LOCK {
            return Ok(());
        }

        let hdr = match self.index.read_header()? {
            Some(hdr) => hdr,
            None => self.run_recovery()?,
        };
        if hdr.decoded_page_size() != self.page_size && hdr.max_frame > 0 {
            return Err(Error::corruption("WAL page size mismatch"));
        }
        self.hdr = hdr;
        self.min_frame = self.index.backfill_count()?.saturating_add(1);

        // Prefer a slot already marked at or past our snapshot.
        for slot in 0..WAL_NREADER {
            if self.index.read_mark(slot)? >= self.hdr.max_frame {
                match self.index.lock_shared(WAL_READ_LOCK0 + slot) {
                    Ok(()) => {
                        // Re-check: the mark may have moved before the lock
                        // landed.
                        if self.index.read_mark(slot)? >= self.hdr.max_frame {
                            self.read_lock = slot as i32;
                            return Ok(());
                        }
                        self.index.unlock_shared(WAL_READ_LOCK0 + slot)?;
                    }
                    Err(err) if err.is_busy() => {}
                    Err(err) => return Err(err),
                }
            }
        }

        // Claim an unused slot and set its mark to our snapshot.
        for slot in 0..WAL_NREADER {
            match self.index.lock_exclusive(WAL_READ_LOCK0 + slot, 1) {
                Ok(()) => {
                    self.index.set_read_mark(slot, self.hdr.max_frame)?;
                    self.index.unlock_exclusive(WAL_READ_LOCK0 + slot, 1)?;
                    self.index.lock_shared(WAL_READ_LOCK0 + slot)?;
                    self.read_lock = slot as i32;
                    return Ok(());
                }
                Err(err) if err.is_busy() => {}
                Err(err) => return Err(err),
            }
        }
        Err(Error::busy_retry())
    }

    /// End the read transaction, releasing the read slot
    pub fn end_read(&mut self) -> Result<()> {
        if self.read_lock != NO_READ_LOCK {
            let slot = self.read_lock as usize;
            self.index.unlock_shared(WAL_READ_LOCK0 + slot)?;
            self.read_lock = NO_READ_LOCK;
        }
        Ok(())
    }

    /// Locate the newest frame for `pgno` visible to this snapshot
    pub fn find_frame(&mut self, pgno: Pgno) -> Result<Option<u32>> {
        if self.hdr.max_frame == 0 {
            return Ok(None);
        }
        self.index.lookup(pgno, self.min_frame, self.hdr.max_frame)
    }

    /// Read the page image of `frame` into `buf`
    pub fn read_frame(&self, frame: u32, buf: &mut [u8]) -> Result<()> {
        debug_assert!(frame > 0 && frame <= self.hdr.max_frame);
        let offset = self.frame_offset(frame) + WAL_FRAME_HEADER_SIZE as i64;
        let n = self.wal_file.read(buf, offset)?;
        if n < buf.len() {
            return Err(Error::corruption("WAL frame truncated"));
        }
        Ok(())
    }

    // ========================================================================
    // Write transactions
    // ========================================================================

    /// Acquire the writer lock. Fails with Busy (Retry) if another writer
    /// is active or if this connection's snapshot is stale.
    pub fn begin_write(&mut self) -> Result<()> {
        if self.write_lock {
            return Ok(());
        }
        debug_assert!(self.read_lock != NO_READ_LOCK);
        self.index.lock_exclusive(WAL_WRITE_LOCK, 1)?;

        // Another writer may have committed since this snapshot was taken;
        // writing on top of it would fork history.
        if let Some(current) = self.index.read_header()? {
            if current.max_frame != self.hdr.max_frame || current.salt != self.hdr.salt {
                self.index.unlock_exclusive(WAL_WRITE_LOCK, 1)?;
                return Err(Error::busy_retry());
            }
        }
        self.txn_hdr = self.hdr;
        self.write_lock = true;
        Ok(())
    }

    /// Release the writer lock
    pub fn end_write(&mut self) -> Result<()> {
        if self.write_lock {
            self.index.unlock_exclusive(WAL_WRITE_LOCK, 1)?;
            self.write_lock = false;
        }
        Ok(())
    }

    /// Append a batch of frames. When `commit_size` is nonzero the batch
    /// commits: the final frame carries the new database size, the WAL is
    /// synced per `sync_mode`, and the index header is published.
    pub fn write_frames(
        &mut self,
        frames: &[(Pgno, &[u8])],
        commit_size: Pgno,
        sync_mode: SyncMode,
    ) -> Result<()> {
        if !self.write_lock {
            return Err(Error::new(ErrorCode::InvalidArgument));
        }
        if frames.is_empty() {
            return Ok(());
        }

        if self.hdr.max_frame == 0 {
            self.restart_log()?;
        }

        let mut cksum = (self.hdr.frame_cksum[0], self.hdr.frame_cksum[1]);
        for (i, (pgno, data)) in frames.iter().enumerate() {
            debug_assert_eq!(data.len(), self.page_size as usize);
            let frame = self.hdr.max_frame + 1;
            let is_last = i == frames.len() - 1;
            let db_size = if is_last { commit_size } else { 0 };

            let mut frame_hdr = WalFrameHdr {
                pgno: *pgno,
                db_size,
                salt: self.hdr.salt,
                checksum: [0, 0],
            };
            let hdr_bytes = frame_hdr.to_bytes();
            cksum = checksum_pair(&hdr_bytes[0..8], cksum);
            cksum = checksum_pair(data, cksum);
            frame_hdr.checksum = [cksum.0, cksum.1];

            let offset = self.frame_offset(frame);
            self.wal_file.write(&frame_hdr.to_bytes(), offset)?;
            self.wal_file
                .write(data, offset + WAL_FRAME_HEADER_SIZE as i64)?;

            self.index.append(frame, *pgno)?;
            self.hdr.max_frame = frame;
            self.hdr.frame_cksum = [cksum.0, cksum.1];
        }

        if commit_size > 0 {
            match sync_mode {
                SyncMode::Off => {}
                SyncMode::Normal => self.wal_file.sync(SyncFlags::NORMAL)?,
                SyncMode::Full => self.wal_file.sync(SyncFlags::FULL)?,
            }
            self.hdr.n_page = commit_size;
            self.hdr.is_init = 1;
            self.hdr.change = self.hdr.change.wrapping_add(1);
            self.index.write_header(&self.hdr)?;
            self.txn_hdr = self.hdr;
        }
        Ok(())
    }

    /// Roll the logical WAL back to the last commit, discarding any frames
    /// appended by the current write transaction.
    pub fn undo(&mut self) -> Result<()> {
        if !self.write_lock {
            return Ok(());
        }
        let appended_max = self.hdr.max_frame;
        let committed_max = self.txn_hdr.max_frame;
        if appended_max > committed_max {
            self.index.rewind(appended_max, committed_max)?;
        }
        self.hdr = self.txn_hdr;
        Ok(())
    }

    /// Write a fresh WAL header; called when the first frame is appended to
    /// an empty (or freshly reset) log.
    fn restart_log(&mut self) -> Result<()> {
        if self.hdr.salt == [0, 0] {
            let mut raw = [0u8; 8];
            self.vfs.randomness(&mut raw);
            self.hdr.salt = [
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ];
        }
        let wal_hdr = WalHeader::new(
            self.page_size,
            self.checkpoint_seq,
            self.hdr.salt[0],
            self.hdr.salt[1],
        );
        let bytes = wal_hdr.to_bytes();
        self.wal_file.write(&bytes, 0)?;
        let seed = checksum_pair(&bytes[..24], (0, 0));
        self.hdr.frame_cksum = [seed.0, seed.1];
        Ok(())
    }

    // ========================================================================
    // Checkpoint
    // ========================================================================

    /// Copy committed frames into the database file. With `reset`, also
    /// rewind the WAL once every reader has moved past it. Returns
    /// (frames in the log, frames backfilled).
    pub fn checkpoint(
        &mut self,
        reset: bool,
        sync_mode: SyncMode,
        busy: &mut dyn FnMut(u32) -> bool,
    ) -> Result<(u32, u32)> {
        self.index.lock_exclusive(WAL_CKPT_LOCK, 1)?;
        let result = self.checkpoint_locked(reset, sync_mode, busy);
        let _ = self.index.unlock_exclusive(WAL_CKPT_LOCK, 1);
        result
    }

    fn checkpoint_locked(
        &mut self,
        reset: bool,
        sync_mode: SyncMode,
        busy: &mut dyn FnMut(u32) -> bool,
    ) -> Result<(u32, u32)> {
        self.index.lock_exclusive(WAL_WRITE_LOCK, 1)?;
        let result = self.checkpoint_writer_locked(reset, sync_mode, busy);
        let _ = self.index.unlock_exclusive(WAL_WRITE_LOCK, 1);
        result
    }

    fn checkpoint_writer_locked(
        &mut self,
        reset: bool,
        sync_mode: SyncMode,
        busy: &mut dyn FnMut(u32) -> bool,
    ) -> Result<(u32, u32)> {
        let hdr = match self.index.read_header()? {
            Some(hdr) => hdr,
            None => self.run_recovery()?,
        };
        self.hdr = hdr;
        let max_frame = hdr.max_frame;
        let backfill = self.index.backfill_count()?;
        if max_frame == 0 {
            return Ok((0, 0));
        }

        // A reader slot pinned below max_frame bounds how far we may copy.
        let mut safe_frame = max_frame;
        for slot in 0..WAL_NREADER {
            match self.index.lock_exclusive(WAL_READ_LOCK0 + slot, 1) {
                Ok(()) => {
                    // Unused slot: raise its mark so it no longer constrains
                    // this or future checkpoints.
                    self.index.set_read_mark(slot, max_frame)?;
                    self.index.unlock_exclusive(WAL_READ_LOCK0 + slot, 1)?;
                }
                Err(err) if err.is_busy() => {
                    let mark = self.index.read_mark(slot)?;
                    safe_frame = safe_frame.min(mark);
                }
                Err(err) => return Err(err),
            }
        }

        let mut copied = 0;
        if safe_frame > backfill {
            if sync_mode != SyncMode::Off {
                self.wal_file.sync(SyncFlags::NORMAL)?;
            }

            let mut page = vec![0u8; self.page_size as usize];
            let mut frame_hdr_buf = [0u8; WAL_FRAME_HEADER_SIZE];
            for frame in backfill + 1..=safe_frame {
                let offset = self.frame_offset(frame);
                let n = self.wal_file.read(&mut frame_hdr_buf, offset)?;
                if n < WAL_FRAME_HEADER_SIZE {
                    return Err(Error::corruption("WAL shorter than index"));
                }
                let frame_hdr = WalFrameHdr::from_bytes(&frame_hdr_buf)?;
                let n = self
                    .wal_file
                    .read(&mut page, offset + WAL_FRAME_HEADER_SIZE as i64)?;
                if n < page.len() {
                    return Err(Error::corruption("WAL frame truncated"));
                }
                let db_offset = i64::from(frame_hdr.pgno - 1) * i64::from(self.page_size);
                self.db_file.write(&page, db_offset)?;
                copied += 1;
            }

            // The committed image may be smaller than the physical file.
            let committed_bytes = i64::from(hdr.n_page) * i64::from(self.page_size);
            if self.db_file.file_size()? > committed_bytes {
                self.db_file.truncate(committed_bytes)?;
            }
            if sync_mode != SyncMode::Off {
                self.db_file.sync(SyncFlags::NORMAL)?;
            }
            self.index.set_backfill_count(safe_frame)?;
        }

        if reset && safe_frame == max_frame {
            self.try_reset_log(max_frame, busy)?;
        }
        Ok((max_frame, copied))
    }

    /// Rewind the WAL after a complete backfill. Every read slot must be
    /// drained first; the busy handler paces the wait.
    fn try_reset_log(&mut self, max_frame: u32, busy: &mut dyn FnMut(u32) -> bool) -> Result<()> {
        let mut held = 0;
        for slot in 0..WAL_NREADER {
            let mut attempt = 0;
            loop {
                match self.index.lock_exclusive(WAL_READ_LOCK0 + slot, 1) {
                    Ok(()) => {
                        held = slot + 1;
                        break;
                    }
                    Err(err) if err.is_busy() => {
                        attempt += 1;
                        if !busy(attempt) {
                            // A reader still pins the log; skip the reset.
                            for s in 0..held {
                                let _ = self.index.unlock_exclusive(WAL_READ_LOCK0 + s, 1);
                            }
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        for s in 0..held {
                            let _ = self.index.unlock_exclusive(WAL_READ_LOCK0 + s, 1);
                        }
                        return Err(err);
                    }
                }
            }
        }

        self.checkpoint_seq = self.checkpoint_seq.wrapping_add(1);
        let mut raw = [0u8; 4];
        self.vfs.randomness(&mut raw);
        self.hdr.salt = [
            self.hdr.salt[0].wrapping_add(1),
            u32::from_le_bytes(raw),
        ];
        self.hdr.max_frame = 0;
        self.hdr.frame_cksum = [0, 0];
        self.hdr.change = self.hdr.change.wrapping_add(1);
        self.index.write_header(&self.hdr)?;
        self.index.rewind(max_frame, 0)?;
        self.index.set_backfill_count(0)?;
        for slot in 0..WAL_NREADER {
            self.index.set_read_mark(slot, 0)?;
        }
        self.wal_file.truncate(0)?;
        self.txn_hdr = self.hdr;

        for slot in 0..WAL_NREADER {
            let _ = self.index.unlock_exclusive(WAL_READ_LOCK0 + slot, 1);
        }
        Ok(())
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    /// Rebuild the shared-memory index from the WAL file. Runs when the
    /// index header is missing or failed validation.
    fn run_recovery(&mut self) -> Result<WalIndexHdr> {
        self.index.lock_exclusive(WAL_RECOVER_LOCK, 1)?;
        let result = self.recover_locked();
        let _ = self.index.unlock_exclusive(WAL_RECOVER_LOCK, 1);
        result
    }

    fn recover_locked(&mut self) -> Result<WalIndexHdr> {
        // Another connection may have finished recovery while we waited.
        if let Some(hdr) = self.index.read_header()? {
            return Ok(hdr);
        }

        let mut hdr = WalIndexHdr::new(self.page_size);
        hdr.is_init = 1;

        let wal_size = self.wal_file.file_size()?;
        if wal_size < WAL_HEADER_SIZE as i64 {
            self.index.write_header(&hdr)?;
            self.index.set_backfill_count(0)?;
            return Ok(hdr);
        }

        let mut hdr_buf = [0u8; WAL_HEADER_SIZE];
        self.wal_file.read(&mut hdr_buf, 0)?;
        let wal_hdr = WalHeader::from_bytes(&hdr_buf)?;
        if wal_hdr.page_size != self.page_size {
            return Err(Error::corruption("WAL page size mismatch"));
        }
        self.checkpoint_seq = wal_hdr.checkpoint_seq;
        hdr.salt = [wal_hdr.salt1, wal_hdr.salt2];

        let mut cksum = checksum_pair(&hdr_buf[..24], (0, 0));
        let frame_size = WAL_FRAME_HEADER_SIZE + self.page_size as usize;
        let mut frame_buf = vec![0u8; frame_size];
        let mut frame = 0u32;
        let mut committed_max = 0u32;
        let mut committed_pages = 0u32;
        let mut committed_cksum = cksum;

        loop {
            let offset = WAL_HEADER_SIZE as i64 + i64::from(frame) * frame_size as i64;
            let n = self.wal_file.read(&mut frame_buf, offset)?;
            if n < frame_size {
                break;
            }
            let frame_hdr = WalFrameHdr::from_bytes(&frame_buf)?;
            if frame_hdr.salt != hdr.salt {
                break;
            }
            cksum = checksum_pair(&frame_buf[0..8], cksum);
            cksum = checksum_pair(&frame_buf[WAL_FRAME_HEADER_SIZE..], cksum);
            if frame_hdr.checksum != [cksum.0, cksum.1] {
                break;
            }
            frame += 1;
            self.index.append(frame, frame_hdr.pgno)?;
            if frame_hdr.is_commit() {
                committed_max = frame;
                committed_pages = frame_hdr.db_size;
                committed_cksum = cksum;
            }
        }

        // Frames past the last commit never became visible; discard them.
        if frame > committed_max {
            self.index.rewind(frame, committed_max)?;
        }
        hdr.max_frame = committed_max;
        hdr.n_page = committed_pages;
        hdr.frame_cksum = [committed_cksum.0, committed_cksum.1];
        self.index.write_header(&hdr)?;
        self.index.set_backfill_count(0)?;
        for slot in 0..WAL_NREADER {
            self.index.set_read_mark(slot, 0)?;
        }
        Ok(hdr)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    pub fn close(&mut self) -> Result<()> {
        self.end_write()?;
        self.end_read()?;
        self.index.close(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_header_roundtrip() {
        let hdr = WalHeader::new(4096, 3, 0x1111, 0x2222);
        let parsed = WalHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed.page_size, 4096);
        assert_eq!(parsed.checkpoint_seq, 3);
        assert_eq!(parsed.salt1, 0x1111);
        assert_eq!(parsed.salt2, 0x2222);
        assert_eq!(parsed.checksum, hdr.checksum);
    }

    #[test]
    fn test_wal_header_rejects_corruption() {
        let hdr = WalHeader::new(4096, 1, 1, 2);
        let mut bytes = hdr.to_bytes();
        bytes[8] ^= 0xff;
        assert!(WalHeader::from_bytes(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_frame_header_roundtrip() {
        let hdr = WalFrameHdr {
            pgno: 42,
            db_size: 100,
            salt: [0xdead_beef, 0xcafe_babe],
            checksum: [0x1234_5678, 0x9abc_def0],
        };
        let parsed = WalFrameHdr::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(parsed.pgno, 42);
        assert_eq!(parsed.db_size, 100);
        assert_eq!(parsed.salt, hdr.salt);
        assert_eq!(parsed.checksum, hdr.checksum);
        assert!(parsed.is_commit());
        assert!(!WalFrameHdr { db_size: 0, ..hdr }.is_commit());
    }

    #[cfg(unix)]
    mod unix_tests {
        use super::*;
        use crate::os::vfs::{OpenFlags, Vfs};
        use crate::os::unix::UnixVfs;

        const PAGE: usize = 512;

        struct Fixture {
            vfs: Rc<dyn Vfs>,
            db_path: String,
        }

        impl Fixture {
            fn new(name: &str) -> Self {
                let db_path = std::env::temp_dir()
                    .join(format!("otterdb-wal-{}", name))
                    .to_string_lossy()
                    .into_owned();
                for suffix in ["", "-wal", "-shm"] {
                    let _ = std::fs::remove_file(format!("{}{}", db_path, suffix));
                }
                Fixture {
                    vfs: Rc::new(UnixVfs::new()),
                    db_path,
                }
            }

            fn open_wal(&self) -> Wal {
                let db_file = self
                    .vfs
                    .open(&self.db_path, OpenFlags::READWRITE | OpenFlags::CREATE)
                    .unwrap();
                Wal::open(
                    Rc::clone(&self.vfs),
                    db_file,
                    &format!("{}-wal", self.db_path),
                    PAGE as u32,
                )
                .unwrap()
            }
        }

        impl Drop for Fixture {
            fn drop(&mut self) {
                for suffix in ["", "-wal", "-shm"] {
                    let _ = std::fs::remove_file(format!("{}{}", self.db_path, suffix));
                }
            }
        }

        fn page_of(byte: u8) -> Vec<u8> {
            vec![byte; PAGE]
        }

        #[test]
        fn test_commit_and_read_back() {
            let fx = Fixture::new("commit");
            let mut wal = fx.open_wal();
            wal.begin_read().unwrap();
            wal.begin_write().unwrap();

            let p1 = page_of(0x11);
            let p2 = page_of(0x22);
            wal.write_frames(&[(1, &p1), (2, &p2)], 2, SyncMode::Normal)
                .unwrap();

            assert_eq!(wal.max_frame(), 2);
            assert_eq!(wal.db_size(), 2);
            let frame = wal.find_frame(2).unwrap().unwrap();
            let mut buf = vec![0u8; PAGE];
            wal.read_frame(frame, &mut buf).unwrap();
            assert_eq!(buf, p2);

            wal.end_write().unwrap();
            wal.end_read().unwrap();
            wal.close().unwrap();
        }

        #[test]
        fn test_undo_discards_uncommitted_frames() {
            let fx = Fixture::new("undo");
            let mut wal = fx.open_wal();
            wal.begin_read().unwrap();
            wal.begin_write().unwrap();

            let p1 = page_of(0x11);
            wal.write_frames(&[(1, &p1)], 1, SyncMode::Off).unwrap();

            let p2 = page_of(0x22);
            wal.write_frames(&[(2, &p2)], 0, SyncMode::Off).unwrap();
            assert_eq!(wal.max_frame(), 2);

            wal.undo().unwrap();
            assert_eq!(wal.max_frame(), 1);
            assert_eq!(wal.find_frame(2).unwrap(), None);
            assert!(wal.find_frame(1).unwrap().is_some());

            wal.end_write().unwrap();
            wal.end_read().unwrap();
            wal.close().unwrap();
        }

        #[test]
        fn test_checkpoint_backfills_database() {
            let fx = Fixture::new("ckpt");
            let mut wal = fx.open_wal();
            wal.begin_read().unwrap();
            wal.begin_write().unwrap();
            let p1 = page_of(0xAA);
            let p2 = page_of(0xBB);
            wal.write_frames(&[(1, &p1), (2, &p2)], 2, SyncMode::Normal)
                .unwrap();
            wal.end_write().unwrap();
            wal.end_read().unwrap();

            let (in_log, copied) = wal
                .checkpoint(true, SyncMode::Normal, &mut |_| true)
                .unwrap();
            assert_eq!(in_log, 2);
            assert_eq!(copied, 2);
            assert_eq!(wal.max_frame(), 0);

            // The page images landed in the main file.
            let db_file = fx
                .vfs
                .open(&fx.db_path, OpenFlags::READWRITE)
                .unwrap();
            let mut buf = vec![0u8; PAGE];
            db_file.read(&mut buf, 0).unwrap();
            assert_eq!(buf, p1);
            db_file.read(&mut buf, PAGE as i64).unwrap();
            assert_eq!(buf, p2);
            wal.close().unwrap();
        }

        #[test]
        fn test_recovery_stops_at_broken_frame() {
            let fx = Fixture::new("recover");
            {
                let mut wal = fx.open_wal();
                wal.begin_read().unwrap();
                wal.begin_write().unwrap();
                let p1 = page_of(0x01);
                wal.write_frames(&[(1, &p1)], 1, SyncMode::Normal).unwrap();
                let p2 = page_of(0x02);
                wal.write_frames(&[(1, &p2)], 1, SyncMode::Normal).unwrap();
                wal.end_write().unwrap();
                wal.end_read().unwrap();
                wal.close().unwrap();
            }

            // Corrupt the second frame's image and discard the index so the
            // next connection must recover from the file.
            let wal_path = format!("{}-wal", fx.db_path);
            {
                use std::io::{Seek, SeekFrom, Write};
                let mut f = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&wal_path)
                    .unwrap();
                let second_frame = WAL_HEADER_SIZE as u64
                    + (WAL_FRAME_HEADER_SIZE + PAGE) as u64
                    + WAL_FRAME_HEADER_SIZE as u64;
                f.seek(SeekFrom::Start(second_frame + 10)).unwrap();
                f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
            }
            let _ = std::fs::remove_file(format!("{}-shm", fx.db_path));

            let mut wal = fx.open_wal();
            wal.begin_read().unwrap();
            assert_eq!(wal.max_frame(), 1);
            let frame = wal.find_frame(1).unwrap().unwrap();
            let mut buf = vec![0u8; PAGE];
            wal.read_frame(frame, &mut buf).unwrap();
            assert_eq!(buf, page_of(0x01));
            wal.end_read().unwrap();
            wal.close().unwrap();
        }

        #[test]
        fn test_recovery_discards_frames_after_last_commit() {
            let fx = Fixture::new("tail");
            {
                let mut wal = fx.open_wal();
                wal.begin_read().unwrap();
                wal.begin_write().unwrap();
                let p1 = page_of(0x01);
                wal.write_frames(&[(1, &p1)], 1, SyncMode::Normal).unwrap();
                // Spilled but never committed.
                let p2 = page_of(0x02);
                wal.write_frames(&[(2, &p2)], 0, SyncMode::Off).unwrap();
                wal.end_write().unwrap();
                wal.end_read().unwrap();
                wal.close().unwrap();
            }
            let _ = std::fs::remove_file(format!("{}-shm", fx.db_path));

            let mut wal = fx.open_wal();
            wal.begin_read().unwrap();
            assert_eq!(wal.max_frame(), 1);
            assert_eq!(wal.db_size(), 1);
            assert_eq!(wal.find_frame(2).unwrap(), None);
            wal.end_read().unwrap();
            wal.close().unwrap();
        }

        #[test]
        fn test_second_writer_is_blocked() {
            let fx = Fixture::new("writers");
            let mut w1 = fx.open_wal();
            let mut w2 = fx.open_wal();

            w1.begin_read().unwrap();
            w1.begin_write().unwrap();

            w2.begin_read().unwrap();
            assert!(w2.begin_write().unwrap_err().is_busy());

            w1.end_write().unwrap();
            w2.begin_write().unwrap();
            w2.end_write().unwrap();

            w1.end_read().unwrap();
            w2.end_read().unwrap();
            w1.close().unwrap();
            w2.close().unwrap();
        }

        #[test]
        fn test_reader_snapshot_is_stable_across_commit() {
            let fx = Fixture::new("snapshot");
            let mut writer = fx.open_wal();
            let mut reader = fx.open_wal();

            writer.begin_read().unwrap();
            writer.begin_write().unwrap();
            let p1 = page_of(0x0A);
            writer
                .write_frames(&[(1, &p1)], 1, SyncMode::Normal)
                .unwrap();
            writer.end_write().unwrap();
            writer.end_read().unwrap();

            // Reader pins the one-frame snapshot.
            reader.begin_read().unwrap();
            let seen = reader.find_frame(1).unwrap().unwrap();

            // Writer commits a newer version of page 1.
            writer.begin_read().unwrap();
            writer.begin_write().unwrap();
            let p1b = page_of(0x0B);
            writer
                .write_frames(&[(1, &p1b)], 1, SyncMode::Normal)
                .unwrap();
            writer.end_write().unwrap();
            writer.end_read().unwrap();

            // The reader still resolves page 1 to its original frame.
            assert_eq!(reader.find_frame(1).unwrap(), Some(seen));
            let mut buf = vec![0u8; PAGE];
            reader.read_frame(seen, &mut buf).unwrap();
            assert_eq!(buf, page_of(0x0A));

            // A fresh transaction observes the new commit.
            reader.end_read().unwrap();
            reader.begin_read().unwrap();
            let newer = reader.find_frame(1).unwrap().unwrap();
            assert!(newer > seen);
            reader.end_read().unwrap();

            writer.close().unwrap();
            reader.close().unwrap();
        }

        #[test]
        fn test_checkpoint_reset_deferred_while_reader_pinned() {
            let fx = Fixture::new("pinned");
            let mut writer = fx.open_wal();
            let mut reader = fx.open_wal();

            writer.begin_read().unwrap();
            writer.begin_write().unwrap();
            let p1 = page_of(0x33);
            writer
                .write_frames(&[(1, &p1)], 1, SyncMode::Normal)
                .unwrap();
            writer.end_write().unwrap();
            writer.end_read().unwrap();

            reader.begin_read().unwrap();

            // The reader's mark equals max_frame, so backfill proceeds, but
            // the reset must be skipped while the slot is held.
            let (_, copied) = writer
                .checkpoint(true, SyncMode::Normal, &mut |_| false)
                .unwrap();
            assert_eq!(copied, 1);
            assert_eq!(writer.max_frame(), 1);

            reader.end_read().unwrap();
            let (_, _) = writer
                .checkpoint(true, SyncMode::Normal, &mut |_| true)
                .unwrap();
            assert_eq!(writer.max_frame(), 0);

            writer.close().unwrap();
            reader.close().unwrap();
        }
    }
}
