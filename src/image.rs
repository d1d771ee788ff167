//! Image mapping
//!
//! Parses a relocatable executable image from untrusted header bytes and
//! maps it into the address space:
//!
//! 1. Reserve and commit a zero-filled region sized to the whole image at
//!    the preferred base, or anywhere when the preferred base is occupied.
//! 2. Place the header bytes; magics and the section table were validated
//!    against the header region during parsing.
//! 3. Reject images built for a different instruction set.
//! 4. Copy section contents from the file; shared writable sections come
//!    from the shared backing store instead; uninitialized data stays zero.
//! 5. Apply base relocations when the image did not land at its preferred
//!    base. Unknown relocation kinds are logged and skipped.
//! 6. Re-protect the header read-only.
//! 7. Re-protect each section to its declared protection; sections whose
//!    declared protection excludes write get a lazy-write hook instead of
//!    immediate write access.
//! 8. Any failure unmaps everything from step 1 and reports one error.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;

use log::{debug, warn};
use spin::Mutex;

use crate::error::{ImageError, VmError};
use crate::fault::FaultHook;
use crate::protect::GuestProt;
use crate::space::AddressSpace;
use crate::view::{Backing, BackingKind, ViewFlags};
use crate::round_page;

// ============================================================================
// Image format constants
// ============================================================================

/// Stub magic "MZ"
const STUB_MAGIC: u16 = 0x5a4d;
/// Offset of the new-header pointer inside the stub
const NEW_HEADER_PTR: usize = 0x3c;
/// Image magic "PE\0\0"
const IMAGE_MAGIC: u32 = 0x0000_4550;
/// 32-bit optional header magic
const OPT_MAGIC_32: u16 = 0x010b;

/// i386 machine id
const MACHINE_I386: u16 = 0x014c;
/// ARM machine id
const MACHINE_ARM: u16 = 0x01c0;

/// Machine id the host executes natively.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub(crate) const MACHINE_NATIVE: u16 = MACHINE_I386;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
pub(crate) const MACHINE_NATIVE: u16 = MACHINE_ARM;

/// Section holds uninitialized data
const SCN_UNINITIALIZED: u32 = 0x0000_0080;
/// Section is shared between processes
const SCN_SHARED: u32 = 0x1000_0000;
/// Section is executable
const SCN_EXECUTE: u32 = 0x2000_0000;
/// Section is readable
const SCN_READ: u32 = 0x4000_0000;
/// Section is writable
const SCN_WRITE: u32 = 0x8000_0000;

/// Relocation kinds (top nibble of an entry)
const REL_ABSOLUTE: u16 = 0;
const REL_HIGH: u16 = 1;
const REL_LOW: u16 = 2;
const REL_HIGHLOW: u16 = 3;

const COFF_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
/// Optional-header size that still contains the base-relocation directory
const OPT_SIZE_WITH_RELOC_DIR: usize = 0x90;
/// Base-relocation directory entry offset inside the optional header
const RELOC_DIR_OFFSET: usize = 0x88;

// ============================================================================
// Header parsing
// ============================================================================

fn u16_at(bytes: &[u8], off: usize) -> Result<u16, ImageError> {
    bytes
        .get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(ImageError::Truncated)
}

fn u32_at(bytes: &[u8], off: usize) -> Result<u32, ImageError> {
    bytes
        .get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(ImageError::Truncated)
}

/// Section descriptor, transient: consumed during the mapping call.
#[derive(Debug, Clone, Copy)]
struct SectionInfo {
    virtual_addr: usize,
    virtual_size: usize,
    raw_offset: usize,
    raw_size: usize,
    characteristics: u32,
}

impl SectionInfo {
    fn mem_size(&self) -> usize {
        if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        }
    }

    fn writable(&self) -> bool {
        self.characteristics & SCN_WRITE != 0
    }

    fn shared(&self) -> bool {
        self.characteristics & SCN_SHARED != 0
    }

    fn uninitialized(&self) -> bool {
        self.characteristics & SCN_UNINITIALIZED != 0
    }

    /// Declared final protection from the characteristics bits.
    fn final_prot(&self) -> GuestProt {
        let read = self.characteristics & SCN_READ != 0;
        let write = self.writable();
        let exec = self.characteristics & SCN_EXECUTE != 0;
        match (read, write, exec) {
            (_, true, true) => GuestProt::EXECUTE_READWRITE,
            (true, false, true) => GuestProt::EXECUTE_READ,
            (false, false, true) => GuestProt::EXECUTE,
            (_, true, false) => GuestProt::READWRITE,
            (true, false, false) => GuestProt::READONLY,
            (false, false, false) => GuestProt::NOACCESS,
        }
    }
}

struct ImageInfo {
    machine: u16,
    preferred_base: usize,
    size_of_image: usize,
    size_of_headers: usize,
    sections: Vec<SectionInfo>,
    reloc_dir: Option<(usize, usize)>,
}

/// Validate the header bytes and extract what the mapper needs.
fn parse_headers(header: &[u8]) -> Result<ImageInfo, ImageError> {
    if u16_at(header, 0)? != STUB_MAGIC {
        return Err(ImageError::BadMagic);
    }
    let new_off = u32_at(header, NEW_HEADER_PTR)? as usize;
    if u32_at(header, new_off)? != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }

    let coff = new_off + 4;
    let machine = u16_at(header, coff)?;
    let section_count = u16_at(header, coff + 2)? as usize;
    let opt_size = u16_at(header, coff + 16)? as usize;

    let opt = coff + COFF_SIZE;
    if u16_at(header, opt)? != OPT_MAGIC_32 {
        return Err(ImageError::BadMagic);
    }
    let preferred_base = u32_at(header, opt + 28)? as usize;
    let size_of_image = u32_at(header, opt + 56)? as usize;
    let size_of_headers = u32_at(header, opt + 60)? as usize;
    if size_of_image == 0 || size_of_image < size_of_headers {
        return Err(ImageError::Truncated);
    }

    let reloc_dir = if opt_size >= OPT_SIZE_WITH_RELOC_DIR {
        let rva = u32_at(header, opt + RELOC_DIR_OFFSET)? as usize;
        let len = u32_at(header, opt + RELOC_DIR_OFFSET + 4)? as usize;
        (len > 0).then_some((rva, len))
    } else {
        None
    };

    // The section table must fit inside the header region.
    let table = opt + opt_size;
    let table_end = table
        .checked_add(section_count * SECTION_HEADER_SIZE)
        .ok_or(ImageError::SectionTableOutOfBounds)?;
    if table_end > size_of_headers || table_end > header.len() {
        return Err(ImageError::SectionTableOutOfBounds);
    }

    let mut sections = Vec::with_capacity(section_count);
    for i in 0..section_count {
        let hdr = table + i * SECTION_HEADER_SIZE;
        let section = SectionInfo {
            virtual_size: u32_at(header, hdr + 8)? as usize,
            virtual_addr: u32_at(header, hdr + 12)? as usize,
            raw_size: u32_at(header, hdr + 16)? as usize,
            raw_offset: u32_at(header, hdr + 20)? as usize,
            characteristics: u32_at(header, hdr + 36)?,
        };
        let end = section
            .virtual_addr
            .checked_add(section.mem_size())
            .ok_or(ImageError::SectionOutOfBounds)?;
        if end > size_of_image {
            return Err(ImageError::SectionOutOfBounds);
        }
        sections.push(section);
    }

    Ok(ImageInfo {
        machine,
        preferred_base,
        size_of_image,
        size_of_headers,
        sections,
        reloc_dir,
    })
}

// ============================================================================
// Shared backing store
// ============================================================================

/// One shared section's identity in the pool: the image file it came from
/// plus its virtual address inside that image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct SlotKey {
    dev: u64,
    ino: u64,
    rva: usize,
}

fn slot_key(file: BorrowedFd<'_>, rva: usize) -> Result<SlotKey, VmError> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    let rc = unsafe { libc::fstat(file.as_raw_fd(), st.as_mut_ptr()) };
    if rc != 0 {
        return Err(VmError::NoMemory);
    }
    let st = unsafe { st.assume_init() };
    Ok(SlotKey {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        rva,
    })
}

struct Slots {
    next: u64,
    offsets: std::collections::BTreeMap<SlotKey, u64>,
}

/// Append-only backing pool for sections several mappings observe at once.
/// Consumed as a descriptor plus a running offset; each section of each
/// image file gets one slot, so every later mapping of that section reuses
/// the slot the first mapping claimed and the writes stay shared.
pub struct SharedStore {
    fd: OwnedFd,
    slots: Mutex<Slots>,
}

impl SharedStore {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            slots: Mutex::new(Slots {
                next: 0,
                offsets: std::collections::BTreeMap::new(),
            }),
        }
    }

    /// Slot for one section, appending `size` bytes (page-rounded) to the
    /// pool on the first claim. The `bool` is true for that first claim, so
    /// exactly one mapper seeds the slot from the file.
    fn claim(
        &self,
        file: BorrowedFd<'_>,
        rva: usize,
        size: usize,
    ) -> Result<(RawFd, u64, bool), VmError> {
        let key = slot_key(file, rva)?;
        let size = round_page(size) as u64;
        let mut slots = self.slots.lock();
        if let Some(&offset) = slots.offsets.get(&key) {
            return Ok((self.fd.as_raw_fd(), offset, false));
        }
        let offset = slots.next;
        slots.next += size;
        let rc = unsafe { libc::ftruncate(self.fd.as_raw_fd(), slots.next as libc::off_t) };
        if rc != 0 {
            return Err(VmError::NoMemory);
        }
        slots.offsets.insert(key, offset);
        Ok((self.fd.as_raw_fd(), offset, true))
    }
}

// ============================================================================
// Mapping
// ============================================================================

impl AddressSpace {
    /// Map an executable image.
    ///
    /// # Arguments
    /// * `file` - readable descriptor for the image file
    /// * `header` - header bytes already read from the file
    /// * `preferred` - overrides the image's own preferred base
    /// * `shared` - backing pool, required only for shared writable sections
    ///
    /// # Returns
    /// The base the image was mapped at. On failure nothing of the image is
    /// left mapped.
    pub fn map_image(
        &self,
        file: BorrowedFd<'_>,
        header: &[u8],
        preferred: Option<usize>,
        shared: Option<&SharedStore>,
    ) -> Result<usize, VmError> {
        let info = parse_headers(header)?;
        if info.machine != MACHINE_NATIVE {
            return Err(ImageError::WrongMachine(info.machine).into());
        }
        let size = round_page(info.size_of_image);
        let want = preferred.unwrap_or(info.preferred_base);

        // Step 1: the whole image region, zero-filled, at exactly the
        // preferred base; occupancy falls back to anywhere plus relocation.
        let prot = GuestProt::EXECUTE_WRITECOPY;
        let base = match self.reserve_preferred(want, size, prot, ViewFlags::SYSTEM)? {
            Some(base) => base,
            None => self.reserve(None, size, prot, ViewFlags::SYSTEM)?,
        };
        let relocated = base != want;
        let backing = match file.try_clone_to_owned() {
            Ok(fd) => Backing::new(fd, BackingKind::Image),
            Err(_) => {
                let _ = self.release(base, 0);
                return Err(VmError::NoMemory);
            }
        };
        self.attach_backing(base, backing);

        match self.map_image_at(base, size, file, header, &info, relocated, want, shared) {
            Ok(()) => {
                debug!(
                    "image mapped base={base:#x} size={size:#x} relocated={relocated}"
                );
                Ok(base)
            }
            Err(err) => {
                let _ = self.release(base, 0);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn map_image_at(
        &self,
        base: usize,
        size: usize,
        file: BorrowedFd<'_>,
        header: &[u8],
        info: &ImageInfo,
        relocated: bool,
        want: usize,
        shared: Option<&SharedStore>,
    ) -> Result<(), VmError> {
        // Transient read/write/execute access over the whole region.
        self.commit(base, size, GuestProt::EXECUTE_READWRITE)?;
        let image = unsafe { std::slice::from_raw_parts_mut(base as *mut u8, size) };

        // Step 2: header region.
        let from_slice = info.size_of_headers.min(header.len());
        image[..from_slice].copy_from_slice(&header[..from_slice]);
        if from_slice < info.size_of_headers {
            read_exact_at(
                self,
                file,
                &mut image[from_slice..info.size_of_headers],
                from_slice as u64,
            )?;
        }

        // Step 4: section contents.
        for section in &info.sections {
            if section.shared() && section.writable() {
                self.map_shared_section(base, file, section, shared)?;
                continue;
            }
            if section.uninitialized() || section.raw_size == 0 {
                // Already zero from step 1.
                continue;
            }
            let copy = section.raw_size.min(section.mem_size());
            let dst = image
                .get_mut(section.virtual_addr..section.virtual_addr + copy)
                .ok_or(ImageError::SectionOutOfBounds)?;
            read_exact_at(self, file, dst, section.raw_offset as u64)?;
            // The gap up to the virtual size stays zero-filled.
        }

        // Step 5: base relocations.
        if relocated {
            apply_relocations(image, info, base.wrapping_sub(want) as u32)?;
        }

        // Step 6: the header becomes read-only.
        self.protect(base, round_page(info.size_of_headers), GuestProt::READONLY)?;

        // Step 7: declared section protections. A section without write in
        // its declared protection is left non-writable and covered by the
        // lazy-write hook instead.
        let mut lazy: Option<(usize, usize)> = None;
        for section in &info.sections {
            let len = round_page(section.mem_size());
            if len == 0 {
                continue;
            }
            let va = base + section.virtual_addr;
            self.protect(va, len, section.final_prot())?;
            if !section.writable() {
                lazy = Some(match lazy {
                    None => (va, va + len),
                    Some((lo, hi)) => (lo.min(va), hi.max(va + len)),
                });
            }
        }
        if let Some((lo, hi)) = lazy {
            let hook: FaultHook = Arc::new(|space, addr| space.promote_lazy_page(addr));
            self.install_fault_hook(base, lo..hi, hook);
        }
        Ok(())
    }

    fn map_shared_section(
        &self,
        base: usize,
        file: BorrowedFd<'_>,
        section: &SectionInfo,
        shared: Option<&SharedStore>,
    ) -> Result<(), VmError> {
        let store = shared.ok_or(VmError::InvalidParameter)?;
        let len = round_page(section.mem_size());
        if len == 0 {
            return Ok(());
        }
        let va = base + section.virtual_addr;
        let (fd, offset, first) = store.claim(file, section.virtual_addr, len)?;
        // Mapped writable first so the file contents can seed the pool; the
        // declared protection is applied with every other section's.
        let transient = GuestProt::READWRITE.to_page() | crate::protect::PageProt::COMMITTED;
        self.host()
            .map_file(va, len, fd, offset, transient.to_host(), true)
            .map_err(|_| VmError::NoMemory)?;
        // Only the first claimant seeds the slot; a later mapping must see
        // the writes made through the earlier ones, not the file bytes.
        if first && section.raw_size > 0 {
            let copy = section.raw_size.min(section.mem_size());
            let dst = unsafe { std::slice::from_raw_parts_mut(va as *mut u8, copy) };
            read_exact_at(self, file, dst, section.raw_offset as u64)?;
        }
        Ok(())
    }
}

/// Fill `buf` from the file at `offset`; anything short is a truncated image.
fn read_exact_at(
    space: &AddressSpace,
    file: BorrowedFd<'_>,
    buf: &mut [u8],
    offset: u64,
) -> Result<(), VmError> {
    let n = space
        .host()
        .read_at(file.as_raw_fd(), buf, offset)
        .map_err(|_| ImageError::SectionRead)?;
    if n != buf.len() {
        return Err(ImageError::SectionRead.into());
    }
    Ok(())
}

// ============================================================================
// Relocation
// ============================================================================

/// Walk the relocation blocks and patch the image in place by `delta`.
fn apply_relocations(image: &mut [u8], info: &ImageInfo, delta: u32) -> Result<(), VmError> {
    let Some((dir_rva, dir_len)) = info.reloc_dir else {
        // Nothing to patch with; the image keeps its preferred-base values.
        warn!("image moved but carries no relocation data");
        return Ok(());
    };
    let dir_end = dir_rva
        .checked_add(dir_len)
        .filter(|&end| end <= image.len())
        .ok_or(ImageError::SectionOutOfBounds)?;

    let mut block = dir_rva;
    while block + 8 <= dir_end {
        let page_rva = u32_at(image, block).map_err(VmError::from)? as usize;
        let block_len = u32_at(image, block + 4).map_err(VmError::from)? as usize;
        if block_len < 8 || block + block_len > dir_end {
            return Err(ImageError::SectionOutOfBounds.into());
        }
        for entry_off in ((block + 8)..(block + block_len)).step_by(2) {
            let entry = u16_at(image, entry_off).map_err(VmError::from)?;
            let kind = entry >> 12;
            let target = page_rva + (entry & 0xfff) as usize;
            match kind {
                REL_ABSOLUTE => {}
                REL_HIGHLOW => {
                    let value = u32_at(image, target).map_err(|_| ImageError::SectionOutOfBounds)?;
                    image[target..target + 4]
                        .copy_from_slice(&value.wrapping_add(delta).to_le_bytes());
                }
                REL_HIGH => {
                    let value = u16_at(image, target).map_err(|_| ImageError::SectionOutOfBounds)?;
                    let patched = value.wrapping_add((delta >> 16) as u16);
                    image[target..target + 2].copy_from_slice(&patched.to_le_bytes());
                }
                REL_LOW => {
                    let value = u16_at(image, target).map_err(|_| ImageError::SectionOutOfBounds)?;
                    let patched = value.wrapping_add(delta as u16);
                    image[target..target + 2].copy_from_slice(&patched.to_le_bytes());
                }
                other => {
                    // Non-fatal per the loader contract.
                    warn!("unknown relocation kind {other} at rva {target:#x}, skipped");
                }
            }
        }
        block += block_len;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::PosixMem;
    use crate::protect::PageState;
    use crate::region::RegionKind;
    use crate::space::NoReservations;
    use crate::fault::{AccessKind, FaultDisposition};
    use crate::{round_granule, GRANULARITY};
    use std::fs::File;
    use std::io::{Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    const ARENA: usize = 0x100_0000;

    /// Address space over a probed free hole, backed by real memory.
    fn scratch_space() -> AddressSpace {
        let probe = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                ARENA + GRANULARITY,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(probe, libc::MAP_FAILED);
        unsafe { libc::munmap(probe, ARENA + GRANULARITY) };
        let floor = round_granule(probe as usize);
        AddressSpace::with_limits(
            Box::new(PosixMem),
            Box::new(NoReservations),
            floor,
            floor + ARENA,
        )
    }

    struct FixtureSection {
        virtual_addr: u32,
        virtual_size: u32,
        characteristics: u32,
        raw: Vec<u8>,
    }

    /// Build a minimal well-formed image: stub, headers, section table, and
    /// raw section data laid out sequentially from file offset 0x1000.
    fn build_image(machine: u16, preferred: u32, sections: &[FixtureSection]) -> Vec<u8> {
        const HEADERS: usize = 0x1000;
        let new_off = 0x80usize;
        let opt = new_off + 4 + COFF_SIZE;
        let opt_size = OPT_SIZE_WITH_RELOC_DIR;

        let image_end = sections
            .iter()
            .map(|s| s.virtual_addr + s.virtual_size.max(s.raw.len() as u32))
            .max()
            .unwrap_or(0) as usize;
        let size_of_image = round_page(image_end.max(HEADERS));

        let mut file = vec![0u8; HEADERS];
        file[0..2].copy_from_slice(&STUB_MAGIC.to_le_bytes());
        file[NEW_HEADER_PTR..NEW_HEADER_PTR + 4].copy_from_slice(&(new_off as u32).to_le_bytes());
        file[new_off..new_off + 4].copy_from_slice(&IMAGE_MAGIC.to_le_bytes());

        let coff = new_off + 4;
        file[coff..coff + 2].copy_from_slice(&machine.to_le_bytes());
        file[coff + 2..coff + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        file[coff + 16..coff + 18].copy_from_slice(&(opt_size as u16).to_le_bytes());

        file[opt..opt + 2].copy_from_slice(&OPT_MAGIC_32.to_le_bytes());
        file[opt + 28..opt + 32].copy_from_slice(&preferred.to_le_bytes());
        file[opt + 56..opt + 60].copy_from_slice(&(size_of_image as u32).to_le_bytes());
        file[opt + 60..opt + 64].copy_from_slice(&(HEADERS as u32).to_le_bytes());

        // Section table and raw data.
        let table = opt + opt_size;
        let mut raw_offset = HEADERS;
        for (i, section) in sections.iter().enumerate() {
            let hdr = table + i * SECTION_HEADER_SIZE;
            file[hdr..hdr + 8].copy_from_slice(b".sect\0\0\0");
            file[hdr + 8..hdr + 12].copy_from_slice(&section.virtual_size.to_le_bytes());
            file[hdr + 12..hdr + 16].copy_from_slice(&section.virtual_addr.to_le_bytes());
            file[hdr + 16..hdr + 20].copy_from_slice(&(section.raw.len() as u32).to_le_bytes());
            file[hdr + 20..hdr + 24].copy_from_slice(&(raw_offset as u32).to_le_bytes());
            file[hdr + 36..hdr + 40].copy_from_slice(&section.characteristics.to_le_bytes());
            raw_offset += section.raw.len();
        }
        for section in sections {
            file.extend_from_slice(&section.raw);
        }

        file
    }

    fn set_reloc_dir(file: &mut [u8], rva: u32, len: u32) {
        let new_off = 0x80usize;
        let opt = new_off + 4 + COFF_SIZE;
        file[opt + RELOC_DIR_OFFSET..opt + RELOC_DIR_OFFSET + 4]
            .copy_from_slice(&rva.to_le_bytes());
        file[opt + RELOC_DIR_OFFSET + 4..opt + RELOC_DIR_OFFSET + 8]
            .copy_from_slice(&len.to_le_bytes());
    }

    fn write_temp(bytes: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file
    }

    fn data_section(values: &[(usize, u32)]) -> FixtureSection {
        let mut raw = vec![0u8; 0x1000];
        for &(off, value) in values {
            raw[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
        FixtureSection {
            virtual_addr: 0x1000,
            virtual_size: 0x1000,
            characteristics: SCN_READ | SCN_WRITE,
            raw,
        }
    }

    /// Relocation block patching the data section: two HIGHLOW sites, one
    /// HIGH, one LOW, plus alignment padding.
    fn reloc_section(virtual_addr: u32) -> FixtureSection {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0x1000u32.to_le_bytes()); // page rva
        raw.extend_from_slice(&20u32.to_le_bytes()); // block size
        for entry in [
            (REL_HIGHLOW << 12) | 0x10,
            (REL_HIGHLOW << 12) | 0x20,
            (REL_HIGH << 12) | 0x30,
            (REL_LOW << 12) | 0x32,
            (REL_ABSOLUTE << 12),
            (REL_ABSOLUTE << 12),
        ] {
            raw.extend_from_slice(&entry.to_le_bytes());
        }
        FixtureSection {
            virtual_addr,
            virtual_size: raw.len() as u32,
            characteristics: SCN_READ,
            raw,
        }
    }

    #[test]
    fn maps_at_preferred_base_without_relocation() {
        let space = scratch_space();
        // Page-aligned but off the allocation granularity: a preferred base
        // is tried exactly, never rounded to the granularity.
        let preferred = space.floor() + 0x41000;
        let bytes = build_image(
            MACHINE_NATIVE,
            preferred as u32,
            &[data_section(&[(0x10, 0x1234_5678)])],
        );
        let file = write_temp(&bytes);

        // The header's own base field is 32-bit; the probed arena is not, so
        // the caller supplies the placement.
        let base = space
            .map_image(file.as_fd(), &bytes, Some(preferred), None)
            .unwrap();
        assert_eq!(base, preferred);

        // Section bytes came from the file, the tail stayed zero.
        let word = unsafe { ((base + 0x1010) as *const u32).read_unaligned() };
        assert_eq!(word, 0x1234_5678);
        let zero = unsafe { ((base + 0x1800) as *const u32).read_unaligned() };
        assert_eq!(zero, 0);

        let info = space.query(base);
        assert_eq!(info.kind, RegionKind::Image);
        assert_eq!(info.state, PageState::Committed);
        assert_eq!(info.prot, GuestProt::READONLY); // header

        space.release(base, 0).unwrap();
    }

    #[test]
    fn occupied_preferred_base_forces_relocation() {
        let space = scratch_space();
        let preferred = space.floor() + 0x40000;
        // The values the fixture relocation block patches.
        let original_highlow_a = preferred as u32 + 0x1234;
        let original_highlow_b = 0xdead_beef;
        let original_high: u16 = 0x0040;
        let original_low: u16 = 0x1234;
        let mut data = data_section(&[(0x10, original_highlow_a), (0x20, original_highlow_b)]);
        data.raw[0x30..0x32].copy_from_slice(&original_high.to_le_bytes());
        data.raw[0x32..0x34].copy_from_slice(&original_low.to_le_bytes());

        let mut bytes = build_image(
            MACHINE_NATIVE,
            preferred as u32,
            &[data, reloc_section(0x2000)],
        );
        set_reloc_dir(&mut bytes, 0x2000, 20);
        let file = write_temp(&bytes);

        // Occupy the preferred base so the mapper must move the image.
        space
            .reserve(Some(preferred), 0x10000, GuestProt::NOACCESS, ViewFlags::ALLOCATED)
            .unwrap();

        let base = space
            .map_image(file.as_fd(), &bytes, Some(preferred), None)
            .unwrap();
        assert_ne!(base, preferred);
        let delta = (base as u32).wrapping_sub(preferred as u32);

        let site = |off: usize| unsafe { ((base + 0x1000 + off) as *const u32).read_unaligned() };
        assert_eq!(site(0x10), original_highlow_a.wrapping_add(delta));
        assert_eq!(site(0x20), original_highlow_b.wrapping_add(delta));
        let high = unsafe { ((base + 0x1030) as *const u16).read_unaligned() };
        assert_eq!(high, original_high.wrapping_add((delta >> 16) as u16));
        let low = unsafe { ((base + 0x1032) as *const u16).read_unaligned() };
        assert_eq!(low, original_low.wrapping_add(delta as u16));

        space.release(base, 0).unwrap();
    }

    #[test]
    fn read_only_sections_promote_on_first_write_fault() {
        let space = scratch_space();
        let preferred = space.floor() + 0x40000;
        let section = FixtureSection {
            virtual_addr: 0x1000,
            virtual_size: 0x1000,
            characteristics: SCN_READ,
            raw: vec![0xaa; 0x200],
        };
        let bytes = build_image(MACHINE_NATIVE, preferred as u32, &[section]);
        let file = write_temp(&bytes);

        let base = space
            .map_image(file.as_fd(), &bytes, Some(preferred), None)
            .unwrap();
        assert_eq!(space.query(base + 0x1000).prot, GuestProt::READONLY);

        // First write faults; the hook promotes the page.
        assert_eq!(
            space.dispatch_fault(base + 0x1004, AccessKind::Write),
            FaultDisposition::Handled
        );
        unsafe { ((base + 0x1004) as *mut u32).write_unaligned(7) };
        assert_eq!(space.query(base + 0x1000).prot, GuestProt::READWRITE);

        space.release(base, 0).unwrap();
    }

    #[test]
    fn shared_sections_are_visible_across_spaces() {
        let space_a = scratch_space();
        let space_b = scratch_space();
        let store_fd: OwnedFd = tempfile::tempfile().unwrap().into();
        let store = SharedStore::new(store_fd);

        let section = FixtureSection {
            virtual_addr: 0x1000,
            virtual_size: 0x1000,
            characteristics: SCN_READ | SCN_WRITE | SCN_SHARED,
            raw: vec![0x55; 0x100],
        };
        let preferred = space_a.floor() + 0x40000;
        let bytes = build_image(MACHINE_NATIVE, preferred as u32, &[section]);
        let file = write_temp(&bytes);

        let a = space_a
            .map_image(file.as_fd(), &bytes, Some(preferred), Some(&store))
            .unwrap();
        let b = space_b
            .map_image(file.as_fd(), &bytes, Some(space_b.floor() + 0x40000), Some(&store))
            .unwrap();

        // Both mappings resolve to the same pool slot, seeded once from the
        // file.
        let seeded_a = unsafe { ((a + 0x1000) as *const u8).read() };
        let seeded_b = unsafe { ((b + 0x1000) as *const u8).read() };
        assert_eq!(seeded_a, 0x55);
        assert_eq!(seeded_b, 0x55);
        assert_eq!(space_a.query(a + 0x1000).kind, RegionKind::Image);

        // A write through one space is visible through the other.
        unsafe { ((a + 0x1000) as *mut u8).write(0x99) };
        assert_eq!(unsafe { ((b + 0x1000) as *const u8).read() }, 0x99);
        unsafe { ((b + 0x1080) as *mut u8).write(0x42) };
        assert_eq!(unsafe { ((a + 0x1080) as *const u8).read() }, 0x42);

        space_a.release(a, 0).unwrap();
        space_b.release(b, 0).unwrap();
    }

    #[test]
    fn rejects_bad_magic_and_wrong_machine() {
        let space = scratch_space();
        let preferred = space.floor() + 0x40000;
        let good = build_image(MACHINE_NATIVE, preferred as u32, &[]);

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        let file = write_temp(&bad_magic);
        assert_eq!(
            space.map_image(file.as_fd(), &bad_magic, None, None),
            Err(VmError::BadImage(ImageError::BadMagic))
        );

        let wrong = build_image(0x6666, preferred as u32, &[]);
        let file = write_temp(&wrong);
        assert_eq!(
            space.map_image(file.as_fd(), &wrong, None, None),
            Err(VmError::BadImage(ImageError::WrongMachine(0x6666)))
        );

        // Nothing was left mapped by the failures.
        assert_eq!(space.query(preferred).state, PageState::Free);
    }

    #[test]
    fn rejects_section_table_outside_header_region() {
        let space = scratch_space();
        let preferred = space.floor() + 0x40000;
        let mut bytes = build_image(MACHINE_NATIVE, preferred as u32, &[]);
        let coff = 0x80 + 4;
        bytes[coff + 2..coff + 4].copy_from_slice(&4000u16.to_le_bytes());
        let file = write_temp(&bytes);
        assert_eq!(
            space.map_image(file.as_fd(), &bytes, None, None),
            Err(VmError::BadImage(ImageError::SectionTableOutOfBounds))
        );
    }

    #[test]
    fn truncated_section_data_unmaps_everything() {
        let space = scratch_space();
        let preferred = space.floor() + 0x40000;
        let mut section = data_section(&[]);
        section.raw.truncate(0x100);
        let mut bytes = build_image(MACHINE_NATIVE, preferred as u32, &[section]);
        // Claim more raw data than the file holds.
        let table = 0x80 + 4 + COFF_SIZE + OPT_SIZE_WITH_RELOC_DIR;
        bytes[table + 16..table + 20].copy_from_slice(&0x1000u32.to_le_bytes());
        let file = write_temp(&bytes);

        assert_eq!(
            space.map_image(file.as_fd(), &bytes, Some(preferred), None),
            Err(VmError::BadImage(ImageError::SectionRead))
        );
        assert_eq!(space.query(preferred).state, PageState::Free);
    }
}
