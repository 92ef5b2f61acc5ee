//! # Data Page Layout
//!
//! Every 16KB data page begins with a 16-byte header, followed by an item
//! slot directory growing downward from the header and cell contents
//! growing upward from the end of the page.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    Type of page (Data, ...)
//! 1       1     flags        Page flags (unused, reserved)
//! 2       2     item_count   Number of live cells on this page
//! 4       2     slot_count   Length of the slot directory (incl. freed)
//! 6       2     free_start   Offset where free space begins
//! 8       2     free_end     Offset where free space ends
//! 10      4     next_page    Reserved chain pointer (0 = none)
//! 14      2     reserved
//! ```
//!
//! ## Cell Layout
//!
//! ```text
//! +-------------------+
//! | Header (16 bytes) |
//! +-------------------+
//! | Slot Directory    |  <- 2-byte cell offsets, grows downward
//! +-------------------+
//! | Free Space        |
//! +-------------------+
//! | Cell Content      |  <- grows upward from end of page
//! +-------------------+
//! ```
//!
//! Each cell is a 15-byte header plus its fragment payload:
//!
//! ```text
//! payload_len (2) | flags (1) | total_row_len (4) | next_link (8) | payload
//! ```
//!
//! `total_row_len` on a head cell is the full serialized row length across
//! all fragments; `next_link` chains to the fragment holding the following
//! bytes (0 terminates the chain).
//!
//! ## Item Indirection and Compaction
//!
//! Row links address cells by **item id** (slot index), not byte offset.
//! Removing a cell compacts the cell content area with a single
//! `copy_within` and rewrites the affected slots, so free space stays
//! contiguous and a page's free space returns to exactly its pre-insert
//! value after an insert/remove pair. Freed slots are reused by later
//! inserts; trailing freed slots shrink the directory itself.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian via zerocopy wrapper types, so
//! page images are portable across the wire and to disk.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    CELL_HEADER_SIZE, DATA_PAGE_HEADER_SIZE, ITEM_SLOT_SIZE, MAX_CELL_PAYLOAD, PAGE_SIZE,
};

/// Slot directory entry marking a freed item slot.
const FREE_ITEM: u16 = u16::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Data = 0x01,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Data,
            _ => PageType::Unknown,
        }
    }
}

/// Bit flags stored in a cell header.
pub struct CellFlags;

impl CellFlags {
    /// First fragment of a row; carries the row's total length.
    pub const HEAD: u8 = 0x01;
    /// Cell belongs to a multi-fragment chain.
    pub const FRAGMENT: u8 = 0x02;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DataPageHeader {
    page_type: u8,
    flags: u8,
    item_count: U16,
    slot_count: U16,
    free_start: U16,
    free_end: U16,
    next_page: U32,
    reserved: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<DataPageHeader>() == DATA_PAGE_HEADER_SIZE);

impl DataPageHeader {
    pub fn new() -> Self {
        Self {
            page_type: PageType::Data as u8,
            flags: 0,
            item_count: U16::new(0),
            slot_count: U16::new(0),
            free_start: U16::new(DATA_PAGE_HEADER_SIZE as u16),
            free_end: U16::new(PAGE_SIZE as u16),
            next_page: U32::new(0),
            reserved: [0; 2],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= DATA_PAGE_HEADER_SIZE,
            "buffer too small for DataPageHeader: {} < {}",
            data.len(),
            DATA_PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..DATA_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read DataPageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= DATA_PAGE_HEADER_SIZE,
            "buffer too small for DataPageHeader: {} < {}",
            data.len(),
            DATA_PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..DATA_PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read DataPageHeader: {:?}", e))
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    zerocopy_accessors! {
        item_count: u16,
        slot_count: u16,
        free_start: u16,
        free_end: u16,
        next_page: u32,
    }

    /// Contiguous free bytes between the slot directory and cell area.
    pub fn free_space(&self) -> usize {
        self.free_end().saturating_sub(self.free_start()) as usize
    }
}

impl Default for DataPageHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct CellHeader {
    payload_len: U16,
    flags: u8,
    total_row_len: U32,
    next_link: U64,
}

const _: () = assert!(std::mem::size_of::<CellHeader>() == CELL_HEADER_SIZE);

impl CellHeader {
    pub fn new(payload_len: u16, flags: u8, total_row_len: u32, next_link: u64) -> Self {
        Self {
            payload_len: U16::new(payload_len),
            flags,
            total_row_len: U32::new(total_row_len),
            next_link: U64::new(next_link),
        }
    }

    zerocopy_getters! {
        payload_len: u16,
        total_row_len: u32,
        next_link: u64,
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_head(&self) -> bool {
        self.flags & CellFlags::HEAD != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.flags & CellFlags::FRAGMENT != 0
    }
}

/// Formats a zeroed buffer as an empty data page.
pub fn init_data_page(page: &mut [u8]) -> Result<()> {
    ensure!(
        page.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        page.len(),
        PAGE_SIZE
    );

    page[..DATA_PAGE_HEADER_SIZE].copy_from_slice(DataPageHeader::new().as_bytes());
    Ok(())
}

/// Contiguous free bytes available on the page.
pub fn page_free_space(page: &[u8]) -> Result<usize> {
    Ok(DataPageHeader::from_bytes(page)?.free_space())
}

/// Worst-case bytes an insert of `payload_len` consumes: cell header,
/// payload, and a fresh directory slot.
pub fn required_cell_space(payload_len: usize) -> usize {
    CELL_HEADER_SIZE + ITEM_SLOT_SIZE + payload_len
}

fn slot_offset(item_id: u16) -> usize {
    DATA_PAGE_HEADER_SIZE + item_id as usize * ITEM_SLOT_SIZE
}

fn read_slot(page: &[u8], item_id: u16) -> u16 {
    let off = slot_offset(item_id);
    u16::from_le_bytes([page[off], page[off + 1]])
}

fn write_slot(page: &mut [u8], item_id: u16, value: u16) {
    let off = slot_offset(item_id);
    page[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

/// Inserts a cell and returns its item id.
///
/// Fails when the page lacks contiguous free space for the cell (plus a
/// directory slot when no freed slot is available for reuse).
pub fn insert_cell(
    page: &mut [u8],
    payload: &[u8],
    flags: u8,
    total_row_len: u32,
    next_link: u64,
) -> Result<u16> {
    ensure!(
        page.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        page.len(),
        PAGE_SIZE
    );
    ensure!(
        payload.len() <= MAX_CELL_PAYLOAD,
        "cell payload {} exceeds maximum {}",
        payload.len(),
        MAX_CELL_PAYLOAD
    );

    let header = DataPageHeader::from_bytes(page)?;
    ensure!(
        header.page_type() == PageType::Data,
        "cannot insert cell into page of type {:?}",
        header.page_type()
    );

    let slot_count = header.slot_count();
    let free_start = header.free_start();
    let free_end = header.free_end();
    let item_count = header.item_count();

    // Reuse the lowest freed slot if one exists.
    let mut reuse_slot = None;
    for item_id in 0..slot_count {
        if read_slot(page, item_id) == FREE_ITEM {
            reuse_slot = Some(item_id);
            break;
        }
    }

    let cell_size = CELL_HEADER_SIZE + payload.len();
    let slot_cost = if reuse_slot.is_some() { 0 } else { ITEM_SLOT_SIZE };
    let available = (free_end - free_start) as usize;

    ensure!(
        cell_size + slot_cost <= available,
        "page full: need {} bytes, {} free",
        cell_size + slot_cost,
        available
    );

    let cell_offset = free_end as usize - cell_size;
    let cell = CellHeader::new(payload.len() as u16, flags, total_row_len, next_link);
    page[cell_offset..cell_offset + CELL_HEADER_SIZE].copy_from_slice(cell.as_bytes());
    page[cell_offset + CELL_HEADER_SIZE..cell_offset + cell_size].copy_from_slice(payload);

    let item_id = match reuse_slot {
        Some(id) => id,
        None => {
            ensure!(slot_count < FREE_ITEM, "slot directory exhausted");
            let header = DataPageHeader::from_bytes_mut(page)?;
            header.set_slot_count(slot_count + 1);
            header.set_free_start(free_start + ITEM_SLOT_SIZE as u16);
            slot_count
        }
    };

    write_slot(page, item_id, cell_offset as u16);

    let header = DataPageHeader::from_bytes_mut(page)?;
    header.set_free_end(cell_offset as u16);
    header.set_item_count(item_count + 1);

    Ok(item_id)
}

/// Reads the cell at `item_id`, returning its header and payload slice.
pub fn read_cell(page: &[u8], item_id: u16) -> Result<(CellHeader, &[u8])> {
    ensure!(
        page.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        page.len(),
        PAGE_SIZE
    );

    let header = DataPageHeader::from_bytes(page)?;
    ensure!(
        item_id < header.slot_count(),
        "item {} out of range (slot count {})",
        item_id,
        header.slot_count()
    );

    let cell_offset = read_slot(page, item_id);
    ensure!(cell_offset != FREE_ITEM, "item {} was removed", item_id);

    let off = cell_offset as usize;
    ensure!(
        off >= header.free_end() as usize && off + CELL_HEADER_SIZE <= PAGE_SIZE,
        "corrupt slot: cell offset {} outside cell area",
        off
    );

    let cell = CellHeader::read_from_bytes(&page[off..off + CELL_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read CellHeader: {:?}", e))?;

    let payload_end = off + CELL_HEADER_SIZE + cell.payload_len() as usize;
    ensure!(
        payload_end <= PAGE_SIZE,
        "corrupt cell: payload overruns page end"
    );

    Ok((cell, &page[off + CELL_HEADER_SIZE..payload_end]))
}

/// Overwrites the payload of the cell at `item_id` in place. The new
/// payload must have exactly the stored length; length changes go through
/// remove + insert.
pub fn overwrite_cell(page: &mut [u8], item_id: u16, payload: &[u8]) -> Result<()> {
    let (cell, _) = read_cell(page, item_id)?;
    ensure!(
        cell.payload_len() as usize == payload.len(),
        "in-place overwrite length mismatch: {} != {}",
        payload.len(),
        cell.payload_len()
    );

    let off = read_slot(page, item_id) as usize + CELL_HEADER_SIZE;
    page[off..off + payload.len()].copy_from_slice(payload);
    Ok(())
}

/// Removes the cell at `item_id`, compacts the cell area, and returns the
/// removed cell's header (the caller follows `next_link` for chains).
pub fn remove_cell(page: &mut [u8], item_id: u16) -> Result<CellHeader> {
    let (cell, _) = read_cell(page, item_id)?;
    let cell_offset = read_slot(page, item_id) as usize;
    let cell_size = CELL_HEADER_SIZE + cell.payload_len() as usize;

    let header = DataPageHeader::from_bytes(page)?;
    let free_start = header.free_start();
    let free_end = header.free_end() as usize;
    let slot_count = header.slot_count();
    let item_count = header.item_count();

    // Slide every cell below the removed one up by its size, then fix the
    // slots that pointed into the moved range.
    page.copy_within(free_end..cell_offset, free_end + cell_size);

    for id in 0..slot_count {
        let slot = read_slot(page, id);
        if slot != FREE_ITEM && (slot as usize) < cell_offset {
            write_slot(page, id, slot + cell_size as u16);
        }
    }

    write_slot(page, item_id, FREE_ITEM);

    let mut new_slot_count = slot_count;
    let mut new_free_start = free_start;
    while new_slot_count > 0 && read_slot(page, new_slot_count - 1) == FREE_ITEM {
        new_slot_count -= 1;
        new_free_start -= ITEM_SLOT_SIZE as u16;
    }

    let header = DataPageHeader::from_bytes_mut(page)?;
    header.set_item_count(item_count - 1);
    header.set_free_end((free_end + cell_size) as u16);
    header.set_slot_count(new_slot_count);
    header.set_free_start(new_free_start);

    if header.item_count() == 0 {
        header.set_slot_count(0);
        header.set_free_start(DATA_PAGE_HEADER_SIZE as u16);
        header.set_free_end(PAGE_SIZE as u16);
    }

    Ok(cell)
}

/// Structural sanity check for a page image. Zeroed pages are valid (never
/// formatted); formatted pages must have consistent header geometry.
pub fn validate_data_page(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );

    let header = DataPageHeader::from_bytes(data)?;

    let is_zeroed = header.page_type == 0
        && header.flags == 0
        && header.item_count() == 0
        && header.free_start() == 0
        && header.free_end() == 0;

    if is_zeroed {
        return Ok(());
    }

    if header.page_type() == PageType::Unknown {
        bail!("invalid page type: {:02x}", header.page_type);
    }

    let expected_free_start = DATA_PAGE_HEADER_SIZE + header.slot_count() as usize * ITEM_SLOT_SIZE;
    ensure!(
        header.free_start() as usize == expected_free_start,
        "free_start {} inconsistent with slot count {}",
        header.free_start(),
        header.slot_count()
    );

    ensure!(
        header.free_end() as usize <= PAGE_SIZE,
        "free_end {} > PAGE_SIZE {}",
        header.free_end(),
        PAGE_SIZE
    );

    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    ensure!(
        header.item_count() <= header.slot_count(),
        "item_count {} > slot_count {}",
        header.item_count(),
        header.slot_count()
    );

    Ok(())
}
