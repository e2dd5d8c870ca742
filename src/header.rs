use std::{mem, ptr};

/// Size in bytes of one allocation unit. Every block is a whole number of
/// units and the header occupies exactly the first one.
pub const UNIT: usize = mem::size_of::<Header>();

/// This is the record placed in front of every block, free or in use.
///
/// ```text
/// +---------------------+ <------+
/// |     size (units)    |        |
/// +---------------------+        |
/// |     mark (1b)       |        | -> Header (one unit)
/// +---------------------+        |
/// |        link         |        |
/// +---------------------+ <------+ <- payload address
/// |       Payload       |        |
/// |         ...         |        | -> (size - 1) units
/// |         ...         |        |
/// +---------------------+ <------+
/// ```
///
/// `link` is shared by the two lists a block can belong to. While the block is
/// free it points to the next free block (the free list is circular); while it
/// is in use it points to the next used block or is null at the end of the used
/// list. A block is a member of exactly one of them at any time.
#[repr(C)]
pub(crate) struct Header {
    /// Size of the block in units, header included.
    pub size: u32,
    /// Set when the block was reached during the current marking phase.
    pub mark: bool,
    /// Next block of whichever list owns this one.
    pub link: *mut Header,
}

impl Header {
    /// A zero sized header, used as the anchor of the free list.
    pub const fn sentinel() -> Self {
        Self {
            size: 0,
            mark: false,
            link: ptr::null_mut(),
        }
    }
}

/// Number of units needed to hand out `size` bytes, header included.
///
/// A zero sized request still gets one payload unit. Returns `None` when the
/// result does not fit in [`Header::size`].
pub(crate) fn units_for(size: usize) -> Option<u32> {
    let payload = size.max(1).div_ceil(UNIT);
    let units = payload.checked_add(1)?;

    u32::try_from(units).ok()
}

/// Address of the first payload byte of `block`.
#[inline]
pub(crate) fn payload(block: *mut Header) -> *mut u8 {
    block.wrapping_add(1).cast()
}

/// Header owning the payload that starts at `addr`.
#[inline]
pub(crate) fn from_payload(addr: *mut u8) -> *mut Header {
    addr.cast::<Header>().wrapping_sub(1)
}

/// First address past the end of `block`.
///
/// # Safety
///
/// `block` must point to a valid header.
#[inline]
pub(crate) unsafe fn end(block: *mut Header) -> *mut Header {
    unsafe { block.wrapping_add((*block).size as usize) }
}

/// Payload span of `block` as integers: `[start, start + (size - 1) * UNIT)`.
///
/// # Safety
///
/// `block` must point to a valid header.
#[inline]
pub(crate) unsafe fn payload_span(block: *mut Header) -> (usize, usize) {
    let start = payload(block) as usize;
    let len = unsafe { ((*block).size as usize).saturating_sub(1) } * UNIT;

    (start, start + len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_one_word_aligned_unit() {
        assert_eq!(0, UNIT % mem::size_of::<usize>());
        #[cfg(target_pointer_width = "64")]
        assert_eq!(16, UNIT);
    }

    #[test]
    fn units_round_up_and_include_header() {
        assert_eq!(Some(2), units_for(0));
        assert_eq!(Some(2), units_for(1));
        assert_eq!(Some(2), units_for(UNIT));
        assert_eq!(Some(3), units_for(UNIT + 1));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn ten_integers_take_four_units() {
        assert_eq!(Some(4), units_for(40));
    }

    #[test]
    fn oversized_requests_do_not_fit() {
        assert_eq!(None, units_for(usize::MAX));
        #[cfg(target_pointer_width = "64")]
        assert_eq!(None, units_for(u32::MAX as usize * UNIT));
    }

    #[test]
    fn payload_follows_header() {
        let mut blocks = [Header::sentinel(), Header::sentinel(), Header::sentinel()];
        let block: *mut Header = &mut blocks[0];

        unsafe {
            (*block).size = 3;

            assert_eq!(block as usize + UNIT, payload(block) as usize);
            assert_eq!(block, from_payload(payload(block)));
            assert_eq!(block.add(3), end(block));

            let (start, stop) = payload_span(block);
            assert_eq!(2 * UNIT, stop - start);
        }
    }
}
