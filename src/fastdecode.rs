//! The fast decode path: a specialised parser for every field shape
//! (e.g. a oneof boolean field with a one-byte tag), with dispatch getting
//! from tag bytes to the right parser as quickly as possible. Every parser
//! shares one flat argument tuple `(d, ptr, msg, table, hasbits, data)`
//! cheap enough to stay in registers on 64-bit targets.
//!
//! The parser bodies are generic over {cardinality, value bytes, zigzag,
//! tag bytes, ceiling} and fully inlined; the exported entry points at the
//! bottom pin each instantiation behind `#[inline(never)]` so the matrix
//! stays ~98 small functions rather than one giant one.
//!
//! This path assumes a 64-bit little-endian host; fixed-width values are
//! moved with native unaligned loads.

use std::hint::{likely, unlikely};
use std::mem::size_of;
use std::ptr;

use crate::array::{fetch_or_create, RepeatedArray};
use crate::arena::{poison, unpoison};
use crate::decoding::{
    decode_err, decode_generic, decode_isdone, isdonefallback_inl, pop_limit, push_limit,
    DecodeError, DecodeState,
};
use crate::message::{Object, StrView};
use crate::tables::{FieldParser, Layout};
use crate::wire::{boundscheck, boundscheck2, load_tag, read_longsize, read_varint64, SLOP_SIZE};

pub(crate) const CARD_S: u8 = 0; // singular (optional, non-repeated)
pub(crate) const CARD_O: u8 = 1; // oneof
pub(crate) const CARD_R: u8 = 2; // repeated
pub(crate) const CARD_P: u8 = 3; // packed repeated

/* dispatch ****************************************************************/

/// Jumps to the specialised parser for the tag at `ptr`. Five bits of
/// field number index the fasttable (the continuation bit is treated as a
/// data bit, speculating that a second tag byte is 0x01), and the actual
/// tag is XORed with the slot's expected tag so the parser can verify the
/// match by comparing against zero.
#[inline(always)]
pub(crate) unsafe fn tagdispatch(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
    tag: u32,
) -> *const u8 {
    let idx = ((tag & 0xf8) >> 3) as usize;
    let slot = &table.fasttable[idx];
    let data = slot.data ^ tag as u64;
    (slot.parser)(d, ptr, msg, table, hasbits, data)
}

#[inline(never)]
unsafe fn fastdecode_isdonefallback(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
    overrun: isize,
) -> *const u8 {
    let Some(ptr) = isdonefallback_inl(d, ptr, overrun) else {
        return decode_err(d, DecodeError::BoundsExceeded);
    };
    let tag = load_tag(ptr);
    tagdispatch(d, ptr, msg, table, hasbits, tag)
}

/// Parses the next field, or finishes the scope when the cursor has
/// reached its limit.
#[inline(always)]
pub(crate) unsafe fn dispatch(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
) -> *const u8 {
    if unlikely(ptr >= d.limit_ptr) {
        let overrun = ptr.offset_from(d.end);
        if likely(overrun == d.limit) {
            // Scope is finished; sync the accumulated presence bits.
            (*msg).merge_hasbits(hasbits);
            return ptr;
        }
        return fastdecode_isdonefallback(d, ptr, msg, table, hasbits, overrun);
    }
    // Two bytes of tag data; for a one-byte tag the high byte is junk.
    let tag = load_tag(ptr);
    tagdispatch(d, ptr, msg, table, hasbits, tag)
}

#[inline(always)]
fn checktag<const TAGBYTES: usize>(data: u64) -> bool {
    if TAGBYTES == 1 {
        data & 0xff == 0
    } else {
        data & 0xffff == 0
    }
}

#[inline(always)]
fn tagmatch<const TAGBYTES: usize>(tag: u32, data: u64) -> bool {
    if TAGBYTES == 1 {
        tag as u8 == data as u8
    } else {
        tag as u16 == data as u16
    }
}

/// Flips the wiretype bit between the packed (LEN) and unpacked encodings
/// of a repeated numeric field, then re-checks the tag.
#[inline(always)]
fn flippacked<const TAGBYTES: usize>(data: &mut u64) -> bool {
    *data ^= 0x2;
    checktag::<TAGBYTES>(*data)
}

/* singular, oneof, repeated field handling ********************************/

struct FastArr {
    arr: *mut RepeatedArray,
    end: *mut u8,
}

impl Default for FastArr {
    fn default() -> Self {
        FastArr {
            arr: ptr::null_mut(),
            end: ptr::null_mut(),
        }
    }
}

enum Next {
    SameField { dst: *mut u8, tag: u32 },
    OtherField { tag: u32 },
    AtLimit,
    Abort,
}

#[inline(always)]
unsafe fn fastdecode_fieldmem(msg: *mut Object, data: u64) -> *mut u8 {
    (msg as *mut u8).add((data >> 48) as usize)
}

/// Produces the destination address for a field and does the cardinality
/// bookkeeping: hasbit accumulation, oneof case write, or repeated-array
/// fetch/create. For repeated fields, reloads `data` with the raw tag so
/// the run loop can detect further occurrences, and returns null when the
/// array cannot be allocated.
#[inline(always)]
unsafe fn fastdecode_getfield<const VALBYTES: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: *mut Object,
    data: &mut u64,
    hasbits: &mut u64,
    farr: &mut FastArr,
) -> *mut u8 {
    if CARD == CARD_S {
        let hasbit_index = (*data >> 24) as u8;
        *hasbits |= 1u64 << hasbit_index;
        fastdecode_fieldmem(msg, *data)
    } else if CARD == CARD_O {
        let case_ofs = (*data >> 32) as u16;
        let oneof_case = (msg as *mut u8).add(case_ofs as usize) as *mut u32;
        *oneof_case = (*data >> 24) as u8 as u32;
        fastdecode_fieldmem(msg, *data)
    } else {
        debug_assert_eq!(CARD, CARD_R);
        let lg2 = VALBYTES.trailing_zeros();
        let arr_p = fastdecode_fieldmem(msg, *data) as *mut *mut RepeatedArray;
        (*msg).merge_hasbits(*hasbits);
        *hasbits = 0;
        let arr = fetch_or_create(arr_p, 8, lg2, d.arena);
        if unlikely(arr.is_null()) {
            return ptr::null_mut();
        }
        farr.arr = arr;
        let begin = (*arr).ptr();
        farr.end = begin.add((*arr).size << lg2);
        *data = load_tag(ptr) as u64;
        begin.add((*arr).len << lg2)
    }
}

/// Doubles the array when the destination cursor hit capacity. Returns the
/// (possibly relocated) destination, or null if the arena declined.
#[inline(always)]
unsafe fn fastdecode_resizearr<const VALBYTES: usize>(
    d: &mut DecodeState<'_, '_>,
    dst: *mut u8,
    farr: &mut FastArr,
) -> *mut u8 {
    if unlikely(dst == farr.end) {
        let arr = &mut *farr.arr;
        let old_size = arr.size;
        let new_size = old_size.max(4) * 2;
        let Some(new_ptr) =
            d.arena
                .try_realloc(arr.ptr(), old_size * VALBYTES, new_size * VALBYTES)
        else {
            return ptr::null_mut();
        };
        arr.size = new_size;
        arr.set_data(new_ptr, VALBYTES.trailing_zeros());
        farr.end = new_ptr.add(new_size * VALBYTES);
        return new_ptr.add(old_size * VALBYTES);
    }
    dst
}

/// Commits the element count of a finished run. `dst` is one past the last
/// written element.
#[inline(always)]
unsafe fn fastdecode_commitarr<const VALBYTES: usize>(dst: *mut u8, farr: &FastArr) {
    let arr = &mut *farr.arr;
    arr.len = (dst as usize - arr.ptr() as usize) / VALBYTES;
}

/// After one repeated element: same field again (continue the fused run),
/// a different field (commit and redispatch), or end of scope (commit and
/// return).
#[inline(always)]
unsafe fn fastdecode_nextrepeated<const TAGBYTES: usize, const VALBYTES: usize>(
    d: &mut DecodeState<'_, '_>,
    dst: *mut u8,
    ptr: &mut *const u8,
    farr: &mut FastArr,
    data: u64,
) -> Next {
    let dst = dst.add(VALBYTES);
    match decode_isdone(d, ptr) {
        Ok(false) => {
            let tag = load_tag(*ptr);
            if tagmatch::<TAGBYTES>(tag, data) {
                Next::SameField { dst, tag }
            } else {
                fastdecode_commitarr::<VALBYTES>(dst, farr);
                Next::OtherField { tag }
            }
        }
        Ok(true) => {
            fastdecode_commitarr::<VALBYTES>(dst, farr);
            Next::AtLimit
        }
        Err(()) => Next::Abort,
    }
}

/* delimited sub-scope *****************************************************/

/// Reads a length prefix and runs `func` under the region's byte limit.
///
/// Fast case: the payload fits inside the current buffer and limit, so
/// `limit`/`limit_ptr` can be saved and restored verbatim. Slow case: the
/// region is >= 128 bytes or exceeds the buffer; a refill may move `end`
/// mid-call, so only the limit delta survives.
#[inline(always)]
unsafe fn fastdecode_delimited<'a, 'alc, F>(
    d: &mut DecodeState<'a, 'alc>,
    mut ptr: *const u8,
    func: F,
) -> *const u8
where
    F: FnOnce(&mut DecodeState<'a, 'alc>, *const u8) -> *const u8,
{
    let mut len = ptr.read() as i8 as isize;
    ptr = ptr.add(1);
    if boundscheck2(ptr, len as usize, d.limit_ptr) {
        if unlikely(len & 0x80 != 0) {
            // Size varint longer than one byte (length >= 128).
            match read_longsize(ptr, &mut len) {
                Some(p) => ptr = p,
                None => return decode_err(d, DecodeError::MalformedVarint),
            }
        }
        if ptr.offset_from(d.end) + len > d.limit {
            return decode_err(d, DecodeError::InvalidLimit);
        }
        let delta = push_limit(d, ptr, len);
        ptr = func(d, ptr);
        if unlikely(ptr.is_null()) {
            return ptr;
        }
        pop_limit(d, delta);
    } else {
        let saved_limit_ptr = d.limit_ptr;
        let saved_limit = d.limit;
        d.limit_ptr = ptr.add(len as usize);
        d.limit = d.limit_ptr.offset_from(d.end);
        debug_assert_eq!(d.limit_ptr, d.end.offset(d.limit.min(0)));
        ptr = func(d, ptr);
        if unlikely(ptr.is_null()) {
            return ptr;
        }
        d.limit_ptr = saved_limit_ptr;
        d.limit = saved_limit;
        debug_assert_eq!(d.limit_ptr, d.end.offset(d.limit.min(0)));
    }
    ptr
}

/* varint fields ***********************************************************/

/// Post-read transformation: booleans collapse to 0/1, zigzag values are
/// unfolded.
#[inline(always)]
fn munge<const VALBYTES: usize, const ZIGZAG: bool>(val: u64) -> u64 {
    if VALBYTES == 1 {
        (val != 0) as u64
    } else if ZIGZAG {
        if VALBYTES == 4 {
            let n = val as u32;
            ((n >> 1) ^ (n & 1).wrapping_neg()) as u64
        } else {
            (val >> 1) ^ (val & 1).wrapping_neg()
        }
    } else {
        val
    }
}

#[inline(always)]
unsafe fn store_val<const VALBYTES: usize>(dst: *mut u8, val: u64) {
    match VALBYTES {
        1 => dst.write(val as u8),
        4 => (dst as *mut u32).write_unaligned(val as u32),
        8 => (dst as *mut u64).write_unaligned(val),
        _ => unreachable!(),
    }
}

#[inline(always)]
unsafe fn fastdecode_unpackedvarint<
    const TAGBYTES: usize,
    const VALBYTES: usize,
    const ZIGZAG: bool,
    const CARD: u8,
>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
    packed: FieldParser,
) -> *const u8 {
    let mut farr = FastArr::default();

    if unlikely(!checktag::<TAGBYTES>(data)) {
        if CARD == CARD_R && flippacked::<TAGBYTES>(&mut data) {
            return packed(d, ptr, msg, table, hasbits, data);
        }
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    let mut dst =
        fastdecode_getfield::<VALBYTES, CARD>(d, ptr, msg, &mut data, &mut hasbits, &mut farr);
    if CARD == CARD_R && unlikely(dst.is_null()) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    loop {
        if CARD == CARD_R {
            dst = fastdecode_resizearr::<VALBYTES>(d, dst, &mut farr);
            if unlikely(dst.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
        }
        ptr = ptr.add(TAGBYTES);
        let mut val = 0u64;
        match read_varint64(ptr, &mut val) {
            Some(p) => ptr = p,
            None => return decode_err(d, DecodeError::MalformedVarint),
        }
        store_val::<VALBYTES>(dst, munge::<VALBYTES, ZIGZAG>(val));

        if CARD == CARD_R {
            match fastdecode_nextrepeated::<TAGBYTES, VALBYTES>(d, dst, &mut ptr, &mut farr, data)
            {
                Next::SameField { dst: next, .. } => {
                    dst = next;
                    continue;
                }
                Next::OtherField { tag } => return tagdispatch(d, ptr, msg, table, hasbits, tag),
                Next::AtLimit => return ptr,
                Next::Abort => return decode_err(d, DecodeError::BoundsExceeded),
            }
        }
        break;
    }

    dispatch(d, ptr, msg, table, hasbits)
}

#[inline(always)]
unsafe fn fastdecode_packedvarint<
    const TAGBYTES: usize,
    const VALBYTES: usize,
    const ZIGZAG: bool,
>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
    unpacked: FieldParser,
) -> *const u8 {
    if unlikely(!checktag::<TAGBYTES>(data)) {
        if flippacked::<TAGBYTES>(&mut data) {
            return unpacked(d, ptr, msg, table, hasbits, data);
        }
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    let mut farr = FastArr::default();
    let dst =
        fastdecode_getfield::<VALBYTES, CARD_R>(d, ptr, msg, &mut data, &mut hasbits, &mut farr);
    if unlikely(dst.is_null()) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    ptr = ptr.add(TAGBYTES);
    ptr = fastdecode_delimited(d, ptr, move |d, mut ptr| {
        let mut dst = dst;
        let mut farr = farr;
        loop {
            match decode_isdone(d, &mut ptr) {
                Ok(true) => break,
                Ok(false) => {}
                Err(()) => return decode_err(d, DecodeError::BoundsExceeded),
            }
            dst = fastdecode_resizearr::<VALBYTES>(d, dst, &mut farr);
            if unlikely(dst.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
            let mut val = 0u64;
            match read_varint64(ptr, &mut val) {
                Some(p) => ptr = p,
                None => return decode_err(d, DecodeError::MalformedVarint),
            }
            store_val::<VALBYTES>(dst, munge::<VALBYTES, ZIGZAG>(val));
            dst = dst.add(VALBYTES);
        }
        fastdecode_commitarr::<VALBYTES>(dst, &farr);
        ptr
    });

    if unlikely(ptr.is_null()) {
        return ptr;
    }
    dispatch(d, ptr, msg, table, hasbits)
}

/* fixed fields ************************************************************/

#[inline(always)]
unsafe fn fastdecode_unpackedfixed<const TAGBYTES: usize, const VALBYTES: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
    packed: FieldParser,
) -> *const u8 {
    let mut farr = FastArr::default();

    if unlikely(!checktag::<TAGBYTES>(data)) {
        if CARD == CARD_R && flippacked::<TAGBYTES>(&mut data) {
            return packed(d, ptr, msg, table, hasbits, data);
        }
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    let mut dst =
        fastdecode_getfield::<VALBYTES, CARD>(d, ptr, msg, &mut data, &mut hasbits, &mut farr);
    if CARD == CARD_R && unlikely(dst.is_null()) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    loop {
        if CARD == CARD_R {
            dst = fastdecode_resizearr::<VALBYTES>(d, dst, &mut farr);
            if unlikely(dst.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
        }
        ptr = ptr.add(TAGBYTES);
        ptr::copy_nonoverlapping(ptr, dst, VALBYTES);
        ptr = ptr.add(VALBYTES);

        if CARD == CARD_R {
            match fastdecode_nextrepeated::<TAGBYTES, VALBYTES>(d, dst, &mut ptr, &mut farr, data)
            {
                Next::SameField { dst: next, .. } => {
                    dst = next;
                    continue;
                }
                Next::OtherField { tag } => return tagdispatch(d, ptr, msg, table, hasbits, tag),
                Next::AtLimit => return ptr,
                Next::Abort => return decode_err(d, DecodeError::BoundsExceeded),
            }
        }
        break;
    }

    dispatch(d, ptr, msg, table, hasbits)
}

/// Packed fixed data is landed with one bulk copy: validate the length,
/// size the array in one shot, memcpy.
#[inline(always)]
unsafe fn fastdecode_packedfixed<const TAGBYTES: usize, const VALBYTES: usize>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
    mut data: u64,
    unpacked: FieldParser,
) -> *const u8 {
    if unlikely(!checktag::<TAGBYTES>(data)) {
        if flippacked::<TAGBYTES>(&mut data) {
            return unpacked(d, ptr, msg, table, hasbits, data);
        }
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    ptr = ptr.add(TAGBYTES);
    let mut size = ptr.read() as isize;
    ptr = ptr.add(1);
    if size & 0x80 != 0 {
        match read_longsize(ptr, &mut size) {
            Some(p) => ptr = p,
            None => return decode_err(d, DecodeError::MalformedVarint),
        }
    }

    if unlikely(boundscheck(ptr, size as usize, d.limit_ptr)) {
        return decode_err(d, DecodeError::BoundsExceeded);
    }
    let size = size as usize;
    if unlikely(size % VALBYTES != 0) {
        return decode_err(d, DecodeError::Malformed);
    }

    let arr_p = fastdecode_fieldmem(msg, data) as *mut *mut RepeatedArray;
    let lg2 = VALBYTES.trailing_zeros();
    let elems = size / VALBYTES;

    let arr = if likely((*arr_p).is_null()) {
        match RepeatedArray::new(d.arena, elems, lg2) {
            Some(arr) => {
                *arr_p = arr;
                arr
            }
            None => return decode_err(d, DecodeError::AllocationFailed),
        }
    } else {
        let arr = *arr_p;
        if !(*arr).reserve(elems, d.arena) {
            return decode_err(d, DecodeError::AllocationFailed);
        }
        arr
    };

    ptr::copy_nonoverlapping(ptr, (*arr).ptr(), size);
    (*arr).len = elems;

    dispatch(d, ptr.add(size), msg, table, hasbits)
}

/* string fields ***********************************************************/

/// Out-of-line path for strings that are long, straddle the buffer end, or
/// miss the arena headroom the cascade needs. Re-parses the size from
/// scratch.
#[inline(never)]
unsafe fn fastdecode_longstring(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
    dst: *mut StrView,
) -> *const u8 {
    let mut size = ptr.read() as isize;
    ptr = ptr.add(1);
    if size & 0x80 != 0 {
        match read_longsize(ptr, &mut size) {
            Some(p) => ptr = p,
            None => return decode_err(d, DecodeError::MalformedVarint),
        }
    }

    if unlikely(boundscheck(ptr, size as usize, d.limit_ptr)) {
        (*dst).size = 0;
        return decode_err(d, DecodeError::BoundsExceeded);
    }
    let size = size as usize;

    if d.alias {
        (*dst).data = ptr;
        (*dst).size = size;
    } else {
        let Some(buf) = d.arena.try_alloc_bytes(size) else {
            return decode_err(d, DecodeError::AllocationFailed);
        };
        ptr::copy_nonoverlapping(ptr, buf, size);
        (*dst).data = buf;
        (*dst).size = size;
    }

    dispatch(d, ptr.add(size), msg, table, hasbits)
}

/// A fixed-width copy is much faster than a variable one, so short strings
/// are landed with one of four power-of-two block copies from the arena's
/// bump cursor; the arena owes `copy` bytes of headroom even though only
/// `size` are live, and the tail is poisoned.
#[inline(always)]
unsafe fn fastdecode_docopy(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    size: usize,
    copy: usize,
    buf: *mut u8,
    dst: *mut StrView,
) {
    d.arena.bump(copy);
    (*dst).data = buf;
    unpoison(buf, copy);
    ptr::copy_nonoverlapping(ptr, buf, copy);
    poison(buf.add(size), copy - size);
}

#[inline(always)]
unsafe fn fastdecode_copystring<const TAGBYTES: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
) -> *const u8 {
    debug_assert!(!d.alias);
    debug_assert!(checktag::<TAGBYTES>(data));

    let mut farr = FastArr::default();
    let dst = fastdecode_getfield::<{ size_of::<StrView>() }, CARD>(
        d, ptr, msg, &mut data, &mut hasbits, &mut farr,
    );
    if CARD == CARD_R && unlikely(dst.is_null()) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }
    let mut dst = dst as *mut StrView;

    loop {
        if CARD == CARD_R {
            let p = fastdecode_resizearr::<{ size_of::<StrView>() }>(d, dst as *mut u8, &mut farr);
            if unlikely(p.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
            dst = p as *mut StrView;
        }

        let size = ptr.add(TAGBYTES).read() as usize;
        ptr = ptr.add(TAGBYTES + 1);
        (*dst).size = size;

        let buf = d.arena.head_ptr();
        let arena_has = d.arena.remaining() as isize;
        let common_has = arena_has.min(d.end.offset_from(ptr) + SLOP_SIZE as isize);

        let copied = 'copy: {
            if likely(size <= 15 - TAGBYTES) {
                if unlikely(arena_has < 16) {
                    break 'copy false;
                }
                // The tag bytes were just read, so the 16 bytes starting at
                // the tag are still addressable; copying from there makes
                // the block copy width-independent of the tag length.
                d.arena.bump(16);
                ptr::copy_nonoverlapping(ptr.sub(TAGBYTES + 1), buf, 16);
                (*dst).data = buf.add(TAGBYTES + 1);
                true
            } else if likely(size <= 32) {
                if unlikely(common_has < 32) {
                    break 'copy false;
                }
                fastdecode_docopy(d, ptr, size, 32, buf, dst);
                true
            } else if likely(size <= 64) {
                if unlikely(common_has < 64) {
                    break 'copy false;
                }
                fastdecode_docopy(d, ptr, size, 64, buf, dst);
                true
            } else if likely(size <= 128) {
                if unlikely(common_has < 128) {
                    break 'copy false;
                }
                fastdecode_docopy(d, ptr, size, 128, buf, dst);
                true
            } else {
                false
            }
        };
        if unlikely(!copied) {
            if CARD == CARD_R {
                // The long-string routine fills the current slot before it
                // redispatches, so the commit must count it.
                fastdecode_commitarr::<{ size_of::<StrView>() }>(
                    (dst as *mut u8).add(size_of::<StrView>()),
                    &farr,
                );
            }
            ptr = ptr.sub(1);
            return fastdecode_longstring(d, ptr, msg, table, hasbits, dst);
        }

        ptr = ptr.add(size);

        if CARD == CARD_R {
            match fastdecode_nextrepeated::<TAGBYTES, { size_of::<StrView>() }>(
                d,
                dst as *mut u8,
                &mut ptr,
                &mut farr,
                data,
            ) {
                Next::SameField { dst: next, .. } => {
                    dst = next as *mut StrView;
                    continue;
                }
                Next::OtherField { tag } => return tagdispatch(d, ptr, msg, table, hasbits, tag),
                Next::AtLimit => return ptr,
                Next::Abort => return decode_err(d, DecodeError::BoundsExceeded),
            }
        }
        break;
    }

    dispatch(d, ptr, msg, table, hasbits)
}

/// Alias-mode string parser: installs views that reference the input
/// buffer directly. Only applies while `d.alias` holds; a refill mid-run
/// turns it off, which forces a commit and a dispatch hop over to the copy
/// family.
#[inline(always)]
unsafe fn fastdecode_string<const TAGBYTES: usize, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
    copyfunc: FieldParser,
) -> *const u8 {
    if unlikely(!checktag::<TAGBYTES>(data)) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }
    if unlikely(!d.alias) {
        return copyfunc(d, ptr, msg, table, hasbits, data);
    }

    let mut farr = FastArr::default();
    let dst = fastdecode_getfield::<{ size_of::<StrView>() }, CARD>(
        d, ptr, msg, &mut data, &mut hasbits, &mut farr,
    );
    if CARD == CARD_R && unlikely(dst.is_null()) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }
    let mut dst = dst as *mut StrView;

    loop {
        if CARD == CARD_R {
            let p = fastdecode_resizearr::<{ size_of::<StrView>() }>(d, dst as *mut u8, &mut farr);
            if unlikely(p.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
            dst = p as *mut StrView;
        }

        // Signed read: a size >= 128 goes negative and bounces below.
        let size = ptr.add(TAGBYTES).read() as i8 as isize;
        ptr = ptr.add(TAGBYTES + 1);
        (*dst).data = ptr;
        (*dst).size = size as usize;

        if unlikely(boundscheck(ptr, size as usize, d.end)) {
            if CARD == CARD_R {
                fastdecode_commitarr::<{ size_of::<StrView>() }>(
                    (dst as *mut u8).add(size_of::<StrView>()),
                    &farr,
                );
            }
            ptr = ptr.sub(1);
            return fastdecode_longstring(d, ptr, msg, table, hasbits, dst);
        }
        ptr = ptr.add(size as usize);

        if CARD == CARD_R {
            match fastdecode_nextrepeated::<TAGBYTES, { size_of::<StrView>() }>(
                d,
                dst as *mut u8,
                &mut ptr,
                &mut farr,
                data,
            ) {
                Next::SameField { dst: next, tag } => {
                    dst = next as *mut StrView;
                    if unlikely(!d.alias) {
                        // The buffer was patched and aliasing died mid-run.
                        // Commit and hop through dispatch: the copy family
                        // needs the table data reloaded anyway.
                        fastdecode_commitarr::<{ size_of::<StrView>() }>(dst as *mut u8, &farr);
                        return tagdispatch(d, ptr, msg, table, hasbits, tag);
                    }
                    continue;
                }
                Next::OtherField { tag } => return tagdispatch(d, ptr, msg, table, hasbits, tag),
                Next::AtLimit => return ptr,
                Next::Abort => return decode_err(d, DecodeError::BoundsExceeded),
            }
        }
        break;
    }

    dispatch(d, ptr, msg, table, hasbits)
}

/* sub-message fields ******************************************************/

/// Allocates and zeroes a child record. A positive ceiling is a
/// compile-time bound on the record size that lets this carve straight
/// from the bump cursor with a constant-size memset; the layout compiler
/// guarantees the record fits.
#[inline(always)]
unsafe fn decode_newmsg_ceil<const CEIL: i32>(
    d: &mut DecodeState<'_, '_>,
    layout: &Layout,
) -> Option<*mut Object> {
    let size = Object::alloc_size(layout);
    if CEIL > 0 && d.arena.has(CEIL as usize) {
        debug_assert!(size <= CEIL as usize);
        let p = d.arena.head_ptr();
        d.arena.bump(size);
        unpoison(p, CEIL as usize);
        ptr::write_bytes(p, 0, CEIL as usize);
        poison(p.add(size), CEIL as usize - size);
        let header = p as *mut crate::message::ObjectHeader;
        (*header).layout = layout;
        Some(header.add(1) as *mut Object)
    } else {
        let obj = Object::create(layout, d.arena)?;
        Some(obj as *mut Object)
    }
}

#[inline(always)]
unsafe fn fastdecode_submsg<const TAGBYTES: usize, const CEIL: i32, const CARD: u8>(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    mut hasbits: u64,
    mut data: u64,
) -> *const u8 {
    if unlikely(!checktag::<TAGBYTES>(data)) {
        return decode_generic(d, ptr, msg, table, hasbits, 0);
    }

    d.depth -= 1;
    if unlikely(d.depth == 0) {
        return decode_err(d, DecodeError::RecursionLimit);
    }

    let submsg_idx = ((data >> 16) & 0xff) as usize;
    let sub_table = table.submsg_layout(submsg_idx);
    let mut farr = FastArr::default();

    let dst = fastdecode_getfield::<{ size_of::<*mut Object>() }, CARD>(
        d, ptr, msg, &mut data, &mut hasbits, &mut farr,
    );
    if CARD == CARD_R && unlikely(dst.is_null()) {
        return decode_err(d, DecodeError::AllocationFailed);
    }
    let mut dst = dst as *mut *mut Object;

    if CARD == CARD_S {
        (*msg).merge_hasbits(hasbits);
        hasbits = 0;
    }

    loop {
        if CARD == CARD_R {
            let p =
                fastdecode_resizearr::<{ size_of::<*mut Object>() }>(d, dst as *mut u8, &mut farr);
            if unlikely(p.is_null()) {
                return decode_err(d, DecodeError::AllocationFailed);
            }
            dst = p as *mut *mut Object;
        }

        let mut child = *dst;
        if CARD == CARD_R || likely(child.is_null()) {
            match decode_newmsg_ceil::<CEIL>(d, sub_table) {
                Some(m) => {
                    child = m;
                    *dst = child;
                }
                None => return decode_err(d, DecodeError::AllocationFailed),
            }
        }

        ptr = ptr.add(TAGBYTES);
        let sub_ptr = fastdecode_delimited(d, ptr, |d, p| dispatch(d, p, child, sub_table, 0));
        if unlikely(sub_ptr.is_null()) {
            return decode_err(d, DecodeError::Malformed);
        }
        if unlikely(d.end_group != 0) {
            return decode_err(d, DecodeError::UnterminatedGroup);
        }
        ptr = sub_ptr;

        if CARD == CARD_R {
            match fastdecode_nextrepeated::<TAGBYTES, { size_of::<*mut Object>() }>(
                d,
                dst as *mut u8,
                &mut ptr,
                &mut farr,
                data,
            ) {
                Next::SameField { dst: next, .. } => {
                    dst = next as *mut *mut Object;
                    continue;
                }
                Next::OtherField { tag } => {
                    d.depth += 1;
                    return tagdispatch(d, ptr, msg, table, hasbits, tag);
                }
                Next::AtLimit => {
                    d.depth += 1;
                    return ptr;
                }
                Next::Abort => return decode_err(d, DecodeError::BoundsExceeded),
            }
        }
        break;
    }

    d.depth += 1;
    dispatch(d, ptr, msg, table, hasbits)
}

/* entry-point matrix ******************************************************/

// Names encode the matrix axes: cardinality {s,o,r,p}, type {b,v,z,f,s,m},
// value bytes, tag bytes, and the ceiling for sub-messages. E.g. `prv8_2bt`
// is the unpacked-repeated 64-bit varint with a 2-byte tag.

macro_rules! varint_entry {
    ($name:ident, $card:expr, $valbytes:expr, $zigzag:expr, $tagbytes:expr,
     $unpacked:path, $packed:path) => {
        #[inline(never)]
        pub unsafe fn $name(
            d: &mut DecodeState<'_, '_>,
            ptr: *const u8,
            msg: *mut Object,
            table: &Layout,
            hasbits: u64,
            data: u64,
        ) -> *const u8 {
            if $card == CARD_P {
                fastdecode_packedvarint::<{ $tagbytes }, { $valbytes }, { $zigzag }>(
                    d, ptr, msg, table, hasbits, data, $unpacked,
                )
            } else {
                fastdecode_unpackedvarint::<{ $tagbytes }, { $valbytes }, { $zigzag }, { $card }>(
                    d, ptr, msg, table, hasbits, data, $packed,
                )
            }
        }
    };
}

macro_rules! fixed_entry {
    ($name:ident, $card:expr, $valbytes:expr, $tagbytes:expr,
     $unpacked:path, $packed:path) => {
        #[inline(never)]
        pub unsafe fn $name(
            d: &mut DecodeState<'_, '_>,
            ptr: *const u8,
            msg: *mut Object,
            table: &Layout,
            hasbits: u64,
            data: u64,
        ) -> *const u8 {
            if $card == CARD_P {
                fastdecode_packedfixed::<{ $tagbytes }, { $valbytes }>(
                    d, ptr, msg, table, hasbits, data, $unpacked,
                )
            } else {
                fastdecode_unpackedfixed::<{ $tagbytes }, { $valbytes }, { $card }>(
                    d, ptr, msg, table, hasbits, data, $packed,
                )
            }
        }
    };
}

macro_rules! string_entry {
    ($pname:ident, $cname:ident, $card:expr, $tagbytes:expr) => {
        #[inline(never)]
        pub unsafe fn $cname(
            d: &mut DecodeState<'_, '_>,
            ptr: *const u8,
            msg: *mut Object,
            table: &Layout,
            hasbits: u64,
            data: u64,
        ) -> *const u8 {
            fastdecode_copystring::<{ $tagbytes }, { $card }>(d, ptr, msg, table, hasbits, data)
        }

        #[inline(never)]
        pub unsafe fn $pname(
            d: &mut DecodeState<'_, '_>,
            ptr: *const u8,
            msg: *mut Object,
            table: &Layout,
            hasbits: u64,
            data: u64,
        ) -> *const u8 {
            fastdecode_string::<{ $tagbytes }, { $card }>(
                d, ptr, msg, table, hasbits, data, $cname,
            )
        }
    };
}

macro_rules! submsg_entry {
    ($name:ident, $card:expr, $tagbytes:expr, $ceil:expr) => {
        #[inline(never)]
        pub unsafe fn $name(
            d: &mut DecodeState<'_, '_>,
            ptr: *const u8,
            msg: *mut Object,
            table: &Layout,
            hasbits: u64,
            data: u64,
        ) -> *const u8 {
            fastdecode_submsg::<{ $tagbytes }, { $ceil }, { $card }>(
                d, ptr, msg, table, hasbits, data,
            )
        }
    };
}

// {s,o,r,p} x {b1,v4,v8,z4,z8} x {1bt,2bt}

varint_entry!(psb1_1bt, CARD_S, 1, false, 1, prb1_1bt, ppb1_1bt);
varint_entry!(psv4_1bt, CARD_S, 4, false, 1, prv4_1bt, ppv4_1bt);
varint_entry!(psv8_1bt, CARD_S, 8, false, 1, prv8_1bt, ppv8_1bt);
varint_entry!(psz4_1bt, CARD_S, 4, true, 1, prz4_1bt, ppz4_1bt);
varint_entry!(psz8_1bt, CARD_S, 8, true, 1, prz8_1bt, ppz8_1bt);
varint_entry!(psb1_2bt, CARD_S, 1, false, 2, prb1_2bt, ppb1_2bt);
varint_entry!(psv4_2bt, CARD_S, 4, false, 2, prv4_2bt, ppv4_2bt);
varint_entry!(psv8_2bt, CARD_S, 8, false, 2, prv8_2bt, ppv8_2bt);
varint_entry!(psz4_2bt, CARD_S, 4, true, 2, prz4_2bt, ppz4_2bt);
varint_entry!(psz8_2bt, CARD_S, 8, true, 2, prz8_2bt, ppz8_2bt);

varint_entry!(pob1_1bt, CARD_O, 1, false, 1, prb1_1bt, ppb1_1bt);
varint_entry!(pov4_1bt, CARD_O, 4, false, 1, prv4_1bt, ppv4_1bt);
varint_entry!(pov8_1bt, CARD_O, 8, false, 1, prv8_1bt, ppv8_1bt);
varint_entry!(poz4_1bt, CARD_O, 4, true, 1, prz4_1bt, ppz4_1bt);
varint_entry!(poz8_1bt, CARD_O, 8, true, 1, prz8_1bt, ppz8_1bt);
varint_entry!(pob1_2bt, CARD_O, 1, false, 2, prb1_2bt, ppb1_2bt);
varint_entry!(pov4_2bt, CARD_O, 4, false, 2, prv4_2bt, ppv4_2bt);
varint_entry!(pov8_2bt, CARD_O, 8, false, 2, prv8_2bt, ppv8_2bt);
varint_entry!(poz4_2bt, CARD_O, 4, true, 2, prz4_2bt, ppz4_2bt);
varint_entry!(poz8_2bt, CARD_O, 8, true, 2, prz8_2bt, ppz8_2bt);

varint_entry!(prb1_1bt, CARD_R, 1, false, 1, prb1_1bt, ppb1_1bt);
varint_entry!(prv4_1bt, CARD_R, 4, false, 1, prv4_1bt, ppv4_1bt);
varint_entry!(prv8_1bt, CARD_R, 8, false, 1, prv8_1bt, ppv8_1bt);
varint_entry!(prz4_1bt, CARD_R, 4, true, 1, prz4_1bt, ppz4_1bt);
varint_entry!(prz8_1bt, CARD_R, 8, true, 1, prz8_1bt, ppz8_1bt);
varint_entry!(prb1_2bt, CARD_R, 1, false, 2, prb1_2bt, ppb1_2bt);
varint_entry!(prv4_2bt, CARD_R, 4, false, 2, prv4_2bt, ppv4_2bt);
varint_entry!(prv8_2bt, CARD_R, 8, false, 2, prv8_2bt, ppv8_2bt);
varint_entry!(prz4_2bt, CARD_R, 4, true, 2, prz4_2bt, ppz4_2bt);
varint_entry!(prz8_2bt, CARD_R, 8, true, 2, prz8_2bt, ppz8_2bt);

varint_entry!(ppb1_1bt, CARD_P, 1, false, 1, prb1_1bt, ppb1_1bt);
varint_entry!(ppv4_1bt, CARD_P, 4, false, 1, prv4_1bt, ppv4_1bt);
varint_entry!(ppv8_1bt, CARD_P, 8, false, 1, prv8_1bt, ppv8_1bt);
varint_entry!(ppz4_1bt, CARD_P, 4, true, 1, prz4_1bt, ppz4_1bt);
varint_entry!(ppz8_1bt, CARD_P, 8, true, 1, prz8_1bt, ppz8_1bt);
varint_entry!(ppb1_2bt, CARD_P, 1, false, 2, prb1_2bt, ppb1_2bt);
varint_entry!(ppv4_2bt, CARD_P, 4, false, 2, prv4_2bt, ppv4_2bt);
varint_entry!(ppv8_2bt, CARD_P, 8, false, 2, prv8_2bt, ppv8_2bt);
varint_entry!(ppz4_2bt, CARD_P, 4, true, 2, prz4_2bt, ppz4_2bt);
varint_entry!(ppz8_2bt, CARD_P, 8, true, 2, prz8_2bt, ppz8_2bt);

// {s,o,r,p} x {f4,f8} x {1bt,2bt}

fixed_entry!(psf4_1bt, CARD_S, 4, 1, prf4_1bt, ppf4_1bt);
fixed_entry!(psf8_1bt, CARD_S, 8, 1, prf8_1bt, ppf8_1bt);
fixed_entry!(psf4_2bt, CARD_S, 4, 2, prf4_2bt, ppf4_2bt);
fixed_entry!(psf8_2bt, CARD_S, 8, 2, prf8_2bt, ppf8_2bt);

fixed_entry!(pof4_1bt, CARD_O, 4, 1, prf4_1bt, ppf4_1bt);
fixed_entry!(pof8_1bt, CARD_O, 8, 1, prf8_1bt, ppf8_1bt);
fixed_entry!(pof4_2bt, CARD_O, 4, 2, prf4_2bt, ppf4_2bt);
fixed_entry!(pof8_2bt, CARD_O, 8, 2, prf8_2bt, ppf8_2bt);

fixed_entry!(prf4_1bt, CARD_R, 4, 1, prf4_1bt, ppf4_1bt);
fixed_entry!(prf8_1bt, CARD_R, 8, 1, prf8_1bt, ppf8_1bt);
fixed_entry!(prf4_2bt, CARD_R, 4, 2, prf4_2bt, ppf4_2bt);
fixed_entry!(prf8_2bt, CARD_R, 8, 2, prf8_2bt, ppf8_2bt);

fixed_entry!(ppf4_1bt, CARD_P, 4, 1, prf4_1bt, ppf4_1bt);
fixed_entry!(ppf8_1bt, CARD_P, 8, 1, prf8_1bt, ppf8_1bt);
fixed_entry!(ppf4_2bt, CARD_P, 4, 2, prf4_2bt, ppf4_2bt);
fixed_entry!(ppf8_2bt, CARD_P, 8, 2, prf8_2bt, ppf8_2bt);

// {p,c} x {s,o,r} x {1bt,2bt}

string_entry!(pss_1bt, css_1bt, CARD_S, 1);
string_entry!(pss_2bt, css_2bt, CARD_S, 2);
string_entry!(pos_1bt, cos_1bt, CARD_O, 1);
string_entry!(pos_2bt, cos_2bt, CARD_O, 2);
string_entry!(prs_1bt, crs_1bt, CARD_R, 1);
string_entry!(prs_2bt, crs_2bt, CARD_R, 2);

// {s,o,r} x {1bt,2bt} x {64,128,192,256,max}

submsg_entry!(psm_1bt_max64b, CARD_S, 1, 64);
submsg_entry!(psm_1bt_max128b, CARD_S, 1, 128);
submsg_entry!(psm_1bt_max192b, CARD_S, 1, 192);
submsg_entry!(psm_1bt_max256b, CARD_S, 1, 256);
submsg_entry!(psm_1bt_maxmaxb, CARD_S, 1, -1);
submsg_entry!(psm_2bt_max64b, CARD_S, 2, 64);
submsg_entry!(psm_2bt_max128b, CARD_S, 2, 128);
submsg_entry!(psm_2bt_max192b, CARD_S, 2, 192);
submsg_entry!(psm_2bt_max256b, CARD_S, 2, 256);
submsg_entry!(psm_2bt_maxmaxb, CARD_S, 2, -1);

submsg_entry!(pom_1bt_max64b, CARD_O, 1, 64);
submsg_entry!(pom_1bt_max128b, CARD_O, 1, 128);
submsg_entry!(pom_1bt_max192b, CARD_O, 1, 192);
submsg_entry!(pom_1bt_max256b, CARD_O, 1, 256);
submsg_entry!(pom_1bt_maxmaxb, CARD_O, 1, -1);
submsg_entry!(pom_2bt_max64b, CARD_O, 2, 64);
submsg_entry!(pom_2bt_max128b, CARD_O, 2, 128);
submsg_entry!(pom_2bt_max192b, CARD_O, 2, 192);
submsg_entry!(pom_2bt_max256b, CARD_O, 2, 256);
submsg_entry!(pom_2bt_maxmaxb, CARD_O, 2, -1);

submsg_entry!(prm_1bt_max64b, CARD_R, 1, 64);
submsg_entry!(prm_1bt_max128b, CARD_R, 1, 128);
submsg_entry!(prm_1bt_max192b, CARD_R, 1, 192);
submsg_entry!(prm_1bt_max256b, CARD_R, 1, 256);
submsg_entry!(prm_1bt_maxmaxb, CARD_R, 1, -1);
submsg_entry!(prm_2bt_max64b, CARD_R, 2, 64);
submsg_entry!(prm_2bt_max128b, CARD_R, 2, 128);
submsg_entry!(prm_2bt_max192b, CARD_R, 2, 192);
submsg_entry!(prm_2bt_max256b, CARD_R, 2, 256);
submsg_entry!(prm_2bt_maxmaxb, CARD_R, 2, -1);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::decoding::{decode, DecodeOptions};
    use crate::tables::{Cardinality, FieldInfo, FieldKind, LayoutBuilder};
    use proptest::prelude::*;
    use std::alloc::Global;

    fn put_varint(out: &mut Vec<u8>, mut v: u64) {
        while v >= 0x80 {
            out.push(v as u8 | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
    }

    fn put_tag(out: &mut Vec<u8>, number: u32, wire_type: u32) {
        put_varint(out, (number << 3 | wire_type) as u64);
    }

    fn field(number: u32, kind: FieldKind, card: Cardinality, offset: u16) -> FieldInfo {
        FieldInfo {
            number,
            offset,
            case_offset: 0,
            hasbit: 0,
            submsg: 0,
            kind,
            card,
        }
    }

    fn array_slice<'a, T>(msg: &'a Object, offset: usize) -> &'a [T] {
        let arr: *mut RepeatedArray = msg.get(offset);
        if arr.is_null() {
            &[]
        } else {
            unsafe { (*arr).as_slice() }
        }
    }

    #[test]
    fn singular_varint() {
        // Field 1 = int32 at offset 8, presence bit 0.
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        decode(&[0x08, 0x96, 0x01], msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(msg.get::<u32>(8), 150);
        assert!(msg.has_bit(0));
    }

    #[test]
    fn packed_data_into_unpacked_field() {
        // The field is declared unpacked; the wiretype flip must route to
        // the packed parser.
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Repeated, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let buf = [0x0a, 0x06, 0x03, 0x8e, 0x02, 0x9e, 0xa7, 0x05];
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(array_slice::<u32>(msg, 8), &[3, 270, 86942]);
    }

    #[test]
    fn unpacked_data_into_packed_field() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Packed, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        decode(&[0x08, 0x01, 0x08, 0x02], msg, layout, &mut arena, DecodeOptions::default())
            .unwrap();

        assert_eq!(array_slice::<u32>(msg, 8), &[1, 2]);
    }

    fn string_and_fixed_layout() -> &'static Layout {
        let mut f2 = field(2, FieldKind::Fixed64, Cardinality::Singular, 24);
        f2.hasbit = 1;
        LayoutBuilder::new(32)
            .field(field(1, FieldKind::Bytes, Cardinality::Singular, 8))
            .field(f2)
            .build()
    }

    // `0x0a 0x05 hello` followed by two fixed64 fields so the whole input
    // exceeds the slop staging threshold.
    fn hello_buf() -> Vec<u8> {
        let mut buf = vec![0x0a, 0x05];
        buf.extend_from_slice(b"hello");
        for v in [1u64, 2u64] {
            buf.push(0x11);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn aliased_short_string() {
        // Alias mode points the view into the input buffer and leaves the
        // arena untouched.
        let layout = string_and_fixed_layout();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();
        let buf = hello_buf();

        let head_before = arena.head_ptr();
        let allocs_before = arena.allocations();
        decode(
            &buf,
            msg,
            layout,
            &mut arena,
            DecodeOptions { alias: true, ..Default::default() },
        )
        .unwrap();

        let view = msg.get::<StrView>(8);
        assert_eq!(view.data, unsafe { buf.as_ptr().add(2) });
        assert_eq!(view.size, 5);
        assert_eq!(arena.head_ptr(), head_before);
        assert_eq!(arena.allocations(), allocs_before);
        assert_eq!(msg.get::<u64>(24), 2);
    }

    #[test]
    fn copied_short_string() {
        // Copy mode lands the string via the 16-byte cascade arm; the bump
        // cursor advances by exactly 16.
        let layout = string_and_fixed_layout();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();
        let buf = hello_buf();

        let head_before = arena.head_ptr();
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        let view = msg.get::<StrView>(8);
        assert_eq!(view.as_bytes(), b"hello");
        assert_eq!(arena.head_ptr() as usize - head_before as usize, 16);
        assert_eq!(view.data, unsafe { head_before.add(2) as *const u8 });
    }

    fn nested_layouts(levels: usize) -> &'static Layout {
        let mut layout = LayoutBuilder::new(16).build();
        for _ in 0..levels {
            layout = LayoutBuilder::new(16)
                .field(field(1, FieldKind::Message, Cardinality::Singular, 8))
                .submsg(layout)
                .build();
        }
        layout
    }

    fn nested_input(levels: usize) -> Vec<u8> {
        let mut buf = Vec::new();
        for _ in 0..levels {
            let mut outer = vec![0x0a];
            put_varint(&mut outer, buf.len() as u64);
            outer.extend_from_slice(&buf);
            buf = outer;
        }
        buf
    }

    #[test]
    fn recursion_limit() {
        // 101 nested sub-messages against a depth budget of 100.
        let layout = nested_layouts(102);
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();
        let buf = nested_input(101);

        let err = decode(
            &buf,
            msg,
            layout,
            &mut arena,
            DecodeOptions { depth_limit: 100, ..Default::default() },
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::RecursionLimit);
    }

    #[test]
    fn nesting_within_budget() {
        let layout = nested_layouts(102);
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();
        let buf = nested_input(20);

        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();
    }

    #[test]
    fn fused_run_growth() {
        // 32 consecutive one-byte-tag varints; the array doubles twice
        // from its initial capacity of 8, so the decode performs exactly
        // three arena operations.
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Repeated, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = Vec::new();
        for i in 1..=32u64 {
            buf.push(0x08);
            put_varint(&mut buf, i);
        }

        let allocs_before = arena.allocations();
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(arena.allocations() - allocs_before, 3);
        let got = array_slice::<u32>(msg, 8);
        assert_eq!(got.len(), 32);
        for (i, v) in got.iter().enumerate() {
            assert_eq!(*v, i as u32 + 1);
        }
    }

    #[test]
    fn two_byte_tag_singular() {
        let layout = LayoutBuilder::new(16)
            .field(field(16, FieldKind::Varint64, Cardinality::Singular, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        decode(&[0x80, 0x01, 0x96, 0x01], msg, layout, &mut arena, DecodeOptions::default())
            .unwrap();
        assert_eq!(msg.get::<u64>(8), 150);
        assert!(msg.has_bit(0));
    }

    #[test]
    fn two_byte_tag_fused_fixed() {
        let layout = LayoutBuilder::new(16)
            .field(field(17, FieldKind::Fixed32, Cardinality::Repeated, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = Vec::new();
        for v in [10u32, 20, 30] {
            buf.extend_from_slice(&[0x8d, 0x01]);
            buf.extend_from_slice(&v.to_le_bytes());
        }
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(array_slice::<u32>(msg, 8), &[10, 20, 30]);
    }

    #[test]
    fn zigzag_munge() {
        let layout = LayoutBuilder::new(24)
            .field(field(1, FieldKind::Zigzag32, Cardinality::Singular, 8))
            .field({
                let mut f = field(2, FieldKind::Zigzag64, Cardinality::Singular, 16);
                f.hasbit = 1;
                f
            })
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = Vec::new();
        put_tag(&mut buf, 1, 0);
        put_varint(&mut buf, crate::wire::zigzag_encode(-3) as u32 as u64);
        put_tag(&mut buf, 2, 0);
        put_varint(&mut buf, crate::wire::zigzag_encode(-1234567890123));
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(msg.get::<i32>(8), -3);
        assert_eq!(msg.get::<i64>(16), -1234567890123);
    }

    #[test]
    fn bool_collapses() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Bool, Cardinality::Singular, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        // Any non-zero varint stores as exactly 1.
        decode(&[0x08, 0x96, 0x01], msg, layout, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(msg.get::<u8>(8), 1);
    }

    fn oneof_layout() -> &'static Layout {
        let mut f1 = field(1, FieldKind::Varint32, Cardinality::Oneof, 8);
        f1.case_offset = 4;
        let mut f2 = field(2, FieldKind::Fixed64, Cardinality::Oneof, 8);
        f2.case_offset = 4;
        LayoutBuilder::new(16).field(f1).field(f2).build()
    }

    #[test]
    fn oneof_last_wins() {
        let layout = oneof_layout();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = vec![0x08, 0x05];
        buf.push(0x11);
        buf.extend_from_slice(&7u64.to_le_bytes());
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        assert_eq!(msg.oneof_case(4), 2);
        assert_eq!(msg.get::<u64>(8), 7);
    }

    #[test]
    fn oneof_case_records_field() {
        let layout = oneof_layout();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        decode(&[0x08, 0x05], msg, layout, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(msg.oneof_case(4), 1);
        assert_eq!(msg.get::<u32>(8), 5);
    }

    #[test]
    fn packed_fixed_bulk_copy() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Fixed32, Cardinality::Packed, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = vec![0x0a, 12];
        for v in [1u32, 2, 3] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();
        assert_eq!(array_slice::<u32>(msg, 8), &[1, 2, 3]);
    }

    #[test]
    fn packed_fixed_rejects_ragged_length() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Fixed32, Cardinality::Packed, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let buf = [0x0a, 3, 1, 2, 3];
        let err =
            decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap_err();
        assert_eq!(err, DecodeError::Malformed);
    }

    #[test]
    fn string_cascade_and_longstring() {
        // Repeated strings spanning every cascade arm plus the long path.
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Bytes, Cardinality::Repeated, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let lengths = [5usize, 13, 20, 50, 100, 200];
        let mut buf = Vec::new();
        for (i, len) in lengths.iter().enumerate() {
            put_tag(&mut buf, 1, 2);
            put_varint(&mut buf, *len as u64);
            buf.extend(std::iter::repeat(b'a' + i as u8).take(*len));
        }
        // Trailing field so the cascade arms have input slop to play with.
        put_tag(&mut buf, 2, 1);
        buf.extend_from_slice(&0u64.to_le_bytes());

        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        let views = array_slice::<StrView>(msg, 8);
        assert_eq!(views.len(), lengths.len());
        for (i, (view, len)) in views.iter().zip(lengths).enumerate() {
            assert_eq!(view.size, len);
            assert!(view.as_bytes().iter().all(|b| *b == b'a' + i as u8));
        }
    }

    #[test]
    fn truncated_varint_is_an_error() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let err = decode(&[0x08, 0x96], msg, layout, &mut arena, DecodeOptions::default())
            .unwrap_err();
        assert_eq!(err, DecodeError::BoundsExceeded);
    }

    #[test]
    fn empty_input_is_fine() {
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8))
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        decode(&[], msg, layout, &mut arena, DecodeOptions::default()).unwrap();
        assert!(!msg.has_bit(0));
    }

    #[test]
    fn submessage_values_land_in_child() {
        let child = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8))
            .build();
        let layout = LayoutBuilder::new(24)
            .field(field(1, FieldKind::Message, Cardinality::Singular, 8))
            .field({
                let mut f = field(2, FieldKind::Varint32, Cardinality::Singular, 16);
                f.hasbit = 1;
                f
            })
            .submsg(child)
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        // Child { x: 7 } followed by a sibling field, twice so the second
        // occurrence reuses the allocated child.
        let buf = [0x0a, 2, 0x08, 7, 0x10, 3, 0x0a, 2, 0x08, 9];
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        let child_ptr = msg.get::<*mut Object>(8);
        assert!(!child_ptr.is_null());
        let child_obj = unsafe { &*child_ptr };
        assert_eq!(child_obj.get::<u32>(8), 9);
        assert!(child_obj.has_bit(0));
        assert_eq!(msg.get::<u32>(16), 3);
    }

    #[test]
    fn repeated_submessages() {
        let child = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Varint32, Cardinality::Singular, 8))
            .build();
        let layout = LayoutBuilder::new(16)
            .field(field(1, FieldKind::Message, Cardinality::Repeated, 8))
            .submsg(child)
            .build();
        let mut arena = Arena::new(&Global);
        let msg = Object::create(layout, &mut arena).unwrap();

        let mut buf = Vec::new();
        for v in 1..=5u64 {
            buf.push(0x0a);
            let mut body = vec![0x08];
            put_varint(&mut body, v);
            put_varint(&mut buf, body.len() as u64);
            buf.extend_from_slice(&body);
        }
        decode(&buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();

        let children = array_slice::<*mut Object>(msg, 8);
        assert_eq!(children.len(), 5);
        for (i, child_ptr) in children.iter().enumerate() {
            let child_obj = unsafe { &**child_ptr };
            assert_eq!(child_obj.get::<u32>(8), i as u32 + 1);
        }
    }

    fn bytes_layout() -> &'static Layout {
        let mut f2 = field(2, FieldKind::Varint64, Cardinality::Singular, 24);
        f2.hasbit = 1;
        LayoutBuilder::new(32)
            .field(field(1, FieldKind::Bytes, Cardinality::Repeated, 8))
            .field(f2)
            .build()
    }

    proptest! {
        #[test]
        fn packed_unpacked_interchangeable(values in proptest::collection::vec(any::<u32>(), 0..50)) {
            let repeated = LayoutBuilder::new(16)
                .field(field(1, FieldKind::Varint32, Cardinality::Repeated, 8))
                .build();
            let packed = LayoutBuilder::new(16)
                .field(field(1, FieldKind::Varint32, Cardinality::Packed, 8))
                .build();

            let mut unpacked_buf = Vec::new();
            for v in &values {
                put_tag(&mut unpacked_buf, 1, 0);
                put_varint(&mut unpacked_buf, *v as u64);
            }
            let mut body = Vec::new();
            for v in &values {
                put_varint(&mut body, *v as u64);
            }
            let mut packed_buf = Vec::new();
            put_tag(&mut packed_buf, 1, 2);
            put_varint(&mut packed_buf, body.len() as u64);
            packed_buf.extend_from_slice(&body);

            for layout in [repeated, packed] {
                for buf in [&unpacked_buf, &packed_buf] {
                    let mut arena = Arena::new(&Global);
                    let msg = Object::create(layout, &mut arena).unwrap();
                    decode(buf, msg, layout, &mut arena, DecodeOptions::default()).unwrap();
                    prop_assert_eq!(array_slice::<u32>(msg, 8), values.as_slice());
                }
            }
        }

        #[test]
        fn alias_copy_equivalent(
            strings in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..300),
                0..10,
            ),
            tail in any::<u64>(),
        ) {
            let layout = bytes_layout();
            let mut buf = Vec::new();
            for s in &strings {
                put_tag(&mut buf, 1, 2);
                put_varint(&mut buf, s.len() as u64);
                buf.extend_from_slice(s);
            }
            put_tag(&mut buf, 2, 0);
            put_varint(&mut buf, tail);

            let mut arena_a = Arena::new(&Global);
            let msg_a = Object::create(layout, &mut arena_a).unwrap();
            decode(
                &buf,
                msg_a,
                layout,
                &mut arena_a,
                DecodeOptions { alias: true, ..Default::default() },
            )
            .unwrap();

            let mut arena_c = Arena::new(&Global);
            let msg_c = Object::create(layout, &mut arena_c).unwrap();
            decode(&buf, msg_c, layout, &mut arena_c, DecodeOptions::default()).unwrap();

            let views_a = array_slice::<StrView>(msg_a, 8);
            let views_c = array_slice::<StrView>(msg_c, 8);
            prop_assert_eq!(views_a.len(), strings.len());
            prop_assert_eq!(views_c.len(), strings.len());
            for ((a, c), s) in views_a.iter().zip(views_c).zip(&strings) {
                prop_assert_eq!(a.as_bytes(), s.as_slice());
                prop_assert_eq!(c.as_bytes(), s.as_slice());
            }
            prop_assert_eq!(msg_a.get::<u64>(24), tail);
            prop_assert_eq!(msg_c.get::<u64>(24), tail);
        }
    }
}
