//! Decode state and the slow half of the decoder: input staging with the
//! 16-byte slop discipline, limit push/pop, the buffer-refill fallback, and
//! the generic field decoder that handles everything the fast-path matrix
//! declines (unknown fields, wire-type mismatches, fields numbered past 31,
//! groups).

use std::ptr;

use tracing::trace;

use crate::arena::Arena;
use crate::array::{fetch_or_create, RepeatedArray};
use crate::fastdecode;
use crate::message::{Object, StrView};
use crate::tables::{Cardinality, FieldInfo, FieldKind, Layout};
use crate::wire::{
    read_longsize, read_tag, read_varint64, zigzag_decode, SLOP_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed varint")]
    MalformedVarint,
    #[error("payload reads past the buffer or scope bounds")]
    BoundsExceeded,
    #[error("length-delimited region exceeds the enclosing limit")]
    InvalidLimit,
    #[error("message nesting exceeds the recursion limit")]
    RecursionLimit,
    #[error("group field was not terminated")]
    UnterminatedGroup,
    #[error("arena allocation failed")]
    AllocationFailed,
    #[error("malformed wire data")]
    Malformed,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    /// Let decoded string views reference the input buffer directly. The
    /// caller must keep the buffer alive as long as the message.
    pub alias: bool,
    /// Sub-message nesting budget.
    pub depth_limit: u32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            alias: false,
            depth_limit: 64,
        }
    }
}

/// The decode state threaded by reference through every parser call.
///
/// `limit` is the active nesting limit as a signed offset relative to
/// `end`; `limit_ptr == end + min(0, limit)` at every observable point, and
/// the reader stops to consult the bounds fallback whenever the cursor
/// reaches `limit_ptr`.
#[repr(C)]
pub struct DecodeState<'a, 'alc> {
    pub(crate) end: *const u8,
    pub(crate) limit_ptr: *const u8,
    pub(crate) limit: isize,
    pub(crate) alias: bool,
    pub(crate) depth: i32,
    pub(crate) end_group: u32,
    pub(crate) error: Option<DecodeError>,
    pub(crate) patch: [u8; SLOP_SIZE * 2],
    pub(crate) arena: &'a mut Arena<'alc>,
}

/// Records the first error and returns the sentinel every caller
/// propagates.
#[inline(never)]
pub(crate) fn decode_err(d: &mut DecodeState<'_, '_>, e: DecodeError) -> *const u8 {
    if d.error.is_none() {
        d.error = Some(e);
    }
    ptr::null()
}

/// Pushes a byte limit for a region of `size` bytes starting at `ptr`.
/// Returns the delta the matching pop needs; deltas survive a buffer refill
/// where absolute limits would not.
#[inline(always)]
pub(crate) fn push_limit(d: &mut DecodeState<'_, '_>, ptr: *const u8, size: isize) -> isize {
    let limit = size + unsafe { ptr.offset_from(d.end) };
    let delta = d.limit - limit;
    debug_assert!(delta >= 0);
    d.limit = limit;
    d.limit_ptr = unsafe { d.end.offset(limit.min(0)) };
    delta
}

#[inline(always)]
pub(crate) fn pop_limit(d: &mut DecodeState<'_, '_>, delta: isize) {
    d.limit += delta;
    d.limit_ptr = unsafe { d.end.offset(d.limit.min(0)) };
    debug_assert_eq!(d.limit_ptr, unsafe { d.end.offset(d.limit.min(0)) });
}

/// Bounds fallback. When the cursor passed `end` but the active limit says
/// more data follows, the remaining real bytes are migrated into the patch
/// buffer and parsing continues there. Aliasing is impossible from then on
/// because patch memory dies with the state. Returns `None` when the
/// cursor overran its scope.
pub(crate) unsafe fn isdonefallback_inl(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    overrun: isize,
) -> Option<*const u8> {
    if overrun < d.limit {
        debug_assert!(overrun >= 0 && (overrun as usize) < SLOP_SIZE);
        let patch = d.patch.as_mut_ptr();
        ptr::write_bytes(patch.add(SLOP_SIZE), 0, SLOP_SIZE);
        ptr::copy_nonoverlapping(d.end, patch, SLOP_SIZE);
        let new_ptr = patch.add(overrun as usize) as *const u8;
        d.end = patch.add(SLOP_SIZE);
        d.limit -= SLOP_SIZE as isize;
        d.limit_ptr = d.end.offset(d.limit.min(0));
        d.alias = false;
        debug_assert!(new_ptr < d.limit_ptr);
        Some(new_ptr)
    } else {
        None
    }
}

/// Scope progress check used by fused runs and packed loops: `Ok(true)`
/// when the current scope is complete, `Ok(false)` (with a possibly
/// refreshed cursor) when another field follows, `Err` on overrun.
#[inline(always)]
pub(crate) unsafe fn decode_isdone(
    d: &mut DecodeState<'_, '_>,
    ptr: &mut *const u8,
) -> Result<bool, ()> {
    if std::hint::likely(*ptr < d.limit_ptr) {
        return Ok(false);
    }
    let overrun = (*ptr).offset_from(d.end);
    if std::hint::likely(overrun == d.limit) {
        return Ok(true);
    }
    match isdonefallback_inl(d, *ptr, overrun) {
        Some(p) => {
            *ptr = p;
            Ok(false)
        }
        None => Err(()),
    }
}

/// Reads a full length prefix (1..5 bytes, 2 GiB cap).
unsafe fn read_size(mut ptr: *const u8) -> Option<(*const u8, isize)> {
    let mut size = ptr.read() as isize;
    ptr = ptr.add(1);
    if size & 0x80 != 0 {
        ptr = read_longsize(ptr, &mut size)?;
    }
    if size < 0 {
        return None;
    }
    Some((ptr, size))
}

/// Decodes one flat buffer into `msg`. All field values land in wire
/// order; short inputs are staged through the patch buffer, longer inputs
/// hold their final `SLOP_SIZE` bytes back for the refill fallback.
pub fn decode(
    buf: &[u8],
    msg: &mut Object,
    table: &Layout,
    arena: &mut Arena<'_>,
    options: DecodeOptions,
) -> Result<(), DecodeError> {
    let mut d = DecodeState {
        end: ptr::null(),
        limit_ptr: ptr::null(),
        limit: 0,
        alias: false,
        depth: options.depth_limit.clamp(1, i32::MAX as u32) as i32,
        end_group: 0,
        error: None,
        patch: [0; SLOP_SIZE * 2],
        arena,
    };
    let len = buf.len();
    unsafe {
        let ptr: *const u8;
        if len <= SLOP_SIZE {
            // Too short to guarantee slop reads; stage through the patch
            // buffer. Aliasing into it would dangle.
            d.patch[..len].copy_from_slice(buf);
            ptr = d.patch.as_ptr();
            d.end = ptr.add(len);
            d.limit = 0;
        } else {
            ptr = buf.as_ptr();
            d.end = ptr.add(len - SLOP_SIZE);
            d.limit = SLOP_SIZE as isize;
            d.alias = options.alias;
        }
        d.limit_ptr = d.end;

        let ret = fastdecode::dispatch(&mut d, ptr, msg as *mut Object, table, 0);
        if ret.is_null() {
            return Err(d.error.unwrap_or(DecodeError::Malformed));
        }
        if d.end_group != 0 {
            return Err(DecodeError::UnterminatedGroup);
        }
    }
    Ok(())
}

/* generic fallback ********************************************************/

/// The non-specialised field decoder. Installed in every unused fasttable
/// slot and entered whenever a specialised parser declines a tag. Flushes
/// `hasbits`, handles exactly one field, then re-enters fast dispatch.
pub(crate) unsafe fn decode_generic(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: *mut Object,
    table: &Layout,
    hasbits: u64,
    _data: u64,
) -> *const u8 {
    (*msg).merge_hasbits(hasbits);

    let Some((mut ptr, tag)) = read_tag(ptr) else {
        return decode_err(d, DecodeError::MalformedVarint);
    };
    let field_number = tag >> 3;
    let wire_type = tag & 7;
    if field_number == 0 {
        return decode_err(d, DecodeError::Malformed);
    }
    if wire_type == 4 {
        // A bare end-group unwinds the enclosing scope; the sub-message
        // parser that pushed it verifies the sentinel.
        d.end_group = field_number;
        return ptr;
    }

    let res = match table.find_field(field_number) {
        Some(f) => decode_known_field(d, ptr, &mut *msg, table, f, tag),
        None => {
            trace!(field_number, wire_type, "skipping unknown field");
            skip_field(d, ptr, tag)
        }
    };
    match res {
        Ok(p) => ptr = p,
        Err(e) => return decode_err(d, e),
    }

    fastdecode::dispatch(d, ptr, msg, table, 0)
}

unsafe fn decode_known_field(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    msg: &mut Object,
    table: &Layout,
    f: &FieldInfo,
    tag: u32,
) -> Result<*const u8, DecodeError> {
    let wire_type = tag & 7;
    match f.kind {
        kind if kind.is_numeric() && wire_type == kind.wire_type() => {
            let val = match kind {
                FieldKind::Fixed32 => {
                    let v = (ptr as *const u32).read_unaligned() as u64;
                    ptr = ptr.add(4);
                    v
                }
                FieldKind::Fixed64 => {
                    let v = (ptr as *const u64).read_unaligned();
                    ptr = ptr.add(8);
                    v
                }
                _ => {
                    let mut v = 0;
                    ptr = read_varint64(ptr, &mut v).ok_or(DecodeError::MalformedVarint)?;
                    v
                }
            };
            store_numeric(d, msg, f, val)?;
            Ok(ptr)
        }
        kind if kind.is_numeric()
            && wire_type == 2
            && matches!(f.card, Cardinality::Repeated | Cardinality::Packed) =>
        {
            decode_packed_generic(d, ptr, msg, f)
        }
        FieldKind::Bytes if wire_type == 2 => {
            let (p, size) = read_size(ptr).ok_or(DecodeError::MalformedVarint)?;
            ptr = p;
            if ptr.offset_from(d.end) + size > d.limit {
                return Err(DecodeError::BoundsExceeded);
            }
            let view = if d.alias {
                StrView {
                    data: ptr,
                    size: size as usize,
                }
            } else {
                let data = d
                    .arena
                    .try_alloc_bytes(size as usize)
                    .ok_or(DecodeError::AllocationFailed)?;
                ptr::copy_nonoverlapping(ptr, data, size as usize);
                StrView {
                    data,
                    size: size as usize,
                }
            };
            store_value(d, msg, f, view)?;
            Ok(ptr.add(size as usize))
        }
        FieldKind::Message if wire_type == 2 => decode_submsg_generic(d, ptr, msg, table, f),
        _ => {
            trace!(
                field_number = f.number,
                wire_type,
                "wire type mismatch, skipping field"
            );
            skip_field(d, ptr, tag)
        }
    }
}

fn store_numeric(
    d: &mut DecodeState<'_, '_>,
    msg: &mut Object,
    f: &FieldInfo,
    raw: u64,
) -> Result<(), DecodeError> {
    match f.kind {
        FieldKind::Bool => store_value(d, msg, f, raw != 0),
        FieldKind::Varint32 | FieldKind::Fixed32 => store_value(d, msg, f, raw as u32),
        FieldKind::Varint64 | FieldKind::Fixed64 => store_value(d, msg, f, raw),
        FieldKind::Zigzag32 => {
            store_value(d, msg, f, zigzag_decode(raw as u32 as u64) as i32)
        }
        FieldKind::Zigzag64 => store_value(d, msg, f, zigzag_decode(raw)),
        FieldKind::Bytes | FieldKind::Message => unreachable!(),
    }
}

fn store_value<T>(
    d: &mut DecodeState<'_, '_>,
    msg: &mut Object,
    f: &FieldInfo,
    val: T,
) -> Result<(), DecodeError> {
    match f.card {
        Cardinality::Singular => {
            msg.set(f.offset as usize, f.hasbit as u32, val);
            Ok(())
        }
        Cardinality::Oneof => {
            msg.set_oneof(f.offset as usize, f.case_offset as usize, f.number, val);
            Ok(())
        }
        Cardinality::Repeated | Cardinality::Packed => {
            let arr_p = msg.ref_mut::<*mut RepeatedArray>(f.offset as usize);
            let lg2 = std::mem::size_of::<T>().trailing_zeros();
            let arr = unsafe { fetch_or_create(arr_p, 8, lg2, d.arena) };
            if arr.is_null() || !unsafe { (*arr).push(val, d.arena) } {
                return Err(DecodeError::AllocationFailed);
            }
            Ok(())
        }
    }
}

/// Packed run of a numeric field arriving on the generic path: push a
/// limit over the region and append elements until it is exhausted.
unsafe fn decode_packed_generic(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: &mut Object,
    f: &FieldInfo,
) -> Result<*const u8, DecodeError> {
    let (mut ptr, size) = read_size(ptr).ok_or(DecodeError::MalformedVarint)?;
    if ptr.offset_from(d.end) + size > d.limit {
        return Err(DecodeError::InvalidLimit);
    }
    let delta = push_limit(d, ptr, size);
    loop {
        match decode_isdone(d, &mut ptr) {
            Ok(true) => break,
            Ok(false) => {}
            Err(()) => return Err(DecodeError::BoundsExceeded),
        }
        match f.kind {
            FieldKind::Fixed32 => {
                let v = (ptr as *const u32).read_unaligned();
                ptr = ptr.add(4);
                store_value(d, msg, f, v)?;
            }
            FieldKind::Fixed64 => {
                let v = (ptr as *const u64).read_unaligned();
                ptr = ptr.add(8);
                store_value(d, msg, f, v)?;
            }
            _ => {
                let mut v = 0;
                ptr = read_varint64(ptr, &mut v).ok_or(DecodeError::MalformedVarint)?;
                store_numeric(d, msg, f, v)?;
            }
        }
    }
    pop_limit(d, delta);
    Ok(ptr)
}

unsafe fn decode_submsg_generic(
    d: &mut DecodeState<'_, '_>,
    ptr: *const u8,
    msg: &mut Object,
    table: &Layout,
    f: &FieldInfo,
) -> Result<*const u8, DecodeError> {
    d.depth -= 1;
    if d.depth == 0 {
        return Err(DecodeError::RecursionLimit);
    }
    let (mut ptr, size) = read_size(ptr).ok_or(DecodeError::MalformedVarint)?;
    if ptr.offset_from(d.end) + size > d.limit {
        return Err(DecodeError::InvalidLimit);
    }
    let child_layout = table.submsg_layout(f.submsg as usize);

    let child: *mut Object = match f.card {
        Cardinality::Singular | Cardinality::Oneof => {
            if f.card == Cardinality::Oneof {
                *msg.ref_mut::<u32>(f.case_offset as usize) = f.number;
            }
            let slot = msg.ref_mut::<*mut Object>(f.offset as usize);
            if slot.is_null() {
                *slot = Object::create(child_layout, d.arena)
                    .ok_or(DecodeError::AllocationFailed)?;
            }
            *slot
        }
        Cardinality::Repeated => {
            let child = Object::create(child_layout, d.arena)
                .ok_or(DecodeError::AllocationFailed)? as *mut Object;
            let arr_p = msg.ref_mut::<*mut RepeatedArray>(f.offset as usize);
            let arr = fetch_or_create(arr_p, 8, 3, d.arena);
            if arr.is_null() || !(*arr).push(child, d.arena) {
                return Err(DecodeError::AllocationFailed);
            }
            child
        }
        Cardinality::Packed => return Err(DecodeError::Malformed),
    };

    let delta = push_limit(d, ptr, size);
    ptr = fastdecode::dispatch(d, ptr, child, child_layout, 0);
    if ptr.is_null() {
        return Err(DecodeError::Malformed);
    }
    if d.end_group != 0 {
        return Err(DecodeError::UnterminatedGroup);
    }
    pop_limit(d, delta);
    d.depth += 1;
    Ok(ptr)
}

/// Skips one field of any wire type, refill-aware for length-delimited
/// payloads that extend past the loaded region.
unsafe fn skip_field(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    tag: u32,
) -> Result<*const u8, DecodeError> {
    match tag & 7 {
        0 => {
            let mut v = 0;
            ptr = read_varint64(ptr, &mut v).ok_or(DecodeError::MalformedVarint)?;
            Ok(ptr)
        }
        1 => Ok(ptr.add(8)),
        5 => Ok(ptr.add(4)),
        2 => {
            let (mut ptr, size) = read_size(ptr).ok_or(DecodeError::MalformedVarint)?;
            if ptr.offset_from(d.end) + size > d.limit {
                return Err(DecodeError::BoundsExceeded);
            }
            let delta = push_limit(d, ptr, size);
            loop {
                match decode_isdone(d, &mut ptr) {
                    Ok(true) => break,
                    Ok(false) => ptr = d.limit_ptr,
                    Err(()) => return Err(DecodeError::BoundsExceeded),
                }
            }
            pop_limit(d, delta);
            Ok(ptr)
        }
        3 => skip_group(d, ptr, tag >> 3),
        6 | 7 => Err(DecodeError::Malformed),
        _ => unreachable!(),
    }
}

/// Consumes an unknown group up to its matching end tag. Nesting shares the
/// sub-message depth budget.
unsafe fn skip_group(
    d: &mut DecodeState<'_, '_>,
    mut ptr: *const u8,
    number: u32,
) -> Result<*const u8, DecodeError> {
    d.depth -= 1;
    if d.depth == 0 {
        return Err(DecodeError::RecursionLimit);
    }
    loop {
        match decode_isdone(d, &mut ptr) {
            Ok(true) => return Err(DecodeError::UnterminatedGroup),
            Ok(false) => {}
            Err(()) => return Err(DecodeError::BoundsExceeded),
        }
        let Some((p, tag)) = read_tag(ptr) else {
            return Err(DecodeError::MalformedVarint);
        };
        ptr = p;
        let field_number = tag >> 3;
        if field_number == 0 {
            return Err(DecodeError::Malformed);
        }
        if tag & 7 == 4 {
            if field_number != number {
                return Err(DecodeError::Malformed);
            }
            d.depth += 1;
            return Ok(ptr);
        }
        ptr = skip_field(d, ptr, tag)?;
    }
}
