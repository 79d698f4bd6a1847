//! Typed wire records over the arena.
//!
//! This module is the only place that writes domain records into shared
//! memory; the execution loop and the supervisor go through it. All offsets
//! are relative to the arena base, all records are packed plain-old-data,
//! and strings are length-prefixed byte sequences.
//!
//! # Record graph
//!
//! ```text
//! IpcMessage.request_batch ──► RequestBatch ──► [Request; batch_size]
//!                                                  │ inputs ──► [Tensor; n] ──► RawData ──► bytes
//!                                                  │ requested_output_names ──► [offset] ──► string
//!                                                  └ id ──► string
//! IpcMessage.response_batch ─► ResponseBatch ─► [Response; batch_size]
//!                                                  └ outputs ──► [Tensor; n] ──► RawData ──► bytes
//! ```

use crate::error::{Error, Result};
use crate::host::DataType;
use crate::memory::{Arena, ShmRecord};
use smallvec::SmallVec;
use std::ptr::NonNull;

/// A batch of requests handed to the stub. `batch_size == 0` is the graceful
/// shutdown marker.
#[repr(C)]
pub struct RequestBatch {
    /// Offset of the `[Request; batch_size]` array.
    pub requests: u64,
    /// Number of requests in the batch.
    pub batch_size: u32,
    /// Reserved.
    pub _pad: u32,
}

/// One inference request inside a batch.
#[repr(C)]
pub struct Request {
    /// Offset of the request id string.
    pub id: u64,
    /// Correlation id, forwarded untouched.
    pub correlation_id: u64,
    /// Offset of the `[Tensor; input_count]` array.
    pub inputs: u64,
    /// Offset of the `[u64; requested_output_count]` name-offset array.
    pub requested_output_names: u64,
    /// Number of input tensors.
    pub input_count: u32,
    /// Number of requested outputs.
    pub requested_output_count: u32,
}

/// A tensor descriptor. The payload lives in a separate [`RawData`]
/// allocation so descriptors stay small and relocatable.
#[repr(C)]
pub struct Tensor {
    /// Offset of the tensor name string.
    pub name: u64,
    /// Offset of the `[i64; dims_count]` shape array.
    pub dims: u64,
    /// Offset of the [`RawData`] record.
    pub raw_data: u64,
    /// Wire value of the element type.
    pub dtype: u32,
    /// Number of dimensions.
    pub dims_count: u32,
}

/// The raw payload of a tensor.
#[repr(C)]
pub struct RawData {
    /// Offset of the payload bytes.
    pub data: u64,
    /// Payload size in bytes.
    pub byte_size: u64,
}

/// One response inside a batch.
#[repr(C)]
pub struct Response {
    /// Offset of the error string, meaningful when `is_error_set != 0`.
    pub error: u64,
    /// Offset of the `[Tensor; output_count]` array.
    pub outputs: u64,
    /// Number of output tensors.
    pub output_count: u32,
    /// Non-zero when this response failed.
    pub has_error: u8,
    /// Non-zero when `error` holds a retrievable message.
    pub is_error_set: u8,
    /// Reserved.
    pub _pad: [u8; 2],
}

/// A batch of responses published by the stub.
#[repr(C)]
pub struct ResponseBatch {
    /// Offset of the `[Response; batch_size]` array.
    pub responses: u64,
    /// Offset of the batch-level error string, meaningful when
    /// `is_error_set != 0`.
    pub error: u64,
    /// Number of responses.
    pub batch_size: u32,
    /// Non-zero when the whole batch failed.
    pub has_error: u8,
    /// Non-zero when `error` holds a retrievable message.
    pub is_error_set: u8,
    /// Reserved.
    pub _pad: [u8; 2],
}

// SAFETY: all records are repr(C) integer aggregates, valid for any bit
// pattern including zero.
unsafe impl ShmRecord for RequestBatch {}
unsafe impl ShmRecord for Request {}
unsafe impl ShmRecord for Tensor {}
unsafe impl ShmRecord for RawData {}
unsafe impl ShmRecord for Response {}
unsafe impl ShmRecord for ResponseBatch {}

/// Store a length-prefixed string; returns its offset.
pub fn save_string(arena: &Arena, value: &str) -> Result<u64> {
    let (ptr, offset) = arena.map(8 + value.len() as u64)?;
    // SAFETY: the reservation is 8 + len bytes at a 16-aligned offset.
    unsafe {
        ptr.as_ptr().cast::<u64>().write(value.len() as u64);
        std::ptr::copy_nonoverlapping(value.as_ptr(), ptr.as_ptr().add(8), value.len());
    }
    Ok(offset)
}

/// Load a length-prefixed string stored by [`save_string`].
pub fn load_string(arena: &Arena, offset: u64) -> Result<String> {
    let len = *arena.record_at::<u64>(offset)?;
    let bytes = arena.bytes_at(offset + 8, len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Marshal(format!("string at offset {offset} is not valid UTF-8")))
}

/// Store a string map as a pair-count-prefixed array of
/// (key offset, value offset); returns the map offset.
pub fn save_map(arena: &Arena, entries: &[(String, String)]) -> Result<u64> {
    let mut pairs: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        pairs.push((save_string(arena, key)?, save_string(arena, value)?));
    }

    let (offset, slots) = arena.alloc_records::<u64>(1 + 2 * entries.len())?;
    slots[0] = entries.len() as u64;
    for (index, (key_offset, value_offset)) in pairs.iter().enumerate() {
        slots[1 + 2 * index] = *key_offset;
        slots[2 + 2 * index] = *value_offset;
    }
    Ok(offset)
}

/// Load a string map stored by [`save_map`].
pub fn load_map(arena: &Arena, offset: u64) -> Result<Vec<(String, String)>> {
    let count = *arena.record_at::<u64>(offset)? as usize;
    let slots = arena.records_at::<u64>(offset + 8, 2 * count)?;
    let mut entries = Vec::with_capacity(count);
    for index in 0..count {
        entries.push((
            load_string(arena, slots[2 * index])?,
            load_string(arena, slots[2 * index + 1])?,
        ));
    }
    Ok(entries)
}

/// Fill the tensor record at `tensor_offset` and allocate its shape and
/// payload storage; returns a pointer to the payload bytes for the caller
/// to fill.
pub fn write_tensor_into(
    arena: &Arena,
    tensor_offset: u64,
    name: &str,
    dtype: DataType,
    dims: &[i64],
    byte_size: u64,
) -> Result<NonNull<u8>> {
    let name_offset = save_string(arena, name)?;
    let (dims_offset, dims_shm) = arena.alloc_records::<i64>(dims.len())?;
    dims_shm.copy_from_slice(dims);

    let (payload_ptr, payload_offset) = arena.map(byte_size)?;
    let (raw_offset, raw) = arena.alloc_record::<RawData>()?;
    raw.data = payload_offset;
    raw.byte_size = byte_size;

    let tensor = arena.record_at_mut::<Tensor>(tensor_offset)?;
    tensor.name = name_offset;
    tensor.dims = dims_offset;
    tensor.raw_data = raw_offset;
    tensor.dtype = dtype.as_u32();
    tensor.dims_count = dims.len() as u32;
    Ok(payload_ptr)
}

/// Decoded view of a tensor record.
pub struct TensorView {
    /// Tensor name.
    pub name: String,
    /// Element type.
    pub dtype: DataType,
    /// Shape.
    pub dims: SmallVec<[i64; 8]>,
    /// Payload size in bytes.
    pub byte_size: u64,
    /// Offset of the payload bytes.
    pub data: u64,
}

/// Decode the tensor record at `tensor_offset`.
pub fn read_tensor(arena: &Arena, tensor_offset: u64) -> Result<TensorView> {
    let record = arena.record_at::<Tensor>(tensor_offset)?;
    let (name_offset, dims_offset, raw_offset, dtype_raw, dims_count) =
        (record.name, record.dims, record.raw_data, record.dtype, record.dims_count);

    let name = load_string(arena, name_offset)?;
    let dims = arena
        .records_at::<i64>(dims_offset, dims_count as usize)?
        .iter()
        .copied()
        .collect();
    let raw = arena.record_at::<RawData>(raw_offset)?;
    let dtype = DataType::from_u32(dtype_raw)
        .ok_or_else(|| Error::Marshal(format!("unknown tensor datatype {dtype_raw}")))?;

    Ok(TensorView { name, dtype, dims, byte_size: raw.byte_size, data: raw.data })
}

/// Borrow the payload bytes of a decoded tensor.
pub fn tensor_bytes<'a>(arena: &'a Arena, view: &TensorView) -> Result<&'a [u8]> {
    arena.bytes_at(view.data, view.byte_size)
}

/// Allocate a request batch and its request array; returns
/// (batch offset, requests-array offset).
pub fn alloc_request_batch(arena: &Arena, batch_size: u32) -> Result<(u64, u64)> {
    let (requests_offset, _) = arena.alloc_records::<Request>(batch_size as usize)?;
    let (batch_offset, batch) = arena.alloc_record::<RequestBatch>()?;
    batch.requests = requests_offset;
    batch.batch_size = batch_size;
    Ok((batch_offset, requests_offset))
}

/// Offset of request `index` inside a request array.
pub fn request_offset(requests_offset: u64, index: usize) -> u64 {
    requests_offset + (std::mem::size_of::<Request>() * index) as u64
}

/// Allocate a response batch and its response array; returns
/// (batch offset, responses-array offset).
pub fn alloc_response_batch(arena: &Arena, batch_size: u32) -> Result<(u64, u64)> {
    let (responses_offset, _) = arena.alloc_records::<Response>(batch_size as usize)?;
    let (batch_offset, batch) = arena.alloc_record::<ResponseBatch>()?;
    batch.responses = responses_offset;
    batch.batch_size = batch_size;
    Ok((batch_offset, responses_offset))
}

/// Offset of response `index` inside a response array.
pub fn response_offset(responses_offset: u64, index: usize) -> u64 {
    responses_offset + (std::mem::size_of::<Response>() * index) as u64
}

/// Write a batch-level error response; returns the batch offset.
pub fn write_error_response_batch(arena: &Arena, message: &str) -> Result<u64> {
    let error_offset = save_string(arena, message)?;
    let (batch_offset, batch) = arena.alloc_record::<ResponseBatch>()?;
    batch.has_error = 1;
    batch.is_error_set = 1;
    batch.error = error_offset;
    Ok(batch_offset)
}
