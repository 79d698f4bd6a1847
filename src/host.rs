//! Host-facing API.
//!
//! The enclosing server hands requests in and receives responses back through
//! these traits; the runtime treats them as opaque handles. Statistics
//! reporting is a hook with no-op defaults.

use crate::error::Result;
use smallvec::SmallVec;

/// Tensor element types carried across the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    /// Boolean, one byte per element.
    Bool = 1,
    /// Unsigned 8-bit integer.
    Uint8 = 2,
    /// Unsigned 16-bit integer.
    Uint16 = 3,
    /// Unsigned 32-bit integer.
    Uint32 = 4,
    /// Unsigned 64-bit integer.
    Uint64 = 5,
    /// Signed 8-bit integer.
    Int8 = 6,
    /// Signed 16-bit integer.
    Int16 = 7,
    /// Signed 32-bit integer.
    Int32 = 8,
    /// Signed 64-bit integer.
    Int64 = 9,
    /// 16-bit float.
    Fp16 = 10,
    /// 32-bit float.
    Fp32 = 11,
    /// 64-bit float.
    Fp64 = 12,
    /// Variable-length byte sequences.
    Bytes = 13,
}

impl DataType {
    /// Wire value of this type.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::Bool,
            2 => Self::Uint8,
            3 => Self::Uint16,
            4 => Self::Uint32,
            5 => Self::Uint64,
            6 => Self::Int8,
            7 => Self::Int16,
            8 => Self::Int32,
            9 => Self::Int64,
            10 => Self::Fp16,
            11 => Self::Fp32,
            12 => Self::Fp64,
            13 => Self::Bytes,
            _ => return None,
        })
    }
}

/// Borrowed view of one input tensor of a request.
pub struct InputView<'a> {
    /// Tensor name.
    pub name: &'a str,
    /// Element type.
    pub dtype: DataType,
    /// Shape; the first dimension is the batch dimension for batching models.
    pub shape: SmallVec<[i64; 8]>,
    /// Total payload size as reported by the host, summed across buffers.
    pub byte_size: u64,
    /// The payload, possibly split across several host buffers.
    pub buffers: Vec<&'a [u8]>,
}

/// An inference request handle owned by the enclosing server.
pub trait InferenceRequest {
    /// The response handle type paired with this request.
    type Response: InferenceResponse;

    /// Request id.
    fn id(&self) -> Result<String>;

    /// Correlation id.
    fn correlation_id(&self) -> Result<u64>;

    /// Number of input tensors.
    fn input_count(&self) -> usize;

    /// View of input tensor `index`.
    fn input(&self, index: usize) -> Result<InputView<'_>>;

    /// Names of the outputs the client asked for.
    fn requested_output_names(&self) -> Result<Vec<String>>;

    /// Create the response handle for this request.
    fn new_response(&self) -> Result<Self::Response>;
}

/// A response handle owned by the enclosing server.
///
/// A handle is consumed exactly once, by [`InferenceResponse::send`] or
/// [`InferenceResponse::send_error`].
pub trait InferenceResponse: Sized {
    /// Copy one output tensor into a host buffer.
    ///
    /// Returns true when the copy was deferred to a device stream and must be
    /// flushed with [`InferenceResponse::flush_transfers`] before the send.
    fn write_output(&mut self, name: &str, dtype: DataType, shape: &[i64], data: &[u8]) -> Result<bool>;

    /// Synchronize any deferred device copies.
    fn flush_transfers(&mut self) -> Result<()> {
        Ok(())
    }

    /// Deliver the response as final and successful.
    fn send(self) -> Result<()>;

    /// Deliver the response as final with an error.
    fn send_error(self, message: &str) -> Result<()>;
}

/// Wall-clock capture points for one batch, in nanoseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchTimestamps {
    /// Before marshaling began.
    pub exec_start_ns: u64,
    /// After marshaling, before the stub round trip.
    pub compute_start_ns: u64,
    /// After the stub round trip.
    pub compute_end_ns: u64,
    /// After responses were delivered.
    pub exec_end_ns: u64,
}

/// Statistics hook.
pub trait StatsReporter {
    /// Report one request's outcome.
    fn report_request(&mut self, index: usize, success: bool, timestamps: &BatchTimestamps) {
        let _ = (index, success, timestamps);
    }

    /// Report the whole batch.
    fn report_batch(&mut self, total_batch_size: u64, timestamps: &BatchTimestamps) {
        let _ = (total_batch_size, timestamps);
    }
}

/// Reporter that discards statistics.
pub struct NoopStats;

impl StatsReporter for NoopStats {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_wire_round_trip() {
        for value in 1..=13u32 {
            let dtype = DataType::from_u32(value).unwrap();
            assert_eq!(dtype.as_u32(), value);
        }
        assert!(DataType::from_u32(0).is_none());
        assert!(DataType::from_u32(14).is_none());
    }
}
