//! Portable host compute primitive.
//!
//! [`HostBackend`] runs every registry entry on the CPU. It mirrors what the
//! device kernels compute: accumulation in the wide type, scales applied in the
//! epilogue (or per quantization block), one narrowing step on store. The tile
//! parameters of the selected entry do not change results, only how a device
//! would schedule the work.
//!
//! Rows are computed independently (in parallel with the `parallel` feature)
//! and reduced in a fixed order, so repeated launches are bitwise identical.
//!
//! # Example
//!
//! ```rust
//! use tile_dispatch::host::HostBuffer;
//! use tile_dispatch::types::DataType;
//!
//! let buf = HostBuffer::from_f32(DataType::Bf16, &[1.0, 2.5, -3.0]);
//! assert_eq!(buf.to_f32(), vec![1.0, 2.5, -3.0]);
//! ```

mod attention;
mod gemm;

use crate::error::{DispatchError, Result};
use crate::launch::{
    BatchPrefillArgs, ComputeBackend, DeviceBuffer, FmhaFwdArgs, FmhaSplitKvArgs, MoeGemmArgs,
};
use crate::registry::{FmhaKernel, GemmKernel};
use crate::types::{DataType, MaskInfo, TraitDescriptor};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Host-resident typed buffer, little-endian element storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBuffer {
    dtype: DataType,
    data: Vec<u8>,
}

impl HostBuffer {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        Self {
            dtype,
            data: vec![0; len * dtype.byte_width()],
        }
    }

    /// Encode `values` into `dtype`.
    pub fn from_f32(dtype: DataType, values: &[f32]) -> Self {
        Self {
            dtype,
            data: dtype.from_f32(values),
        }
    }

    pub fn from_i32(dtype: DataType, values: &[i32]) -> Self {
        Self {
            dtype,
            data: dtype.from_i32(values),
        }
    }

    /// Wrap raw element bytes.
    pub fn from_bytes(dtype: DataType, data: Vec<u8>) -> Result<Self> {
        if data.len() % dtype.byte_width() != 0 {
            return Err(DispatchError::InvalidArgument(format!(
                "{} bytes is not a whole number of {} elements",
                data.len(),
                dtype
            )));
        }
        Ok(Self { dtype, data })
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.dtype.to_f32(&self.data)
    }

    pub fn to_i32(&self) -> Vec<i32> {
        self.dtype.to_i32(&self.data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Overwrite the contents, narrowing `values` into this buffer's type.
    pub(crate) fn store_f32(&mut self, values: &[f32]) {
        self.data = self.dtype.from_f32(values);
    }

    /// Overwrite the contents with already encoded elements.
    pub(crate) fn store_bytes(&mut self, data: Vec<u8>) -> Result<()> {
        if data.len() != self.data.len() {
            return Err(DispatchError::Backend(format!(
                "store of {} bytes into a {}-byte {} buffer",
                data.len(),
                self.data.len(),
                self.dtype
            )));
        }
        self.data = data;
        Ok(())
    }
}

impl DeviceBuffer for HostBuffer {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.data.len() / self.dtype.byte_width()
    }
}

/// CPU implementation of [`ComputeBackend`]. Launches complete synchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl HostBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for HostBackend {
    type Buffer = HostBuffer;
    type Stream = ();

    fn name(&self) -> &str {
        "host"
    }

    fn launch_moe_gemm(
        &self,
        kernel: &GemmKernel,
        traits: &TraitDescriptor,
        args: &mut MoeGemmArgs<'_, HostBuffer>,
        _stream: &(),
    ) -> Result<()> {
        gemm::run(kernel, traits, args)
    }

    fn launch_fmha_fwd(
        &self,
        _kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaFwdArgs<'_, HostBuffer>,
        _stream: &(),
    ) -> Result<()> {
        attention::fwd(traits, mask, args)
    }

    fn launch_fmha_splitkv(
        &self,
        _kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut FmhaSplitKvArgs<'_, HostBuffer>,
        _stream: &(),
    ) -> Result<()> {
        attention::splitkv(traits, mask, args)
    }

    fn launch_batch_prefill(
        &self,
        _kernel: &FmhaKernel,
        traits: &TraitDescriptor,
        mask: &MaskInfo,
        args: &mut BatchPrefillArgs<'_, HostBuffer>,
        _stream: &(),
    ) -> Result<()> {
        attention::batch_prefill(traits, mask, args)
    }

    fn synchronize(&self, _stream: &()) -> Result<()> {
        Ok(())
    }
}

/// Map `items` in order, in parallel when enabled.
fn map_ordered<T, R, F>(items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync + Send,
{
    #[cfg(feature = "parallel")]
    {
        items.par_iter().map(f).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        items.iter().map(f).collect()
    }
}

/// Read an Int32 index buffer as non-negative offsets.
fn read_offsets(name: &str, buf: &HostBuffer) -> Result<Vec<usize>> {
    buf.to_i32()
        .into_iter()
        .map(|v| {
            usize::try_from(v)
                .map_err(|_| {
                    DispatchError::InvalidArgument(format!("{}: negative entry {}", name, v))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_len_counts_elements() {
        let b = HostBuffer::zeros(DataType::Fp32, 5);
        assert_eq!(b.len(), 5);
        assert_eq!(b.as_bytes().len(), 20);
        assert!(!b.is_empty());
    }

    #[test]
    fn test_from_bytes_rejects_partial_element() {
        assert!(HostBuffer::from_bytes(DataType::Fp16, vec![0; 3]).is_err());
        assert!(HostBuffer::from_bytes(DataType::Fp16, vec![0; 4]).is_ok());
    }

    #[test]
    fn test_store_narrows() {
        let mut b = HostBuffer::zeros(DataType::Bf16, 2);
        b.store_f32(&[1.0, 1.0 + 1.0 / 512.0]);
        assert_eq!(b.to_f32(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_store_bytes_keeps_length() {
        let mut b = HostBuffer::zeros(DataType::Fp16, 2);
        assert!(b.store_bytes(vec![0; 6]).is_err());
        b.store_bytes(DataType::Fp16.from_f32(&[2.0, -0.5])).unwrap();
        assert_eq!(b.to_f32(), vec![2.0, -0.5]);
    }

    #[test]
    fn test_read_offsets() {
        let ok = HostBuffer::from_i32(DataType::Int32, &[0, 3, 7]);
        assert_eq!(read_offsets("x", &ok).unwrap(), vec![0, 3, 7]);
        let bad = HostBuffer::from_i32(DataType::Int32, &[0, -1]);
        assert!(read_offsets("x", &bad).is_err());
    }
}
