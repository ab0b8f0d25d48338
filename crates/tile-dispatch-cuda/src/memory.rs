//! Typed device buffers.

use crate::context::CudaContext;
use crate::error::Result;
use cudarc::driver::sys::CUdeviceptr;
use cudarc::driver::{CudaSlice, DevicePtr, DevicePtrMut};
use tile_dispatch::{DataType, DeviceBuffer, HostBuffer};

/// A typed tensor stored in GPU memory as raw element bytes.
///
/// The element encoding is the one [`HostBuffer`] uses, so uploads and
/// downloads are plain byte copies.
pub struct DeviceTensor {
    data: CudaSlice<u8>,
    dtype: DataType,
    len: usize,
}

impl DeviceTensor {
    /// Upload a host buffer.
    pub fn from_host(ctx: &CudaContext, host: &HostBuffer) -> Result<Self> {
        let data = ctx.device().htod_sync_copy(host.as_bytes())?;
        Ok(Self {
            data,
            dtype: host.dtype(),
            len: host.len(),
        })
    }

    /// Encode `values` as `dtype` and upload them.
    pub fn from_f32(ctx: &CudaContext, dtype: DataType, values: &[f32]) -> Result<Self> {
        Self::from_host(ctx, &HostBuffer::from_f32(dtype, values))
    }

    pub fn from_i32(ctx: &CudaContext, dtype: DataType, values: &[i32]) -> Result<Self> {
        Self::from_host(ctx, &HostBuffer::from_i32(dtype, values))
    }

    /// Allocate a zeroed tensor of `len` elements.
    pub fn zeros(ctx: &CudaContext, dtype: DataType, len: usize) -> Result<Self> {
        let data = ctx.device().alloc_zeros::<u8>(len * dtype.byte_width())?;
        Ok(Self { data, dtype, len })
    }

    /// Copy the tensor back to the host.
    pub fn to_host(&self, ctx: &CudaContext) -> Result<HostBuffer> {
        let bytes = ctx.device().dtoh_sync_copy(&self.data)?;
        Ok(HostBuffer::from_bytes(self.dtype, bytes)?)
    }

    pub fn to_f32(&self, ctx: &CudaContext) -> Result<Vec<f32>> {
        Ok(self.to_host(ctx)?.to_f32())
    }

    pub(crate) fn ptr(&self) -> CUdeviceptr {
        *self.data.device_ptr()
    }

    pub(crate) fn ptr_mut(&mut self) -> CUdeviceptr {
        *self.data.device_ptr_mut()
    }
}

impl DeviceBuffer for DeviceTensor {
    fn dtype(&self) -> DataType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Device address of an optional input, null when absent.
pub(crate) fn ptr_or_null(buf: Option<&DeviceTensor>) -> CUdeviceptr {
    buf.map_or(0, DeviceTensor::ptr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Option<CudaContext> {
        let path = std::env::var(crate::ENV_PTX).ok()?;
        match CudaContext::from_ptx_file(0, path) {
            Ok(ctx) => Some(ctx),
            Err(_) => {
                println!("CUDA not available, skipping test");
                None
            }
        }
    }

    #[test]
    fn test_upload_download() {
        let Some(ctx) = context() else { return };
        let values = [1.0f32, -2.5, 0.125, 448.0];
        for dtype in [DataType::Fp32, DataType::Bf16, DataType::Fp16, DataType::Fp8] {
            let t = DeviceTensor::from_f32(&ctx, dtype, &values).unwrap();
            assert_eq!(t.len(), 4);
            assert_eq!(t.dtype(), dtype);
            assert_eq!(t.to_host(&ctx).unwrap(), HostBuffer::from_f32(dtype, &values));
        }
    }

    #[test]
    fn test_zeros() {
        let Some(ctx) = context() else { return };
        let t = DeviceTensor::zeros(&ctx, DataType::Int32, 16).unwrap();
        assert_eq!(t.to_host(&ctx).unwrap().to_i32(), vec![0; 16]);
    }
}
