//! Owning storage for registered LoRA weights.
//!
//! The execution engine consumes raw addresses. Every tensor behind such an
//! address is owned by a [`WeightBufferSet`] held inside the registry; the
//! addresses stay valid until the registry is dropped. Buffers are never
//! removed or replaced individually.

use candle_core::{CpuStorage, Result, Storage, Tensor};

/// Stable index of a buffer in a [`WeightBufferSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Append-only arena of device-resident tensors.
#[derive(Debug, Default)]
pub struct WeightBufferSet {
    buffers: Vec<Tensor>,
}

impl WeightBufferSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a tensor. It must already be contiguous.
    pub fn insert(&mut self, tensor: Tensor) -> BufferHandle {
        let handle = BufferHandle(self.buffers.len());
        self.buffers.push(tensor);
        handle
    }

    pub fn get(&self, handle: BufferHandle) -> Option<&Tensor> {
        self.buffers.get(handle.0)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Bytes held across all buffers. Buffers sharing storage are counted
    /// once per handle.
    pub fn total_bytes(&self) -> usize {
        self.buffers
            .iter()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

/// Address of the first element of a tensor's data.
///
/// CPU tensors yield a host pointer; with the `cuda` feature, CUDA tensors
/// yield the device pointer. The address is only meaningful while the
/// tensor's storage is alive.
pub fn device_address(tensor: &Tensor) -> Result<u64> {
    let (storage, layout) = tensor.storage_and_layout();
    let offset = (layout.start_offset() * tensor.dtype().size_in_bytes()) as u64;
    let base = match &*storage {
        Storage::Cpu(cpu) => cpu_base_address(cpu),
        #[cfg(feature = "cuda")]
        Storage::Cuda(cuda) => cuda_base_address(tensor, cuda)?,
        #[allow(unreachable_patterns)]
        _ => candle_core::bail!("LoRA buffers must live on a CPU or CUDA device"),
    };
    match base {
        Some(base) => Ok(base + offset),
        None => candle_core::bail!("unsupported LoRA buffer dtype {:?}", tensor.dtype()),
    }
}

fn cpu_base_address(storage: &CpuStorage) -> Option<u64> {
    let ptr = match storage {
        CpuStorage::BF16(v) => v.as_ptr() as usize,
        CpuStorage::F16(v) => v.as_ptr() as usize,
        CpuStorage::F32(v) => v.as_ptr() as usize,
        CpuStorage::F64(v) => v.as_ptr() as usize,
        CpuStorage::U8(v) => v.as_ptr() as usize,
        CpuStorage::U32(v) => v.as_ptr() as usize,
        CpuStorage::I64(v) => v.as_ptr() as usize,
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(ptr as u64)
}

#[cfg(feature = "cuda")]
fn cuda_base_address(tensor: &Tensor, storage: &candle_core::CudaStorage) -> Result<Option<u64>> {
    use candle_core::cuda_backend::cudarc::driver::DevicePtr;
    use candle_core::{DType, Device};

    let Device::Cuda(cuda_device) = tensor.device() else {
        return Ok(None);
    };
    let stream = cuda_device.cuda_stream();
    let ptr = match tensor.dtype() {
        DType::BF16 => storage.as_cuda_slice::<half::bf16>()?.device_ptr(&stream).0,
        DType::F16 => storage.as_cuda_slice::<half::f16>()?.device_ptr(&stream).0,
        DType::F32 => storage.as_cuda_slice::<f32>()?.device_ptr(&stream).0,
        _ => return Ok(None),
    };
    Ok(Some(ptr))
}
