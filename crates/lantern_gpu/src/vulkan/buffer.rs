//! GPU buffer of fixed-size elements with host mapping
//!
//! Each element slot starts at a multiple of the aligned stride, so a single
//! buffer can back one uniform block per frame slot and hand out descriptor
//! ranges by index.

use std::ptr::NonNull;

use ash::vk;
use bytemuck::Pod;

use super::{Device, GpuDevice, VulkanError, VulkanResult};
use super::gpu::BufferAllocation;

/// Round `element_size` up to the next multiple of `min_offset_alignment`
///
/// An alignment of zero leaves the size unchanged. Returns `None` when the
/// rounded size does not fit a `vk::DeviceSize`.
pub fn aligned_stride(element_size: vk::DeviceSize, min_offset_alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
    if min_offset_alignment == 0 {
        return Some(element_size);
    }
    element_size.div_ceil(min_offset_alignment).checked_mul(min_offset_alignment)
}

#[derive(Debug, Clone, Copy)]
struct MappedRange {
    ptr: NonNull<u8>,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
}

impl MappedRange {
    fn end(&self) -> vk::DeviceSize {
        self.offset + self.size
    }

    /// Whether `offset..offset + len` lies inside the mapping
    fn covers(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> bool {
        offset >= self.offset && offset.checked_add(len).is_some_and(|end| end <= self.end())
    }
}

/// Buffer wrapper with RAII cleanup
pub struct Buffer<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    allocation: BufferAllocation,
    mapped: Option<MappedRange>,
    element_size: vk::DeviceSize,
    element_count: u32,
    alignment_size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
}

impl<'d, D: GpuDevice + ?Sized> Buffer<'d, D> {
    /// Create a tightly packed buffer of `element_count` elements
    pub fn new(
        device: &'d D,
        element_size: vk::DeviceSize,
        element_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        Self::with_alignment(device, element_size, element_count, usage, memory_properties, 1)
    }

    /// Create a buffer whose element slots are spaced by the aligned stride
    pub fn with_alignment(
        device: &'d D,
        element_size: vk::DeviceSize,
        element_count: u32,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
        min_offset_alignment: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        if element_size == 0 || element_count == 0 {
            return Err(VulkanError::invalid(format!(
                "Buffer needs a non-zero element size and count (got {} x {})",
                element_size, element_count
            )));
        }

        let alignment_size = aligned_stride(element_size, min_offset_alignment).ok_or_else(|| {
            VulkanError::invalid(format!(
                "Element size {} aligned to {} overflows",
                element_size, min_offset_alignment
            ))
        })?;
        let buffer_size = alignment_size
            .checked_mul(vk::DeviceSize::from(element_count))
            .ok_or_else(|| {
                VulkanError::invalid(format!(
                    "{} elements of stride {} overflow the buffer size",
                    element_count, alignment_size
                ))
            })?;
        let allocation = device.create_buffer(buffer_size, usage, memory_properties)?;

        log::debug!(
            "Created buffer: {} x {} bytes (stride {}, total {}, {:?})",
            element_count,
            element_size,
            alignment_size,
            buffer_size,
            allocation.memory_properties
        );

        Ok(Self {
            device,
            allocation,
            mapped: None,
            element_size,
            element_count,
            alignment_size,
            usage,
        })
    }

    /// Map `size` bytes starting at `offset`; `vk::WHOLE_SIZE` maps to the end
    ///
    /// Mapping an already mapped buffer replaces the previous mapping.
    pub fn map(&mut self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if !self.allocation.memory_properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            return Err(VulkanError::NotHostVisible(self.allocation.memory_properties));
        }

        let buffer_size = self.buffer_size();
        if offset >= buffer_size {
            return Err(VulkanError::invalid(format!(
                "Map offset {} is outside a {} byte buffer",
                offset, buffer_size
            )));
        }
        let size = if size == vk::WHOLE_SIZE { buffer_size - offset } else { size };
        let in_bounds = offset.checked_add(size).is_some_and(|end| end <= buffer_size);
        if size == 0 || !in_bounds {
            return Err(VulkanError::invalid(format!(
                "Map of {} bytes at offset {} exceeds a {} byte buffer",
                size, offset, buffer_size
            )));
        }

        self.unmap();
        let ptr = self.device.map_memory(self.allocation.memory, offset, size)?;
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| VulkanError::invalid("Memory mapping returned a null pointer"))?;

        self.mapped = Some(MappedRange { ptr, offset, size });
        Ok(())
    }

    /// Map the whole buffer
    pub fn map_all(&mut self) -> VulkanResult<()> {
        self.map(vk::WHOLE_SIZE, 0)
    }

    /// Release the host mapping; does nothing when unmapped
    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            self.device.unmap_memory(self.allocation.memory);
        }
    }

    /// Whether a host mapping is currently active
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Copy `data` into the mapped region at byte `offset` from the buffer start
    pub fn write_to_buffer(&mut self, data: &[u8], offset: vk::DeviceSize) -> VulkanResult<()> {
        let dst = self.mapped_slice_mut(offset, data.len() as vk::DeviceSize, "write")?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Write one plain-data value at the start of the buffer
    pub fn write<T: Pod>(&mut self, value: &T) -> VulkanResult<()> {
        self.write_to_buffer(bytemuck::bytes_of(value), 0)
    }

    /// Write one element at `index * alignment_size`
    pub fn write_to_index<T: Pod>(&mut self, value: &T, index: u32) -> VulkanResult<()> {
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() as vk::DeviceSize > self.element_size {
            return Err(VulkanError::invalid(format!(
                "Element of {} bytes does not fit a {} byte slot",
                bytes.len(),
                self.element_size
            )));
        }
        let offset = self.index_offset(index)?;
        self.write_to_buffer(bytes, offset)
    }

    /// Host view of element `index`; call [`Buffer::invalidate_index`] first on non-coherent memory
    pub fn read_index(&self, index: u32) -> VulkanResult<&[u8]> {
        let offset = self.index_offset(index)?;
        let range = self.require_mapped("read")?;
        let len = self.element_size;
        if !range.covers(offset, len) {
            return Err(VulkanError::invalid(format!(
                "Element {} lies outside the mapped range {}..{}",
                index,
                range.offset,
                range.end()
            )));
        }
        // The range was checked against the live mapping above.
        let slice = unsafe {
            std::slice::from_raw_parts(
                range.ptr.as_ptr().add((offset - range.offset) as usize),
                len as usize,
            )
        };
        Ok(slice)
    }

    /// Flush a mapped range so the device sees host writes
    ///
    /// No-op on host-coherent memory.
    pub fn flush(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.is_host_coherent() {
            return Ok(());
        }
        self.require_mapped("flush")?;
        self.device.flush_mapped_range(self.allocation.memory, offset, size)
    }

    /// Flush element `index`
    pub fn flush_index(&self, index: u32) -> VulkanResult<()> {
        let offset = self.index_offset(index)?;
        self.flush(self.alignment_size, offset)
    }

    /// Invalidate a mapped range so the host sees device writes
    ///
    /// No-op on host-coherent memory.
    pub fn invalidate(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> VulkanResult<()> {
        if self.is_host_coherent() {
            return Ok(());
        }
        self.require_mapped("invalidate")?;
        self.device.invalidate_mapped_range(self.allocation.memory, offset, size)
    }

    /// Invalidate element `index`
    pub fn invalidate_index(&self, index: u32) -> VulkanResult<()> {
        let offset = self.index_offset(index)?;
        self.invalidate(self.alignment_size, offset)
    }

    /// Descriptor range over this buffer
    pub fn descriptor_info(&self, size: vk::DeviceSize, offset: vk::DeviceSize) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.allocation.buffer,
            offset,
            range: size,
        }
    }

    /// Descriptor range covering element `index`
    pub fn descriptor_info_for_index(&self, index: u32) -> VulkanResult<vk::DescriptorBufferInfo> {
        let offset = self.index_offset(index)?;
        Ok(self.descriptor_info(self.alignment_size, offset))
    }

    /// Byte offset of element `index`
    pub fn index_offset(&self, index: u32) -> VulkanResult<vk::DeviceSize> {
        if index >= self.element_count {
            return Err(VulkanError::invalid(format!(
                "Element index {} out of range for a buffer of {} elements",
                index, self.element_count
            )));
        }
        Ok(vk::DeviceSize::from(index) * self.alignment_size)
    }

    /// Buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.allocation.buffer
    }

    /// Size of one element before alignment
    pub fn element_size(&self) -> vk::DeviceSize {
        self.element_size
    }

    /// Number of element slots
    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    /// Stride between consecutive element slots
    pub fn alignment_size(&self) -> vk::DeviceSize {
        self.alignment_size
    }

    /// Usage flags the buffer was created with
    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory type actually allocated
    pub fn memory_property_flags(&self) -> vk::MemoryPropertyFlags {
        self.allocation.memory_properties
    }

    /// Total size in bytes
    pub fn buffer_size(&self) -> vk::DeviceSize {
        self.allocation.size
    }

    fn is_host_coherent(&self) -> bool {
        self.allocation
            .memory_properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn require_mapped(&self, action: &str) -> VulkanResult<MappedRange> {
        self.mapped
            .ok_or_else(|| VulkanError::invalid(format!("Cannot {} an unmapped buffer", action)))
    }

    fn mapped_slice_mut(
        &mut self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        action: &str,
    ) -> VulkanResult<&mut [u8]> {
        let range = self.require_mapped(action)?;
        if !range.covers(offset, len) {
            return Err(VulkanError::invalid(format!(
                "Cannot {} {} bytes at offset {} outside the mapped range {}..{}",
                action,
                len,
                offset,
                range.offset,
                range.end()
            )));
        }
        // The range was checked against the live mapping above and `&mut self`
        // guarantees no other view of the mapping exists.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(
                range.ptr.as_ptr().add((offset - range.offset) as usize),
                len as usize,
            )
        };
        Ok(slice)
    }
}

impl<D: GpuDevice + ?Sized> Drop for Buffer<'_, D> {
    fn drop(&mut self) {
        self.unmap();
        self.device.destroy_buffer(&self.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    const UNIFORM: vk::BufferUsageFlags = vk::BufferUsageFlags::UNIFORM_BUFFER;

    fn host_visible() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn test_aligned_stride_properties() {
        for size in [1u64, 3, 63, 64, 65, 200, 256, 257, 1000] {
            for alignment in [1u64, 4, 16, 48, 64, 256] {
                let stride = aligned_stride(size, alignment).unwrap();
                assert_eq!(stride % alignment, 0);
                assert!(stride >= size);
                assert!(stride < size + alignment);
            }
        }
    }

    #[test]
    fn test_aligned_stride_zero_alignment() {
        assert_eq!(aligned_stride(37, 0), Some(37));
    }

    #[test]
    fn test_aligned_stride_overflow() {
        assert_eq!(aligned_stride(u64::MAX - 8, 256), None);
        assert_eq!(aligned_stride(u64::MAX, 1), Some(u64::MAX));
    }

    #[test]
    fn test_oversized_buffer_is_rejected() {
        let device = MockDevice::new();
        let result = Buffer::with_alignment(&device, u64::MAX / 2, 3, UNIFORM, host_visible(), 1);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
        assert_eq!(device.live_buffer_count(), 0);
    }

    #[test]
    fn test_ranges_near_u64_max_are_rejected() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(&device, 16, 4, UNIFORM, host_visible()).unwrap();

        assert!(matches!(
            buffer.map(u64::MAX - 8, 16),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(!buffer.is_mapped());

        buffer.map_all().unwrap();
        assert!(matches!(
            buffer.write_to_buffer(&[1, 2, 3, 4], u64::MAX - 1),
            Err(VulkanError::InvalidOperation { .. })
        ));
        assert!(buffer.write_to_buffer(&[1, 2, 3, 4], u64::MAX).is_err());
        assert!(device.memory_bytes(buffer.handle()).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_uniform_slots_use_aligned_stride() {
        let device = MockDevice::new();
        let buffer = Buffer::with_alignment(&device, 64, 3, UNIFORM, host_visible(), 256).unwrap();

        assert_eq!(buffer.alignment_size(), 256);
        assert_eq!(buffer.buffer_size(), 768);
        assert_eq!(buffer.index_offset(0).unwrap(), 0);
        assert_eq!(buffer.index_offset(2).unwrap(), 512);
        assert!(buffer.index_offset(3).is_err());

        let info = buffer.descriptor_info_for_index(1).unwrap();
        assert_eq!(info.offset, 256);
        assert_eq!(info.range, 256);
        assert_eq!(info.buffer, buffer.handle());
    }

    #[test]
    fn test_map_unmap_unmap() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(&device, 16, 4, UNIFORM, host_visible()).unwrap();

        buffer.map_all().unwrap();
        assert!(buffer.is_mapped());
        buffer.unmap();
        buffer.unmap();

        assert!(!buffer.is_mapped());
        assert_eq!(device.unmap_count(), 1);
    }

    #[test]
    fn test_write_without_map_fails() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(&device, 16, 1, UNIFORM, host_visible()).unwrap();

        let result = buffer.write_to_buffer(&[1, 2, 3, 4], 0);
        assert!(matches!(result, Err(VulkanError::InvalidOperation { .. })));
    }

    #[test]
    fn test_write_to_index_lands_at_aligned_offset() {
        let device = MockDevice::new();
        let mut buffer = Buffer::with_alignment(&device, 4, 2, UNIFORM, host_visible(), 256).unwrap();
        buffer.map_all().unwrap();

        buffer.write_to_index(&0xAABB_CCDDu32, 1).unwrap();

        let bytes = device.memory_bytes(buffer.handle());
        assert_eq!(&bytes[256..260], &0xAABB_CCDDu32.to_ne_bytes());
        assert!(bytes[..256].iter().all(|&b| b == 0));
        assert_eq!(buffer.read_index(1).unwrap(), &0xAABB_CCDDu32.to_ne_bytes());
    }

    #[test]
    fn test_write_outside_mapping_fails() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(&device, 8, 2, UNIFORM, host_visible()).unwrap();
        buffer.map(8, 0).unwrap();

        assert!(buffer.write_to_buffer(&[0; 8], 8).is_err());
        assert!(buffer.write_to_buffer(&[0; 9], 0).is_err());
        assert!(buffer.write_to_buffer(&[7; 8], 0).is_ok());
    }

    #[test]
    fn test_map_device_local_fails() {
        let device = MockDevice::new();
        let mut buffer = Buffer::new(
            &device,
            16,
            1,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .unwrap();

        assert!(matches!(buffer.map_all(), Err(VulkanError::NotHostVisible(_))));
    }

    #[test]
    fn test_flush_is_noop_on_coherent_memory() {
        let device = MockDevice::new();
        let buffer = Buffer::new(&device, 16, 2, UNIFORM, host_visible()).unwrap();

        buffer.flush(vk::WHOLE_SIZE, 0).unwrap();
        buffer.invalidate_index(1).unwrap();
        assert!(device.flushed_ranges().is_empty());
        assert!(device.invalidated_ranges().is_empty());
    }

    #[test]
    fn test_flush_index_on_non_coherent_memory() {
        let device = MockDevice::new();
        let mut buffer = Buffer::with_alignment(
            &device,
            64,
            2,
            UNIFORM,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            256,
        )
        .unwrap();

        assert!(buffer.flush_index(1).is_err());

        buffer.map_all().unwrap();
        buffer.flush_index(1).unwrap();
        assert_eq!(device.flushed_ranges(), vec![(256, 256)]);
    }

    #[test]
    fn test_drop_releases_allocation() {
        let device = MockDevice::new();
        {
            let mut buffer = Buffer::new(&device, 16, 1, UNIFORM, host_visible()).unwrap();
            buffer.map_all().unwrap();
            assert_eq!(device.live_buffer_count(), 1);
        }
        assert_eq!(device.live_buffer_count(), 0);
        assert_eq!(device.unmap_count(), 1);
    }
}
