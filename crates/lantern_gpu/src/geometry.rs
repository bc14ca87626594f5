//! Immutable device-local geometry
//!
//! Vertex and index data go through a host-visible staging buffer into
//! device-local buffers once, at load time. [`GeometryStore`] hands out
//! generational keys and shares each geometry through `Rc`, so any number of
//! draw-time users can hold the same buffers read-only.

use std::mem::size_of;
use std::rc::Rc;

use ash::vk;
use bytemuck::Pod;
use slotmap::{new_key_type, SlotMap};

use crate::vulkan::{Buffer, Device, GpuDevice, VulkanError, VulkanResult};

/// Copy `data` into a new device-local buffer through a temporary staging buffer
///
/// Blocks until the transfer completes; keep it off the per-frame path.
pub fn upload_device_local<'d, D, T>(
    device: &'d D,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> VulkanResult<Buffer<'d, D>>
where
    D: GpuDevice + ?Sized,
    T: Pod,
{
    let element_size = size_of::<T>() as vk::DeviceSize;
    let element_count = u32::try_from(data.len())
        .map_err(|_| VulkanError::invalid(format!("{} elements do not fit a buffer", data.len())))?;

    let mut staging = Buffer::new(
        device,
        element_size,
        element_count,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    staging.map_all()?;
    staging.write_to_buffer(bytemuck::cast_slice(data), 0)?;
    staging.unmap();

    let destination = Buffer::new(
        device,
        element_size,
        element_count,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    device.copy_buffer(staging.handle(), destination.handle(), staging.buffer_size())?;

    Ok(destination)
}

/// Vertex buffer with an optional `u32` index buffer
pub struct GeometryBuffers<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    vertex_buffer: Buffer<'d, D>,
    vertex_count: u32,
    index_buffer: Option<Buffer<'d, D>>,
    index_count: u32,
}

impl<'d, D: GpuDevice + ?Sized> GeometryBuffers<'d, D> {
    /// Upload `vertices` and, when non-empty, `indices`
    pub fn new<V: Pod>(device: &'d D, vertices: &[V], indices: &[u32]) -> VulkanResult<Self> {
        if vertices.len() < 3 {
            return Err(VulkanError::invalid(format!(
                "Geometry needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }

        let vertex_buffer = upload_device_local(device, vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let vertex_count = vertex_buffer.element_count();

        let (index_buffer, index_count) = if indices.is_empty() {
            (None, 0)
        } else {
            let buffer = upload_device_local(device, indices, vk::BufferUsageFlags::INDEX_BUFFER)?;
            let count = buffer.element_count();
            (Some(buffer), count)
        };

        log::debug!("Uploaded geometry: {} vertices, {} indices", vertex_count, index_count);

        Ok(Self {
            device,
            vertex_buffer,
            vertex_count,
            index_buffer,
            index_count,
        })
    }

    /// Record vertex and index buffer binds
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.device.cmd_bind_geometry(
            command_buffer,
            self.vertex_buffer.handle(),
            self.index_buffer.as_ref().map(Buffer::handle),
        );
    }

    /// Record an indexed draw when indices exist, otherwise a plain draw
    pub fn draw(&self, command_buffer: vk::CommandBuffer) {
        if self.index_buffer.is_some() {
            self.device.cmd_draw_indexed(command_buffer, self.index_count);
        } else {
            self.device.cmd_draw(command_buffer, self.vertex_count);
        }
    }

    /// Number of uploaded vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Number of uploaded indices, zero without an index buffer
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Whether [`draw`](Self::draw) records an indexed draw
    pub fn has_index_buffer(&self) -> bool {
        self.index_buffer.is_some()
    }

    /// Raw vertex buffer handle
    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertex_buffer.handle()
    }

    /// Raw index buffer handle, if any
    pub fn index_buffer(&self) -> Option<vk::Buffer> {
        self.index_buffer.as_ref().map(Buffer::handle)
    }
}

new_key_type! {
    /// Generational handle into a [`GeometryStore`]
    pub struct GeometryKey;
}

/// Arena of shared immutable geometry
pub struct GeometryStore<'d, D: GpuDevice + ?Sized = Device> {
    entries: SlotMap<GeometryKey, Rc<GeometryBuffers<'d, D>>>,
}

impl<'d, D: GpuDevice + ?Sized> Default for GeometryStore<'d, D> {
    fn default() -> Self {
        Self { entries: SlotMap::with_key() }
    }
}

impl<'d, D: GpuDevice + ?Sized> GeometryStore<'d, D> {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `geometry` and return its key
    pub fn insert(&mut self, geometry: GeometryBuffers<'d, D>) -> GeometryKey {
        self.entries.insert(Rc::new(geometry))
    }

    /// Upload and insert in one step
    pub fn upload<V: Pod>(&mut self, device: &'d D, vertices: &[V], indices: &[u32]) -> VulkanResult<GeometryKey> {
        Ok(self.insert(GeometryBuffers::new(device, vertices, indices)?))
    }

    /// Shared handle to the geometry under `key`
    pub fn get(&self, key: GeometryKey) -> Option<Rc<GeometryBuffers<'d, D>>> {
        self.entries.get(key).cloned()
    }

    /// Remove `key`; the buffers live on while other handles exist
    pub fn remove(&mut self, key: GeometryKey) -> Option<Rc<GeometryBuffers<'d, D>>> {
        self.entries.remove(key)
    }

    /// Whether `key` still names a stored geometry
    pub fn contains(&self, key: GeometryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored geometries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no geometry
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
