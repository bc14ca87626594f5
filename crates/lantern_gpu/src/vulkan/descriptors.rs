//! Descriptor set layouts, pools and writers

use std::collections::{BTreeMap, HashMap, HashSet};

use ash::vk;

use super::{Device, GpuDevice, VulkanError, VulkanResult};

/// Default number of sets a pool may hold
pub const DEFAULT_MAX_SETS: u32 = 1000;

/// Builder that collects bindings for a [`DescriptorSetLayout`]
#[derive(Debug, Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding>,
}

impl DescriptorSetLayoutBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding slot
    ///
    /// A slot that is already registered is rejected and the first
    /// registration is kept.
    pub fn add_binding(
        &mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
        count: u32,
    ) -> VulkanResult<&mut Self> {
        if self.bindings.contains_key(&binding) {
            return Err(VulkanError::DuplicateBinding(binding));
        }
        if count == 0 {
            return Err(VulkanError::invalid(format!(
                "Binding {} must declare at least one descriptor",
                binding
            )));
        }

        let layout_binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(descriptor_type)
            .descriptor_count(count)
            .stage_flags(stage_flags)
            .build();
        self.bindings.insert(binding, layout_binding);
        Ok(self)
    }

    /// Register a single uniform buffer
    pub fn add_uniform_buffer(
        &mut self,
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> VulkanResult<&mut Self> {
        self.add_binding(binding, vk::DescriptorType::UNIFORM_BUFFER, stage_flags, 1)
    }

    /// Register a single combined image sampler
    pub fn add_combined_image_sampler(
        &mut self,
        binding: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> VulkanResult<&mut Self> {
        self.add_binding(binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stage_flags, 1)
    }

    /// Create the layout object
    pub fn build<'d, D: GpuDevice + ?Sized>(&self, device: &'d D) -> VulkanResult<DescriptorSetLayout<'d, D>> {
        let bindings: Vec<_> = self.bindings.values().copied().collect();
        let layout = device.create_descriptor_set_layout(&bindings)?;

        Ok(DescriptorSetLayout {
            device,
            layout,
            bindings: self.bindings.clone(),
        })
    }
}

/// Descriptor set layout with RAII cleanup
pub struct DescriptorSetLayout<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    layout: vk::DescriptorSetLayout,
    bindings: BTreeMap<u32, vk::DescriptorSetLayoutBinding>,
}

impl<D: GpuDevice + ?Sized> DescriptorSetLayout<'_, D> {
    /// Layout handle
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Declaration of `binding`, if registered
    pub fn binding(&self, binding: u32) -> Option<&vk::DescriptorSetLayoutBinding> {
        self.bindings.get(&binding)
    }

    /// Number of registered bindings
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Descriptors one set of this layout consumes, per type
    pub fn demand(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut totals: BTreeMap<vk::DescriptorType, u32> = BTreeMap::new();
        for binding in self.bindings.values() {
            *totals.entry(binding.descriptor_type).or_default() += binding.descriptor_count;
        }
        totals
            .into_iter()
            .map(|(ty, descriptor_count)| vk::DescriptorPoolSize { ty, descriptor_count })
            .collect()
    }
}

impl<D: GpuDevice + ?Sized> Drop for DescriptorSetLayout<'_, D> {
    fn drop(&mut self) {
        self.device.destroy_descriptor_set_layout(self.layout);
    }
}

/// Host-side accounting of what a pool can still hand out
#[derive(Debug, Clone, Default)]
pub struct PoolBudget {
    max_sets: u32,
    capacity: HashMap<vk::DescriptorType, u32>,
    live_sets: u32,
    used: HashMap<vk::DescriptorType, u32>,
}

impl PoolBudget {
    /// Budget for `max_sets` sets drawing from `pool_sizes`
    pub fn new(max_sets: u32, pool_sizes: &[vk::DescriptorPoolSize]) -> Self {
        let mut capacity = HashMap::new();
        for size in pool_sizes {
            *capacity.entry(size.ty).or_default() += size.descriptor_count;
        }
        Self {
            max_sets,
            capacity,
            live_sets: 0,
            used: HashMap::new(),
        }
    }

    /// Claim one set's worth of descriptors, or fail without claiming anything
    pub fn reserve(&mut self, demand: &[vk::DescriptorPoolSize]) -> VulkanResult<()> {
        if self.live_sets >= self.max_sets {
            return Err(VulkanError::PoolExhausted {
                reason: format!("all {} sets are allocated", self.max_sets),
            });
        }
        for size in demand {
            let available = self.remaining(size.ty);
            if size.descriptor_count > available {
                return Err(VulkanError::PoolExhausted {
                    reason: format!(
                        "{:?} needs {} descriptors, {} remain",
                        size.ty, size.descriptor_count, available
                    ),
                });
            }
        }

        self.live_sets += 1;
        for size in demand {
            *self.used.entry(size.ty).or_default() += size.descriptor_count;
        }
        Ok(())
    }

    /// Give back one set's worth of descriptors
    pub fn release(&mut self, demand: &[vk::DescriptorPoolSize]) {
        self.live_sets = self.live_sets.saturating_sub(1);
        for size in demand {
            if let Some(used) = self.used.get_mut(&size.ty) {
                *used = used.saturating_sub(size.descriptor_count);
            }
        }
    }

    /// Forget every outstanding set
    pub fn reset(&mut self) {
        self.live_sets = 0;
        self.used.clear();
    }

    /// Descriptors of `ty` still available
    pub fn remaining(&self, ty: vk::DescriptorType) -> u32 {
        let capacity = self.capacity.get(&ty).copied().unwrap_or(0);
        let used = self.used.get(&ty).copied().unwrap_or(0);
        capacity.saturating_sub(used)
    }

    /// Sets currently allocated
    pub fn live_sets(&self) -> u32 {
        self.live_sets
    }
}

/// Builder for [`DescriptorPool`]
#[derive(Debug, Clone)]
pub struct DescriptorPoolBuilder {
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    max_sets: u32,
    flags: vk::DescriptorPoolCreateFlags,
}

impl Default for DescriptorPoolBuilder {
    fn default() -> Self {
        Self {
            pool_sizes: Vec::new(),
            max_sets: DEFAULT_MAX_SETS,
            flags: vk::DescriptorPoolCreateFlags::empty(),
        }
    }
}

impl DescriptorPoolBuilder {
    /// Create a builder with the default set limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Add capacity for `count` descriptors of `ty`
    pub fn add_pool_size(&mut self, ty: vk::DescriptorType, count: u32) -> &mut Self {
        self.pool_sizes.push(vk::DescriptorPoolSize { ty, descriptor_count: count });
        self
    }

    /// Set pool creation flags
    pub fn set_pool_flags(&mut self, flags: vk::DescriptorPoolCreateFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Set the maximum number of sets
    pub fn set_max_sets(&mut self, max_sets: u32) -> &mut Self {
        self.max_sets = max_sets;
        self
    }

    /// Create the pool
    pub fn build<'d, D: GpuDevice + ?Sized>(&self, device: &'d D) -> VulkanResult<DescriptorPool<'d, D>> {
        let pool = device.create_descriptor_pool(self.max_sets, self.flags, &self.pool_sizes)?;
        log::debug!(
            "Created descriptor pool: {} sets, sizes {:?}",
            self.max_sets,
            self.pool_sizes
        );

        Ok(DescriptorPool {
            device,
            pool,
            flags: self.flags,
            budget: PoolBudget::new(self.max_sets, &self.pool_sizes),
            allocations: HashMap::new(),
        })
    }
}

/// Descriptor pool with RAII cleanup
pub struct DescriptorPool<'d, D: GpuDevice + ?Sized = Device> {
    device: &'d D,
    pool: vk::DescriptorPool,
    flags: vk::DescriptorPoolCreateFlags,
    budget: PoolBudget,
    allocations: HashMap<vk::DescriptorSet, Vec<vk::DescriptorPoolSize>>,
}

impl<'d, D: GpuDevice + ?Sized> DescriptorPool<'d, D> {
    /// Allocate one set of `layout`
    pub fn allocate_descriptor(&mut self, layout: &DescriptorSetLayout<'d, D>) -> VulkanResult<vk::DescriptorSet> {
        let demand = layout.demand();
        self.budget.reserve(&demand)?;

        match self.device.allocate_descriptor_set(self.pool, layout.handle()) {
            Ok(set) => {
                self.allocations.insert(set, demand);
                Ok(set)
            }
            Err(err) => {
                self.budget.release(&demand);
                match err {
                    VulkanError::Api(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
                    | VulkanError::Api(vk::Result::ERROR_FRAGMENTED_POOL) => Err(VulkanError::PoolExhausted {
                        reason: "driver reported out of pool memory".to_string(),
                    }),
                    other => Err(other),
                }
            }
        }
    }

    /// Return individual sets; requires `FREE_DESCRIPTOR_SET`
    pub fn free_descriptors(&mut self, sets: &[vk::DescriptorSet]) -> VulkanResult<()> {
        if !self.flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            return Err(VulkanError::invalid(
                "Pool was not created with FREE_DESCRIPTOR_SET",
            ));
        }
        if let Some(unknown) = sets.iter().find(|set| !self.allocations.contains_key(set)) {
            return Err(VulkanError::invalid(format!(
                "Descriptor set {:?} was not allocated from this pool",
                unknown
            )));
        }
        let mut seen = HashSet::with_capacity(sets.len());
        if let Some(repeated) = sets.iter().find(|set| !seen.insert(**set)) {
            return Err(VulkanError::invalid(format!(
                "Descriptor set {:?} appears more than once in one free",
                repeated
            )));
        }

        self.device.free_descriptor_sets(self.pool, sets)?;
        for set in sets {
            if let Some(demand) = self.allocations.remove(set) {
                self.budget.release(&demand);
            }
        }
        Ok(())
    }

    /// Return every set at once
    pub fn reset_pool(&mut self) -> VulkanResult<()> {
        self.device.reset_descriptor_pool(self.pool)?;
        self.allocations.clear();
        self.budget.reset();
        Ok(())
    }

    /// Pool handle
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Remaining capacity
    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }
}

impl<D: GpuDevice + ?Sized> Drop for DescriptorPool<'_, D> {
    fn drop(&mut self) {
        self.device.destroy_descriptor_pool(self.pool);
    }
}

/// Resource a single descriptor points at
#[derive(Debug, Clone, Copy)]
pub enum DescriptorResource {
    /// Range of a buffer
    Buffer(vk::DescriptorBufferInfo),
    /// Image view with sampler and layout
    Image(vk::DescriptorImageInfo),
}

/// One pending descriptor write
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite {
    /// Target binding slot
    pub binding: u32,
    /// Type declared by the layout for that slot
    pub descriptor_type: vk::DescriptorType,
    /// Resource to bind
    pub resource: DescriptorResource,
}

fn is_buffer_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::UNIFORM_BUFFER
            | vk::DescriptorType::STORAGE_BUFFER
            | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
    )
}

fn is_image_descriptor(ty: vk::DescriptorType) -> bool {
    matches!(
        ty,
        vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT
    )
}

/// Accumulates writes validated against one layout
pub struct DescriptorWriter<'a, 'd, D: GpuDevice + ?Sized = Device> {
    layout: &'a DescriptorSetLayout<'d, D>,
    writes: Vec<DescriptorWrite>,
}

impl<'a, 'd, D: GpuDevice + ?Sized> DescriptorWriter<'a, 'd, D> {
    /// Start an empty write list for `layout`
    pub fn new(layout: &'a DescriptorSetLayout<'d, D>) -> Self {
        Self { layout, writes: Vec::new() }
    }

    /// Bind a buffer range to a single-descriptor buffer binding
    pub fn write_buffer(&mut self, binding: u32, info: vk::DescriptorBufferInfo) -> VulkanResult<&mut Self> {
        let descriptor_type = self.single_binding(binding)?;
        if !is_buffer_descriptor(descriptor_type) {
            return Err(VulkanError::invalid(format!(
                "Binding {} is {:?}, not a buffer descriptor",
                binding, descriptor_type
            )));
        }
        self.writes.push(DescriptorWrite {
            binding,
            descriptor_type,
            resource: DescriptorResource::Buffer(info),
        });
        Ok(self)
    }

    /// Bind an image to a single-descriptor image binding
    pub fn write_image(&mut self, binding: u32, info: vk::DescriptorImageInfo) -> VulkanResult<&mut Self> {
        let descriptor_type = self.single_binding(binding)?;
        if !is_image_descriptor(descriptor_type) {
            return Err(VulkanError::invalid(format!(
                "Binding {} is {:?}, not an image descriptor",
                binding, descriptor_type
            )));
        }
        self.writes.push(DescriptorWrite {
            binding,
            descriptor_type,
            resource: DescriptorResource::Image(info),
        });
        Ok(self)
    }

    /// Allocate a set from `pool` and apply the pending writes to it
    ///
    /// Nothing is allocated when the pool cannot satisfy the layout.
    pub fn build(&self, pool: &mut DescriptorPool<'d, D>) -> VulkanResult<vk::DescriptorSet> {
        let set = pool.allocate_descriptor(self.layout)?;
        self.overwrite(set);
        Ok(set)
    }

    /// Apply the pending writes to an existing set in one batched update
    pub fn overwrite(&self, set: vk::DescriptorSet) {
        self.layout.device.update_descriptor_set(set, &self.writes);
    }

    /// Pending writes in insertion order
    pub fn writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    fn single_binding(&self, binding: u32) -> VulkanResult<vk::DescriptorType> {
        let declared = self
            .layout
            .binding(binding)
            .ok_or(VulkanError::UnknownBinding(binding))?;
        if declared.descriptor_count != 1 {
            return Err(VulkanError::ArrayBinding {
                binding,
                count: declared.descriptor_count,
            });
        }
        Ok(declared.descriptor_type)
    }
}
