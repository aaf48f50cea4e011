//! wgpu implementation of [`ComputeApi`].
//!
//! Object mapping:
//! ```text
//! context  -> wgpu::Device (+ its queue, + 1-texel placeholder image)
//! queue    -> wgpu::Queue of the owning context
//! program  -> WGSL source, compiled to a wgpu::ShaderModule on build
//! kernel   -> compute pipeline + bind group layouts derived from the signature
//! buffer   -> storage buffer (STORAGE | COPY_SRC | COPY_DST)
//! image    -> 1D Rgba32Float texture
//! ```
//! Every call that can raise a wgpu validation or out-of-memory error runs
//! inside an error scope, so failures come back as [`ApiError`]s instead of
//! reaching the uncaptured-error handler.

use std::collections::HashMap;

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
    ApiError, ApiResult, ArgKind, ComputeApi, ContextId, KernelArg, KernelId, MemAccess, MemId,
    ProgramId, QueueId, ScalarBlock,
};
use crate::device::{Device, DeviceId, DeviceKind};
use crate::util::Texel;

/// Workgroup size (must match @workgroup_size in the kernel).
pub const WG_SIZE: u32 = 8;

struct ContextEntry {
    device: wgpu::Device,
    queue: wgpu::Queue,
    placeholder: wgpu::TextureView,
}

struct QueueEntry {
    context: u64,
}

struct ProgramEntry {
    context: u64,
    source: String,
    module: Option<wgpu::ShaderModule>,
    log: String,
}

struct KernelEntry {
    context: u64,
    pipeline: wgpu::ComputePipeline,
    memory_layout: wgpu::BindGroupLayout,
    scalar_layout: wgpu::BindGroupLayout,
    signature: Vec<ArgKind>,
    args: Vec<Option<KernelArg>>,
}

enum MemEntry {
    Buffer(wgpu::Buffer),
    Image {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
    },
}

/// Resource resolved for one memory binding of a dispatch.
enum Binding {
    Buffer(wgpu::Buffer),
    View(wgpu::TextureView),
}

#[derive(Default)]
struct Objects {
    next_id: u64,
    contexts: HashMap<u64, ContextEntry>,
    queues: HashMap<u64, QueueEntry>,
    programs: HashMap<u64, ProgramEntry>,
    kernels: HashMap<u64, KernelEntry>,
    mems: HashMap<u64, MemEntry>,
}

impl Objects {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn context(&self, id: u64) -> ApiResult<&ContextEntry> {
        self.contexts.get(&id).ok_or_else(|| ApiError::unknown_handle("context", id))
    }

    fn queue_context(&self, queue: QueueId) -> ApiResult<&ContextEntry> {
        let entry = self.queues.get(&queue.0).ok_or_else(|| ApiError::unknown_handle("queue", queue.0))?;
        self.context(entry.context)
    }

    fn buffer(&self, mem: MemId) -> ApiResult<wgpu::Buffer> {
        match self.mems.get(&mem.0) {
            Some(MemEntry::Buffer(buffer)) => Ok(buffer.clone()),
            Some(MemEntry::Image { .. }) => Err(ApiError::new(format!("mem {} is an image, not a buffer", mem.0))),
            None => Err(ApiError::unknown_handle("mem", mem.0)),
        }
    }
}

/// Compute API session over all wgpu adapters of one instance.
pub struct WgpuApi {
    adapters: Vec<wgpu::Adapter>,
    objects: Mutex<Objects>,
}

impl WgpuApi {
    /// Create a session and enumerate the adapters of every available backend.
    pub fn new() -> Self {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapters = instance.enumerate_adapters(wgpu::Backends::all());
        tracing::debug!(count = adapters.len(), "enumerated wgpu adapters");
        Self {
            adapters,
            objects: Mutex::new(Objects::default()),
        }
    }

    /// Devices a tracer can be bound to, one per adapter.
    pub fn devices(&self) -> Vec<Device> {
        self.adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                let info = adapter.get_info();
                let kind = match info.device_type {
                    wgpu::DeviceType::DiscreteGpu => DeviceKind::DiscreteGpu,
                    wgpu::DeviceType::IntegratedGpu => DeviceKind::IntegratedGpu,
                    wgpu::DeviceType::VirtualGpu => DeviceKind::VirtualGpu,
                    wgpu::DeviceType::Cpu => DeviceKind::Cpu,
                    wgpu::DeviceType::Other => DeviceKind::Other,
                };
                Device::new(DeviceId(index as u32), format!("{} ({:?})", info.name, info.backend), kind)
            })
            .collect()
    }

    fn adapter(&self, device: &Device) -> ApiResult<&wgpu::Adapter> {
        self.adapters
            .get(device.id.0 as usize)
            .ok_or_else(|| ApiError::new(format!("no adapter for {}", device.id)))
    }
}

impl Default for WgpuApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `f` inside validation and out-of-memory error scopes.
fn scoped<T>(device: &wgpu::Device, f: impl FnOnce() -> T) -> ApiResult<T> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    let value = f();
    let oom = pollster::block_on(device.pop_error_scope());
    let validation = pollster::block_on(device.pop_error_scope());
    match oom.or(validation) {
        Some(err) => Err(ApiError::new(err.to_string())),
        None => Ok(value),
    }
}

fn image_texture(device: &wgpu::Device, queue: &wgpu::Queue, label: &str, texels: &[Texel]) -> wgpu::Texture {
    device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: texels.len() as u32,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D1,
            format: wgpu::TextureFormat::Rgba32Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        bytemuck::cast_slice(texels),
    )
}

fn memory_layout_entry(binding: u32, kind: ArgKind) -> Option<wgpu::BindGroupLayoutEntry> {
    let ty = match kind {
        ArgKind::Buffer { writable } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: !writable },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        ArgKind::Image => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D1,
            multisampled: false,
        },
        _ => return None,
    };
    Some(wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty,
        count: None,
    })
}

impl ComputeApi for WgpuApi {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn create_context(&self, device: &Device) -> ApiResult<ContextId> {
        let adapter = self.adapter(device)?;
        let (wgpu_device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("pathtrace tracer"),
            required_limits: adapter.limits(),
            ..Default::default()
        }))
        .map_err(|e| ApiError::new(e.to_string()))?;

        let placeholder = image_texture(&wgpu_device, &queue, "pt_placeholder_image", &[[0.0; 4]])
            .create_view(&wgpu::TextureViewDescriptor::default());

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.contexts.insert(
            id,
            ContextEntry {
                device: wgpu_device,
                queue,
                placeholder,
            },
        );
        Ok(ContextId(id))
    }

    fn create_queue(&self, context: ContextId, _device: &Device) -> ApiResult<QueueId> {
        let mut objects = self.objects.lock();
        objects.context(context.0)?;
        let id = objects.next();
        objects.queues.insert(id, QueueEntry { context: context.0 });
        Ok(QueueId(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> ApiResult<ProgramId> {
        let mut objects = self.objects.lock();
        objects.context(context.0)?;
        let id = objects.next();
        objects.programs.insert(
            id,
            ProgramEntry {
                context: context.0,
                source: source.to_string(),
                module: None,
                log: String::new(),
            },
        );
        Ok(ProgramId(id))
    }

    fn build_program(&self, program: ProgramId, _device: &Device) -> ApiResult<()> {
        let (device, source) = {
            let objects = self.objects.lock();
            let entry = objects
                .programs
                .get(&program.0)
                .ok_or_else(|| ApiError::unknown_handle("program", program.0))?;
            (objects.context(entry.context)?.device.clone(), entry.source.clone())
        };

        let module = scoped(&device, || {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("pt_trace_kernel"),
                source: wgpu::ShaderSource::Wgsl(source.as_str().into()),
            })
        });

        let (module, mut log) = match module {
            Ok(module) => {
                let info = pollster::block_on(module.get_compilation_info());
                let log: Vec<String> = info
                    .messages
                    .iter()
                    .filter(|m| m.message_type == wgpu::CompilationMessageType::Error)
                    .map(|m| match &m.location {
                        Some(loc) => format!("{}:{}: {}", loc.line_number, loc.line_position, m.message),
                        None => m.message.clone(),
                    })
                    .collect();
                (log.is_empty().then_some(module), log)
            }
            Err(err) => (None, vec![err.to_string()]),
        };
        if module.is_none() && log.is_empty() {
            log.push("shader module creation failed".to_string());
        }

        let mut objects = self.objects.lock();
        let entry = objects
            .programs
            .get_mut(&program.0)
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))?;
        entry.log = log.join("\n");
        entry.module = module;
        match entry.module {
            Some(_) => Ok(()),
            None => Err(ApiError::new("WGSL compilation failed")),
        }
    }

    fn build_log(&self, program: ProgramId) -> ApiResult<String> {
        let objects = self.objects.lock();
        objects
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))
    }

    fn create_kernel(&self, program: ProgramId, entry_point: &str, signature: &[ArgKind]) -> ApiResult<KernelId> {
        let (context, device, module) = {
            let objects = self.objects.lock();
            let entry = objects
                .programs
                .get(&program.0)
                .ok_or_else(|| ApiError::unknown_handle("program", program.0))?;
            let module = entry
                .module
                .clone()
                .ok_or_else(|| ApiError::new("program is not built"))?;
            (entry.context, objects.context(entry.context)?.device.clone(), module)
        };

        let memory_entries: Vec<_> = signature
            .iter()
            .enumerate()
            .filter_map(|(i, kind)| memory_layout_entry(i as u32, *kind))
            .collect();

        let (pipeline, memory_layout, scalar_layout) = scoped(&device, || {
            let memory_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("pt_memory_bgl"),
                entries: &memory_entries,
            });
            let scalar_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("pt_scalar_bgl"),
                entries: &[wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }],
            });
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("pt_pipeline_layout"),
                bind_group_layouts: &[&memory_layout, &scalar_layout],
                push_constant_ranges: &[],
            });
            let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("pt_compute_pipeline"),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
            (pipeline, memory_layout, scalar_layout)
        })?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.kernels.insert(
            id,
            KernelEntry {
                context,
                pipeline,
                memory_layout,
                scalar_layout,
                signature: signature.to_vec(),
                args: vec![None; signature.len()],
            },
        );
        Ok(KernelId(id))
    }

    fn create_buffer(&self, context: ContextId, access: MemAccess, size: u64) -> ApiResult<MemId> {
        let device = self.objects.lock().context(context.0)?.device.clone();
        let label = if access.device_writable() { "pt_output" } else { "pt_input" };
        let buffer = scoped(&device, || {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.mems.insert(id, MemEntry::Buffer(buffer));
        Ok(MemId(id))
    }

    fn create_image_1d(&self, context: ContextId, texels: &[Texel]) -> ApiResult<MemId> {
        if texels.is_empty() {
            return Err(ApiError::new("zero-width image"));
        }
        let (device, queue) = {
            let objects = self.objects.lock();
            let ctx = objects.context(context.0)?;
            (ctx.device.clone(), ctx.queue.clone())
        };
        let texture = scoped(&device, || image_texture(&device, &queue, "pt_packed_image", texels))?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let mut objects = self.objects.lock();
        let id = objects.next();
        objects.mems.insert(id, MemEntry::Image { texture, view });
        Ok(MemId(id))
    }

    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> ApiResult<()> {
        let (device, wgpu_queue, buffer) = {
            let objects = self.objects.lock();
            let ctx = objects.queue_context(queue)?;
            (ctx.device.clone(), ctx.queue.clone(), objects.buffer(mem)?)
        };
        if offset + data.len() as u64 > buffer.size() {
            return Err(ApiError::new("write past buffer end"));
        }
        scoped(&device, || wgpu_queue.write_buffer(&buffer, offset, data))?;
        wgpu_queue.submit(std::iter::empty());
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> ApiResult<()> {
        let mut objects = self.objects.lock();
        if let Some(mem) = arg.as_mem() {
            if !objects.mems.contains_key(&mem.0) {
                return Err(ApiError::unknown_handle("mem", mem.0));
            }
        }
        let entry = objects
            .kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| ApiError::unknown_handle("kernel", kernel.0))?;
        let kind = entry
            .signature
            .get(index as usize)
            .copied()
            .ok_or_else(|| ApiError::new(format!("kernel has no argument {index}")))?;
        if !arg.matches(kind) {
            return Err(ApiError::new(format!("{arg:?} does not fit argument {index} ({kind:?})")));
        }
        entry.args[index as usize] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, origin: [u32; 2], size: [u32; 2]) -> ApiResult<()> {
        let objects = self.objects.lock();
        let ctx = objects.queue_context(queue)?;
        let entry = objects
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| ApiError::unknown_handle("kernel", kernel.0))?;
        if entry.context != objects.queues[&queue.0].context {
            return Err(ApiError::new("kernel and queue belong to different contexts"));
        }
        let args: Vec<KernelArg> = entry
            .args
            .iter()
            .enumerate()
            .map(|(i, a)| a.ok_or_else(|| ApiError::new(format!("kernel argument {i} is not set"))))
            .collect::<ApiResult<_>>()?;
        let scalars = ScalarBlock::pack(&entry.signature, &args, origin, size)?;

        // resolve memory bindings while the object table is locked
        let mut resources: Vec<(u32, Binding)> = Vec::new();
        for (i, kind) in entry.signature.iter().enumerate() {
            if !kind.is_memory() {
                continue;
            }
            let binding = match args[i].as_mem() {
                Some(id) => match objects.mems.get(&id.0) {
                    Some(MemEntry::Buffer(buffer)) => Binding::Buffer(buffer.clone()),
                    Some(MemEntry::Image { view, .. }) => Binding::View(view.clone()),
                    None => return Err(ApiError::unknown_handle("mem", id.0)),
                },
                None => Binding::View(ctx.placeholder.clone()),
            };
            resources.push((i as u32, binding));
        }
        let device = ctx.device.clone();
        let wgpu_queue = ctx.queue.clone();
        let pipeline = entry.pipeline.clone();
        let memory_layout = entry.memory_layout.clone();
        let scalar_layout = entry.scalar_layout.clone();
        drop(objects);

        scoped(&device, || {
            let scalar_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("pt_scalars"),
                contents: scalars.as_bytes(),
                usage: wgpu::BufferUsages::UNIFORM,
            });
            let memory_entries: Vec<wgpu::BindGroupEntry<'_>> = resources
                .iter()
                .map(|(binding, mem)| wgpu::BindGroupEntry {
                    binding: *binding,
                    resource: match mem {
                        Binding::Buffer(buffer) => buffer.as_entire_binding(),
                        Binding::View(view) => wgpu::BindingResource::TextureView(view),
                    },
                })
                .collect();
            let memory_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pt_memory_bg"),
                layout: &memory_layout,
                entries: &memory_entries,
            });
            let scalar_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("pt_scalar_bg"),
                layout: &scalar_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: scalar_buffer.as_entire_binding(),
                }],
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pt_dispatch"),
            });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("pt_compute_pass"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&pipeline);
                pass.set_bind_group(0, &memory_group, &[]);
                pass.set_bind_group(1, &scalar_group, &[]);
                pass.dispatch_workgroups(size[0].div_ceil(WG_SIZE), size[1].div_ceil(WG_SIZE), 1);
            }
            wgpu_queue.submit(Some(encoder.finish()));
        })
    }

    fn finish(&self, queue: QueueId) -> ApiResult<()> {
        let device = self.objects.lock().queue_context(queue)?.device.clone();
        device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| ApiError::new(e.to_string()))
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> ApiResult<()> {
        let (device, wgpu_queue, buffer) = {
            let objects = self.objects.lock();
            let ctx = objects.queue_context(queue)?;
            (ctx.device.clone(), ctx.queue.clone(), objects.buffer(mem)?)
        };
        let size = out.len() as u64;
        if offset + size > buffer.size() {
            return Err(ApiError::new("read past buffer end"));
        }

        let staging = scoped(&device, || {
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("pt_readback"),
                size,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("pt_readback"),
            });
            encoder.copy_buffer_to_buffer(&buffer, offset, &staging, 0, size);
            wgpu_queue.submit(Some(encoder.finish()));
            staging
        })?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        staging.slice(..).map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| ApiError::new(e.to_string()))?;
        rx.recv()
            .map_err(|_| ApiError::new("readback callback dropped"))?
            .map_err(|e| ApiError::new(e.to_string()))?;

        out.copy_from_slice(&staging.slice(..).get_mapped_range());
        staging.unmap();
        staging.destroy();
        Ok(())
    }

    fn release_mem(&self, mem: MemId) -> ApiResult<()> {
        match self.objects.lock().mems.remove(&mem.0) {
            Some(MemEntry::Buffer(buffer)) => buffer.destroy(),
            Some(MemEntry::Image { texture, .. }) => texture.destroy(),
            None => return Err(ApiError::unknown_handle("mem", mem.0)),
        }
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelId) -> ApiResult<()> {
        self.objects
            .lock()
            .kernels
            .remove(&kernel.0)
            .map(drop)
            .ok_or_else(|| ApiError::unknown_handle("kernel", kernel.0))
    }

    fn release_program(&self, program: ProgramId) -> ApiResult<()> {
        self.objects
            .lock()
            .programs
            .remove(&program.0)
            .map(drop)
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))
    }

    fn release_queue(&self, queue: QueueId) -> ApiResult<()> {
        self.objects
            .lock()
            .queues
            .remove(&queue.0)
            .map(drop)
            .ok_or_else(|| ApiError::unknown_handle("queue", queue.0))
    }

    fn release_context(&self, context: ContextId) -> ApiResult<()> {
        let entry = self
            .objects
            .lock()
            .contexts
            .remove(&context.0)
            .ok_or_else(|| ApiError::unknown_handle("context", context.0))?;
        entry.device.destroy();
        Ok(())
    }
}
