//! Compute API session abstraction.
//!
//! [`ComputeApi`] is a small explicit-handle compute API: every object is
//! created through the session and must be released through it again.
//! Nothing is freed implicitly, so callers decide the teardown order.
//!
//! ## Backends
//! - [`wgpu::WgpuApi`] - wgpu devices, WGSL kernels (feature `wgpu`)
//! - [`mock::MockApi`] - in-memory software device with fault injection
//!
//! ## Kernel arguments
//! Kernels declare their parameters up front as a list of [`ArgKind`]s.
//! Memory arguments bind at `@group(0) @binding(index)`; scalar arguments are
//! packed in index order into one uniform block at `@group(1) @binding(0)`
//! using WGSL uniform alignment, followed by the dispatch origin and size
//! (see [`ScalarBlock`]).

pub mod mock;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use thiserror::Error;

use crate::device::Device;
use crate::util::Texel;

/// Error reported by a compute backend.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ApiError {
    message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// Error for a handle the session does not know.
    pub fn unknown_handle(what: &str, id: u64) -> Self {
        Self::new(format!("unknown {what} handle {id}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

handle!(
    /// Compute context bound to one device.
    ContextId
);
handle!(
    /// In-order command queue.
    QueueId
);
handle!(
    /// Program built from kernel source.
    ProgramId
);
handle!(
    /// Kernel entry point with its argument table.
    KernelId
);
handle!(
    /// Buffer or image memory object.
    MemId
);

/// Device-side access of a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    pub fn device_writable(self) -> bool {
        !matches!(self, MemAccess::ReadOnly)
    }
}

/// Declared type of one kernel parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Buffer { writable: bool },
    /// Read-only 1D RGBA f32 image; may be bound as absent
    Image,
    I32,
    U32,
    F32,
    Vec4,
}

impl ArgKind {
    pub fn is_memory(self) -> bool {
        matches!(self, ArgKind::Buffer { .. } | ArgKind::Image)
    }

    /// (size, alignment) inside the scalar uniform block.
    fn uniform_layout(self) -> Option<(usize, usize)> {
        match self {
            ArgKind::I32 | ArgKind::U32 | ArgKind::F32 => Some((4, 4)),
            ArgKind::Vec4 => Some((16, 16)),
            ArgKind::Buffer { .. } | ArgKind::Image => None,
        }
    }
}

/// Value bound to a kernel parameter.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum KernelArg {
    /// Memory object; `None` binds nothing (only valid for images)
    Mem(Option<MemId>),
    I32(i32),
    U32(u32),
    F32(f32),
    Vec4([f32; 4]),
}

impl KernelArg {
    /// Whether this value may be bound to a parameter of `kind`.
    pub fn matches(&self, kind: ArgKind) -> bool {
        match (self, kind) {
            (KernelArg::Mem(Some(_)), ArgKind::Buffer { .. } | ArgKind::Image) => true,
            (KernelArg::Mem(None), ArgKind::Image) => true,
            (KernelArg::I32(_), ArgKind::I32)
            | (KernelArg::U32(_), ArgKind::U32)
            | (KernelArg::F32(_), ArgKind::F32)
            | (KernelArg::Vec4(_), ArgKind::Vec4) => true,
            _ => false,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            KernelArg::U32(v) => Some(v),
            KernelArg::I32(v) => u32::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_mem(&self) -> Option<MemId> {
        match *self {
            KernelArg::Mem(mem) => mem,
            _ => None,
        }
    }
}

/// Scalar kernel arguments packed for a uniform binding.
///
/// Scalars are laid out in parameter order with WGSL uniform alignment
/// (4 bytes for 32-bit scalars, 16 for `vec4`). The dispatch origin and size
/// follow as two `vec2<u32>`, and the block is padded to 16 bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarBlock {
    bytes: Vec<u8>,
}

impl ScalarBlock {
    pub fn pack(
        signature: &[ArgKind],
        args: &[KernelArg],
        origin: [u32; 2],
        size: [u32; 2],
    ) -> ApiResult<Self> {
        let mut bytes = Vec::with_capacity(64);
        for (index, kind) in signature.iter().enumerate() {
            let Some((_, align)) = kind.uniform_layout() else { continue };
            pad_to(&mut bytes, align);
            match args.get(index) {
                Some(KernelArg::I32(v)) => bytes.extend_from_slice(&v.to_ne_bytes()),
                Some(KernelArg::U32(v)) => bytes.extend_from_slice(&v.to_ne_bytes()),
                Some(KernelArg::F32(v)) => bytes.extend_from_slice(&v.to_ne_bytes()),
                Some(KernelArg::Vec4(v)) => bytes.extend_from_slice(bytemuck::cast_slice(v)),
                _ => return Err(ApiError::new(format!("scalar argument {index} is not set"))),
            }
        }
        pad_to(&mut bytes, 8);
        for v in origin.into_iter().chain(size) {
            bytes.extend_from_slice(&v.to_ne_bytes());
        }
        pad_to(&mut bytes, 16);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn pad_to(bytes: &mut Vec<u8>, align: usize) {
    let len = bytes.len().next_multiple_of(align);
    bytes.resize(len, 0);
}

/// Explicit-handle compute API session.
///
/// Implementations must be usable from several threads, but callers are
/// expected to serialize calls that touch the same queue.
pub trait ComputeApi: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    fn create_context(&self, device: &Device) -> ApiResult<ContextId>;
    fn create_queue(&self, context: ContextId, device: &Device) -> ApiResult<QueueId>;

    /// Create a program object from source text without compiling it.
    fn create_program(&self, context: ContextId, source: &str) -> ApiResult<ProgramId>;
    fn build_program(&self, program: ProgramId, device: &Device) -> ApiResult<()>;
    /// Diagnostics of the last build of `program`.
    fn build_log(&self, program: ProgramId) -> ApiResult<String>;
    fn create_kernel(&self, program: ProgramId, entry_point: &str, signature: &[ArgKind]) -> ApiResult<KernelId>;

    fn create_buffer(&self, context: ContextId, access: MemAccess, size: u64) -> ApiResult<MemId>;
    /// Create a read-only 1D image, one texel per pixel, initialized from `texels`.
    fn create_image_1d(&self, context: ContextId, texels: &[Texel]) -> ApiResult<MemId>;

    /// Blocking host to device write.
    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> ApiResult<()>;
    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> ApiResult<()>;
    /// Enqueue a 2D dispatch over `size` work items starting at `origin`.
    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, origin: [u32; 2], size: [u32; 2]) -> ApiResult<()>;
    /// Block until every command on `queue` has completed.
    fn finish(&self, queue: QueueId) -> ApiResult<()>;
    /// Blocking device to host read of `out.len()` bytes at `offset`.
    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> ApiResult<()>;

    fn release_mem(&self, mem: MemId) -> ApiResult<()>;
    fn release_kernel(&self, kernel: KernelId) -> ApiResult<()>;
    fn release_program(&self, program: ProgramId) -> ApiResult<()>;
    fn release_queue(&self, queue: QueueId) -> ApiResult<()>;
    fn release_context(&self, context: ContextId) -> ApiResult<()>;
}
