//! In-memory software compute device.
//!
//! [`MockApi`] implements [`ComputeApi`] without any GPU. It keeps every
//! object in host memory, records creation and release events, and runs
//! dispatched kernels through a host-side pixel function when the queue is
//! finished. Faults can be injected per call site and `finish` can be paused
//! to simulate a busy device.
//!
//! ## Usage
//! ```ignore
//! let api = Arc::new(MockApi::new());
//! api.fail(FailPoint::BuildProgram);
//! let gate = api.pause_finish();
//! // ... drive a tracer ...
//! assert_eq!(api.live_objects(), 0);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{
    ApiError, ApiResult, ArgKind, ComputeApi, ContextId, KernelArg, KernelId, MemAccess, MemId,
    ProgramId, QueueId,
};
use crate::device::Device;
use crate::util::{Texel, TEXEL_BYTES};

/// Call sites where a failure can be injected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    CreateContext,
    CreateQueue,
    CreateProgram,
    BuildProgram,
    CreateKernel,
    CreateBuffer,
    CreateImage,
    WriteBuffer,
    SetKernelArg(u32),
    EnqueueKernel,
    Finish,
    ReadBuffer,
    Release(ObjectKind),
}

/// Kind of device object, for event bookkeeping.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Context,
    Queue,
    Program,
    Kernel,
    Buffer,
    Image,
}

/// Object lifecycle event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Created(ObjectKind),
    Released(ObjectKind),
    ReleaseFailed(ObjectKind),
}

/// Everything the pixel function sees for one work item.
pub struct Invocation<'a> {
    pub x: u32,
    pub y: u32,
    pub args: &'a [Option<KernelArg>],
}

impl Invocation<'_> {
    pub fn u32_arg(&self, index: usize) -> Option<u32> {
        self.args.get(index).copied().flatten().and_then(|a| a.as_u32())
    }
}

/// Host-side kernel body: computes the output texel of one work item.
pub type PixelFn = Arc<dyn Fn(&Invocation<'_>) -> Texel + Send + Sync>;

/// Default pixel function: `[x, y, arg 9, arg 7]`.
///
/// With the tracer ABI that is `[x, y, seed, samples_per_pixel]`, which lets
/// tests check both placement and parameter binding of every pixel.
pub fn coordinate_pixel() -> PixelFn {
    Arc::new(|inv: &Invocation<'_>| {
        [
            inv.x as f32,
            inv.y as f32,
            inv.u32_arg(9).unwrap_or(0) as f32,
            inv.u32_arg(7).unwrap_or(0) as f32,
        ]
    })
}

/// Handle returned by [`MockApi::pause_finish`].
///
/// While the gate is alive every `finish` call blocks until [`release`](Self::release)
/// is called once for it. Dropping the gate lets all waiting and future calls through.
pub struct FinishGate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl FinishGate {
    /// Wait until some thread is blocked inside `finish`.
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    /// Let one blocked `finish` call proceed.
    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

struct ProgramEntry {
    source: String,
    log: String,
    built: bool,
}

struct KernelEntry {
    signature: Vec<ArgKind>,
    args: Vec<Option<KernelArg>>,
}

struct MemEntry {
    kind: ObjectKind,
    access: MemAccess,
    data: Vec<u8>,
}

struct Dispatch {
    args: Vec<Option<KernelArg>>,
    origin: [u32; 2],
    size: [u32; 2],
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    contexts: HashSet<u64>,
    queues: HashMap<u64, Vec<Dispatch>>,
    programs: HashMap<u64, ProgramEntry>,
    kernels: HashMap<u64, KernelEntry>,
    mems: HashMap<u64, MemEntry>,
    faults: HashSet<FailPoint>,
    events: Vec<Event>,
    dispatches: usize,
    gate: Option<(Sender<()>, Receiver<()>)>,
}

impl MockState {
    fn next(&mut self, kind: ObjectKind) -> u64 {
        self.next_id += 1;
        self.events.push(Event::Created(kind));
        self.next_id
    }

    fn check(&self, point: FailPoint) -> ApiResult<()> {
        if self.faults.contains(&point) {
            return Err(ApiError::new(format!("mock: injected failure at {point:?}")));
        }
        Ok(())
    }

    fn release(&mut self, kind: ObjectKind, id: u64) -> ApiResult<()> {
        if let Err(err) = self.check(FailPoint::Release(kind)) {
            self.events.push(Event::ReleaseFailed(kind));
            return Err(err);
        }
        let removed = match kind {
            ObjectKind::Context => self.contexts.remove(&id),
            ObjectKind::Queue => self.queues.remove(&id).is_some(),
            ObjectKind::Program => self.programs.remove(&id).is_some(),
            ObjectKind::Kernel => self.kernels.remove(&id).is_some(),
            ObjectKind::Buffer | ObjectKind::Image => self.mems.remove(&id).is_some(),
        };
        if !removed {
            return Err(ApiError::unknown_handle(&format!("{kind:?}").to_lowercase(), id));
        }
        self.events.push(Event::Released(kind));
        Ok(())
    }

    fn mem(&self, id: MemId) -> ApiResult<&MemEntry> {
        self.mems.get(&id.0).ok_or_else(|| ApiError::unknown_handle("mem", id.0))
    }

    fn run(&mut self, dispatch: Dispatch, pixel: &PixelFn) -> ApiResult<()> {
        let output = dispatch
            .args
            .first()
            .copied()
            .flatten()
            .and_then(|a| a.as_mem())
            .ok_or_else(|| ApiError::new("mock: argument 0 is not an output buffer"))?;
        let [width, height] = dispatch.size;
        let [ox, oy] = dispatch.origin;

        let entry = self
            .mems
            .get_mut(&output.0)
            .ok_or_else(|| ApiError::unknown_handle("mem", output.0))?;
        if !entry.access.device_writable() {
            return Err(ApiError::new("mock: output buffer is read-only"));
        }
        let end = (oy as usize + height as usize) * width as usize * TEXEL_BYTES;
        if end > entry.data.len() {
            return Err(ApiError::new(format!(
                "mock: dispatch writes {end} bytes into a {} byte buffer",
                entry.data.len()
            )));
        }

        // rows are `width` texels wide: dispatches always span full frame rows
        for y in oy..oy + height {
            for x in ox..ox + width {
                let inv = Invocation { x, y, args: &dispatch.args };
                let at = (y as usize * width as usize + x as usize) * TEXEL_BYTES;
                entry.data[at..at + TEXEL_BYTES].copy_from_slice(bytemuck::bytes_of(&pixel(&inv)));
            }
        }
        self.dispatches += 1;
        Ok(())
    }
}

/// Software compute device for tests and host-only runs.
pub struct MockApi {
    state: Mutex<MockState>,
    pixel: PixelFn,
}

impl MockApi {
    pub fn new() -> Self {
        Self::with_pixel_fn(coordinate_pixel())
    }

    /// Use a custom host-side kernel body.
    pub fn with_pixel_fn(pixel: PixelFn) -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            pixel,
        }
    }

    /// Make every subsequent call at `point` fail.
    pub fn fail(&self, point: FailPoint) {
        self.state.lock().faults.insert(point);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Block `finish` until the returned gate releases it.
    pub fn pause_finish(&self) -> FinishGate {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        self.state.lock().gate = Some((entered_tx, release_rx));
        FinishGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Number of objects created and not yet released.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.contexts.len() + state.queues.len() + state.programs.len() + state.kernels.len() + state.mems.len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Number of objects of `kind` ever created.
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.state.lock().events.iter().filter(|e| **e == Event::Created(kind)).count()
    }

    /// Number of kernel dispatches executed so far.
    pub fn dispatches(&self) -> usize {
        self.state.lock().dispatches
    }

    /// Copy of a memory object's contents.
    pub fn mem_contents(&self, mem: MemId) -> Option<Vec<u8>> {
        self.state.lock().mems.get(&mem.0).map(|m| m.data.clone())
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeApi for MockApi {
    fn name(&self) -> &str {
        "mock"
    }

    fn create_context(&self, _device: &Device) -> ApiResult<ContextId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateContext)?;
        let id = state.next(ObjectKind::Context);
        state.contexts.insert(id);
        Ok(ContextId(id))
    }

    fn create_queue(&self, context: ContextId, _device: &Device) -> ApiResult<QueueId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateQueue)?;
        if !state.contexts.contains(&context.0) {
            return Err(ApiError::unknown_handle("context", context.0));
        }
        let id = state.next(ObjectKind::Queue);
        state.queues.insert(id, Vec::new());
        Ok(QueueId(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> ApiResult<ProgramId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateProgram)?;
        if !state.contexts.contains(&context.0) {
            return Err(ApiError::unknown_handle("context", context.0));
        }
        let id = state.next(ObjectKind::Program);
        state.programs.insert(
            id,
            ProgramEntry {
                source: source.to_string(),
                log: String::new(),
                built: false,
            },
        );
        Ok(ProgramId(id))
    }

    fn build_program(&self, program: ProgramId, _device: &Device) -> ApiResult<()> {
        let mut state = self.state.lock();
        let injected = state.check(FailPoint::BuildProgram);
        let entry = state
            .programs
            .get_mut(&program.0)
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))?;

        // `#error` lines stand in for compiler diagnostics
        let mut log: Vec<String> = entry
            .source
            .lines()
            .enumerate()
            .filter(|(_, line)| line.trim_start().starts_with("#error"))
            .map(|(n, line)| format!("{}: error: {}", n + 1, line.trim_start().trim_start_matches("#error").trim()))
            .collect();
        if let Err(err) = &injected {
            log.push(err.to_string());
        }

        entry.log = log.join("\n");
        entry.built = log.is_empty();
        if entry.built {
            Ok(())
        } else {
            Err(ApiError::new("mock: program build failed"))
        }
    }

    fn build_log(&self, program: ProgramId) -> ApiResult<String> {
        let state = self.state.lock();
        state
            .programs
            .get(&program.0)
            .map(|p| p.log.clone())
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))
    }

    fn create_kernel(&self, program: ProgramId, entry_point: &str, signature: &[ArgKind]) -> ApiResult<KernelId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateKernel)?;
        let entry = state
            .programs
            .get(&program.0)
            .ok_or_else(|| ApiError::unknown_handle("program", program.0))?;
        if !entry.built {
            return Err(ApiError::new("mock: program is not built"));
        }
        if !entry.source.contains(entry_point) {
            return Err(ApiError::new(format!("mock: entry point `{entry_point}` not found")));
        }
        let id = state.next(ObjectKind::Kernel);
        state.kernels.insert(
            id,
            KernelEntry {
                signature: signature.to_vec(),
                args: vec![None; signature.len()],
            },
        );
        Ok(KernelId(id))
    }

    fn create_buffer(&self, context: ContextId, access: MemAccess, size: u64) -> ApiResult<MemId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateBuffer)?;
        if !state.contexts.contains(&context.0) {
            return Err(ApiError::unknown_handle("context", context.0));
        }
        if size == 0 {
            return Err(ApiError::new("mock: zero-sized buffer"));
        }
        let id = state.next(ObjectKind::Buffer);
        state.mems.insert(
            id,
            MemEntry {
                kind: ObjectKind::Buffer,
                access,
                data: vec![0; size as usize],
            },
        );
        Ok(MemId(id))
    }

    fn create_image_1d(&self, context: ContextId, texels: &[Texel]) -> ApiResult<MemId> {
        let mut state = self.state.lock();
        state.check(FailPoint::CreateImage)?;
        if !state.contexts.contains(&context.0) {
            return Err(ApiError::unknown_handle("context", context.0));
        }
        if texels.is_empty() {
            return Err(ApiError::new("mock: zero-width image"));
        }
        let id = state.next(ObjectKind::Image);
        state.mems.insert(
            id,
            MemEntry {
                kind: ObjectKind::Image,
                access: MemAccess::ReadOnly,
                data: bytemuck::cast_slice(texels).to_vec(),
            },
        );
        Ok(MemId(id))
    }

    fn write_buffer(&self, queue: QueueId, mem: MemId, offset: u64, data: &[u8]) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::WriteBuffer)?;
        if !state.queues.contains_key(&queue.0) {
            return Err(ApiError::unknown_handle("queue", queue.0));
        }
        let entry = state
            .mems
            .get_mut(&mem.0)
            .ok_or_else(|| ApiError::unknown_handle("mem", mem.0))?;
        if entry.kind != ObjectKind::Buffer {
            return Err(ApiError::new("mock: write to an image"));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(ApiError::new(format!("mock: write of {end} bytes past buffer end")));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::SetKernelArg(index))?;
        if let Some(mem) = arg.as_mem() {
            state.mem(mem)?;
        }
        let entry = state
            .kernels
            .get_mut(&kernel.0)
            .ok_or_else(|| ApiError::unknown_handle("kernel", kernel.0))?;
        let kind = entry
            .signature
            .get(index as usize)
            .copied()
            .ok_or_else(|| ApiError::new(format!("mock: kernel has no argument {index}")))?;
        if !arg.matches(kind) {
            return Err(ApiError::new(format!("mock: {arg:?} does not fit argument {index} ({kind:?})")));
        }
        entry.args[index as usize] = Some(arg);
        Ok(())
    }

    fn enqueue_kernel(&self, queue: QueueId, kernel: KernelId, origin: [u32; 2], size: [u32; 2]) -> ApiResult<()> {
        let mut state = self.state.lock();
        state.check(FailPoint::EnqueueKernel)?;
        let entry = state
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| ApiError::unknown_handle("kernel", kernel.0))?;
        if let Some(missing) = entry.args.iter().position(Option::is_none) {
            return Err(ApiError::new(format!("mock: kernel argument {missing} is not set")));
        }
        let dispatch = Dispatch {
            args: entry.args.clone(),
            origin,
            size,
        };
        state
            .queues
            .get_mut(&queue.0)
            .ok_or_else(|| ApiError::unknown_handle("queue", queue.0))?
            .push(dispatch);
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> ApiResult<()> {
        let gate = self.state.lock().gate.clone();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            // a dropped gate disconnects the channel and lets everyone through
            let _ = release.recv();
        }

        let mut state = self.state.lock();
        let pending = std::mem::take(
            state
                .queues
                .get_mut(&queue.0)
                .ok_or_else(|| ApiError::unknown_handle("queue", queue.0))?,
        );
        state.check(FailPoint::Finish)?;
        for dispatch in pending {
            state.run(dispatch, &self.pixel)?;
        }
        Ok(())
    }

    fn read_buffer(&self, queue: QueueId, mem: MemId, offset: u64, out: &mut [u8]) -> ApiResult<()> {
        let state = self.state.lock();
        state.check(FailPoint::ReadBuffer)?;
        if !state.queues.contains_key(&queue.0) {
            return Err(ApiError::unknown_handle("queue", queue.0));
        }
        let entry = state.mem(mem)?;
        let start = offset as usize;
        let end = start + out.len();
        if end > entry.data.len() {
            return Err(ApiError::new(format!("mock: read of {end} bytes past buffer end")));
        }
        out.copy_from_slice(&entry.data[start..end]);
        Ok(())
    }

    fn release_mem(&self, mem: MemId) -> ApiResult<()> {
        let mut state = self.state.lock();
        let kind = state.mem(mem)?.kind;
        state.release(kind, mem.0)
    }

    fn release_kernel(&self, kernel: KernelId) -> ApiResult<()> {
        self.state.lock().release(ObjectKind::Kernel, kernel.0)
    }

    fn release_program(&self, program: ProgramId) -> ApiResult<()> {
        self.state.lock().release(ObjectKind::Program, program.0)
    }

    fn release_queue(&self, queue: QueueId) -> ApiResult<()> {
        self.state.lock().release(ObjectKind::Queue, queue.0)
    }

    fn release_context(&self, context: ContextId) -> ApiResult<()> {
        self.state.lock().release(ObjectKind::Context, context.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceId, DeviceKind};

    fn device() -> Device {
        Device::new(DeviceId(0), "mock", DeviceKind::Cpu)
    }

    #[test]
    fn test_build_log_from_source() {
        let api = MockApi::new();
        let ctx = api.create_context(&device()).unwrap();
        let program = api.create_program(ctx, "fn main() {}\n#error missing semicolon\n").unwrap();

        assert!(api.build_program(program, &device()).is_err());
        let log = api.build_log(program).unwrap();
        assert_eq!(log, "2: error: missing semicolon");
    }

    #[test]
    fn test_dispatch_runs_on_finish() {
        let api = MockApi::new();
        let dev = device();
        let ctx = api.create_context(&dev).unwrap();
        let queue = api.create_queue(ctx, &dev).unwrap();
        let program = api.create_program(ctx, "fn trace() {}").unwrap();
        api.build_program(program, &dev).unwrap();
        let kernel = api.create_kernel(program, "trace", &[ArgKind::Buffer { writable: true }]).unwrap();
        let out = api.create_buffer(ctx, MemAccess::WriteOnly, 2 * 3 * 16).unwrap();

        api.set_kernel_arg(kernel, 0, KernelArg::Mem(Some(out))).unwrap();
        api.enqueue_kernel(queue, kernel, [0, 1], [2, 2]).unwrap();
        assert_eq!(api.dispatches(), 0);
        api.finish(queue).unwrap();
        assert_eq!(api.dispatches(), 1);

        let data = api.mem_contents(out).unwrap();
        let texels: Vec<Texel> = bytemuck::allocation::pod_collect_to_vec(&data);
        assert_eq!(texels[0], [0.0; 4], "row 0 is outside the dispatch");
        assert_eq!(texels[2], [0.0, 1.0, 0.0, 0.0]);
        assert_eq!(texels[5], [1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_arg_type_checked() {
        let api = MockApi::new();
        let dev = device();
        let ctx = api.create_context(&dev).unwrap();
        let program = api.create_program(ctx, "k").unwrap();
        api.build_program(program, &dev).unwrap();
        let kernel = api.create_kernel(program, "k", &[ArgKind::U32]).unwrap();

        assert!(api.set_kernel_arg(kernel, 0, KernelArg::F32(1.0)).is_err());
        assert!(api.set_kernel_arg(kernel, 1, KernelArg::U32(1)).is_err());
        assert!(api.set_kernel_arg(kernel, 0, KernelArg::U32(1)).is_ok());
    }

    #[test]
    fn test_release_tracking() {
        let api = MockApi::new();
        let ctx = api.create_context(&device()).unwrap();
        let buf = api.create_buffer(ctx, MemAccess::ReadOnly, 64).unwrap();
        assert_eq!(api.live_objects(), 2);

        api.fail(FailPoint::Release(ObjectKind::Buffer));
        assert!(api.release_mem(buf).is_err());
        api.clear_faults();
        api.release_mem(buf).unwrap();
        api.release_context(ctx).unwrap();

        assert_eq!(api.live_objects(), 0);
        assert!(api.release_context(ctx).is_err(), "double release is reported");
        assert_eq!(
            api.events(),
            vec![
                Event::Created(ObjectKind::Context),
                Event::Created(ObjectKind::Buffer),
                Event::ReleaseFailed(ObjectKind::Buffer),
                Event::Released(ObjectKind::Buffer),
                Event::Released(ObjectKind::Context),
            ]
        );
    }

    #[test]
    fn test_zero_sized_objects_rejected() {
        let api = MockApi::new();
        let ctx = api.create_context(&device()).unwrap();
        assert!(api.create_buffer(ctx, MemAccess::ReadOnly, 0).is_err());
        assert!(api.create_image_1d(ctx, &[]).is_err());
    }
}
