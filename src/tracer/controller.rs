//! Tracer controller: state machine, worker thread and block processing.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::Span;

use super::{BlockRequest, DeviceResourceSet, Tracer};
use crate::compute::{ComputeApi, KernelArg};
use crate::config::TracerConfig;
use crate::device::Device;
use crate::scene::SharedScene;
use crate::util::{Result, TracerError, TEXEL_BYTES};

/// Lifecycle state of a controller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TracerState {
    /// No device objects, no worker
    Unattached,
    /// Device objects allocated, worker running
    Ready,
    /// Terminal
    Closed,
}

/// Everything that exists only while the controller is `Ready`.
struct Attachment {
    resources: Arc<DeviceResourceSet>,
    scene: SharedScene,
    shutdown: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

enum ControllerState {
    Unattached,
    Ready(Attachment),
    Closed,
}

const OFFLINE: u8 = 0;
const IDLE: u8 = 1;
const BUSY: u8 = 2;

/// Whether the worker can take a request, shared by `enqueue` and the worker.
///
/// A request is only put in the mailbox after claiming `IDLE -> BUSY`, so the
/// single slot is always empty when a claim succeeds. The worker hands the
/// slot back with `BUSY -> IDLE` once a block is finished.
#[derive(Clone, Default)]
struct Availability(Arc<AtomicU8>);

impl Availability {
    fn claim(&self) -> bool {
        self.0.compare_exchange(IDLE, BUSY, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn hand_back(&self) {
        // fails once close has taken the worker offline
        let _ = self.0.compare_exchange(BUSY, IDLE, Ordering::AcqRel, Ordering::Acquire);
    }

    fn open(&self) {
        self.0.store(IDLE, Ordering::Release);
    }

    fn shut(&self) {
        self.0.store(OFFLINE, Ordering::Release);
    }
}

/// Tracer bound to one compute device.
///
/// State transitions (`setup`, `sync_scene`, `close`) are serialized by one
/// lock. Block rendering never takes that lock: every device call after
/// setup is made by the single worker thread, which is reached only through
/// the request mailbox. A request is accepted only while the worker is idle,
/// so `enqueue` never blocks and never queues behind a running block.
pub struct TracerController {
    id: String,
    device: Device,
    api: Arc<dyn ComputeApi>,
    config: TracerConfig,
    state: Mutex<ControllerState>,
    /// Single-slot mailbox, filled only after a successful `availability` claim
    mailbox: Sender<BlockRequest>,
    inbox: Receiver<BlockRequest>,
    availability: Availability,
    span: Span,
}

impl TracerController {
    pub fn new(id: impl Into<String>, device: Device, api: Arc<dyn ComputeApi>, config: TracerConfig) -> Self {
        let id = id.into();
        let span = tracing::info_span!("tracer", id = %id, device = %device.name);
        let (mailbox, inbox) = crossbeam_channel::bounded(1);
        Self {
            id,
            device,
            api,
            config,
            state: Mutex::new(ControllerState::Unattached),
            mailbox,
            inbox,
            availability: Availability::default(),
            span,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn state(&self) -> TracerState {
        match *self.state.lock() {
            ControllerState::Unattached => TracerState::Unattached,
            ControllerState::Ready(_) => TracerState::Ready,
            ControllerState::Closed => TracerState::Closed,
        }
    }

    /// Frame size fixed by `setup`, while attached.
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        match &*self.state.lock() {
            ControllerState::Ready(att) => Some((att.resources.width, att.resources.height)),
            _ => None,
        }
    }

    /// Starts the worker and waits until it is running.
    fn spawn_worker(&self, resources: Arc<DeviceResourceSet>, scene: SharedScene) -> Result<(Sender<()>, JoinHandle<()>)> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(0);
        let worker = Worker {
            resources,
            scene,
            availability: self.availability.clone(),
            scratch: Vec::new(),
        };
        let inbox = self.inbox.clone();
        let span = self.span.clone();
        let handle = thread::Builder::new()
            .name(format!("tracer-{}", self.id))
            .spawn(move || {
                let _enter = span.enter();
                worker.run(ready_tx, inbox, shutdown_rx);
            })
            .map_err(TracerError::WorkerSpawn)?;

        if ready_rx.recv().is_err() {
            if handle.join().is_err() {
                tracing::error!("tracer worker panicked during start");
            }
            return Err(TracerError::WorkerSpawn(std::io::Error::other(
                "tracer worker exited before it was ready",
            )));
        }
        Ok((shutdown_tx, handle))
    }

    /// Answers requests accepted but never taken by the worker.
    fn drain_mailbox(&self) {
        while let Ok(request) = self.inbox.try_recv() {
            tracing::debug!(block_y = request.block_y, "request left in mailbox at close");
            request.complete(Err(TracerError::Closed));
        }
    }
}

impl Tracer for TracerController {
    fn id(&self) -> &str {
        &self.id
    }

    fn speed_estimate(&self) -> f32 {
        self.device.speed_estimate()
    }

    fn setup(&self, scene: SharedScene, width: u32, height: u32) -> Result<()> {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        match *state {
            ControllerState::Unattached => {}
            ControllerState::Ready(_) => return Err(TracerError::AlreadyAttached),
            ControllerState::Closed => return Err(TracerError::Closed),
        }

        let resources = {
            let scene = scene.read();
            DeviceResourceSet::create(self.api.clone(), &self.device, &self.config, &scene, width, height)?
        };
        let resources = Arc::new(resources);

        let (shutdown, worker) = match self.spawn_worker(resources.clone(), scene.clone()) {
            Ok(spawned) => spawned,
            Err(err) => {
                if let Ok(resources) = Arc::try_unwrap(resources) {
                    resources.release();
                }
                return Err(err);
            }
        };

        tracing::info!(width, height, backend = self.api.name(), "tracer ready");
        self.availability.open();
        *state = ControllerState::Ready(Attachment {
            resources,
            scene,
            shutdown,
            worker: Some(worker),
        });
        Ok(())
    }

    fn enqueue(&self, request: BlockRequest) -> std::result::Result<(), BlockRequest> {
        if !self.availability.claim() {
            tracing::trace!(parent: &self.span, block_y = request.block_y, "worker busy, request dropped");
            return Err(request);
        }
        match self.mailbox.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request) | TrySendError::Disconnected(request)) => {
                self.availability.hand_back();
                tracing::warn!(parent: &self.span, block_y = request.block_y, "mailbox occupied while idle, request dropped");
                Err(request)
            }
        }
    }

    fn sync_scene(&self) -> Result<()> {
        let state = self.state.lock();
        match &*state {
            ControllerState::Ready(att) => {
                let scene = att.scene.read();
                att.resources.sync_frustum(&scene.camera)
            }
            _ => Err(TracerError::PendingSetup),
        }
    }

    fn close(&self) {
        let _enter = self.span.enter();
        let mut state = self.state.lock();
        let mut att = match std::mem::replace(&mut *state, ControllerState::Closed) {
            ControllerState::Ready(att) => att,
            ControllerState::Unattached => {
                tracing::debug!("closed before setup");
                return;
            }
            ControllerState::Closed => return,
        };

        // the worker must be gone before any device object is released
        self.availability.shut();
        let _ = att.shutdown.send(());
        if let Some(worker) = att.worker.take() {
            if worker.join().is_err() {
                tracing::error!("tracer worker panicked");
            }
        }
        self.drain_mailbox();

        match Arc::try_unwrap(att.resources) {
            Ok(resources) => {
                let failures = resources.release();
                tracing::info!(failures, "tracer closed");
            }
            Err(_) => tracing::error!("device resources still shared after worker exit, not released"),
        }
    }
}

impl Drop for TracerController {
    fn drop(&mut self) {
        self.close();
    }
}

/// State owned by the worker thread.
struct Worker {
    resources: Arc<DeviceResourceSet>,
    scene: SharedScene,
    availability: Availability,
    /// Readback staging, reused across blocks
    scratch: Vec<f32>,
}

impl Worker {
    fn run(mut self, ready: Sender<()>, inbox: Receiver<BlockRequest>, shutdown: Receiver<()>) {
        tracing::debug!("worker started");
        if ready.send(()).is_err() {
            return;
        }
        loop {
            crossbeam_channel::select! {
                recv(inbox) -> msg => match msg {
                    Ok(request) => self.serve(request),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        tracing::debug!("worker stopped");
    }

    fn serve(&mut self, request: BlockRequest) {
        let (y, h) = (request.block_y, request.block_h);
        let result = self.process(&request);
        match &result {
            Ok(()) => tracing::debug!(block_y = y, block_h = h, "block rendered"),
            Err(err) => tracing::warn!(block_y = y, block_h = h, error = %err, "block failed"),
        }
        // idle before answering, so the caller can enqueue the next block at once
        self.availability.hand_back();
        request.complete(result);
    }

    fn process(&mut self, request: &BlockRequest) -> Result<()> {
        let res = &*self.resources;
        let api = res.api();
        let (width, height) = (res.width, res.height);
        let (y, h) = (request.block_y, request.block_h);

        if h == 0 || y as u64 + h as u64 > height as u64 {
            return Err(TracerError::InvalidBlockRequest(format!(
                "rows {y}..{} outside a frame of height {height}",
                y as u64 + h as u64
            )));
        }
        if request.target.width() != width || request.target.height() != height {
            return Err(TracerError::InvalidBlockRequest(format!(
                "render target is {}x{}, frame is {width}x{height}",
                request.target.width(),
                request.target.height()
            )));
        }

        let eye = {
            let scene = self.scene.read();
            res.sync_frustum(&scene.camera)?;
            scene.camera.position()
        };

        let params = &request.params;
        let args = [
            KernelArg::Mem(Some(res.output)),
            KernelArg::Mem(Some(res.frustum)),
            KernelArg::Mem(res.primitives),
            KernelArg::Mem(res.materials),
            KernelArg::I32(res.primitive_count),
            KernelArg::Vec4(eye.to_array()),
            KernelArg::U32(y),
            KernelArg::U32(params.samples_per_pixel),
            KernelArg::F32(params.exposure),
            KernelArg::U32(params.seed),
        ];
        for (index, arg) in (0u32..).zip(args) {
            api.set_kernel_arg(res.kernel, index, arg)
                .map_err(|source| TracerError::SettingKernelArguments { index, source })?;
        }

        api.enqueue_kernel(res.queue, res.kernel, [0, y], [width, h])
            .map_err(TracerError::KernelExecutionFailed)?;
        api.finish(res.queue).map_err(TracerError::KernelExecutionFailed)?;

        let row_bytes = TEXEL_BYTES as u64 * width as u64;
        self.scratch.clear();
        self.scratch.resize(width as usize * h as usize * 4, 0.0);
        api.read_buffer(
            res.queue,
            res.output,
            row_bytes * y as u64,
            bytemuck::cast_slice_mut(&mut self.scratch),
        )
        .map_err(TracerError::CopyingDataToHost)?;

        request.target.write_rows(y, &self.scratch)
    }
}
