//! Integration tests for block processing on the worker thread.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pathtrace_device::compute::mock::{FailPoint, Invocation, MockApi};
use pathtrace_device::compute::KernelArg;
use pathtrace_device::tracer::{BlockRequest, RenderParams, RenderTarget, Tracer, TracerController};
use pathtrace_device::util::Vec3;
use pathtrace_device::TracerError;

use common::{device, enqueue_retry, kernel, scene, tracer, GOOD_KERNEL, TIMEOUT};

const UNTOUCHED: [f32; 4] = [-1.0; 4];

fn params(seed: u32) -> RenderParams {
    RenderParams {
        samples_per_pixel: 16,
        exposure: 1.5,
        seed,
    }
}

#[test]
fn test_block_writes_exactly_its_rows() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    let (w, h) = (5, 6);
    t.setup(scene(), w, h).unwrap();

    let target = Arc::new(RenderTarget::filled(w, h, UNTOUCHED));
    let (req, done) = BlockRequest::new(target.clone(), 2, 3, params(42));
    enqueue_retry(&t, req).expect("Request never accepted");
    assert!(matches!(done.wait(TIMEOUT), Some(Ok(3))));

    let frame = target.to_vec();
    let row = w as usize * 4;
    for y in 0..h {
        for x in 0..w {
            let expected = if (2..5).contains(&y) {
                [x as f32, y as f32, 42.0, 16.0]
            } else {
                UNTOUCHED
            };
            assert_eq!(target.pixel(x, y).unwrap(), expected, "pixel ({x}, {y})");
        }
    }
    // float offset of the block is 4 * w * y
    assert_eq!(frame[row * 2..row * 2 + 4], [0.0, 2.0, 42.0, 16.0]);
    assert_eq!(api.dispatches(), 1);
}

#[test]
fn test_requests_processed_in_order() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    t.setup(scene(), 4, 8).unwrap();

    let target = Arc::new(RenderTarget::filled(4, 8, UNTOUCHED));
    for y in (0..8).step_by(2) {
        let (req, done) = BlockRequest::new(target.clone(), y, 2, params(y));
        enqueue_retry(&t, req).expect("Request never accepted");
        assert!(matches!(done.wait(TIMEOUT), Some(Ok(2))));
    }
    for y in 0..8 {
        assert_eq!(target.pixel(3, y).unwrap(), [3.0, y as f32, (y - y % 2) as f32, 16.0]);
    }
}

#[test]
fn test_idle_worker_accepts_at_once() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);

    for round in 0..20 {
        let t = tracer("t", &api, config.clone());
        t.setup(scene(), 4, 4).unwrap();
        let target = Arc::new(RenderTarget::filled(4, 4, UNTOUCHED));

        // straight after setup, no retry
        let (req, done) = BlockRequest::new(target.clone(), 0, 2, params(round));
        t.enqueue(req).unwrap_or_else(|_| panic!("Round {round}: request dropped after setup"));
        assert!(matches!(done.wait(TIMEOUT), Some(Ok(2))));

        // and straight after the previous block answered
        let (req, done) = BlockRequest::new(target.clone(), 2, 2, params(round));
        t.enqueue(req).unwrap_or_else(|_| panic!("Round {round}: request dropped after completion"));
        assert!(matches!(done.wait(TIMEOUT), Some(Ok(2))));
        assert_eq!(target.pixel(3, 3).unwrap(), [3.0, 3.0, round as f32, 16.0]);
    }
    assert_eq!(api.dispatches(), 40);
}

#[test]
fn test_busy_worker_drops_request() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    t.setup(scene(), 4, 4).unwrap();
    let target = Arc::new(RenderTarget::filled(4, 4, UNTOUCHED));

    let gate = api.pause_finish();
    let (first, first_done) = BlockRequest::new(target.clone(), 0, 2, params(1));
    enqueue_retry(&t, first).expect("Request never accepted");
    assert!(gate.wait_entered(TIMEOUT), "Worker never reached finish");

    let (second, second_done) = BlockRequest::new(target.clone(), 2, 2, params(2));
    let second = t.enqueue(second).expect_err("Busy worker accepted a request");
    assert_eq!(second.block_y, 2);
    assert!(second_done.try_get().is_none());

    gate.release();
    assert!(matches!(first_done.wait(TIMEOUT), Some(Ok(2))));
    drop(gate);

    // the dropped request never ran and never answers
    drop(second);
    assert!(second_done.wait(Duration::from_millis(20)).is_none());
    assert_eq!(target.pixel(0, 2).unwrap(), UNTOUCHED);
    assert_eq!(api.dispatches(), 1);
}

#[test]
fn test_enqueue_before_setup_is_dropped() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);

    let target = Arc::new(RenderTarget::new(4, 4));
    let (req, done) = BlockRequest::new(target, 0, 4, params(0));
    assert!(t.enqueue(req).is_err());
    assert!(done.try_get().is_none());
}

#[test]
fn test_block_failures_keep_worker_alive() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    t.setup(scene(), 4, 4).unwrap();
    let target = Arc::new(RenderTarget::filled(4, 4, UNTOUCHED));

    let cases: [(FailPoint, fn(&TracerError) -> bool); 5] = [
        (FailPoint::WriteBuffer, |e| matches!(e, TracerError::CopyingDataToDevice(_))),
        (FailPoint::SetKernelArg(7), |e| {
            matches!(e, TracerError::SettingKernelArguments { index: 7, .. })
        }),
        (FailPoint::EnqueueKernel, |e| matches!(e, TracerError::KernelExecutionFailed(_))),
        (FailPoint::Finish, |e| matches!(e, TracerError::KernelExecutionFailed(_))),
        (FailPoint::ReadBuffer, |e| matches!(e, TracerError::CopyingDataToHost(_))),
    ];
    for (point, expected) in cases {
        api.fail(point);
        let (req, done) = BlockRequest::new(target.clone(), 0, 4, params(0));
        enqueue_retry(&t, req).expect("Request never accepted");
        match done.wait(TIMEOUT) {
            Some(Err(err)) => assert!(expected(&err), "{point:?} produced {err}"),
            other => panic!("Expected failure for {point:?}, got {other:?}"),
        }
        api.clear_faults();
    }
    assert_eq!(target.pixel(0, 0).unwrap(), UNTOUCHED, "failed blocks write nothing");

    let (req, done) = BlockRequest::new(target.clone(), 0, 4, params(9));
    enqueue_retry(&t, req).expect("Request never accepted");
    assert!(matches!(done.wait(TIMEOUT), Some(Ok(4))));
    assert_eq!(target.pixel(1, 3).unwrap(), [1.0, 3.0, 9.0, 16.0]);
}

#[test]
fn test_invalid_block_rejected() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    t.setup(scene(), 4, 4).unwrap();

    let requests = [
        BlockRequest::new(Arc::new(RenderTarget::new(4, 4)), 3, 2, params(0)),
        BlockRequest::new(Arc::new(RenderTarget::new(4, 4)), 0, 0, params(0)),
        BlockRequest::new(Arc::new(RenderTarget::new(8, 4)), 0, 1, params(0)),
    ];
    for (req, done) in requests {
        enqueue_retry(&t, req).expect("Request never accepted");
        assert!(matches!(
            done.wait(TIMEOUT),
            Some(Err(TracerError::InvalidBlockRequest(_)))
        ));
    }
    assert_eq!(api.dispatches(), 0);
}

#[test]
fn test_camera_motion_picked_up_per_block() {
    // pixel = eye position (argument 5)
    let api = Arc::new(MockApi::with_pixel_fn(Arc::new(|inv: &Invocation<'_>| {
        match inv.args[5] {
            Some(KernelArg::Vec4(eye)) => eye,
            _ => [f32::NAN; 4],
        }
    })));
    let (_dir, config) = kernel(GOOD_KERNEL);
    let t = tracer("t", &api, config);
    let shared = scene();
    t.setup(shared.clone(), 2, 2).unwrap();

    shared.write().camera.set_position(Vec3::new(3.0, 2.0, 1.0));
    t.sync_scene().unwrap();

    let target = Arc::new(RenderTarget::new(2, 2));
    let (req, done) = BlockRequest::new(target.clone(), 0, 2, params(0));
    enqueue_retry(&t, req).expect("Request never accepted");
    assert!(matches!(done.wait(TIMEOUT), Some(Ok(2))));
    assert_eq!(target.pixel(1, 1).unwrap(), [3.0, 2.0, 1.0, 1.0]);
}

#[test]
fn test_two_tracers_share_target() {
    let api = Arc::new(MockApi::new());
    let (_dir, config) = kernel(GOOD_KERNEL);
    let (w, h) = (16, 12);
    let shared = scene();

    let tracers: Vec<Arc<dyn Tracer>> = (0..2)
        .map(|i| {
            let t = TracerController::new(format!("gpu{i}"), device(i), api.clone(), config.clone());
            t.setup(shared.clone(), w, h).unwrap();
            Arc::new(t) as Arc<dyn Tracer>
        })
        .collect();

    let target = Arc::new(RenderTarget::filled(w, h, UNTOUCHED));
    let handles: Vec<_> = tracers
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let t = t.clone();
            let target = target.clone();
            thread::spawn(move || {
                let mut answers = Vec::new();
                // tracer 0 renders rows 0..6, tracer 1 rows 6..12, two rows at a time
                for y in (i as u32 * 6..i as u32 * 6 + 6).step_by(2) {
                    let (req, done) = BlockRequest::new(target.clone(), y, 2, params(i as u32 + 1));
                    enqueue_retry(t.as_ref(), req).expect("Request never accepted");
                    answers.push(done.wait(TIMEOUT));
                }
                answers
            })
        })
        .collect();

    for handle in handles {
        for answer in handle.join().expect("Render thread panicked") {
            assert!(matches!(answer, Some(Ok(2))));
        }
    }
    for y in 0..h {
        let seed = if y < 6 { 1.0 } else { 2.0 };
        for x in 0..w {
            assert_eq!(target.pixel(x, y).unwrap(), [x as f32, y as f32, seed, 16.0]);
        }
    }

    for t in &tracers {
        t.close();
    }
    assert_eq!(api.live_objects(), 0);
}
