//! Integration tests for frame acquisition against the mock driver.
#![cfg(feature = "mock")]

use daq_driver_spinnaker::native::image_status;
use daq_driver_spinnaker::native::mock::{FrameSource, MockDevice, MockDriver, MockFrame};
use daq_driver_spinnaker::{
    Camera, CameraList, DriverConfig, NativeDriver, PixelFormat, SpinError, Status, SystemManager,
    Wait,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn open(device: MockDevice) -> (Arc<MockDriver>, Arc<SystemManager>, Camera) {
    let driver = Arc::new(MockDriver::with_devices([device]));
    let manager = SystemManager::with_defaults(driver.clone());
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .get(0)
        .expect("Failed to open camera");
    camera.start().expect("Failed to start acquisition");
    (driver, manager, camera)
}

fn queued(serial: &str) -> MockDevice {
    MockDevice::new(serial, "Blackfly S").with_frame_source(FrameSource::Queue)
}

#[test]
fn test_pull_times_out_without_frames() {
    let (_driver, _manager, camera) = open(queued("S1"));

    let start = Instant::now();
    let err = camera
        .pull_frame(Wait::from_millis(1))
        .expect_err("No frame should arrive");
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(err.can_recover());
    assert!(start.elapsed() < Duration::from_secs(1));

    let err = camera.pull_frame(Wait::POLL).expect_err("Poll should not block");
    assert!(matches!(err, SpinError::Timeout { .. }));
}

#[test]
fn test_forever_wait_returns_when_frame_arrives() {
    let (driver, _manager, camera) = open(queued("S1"));

    let producer = {
        let driver = driver.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono8, 8, 4, 9));
        })
    };

    let frame = camera.pull_frame(Wait::Forever).expect("Failed to pull frame");
    assert_eq!((frame.width(), frame.height()), (8, 4));
    producer.join().expect("Producer panicked");
}

#[test]
fn test_normalized_copy_reaches_one_at_max() {
    let (driver, _manager, camera) = open(queued("S1"));

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono12, 4, 2, 4095));
    let image = camera
        .get_image::<f64>(Wait::from_millis(100), true)
        .expect("Failed to get image");
    assert!(image.data.iter().all(|v| (v - 1.0).abs() < 1e-9));

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono12, 4, 2, 4095));
    let image = camera
        .get_image::<u16>(Wait::from_millis(100), false)
        .expect("Failed to get image");
    assert!(image.data.iter().all(|v| *v == 4095));

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono8, 4, 2, 255));
    let image = camera
        .get_image::<f32>(Wait::from_millis(100), true)
        .expect("Failed to get image");
    assert!(image.data.iter().all(|v| (v - 1.0).abs() < 1e-6));
}

#[test]
fn test_next_image_follows_configured_normalization() {
    let driver = Arc::new(MockDriver::with_devices([queued("S1")]));
    let mut config = DriverConfig::default();
    config.acquisition.normalize = true;
    config.acquisition.default_timeout_ms = 100;
    let manager = SystemManager::new(driver.clone(), config);
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .get(0)
        .expect("Failed to open camera");
    camera.start().expect("Failed to start acquisition");

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono12, 4, 2, 4095));
    let image = camera.next_image::<f32>().expect("Failed to get image");
    assert!(image.data.iter().all(|v| (v - 1.0).abs() < 1e-6));

    let err = camera.next_image::<f32>().expect_err("Queue is empty");
    assert!(err.is_timeout());
}

#[test]
fn test_normalized_integers_are_fixed_point() {
    let (driver, _manager, camera) = open(queued("S1"));

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono16, 2, 2, 65535));
    let image = camera
        .get_image::<u8>(Wait::from_millis(100), true)
        .expect("Failed to get image");
    assert_eq!(image.data, vec![255; 4]);

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono16, 2, 2, 4000));
    let image = camera
        .get_image::<u8>(Wait::from_millis(100), false)
        .expect("Failed to get image");
    assert_eq!(image.data, vec![255; 4], "raw copy saturates");
}

#[test]
fn test_incomplete_frame_is_released_and_reported() {
    let (driver, _manager, camera) = open(queued("S1"));

    driver.push_frame("S1", MockFrame::incomplete(image_status::MISSING_PACKETS));
    match camera.pull_frame(Wait::from_millis(100)) {
        Err(SpinError::IncompleteFrame { image_status: status }) => {
            assert_eq!(status, image_status::MISSING_PACKETS)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(driver.outstanding_frames(), 0);

    driver.push_frame("S1", MockFrame::uniform(PixelFormat::Mono8, 4, 4, 1));
    assert!(camera.pull_frame(Wait::from_millis(100)).is_ok());
}

#[test]
fn test_frame_buffer_lifetime() {
    let (driver, _manager, camera) = open(MockDevice::new("S1", "Blackfly S"));

    let frame = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    assert_eq!(driver.outstanding_frames(), 1);
    drop(frame);
    assert_eq!(driver.outstanding_frames(), 0);

    let frame = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    frame.release().expect("Failed to release frame");
    assert_eq!(driver.outstanding_frames(), 0);

    let frame = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    let handle = frame.into_handle();
    assert_eq!(driver.outstanding_frames(), 1);
    driver
        .frame_release(handle)
        .expect("Failed to release detached frame");
    assert_eq!(driver.violations().total(), 0);
}

#[test]
fn test_chunk_metadata_follows_enabled_chunks() {
    let (_driver, _manager, camera) = open(MockDevice::new("S1", "Blackfly S"));
    let first = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    let second = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    assert_eq!(first.meta().frame_id, Some(0));
    assert_eq!(second.meta().frame_id, Some(1));
    assert!(first.meta().timestamp_ns < second.meta().timestamp_ns);
    assert_eq!(first.meta().exposure_us, Some(10_000.0));

    let (_driver, _manager, camera) = open(
        MockDevice::new("S2", "Blackfly S").with_chunk_selectors(&["FrameCounter", "ExposureTime"]),
    );
    let frame = camera.pull_frame(Wait::from_millis(100)).expect("Failed to pull");
    assert_eq!(frame.meta().frame_id, Some(0));
    assert_eq!(frame.meta().timestamp_ns, None);
}

#[test]
fn test_pattern_corners_span_full_range() {
    let (_driver, _manager, camera) = open(
        MockDevice::new("S1", "Blackfly S").with_geometry(16, 8, PixelFormat::Mono12),
    );
    let image = camera
        .get_image::<f32>(Wait::from_millis(100), true)
        .expect("Failed to get image");
    assert_eq!(image.sample(0, 0, 0), Some(0.0));
    assert_eq!(image.sample(15, 7, 0), Some(1.0));
    assert_eq!(image.sample(16, 0, 0), None);
}

#[test]
fn test_copy_into_short_buffer_rejected() {
    let (driver, _manager, camera) = open(MockDevice::new("S1", "Blackfly S"));
    let mut dest = vec![0u8; 10];
    let err = camera
        .get_image_into(&mut dest, Wait::from_millis(100), false)
        .expect_err("Buffer is too small");
    assert!(matches!(err, SpinError::InvalidArgument(_)));
    assert_eq!(driver.outstanding_frames(), 0);
}

#[test]
fn test_pull_before_start_fails() {
    let driver = Arc::new(MockDriver::with_devices([MockDevice::new("S1", "Blackfly S")]));
    let manager = SystemManager::with_defaults(driver.clone());
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .get(0)
        .expect("Failed to open");

    let err = camera
        .pull_frame(Wait::from_millis(10))
        .expect_err("Camera is not streaming");
    assert_eq!(err.status(), Some(Status::NOT_AVAILABLE));
}

#[test]
fn test_save_image_writes_file() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let (driver, _manager, camera) = open(
        MockDevice::new("S1", "Blackfly S").with_geometry(32, 16, PixelFormat::Mono16),
    );

    let path = dir.path().join("frame.png");
    let meta = camera
        .save_image(&path, None, Wait::from_millis(100))
        .expect("Failed to save image");
    assert_eq!((meta.width, meta.height), (32, 16));
    let written = image::open(&path).expect("Saved file is not an image");
    assert_eq!((written.width(), written.height()), (32, 16));

    let raw = dir.path().join("frame.raw");
    camera
        .save_image(&raw, None, Wait::from_millis(100))
        .expect("Failed to save raw");
    assert_eq!(
        std::fs::metadata(&raw).expect("Raw file missing").len(),
        32 * 16 * 2
    );
    assert_eq!(driver.outstanding_frames(), 0);
}

#[test]
fn test_save_image_needs_known_format() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let (driver, _manager, camera) = open(MockDevice::new("S1", "Blackfly S"));
    let err = camera
        .save_image(dir.path().join("frame.xyz"), None, Wait::from_millis(100))
        .expect_err("Extension is unknown");
    assert!(matches!(err, SpinError::InvalidArgument(_)));
    assert_eq!(driver.calls().get_next_frame, 0);
}
