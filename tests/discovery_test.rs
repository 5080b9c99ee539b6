//! Integration tests for enumeration, aliasing through the camera list, and
//! device reset.
#![cfg(feature = "mock")]

use daq_driver_spinnaker::native::mock::{MockDevice, MockDriver};
use daq_driver_spinnaker::{tasks, CameraList, CameraState, DriverConfig, SystemManager, Wait};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn setup(devices: Vec<MockDevice>) -> (Arc<MockDriver>, Arc<SystemManager>) {
    let driver = Arc::new(MockDriver::with_devices(devices));
    let mut config = DriverConfig::default();
    config.reset.poll_interval_ms = 10;
    config.reset.timeout_ms = 2_000;
    let manager = SystemManager::new(driver.clone(), config);
    (driver, manager)
}

#[test]
fn test_every_index_access_is_a_new_alias() {
    let (driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S"),
        MockDevice::new("B", "Chameleon3"),
    ]);
    let list = CameraList::enumerate(&manager).expect("Failed to enumerate");

    let cameras: Vec<_> = list
        .cameras()
        .collect::<Result<_, _>>()
        .expect("Failed to open cameras");
    assert_eq!(cameras[1].model(), "Chameleon3");

    let again = list.get(0).expect("Failed to open alias");
    assert_eq!(manager.registry().live_count_for("A"), 2);
    assert_eq!(manager.live_cameras(), 3);

    drop(cameras);
    assert_eq!(driver.teardowns("A"), 0);
    assert_eq!(driver.teardowns("B"), 1);
    assert!(again.get("Gain").is_ok());

    drop(again);
    assert_eq!(driver.teardowns("A"), 1);
}

#[test]
fn test_reset_with_wait_reopens_same_serial() {
    let (driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S").with_reset_downtime(Duration::from_millis(60))
    ]);
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .open_serial("A")
        .expect("Failed to open");

    let start = Instant::now();
    let reopened = camera
        .reset(true, None)
        .expect("Reset failed")
        .expect("Waiting reset returns the new camera");
    assert!(start.elapsed() >= Duration::from_millis(60));

    assert_eq!(camera.state(), CameraState::Released);
    assert!(!camera.is_open());
    assert_eq!(reopened.serial(), "A");
    assert!(reopened.is_open());
    assert!(driver.is_initialized("A"));
    assert_eq!(manager.live_cameras(), 1);
    assert_eq!(driver.violations().total(), 0);
}

#[test]
fn test_reset_without_wait_returns_immediately() {
    let (driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S").with_reset_downtime(Duration::from_secs(5))
    ]);
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .get(0)
        .expect("Failed to open");

    let reopened = camera.reset(false, None).expect("Reset failed");
    assert!(reopened.is_none());
    assert!(!driver.is_online("A"));
    assert_eq!(manager.live_cameras(), 0);
}

#[test]
fn test_reset_times_out_when_device_stays_away() {
    let (_driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S").with_reset_downtime(Duration::from_secs(10))
    ]);
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .get(0)
        .expect("Failed to open");

    let start = Instant::now();
    let err = camera
        .reset(true, Some(Duration::from_millis(100)))
        .expect_err("Device never comes back");
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_list_snapshot_misses_devices_resetting() {
    let (_driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S").with_reset_downtime(Duration::from_secs(5)),
        MockDevice::new("B", "Blackfly S"),
    ]);
    let camera = CameraList::enumerate(&manager)
        .expect("Failed to enumerate")
        .open_serial("A")
        .expect("Failed to open");
    camera.reset(false, None).expect("Reset failed");

    let list = CameraList::enumerate(&manager).expect("Failed to enumerate");
    assert_eq!(list.serials(), vec!["B".to_string()]);
    assert_eq!(list.find("A"), None);
}

#[tokio::test]
async fn test_async_reset_and_pull() {
    let (driver, manager) = setup(vec![
        MockDevice::new("A", "Blackfly S").with_reset_downtime(Duration::from_millis(30))
    ]);

    let camera = Arc::new(
        tasks::open_serial(manager.clone(), "A".to_string())
            .await
            .expect("Failed to open"),
    );
    let camera = Arc::new(
        tasks::reset_and_wait(camera, Some(Duration::from_secs(1)))
            .await
            .expect("Reset failed"),
    );

    camera.start().expect("Failed to start");
    let frame = tasks::pull_frame(camera.clone(), Wait::from_millis(100))
        .await
        .expect("Failed to pull frame");
    assert_eq!(frame.meta().frame_id, Some(0));
    drop(frame);

    tasks::release(camera).await.expect("Release task failed");
    assert_eq!(driver.outstanding_frames(), 0);
    assert_eq!(manager.live_cameras(), 0);
}
