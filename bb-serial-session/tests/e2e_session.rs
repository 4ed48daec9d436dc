//! Port selection and mode arbitration.


use bb_serial_session::{Coordinator, Error, Mode};
use e2e_common::{MockChooser, MockPort, connected};
use tokio::sync::mpsc;

#[tokio::test]
async fn request_port_selects() {
    let (port, device) = MockPort::new("/dev/ttyACM0");
    let session = Coordinator::new();

    let info = session
        .request_port(&MockChooser::port(port))
        .await
        .unwrap();
    assert_eq!(info.name, "/dev/ttyACM0");
    assert_eq!(info.vendor_id, Some(0x303a));

    let status = session.status().await;
    assert_eq!(status.mode, Mode::Idle);
    assert_eq!(status.port, Some(info));
    assert!(!status.reset_available);
    assert!(!device.is_open());
}

#[tokio::test]
async fn chooser_failures() {
    let session = Coordinator::<MockPort>::new();

    assert!(matches!(
        session.request_port(&MockChooser::Cancel).await,
        Err(Error::NoPortSelected)
    ));
    assert!(matches!(
        session.request_port(&MockChooser::Unsupported).await,
        Err(Error::UnsupportedEnvironment(_))
    ));
    assert_eq!(session.status().await.port, None);
}

#[tokio::test]
async fn modes_need_a_port() {
    let session = Coordinator::<MockPort>::new();

    assert!(matches!(
        session.enter_mode(Mode::Flashing).await,
        Err(Error::NoPortSelected)
    ));

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        session.start_monitor(115200, tx).await,
        Err(Error::NoPortSelected)
    ));
    assert_eq!(session.mode().await, Mode::Idle);
}

#[tokio::test]
async fn modes_are_exclusive() {
    let (session, _device) = connected().await;

    let flashing = session.enter_mode(Mode::Flashing).await.unwrap();
    assert!(matches!(
        session.enter_mode(Mode::Monitoring).await,
        Err(Error::ModeConflict {
            current: Mode::Flashing,
            requested: Mode::Monitoring
        })
    ));

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        session.start_monitor(115200, tx.clone()).await,
        Err(Error::ModeConflict { .. })
    ));
    assert_eq!(session.mode().await, Mode::Flashing);

    session.exit_mode(&flashing, false).await;
    assert_eq!(session.mode().await, Mode::Idle);

    let monitoring = session.start_monitor(115200, tx).await.unwrap();
    assert!(matches!(
        session.enter_mode(Mode::Flashing).await,
        Err(Error::ModeConflict {
            current: Mode::Monitoring,
            requested: Mode::Flashing
        })
    ));

    session.exit_mode(&monitoring, true).await;
    assert_eq!(session.mode().await, Mode::Idle);
}

#[tokio::test]
async fn exit_twice_is_noop() {
    let (session, device) = connected().await;
    let (tx, _rx) = mpsc::unbounded_channel();

    let token = session.start_monitor(115200, tx.clone()).await.unwrap();
    session.exit_mode(&token, true).await;
    session.exit_mode(&token, true).await;

    assert_eq!(session.mode().await, Mode::Idle);
    assert_eq!(device.close_count(), 1);

    // A stale token must not stop a newer monitor
    let newer = session.start_monitor(9600, tx).await.unwrap();
    session.exit_mode(&token, true).await;
    assert_eq!(session.mode().await, Mode::Monitoring);
    assert!(device.is_open());

    session.exit_mode(&newer, true).await;
    assert_eq!(session.mode().await, Mode::Idle);
    assert!(!device.is_open());
}

#[tokio::test]
async fn no_port_change_while_busy() {
    let (session, _device) = connected().await;
    let token = session.enter_mode(Mode::Flashing).await.unwrap();

    let (other, _) = MockPort::new("/dev/ttyUSB1");
    assert!(matches!(
        session.request_port(&MockChooser::port(other)).await,
        Err(Error::ModeConflict { .. })
    ));
    assert_eq!(
        session.status().await.port.map(|x| x.name),
        Some("/dev/ttyACM0".to_string())
    );

    session.exit_mode(&token, false).await;
}

#[tokio::test]
async fn new_port_replaces_old() {
    let (session, old) = connected().await;
    let (tx, _rx) = mpsc::unbounded_channel();

    session.start_monitor(115200, tx).await.unwrap();
    session.stop_monitor(false).await;
    assert!(old.is_open());

    let (port, new) = MockPort::new("/dev/ttyUSB1");
    session
        .request_port(&MockChooser::port(port))
        .await
        .unwrap();

    assert!(!old.is_open());
    assert_eq!(old.close_count(), 1);
    assert!(!new.is_open());
    assert_eq!(
        session.status().await.port.map(|x| x.name),
        Some("/dev/ttyUSB1".to_string())
    );
}

#[tokio::test]
async fn disconnect_from_idle() {
    let (session, device) = connected().await;

    session.disconnect().await;
    session.disconnect().await;

    let status = session.status().await;
    assert_eq!(status.mode, Mode::Idle);
    assert_eq!(status.port, None);
    assert!(!device.is_open());
    assert!(matches!(
        session.enter_mode(Mode::Monitoring).await,
        Err(Error::NoPortSelected)
    ));
}

#[tokio::test]
async fn mode_changes_are_observable() {
    let (session, _device) = connected().await;
    let mut rx = session.mode_changes();
    assert_eq!(*rx.borrow_and_update(), Mode::Idle);

    let token = session.enter_mode(Mode::Flashing).await.unwrap();
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), Mode::Flashing);

    session.exit_mode(&token, false).await;
    assert_eq!(*rx.borrow_and_update(), Mode::Idle);
}
