use std::{cell::Cell, io, rc::Rc, time::Duration};

use color_eyre::Result;
use common::{fast, wait_connected, wait_for, Rig};
use kzooting_link::{
    error::Error,
    poller::PollerState,
    protocol::RequestKind,
    records::{Configs, Info, KeyActions},
    state::{props, Value},
};
use pretty_assertions::assert_eq;

mod common;

#[tokio::test]
async fn connecting_fetches_configs_then_polls() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;

    wait_for(&mut rig.store, props::CONFIGS, |value| {
        value.as_configs() == Some(&Configs::example())
    })
    .await?;
    wait_for(&mut rig.store, props::INFO, |value| {
        value.as_info() == Some(&Info::example())
    })
    .await?;

    assert!(matches!(
        rig.store.get(props::LAST_UPDATE),
        Some(Value::Timestamp(_))
    ));
    assert_eq!(rig.device.requests_seen(RequestKind::Configs), 1);

    rig.shutdown().await
}

#[tokio::test]
async fn io_error_goes_idle_once_and_stops_polling() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;
    wait_for(&mut rig.store, props::INFO, |value| value.as_info().is_some()).await?;

    let idles = Rc::new(Cell::new(0));
    let i = idles.clone();
    rig.store.listen(props::POLLER_STATE, move |value| {
        if value.as_poller_state() == Some(PollerState::Idle) {
            i.set(i.get() + 1);
        }
    });
    assert_eq!(idles.get(), 0);

    rig.device.inject_read_error(io::ErrorKind::BrokenPipe);
    wait_connected(&mut rig.store, false).await?;

    let requests = rig.device.requests_seen(RequestKind::Info);

    // Many poll intervals.
    tokio::time::sleep(Duration::from_millis(150)).await;
    rig.store.dispatch_pending();

    assert_eq!(idles.get(), 1);
    assert_eq!(rig.device.requests_seen(RequestKind::Info), requests);
    assert_eq!(rig.device.open_connections(), 0);
    assert_eq!(rig.store.get(props::INFO), Some(Value::None));
    assert!(matches!(
        rig.store.get(props::ERROR),
        Some(Value::Error(Error::Io(_)))
    ));

    // A new selection starts over.
    rig.connect().await?;
    wait_for(&mut rig.store, props::INFO, |value| value.as_info().is_some()).await?;
    assert!(rig.device.requests_seen(RequestKind::Info) > requests);

    rig.shutdown().await
}

#[tokio::test]
async fn hang_up_is_a_lost_connection() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;

    rig.device.hang_up();
    wait_connected(&mut rig.store, false).await?;

    assert!(matches!(
        rig.store.get(props::ERROR),
        Some(Value::Error(Error::ConnectionLost(_)))
    ));

    rig.shutdown().await
}

#[tokio::test]
async fn silent_device_times_out() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;

    rig.device.set_silent(true);
    wait_connected(&mut rig.store, false).await?;

    let error = rig.store.get(props::ERROR);
    assert!(
        matches!(error, Some(Value::Error(Error::Timeout { millis: 100, .. }))),
        "{error:?}"
    );

    rig.shutdown().await
}

#[tokio::test]
async fn bad_frames_do_not_disconnect() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.device
        .set_noise(["garbage", "{\"message_type\":\"log\",\"text\":\"hello\"}"]);
    rig.connect().await?;

    rig.device
        .inject_line(r#"{"message_type":"info_request_response","temperature":20.0}"#);

    let requests = rig.device.requests_seen(RequestKind::Info);
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.store.dispatch_pending();

    assert_eq!(rig.store.get(props::CONNECTED), Some(Value::Bool(true)));
    assert!(rig.device.requests_seen(RequestKind::Info) > requests);
    assert_eq!(rig.store.get(props::INFO), Some(Value::Info(Info::example())));

    rig.shutdown().await
}

#[tokio::test]
async fn save_writes_configs() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;

    let mut configs = Configs::example();
    configs.general.actuation_point = 1.2;
    configs.key_9 = KeyActions {
        actions: vec![vec!["KC_LCTL".into(), "KC_C".into()], vec![]],
    };

    rig.poller.save_configs(configs.clone()).await?;

    assert_eq!(rig.device.configs(), configs);

    let written = rig
        .device
        .written()
        .into_iter()
        .find(|line| line.starts_with(b"{"))
        .expect("Configs were written");
    let written: serde_json::Value = serde_json::from_slice(&written)?;
    assert!(written.get("message_type").is_none());
    assert_eq!(written["general"]["actuation_point"], serde_json::json!(1.2));

    wait_for(&mut rig.store, props::LAST_SAVE, |value| {
        value.as_timestamp().is_some()
    })
    .await?;

    rig.shutdown().await
}

#[tokio::test]
async fn failed_save_is_reported_and_keeps_the_connection() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;
    rig.device.set_fail_config_writes(true);

    let result = rig.poller.save_configs(Configs::example()).await;
    assert!(matches!(result, Err(Error::WriteFailure(_))));

    wait_for(&mut rig.store, props::ERROR, |value| {
        matches!(value.as_error(), Some(Error::WriteFailure(_)))
    })
    .await?;

    let requests = rig.device.requests_seen(RequestKind::Info);
    tokio::time::sleep(Duration::from_millis(100)).await;
    rig.store.dispatch_pending();

    assert_eq!(rig.store.get(props::CONNECTED), Some(Value::Bool(true)));
    assert!(rig.device.requests_seen(RequestKind::Info) > requests);
    assert_eq!(rig.store.get(props::LAST_SAVE), None);

    rig.shutdown().await
}

#[tokio::test]
async fn refresh_configs_on_demand() -> Result<()> {
    let mut rig = Rig::new(fast());
    rig.connect().await?;
    wait_for(&mut rig.store, props::CONFIGS, |value| {
        value.as_configs().is_some()
    })
    .await?;

    let mut changed = Configs::example();
    changed.general.rapid_trigger = false;
    rig.device.set_configs(changed.clone());

    rig.poller.refresh_configs();

    wait_for(&mut rig.store, props::CONFIGS, |value| {
        value.as_configs() == Some(&changed)
    })
    .await?;
    assert_eq!(rig.device.requests_seen(RequestKind::Configs), 2);

    rig.shutdown().await
}
