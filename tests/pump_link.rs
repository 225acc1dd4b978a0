//! Pump link and controller against a scripted serial transport.

use scale_daq::adapters::{MockTransport, Transport};
use scale_daq::config::SerialConfig;
use scale_daq::pump::{PumpController, PumpDevice, PumpLink};
use scale_daq::{AppResult, DaqError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn serial() -> SerialConfig {
    SerialConfig {
        read_timeout_ms: 5,
        settle_delay_ms: 1,
        ..SerialConfig::default()
    }
}

/// Scripted Series III pump with a 0.001 mL/min head.
fn series_iii() -> MockTransport {
    let running = Arc::new(AtomicBool::new(false));
    MockTransport::with_responder(move |cmd| {
        let reply = match cmd {
            "id" => "OK,Series III/".to_string(),
            "mf" => "OK,MF:10.000/".to_string(),
            "cs" => "OK,5.000,6000,0,PSI,0,1,0/".to_string(),
            "pu" => "OK,PU:PSI/".to_string(),
            "mp" => "OK,MP:6000/".to_string(),
            "ru" => {
                running.store(true, Ordering::SeqCst);
                "OK/".to_string()
            }
            "st" => {
                running.store(false, Ordering::SeqCst);
                "OK/".to_string()
            }
            "pr" if running.load(Ordering::SeqCst) => "OK,0250/".to_string(),
            "pr" => "OK,0000/".to_string(),
            c if c.starts_with("fi") || c.starts_with("uc") => "OK/".to_string(),
            _ => "Er/".to_string(),
        };
        Some(reply)
    })
}

fn controller(mock: &MockTransport) -> PumpController {
    let mock = mock.clone();
    PumpController::with_connector(
        "/dev/ttyUSB0",
        serial(),
        Arc::new(
            move |_: &str, _: &SerialConfig| -> AppResult<Box<dyn Transport>> {
                Ok(Box::new(mock.clone()))
            },
        ),
    )
}

#[tokio::test]
async fn test_controller_session() {
    let mock = series_iii();
    let pump = controller(&mock);
    pump.open().await.unwrap();

    let info = pump.info().await;
    assert_eq!(info.firmware.as_deref(), Some("Series III"));
    assert_eq!(info.flowrate_resolution, Some(0.001));

    pump.set_flowrate(5.0).await.unwrap();
    pump.set_flow_compensation(0.9).await.unwrap();
    assert_eq!(pump.pressure().await, 0);
    pump.run().await.unwrap();
    assert_eq!(pump.pressure().await, 250);
    pump.stop().await.unwrap();
    pump.close().await;

    assert_eq!(
        mock.writes(),
        vec!["id", "mf", "cs", "pu", "mp", "fi05000", "uc0900", "pr", "ru", "pr", "st"]
    );
}

#[test]
fn test_garbled_reply_is_retried_once() {
    let mock = series_iii();
    mock.push_reply("K,02");
    let mut link = PumpLink::with_transport("/dev/ttyUSB0", Box::new(mock.clone()), &serial());
    let reply = link.command("pr").unwrap();
    assert_eq!(reply, "OK,0000/");
    assert_eq!(mock.count("pr"), 2);
}

#[test]
fn test_unknown_command_is_rejected_without_retry() {
    let mock = series_iii();
    let mut link = PumpLink::with_transport("/dev/ttyUSB0", Box::new(mock.clone()), &serial());
    let err = link.command("zz").unwrap_err();
    assert!(matches!(err, DaqError::PumpCommand { .. }));
    assert!(err.is_device_fault());
    assert_eq!(mock.count("zz"), 1);
}

#[tokio::test]
async fn test_unplugged_pump_reads_sentinel_and_reports_closed() {
    let mock = series_iii();
    let pump = controller(&mock);
    pump.open().await.unwrap();
    mock.disconnect();
    assert!(!pump.is_open().await);
    assert_eq!(pump.pressure().await, -1);
    assert!(pump.run().await.is_err());
}
