//! Keep a mug at drinking temperature
//!
//! Run with: cargo run --example thermostat -- <IDENTIFIER> [--byte-order little|big] [--set TEMP]
//!
//! Without `--set`, scans until the mug is found, then runs the controller and
//! reconnects whenever the connection drops. With `--set`, writes one setpoint
//! (°C, or °F with an `F` suffix such as `131F`), reads it back, and exits. Use `RUST_LOG=mug_control_ble=debug` for protocol
//! details.

use mug_control_ble::capabilities::{resolve, resolve_byte_order};
use mug_control_ble::{
    celsius_to_fahrenheit, fahrenheit_to_celsius, write_setpoint, BleCentral, ByteOrder, ControllerConfig, Discovery,
    Error, GattSession, Reading, Result, Role, SessionOutcome, SessionSupervisor, SetpointCodec,
    StatusEvent, Transport,
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

struct Args {
    identifier: String,
    byte_order: Option<ByteOrder>,
    set: Option<f64>,
}

fn parse_args() -> Result<Args> {
    let mut identifier = None;
    let mut byte_order = None;
    let mut set = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--byte-order" => {
                let value = args.next().unwrap_or_default();
                byte_order = Some(value.parse()?);
            }
            "--set" => set = Some(parse_temperature(&args.next().unwrap_or_default())?),
            _ => identifier = Some(arg),
        }
    }

    let identifier = identifier.ok_or_else(|| Error::InvalidParameter {
        name: "identifier".to_string(),
        value: "missing (run the device_picker example to find one)".to_string(),
    })?;

    Ok(Args {
        identifier,
        byte_order,
        set,
    })
}

/// Parse `55` as °C or `131F` as °F, returning °C.
fn parse_temperature(value: &str) -> Result<f64> {
    let invalid = || Error::InvalidParameter {
        name: "set".to_string(),
        value: value.to_string(),
    };

    match value.strip_suffix(|c| c == 'F' || c == 'f') {
        Some(fahrenheit) => fahrenheit
            .parse()
            .map(fahrenheit_to_celsius)
            .map_err(|_| invalid()),
        None => value
            .trim_end_matches(|c| c == 'C' || c == 'c')
            .parse()
            .map_err(|_| invalid()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = parse_args()?;

    let mut config = ControllerConfig::default().with_target(args.identifier.clone());
    if let Some(order) = args.byte_order {
        config = config.with_byte_order(order);
    }

    let central = Arc::new(BleCentral::new().await?);

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        println!("\nExiting...");
        ctrl_c.cancel();
    });

    let discovery = Discovery::new(central.clone(), &config);
    println!("Looking for {}...", args.identifier);

    if let Some(celsius) = args.set {
        let Some(mug) = discovery.find_target(&cancel).await? else {
            return Ok(());
        };
        return set_once(central.as_ref(), &config, &mug.identifier, celsius).await;
    }

    let supervisor = SessionSupervisor::new(central, config)?;
    tokio::spawn(forward_events(supervisor.subscribe(), print_event));

    loop {
        discovery.ledger().clear();
        let Some(mug) = discovery.find_target(&cancel).await? else {
            break;
        };
        println!("Found {} ({}). Connecting...", mug.display_name(), mug.identifier);

        match supervisor.run(&mug.identifier, &cancel).await {
            SessionOutcome::Cancelled => break,
            SessionOutcome::NoUsableCharacteristics => {
                println!("This peripheral does not look like a mug.");
                break;
            }
            outcome => println!("Session ended ({}), scanning again...", outcome),
        }
    }

    Ok(())
}

/// Write one setpoint and read it back.
async fn set_once(
    central: &BleCentral,
    config: &ControllerConfig,
    identifier: &str,
    celsius: f64,
) -> Result<()> {
    let session = central.connect(identifier, config.connect_timeout).await?;
    let result: Result<()> = async {
        let capabilities = resolve(&session, &config.role_hints).await?;
        let setpoint = capabilities
            .setpoint()
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: config
                    .role_hints
                    .get(Role::Setpoint)
                    .map(|u| u.to_string())
                    .unwrap_or_default(),
            })?;

        let resolution = resolve_byte_order(&session, &capabilities, config).await;
        let codec = SetpointCodec::new(resolution.order);
        println!(
            "Writing {:.2}°C ({} endian, {:?})",
            celsius, resolution.order, resolution.source
        );
        write_setpoint(&session, setpoint, &codec, celsius).await?;

        if setpoint.supports_read {
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            let bytes = session.read(&setpoint.characteristic).await?;
            let read_back = codec.decode_slice(&bytes)?;
            println!(
                "Setpoint now {:.2}°C ({:.1}°F)",
                read_back,
                celsius_to_fahrenheit(read_back)
            );
        }
        Ok(())
    }
    .await;

    session.disconnect().await?;
    result
}

/// Hand every status event to `handle` until the supervisor goes away.
/// A slow consumer skips what it missed and keeps going.
async fn forward_events(
    mut events: broadcast::Receiver<StatusEvent>,
    mut handle: impl FnMut(&StatusEvent),
) {
    loop {
        match events.recv().await {
            Ok(event) => handle(&event),
            Err(RecvError::Lagged(missed)) => println!("({} status updates dropped)", missed),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &StatusEvent) {
    match event {
        StatusEvent::Connected { identifier } => println!("Connected to {}", identifier),
        StatusEvent::CapabilitiesResolved { roles } => println!("Roles: {:?}", roles),
        StatusEvent::ByteOrderResolved(resolution) => println!(
            "Byte order: {} ({:?})",
            resolution.order, resolution.source
        ),
        StatusEvent::MeasuredRead(Reading::Value(celsius)) => println!(
            "Drink: {:.2}°C ({:.1}°F)",
            celsius,
            celsius_to_fahrenheit(*celsius)
        ),
        StatusEvent::MeasuredRead(Reading::Unreadable) => println!("Drink: --"),
        StatusEvent::SetpointChanged { from, to } => match from {
            Some(from) => println!("Target: {:.2}°C -> {:.2}°C", from, to),
            None => println!("Target: {:.2}°C", to),
        },
        StatusEvent::WriteSkipped(reason) => println!("Write skipped: {}", reason),
        StatusEvent::DegradedCapability(role) => println!("Warning: {} unavailable", role),
        StatusEvent::PersistentFault(operation) => {
            println!("Warning: {} keeps failing", operation)
        }
        StatusEvent::SessionEnded(outcome) => println!("Session ended: {}", outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_temperature() {
        assert!((parse_temperature("55").unwrap() - 55.0).abs() < 1e-9);
        assert!((parse_temperature("55C").unwrap() - 55.0).abs() < 1e-9);
        assert!((parse_temperature("131F").unwrap() - 55.0).abs() < 1e-9);
        assert!((parse_temperature("131f").unwrap() - 55.0).abs() < 1e-9);
        assert!(parse_temperature("hot").is_err());
        assert!(parse_temperature("").is_err());
    }

    #[tokio::test]
    async fn test_forwarding_survives_lag() {
        let (tx, rx) = broadcast::channel(1);
        for celsius in [30.0, 35.0, 40.0] {
            tx.send(StatusEvent::MeasuredRead(Reading::Value(celsius)))
                .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        forward_events(rx, |event| seen.push(event.clone())).await;

        assert_eq!(seen, vec![StatusEvent::MeasuredRead(Reading::Value(40.0))]);
    }
}
