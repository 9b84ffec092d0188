//! Application orchestrator: wires discovery, the sync loop and the console
//! front end together.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tradfri_discovery::{Client as DiscoveryClient, GatewayAddress, GatewayLocator, StaticLocator};
use tradfri_gateway_connection::{
    ConnectionState, CredentialStore, DtlsConnector, GatewayHandle, SecurityCode, SyncEvent,
    SyncLoop, default_credential_path,
};
use tradfri_protocol::{Device, DeviceId, DeviceState};

use crate::config::Config;

/// Runs the indicator until Ctrl-C or `quit`.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let locator: Arc<dyn GatewayLocator> = match config.gateway_host {
        Some(ip) => {
            let address = GatewayAddress::from_ip(ip, config.gateway_port);
            tracing::info!(gateway = %address, "using configured gateway");
            Arc::new(StaticLocator::new(address))
        }
        None => Arc::new(DiscoveryClient::new(config.discovery_timeout())),
    };

    let credentials_path = config
        .credentials_path
        .clone()
        .or_else(default_credential_path)
        .ok_or_else(|| anyhow::anyhow!("cannot locate the credential file, set credentials_path"))?;
    tracing::debug!(path = %credentials_path.display(), "credential store");
    let store = CredentialStore::new(credentials_path);

    let (sync_loop, handle, events) = SyncLoop::new(
        locator,
        Arc::new(DtlsConnector::new()),
        store,
        config.sync_config(),
    );
    let sync_task = tokio::spawn(sync_loop.run());
    let render_task = tokio::spawn(render(events));

    tracing::info!("indicator ready, type `help` for commands");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
        _ = read_input(handle.clone()) => {
            tracing::info!("quit requested");
        }
    }

    handle.shutdown();
    sync_task.await?;
    render_task.abort();
    Ok(())
}

/// Logs every event; this is the indicator's only view.
async fn render(mut events: mpsc::Receiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::DevicesChanged(devices) => {
                tracing::info!(count = devices.len(), "devices");
                for device in &devices {
                    tracing::info!("  {}", describe(device));
                }
            }
            SyncEvent::PairingRequired { gateway_id } => {
                tracing::info!(
                    gateway = %gateway_id,
                    "pairing required: type the security code printed on the gateway"
                );
            }
            SyncEvent::PairingFailed { reason } => {
                tracing::warn!("pairing failed: {reason}");
            }
            SyncEvent::StateChanged(state) => {
                tracing::info!(%state, "connection state");
            }
        }
    }
}

/// One-line summary of a device.
fn describe(device: &Device) -> String {
    let state = match &device.state {
        DeviceState::Light(light) if light.on => format!("on, {}%", light.brightness),
        DeviceState::Light(_) => "off".to_string(),
        DeviceState::Plug(plug) => if plug.on { "on" } else { "off" }.to_string(),
        DeviceState::Blind(blind) => format!("{}% closed", blind.position),
        DeviceState::None => "no controls".to_string(),
    };
    let reachable = if device.reachable { "" } else { " [unreachable]" };
    format!(
        "#{} {} ({}): {state}{reachable}",
        device.id, device.name, device.kind
    )
}

#[derive(Debug, PartialEq)]
enum Input {
    Code(SecurityCode),
    Toggle(DeviceId),
    Dim(DeviceId, u8),
    Reconnect,
    Cancel,
    Help,
    Quit,
}

const HELP: &str = "commands: toggle <id> | dim <id> <0-100> | reconnect | cancel | quit; \
                    while pairing, any other line is taken as the security code";

/// Parses one console line. While pairing, a line that is not a command is
/// the security code.
fn parse_input(line: &str, pairing: bool) -> Result<Input, String> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let id = |word: Option<&&str>| -> Result<DeviceId, String> {
        word.ok_or("missing device id")?
            .parse()
            .map_err(|_| "device id must be a number".to_string())
    };

    match words.as_slice() {
        ["toggle", rest @ ..] => Ok(Input::Toggle(id(rest.first())?)),
        ["dim", rest @ ..] => {
            let device = id(rest.first())?;
            let value = rest
                .get(1)
                .ok_or("missing brightness")?
                .trim_end_matches('%')
                .parse()
                .map_err(|_| "brightness must be 0-100".to_string())?;
            Ok(Input::Dim(device, value))
        }
        ["reconnect"] => Ok(Input::Reconnect),
        ["cancel"] => Ok(Input::Cancel),
        ["help"] => Ok(Input::Help),
        ["quit"] | ["exit"] => Ok(Input::Quit),
        [] => Err("empty line".into()),
        _ if pairing => SecurityCode::parse(line)
            .map(Input::Code)
            .map_err(|e| e.to_string()),
        _ => Err(format!("unknown command `{}`", line.trim())),
    }
}

/// Reads console commands until `quit`. End of input leaves the indicator
/// running.
async fn read_input(handle: GatewayHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("failed to read stdin: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let pairing = handle.state() == ConnectionState::Pairing;
        let input = match parse_input(&line, pairing) {
            Ok(input) => input,
            Err(e) => {
                tracing::warn!("{e}");
                continue;
            }
        };

        let outcome = match input {
            Input::Code(code) => {
                handle.submit_security_code(code).await;
                Ok(())
            }
            Input::Toggle(id) => handle.toggle(id).await,
            Input::Dim(id, value) => handle.set_brightness(id, value).await,
            Input::Reconnect => {
                handle.reconnect().await;
                Ok(())
            }
            Input::Cancel => {
                handle.cancel_pairing().await;
                Ok(())
            }
            Input::Help => {
                tracing::info!("{HELP}");
                Ok(())
            }
            Input::Quit => return,
        };
        if let Err(e) = outcome {
            tracing::warn!("command failed: {e}");
        }
    }
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use tradfri_protocol::{LightState, PlugState};

    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_input("toggle 65537", false), Ok(Input::Toggle(65537)));
        assert_eq!(parse_input("  dim 65537 80% ", false), Ok(Input::Dim(65537, 80)));
        assert_eq!(parse_input("reconnect", true), Ok(Input::Reconnect));
        assert_eq!(parse_input("quit", false), Ok(Input::Quit));
        assert!(parse_input("toggle lamp", false).is_err());
        assert!(parse_input("dim 1", false).is_err());
        assert!(parse_input("dim 1 300", false).is_err());
    }

    #[test]
    fn free_text_is_a_code_only_while_pairing() {
        assert_eq!(
            parse_input("AbCd1234EfGh5678", true),
            Ok(Input::Code(SecurityCode::parse("AbCd1234EfGh5678").unwrap()))
        );
        assert!(parse_input("AbCd1234EfGh5678", false).is_err());
        assert!(parse_input("not a code", true).is_err());
    }

    #[test]
    fn describes_devices() {
        let lamp = Device::new(
            65537,
            "Lamp",
            DeviceState::Light(LightState {
                on: true,
                brightness: 80,
                color: None,
            }),
        );
        assert_eq!(describe(&lamp), "#65537 Lamp (light): on, 80%");

        let mut plug = Device::new(65540, "Heater", DeviceState::Plug(PlugState { on: false }));
        plug.reachable = false;
        assert_eq!(describe(&plug), "#65540 Heater (plug): off [unreachable]");
    }
}
