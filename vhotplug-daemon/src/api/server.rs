//! API server: newline-JSON request/response plus event notifications.
//!
//! Each enabled transport gets its own listener task; each accepted client
//! gets its own task that reads one JSON object per line, routes it through
//! the orchestrator's mailbox and writes back one reply line. A client that
//! sent `enable_notifications` also receives every published event in
//! orchestrator commit order. Slow consumers are disconnected: falling
//! behind the bounded event buffer or blocking a write past its deadline
//! drops the client, never daemon state.

use crate::orchestrator::{ApiCommand, ApiData, ApiRequest};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_vsock::{VsockAddr, VsockListener, VMADDR_CID_ANY};
use tracing::{debug, info, warn};
use vhotplug_core::protocol::{
    error_response, failed_response, ok_response, ok_response_with, Notification, Request,
    RequestError,
};
use vhotplug_core::{ApiConfig, Error, Result, Transport};

/// Deadline for writing one line to a client.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Bind all configured transports and start serving.
pub async fn serve(
    config: ApiConfig,
    commands: mpsc::Sender<ApiRequest>,
    notifications: broadcast::Sender<Notification>,
) -> Result<()> {
    if config.transports.is_empty() {
        warn!("API enabled but no transports configured");
    }
    for transport in &config.transports {
        match transport {
            Transport::Tcp => {
                let port = u16::try_from(config.port).map_err(|_| Error::ConfigInvalid {
                    reason: format!("TCP port {} out of range", config.port),
                })?;
                let listener = TcpListener::bind((config.host.as_str(), port))
                    .await
                    .map_err(|e| Error::Io {
                        path: format!("{}:{}", config.host, port),
                        source: e,
                    })?;
                info!("API server listening on tcp {}:{}", config.host, port);
                tokio::spawn(accept_tcp(listener, commands.clone(), notifications.clone()));
            }
            Transport::Unix => {
                let path = config.unix_socket.clone();
                if path.exists() {
                    std::fs::remove_file(&path).map_err(|e| Error::Io {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                }
                let listener = UnixListener::bind(&path).map_err(|e| Error::Io {
                    path: path.display().to_string(),
                    source: e,
                })?;
                info!("API server listening on unix socket {}", path.display());
                tokio::spawn(accept_unix(listener, commands.clone(), notifications.clone()));
            }
            Transport::Vsock => {
                let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, config.port))
                    .map_err(|e| Error::Io {
                        path: format!("vsock port {}", config.port),
                        source: e,
                    })?;
                info!("API server listening on vsock port {}", config.port);
                tokio::spawn(accept_vsock(
                    listener,
                    config.allowed_cids.clone(),
                    commands.clone(),
                    notifications.clone(),
                ));
            }
        }
    }
    Ok(())
}

async fn accept_tcp(
    listener: TcpListener,
    commands: mpsc::Sender<ApiRequest>,
    notifications: broadcast::Sender<Notification>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("API client connected: {}", peer);
                tokio::spawn(handle_client(
                    stream,
                    peer.to_string(),
                    commands.clone(),
                    notifications.clone(),
                ));
            }
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_unix(
    listener: UnixListener,
    commands: mpsc::Sender<ApiRequest>,
    notifications: broadcast::Sender<Notification>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                debug!("API client connected on unix socket");
                tokio::spawn(handle_client(
                    stream,
                    "unix".to_string(),
                    commands.clone(),
                    notifications.clone(),
                ));
            }
            Err(e) => {
                warn!("unix accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_vsock(
    mut listener: VsockListener,
    allowed_cids: Option<Vec<u32>>,
    commands: mpsc::Sender<ApiRequest>,
    notifications: broadcast::Sender<Notification>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Some(allowed) = &allowed_cids {
                    if !allowed.contains(&peer.cid()) {
                        warn!("rejected vsock client with CID {}", peer.cid());
                        continue;
                    }
                }
                debug!("API client connected: vsock cid {}", peer.cid());
                tokio::spawn(handle_client(
                    stream,
                    format!("vsock:{}", peer.cid()),
                    commands.clone(),
                    notifications.clone(),
                ));
            }
            Err(e) => {
                warn!("vsock accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Wait on the subscription, or forever when the client never subscribed.
async fn next_notification(
    rx: &mut Option<broadcast::Receiver<Notification>>,
) -> std::result::Result<Notification, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn handle_client<S>(
    stream: S,
    peer: String,
    commands: mpsc::Sender<ApiRequest>,
    notifications: broadcast::Sender<Notification>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut subscription: Option<broadcast::Receiver<Notification>> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        debug!("API client disconnected: {}", peer);
                        break;
                    }
                    Err(e) => {
                        debug!("API client {} read failed: {}", peer, e);
                        break;
                    }
                };
                let response = dispatch(&line, &peer, &commands, &mut subscription, &notifications).await;
                if write_line(&mut write, &response, &peer).await.is_err() {
                    break;
                }
            }
            notification = next_notification(&mut subscription) => {
                match notification {
                    Ok(notification) => {
                        if write_line(&mut write, &notification.to_json(), &peer).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("API client {} lagged {} events, disconnecting", peer, n);
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(
    write: &mut W,
    value: &Value,
    peer: &str,
) -> std::io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    match tokio::time::timeout(WRITE_DEADLINE, write.write_all(line.as_bytes())).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("API client {} write failed: {}", peer, e);
            Err(e)
        }
        Err(_) => {
            warn!("API client {} blocked past write deadline, disconnecting", peer);
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline"))
        }
    }
}

async fn dispatch(
    line: &str,
    peer: &str,
    commands: &mpsc::Sender<ApiRequest>,
    subscription: &mut Option<broadcast::Receiver<Notification>>,
    notifications: &broadcast::Sender<Notification>,
) -> Value {
    let request = match Request::parse(line) {
        Ok(request) => request,
        Err(e @ RequestError::InvalidJson) => {
            warn!("invalid JSON from {}: {}", peer, line);
            return failed_response(&e.message());
        }
        Err(e @ RequestError::UnknownAction(_)) => {
            warn!("unknown API action from {}: {}", peer, line);
            return failed_response(&e.message());
        }
        Err(e) => return failed_response(&e.message()),
    };
    info!("API request {:?} from {}", request, peer);

    let command = match request {
        Request::EnableNotifications => {
            if subscription.is_none() {
                *subscription = Some(notifications.subscribe());
            }
            return ok_response();
        }
        Request::UsbList => ApiCommand::UsbList,
        Request::UsbAttach { selector, vm } => ApiCommand::UsbAttach { selector, vm },
        Request::UsbDetach { selector } => ApiCommand::UsbDetach { selector },
        Request::PciList => ApiCommand::PciList,
        Request::PciAttach { selector, vm } => ApiCommand::PciAttach { selector, vm },
        Request::PciDetach { selector } => ApiCommand::PciDetach { selector },
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if commands.send(ApiRequest { command, reply: reply_tx }).await.is_err() {
        return failed_response("daemon is shutting down");
    }
    match reply_rx.await {
        Ok(Ok(ApiData::None)) => ok_response(),
        Ok(Ok(ApiData::UsbDevices(devices))) => ok_response_with("usb_devices", json!(devices)),
        Ok(Ok(ApiData::PciDevices(devices))) => ok_response_with("pci_devices", json!(devices)),
        Ok(Err(e)) => error_response(&e),
        Err(_) => failed_response("daemon is shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhotplug_core::protocol::UsbDeviceJson;

    /// Answers every command with a canned reply.
    fn stub_orchestrator(reply_with: fn(ApiCommand) -> crate::orchestrator::ApiReply) -> mpsc::Sender<ApiRequest> {
        let (tx, mut rx) = mpsc::channel::<ApiRequest>(8);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let _ = request.reply.send(reply_with(request.command));
            }
        });
        tx
    }

    async fn client() -> (
        tokio::io::DuplexStream,
        mpsc::Sender<ApiRequest>,
        broadcast::Sender<Notification>,
    ) {
        let (local, remote) = tokio::io::duplex(4096);
        let commands = stub_orchestrator(|command| match command {
            ApiCommand::UsbList => Ok(ApiData::UsbDevices(vec![])),
            ApiCommand::UsbAttach { selector, .. } => {
                Err(vhotplug_core::Error::Ambiguous { selector: selector.to_string(), count: 2 })
            }
            _ => Ok(ApiData::None),
        });
        let (notify_tx, _) = broadcast::channel(16);
        tokio::spawn(handle_client(
            remote,
            "test".to_string(),
            commands.clone(),
            notify_tx.clone(),
        ));
        (local, commands, notify_tx)
    }

    async fn read_line(local: &mut tokio::io::DuplexStream) -> Value {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            local.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        serde_json::from_slice(&buf).unwrap()
    }

    async fn send_and_read(local: &mut tokio::io::DuplexStream, line: &str) -> Value {
        local.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
        read_line(local).await
    }

    #[tokio::test]
    async fn malformed_json_keeps_the_connection_open() {
        let (mut local, _commands, _notify) = client().await;

        let response = send_and_read(&mut local, "this is not json").await;
        assert_eq!(response["result"], "failed");
        assert_eq!(response["error"], "invalid json");

        // Connection still serves requests
        let response = send_and_read(&mut local, r#"{"action":"usb_list"}"#).await;
        assert_eq!(response["result"], "ok");
        assert!(response["usb_devices"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_action_is_reported() {
        let (mut local, _commands, _notify) = client().await;
        let response = send_and_read(&mut local, r#"{"action":"usb_eject"}"#).await;
        assert_eq!(response["result"], "failed");
        assert_eq!(response["error"], "unknown action");
    }

    #[tokio::test]
    async fn notifications_flow_after_enable() {
        let (mut local, _commands, notify) = client().await;

        let response = send_and_read(&mut local, r#"{"action":"enable_notifications"}"#).await;
        assert_eq!(response["result"], "ok");

        let device = UsbDeviceJson {
            device_node: "/dev/bus/usb/001/004".into(),
            vid: Some("046d".into()),
            pid: Some("c077".into()),
            vendor_name: None,
            product_name: None,
            bus: Some(1),
            port: Some("2".into()),
            allowed_vms: None,
            vm: None,
        };
        notify.send(Notification::UsbConnected(device)).unwrap();

        let event = read_line(&mut local).await;
        assert_eq!(event["event"], "usb_connected");
        assert_eq!(event["usb_device"]["device_node"], "/dev/bus/usb/001/004");
    }

    #[tokio::test]
    async fn no_notifications_without_enable() {
        let (mut local, _commands, notify) = client().await;

        let _ = notify.send(Notification::UsbConnected(UsbDeviceJson {
            device_node: "/dev/bus/usb/001/004".into(),
            vid: None,
            pid: None,
            vendor_name: None,
            product_name: None,
            bus: None,
            port: None,
            allowed_vms: None,
            vm: None,
        }));

        // The next reply must be the usb_list response, not the event.
        let response = send_and_read(&mut local, r#"{"action":"usb_list"}"#).await;
        assert_eq!(response["result"], "ok");
    }

    #[tokio::test]
    async fn ambiguous_attach_reports_short_error_text() {
        let (mut local, _commands, _notify) = client().await;
        let response = send_and_read(
            &mut local,
            r#"{"action":"usb_attach","vid":"1111","pid":"2222","vm":"vm1"}"#,
        )
        .await;
        assert_eq!(response["result"], "failed");
        assert_eq!(response["error"], "ambiguous");
    }

    #[tokio::test]
    async fn bad_selector_is_a_failed_reply() {
        let (mut local, _commands, _notify) = client().await;
        let response =
            send_and_read(&mut local, r#"{"action":"usb_attach","vm":"vm1"}"#).await;
        assert_eq!(response["result"], "failed");
    }
}
