use core::net::SocketAddrV4;

use embassy_futures::select::{Either, select};
use embassy_net::{
    IpAddress, IpEndpoint, Stack,
    tcp::{ConnectError, Error as TcpError, TcpSocket},
};
use embassy_time::{Duration, with_timeout};
use embedded_io_async::Write;
use heapless::Vec;
use net_dot_clock::{
    SessionId,
    ota::{TransportError, UpgradeCommand},
};

use crate::runtime::{CHUNK_LEN, EVENTS, Event, UPGRADE_COMMANDS, UpgradeMessage};

const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Owns the one TCP socket used for updates; `Reconnect` connects that same
/// socket again to the server of the session's `Connect`.
#[embassy_executor::task]
pub async fn upgrade_task(stack: Stack<'static>) {
    let mut rx_buffer = [0u8; 4096];
    let mut tx_buffer = [0u8; 512];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
    socket.set_timeout(Some(SOCKET_TIMEOUT));
    let mut server: Option<SocketAddrV4> = None;

    loop {
        match UPGRADE_COMMANDS.receive().await {
            UpgradeCommand::Resolve { session, host } => {
                let address = super::resolve(stack, host).await;
                post(UpgradeMessage::Resolved { session, address }).await;
            }
            UpgradeCommand::Connect {
                session,
                server: address,
            } => {
                server = Some(address);
                exchange(&mut socket, session, address).await;
            }
            UpgradeCommand::Reconnect { session } => match server {
                Some(address) => exchange(&mut socket, session, address).await,
                None => {
                    let error = TransportError::Closed;
                    post(UpgradeMessage::ConnectionError { session, error }).await;
                }
            },
            UpgradeCommand::Release { .. } => server = None,
            command => log::debug!("Upgrade transport idle, ignoring {command:?}"),
        }
    }
}

/// Runs one connection until it closes, posting what happens on it. The
/// socket is left closed.
async fn exchange(socket: &mut TcpSocket<'_>, session: SessionId, server: SocketAddrV4) {
    let endpoint = IpEndpoint::new(IpAddress::Ipv4(*server.ip()), server.port());
    if let Err(err) = socket.connect(endpoint).await {
        log::debug!("Connecting to {server} failed: {err:?}");
        socket.abort();
        let error = match err {
            ConnectError::ConnectionReset => TransportError::Refused,
            ConnectError::TimedOut => TransportError::TimedOut,
            ConnectError::NoRoute => TransportError::NoRoute,
            #[allow(unreachable_patterns)]
            _ => TransportError::Other,
        };
        post(UpgradeMessage::ConnectionError { session, error }).await;
        return;
    }
    post(UpgradeMessage::Connected { session }).await;

    let mut chunk = [0u8; CHUNK_LEN];
    loop {
        let woken = select(UPGRADE_COMMANDS.receive(), socket.read(&mut chunk)).await;
        match woken {
            Either::First(UpgradeCommand::Send { request, .. }) => {
                if let Err(err) = socket.write_all(request.as_bytes()).await {
                    log::debug!("Sending request failed: {err:?}");
                    socket.abort();
                    let error = transport_error(err);
                    post(UpgradeMessage::ConnectionError { session, error }).await;
                    return;
                }
            }
            Either::First(UpgradeCommand::Disconnect { .. }) => {
                socket.close();
                let _ = with_timeout(CLOSE_TIMEOUT, socket.flush()).await;
                socket.abort();
                post(UpgradeMessage::Disconnected { session }).await;
                return;
            }
            Either::First(UpgradeCommand::Release { .. }) => {
                socket.abort();
                return;
            }
            Either::First(command) => log::debug!("Ignoring {command:?} on open connection"),
            Either::Second(Ok(0)) => {
                socket.abort();
                post(UpgradeMessage::Disconnected { session }).await;
                return;
            }
            Either::Second(Ok(len)) => {
                let data = Vec::from_slice(&chunk[..len]).unwrap_or_default();
                post(UpgradeMessage::Received { session, data }).await;
            }
            Either::Second(Err(err)) => {
                socket.abort();
                let error = transport_error(err);
                post(UpgradeMessage::ConnectionError { session, error }).await;
                return;
            }
        }
    }
}

fn transport_error(err: TcpError) -> TransportError {
    match err {
        TcpError::ConnectionReset => TransportError::Reset,
        #[allow(unreachable_patterns)]
        _ => TransportError::Other,
    }
}

async fn post(message: UpgradeMessage) {
    EVENTS.send(Event::Upgrade(message)).await;
}
