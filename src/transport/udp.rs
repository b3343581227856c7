use embassy_futures::select::{Either, select};
use embassy_net::{
    IpAddress, IpEndpoint, Stack,
    udp::{PacketMetadata, UdpSocket},
};
use heapless::Vec;
use net_dot_clock::{SessionId, ntp::{NTP_PACKET_LEN, SyncCommand}};

use crate::runtime::{EVENTS, Event, SYNC_COMMANDS, SyncMessage};

const LOCAL_PORT: u16 = 123;

#[embassy_executor::task]
pub async fn sntp_task(stack: Stack<'static>) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0; 512];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_buffer = [0; 512];

    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(err) = socket.bind(LOCAL_PORT) {
        log::error!("Binding NTP socket failed: {err:?}");
        return;
    }

    let mut live: Option<SessionId> = None;
    let mut packet = [0u8; 128];
    loop {
        let woken = match live {
            Some(_) => select(SYNC_COMMANDS.receive(), socket.recv_from(&mut packet)).await,
            None => Either::First(SYNC_COMMANDS.receive().await),
        };

        let command = match woken {
            Either::First(command) => command,
            Either::Second(Ok((len, _))) => {
                if let Some(session) = live {
                    let payload = Vec::from_slice(&packet[..len.min(NTP_PACKET_LEN)]).unwrap_or_default();
                    EVENTS
                        .send(Event::Sync(SyncMessage::Received { session, payload }))
                        .await;
                }
                continue;
            }
            Either::Second(Err(err)) => {
                log::debug!("NTP receive failed: {err:?}");
                continue;
            }
        };

        match command {
            SyncCommand::Resolve { session, host } => {
                let address = super::resolve(stack, host).await;
                EVENTS
                    .send(Event::Sync(SyncMessage::Resolved { session, address }))
                    .await;
            }
            SyncCommand::Send {
                session,
                server,
                packet,
            } => {
                live = Some(session);
                let endpoint = IpEndpoint::new(IpAddress::Ipv4(*server.ip()), server.port());
                // A lost request surfaces as the session timeout.
                if let Err(err) = socket.send_to(&packet, endpoint).await {
                    log::warn!("Sending NTP request failed: {err:?}");
                }
            }
            SyncCommand::Release { session } => {
                if live == Some(session) {
                    live = None;
                }
            }
            command => log::debug!("NTP transport ignoring {command:?}"),
        }
    }
}
