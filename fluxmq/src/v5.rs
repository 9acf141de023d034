use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use fluxmq_codec::v5::{pid, Connect, ConnectAck, ConnectAckReason, LastWill, PropertyValue};
use fluxmq_net::v5::MqttStream;
use fluxmq_net::MqttError;

use crate::session::{Handler, SessionRegistry, SessionState};
use crate::sink::Sink;
use crate::store::MessageStore;
use crate::types::{Id, Publish};
use crate::v3::assigned_client_id;
use crate::Result;

fn will_publish(lw: &LastWill) -> Publish {
    Publish {
        dup: false,
        retain: lw.retain,
        qos: lw.qos,
        topic: lw.topic.clone(),
        packet_id: None,
        payload: lw.message.clone(),
        properties: Some(lw.properties.clone()),
    }
}

/// Effective session expiry in seconds, capped by configuration. Zero
/// means the session state is discarded at disconnect.
fn session_expiry_secs(requested: u32, configured_max: u64) -> u32 {
    (requested as u64).min(configured_max) as u32
}

/// Runs one broker-side v5 connection to completion.
pub async fn process<Io, H, S>(
    handler: Arc<H>,
    registry: SessionRegistry,
    store: S,
    mut sink: MqttStream<Io>,
) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
    S: MessageStore,
{
    let cfg = sink.cfg.clone();
    let c: Connect = *sink.recv_connect(cfg.handshake_timeout).await.map_err(|e| {
        log::info!("v5 handshake failed, {:?}", e);
        e
    })?;
    log::debug!("new v5 connection: remote_addr: {:?}, connect: {:?}", sink.remote_addr, c);

    if c.client_id.len() > cfg.max_clientid_len {
        let ack = ConnectAck {
            session_present: false,
            reason_code: ConnectAckReason::ClientIdentifierNotValid,
            properties: Default::default(),
        };
        sink.send_connect_ack(ack).await?;
        let _ = sink.close().await;
        return Err(MqttError::IdentifierRejected.into());
    }

    // v5 always accepts an empty client id, the broker assigns one
    let assigned = c.client_id.is_empty();
    let client_id = if assigned { assigned_client_id() } else { c.client_id.clone() };

    let keep_alive = cfg.clamp_keepalive(c.keep_alive);
    let expiry = session_expiry_secs(
        c.session_expiry_interval_secs(),
        cfg.session_expiry_interval.as_secs(),
    );
    let clean_session = expiry == 0;
    let id = Id::new(client_id.clone(), c.username.clone());

    let existed = registry.kick(&client_id, id.clone(), c.clean_start).await?;
    let session_present = !c.clean_start && existed;

    let max_inflight = match c.receive_max() {
        Some(peer_max) => cfg.max_inflight.min(peer_max).get(),
        None => cfg.max_inflight.get(),
    };

    let last_will = c.last_will.as_ref().map(will_publish);
    let mut state =
        SessionState::new(id, cfg.clone(), handler, registry, store, max_inflight, clean_session, last_will);
    if session_present {
        let n = state.resume().await?;
        log::debug!("{} resumed session with {} stored messages", client_id, n);
    } else {
        state.open_clean().await?;
    }

    let mut ack = ConnectAck { session_present, ..Default::default() };
    if assigned {
        ack.properties
            .push(pid::ASSIGNED_CLIENT_IDENTIFIER, PropertyValue::Utf8(client_id.clone()));
    }
    if keep_alive != c.keep_alive {
        ack.properties.push(pid::SERVER_KEEP_ALIVE, PropertyValue::U16(keep_alive));
    }
    ack.properties.push(pid::RECEIVE_MAXIMUM, PropertyValue::U16(max_inflight));
    sink.send_connect_ack(ack).await?;

    state.run(Sink::V5(sink), keep_alive).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_expiry_cap() {
        assert_eq!(session_expiry_secs(0, 7200), 0);
        assert_eq!(session_expiry_secs(60, 7200), 60);
        assert_eq!(session_expiry_secs(u32::MAX, 7200), 7200);
    }
}
