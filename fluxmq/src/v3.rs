use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use fluxmq_codec::v3::{Connect, ConnectAckReason, LastWill};
use fluxmq_net::v3::MqttStream;
use fluxmq_net::MqttError;

use crate::session::{Handler, SessionRegistry, SessionState};
use crate::sink::Sink;
use crate::store::MessageStore;
use crate::types::{ClientId, Id, Publish};
use crate::Result;

pub(crate) fn will_publish(lw: &LastWill) -> Publish {
    Publish {
        dup: false,
        retain: lw.retain,
        qos: lw.qos,
        topic: lw.topic.clone(),
        packet_id: None,
        payload: lw.message.clone(),
        properties: None,
    }
}

/// Runs one broker-side v3 connection to completion: CONNECT,
/// CONNACK, then the session loop.
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
        log::info!("v3 handshake failed, {:?}", e);
        e
    })?;
    log::debug!("new v3 connection: remote_addr: {:?}, connect: {:?}", sink.remote_addr, c);

    match accept(&c, cfg.max_clientid_len) {
        Ok(()) => {}
        Err(ack_code) => {
            log::info!("{} connection refused, {:?}", c.client_id, ack_code);
            sink.send_connect_ack(ack_code, false).await?;
            let _ = sink.close().await;
            return Err(MqttError::IdentifierRejected.into());
        }
    }

    let client_id = if c.client_id.is_empty() { assigned_client_id() } else { c.client_id.clone() };
    let keep_alive = cfg.clamp_keepalive(c.keep_alive);
    let id = Id::new(client_id.clone(), c.username.clone());

    let existed = registry.kick(&client_id, id.clone(), c.clean_session).await?;
    let session_present = !c.clean_session && existed;

    let last_will = c.last_will.as_ref().map(will_publish);
    let max_inflight = cfg.max_inflight.get();
    let mut state =
        SessionState::new(id, cfg, handler, registry, store, max_inflight, c.clean_session, last_will);
    if session_present {
        let n = state.resume().await?;
        log::debug!("{} resumed session with {} stored messages", client_id, n);
    } else {
        state.open_clean().await?;
    }

    sink.send_connect_ack(ConnectAckReason::ConnectionAccepted, session_present).await?;
    state.run(Sink::V3(sink), keep_alive).await
}

fn accept(c: &Connect, max_clientid_len: usize) -> std::result::Result<(), ConnectAckReason> {
    if c.client_id.is_empty() {
        // an assigned client id needs clean_session, there is no state
        // to key a resumed session on
        if !(c.clean_session && c.protocol.level() >= 4) {
            return Err(ConnectAckReason::IdentifierRejected);
        }
    } else if c.client_id.len() > max_clientid_len {
        return Err(ConnectAckReason::IdentifierRejected);
    }
    Ok(())
}

pub(crate) fn assigned_client_id() -> ClientId {
    ClientId::from(Uuid::new_v4().as_simple().encode_lower(&mut Uuid::encode_buffer()).to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxmq_codec::types::Protocol;

    fn connect(client_id: &str, clean_session: bool, level: u8) -> Connect {
        Connect {
            protocol: Protocol(level),
            clean_session,
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_accept_rules() {
        assert!(accept(&connect("c1", false, 4), 65535).is_ok());
        // empty id allowed only with clean session on 3.1.1+
        assert!(accept(&connect("", true, 4), 65535).is_ok());
        assert!(accept(&connect("", false, 4), 65535).is_err());
        assert!(accept(&connect("", true, 3), 65535).is_err());
        // client id length cap
        assert!(accept(&connect("toolong", false, 4), 3).is_err());
    }

    #[test]
    fn test_assigned_client_id_unique() {
        let a = assigned_client_id();
        let b = assigned_client_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
