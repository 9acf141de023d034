use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytestring::ByteString;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use fluxmq_codec::error::{EncodeError, SendPacketError};
use fluxmq_codec::types::QoS;
use fluxmq_codec::v3;
use fluxmq_codec::v5;
use fluxmq_codec::v5::{
    SubscribeAck, SubscribeAckReason, ToReasonCode, UnsubscribeAck, UnsubscribeAckReason,
};
use fluxmq_net::{Builder, MqttError};

use crate::delivery::{Action, DeliveryState, Event};
use crate::sink::{Packet, Sink};
use crate::store::{MessageStore, StoreHandle, StoredMessage};
use crate::topic::{pub_topic_check, sub_topic_check};
use crate::types::{ClientId, Disconnect, From, Id, Message, Publish, Reason};
use crate::{Error, Result};

pub type SessionTx = mpsc::UnboundedSender<Message>;
pub type SessionRx = mpsc::UnboundedReceiver<Message>;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const Ping                = 0b0000_0001;
        const Kicked              = 0b0000_0010;
        const CleanStart          = 0b0000_0100;
        const DisconnectReceived  = 0b0000_1000;
    }
}

/// Application-side callbacks a session drives: routing inbound
/// messages, accounting for completed or dropped deliveries, and
/// granting subscriptions.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn message_received(&self, id: &Id, from: From, publish: Publish) -> Result<()>;

    async fn message_acked(&self, _id: &Id, _from: From, _publish: &Publish) {}

    async fn message_dropped(&self, _id: Option<&Id>, _from: From, _publish: Publish, _reason: Reason) {
    }

    /// Returns the granted QoS for one filter.
    async fn subscribe(&self, _id: &Id, _filter: &ByteString, qos: QoS) -> Result<QoS> {
        Ok(qos)
    }

    async fn unsubscribe(&self, _id: &Id, _filter: &ByteString) -> Result<()> {
        Ok(())
    }
}

/// Live sessions by client id, used for message forwarding and
/// connection takeover.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ClientId, SessionTx, ahash::RandomState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn register(&self, client_id: ClientId, tx: SessionTx) {
        self.sessions.insert(client_id, tx);
    }

    /// Removes the entry only if `tx` is still the registered sender,
    /// so a takeover's registration survives the old session's exit.
    #[inline]
    pub fn unregister(&self, client_id: &ClientId, tx: &SessionTx) {
        self.sessions.remove_if(client_id, |_, cur| cur.same_receiver(tx));
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<SessionTx> {
        self.sessions.get(client_id).map(|tx| tx.clone())
    }

    #[inline]
    pub fn forward(&self, client_id: &ClientId, from: From, publish: Publish) -> bool {
        if let Some(tx) = self.get(client_id) {
            tx.unbounded_send(Message::Forward(from, publish)).is_ok()
        } else {
            false
        }
    }

    /// Asks the session registered under `client_id` to step aside and
    /// waits until it has parked its pending state. Returns whether a
    /// previous session existed.
    pub async fn kick(&self, client_id: &ClientId, by: Id, clean_start: bool) -> Result<bool> {
        let Some((_, tx)) = self.sessions.remove(client_id) else {
            return Ok(false);
        };
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if tx.unbounded_send(Message::Kick(reply_tx, by, clean_start)).is_err() {
            // session task already gone
            return Ok(false);
        }
        match tokio::time::timeout(Duration::from_secs(10), reply_rx).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(_)) => Ok(false),
            Err(_) => Err(MqttError::ServiceUnavailable.into()),
        }
    }
}

/// Broker-side keepalive deadline: the connection is dropped when no
/// control packet arrives for 1.5x the negotiated keepalive.
#[inline]
pub fn keep_alive_interval(cfg: &Builder, keep_alive: u16) -> Duration {
    if keep_alive == 0 {
        return Duration::from_secs(u32::MAX as u64);
    }
    let secs = if keep_alive < 6 {
        keep_alive + 3
    } else {
        ((keep_alive as f32 * cfg.keepalive_backoff) * 2.0) as u16
    };
    Duration::from_secs(secs as u64)
}

pub struct SessionState<H, S>
where
    S: MessageStore,
{
    pub id: Id,
    pub cfg: Arc<Builder>,
    tx: SessionTx,
    rx: SessionRx,
    engine: DeliveryState,
    handler: Arc<H>,
    registry: SessionRegistry,
    store: S,
    handle: Option<S::Handle>,
    subscriptions: std::collections::HashMap<ByteString, QoS, ahash::RandomState>,
    last_will: Option<Publish>,
    clean_session: bool,
}

impl<H, S> SessionState<H, S>
where
    H: Handler,
    S: MessageStore,
{
    /// `max_inflight` is the negotiated outbound window, normally the
    /// smaller of the configured bound and the peer's receive maximum.
    pub fn new(
        id: Id,
        cfg: Arc<Builder>,
        handler: Arc<H>,
        registry: SessionRegistry,
        store: S,
        max_inflight: u16,
        clean_session: bool,
        last_will: Option<Publish>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded();
        let engine = DeliveryState::new(
            max_inflight,
            cfg.max_mqueue_len,
            cfg.message_retry_interval.as_millis() as i64,
            cfg.message_expiry_interval.as_millis() as i64,
            0,
        );
        Self {
            id,
            cfg,
            tx,
            rx,
            engine,
            handler,
            registry,
            store,
            handle: None,
            subscriptions: std::collections::HashMap::default(),
            last_will,
            clean_session,
        }
    }

    #[inline]
    pub fn sender(&self) -> SessionTx {
        self.tx.clone()
    }

    /// Opens this session's store queue, revoking any handle a previous
    /// incarnation held, and readmits the persisted messages.
    pub async fn resume(&mut self) -> Result<usize> {
        let handle = self.store.open(&self.id.client_id).await?;
        let entries = handle.iter().await?;
        let n = entries.len();
        for entry in entries {
            match entry {
                StoredMessage::Inflight(msg) => self.engine.restore_inflight(msg),
                StoredMessage::Queued(from, publish) => self.engine.restore_queued(from, publish),
            }
        }
        self.handle = Some(handle);
        Ok(n)
    }

    /// Opens a fresh store queue and discards anything a previous
    /// incarnation left behind.
    pub async fn open_clean(&mut self) -> Result<()> {
        let handle = self.store.open(&self.id.client_id).await?;
        handle.invalidate().await?;
        self.handle = Some(self.store.open(&self.id.client_id).await?);
        Ok(())
    }

    pub async fn run<Io>(mut self, mut sink: Sink<Io>, keep_alive: u16) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        self.registry.register(self.id.client_id.clone(), self.tx.clone());
        let mut flags = StateFlags::empty();

        // redeliver what the previous incarnation left unresolved
        let pending = self.engine.handle(Event::Reconnected);
        let start = self.perform(&mut sink, pending).await;

        let reason = match start {
            Ok(()) => self.run_loop(&mut sink, keep_alive, &mut flags).await.err(),
            Err(reason) => Some(reason),
        };

        if let Some(reason) = &reason {
            log::info!("{:?} session stopped, {}", self.id, reason);
            if let Sink::V5(s) = &mut sink {
                let _ = s
                    .send_disconnect(v5::Disconnect::new(reason.to_reason_code()))
                    .await;
            }
        }
        let _ = sink.close().await;

        if self.last_will_enable(flags) {
            self.publish_last_will().await;
        }

        let keep = !self.clean_session && !flags.contains(StateFlags::CleanStart);
        if flags.contains(StateFlags::Kicked) {
            // pending state was parked during the kick and now belongs
            // to the successor session, leave the store queue alone
        } else if keep {
            if let Err(e) = self.park().await {
                log::warn!("{:?} park session state failed, {:?}", self.id, e);
            }
        } else if let Some(handle) = self.handle.take() {
            let _ = handle.invalidate().await;
        }

        self.registry.unregister(&self.id.client_id, &self.tx);
        Ok(())
    }

    async fn run_loop<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        keep_alive: u16,
        flags: &mut StateFlags,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let keep_alive_interval = keep_alive_interval(&self.cfg, keep_alive);
        log::debug!("{:?} keep_alive_interval is {:?}", self.id, keep_alive_interval);
        let keep_alive_delay = tokio::time::sleep(keep_alive_interval);
        let retry_delay = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(keep_alive_delay);
        tokio::pin!(retry_delay);

        loop {
            retry_delay.as_mut().reset(
                Instant::now()
                    + self.engine.retry_timeout().unwrap_or_else(|| Duration::from_secs(120)),
            );

            tokio::select! {
                _ = &mut keep_alive_delay => {
                    return Err(Reason::ConnectKeepaliveTimeout);
                },

                _ = &mut retry_delay => {
                    let actions = self.engine.handle(Event::RetryTick);
                    self.perform(sink, actions).await?;
                },

                msg = self.rx.next() => {
                    match msg {
                        Some(msg) => self.process_message(sink, msg, flags).await?,
                        None => return Err("session mailbox is closed".into()),
                    }
                },

                pkt = sink.recv() => {
                    // every control packet re-arms the keepalive deadline
                    keep_alive_delay.as_mut().reset(Instant::now() + keep_alive_interval);
                    match pkt.map_err(|e| Reason::from(e.to_string()))? {
                        Some(pkt) => {
                            if self.process_packet(sink, pkt, flags).await? {
                                return Ok(());
                            }
                        },
                        None => return Err(Reason::ConnectRemoteClose),
                    }
                }
            }
        }
    }

    async fn process_message<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        msg: Message,
        flags: &mut StateFlags,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match msg {
            Message::Forward(from, publish) => {
                let actions = self.engine.enqueue(from, publish);
                self.perform(sink, actions).await?;
            }
            Message::Kick(sender, by_id, clean_start) => {
                log::debug!("{:?} kicked by {:?}, clean_start: {}", self.id, by_id, clean_start);
                flags.insert(StateFlags::Kicked);
                if clean_start {
                    flags.insert(StateFlags::CleanStart);
                } else if let Err(e) = self.park().await {
                    log::warn!("{:?} park on kick failed, {:?}", self.id, e);
                }
                if sender.send(()).is_err() {
                    log::warn!("{:?} kick reply failed, sender is closed", self.id);
                }
                return Err(Reason::ConnectKicked);
            }
        }
        Ok(())
    }

    /// Returns `Ok(true)` when the peer disconnected cleanly.
    async fn process_packet<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        pkt: Packet,
        flags: &mut StateFlags,
    ) -> std::result::Result<bool, Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match pkt {
            Packet::V3(v3::Packet::Publish(publish)) | Packet::V5(v5::Packet::Publish(publish)) => {
                self.process_publish(sink, publish).await?;
            }

            Packet::V3(v3::Packet::PublishAck { packet_id }) => {
                let actions = self.engine.handle(Event::PubAck { packet_id, reason: 0 });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishAck(ack)) => {
                let actions = self.engine.handle(Event::PubAck {
                    packet_id: ack.packet_id,
                    reason: ack.reason_code.into(),
                });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishReceived { packet_id }) => {
                let actions = self.engine.handle(Event::PubRec { packet_id, reason: 0 });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishReceived(ack)) => {
                let actions = self.engine.handle(Event::PubRec {
                    packet_id: ack.packet_id,
                    reason: ack.reason_code.into(),
                });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishRelease { packet_id }) => {
                let actions = self.engine.handle(Event::PubRel { packet_id });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishRelease(ack2)) => {
                let actions = self.engine.handle(Event::PubRel { packet_id: ack2.packet_id });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishComplete { packet_id }) => {
                let actions = self.engine.handle(Event::PubComp { packet_id });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishComplete(ack2)) => {
                let actions = self.engine.handle(Event::PubComp { packet_id: ack2.packet_id });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::Subscribe { packet_id, topic_filters }) => {
                let mut status = Vec::with_capacity(topic_filters.len());
                for (filter, qos) in topic_filters {
                    status.push(match self.subscribe(&filter, qos).await {
                        Ok(granted) => v3::SubscribeReturnCode::Success(granted),
                        Err(e) => {
                            log::info!("{:?} subscribe `{}` rejected, {:?}", self.id, filter, e);
                            v3::SubscribeReturnCode::Failure
                        }
                    });
                }
                sink.v3_mut()
                    .send_subscribe_ack(packet_id, status)
                    .await
                    .map_err(|e| Reason::from(e.to_string()))?;
            }
            Packet::V5(v5::Packet::Subscribe(subs)) => {
                let mut status = Vec::with_capacity(subs.topic_filters.len());
                for (filter, opts) in subs.topic_filters {
                    status.push(match self.subscribe(&filter, opts.qos).await {
                        Ok(granted) => match granted.value() {
                            0 => SubscribeAckReason::GrantedQos0,
                            1 => SubscribeAckReason::GrantedQos1,
                            _ => SubscribeAckReason::GrantedQos2,
                        },
                        Err(e) => {
                            log::info!("{:?} subscribe `{}` rejected, {:?}", self.id, filter, e);
                            SubscribeAckReason::TopicFilterInvalid
                        }
                    });
                }
                sink.v5_mut()
                    .send_subscribe_ack(SubscribeAck {
                        packet_id: subs.packet_id,
                        properties: v5::Properties::default(),
                        status,
                    })
                    .await
                    .map_err(|e| Reason::from(e.to_string()))?;
            }

            Packet::V3(v3::Packet::Unsubscribe { packet_id, topic_filters }) => {
                for filter in topic_filters {
                    self.unsubscribe(&filter).await;
                }
                sink.v3_mut()
                    .send_unsubscribe_ack(packet_id)
                    .await
                    .map_err(|e| Reason::from(e.to_string()))?;
            }
            Packet::V5(v5::Packet::Unsubscribe(unsubs)) => {
                let mut status = Vec::with_capacity(unsubs.topic_filters.len());
                for filter in unsubs.topic_filters {
                    status.push(if self.unsubscribe(&filter).await {
                        UnsubscribeAckReason::Success
                    } else {
                        UnsubscribeAckReason::NoSubscriptionExisted
                    });
                }
                sink.v5_mut()
                    .send_unsubscribe_ack(UnsubscribeAck {
                        packet_id: unsubs.packet_id,
                        properties: v5::Properties::default(),
                        status,
                    })
                    .await
                    .map_err(|e| Reason::from(e.to_string()))?;
            }

            Packet::V3(v3::Packet::PingRequest) | Packet::V5(v5::Packet::PingRequest) => {
                sink.send_ping_response().await.map_err(|e| Reason::from(e.to_string()))?;
                flags.insert(StateFlags::Ping);
            }

            Packet::V3(v3::Packet::Disconnect) => {
                flags.insert(StateFlags::DisconnectReceived);
                return Ok(true);
            }
            Packet::V5(v5::Packet::Disconnect(d)) => {
                flags.insert(StateFlags::DisconnectReceived);
                let d = Disconnect::V5(d);
                if let Some(expiry) = d.session_expiry_interval() {
                    self.clean_session = expiry.is_zero();
                }
                return Ok(true);
            }

            pkt => {
                return Err(Reason::ProtocolError(
                    format!("received an unexpected packet, {:?}", pkt).into(),
                ));
            }
        }
        Ok(false)
    }

    async fn process_publish<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        publish: Publish,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = pub_topic_check(&publish.topic, self.cfg.max_topic_levels) {
            return Err(Reason::ProtocolError(e.to_string().into()));
        }
        let from = From::Client(self.id.clone());
        let actions = self.engine.handle(Event::Publish(from, publish));
        self.perform(sink, actions).await
    }

    async fn subscribe(&mut self, filter: &ByteString, qos: QoS) -> Result<QoS> {
        sub_topic_check(filter, self.cfg.max_topic_levels)?;
        let granted = self.handler.subscribe(&self.id, filter, qos).await?;
        self.subscriptions.insert(filter.clone(), granted);
        Ok(granted)
    }

    async fn unsubscribe(&mut self, filter: &ByteString) -> bool {
        if let Err(e) = self.handler.unsubscribe(&self.id, filter).await {
            log::warn!("{:?} unsubscribe `{}` failed, {:?}", self.id, filter, e);
        }
        self.subscriptions.remove(filter).is_some()
    }

    /// Carries out the engine's decisions on the wire and toward the
    /// handler. An oversize encode failure feeds back into the engine
    /// so the one message is dropped without tearing the session down.
    async fn perform<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        actions: Vec<Action>,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut work: VecDeque<Action> = actions.into();
        while let Some(action) = work.pop_front() {
            let res = match action {
                Action::SendPublish(publish) => {
                    let packet_id = publish.packet_id;
                    match sink.send_publish(publish).await {
                        Err(e) if is_oversize(&e) => {
                            if let Some(packet_id) = packet_id {
                                work.extend(self.engine.handle(Event::Oversize { packet_id }));
                            }
                            Ok(())
                        }
                        other => other,
                    }
                }
                Action::SendPubAck { packet_id } => sink.send_publish_ack(packet_id).await,
                Action::SendPubRec { packet_id } => sink.send_publish_received(packet_id).await,
                Action::SendPubRel { packet_id, not_found } => {
                    sink.send_publish_release(packet_id, not_found).await
                }
                Action::SendPubComp { packet_id, not_found } => {
                    sink.send_publish_complete(packet_id, not_found).await
                }
                Action::Dispatch(from, publish) => {
                    if let Err(e) =
                        self.handler.message_received(&self.id, from.clone(), publish.clone()).await
                    {
                        log::warn!("{:?} dispatch failed, {:?}", self.id, e);
                        self.handler
                            .message_dropped(
                                Some(&self.id),
                                from,
                                publish,
                                Reason::from(e.to_string()),
                            )
                            .await;
                    }
                    Ok(())
                }
                Action::Completed(from, publish) => {
                    self.handler.message_acked(&self.id, from, &publish).await;
                    Ok(())
                }
                Action::Dropped(from, publish, reason) => {
                    self.handler.message_dropped(Some(&self.id), from, publish, reason).await;
                    Ok(())
                }
            };
            res.map_err(|e| Reason::from(e.to_string()))?;
        }
        sink.flush().await.map_err(|e| Reason::from(e.to_string()))?;
        Ok(())
    }

    #[inline]
    fn last_will_enable(&self, flags: StateFlags) -> bool {
        let session_present = flags.contains(StateFlags::Kicked)
            && !flags.contains(StateFlags::CleanStart)
            && !self.clean_session;
        self.last_will.is_some()
            && !(flags.contains(StateFlags::DisconnectReceived) || session_present)
    }

    async fn publish_last_will(&mut self) {
        if let Some(publish) = self.last_will.take() {
            log::debug!("{:?} publish last will: {:?}", self.id, publish);
            let from = From::LastWill(self.id.clone());
            if let Err(e) = self.handler.message_received(&self.id, from, publish).await {
                log::warn!("{:?} last will publish failed, {:?}", self.id, e);
            }
        }
    }

    /// Persists the unresolved delivery window and queue so the next
    /// incarnation of this client id can resume them.
    async fn park(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // rewrite the queue from scratch under a fresh handle
        handle.invalidate().await?;
        let handle = self.store.open(&self.id.client_id).await?;
        let (inflight, queued) = self.engine.drain();
        for msg in inflight {
            handle.append(StoredMessage::Inflight(msg)).await?;
        }
        for (from, publish) in queued {
            handle.append(StoredMessage::Queued(from, publish)).await?;
        }
        self.handle = Some(handle);
        Ok(())
    }
}

#[inline]
fn is_oversize(e: &Error) -> bool {
    matches!(
        e.downcast_ref::<MqttError>(),
        Some(MqttError::SendPacket(SendPacketError::Encode(EncodeError::OverMaxPacketSize)))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_kick() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded();
        registry.register("c1".into(), tx);

        let task = tokio::spawn(async move {
            match rx.next().await {
                Some(Message::Kick(sender, _, clean_start)) => {
                    assert!(!clean_start);
                    sender.send(()).unwrap();
                }
                other => panic!("unexpected message: {other:?}"),
            }
        });

        let by = Id::new("c1".into(), None);
        let existed = registry.kick(&"c1".into(), by, false).await.unwrap();
        assert!(existed);
        task.await.unwrap();

        // id was removed during the kick
        assert!(registry.get(&"c1".into()).is_none());
    }

    #[tokio::test]
    async fn test_registry_kick_absent() {
        let registry = SessionRegistry::new();
        let by = Id::new("x".into(), None);
        assert!(!registry.kick(&"nobody".into(), by, true).await.unwrap());
    }

    #[test_case::test_case(60, 90; "backoff gives one and a half keepalives")]
    #[test_case::test_case(4, 7; "short keepalives get a flat grace")]
    #[test_case::test_case(0, u32::MAX as u64; "zero keepalive disables the deadline")]
    fn test_keep_alive_interval(keep_alive: u16, expected_secs: u64) {
        let cfg = Builder::new();
        assert_eq!(keep_alive_interval(&cfg, keep_alive), Duration::from_secs(expected_secs));
    }
}
