use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use crate::inflight::{InInflight, MomentStatus, OutInflight, OutInflightMessage};
use crate::queue::Queue;
use crate::types::{From, PacketId, Publish, Reason, TimestampMillis};

/// An acknowledgement, timer tick or inbound packet fed to the engine.
#[derive(Debug, Clone)]
pub enum Event {
    /// PUBACK received; `reason >= 0x80` is a failure
    PubAck { packet_id: NonZeroU16, reason: u8 },
    /// PUBREC received; `reason >= 0x80` is a failure
    PubRec { packet_id: NonZeroU16, reason: u8 },
    PubRel { packet_id: NonZeroU16 },
    PubComp { packet_id: NonZeroU16 },
    /// Inbound PUBLISH from the peer
    Publish(From, Publish),
    /// The retry deadline of the oldest inflight entry may have passed
    RetryTick,
    /// A fresh connection is about to resume this session
    Reconnected,
    /// Encoding the PUBLISH for this id exceeded the peer's packet
    /// size limit; drop just that message
    Oversize { packet_id: NonZeroU16 },
}

/// What the connection must do in response to an [`Event`].
#[derive(Debug, Clone)]
pub enum Action {
    SendPublish(Publish),
    SendPubAck { packet_id: NonZeroU16 },
    SendPubRec { packet_id: NonZeroU16 },
    /// `not_found` marks a PUBREL for an id we no longer track
    SendPubRel { packet_id: NonZeroU16, not_found: bool },
    /// `not_found` marks a PUBCOMP for an id we never received
    SendPubComp { packet_id: NonZeroU16, not_found: bool },
    /// Hand an inbound message to the application/subscribers
    Dispatch(From, Publish),
    /// The QoS handshake for this outbound message finished
    Completed(From, Publish),
    /// The message was discarded
    Dropped(From, Publish, Reason),
}

/// Per-session QoS delivery state machine.
///
/// Pure in the sense that it never touches a socket or a timer: every
/// call returns the packets to send and messages to surface as
/// [`Action`]s, and the caller drives time through
/// [`Event::RetryTick`] using [`DeliveryState::retry_timeout`].
pub struct DeliveryState {
    out: OutInflight,
    inbound: InInflight,
    queued: Arc<Queue<(From, Publish)>>,
}

impl DeliveryState {
    /// `max_inflight == 0` disables the outbound window bound,
    /// `retry_interval`/`expiry_interval` in milliseconds, `0` disables.
    pub fn new(
        max_inflight: u16,
        max_queue: usize,
        retry_interval: TimestampMillis,
        expiry_interval: TimestampMillis,
        max_receive: u16,
    ) -> Self {
        Self {
            out: OutInflight::new(max_inflight as usize, retry_interval, expiry_interval),
            inbound: InInflight::new(max_receive),
            queued: Arc::new(Queue::new(max_queue)),
        }
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.out.len()
    }

    #[inline]
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.out.has_credit()
    }

    /// Delay until the next retry is due, `None` when idle.
    #[inline]
    pub fn retry_timeout(&self) -> Option<Duration> {
        self.out.get_timeout()
    }

    /// Accepts an outbound application message. QoS0 is sent
    /// immediately; QoS1/2 take an inflight slot or wait in the queue.
    pub fn enqueue(&mut self, from: From, mut publish: Publish) -> Vec<Action> {
        let mut actions = Vec::new();
        if publish.qos.value() == 0 {
            publish.packet_id = None;
            actions.push(Action::SendPublish(publish));
            return actions;
        }
        if self.out.has_credit() && self.queued.is_empty() {
            self.send_fresh(from, publish, &mut actions);
        } else if let Err(rejected) = self.queued.push((from, publish)) {
            // full, make room by discarding the oldest queued message
            let removed = self.queued.pop();
            match self.queued.push(rejected) {
                Ok(()) => {
                    if let Some((from, publish)) = removed {
                        actions.push(Action::Dropped(from, publish, Reason::MessageQueueFull));
                    }
                }
                Err((from, publish)) => {
                    actions.push(Action::Dropped(from, publish, Reason::MessageQueueFull));
                }
            }
        }
        actions
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            Event::PubAck { packet_id, reason } => {
                self.ack_remove(packet_id, reason, &mut actions);
            }
            Event::PubRec { packet_id, reason } => {
                if reason >= 0x80 {
                    self.ack_remove(packet_id, reason, &mut actions);
                } else if self.out.exist(&packet_id.get()) {
                    self.out.update_status(&packet_id.get(), MomentStatus::WaitForPubcomp);
                    actions.push(Action::SendPubRel { packet_id, not_found: false });
                } else {
                    log::info!("PUBREC for unknown packet id {}", packet_id);
                    actions.push(Action::SendPubRel { packet_id, not_found: true });
                }
            }
            Event::PubComp { packet_id } => {
                self.ack_remove(packet_id, 0, &mut actions);
            }
            Event::PubRel { packet_id } => {
                let removed = self.inbound.remove(&packet_id);
                if !removed {
                    log::info!("PUBREL for unknown packet id {}", packet_id);
                }
                actions.push(Action::SendPubComp { packet_id, not_found: !removed });
            }
            Event::Publish(from, publish) => {
                self.inbound_publish(from, publish, &mut actions);
            }
            Event::RetryTick => {
                self.retry(&mut actions);
            }
            Event::Reconnected => {
                self.redeliver(&mut actions);
            }
            Event::Oversize { packet_id } => {
                if let Some(msg) = self.out.remove(&packet_id.get()) {
                    actions.push(Action::Dropped(msg.from, msg.publish, Reason::OversizePacket));
                }
                self.promote(&mut actions);
            }
        }
        actions
    }

    /// Readmits a persisted window entry, keeping its recorded status.
    /// A following [`Event::Reconnected`] turns it into wire traffic.
    pub fn restore_inflight(&mut self, msg: OutInflightMessage) {
        self.out.push_back(msg);
    }

    /// Readmits a persisted queued message at the back of the queue.
    pub fn restore_queued(&mut self, from: From, publish: Publish) {
        if let Err((from, publish)) = self.queued.push((from, publish)) {
            log::warn!("restore dropped, queue is full: {:?} {:?}", from, publish);
        }
    }

    /// Hands back everything awaiting delivery, inflight first in send
    /// order, for persisting when the session parks.
    pub fn drain(&mut self) -> (Vec<OutInflightMessage>, Vec<(From, Publish)>) {
        let inflight = self.out.to_inflight_messages();
        let mut queued = Vec::new();
        while let Some(item) = self.queued.pop() {
            queued.push(item);
        }
        (inflight, queued)
    }

    fn ack_remove(&mut self, packet_id: NonZeroU16, reason: u8, actions: &mut Vec<Action>) {
        match self.out.remove(&packet_id.get()) {
            Some(msg) => {
                if reason >= 0x80 {
                    actions.push(Action::Dropped(
                        msg.from,
                        msg.publish,
                        Reason::DeliveryFailed(reason),
                    ));
                } else {
                    actions.push(Action::Completed(msg.from, msg.publish));
                }
            }
            None => {
                log::info!("ack for unknown packet id {}", packet_id);
            }
        }
        self.promote(actions);
    }

    fn inbound_publish(&mut self, from: From, publish: Publish, actions: &mut Vec<Action>) {
        match publish.qos.value() {
            0 => actions.push(Action::Dispatch(from, publish)),
            1 => {
                let Some(packet_id) = publish.packet_id else {
                    actions.push(Action::Dropped(
                        from,
                        publish,
                        Reason::ProtocolError("packet_id is None".into()),
                    ));
                    return;
                };
                actions.push(Action::Dispatch(from, publish));
                actions.push(Action::SendPubAck { packet_id });
            }
            _ => {
                let Some(packet_id) = publish.packet_id else {
                    actions.push(Action::Dropped(
                        from,
                        publish,
                        Reason::ProtocolError("packet_id is None".into()),
                    ));
                    return;
                };
                match self.inbound.add(packet_id) {
                    Ok(true) => {
                        actions.push(Action::Dispatch(from, publish));
                        actions.push(Action::SendPubRec { packet_id });
                    }
                    Ok(false) => {
                        // duplicate while awaiting PUBREL, acknowledge
                        // again without re-dispatching
                        actions.push(Action::SendPubRec { packet_id });
                    }
                    Err(reason) => {
                        actions.push(Action::Dropped(from, publish, reason));
                    }
                }
            }
        }
    }

    /// Resend everything whose retry deadline passed, keeping the
    /// original packet id within one connection.
    fn retry(&mut self, actions: &mut Vec<Action>) {
        while let Some(msg) = self.out.pop_front_timeout() {
            match msg.status {
                MomentStatus::WaitForPuback | MomentStatus::WaitForPubrec => {
                    let mut publish = msg.publish.clone();
                    publish.dup = true;
                    self.out.push_back(OutInflightMessage::new(msg.status, msg.from, msg.publish));
                    actions.push(Action::SendPublish(publish));
                }
                MomentStatus::WaitForPubcomp => {
                    let packet_id = msg.publish.packet_id;
                    self.out.push_back(OutInflightMessage::new(msg.status, msg.from, msg.publish));
                    if let Some(packet_id) = packet_id {
                        actions.push(Action::SendPubRel { packet_id, not_found: false });
                    }
                }
            }
        }
    }

    /// Redelivery after a reconnect: unacknowledged publishes go out
    /// again as dup with a freshly allocated id, half-done QoS2
    /// handshakes continue with PUBREL under their old id.
    fn redeliver(&mut self, actions: &mut Vec<Action>) {
        for msg in self.out.to_inflight_messages() {
            match msg.status {
                MomentStatus::WaitForPuback | MomentStatus::WaitForPubrec => {
                    let mut publish = msg.publish;
                    publish.dup = true;
                    publish.packet_id = match self.out.next_id() {
                        Ok(id) => NonZeroU16::new(id),
                        Err(e) => {
                            log::warn!("packet id allocation failed, {:?}", e);
                            actions.push(Action::Dropped(msg.from, publish, Reason::from(e.to_string())));
                            continue;
                        }
                    };
                    self.out.push_back(OutInflightMessage::new(
                        msg.status,
                        msg.from,
                        publish.clone(),
                    ));
                    actions.push(Action::SendPublish(publish));
                }
                MomentStatus::WaitForPubcomp => {
                    let packet_id = msg.publish.packet_id;
                    self.out.push_back(msg);
                    if let Some(packet_id) = packet_id {
                        actions.push(Action::SendPubRel { packet_id, not_found: false });
                    }
                }
            }
        }
        self.promote(actions);
    }

    /// FIFO promotion from queued to inflight while credit lasts.
    fn promote(&mut self, actions: &mut Vec<Action>) {
        while self.out.has_credit() {
            let Some((from, publish)) = self.queued.pop() else {
                break;
            };
            self.send_fresh(from, publish, actions);
        }
    }

    fn send_fresh(&mut self, from: From, mut publish: Publish, actions: &mut Vec<Action>) {
        let packet_id = match self.out.next_id() {
            Ok(id) => NonZeroU16::new(id),
            Err(e) => {
                log::warn!("packet id allocation failed, {:?}", e);
                actions.push(Action::Dropped(from, publish, Reason::from(e.to_string())));
                return;
            }
        };
        publish.packet_id = packet_id;
        publish.dup = false;
        let status = if publish.qos.value() == 1 {
            MomentStatus::WaitForPuback
        } else {
            MomentStatus::WaitForPubrec
        };
        self.out.push_back(OutInflightMessage::new(status, from, publish.clone()));
        actions.push(Action::SendPublish(publish));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;
    use bytes::Bytes;
    use fluxmq_codec::types::QoS;

    fn from() -> From {
        From::Client(Id::new("peer".into(), None))
    }

    fn publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos,
            topic: "alarm/door".into(),
            packet_id: None,
            payload: Bytes::from_static(b"open"),
            properties: None,
        }
    }

    fn sent_id(actions: &[Action]) -> NonZeroU16 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::SendPublish(p) => p.packet_id,
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_qos0_passthrough() {
        let mut st = DeliveryState::new(1, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::AtMostOnce));
        assert!(matches!(actions[..], [Action::SendPublish(ref p)] if p.packet_id.is_none()));
        assert_eq!(st.inflight_len(), 0);
    }

    #[test]
    fn test_qos1_happy_path() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let packet_id = sent_id(&actions);
        assert_eq!(st.inflight_len(), 1);

        let actions = st.handle(Event::PubAck { packet_id, reason: 0 });
        assert!(matches!(actions[..], [Action::Completed(..)]));
        assert_eq!(st.inflight_len(), 0);
    }

    #[test]
    fn test_qos2_full_handshake() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::ExactlyOnce));
        let packet_id = sent_id(&actions);

        let actions = st.handle(Event::PubRec { packet_id, reason: 0 });
        assert!(matches!(actions[..], [Action::SendPubRel { not_found: false, .. }]));
        assert_eq!(st.inflight_len(), 1);

        let actions = st.handle(Event::PubComp { packet_id });
        assert!(matches!(actions[..], [Action::Completed(..)]));
        assert_eq!(st.inflight_len(), 0);

        // a late duplicate PUBREC is answered but never fatal
        let actions = st.handle(Event::PubRec { packet_id, reason: 0 });
        assert!(matches!(actions[..], [Action::SendPubRel { not_found: true, .. }]));
    }

    #[test]
    fn test_failure_reason_removes() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let packet_id = sent_id(&actions);

        let actions = st.handle(Event::PubAck { packet_id, reason: 0x87 });
        assert!(matches!(
            actions[..],
            [Action::Dropped(_, _, Reason::DeliveryFailed(0x87))]
        ));
        assert_eq!(st.inflight_len(), 0);
    }

    #[test]
    fn test_inflight_bound_and_promotion() {
        let mut st = DeliveryState::new(2, 10, 0, 0, 0);
        let a1 = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let _ = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let a3 = st.enqueue(from(), publish(QoS::AtLeastOnce));
        assert_eq!(st.inflight_len(), 2);
        assert_eq!(st.queued_len(), 1);
        assert!(a3.is_empty());

        // freeing a slot promotes the queued message
        let packet_id = sent_id(&a1);
        let actions = st.handle(Event::PubAck { packet_id, reason: 0 });
        assert!(actions.iter().any(|a| matches!(a, Action::Completed(..))));
        assert!(actions.iter().any(|a| matches!(a, Action::SendPublish(_))));
        assert_eq!(st.inflight_len(), 2);
        assert_eq!(st.queued_len(), 0);
    }

    #[test]
    fn test_queue_overflow_drops_oldest() {
        let mut st = DeliveryState::new(1, 1, 0, 0, 0);
        let _ = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let mut first_queued = publish(QoS::AtLeastOnce);
        first_queued.topic = "a/1".into();
        assert!(st.enqueue(from(), first_queued).is_empty());

        let actions = st.enqueue(from(), publish(QoS::AtLeastOnce));
        assert!(matches!(
            actions[..],
            [Action::Dropped(_, ref p, Reason::MessageQueueFull)] if p.topic == "a/1"
        ));
        assert_eq!(st.queued_len(), 1);
    }

    #[test]
    fn test_inbound_qos2_duplicate() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let mut p = publish(QoS::ExactlyOnce);
        let packet_id = NonZeroU16::new(9).unwrap();
        p.packet_id = Some(packet_id);

        let actions = st.handle(Event::Publish(from(), p.clone()));
        assert!(matches!(
            actions[..],
            [Action::Dispatch(..), Action::SendPubRec { .. }]
        ));

        // retransmission before PUBREL must not dispatch twice
        p.dup = true;
        let actions = st.handle(Event::Publish(from(), p));
        assert!(matches!(actions[..], [Action::SendPubRec { .. }]));

        let actions = st.handle(Event::PubRel { packet_id });
        assert!(matches!(actions[..], [Action::SendPubComp { not_found: false, .. }]));

        // releasing again is answered with a not-found PUBCOMP
        let actions = st.handle(Event::PubRel { packet_id });
        assert!(matches!(actions[..], [Action::SendPubComp { not_found: true, .. }]));
    }

    #[test]
    fn test_inbound_qos1_acked() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let mut p = publish(QoS::AtLeastOnce);
        p.packet_id = NonZeroU16::new(3);
        let actions = st.handle(Event::Publish(from(), p));
        assert!(matches!(
            actions[..],
            [Action::Dispatch(..), Action::SendPubAck { .. }]
        ));
    }

    #[test]
    fn test_retry_keeps_packet_id() {
        let mut st = DeliveryState::new(0, 10, 1, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let packet_id = sent_id(&actions);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let actions = st.handle(Event::RetryTick);
        match &actions[..] {
            [Action::SendPublish(p)] => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(packet_id));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
        assert_eq!(st.inflight_len(), 1);
    }

    #[test]
    fn test_retry_resends_pubrel() {
        let mut st = DeliveryState::new(0, 10, 1, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::ExactlyOnce));
        let packet_id = sent_id(&actions);
        let _ = st.handle(Event::PubRec { packet_id, reason: 0 });

        std::thread::sleep(std::time::Duration::from_millis(5));
        let actions = st.handle(Event::RetryTick);
        assert!(matches!(
            actions[..],
            [Action::SendPubRel { packet_id: id, not_found: false }] if id == packet_id
        ));
    }

    #[test]
    fn test_reconnect_redelivery_fresh_id() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let old_id = sent_id(&actions);

        let actions = st.handle(Event::Reconnected);
        match &actions[..] {
            [Action::SendPublish(p)] => {
                assert!(p.dup);
                assert!(p.packet_id.is_some());
                assert_ne!(p.packet_id, Some(old_id));
            }
            other => panic!("unexpected actions: {:?}", other),
        }
        assert_eq!(st.inflight_len(), 1);
    }

    #[test]
    fn test_reconnect_resumes_pubrel() {
        let mut st = DeliveryState::new(0, 10, 0, 0, 0);
        let actions = st.enqueue(from(), publish(QoS::ExactlyOnce));
        let packet_id = sent_id(&actions);
        let _ = st.handle(Event::PubRec { packet_id, reason: 0 });

        let actions = st.handle(Event::Reconnected);
        assert!(matches!(
            actions[..],
            [Action::SendPubRel { packet_id: id, not_found: false }] if id == packet_id
        ));
        assert_eq!(st.inflight_len(), 1);
    }

    #[test]
    fn test_oversize_drops_one_message() {
        let mut st = DeliveryState::new(1, 10, 0, 0, 0);
        let a1 = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let _ = st.enqueue(from(), publish(QoS::AtLeastOnce));
        let packet_id = sent_id(&a1);

        let actions = st.handle(Event::Oversize { packet_id });
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Dropped(_, _, Reason::OversizePacket))));
        // the freed slot is refilled from the queue
        assert!(actions.iter().any(|a| matches!(a, Action::SendPublish(_))));
        assert_eq!(st.inflight_len(), 1);
        assert_eq!(st.queued_len(), 0);
    }
}
