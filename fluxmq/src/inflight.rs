use std::collections::BTreeSet;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use itertools::Itertools;
use rust_box::dequemap::DequeBTreeMap as DequeMap;
use serde::{Deserialize, Serialize};

use crate::queue::OnEventFn;
use crate::types::{timestamp_millis, From, PacketId, Publish, Reason, TimestampMillis};
use crate::Result;

type OutQueues = DequeMap<PacketId, OutInflightMessage>;

/// Which acknowledgement an unresolved outbound message is waiting on.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub enum MomentStatus {
    /// QoS1, PUBACK outstanding
    WaitForPuback,
    /// QoS2, PUBREC outstanding
    WaitForPubrec,
    /// QoS2, PUBREL sent, PUBCOMP outstanding
    WaitForPubcomp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub from: From,
    pub status: MomentStatus,
    pub update_time: TimestampMillis,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, from: From, publish: Publish) -> Self {
        Self { publish, from, status, update_time: timestamp_millis() }
    }

    #[inline]
    fn update_status(&mut self, status: MomentStatus) {
        self.update_time = timestamp_millis();
        self.status = status;
    }

    #[inline]
    pub fn timeout(&self, interval_millis: TimestampMillis) -> bool {
        interval_millis > 0 && ((timestamp_millis() - self.update_time) >= interval_millis)
    }
}

/// Outbound delivery window, insertion-ordered by send time.
///
/// `cap == 0` means unbounded.
#[derive(Clone)]
pub struct OutInflight {
    cap: usize,
    interval: TimestampMillis,
    next: Arc<AtomicU16>,
    queues: OutQueues,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize, retry_interval: TimestampMillis, expiry_interval: TimestampMillis) -> Self {
        let interval = Self::interval(retry_interval, expiry_interval);
        Self {
            cap,
            interval,
            next: Arc::new(AtomicU16::new(1)),
            queues: OutQueues::default(),
            on_push_fn: None,
            on_pop_fn: None,
        }
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    fn interval(retry_interval: TimestampMillis, expiry_interval: TimestampMillis) -> TimestampMillis {
        match (retry_interval, expiry_interval) {
            (0, 0) => 0,
            (0, expiry_interval) => expiry_interval,
            (retry_interval, 0) => retry_interval,
            (retry_interval, expiry_interval) => retry_interval.min(expiry_interval),
        }
    }

    /// Delay until the oldest entry reaches its retry deadline; `None`
    /// when the window is empty or retry is disabled.
    #[inline]
    pub fn get_timeout(&self) -> Option<Duration> {
        if self.interval == 0 {
            return None;
        }
        let (_, m) = self.queues.front()?;
        let t = (self.interval - (timestamp_millis() - m.update_time)).max(1);
        Some(Duration::from_millis(t as u64))
    }

    #[inline]
    fn front_timeout(&self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.queues.front().map(|(_, m)| m.timeout(self.interval)).unwrap_or(false)
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(&packet_id)
    }

    #[inline]
    pub fn front(&self) -> Option<(&PacketId, &OutInflightMessage)> {
        self.queues.front()
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<OutInflightMessage> {
        let msg = self.queues.pop_front().map(|(_, m)| m)?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(msg)
    }

    /// Pops the oldest entry only if its retry deadline has passed.
    #[inline]
    pub fn pop_front_timeout(&mut self) -> Option<OutInflightMessage> {
        if self.front_timeout() {
            self.pop_front()
        } else {
            None
        }
    }

    #[inline]
    pub fn push_back(&mut self, m: OutInflightMessage) -> Option<NonZeroU16> {
        let Some(packet_id) = m.publish.packet_id else {
            log::warn!("packet_id is None, inflight message: {:?}", m);
            return None;
        };
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        let old = self.queues.insert(packet_id.get(), m);
        if old.is_some() {
            if let Some(f) = self.on_pop_fn.as_ref() {
                f();
            }
        }
        old.and_then(|old| old.publish.packet_id)
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        let msg = self.queues.remove(packet_id)?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(msg)
    }

    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, s: MomentStatus) {
        if let Some(m) = self.queues.get_mut(packet_id) {
            m.update_status(s);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.cap == 0 || self.queues.len() < self.cap
    }

    /// Allocates the next packet id: wraps 0xFFFF to 1, never yields 0
    /// or an id still present in the window.
    #[inline]
    pub fn next_id(&self) -> Result<PacketId> {
        for _ in 0..u16::MAX {
            let packet_id = self.next.fetch_add(1, Ordering::SeqCst);
            if packet_id == 0 {
                continue;
            }
            if !self.queues.contains_key(&packet_id) {
                return Ok(packet_id);
            }
        }
        Err(anyhow!("no packet_id available"))
    }

    /// Drains the window in send order, for redelivery on reconnect.
    #[inline]
    pub fn to_inflight_messages(&mut self) -> Vec<OutInflightMessage> {
        let mut inflight_messages = Vec::new();
        while let Some(msg) = self.pop_front() {
            inflight_messages.push(msg);
        }
        inflight_messages
    }

    #[inline]
    pub fn clone_inflight_messages(&self) -> Vec<OutInflightMessage> {
        self.queues.iter().map(|(_, msg)| msg.clone()).collect_vec()
    }
}

/// Inbound QoS2 window: ids received but not yet released by PUBREL.
/// `max_inflight == 0` means unbounded.
pub struct InInflight {
    cached: BTreeSet<NonZeroU16>,
    max_inflight: u16,
}

impl InInflight {
    pub fn new(max_inflight: u16) -> Self {
        Self { cached: BTreeSet::default(), max_inflight }
    }

    /// Records an inbound packet id. `Ok(false)` means the id was
    /// already present, so the message must not be dispatched again.
    #[inline]
    pub fn add(&mut self, pid: NonZeroU16) -> std::result::Result<bool, Reason> {
        if self.max_inflight > 0
            && self.cached.len() >= self.max_inflight as usize
            && !self.cached.contains(&pid)
        {
            return Err(Reason::InflightWindowFull);
        }
        Ok(self.cached.insert(pid))
    }

    #[inline]
    pub fn remove(&mut self, pid: &NonZeroU16) -> bool {
        self.cached.remove(pid)
    }

    #[inline]
    pub fn contains(&self, pid: &NonZeroU16) -> bool {
        self.cached.contains(pid)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}
