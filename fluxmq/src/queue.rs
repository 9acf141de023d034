use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Result;
use crossbeam::queue::SegQueue;
use futures::channel::mpsc;
use futures::{SinkExt, Stream};

/// What to discard when a bounded queue overflows.
pub enum Policy {
    /// Discard the value being pushed
    Current,
    /// Discard the earliest queued value
    Early,
}

pub trait PolicyFn<P>: 'static + Sync + Send + Fn(&P) -> Policy {}

impl<T, P> PolicyFn<P> for T where T: 'static + Sync + Send + Clone + Fn(&P) -> Policy {}

pub trait OnEventFn: 'static + Sync + Send + Fn() {}
impl<T> OnEventFn for T where T: 'static + Sync + Send + Clone + Fn() {}

/// Bounded FIFO over a lock-free queue. `on_push`/`on_pop` hooks let a
/// session mirror queue contents into a message store.
pub struct Queue<T> {
    cap: usize,
    inner: SegQueue<T>,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl<T> Queue<T> {
    #[inline]
    pub fn new(cap: usize) -> Self {
        Self { cap, inner: SegQueue::new(), on_push_fn: None, on_pop_fn: None }
    }

    #[inline]
    pub fn on_push<F>(&mut self, f: F)
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
    }

    #[inline]
    pub fn on_pop<F>(&mut self, f: F)
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
    }

    #[inline]
    pub fn push(&self, v: T) -> Result<(), T> {
        if self.inner.len() >= self.cap {
            return Err(v);
        }
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        self.inner.push(v);
        Ok(())
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        let v = self.inner.pop()?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(v)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates a wakeup-coupled sender/receiver pair over `queue`. Values
/// already queued get wakeups so the receiver drains them immediately.
pub fn channel<T>(queue: Arc<Queue<T>>) -> (Sender<T>, ReceiverStream<T>) {
    let (tx, rx) = mpsc::channel::<()>((queue.capacity() as f64 * 1.5) as usize);
    let s = ReceiverStream { rx, queue: queue.clone() };
    (0..queue.len()).for_each(|_| {
        if let Err(e) = tx.clone().try_send(()) {
            log::warn!("channel is full, {:?}", e);
        }
    });
    (Sender { tx, queue, policy_fn: Arc::new(|_v: &T| -> Policy { Policy::Current }) }, s)
}

pub struct Sender<T> {
    tx: mpsc::Sender<()>,
    queue: Arc<Queue<T>>,
    policy_fn: Arc<dyn PolicyFn<T>>,
}

impl<T> Sender<T> {
    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        self.tx.close().await?;
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn policy<F>(mut self, f: F) -> Self
    where
        F: PolicyFn<T>,
    {
        self.policy_fn = Arc::new(f);
        self
    }

    /// Pushes `v`, applying the drop policy when the queue is full. The
    /// returned `Err` carries the discarded value.
    #[inline]
    pub async fn send(&self, v: T) -> Result<(), T> {
        if let Err(v) = self.queue.push(v) {
            match (self.policy_fn)(&v) {
                Policy::Current => return Err(v),
                Policy::Early => {
                    let removed = self.queue.pop();
                    if let Err(v) = self.queue.push(v) {
                        log::warn!("queue is full, queue len is {}", self.queue.len());
                        return Err(v);
                    }
                    if let Err(e) = self.tx.clone().try_send(()) {
                        log::warn!("channel is full, {:?}", e);
                    }
                    return match removed {
                        Some(removed) => Err(removed),
                        None => Ok(()),
                    };
                }
            }
        } else if let Err(e) = self.tx.clone().try_send(()) {
            log::warn!("channel is full, {:?}", e);
        }
        Ok(())
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }
}

pub struct ReceiverStream<T> {
    rx: mpsc::Receiver<()>,
    queue: Arc<Queue<T>>,
}

impl<T> Stream for ReceiverStream<T> {
    type Item = Option<T>;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let result: Option<_> = futures::ready!(Pin::new(&mut self.rx).poll_next(cx));
        Poll::Ready(result.map(|_| self.queue.pop()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_push_pop() {
        let q = Queue::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.pop(), Some(1));
        assert!(q.push(3).is_ok());
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let pushed = Arc::new(AtomicUsize::new(0));
        let popped = Arc::new(AtomicUsize::new(0));
        let mut q = Queue::new(8);
        {
            let pushed = pushed.clone();
            q.on_push(move || {
                pushed.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let popped = popped.clone();
            q.on_pop(move || {
                popped.fetch_add(1, Ordering::SeqCst);
            });
        }
        let _ = q.push(10);
        let _ = q.push(11);
        let _ = q.pop();
        assert_eq!(pushed.load(Ordering::SeqCst), 2);
        assert_eq!(popped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_policy_early() {
        let (tx, mut rx) = channel::<u64>(Arc::new(Queue::new(3)));
        let tx = tx.policy(|_v: &u64| -> Policy { Policy::Early });

        for i in 0..3 {
            assert!(tx.send(i).await.is_ok());
        }
        // full, the oldest value is discarded and handed back
        assert_eq!(tx.send(3).await, Err(0));
        assert_eq!(tx.len(), 3);

        assert_eq!(rx.next().await, Some(Some(1)));
        assert_eq!(rx.next().await, Some(Some(2)));
        assert_eq!(rx.next().await, Some(Some(3)));
    }
}
