//! Duplex framed connection owned by one event loop.
//!
//! Two local tasks per connection:
//! - reader: decodes frames in arrival order and posts each envelope to the
//!   owning loop as a readiness callback;
//! - writer: drains an unbounded outbound queue onto the socket.
//!
//! `send` only enqueues, so it never blocks the loop. A full OS buffer
//! suspends the writer task alone. Whichever side ends first cancels the
//! shared token; the reader then posts `on_close` exactly once.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::codec::{read_envelope, write_envelope};
use super::envelope::MessageEnvelope;
use crate::event_loop::EventLoop;
use crate::types::Result;

/// One end of a mailbox.
pub struct Connection {
    outbound: RefCell<Option<mpsc::UnboundedSender<MessageEnvelope>>>,
    depth: Rc<Cell<usize>>,
    closed: CancellationToken,
    label: String,
}

impl Connection {
    /// Wrap a connected tokio stream. Must be called inside the loop's runtime
    /// context (see [`EventLoop::enter`]) or from one of its local tasks.
    pub fn open<F, C>(
        event_loop: &EventLoop,
        stream: UnixStream,
        label: impl Into<String>,
        max_frame_bytes: u32,
        on_envelope: F,
        on_close: C,
    ) -> Self
    where
        F: FnMut(MessageEnvelope) + 'static,
        C: FnOnce() + 'static,
    {
        let label = label.into();
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        let closed = CancellationToken::new();
        let depth = Rc::new(Cell::new(0usize));

        {
            let closed = closed.clone();
            let depth = depth.clone();
            let label = label.clone();
            let sender = event_loop.event_sender();
            let on_envelope = Rc::new(RefCell::new(on_envelope));
            event_loop.spawn_local(async move {
                loop {
                    let frame = tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = read_envelope(&mut read_half, max_frame_bytes) => frame,
                    };
                    match frame {
                        Ok(Some(envelope)) => {
                            depth.set(depth.get() + 1);
                            let depth = depth.clone();
                            let on_envelope = on_envelope.clone();
                            let posted = sender.post(move || {
                                depth.set(depth.get().saturating_sub(1));
                                let mut deliver = on_envelope.borrow_mut();
                                (*deliver)(envelope);
                            });
                            if !posted {
                                break;
                            }
                        }
                        Ok(None) => {
                            tracing::debug!("connection_eof: peer={}", label);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("connection_read_failed: peer={}, error={}", label, e);
                            break;
                        }
                    }
                }
                closed.cancel();
                sender.post(on_close);
            });
        }

        {
            let closed = closed.clone();
            let label = label.clone();
            event_loop.spawn_local(async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = closed.cancelled() => break,
                        next = rx.recv() => next,
                    };
                    // queue closed: everything sent before close() is flushed
                    let Some(envelope) = next else { break };
                    let written = tokio::select! {
                        _ = closed.cancelled() => break,
                        written = write_envelope(&mut write_half, &envelope) => written,
                    };
                    if let Err(e) = written {
                        tracing::warn!("connection_write_failed: peer={}, error={}", label, e);
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
                closed.cancel();
            });
        }

        Self {
            outbound: RefCell::new(Some(tx)),
            depth,
            closed,
            label,
        }
    }

    /// Wrap a connected std stream (one end of a socket pair, or a worker's
    /// connection to the arbiter socket).
    pub fn from_std<F, C>(
        event_loop: &EventLoop,
        stream: std::os::unix::net::UnixStream,
        label: impl Into<String>,
        max_frame_bytes: u32,
        on_envelope: F,
        on_close: C,
    ) -> Result<Self>
    where
        F: FnMut(MessageEnvelope) + 'static,
        C: FnOnce() + 'static,
    {
        stream.set_nonblocking(true)?;
        let stream = {
            let _guard = event_loop.enter();
            UnixStream::from_std(stream)?
        };
        Ok(Self::open(
            event_loop,
            stream,
            label,
            max_frame_bytes,
            on_envelope,
            on_close,
        ))
    }

    /// Queue an envelope for the writer. Returns `false` once closed.
    pub fn send(&self, envelope: MessageEnvelope) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbound.borrow().as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }

    /// Stop accepting sends, flush what is queued, then close the socket.
    pub fn close(&self) {
        self.outbound.borrow_mut().take();
    }

    /// Drop the socket now; queued frames are discarded.
    pub fn abort(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.borrow().is_none()
    }

    /// Frames handed to the loop but not yet dispatched.
    pub fn mailbox_depth(&self) -> usize {
        self.depth.get()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .field("mailbox_depth", &self.depth.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorIdentity, ActorKind};
    use serde_json::json;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn cast(command: String) -> MessageEnvelope {
        MessageEnvelope::cast(
            ActorIdentity::new(ActorKind::Actor, "left"),
            ActorIdentity::new(ActorKind::Actor, "right"),
            command,
            json!(null),
        )
    }

    #[test]
    fn test_frames_arrive_in_send_order_then_close_fires() {
        let lp = EventLoop::new().unwrap();
        let (a, b) = StdUnixStream::pair().unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));

        let left = Connection::from_std(&lp, a, "left", 1 << 20, |_| {}, || {}).unwrap();
        let r = received.clone();
        let stopper = lp.clone();
        let right = Connection::from_std(
            &lp,
            b,
            "right",
            1 << 20,
            move |env: MessageEnvelope| r.borrow_mut().push(env.command),
            move || stopper.stop(),
        )
        .unwrap();

        for i in 0..50 {
            assert!(left.send(cast(format!("c{i}"))));
        }
        left.close();
        assert!(!left.send(cast("late".into())));
        lp.run().unwrap();

        let expected: Vec<String> = (0..50).map(|i| format!("c{i}")).collect();
        assert_eq!(*received.borrow(), expected);
        assert_eq!(right.mailbox_depth(), 0);
        assert!(right.is_closed());
        lp.close();
    }

    #[test]
    fn test_abort_is_seen_as_peer_loss() {
        let lp = EventLoop::new().unwrap();
        let (a, b) = StdUnixStream::pair().unwrap();
        let lost = Rc::new(Cell::new(false));

        let left = Connection::from_std(&lp, a, "left", 1 << 20, |_| {}, || {}).unwrap();
        let flag = lost.clone();
        let stopper = lp.clone();
        let _right = Connection::from_std(
            &lp,
            b,
            "right",
            1 << 20,
            |_| {},
            move || {
                flag.set(true);
                stopper.stop();
            },
        )
        .unwrap();

        left.abort();
        assert!(!left.send(cast("dropped".into())));
        lp.run().unwrap();
        assert!(lost.get());
        lp.close();
    }
}
