//! The bounded single-consumer action queue.
//!
//! One unbounded channel plus a depth counter: the soft bound applies only
//! to user-originated actions, so internal signals (acks, ticks, transport
//! events) can never fail to enqueue. FIFO order is preserved per sender.

use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures_channel::mpsc;
use futures_util::{
    stream::{FusedStream, Stream},
    StreamExt,
};

use super::action::Action;
use crate::error::ClientError;

pub(crate) fn action_queue(soft_max: usize) -> (ActionSender, ActionReceiver) {
    let (tx, rx) = mpsc::unbounded();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        ActionSender { tx, depth: depth.clone(), soft_max },
        ActionReceiver { rx, depth },
    )
}

#[derive(Clone)]
pub(crate) struct ActionSender {
    tx: mpsc::UnboundedSender<Action>,
    depth: Arc<AtomicUsize>,
    soft_max: usize,
}

impl ActionSender {
    /// Enqueue an action, honoring the soft bound for user actions.
    pub(crate) fn send(&self, action: Action) -> Result<(), ClientError> {
        if action.is_user_action() && self.depth.load(Ordering::Acquire) >= self.soft_max {
            return Err(ClientError::QueueFull);
        }
        self.push(action)
    }

    /// Enqueue bypassing the soft bound: internal signals and offline-queue
    /// drains must never fail to enqueue.
    pub(crate) fn send_internal(&self, action: Action) {
        let _ = self.push(action);
    }

    fn push(&self, action: Action) -> Result<(), ClientError> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.unbounded_send(action).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            ClientError::Disposed
        })
    }
}

pub(crate) struct ActionReceiver {
    rx: mpsc::UnboundedReceiver<Action>,
    depth: Arc<AtomicUsize>,
}

impl Stream for ActionReceiver {
    type Item = Action;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Action>> {
        let polled = self.rx.poll_next_unpin(cx);
        if let Poll::Ready(Some(_)) = &polled {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        polled
    }
}

impl FusedStream for ActionReceiver {
    fn is_terminated(&self) -> bool {
        self.rx.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish() -> Action {
        Action::Publish { channel: "ch".to_string(), message: json!(1), ack: None }
    }

    #[tokio::test]
    async fn soft_bound_applies_to_user_actions_only() {
        let (tx, mut rx) = action_queue(2);
        tx.send(publish()).unwrap();
        tx.send(publish()).unwrap();
        assert!(matches!(tx.send(publish()), Err(ClientError::QueueFull)));

        // internal signals still flow
        tx.send(Action::Tick).unwrap();
        tx.send(Action::Tick).unwrap();

        // draining frees capacity for user actions again
        for _ in 0..4 {
            rx.next().await.unwrap();
        }
        tx.send(publish()).unwrap();
    }
}
