use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// One unit of work for a pod's discovery stream.
#[derive(Debug, Clone, PartialEq)]
pub enum XdsOp {
    Add {
        name: String,
        payload: prost_types::Any,
    },
    Delete {
        name: String,
    },
    Close,
}

/// FIFO between the reconciler (producer) and the stream task that
/// serves the pod (consumer). Producers never block; the consumer
/// block-dequeues.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Mutex<VecDeque<XdsOp>>,
    notify: Notify,
}

impl Outbox {
    pub fn push(&self, op: XdsOp) {
        self.queue.lock().unwrap().push_back(op);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> XdsOp {
        loop {
            // Arm the waiter before checking so a push between the check
            // and the await is not lost.
            let notified = self.notify.notified();
            if let Some(op) = self.queue.lock().unwrap().pop_front() {
                return op;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<XdsOp> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
