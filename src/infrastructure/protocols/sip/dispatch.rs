//! Inbound dispatch
//!
//! Every message is routed on its own task, except REGISTER: those are queued
//! per address-of-record and routed one after another, so registrations for
//! the same AoR take effect in the order they arrived on the socket. A queue
//! closes after a quiet period; the queue that replaces it waits for the old
//! worker to drain before routing anything.

use super::message::{HeaderAccess, SipMessage, SipMethod};
use super::router::RequestRouter;
use super::transport::IncomingMessage;
use crate::domain::shared::value_objects::normalize_aor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Quiet period after which a REGISTER queue shuts down
pub const DEFAULT_QUEUE_IDLE: Duration = Duration::from_secs(30);

const MIN_PRUNE_AT: usize = 1024;

struct AorQueue {
    sender: mpsc::UnboundedSender<IncomingMessage>,
    worker: JoinHandle<()>,
}

/// Hands inbound messages to the router.
///
/// Owned by the single task reading the listener channel, so queue creation
/// follows arrival order.
pub struct Dispatcher {
    router: Arc<RequestRouter>,
    idle: Duration,
    queues: HashMap<String, AorQueue>,
    prune_at: usize,
}

impl Dispatcher {
    pub fn new(router: Arc<RequestRouter>, idle: Duration) -> Self {
        Self {
            router,
            idle,
            queues: HashMap::new(),
            prune_at: MIN_PRUNE_AT,
        }
    }

    pub fn dispatch(&mut self, message: IncomingMessage) {
        match registration_aor(&message) {
            Some(aor) => self.enqueue(aor, message),
            None => {
                let router = self.router.clone();
                tokio::spawn(async move {
                    let outcome = router.route(message).await;
                    debug!("Routed: {:?}", outcome);
                });
            }
        }
    }

    /// REGISTER queues currently tracked
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    fn enqueue(&mut self, aor: String, message: IncomingMessage) {
        let message = match self.queues.get(&aor) {
            Some(queue) => match queue.sender.send(message) {
                Ok(()) => return,
                // Worker went idle; its replacement takes over
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let previous = self.queues.remove(&aor).map(|queue| queue.worker);
        let (sender, receiver) = mpsc::unbounded_channel();
        if sender.send(message).is_err() {
            return;
        }
        let worker = tokio::spawn(run_queue(
            self.router.clone(),
            aor.clone(),
            receiver,
            previous,
            self.idle,
        ));
        self.queues.insert(aor, AorQueue { sender, worker });

        if self.queues.len() >= self.prune_at {
            self.prune();
        }
    }

    fn prune(&mut self) {
        self.queues
            .retain(|_, queue| !(queue.sender.is_closed() && queue.worker.is_finished()));
        self.prune_at = (self.queues.len() * 2).max(MIN_PRUNE_AT);
        debug!("{} REGISTER queues after prune", self.queues.len());
    }
}

async fn run_queue(
    router: Arc<RequestRouter>,
    aor: String,
    mut receiver: mpsc::UnboundedReceiver<IncomingMessage>,
    previous: Option<JoinHandle<()>>,
    idle: Duration,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }

    loop {
        match tokio::time::timeout(idle, receiver.recv()).await {
            Ok(Some(message)) => {
                let outcome = router.route(message).await;
                debug!("Routed REGISTER for {}: {:?}", aor, outcome);
            }
            Ok(None) => break,
            Err(_) => {
                receiver.close();
                while let Some(message) = receiver.recv().await {
                    router.route(message).await;
                }
                break;
            }
        }
    }
    debug!("REGISTER queue for {} closed", aor);
}

/// AoR of a REGISTER, taken from its To header
fn registration_aor(message: &IncomingMessage) -> Option<String> {
    let SipMessage::Request(request) = &message.message else {
        return None;
    };
    if request.method() != Some(SipMethod::Register) {
        return None;
    }
    normalize_aor(&request.to_header()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::transport::TransportProtocol;

    fn incoming(text: &str) -> IncomingMessage {
        IncomingMessage {
            message: SipMessage::parse(text.as_bytes()).unwrap(),
            source: "10.0.0.9:5062".parse().unwrap(),
            protocol: TransportProtocol::Udp,
        }
    }

    fn request(method: &str, to: &str) -> String {
        format!(
            "{method} sip:example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.9:5062;branch=z9hG4bKq1\r\n\
             From: <sip:bob@example.com>;tag=b1\r\n\
             To: {to}\r\n\
             Call-ID: q-1\r\n\
             CSeq: 1 {method}\r\n\
             Content-Length: 0\r\n\r\n"
        )
    }

    #[test]
    fn test_registration_aor() {
        assert_eq!(
            registration_aor(&incoming(&request("REGISTER", "\"Bob\" <sip:bob@EXAMPLE.com:5060>"))),
            Some("sip:bob@example.com".to_string())
        );
        assert_eq!(
            registration_aor(&incoming(&request("OPTIONS", "<sip:bob@example.com>"))),
            None
        );
        assert_eq!(
            registration_aor(&incoming(&request("REGISTER", "<tel:+15551234>"))),
            None
        );
    }
}
