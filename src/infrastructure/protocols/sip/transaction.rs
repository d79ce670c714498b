//! SIP Transaction Matcher
//!
//! Server transactions keyed by (method, Call-ID, CSeq number, top Via branch).
//! ACK and CANCEL find their INVITE by substituting the method. Each server
//! transaction may own one downstream branch created when the request is
//! relayed; responses coming back on that branch resolve to the server
//! transaction through the branch index.
//!
//! Timers are deadlines polled by a background sweep: retention after a final
//! response, T4 after an ACK on unreliable transports, and the client timeout
//! of a relayed request that never saw a final answer.

use super::message::{HeaderAccess, SipRequest, SipResponse};
use super::transport::TransportProtocol;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// RFC 3261 magic cookie every branch starts with
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generate a new branch parameter
pub fn generate_branch() -> String {
    let random: u64 = rand::thread_rng().gen();
    format!("{}{:x}", BRANCH_MAGIC_COOKIE, random)
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("Transaction table full ({0} entries)")]
    ResourceExhausted(usize),

    #[error("Cannot key transaction: missing {0}")]
    MissingKey(&'static str),

    #[error("Transaction not found")]
    NotFound,
}

/// Transaction key - uniquely identifies a server transaction
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct TransactionKey {
    pub method: String,
    pub call_id: String,
    pub cseq: u32,
    pub branch: String,
}

impl TransactionKey {
    pub fn from_request(request: &SipRequest) -> Result<Self, TransactionError> {
        Self::with_method(request, request.method_name())
    }

    /// Key of the INVITE an ACK or CANCEL refers to
    pub fn invite_for(request: &SipRequest) -> Result<Self, TransactionError> {
        Self::with_method(request, "INVITE".to_string())
    }

    fn with_method(request: &SipRequest, method: String) -> Result<Self, TransactionError> {
        Ok(Self {
            method,
            call_id: request.call_id().ok_or(TransactionError::MissingKey("Call-ID"))?,
            cseq: request.cseq().ok_or(TransactionError::MissingKey("CSeq"))?,
            branch: request.branch().ok_or(TransactionError::MissingKey("branch"))?,
        })
    }

    pub fn is_invite(&self) -> bool {
        self.method == "INVITE"
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}/{}", self.method, self.cseq, self.call_id, self.branch)
    }
}

/// SIP Timers (RFC 3261 Section 17.1.1.1)
#[derive(Debug, Clone, Copy)]
pub struct SipTimers {
    /// T1: RTT Estimate (default 500ms)
    pub t1: Duration,
    /// T4: Maximum duration a message remains in network (default 5s)
    pub t4: Duration,
}

impl Default for SipTimers {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t4: Duration::from_secs(5),
        }
    }
}

/// Transaction table limits and timer values
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// How long a completed transaction is kept to absorb retransmissions
    pub retention: Duration,
    /// How long a relayed request may wait for a final response (64*T1)
    pub client_timeout: Duration,
    pub timers: SipTimers,
    pub max_transactions: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        let timers = SipTimers::default();
        Self {
            retention: Duration::from_secs(32),
            client_timeout: timers.t1 * 64,
            timers,
            max_transactions: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Invite,
    NonInvite,
}

/// Server transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    /// INVITE only: ACK received for a non-2xx final response
    Confirmed,
    Terminated,
}

impl TransactionState {
    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineKind {
    /// Remove the entry
    Terminate,
    /// Relayed request got no final response
    ClientTimeout,
}

/// Downstream leg created when the request was relayed
#[derive(Debug, Clone)]
pub struct ForwardBranch {
    pub branch: String,
    pub destination: SocketAddr,
    pub transport: TransportProtocol,
    /// The request as sent downstream
    pub request: SipRequest,
}

/// SIP server transaction
#[derive(Debug, Clone)]
pub struct Transaction {
    pub key: TransactionKey,
    pub kind: TransactionKind,
    pub state: TransactionState,
    /// Original request as received
    pub request: SipRequest,
    /// Where the request came from and where responses go
    pub source: SocketAddr,
    pub transport: TransportProtocol,
    /// Last response sent upstream (for retransmission)
    pub last_response: Option<SipResponse>,
    pub forward: Option<ForwardBranch>,
    pub created_at: Instant,
    deadline: Option<(Instant, DeadlineKind)>,
}

impl Transaction {
    fn new(
        key: TransactionKey,
        request: SipRequest,
        source: SocketAddr,
        transport: TransportProtocol,
        expires_at: Instant,
    ) -> Self {
        let kind = if key.is_invite() {
            TransactionKind::Invite
        } else {
            TransactionKind::NonInvite
        };
        Self {
            key,
            kind,
            // INVITE server transactions answer 100 Trying implicitly
            state: match kind {
                TransactionKind::Invite => TransactionState::Proceeding,
                TransactionKind::NonInvite => TransactionState::Trying,
            },
            request,
            source,
            transport,
            last_response: None,
            forward: None,
            created_at: Instant::now(),
            // Replaced once answered or relayed; bounds entries that never are
            deadline: Some((expires_at, DeadlineKind::Terminate)),
        }
    }

    pub fn has_final_response(&self) -> bool {
        self.last_response
            .as_ref()
            .map(|r| !r.is_provisional())
            .unwrap_or(false)
    }
}

/// Event produced by the sweep
#[derive(Debug, Clone)]
pub enum TransactionEvent {
    /// A relayed request got no final response in time
    Timeout(Transaction),
}

#[derive(Default)]
struct TransactionTable {
    transactions: HashMap<TransactionKey, Transaction>,
    /// Downstream branch -> server transaction
    branches: HashMap<String, TransactionKey>,
}

impl TransactionTable {
    fn remove(&mut self, key: &TransactionKey) -> Option<Transaction> {
        let removed = self.transactions.remove(key)?;
        if let Some(forward) = &removed.forward {
            self.branches.remove(&forward.branch);
        }
        Some(removed)
    }
}

/// Transaction matcher - owns every server transaction
pub struct TransactionLayer {
    table: RwLock<TransactionTable>,
    config: TransactionConfig,
}

impl TransactionLayer {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            table: RwLock::new(TransactionTable::default()),
            config,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Find the transaction of a request or create it.
    ///
    /// Returns the transaction snapshot and whether the request is a
    /// retransmission of one already seen. A full table creates nothing.
    pub async fn match_or_create(
        &self,
        request: &SipRequest,
        source: SocketAddr,
        transport: TransportProtocol,
    ) -> Result<(Transaction, bool), TransactionError> {
        let key = TransactionKey::from_request(request)?;

        if let Some(existing) = self.table.read().await.transactions.get(&key) {
            debug!("Retransmission for {} in {}", key, existing.state.name());
            return Ok((existing.clone(), true));
        }

        let mut table = self.table.write().await;
        if let Some(existing) = table.transactions.get(&key) {
            return Ok((existing.clone(), true));
        }
        if table.transactions.len() >= self.config.max_transactions {
            warn!(
                "Transaction table full ({}), shedding {}",
                self.config.max_transactions, key
            );
            return Err(TransactionError::ResourceExhausted(self.config.max_transactions));
        }

        let expires_at = Instant::now() + self.config.client_timeout + self.config.retention;
        let transaction =
            Transaction::new(key.clone(), request.clone(), source, transport, expires_at);
        debug!(
            "Created server transaction {} from {} ({})",
            key,
            source,
            transaction.state.name()
        );
        table.transactions.insert(key, transaction.clone());
        Ok((transaction, false))
    }

    /// Record a response sent upstream for a server transaction
    pub async fn record_response(
        &self,
        key: &TransactionKey,
        response: &SipResponse,
    ) -> Result<TransactionState, TransactionError> {
        let mut table = self.table.write().await;
        let txn = table
            .transactions
            .get_mut(key)
            .ok_or(TransactionError::NotFound)?;

        if matches!(
            txn.state,
            TransactionState::Completed | TransactionState::Confirmed | TransactionState::Terminated
        ) {
            // A final response was already sent; later ones are not recorded
            return Ok(txn.state);
        }

        let old_state = txn.state;
        if response.is_provisional() {
            txn.state = TransactionState::Proceeding;
        } else {
            txn.state = TransactionState::Completed;
            txn.deadline = Some((
                Instant::now() + self.config.retention,
                DeadlineKind::Terminate,
            ));
        }
        txn.last_response = Some(response.clone());

        debug!(
            "Transaction {} recorded {}: {} -> {}",
            key,
            response.status_code(),
            old_state.name(),
            txn.state.name()
        );
        Ok(txn.state)
    }

    /// Match an ACK to its INVITE transaction.
    ///
    /// Returns true when the ACK belongs to a non-2xx final response sent by
    /// this proxy and must be absorbed.
    pub async fn match_ack(&self, ack: &SipRequest) -> bool {
        let Ok(key) = TransactionKey::invite_for(ack) else {
            return false;
        };

        let mut table = self.table.write().await;
        let Some(txn) = table.transactions.get_mut(&key) else {
            return false;
        };

        match txn.state {
            TransactionState::Completed => {
                txn.state = TransactionState::Confirmed;
                if txn.transport.is_reliable() {
                    debug!("Transaction {} confirmed, terminating", key);
                    table.remove(&key);
                } else {
                    txn.deadline = Some((
                        Instant::now() + self.config.timers.t4,
                        DeadlineKind::Terminate,
                    ));
                    debug!("Transaction {} confirmed", key);
                }
                true
            }
            // ACK retransmission
            TransactionState::Confirmed => true,
            _ => false,
        }
    }

    /// Find the INVITE transaction a CANCEL refers to
    pub async fn match_cancel(&self, cancel: &SipRequest) -> Option<Transaction> {
        let key = TransactionKey::invite_for(cancel).ok()?;
        self.table.read().await.transactions.get(&key).cloned()
    }

    /// Remember the downstream leg of a relayed request and return its branch
    pub async fn bind_forward(
        &self,
        key: &TransactionKey,
        destination: SocketAddr,
        transport: TransportProtocol,
        forwarded: SipRequest,
        branch: String,
    ) -> Result<(), TransactionError> {
        let mut table = self.table.write().await;
        let txn = table
            .transactions
            .get_mut(key)
            .ok_or(TransactionError::NotFound)?;

        txn.forward = Some(ForwardBranch {
            branch: branch.clone(),
            destination,
            transport,
            request: forwarded,
        });
        if !txn.has_final_response() && key.method != "ACK" {
            txn.deadline = Some((
                Instant::now() + self.config.client_timeout,
                DeadlineKind::ClientTimeout,
            ));
        }
        table.branches.insert(branch, key.clone());
        Ok(())
    }

    /// Server transaction owning a downstream branch
    pub async fn match_branch(&self, branch: &str) -> Option<Transaction> {
        let table = self.table.read().await;
        let key = table.branches.get(branch)?;
        table.transactions.get(key).cloned()
    }

    pub async fn get_transaction(&self, key: &TransactionKey) -> Option<Transaction> {
        self.table.read().await.transactions.get(key).cloned()
    }

    /// Terminate and forget a transaction, dropping its pending deadline
    pub async fn terminate(&self, key: &TransactionKey) -> bool {
        self.table.write().await.remove(key).is_some()
    }

    /// Get count of active transactions
    pub async fn transaction_count(&self) -> usize {
        self.table.read().await.transactions.len()
    }

    /// Fire every deadline that has passed: expired entries are removed,
    /// client timeouts are reported
    pub async fn sweep(&self) -> Vec<TransactionEvent> {
        let now = Instant::now();
        let mut table = self.table.write().await;
        let mut events = Vec::new();
        let mut expired = Vec::new();

        for (key, txn) in table.transactions.iter_mut() {
            match txn.deadline {
                Some((at, DeadlineKind::Terminate)) if at <= now => {
                    txn.state = TransactionState::Terminated;
                    expired.push(key.clone());
                }
                Some((at, DeadlineKind::ClientTimeout)) if at <= now => {
                    txn.deadline = Some((now + self.config.retention, DeadlineKind::Terminate));
                    warn!("Transaction {} timed out waiting for downstream", key);
                    events.push(TransactionEvent::Timeout(txn.clone()));
                }
                _ => {}
            }
        }

        for key in expired {
            debug!("Removing terminated transaction {}", key);
            table.remove(&key);
        }
        events
    }

    /// Run the sweep every `interval`, forwarding events to `events`
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        events: mpsc::UnboundedSender<TransactionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Transaction sweep started (interval {:?})", interval);
            loop {
                tokio::time::sleep(interval).await;
                for event in self.sweep().await {
                    if events.send(event).is_err() {
                        info!("Transaction event receiver closed, stopping sweep");
                        return;
                    }
                }
            }
        })
    }
}

impl Default for TransactionLayer {
    fn default() -> Self {
        Self::new(TransactionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::builder::ResponseBuilder;

    fn source() -> SocketAddr {
        "10.0.0.5:5060".parse().unwrap()
    }

    fn create_test_request(method: &str, cseq_method: &str, branch: &str) -> SipRequest {
        let request_str = format!(
            "{} sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch={}\r\n\
             From: <sip:alice@example.com>;tag=a1\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: test-123\r\n\
             CSeq: 1 {}\r\n\
             Content-Length: 0\r\n\r\n",
            method, branch, cseq_method
        );
        SipRequest::parse(request_str.as_bytes()).unwrap()
    }

    fn respond(request: &SipRequest, status: u16) -> SipResponse {
        ResponseBuilder::new(status).build_for_request(request).unwrap()
    }

    #[test]
    fn test_generate_branch() {
        let branch = generate_branch();
        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert_ne!(branch, generate_branch());
    }

    #[test]
    fn test_ack_and_cancel_key_to_invite() {
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let ack = create_test_request("ACK", "ACK", "z9hG4bK1");
        let cancel = create_test_request("CANCEL", "CANCEL", "z9hG4bK1");

        let key = TransactionKey::from_request(&invite).unwrap();
        assert_eq!(TransactionKey::invite_for(&ack).unwrap(), key);
        assert_eq!(TransactionKey::invite_for(&cancel).unwrap(), key);
        assert_ne!(TransactionKey::from_request(&cancel).unwrap(), key);
    }

    #[tokio::test]
    async fn test_initial_states() {
        let layer = TransactionLayer::default();
        let (invite, retrans) = layer
            .match_or_create(
                &create_test_request("INVITE", "INVITE", "z9hG4bK1"),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();
        assert!(!retrans);
        assert_eq!(invite.state, TransactionState::Proceeding);

        let (options, _) = layer
            .match_or_create(
                &create_test_request("OPTIONS", "OPTIONS", "z9hG4bK2"),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();
        assert_eq!(options.state, TransactionState::Trying);
    }

    #[tokio::test]
    async fn test_retransmission_replays_last_response() {
        let layer = TransactionLayer::default();
        let request = create_test_request("REGISTER", "REGISTER", "z9hG4bK1");

        let (txn, _) = layer
            .match_or_create(&request, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        let (_, retrans) = layer
            .match_or_create(&request, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        assert!(retrans);

        let response = respond(&request, 200);
        let state = layer.record_response(&txn.key, &response).await.unwrap();
        assert_eq!(state, TransactionState::Completed);

        let (again, retrans) = layer
            .match_or_create(&request, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        assert!(retrans);
        assert_eq!(
            again.last_response.map(|r| r.to_bytes()),
            Some(response.to_bytes())
        );
    }

    #[tokio::test]
    async fn test_capacity_sheds_without_state() {
        let layer = TransactionLayer::new(TransactionConfig {
            max_transactions: 1,
            ..TransactionConfig::default()
        });
        layer
            .match_or_create(
                &create_test_request("OPTIONS", "OPTIONS", "z9hG4bK1"),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();

        let result = layer
            .match_or_create(
                &create_test_request("OPTIONS", "OPTIONS", "z9hG4bK2"),
                source(),
                TransportProtocol::Udp,
            )
            .await;
        assert_eq!(result.unwrap_err(), TransactionError::ResourceExhausted(1));
        assert_eq!(layer.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn test_ack_confirms_and_reliable_terminates() {
        let layer = TransactionLayer::default();
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let ack = create_test_request("ACK", "ACK", "z9hG4bK1");

        let (txn, _) = layer
            .match_or_create(&invite, source(), TransportProtocol::Tcp)
            .await
            .unwrap();

        // No final response yet: the ACK is not ours
        assert!(!layer.match_ack(&ack).await);

        layer
            .record_response(&txn.key, &respond(&invite, 486))
            .await
            .unwrap();
        assert!(layer.match_ack(&ack).await);
        assert!(layer.get_transaction(&txn.key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_udp_ack_kept_for_t4() {
        let layer = TransactionLayer::default();
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let ack = create_test_request("ACK", "ACK", "z9hG4bK1");

        let (txn, _) = layer
            .match_or_create(&invite, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        layer
            .record_response(&txn.key, &respond(&invite, 404))
            .await
            .unwrap();

        assert!(layer.match_ack(&ack).await);
        assert_eq!(
            layer.get_transaction(&txn.key).await.unwrap().state,
            TransactionState::Confirmed
        );
        // Retransmitted ACK still absorbed
        assert!(layer.match_ack(&ack).await);

        tokio::time::advance(Duration::from_secs(6)).await;
        layer.sweep().await;
        assert!(layer.get_transaction(&txn.key).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_expiry() {
        let layer = TransactionLayer::default();
        let request = create_test_request("REGISTER", "REGISTER", "z9hG4bK1");
        let (txn, _) = layer
            .match_or_create(&request, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        layer
            .record_response(&txn.key, &respond(&request, 200))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        layer.sweep().await;
        assert_eq!(layer.transaction_count().await, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        layer.sweep().await;
        assert_eq!(layer.transaction_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_branch_and_client_timeout() {
        let layer = TransactionLayer::default();
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let (txn, _) = layer
            .match_or_create(&invite, source(), TransportProtocol::Udp)
            .await
            .unwrap();

        let branch = generate_branch();
        layer
            .bind_forward(
                &txn.key,
                "10.0.0.9:5060".parse().unwrap(),
                TransportProtocol::Udp,
                invite.clone(),
                branch.clone(),
            )
            .await
            .unwrap();
        assert_eq!(layer.match_branch(&branch).await.unwrap().key, txn.key);

        tokio::time::advance(Duration::from_secs(33)).await;
        let events = layer.sweep().await;
        assert_eq!(events.len(), 1);
        let TransactionEvent::Timeout(timed_out) = &events[0];
        assert_eq!(timed_out.key, txn.key);

        // Reported once
        assert!(layer.sweep().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_transaction_is_swept() {
        let layer = TransactionLayer::default();
        layer
            .match_or_create(
                &create_test_request("REGISTER", "REGISTER", "z9hG4bKmute"),
                source(),
                TransportProtocol::Udp,
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(layer.sweep().await.is_empty());
        assert_eq!(layer.transaction_count().await, 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(layer.sweep().await.is_empty());
        assert_eq!(layer.transaction_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_transaction_removed_without_answer() {
        let layer = TransactionLayer::default();
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let (txn, _) = layer
            .match_or_create(&invite, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        layer
            .bind_forward(
                &txn.key,
                "10.0.0.9:5060".parse().unwrap(),
                TransportProtocol::Udp,
                invite,
                generate_branch(),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(33)).await;
        assert_eq!(layer.sweep().await.len(), 1);

        tokio::time::advance(Duration::from_secs(33)).await;
        layer.sweep().await;
        assert_eq!(layer.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_terminate_drops_branch() {
        let layer = TransactionLayer::default();
        let invite = create_test_request("INVITE", "INVITE", "z9hG4bK1");
        let (txn, _) = layer
            .match_or_create(&invite, source(), TransportProtocol::Udp)
            .await
            .unwrap();
        layer
            .bind_forward(
                &txn.key,
                "10.0.0.9:5060".parse().unwrap(),
                TransportProtocol::Udp,
                invite,
                "z9hG4bKdown".to_string(),
            )
            .await
            .unwrap();

        assert!(layer.terminate(&txn.key).await);
        assert!(layer.match_branch("z9hG4bKdown").await.is_none());
    }
}
