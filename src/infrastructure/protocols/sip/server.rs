//! SIP server: wires the listener, router and background timers together

use super::auth::DigestAuth;
use super::dispatch::{Dispatcher, DEFAULT_QUEUE_IDLE};
use super::message::SipError;
use super::registrar::{Registrar, RegistrarConfig};
use super::relay::{Relay, RelayConfig};
use super::router::{RequestRouter, RouterConfig};
use super::transaction::{TransactionConfig, TransactionEvent, TransactionLayer};
use super::transport::{IncomingMessage, ListenEndpoint, SipTransport, Transport};
use crate::domain::access_control::AccessGuard;
use crate::domain::location::LocationService;
use crate::infrastructure::metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Inbound messages buffered between the listeners and the router
const INCOMING_QUEUE: usize = 4096;

/// SIP server configuration
#[derive(Debug, Clone)]
pub struct SipServerConfig {
    pub listen: Vec<ListenEndpoint>,
    pub relay: RelayConfig,
    pub router: RouterConfig,
    pub registrar: RegistrarConfig,
    pub transaction: TransactionConfig,
    pub sweep_interval: Duration,
    /// Binding, nonce and access-table cleanup
    pub reaper_interval: Duration,
}

impl Default for SipServerConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            relay: RelayConfig::default(),
            router: RouterConfig::default(),
            registrar: RegistrarConfig::default(),
            transaction: TransactionConfig::default(),
            sweep_interval: Duration::from_millis(50),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

/// SIP server
pub struct SipServer {
    config: SipServerConfig,
    transport: Arc<SipTransport>,
    transactions: Arc<TransactionLayer>,
    location: Arc<LocationService>,
    access: Arc<AccessGuard>,
    auth: Option<Arc<DigestAuth>>,
    router: Arc<RequestRouter>,
    tls: Option<TlsAcceptor>,
    incoming: Option<mpsc::Receiver<IncomingMessage>>,
    tasks: Vec<JoinHandle<()>>,
}

impl SipServer {
    pub fn new(
        config: SipServerConfig,
        location: Arc<LocationService>,
        access: Arc<AccessGuard>,
        auth: Option<Arc<DigestAuth>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INCOMING_QUEUE);
        let transport = Arc::new(SipTransport::new(tx));
        let transactions = Arc::new(TransactionLayer::new(config.transaction.clone()));

        let mut registrar = Registrar::new(location.clone(), config.registrar.clone())
            .with_access_guard(access.clone());
        if let Some(auth) = &auth {
            registrar = registrar.with_auth(auth.clone());
        }

        let sender: Arc<dyn Transport> = transport.clone();
        let relay = Arc::new(Relay::new(
            sender,
            transactions.clone(),
            config.relay.clone(),
        ));
        let router = Arc::new(RequestRouter::new(
            config.router.clone(),
            access.clone(),
            transactions.clone(),
            Arc::new(registrar),
            relay,
        ));

        Self {
            config,
            transport,
            transactions,
            location,
            access,
            auth,
            router,
            tls: None,
            incoming: Some(rx),
            tasks: Vec::new(),
        }
    }

    /// Acceptor used by TLS endpoints
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn transport(&self) -> &Arc<SipTransport> {
        &self.transport
    }

    pub fn transactions(&self) -> &Arc<TransactionLayer> {
        &self.transactions
    }

    pub fn location(&self) -> &Arc<LocationService> {
        &self.location
    }

    /// Bind every endpoint and start routing
    pub async fn start(&mut self) -> Result<(), SipError> {
        let mut incoming = self
            .incoming
            .take()
            .ok_or_else(|| SipError::Internal("SIP server already started".to_string()))?;
        if self.config.listen.is_empty() {
            return Err(SipError::TransportError("no listen endpoint configured".to_string()));
        }

        info!("Starting SIP server");
        info!("Advertised address: {}", self.config.relay.advertised_host);
        info!("Local domains: {:?}", self.config.relay.local_domains);

        for endpoint in &self.config.listen {
            self.tasks
                .push(self.transport.spawn_endpoint(endpoint.clone(), self.tls.clone()));
        }

        let mut dispatcher = Dispatcher::new(self.router.clone(), DEFAULT_QUEUE_IDLE);
        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                dispatcher.dispatch(message);
            }
            info!("Incoming message channel closed");
        }));

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        self.tasks.push(
            self.transactions
                .clone()
                .spawn_sweeper(self.config.sweep_interval, events_tx),
        );
        let router = self.router.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(TransactionEvent::Timeout(transaction)) = events_rx.recv().await {
                router.handle_timeout(transaction).await;
            }
        }));

        self.tasks.push(
            self.location
                .clone()
                .spawn_reaper(self.config.reaper_interval),
        );
        self.tasks.push(self.spawn_housekeeping());

        info!("SIP server started successfully");
        Ok(())
    }

    /// Expire nonces and access entries, refresh the gauges
    fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let access = self.access.clone();
        let auth = self.auth.clone();
        let transactions = self.transactions.clone();
        let location = self.location.clone();
        let interval = self.config.reaper_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let unblocked = access.cleanup_expired();
                let nonces = auth.as_ref().map(|a| a.cleanup_nonces()).unwrap_or(0);
                if unblocked > 0 || nonces > 0 {
                    debug!("Expired {} block entries and {} nonces", unblocked, nonces);
                }

                metrics::update_active_transactions(transactions.transaction_count().await);
                match location.binding_count().await {
                    Ok(count) => metrics::update_location_bindings(count),
                    Err(e) => warn!("Could not count bindings: {}", e),
                }
            }
        })
    }

    pub async fn stop(&mut self) -> Result<(), SipError> {
        info!("Stopping SIP server");
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("SIP server stopped");
        Ok(())
    }
}
