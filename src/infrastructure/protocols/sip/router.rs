//! Request router
//!
//! Every inbound message is classified, then requests walk an ordered stage
//! pipeline until one stage replies, forwards or drops them. Responses from
//! downstream are correlated by branch and relayed back upstream.

use super::builder::ResponseBuilder;
use super::error::RouteError;
use super::message::{HeaderAccess, SipMessage, SipMethod, SipRequest, SipResponse};
use super::registrar::Registrar;
use super::relay::{Destination, Relay};
use super::rport::add_rport_and_received;
use super::transaction::{Transaction, TransactionError, TransactionKey, TransactionLayer};
use super::transport::{IncomingMessage, TransportProtocol};
use crate::domain::access_control::AccessGuard;
use crate::domain::shared::value_objects::SipUri;
use crate::infrastructure::metrics;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What kind of message arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageClass {
    InitialRequest,
    /// To header carries a tag
    InDialogRequest,
    Response,
    Malformed(String),
}

/// Classify an inbound message
pub fn classify(message: &SipMessage) -> MessageClass {
    match message {
        SipMessage::Request(request) => classify_request(request),
        SipMessage::Response(_) => MessageClass::Response,
    }
}

pub fn classify_request(request: &SipRequest) -> MessageClass {
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if !request.has_header(name) {
            return MessageClass::Malformed(format!("missing {}", name));
        }
    }

    let cseq = request.header("CSeq").unwrap_or_default();
    let mut parts = cseq.split_whitespace();
    let number_ok = parts.next().map(|n| n.parse::<u32>().is_ok()).unwrap_or(false);
    let cseq_method = parts.next();
    if !number_ok || cseq_method.is_none() || parts.next().is_some() {
        return MessageClass::Malformed(format!("bad CSeq '{}'", cseq));
    }
    if cseq_method != Some(request.method_name().as_str()) {
        return MessageClass::Malformed(format!(
            "CSeq method {} does not match {}",
            cseq_method.unwrap_or_default(),
            request.method_name()
        ));
    }

    match request.to_tag() {
        Some(tag) if !tag.is_empty() => MessageClass::InDialogRequest,
        _ => MessageClass::InitialRequest,
    }
}

/// How routing a message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Answered locally with this status
    Replied(u16),
    /// Stored response re-sent for a retransmission
    Replayed,
    /// Consumed without any output
    Absorbed,
    Forwarded,
    Dropped(&'static str),
}

/// Request pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Access,
    ReqInit,
    Transaction,
    WithinDialog,
    Registrar,
    Location,
    Relay,
}

impl Stage {
    pub const PIPELINE: [Stage; 7] = [
        Stage::Access,
        Stage::ReqInit,
        Stage::Transaction,
        Stage::WithinDialog,
        Stage::Registrar,
        Stage::Location,
        Stage::Relay,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Access => "ACCESS",
            Stage::ReqInit => "REQINIT",
            Stage::Transaction => "TRANSACTION",
            Stage::WithinDialog => "WITHINDLG",
            Stage::Registrar => "REGISTRAR",
            Stage::Location => "LOCATION",
            Stage::Relay => "RELAY",
        }
    }
}

enum StageResult {
    Continue,
    Exit(RouteOutcome),
}

type StageOutput = Result<StageResult, RouteError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Max-Forwards set on requests that arrive without one
    pub max_forwards: u32,
    /// Relay requests for domains this proxy does not serve
    pub relay_foreign_domains: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_forwards: 70,
            relay_foreign_domains: false,
        }
    }
}

/// Per-request state carried through the pipeline
struct RequestContext {
    request: SipRequest,
    method: Option<SipMethod>,
    source: SocketAddr,
    transport: TransportProtocol,
    class: MessageClass,
    /// Server transaction, once the TRANSACTION stage created it
    transaction: Option<TransactionKey>,
    /// Routing decision; empty until a stage picks the next hop
    destinations: Vec<Destination>,
}

impl RequestContext {
    fn is(&self, method: SipMethod) -> bool {
        self.method == Some(method)
    }
}

pub struct RequestRouter {
    config: RouterConfig,
    access: Arc<AccessGuard>,
    transactions: Arc<TransactionLayer>,
    registrar: Arc<Registrar>,
    relay: Arc<Relay>,
}

impl RequestRouter {
    pub fn new(
        config: RouterConfig,
        access: Arc<AccessGuard>,
        transactions: Arc<TransactionLayer>,
        registrar: Arc<Registrar>,
        relay: Arc<Relay>,
    ) -> Self {
        Self {
            config,
            access,
            transactions,
            registrar,
            relay,
        }
    }

    pub fn transactions(&self) -> &Arc<TransactionLayer> {
        &self.transactions
    }

    /// Route one inbound message. Never fails: errors become SIP answers.
    pub async fn route(&self, incoming: IncomingMessage) -> RouteOutcome {
        let IncomingMessage {
            message,
            source,
            protocol,
        } = incoming;
        match message {
            SipMessage::Request(request) => {
                metrics::record_request(&request.method_name(), protocol.as_str());
                self.route_request(request, source, protocol).await
            }
            SipMessage::Response(response) => self.route_response(response, source).await,
        }
    }

    async fn route_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
        transport: TransportProtocol,
    ) -> RouteOutcome {
        let mut ctx = RequestContext {
            method: request.method(),
            class: classify_request(&request),
            request,
            source,
            transport,
            transaction: None,
            destinations: Vec::new(),
        };
        debug!(
            "{} {} from {} over {} ({:?})",
            ctx.request.method_name(),
            ctx.request.uri_string(),
            source,
            transport,
            ctx.class
        );

        for stage in Stage::PIPELINE {
            let result = match stage {
                Stage::Access => self.access_stage(&ctx),
                Stage::ReqInit => self.request_init(&mut ctx).await,
                Stage::Transaction => self.transaction_stage(&mut ctx).await,
                Stage::WithinDialog => self.within_dialog(&mut ctx),
                Stage::Registrar => self.registrar_stage(&ctx).await,
                Stage::Location => self.location_stage(&mut ctx).await,
                Stage::Relay => self.relay_stage(&ctx).await,
            };
            match result {
                Ok(StageResult::Continue) => {}
                Ok(StageResult::Exit(outcome)) => {
                    debug!("{} finished in {}: {:?}", ctx.request.method_name(), stage.name(), outcome);
                    return outcome;
                }
                Err(e) => {
                    debug!("{} failed in {}: {}", ctx.request.method_name(), stage.name(), e);
                    return self.reply_error(&ctx, e).await;
                }
            }
        }

        RouteOutcome::Dropped("no stage took the request")
    }

    fn access_stage(&self, ctx: &RequestContext) -> StageOutput {
        match self.access.check(&ctx.source.ip()) {
            Ok(()) => Ok(StageResult::Continue),
            Err(denied) => {
                metrics::record_access_denied(denied.as_str());
                if ctx.is(SipMethod::Ack) {
                    return Ok(StageResult::Exit(RouteOutcome::Dropped("source refused")));
                }
                Err(RouteError::Forbidden(denied))
            }
        }
    }

    async fn request_init(&self, ctx: &mut RequestContext) -> StageOutput {
        if let Some(top) = ctx.request.top_via() {
            let stamped = add_rport_and_received(&top, ctx.source)
                .map_err(|e| RouteError::MalformedMessage(e.to_string()))?;
            ctx.request.replace_top_via(&stamped);
        }

        let max_forwards = ctx
            .request
            .max_forwards()
            .map_err(|e| RouteError::MalformedMessage(e.to_string()))?;
        match max_forwards {
            None => ctx.request.set_max_forwards(self.config.max_forwards),
            Some(0) | Some(1) => return Err(RouteError::HopLimitExceeded),
            Some(hops) => ctx.request.set_max_forwards(hops - 1),
        }

        if let MessageClass::Malformed(reason) = &ctx.class {
            warn!("Malformed request from {}: {}", ctx.source, reason);
            metrics::record_malformed(ctx.transport.as_str());
            return Err(RouteError::MalformedMessage(reason.clone()));
        }

        if ctx.is(SipMethod::Options) && ctx.class == MessageClass::InitialRequest {
            let to_self = SipUri::parse(&ctx.request.uri_string())
                .map(|uri| uri.user().is_none() && self.relay.config().is_own_uri(&uri))
                .unwrap_or(false);
            if to_self {
                let response = self.build(ctx, ResponseBuilder::ok())?;
                return Ok(StageResult::Exit(self.send_reply(ctx, response).await));
            }
        }

        Ok(StageResult::Continue)
    }

    async fn transaction_stage(&self, ctx: &mut RequestContext) -> StageOutput {
        match ctx.method {
            Some(SipMethod::Ack) => {
                if self.transactions.match_ack(&ctx.request).await {
                    return Ok(StageResult::Exit(RouteOutcome::Absorbed));
                }
                // ACK to a 2xx is a new transaction and travels in the dialog
                if ctx.class == MessageClass::InitialRequest {
                    return Ok(StageResult::Exit(RouteOutcome::Dropped(
                        "ACK matches no transaction",
                    )));
                }
                Ok(StageResult::Continue)
            }
            Some(SipMethod::Cancel) => self.cancel(ctx).await,
            _ => {
                let (transaction, retransmission) = match self
                    .transactions
                    .match_or_create(&ctx.request, ctx.source, ctx.transport)
                    .await
                {
                    Ok(found) => found,
                    Err(TransactionError::ResourceExhausted(_)) => {
                        metrics::record_transaction_shed();
                        return Err(RouteError::TransactionResourceExhausted);
                    }
                    Err(e) => return Err(RouteError::MalformedMessage(e.to_string())),
                };

                if retransmission {
                    metrics::record_retransmission(&ctx.request.method_name());
                    let outcome = match &transaction.last_response {
                        Some(response) => match self
                            .relay
                            .send_response(response, ctx.source, ctx.transport)
                            .await
                        {
                            Ok(()) => RouteOutcome::Replayed,
                            Err(_) => RouteOutcome::Dropped("replay failed"),
                        },
                        None => RouteOutcome::Absorbed,
                    };
                    return Ok(StageResult::Exit(outcome));
                }

                ctx.transaction = Some(transaction.key.clone());
                metrics::update_active_transactions(self.transactions.transaction_count().await);

                if transaction.key.is_invite() {
                    let trying = self.build(ctx, ResponseBuilder::new(100))?;
                    self.send_reply(ctx, trying).await;
                }
                Ok(StageResult::Continue)
            }
        }
    }

    async fn cancel(&self, ctx: &RequestContext) -> StageOutput {
        let invite = match self.transactions.match_cancel(&ctx.request).await {
            Some(invite) => invite,
            None => {
                debug!("CANCEL from {} matches no INVITE", ctx.source);
                return Ok(StageResult::Exit(RouteOutcome::Dropped(
                    "CANCEL matches no transaction",
                )));
            }
        };

        let ok = self.build(ctx, ResponseBuilder::ok())?;
        let outcome = self.send_reply(ctx, ok).await;
        if invite.has_final_response() {
            return Ok(StageResult::Exit(outcome));
        }

        let cancelled_downstream = match &invite.forward {
            Some(forward) => match self.relay.cancel_downstream(forward).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Could not cancel {} downstream: {}", invite.key, e);
                    false
                }
            },
            None => false,
        };
        if !cancelled_downstream {
            if let Ok(terminated) = ResponseBuilder::new(487).build_for_request(&invite.request) {
                self.respond_to_transaction(&invite, terminated).await;
            }
        }
        Ok(StageResult::Exit(outcome))
    }

    fn within_dialog(&self, ctx: &mut RequestContext) -> StageOutput {
        if ctx.class != MessageClass::InDialogRequest {
            return Ok(StageResult::Continue);
        }

        let had_route = !ctx.request.routes().is_empty();
        let top_is_own = ctx
            .request
            .routes()
            .first()
            .and_then(|route| SipUri::parse(route).ok())
            .map(|uri| self.relay.config().is_own_uri(&uri))
            .unwrap_or(false);
        if top_is_own {
            ctx.request.pop_route();
        }

        let destination = match ctx.request.routes().first() {
            Some(next) => Destination::from_uri(next)?,
            None if had_route || ctx.is(SipMethod::Ack) => {
                Destination::from_uri(&ctx.request.uri_string())?
            }
            None => {
                return Err(RouteError::NotHere(format!(
                    "in-dialog {} without Route",
                    ctx.request.method_name()
                )))
            }
        };
        ctx.destinations = vec![destination];
        Ok(StageResult::Continue)
    }

    async fn registrar_stage(&self, ctx: &RequestContext) -> StageOutput {
        if !ctx.is(SipMethod::Register) || !ctx.destinations.is_empty() {
            return Ok(StageResult::Continue);
        }
        let response = self
            .registrar
            .handle_register(&ctx.request, ctx.source, ctx.transport)
            .await?;
        Ok(StageResult::Exit(self.send_reply(ctx, response).await))
    }

    async fn location_stage(&self, ctx: &mut RequestContext) -> StageOutput {
        if !ctx.destinations.is_empty() {
            return Ok(StageResult::Continue);
        }

        let target = ctx.request.uri_string();
        let uri = SipUri::parse(&target)?;
        if uri.user().map(str::is_empty).unwrap_or(true) {
            return Err(RouteError::AddressIncomplete);
        }

        if !self.relay.config().is_own_uri(&uri) {
            if !self.config.relay_foreign_domains {
                return Err(RouteError::NotFound(format!("{} is not served here", uri.host())));
            }
            ctx.destinations = vec![Destination::from_uri(&target)?];
            return Ok(StageResult::Continue);
        }

        let aor = uri.address_of_record();
        let bindings = self.registrar.location().resolve(&aor).await?;
        if bindings.is_empty() {
            return Err(RouteError::NotFound(aor));
        }
        ctx.destinations = bindings
            .iter()
            .filter_map(|binding| match Destination::from_binding(binding) {
                Ok(destination) => Some(destination),
                Err(e) => {
                    warn!("Unusable contact {} for {}: {}", binding.contact, aor, e);
                    None
                }
            })
            .collect();
        if ctx.destinations.is_empty() {
            return Err(RouteError::TemporarilyUnavailable(aor));
        }
        debug!("{} resolved to {} destinations", aor, ctx.destinations.len());
        Ok(StageResult::Continue)
    }

    async fn relay_stage(&self, ctx: &RequestContext) -> StageOutput {
        if ctx.is(SipMethod::Ack) {
            let destination = ctx
                .destinations
                .first()
                .ok_or_else(|| RouteError::NotFound(ctx.request.uri_string()))?;
            self.relay.forward_stateless(&ctx.request, destination).await?;
            return Ok(StageResult::Exit(RouteOutcome::Forwarded));
        }

        let key = ctx
            .transaction
            .as_ref()
            .ok_or_else(|| RouteError::Unavailable("request has no transaction".to_string()))?;
        let record_route = ctx.class == MessageClass::InitialRequest
            && ctx.method.map(|m| m.creates_dialog()).unwrap_or(false);
        self.relay
            .relay(key, &ctx.request, &ctx.destinations, record_route)
            .await?;
        Ok(StageResult::Exit(RouteOutcome::Forwarded))
    }

    async fn route_response(&self, mut response: SipResponse, source: SocketAddr) -> RouteOutcome {
        let status = response.status_code();
        let branch = match response.branch() {
            Some(branch) => branch,
            None => return RouteOutcome::Dropped("response without branch"),
        };
        let transaction = match self.transactions.match_branch(&branch).await {
            Some(transaction) => transaction,
            None => {
                debug!("{} from {} matches no branch of ours", status, source);
                return RouteOutcome::Dropped("response for unknown branch");
            }
        };

        if status == 100 {
            return RouteOutcome::Absorbed;
        }

        if transaction.key.is_invite() && status >= 300 {
            if let Some(forward) = &transaction.forward {
                if let Err(e) = self.relay.ack_downstream(forward, &response).await {
                    warn!("Could not acknowledge {} downstream: {}", status, e);
                }
            }
        }

        let success = (200..300).contains(&status);
        if transaction.has_final_response() && !(transaction.key.is_invite() && success) {
            debug!("Absorbing late {} for {}", status, transaction.key);
            return RouteOutcome::Absorbed;
        }

        response.pop_via();
        match self.respond_to_transaction(&transaction, response).await {
            RouteOutcome::Replied(_) => RouteOutcome::Forwarded,
            other => other,
        }
    }

    /// A relayed request got no final answer in time: give up downstream
    /// and answer 408 upstream
    pub async fn handle_timeout(&self, transaction: Transaction) -> RouteOutcome {
        if transaction.has_final_response() {
            return RouteOutcome::Absorbed;
        }
        info!("No final response for {}, answering 408", transaction.key);
        if transaction.key.is_invite() {
            if let Some(forward) = &transaction.forward {
                if let Err(e) = self.relay.cancel_downstream(forward).await {
                    warn!("Could not cancel timed out {}: {}", transaction.key, e);
                }
            }
        }
        match RouteError::Timeout.to_response(&transaction.request) {
            Ok(response) => self.respond_to_transaction(&transaction, response).await,
            Err(e) => {
                warn!("Cannot answer timed out {}: {}", transaction.key, e);
                RouteOutcome::Dropped("timeout unanswerable")
            }
        }
    }

    fn build(&self, ctx: &RequestContext, builder: ResponseBuilder) -> Result<SipResponse, RouteError> {
        builder
            .build_for_request(&ctx.request)
            .map_err(|e| RouteError::MalformedMessage(e.to_string()))
    }

    async fn reply_error(&self, ctx: &RequestContext, error: RouteError) -> RouteOutcome {
        if ctx.is(SipMethod::Ack) {
            return RouteOutcome::Dropped("ACK is never answered");
        }
        match error.to_response(&ctx.request) {
            Ok(response) => self.send_reply(ctx, response).await,
            Err(e) => {
                warn!(
                    "Dropping {} from {}: {} (cannot answer: {})",
                    ctx.request.method_name(),
                    ctx.source,
                    error,
                    e
                );
                if let Some(key) = &ctx.transaction {
                    self.transactions.terminate(key).await;
                }
                RouteOutcome::Dropped("unanswerable request")
            }
        }
    }

    /// Answer the request in `ctx`, recording the answer in its transaction
    async fn send_reply(&self, ctx: &RequestContext, response: SipResponse) -> RouteOutcome {
        let status = response.status_code();
        if let Some(key) = &ctx.transaction {
            if let Err(e) = self.transactions.record_response(key, &response).await {
                debug!("Response {} not recorded for {}: {}", status, key, e);
            }
        }
        metrics::record_response(status);
        match self
            .relay
            .send_response(&response, ctx.source, ctx.transport)
            .await
        {
            Ok(()) => RouteOutcome::Replied(status),
            Err(_) => RouteOutcome::Dropped("response not sent"),
        }
    }

    async fn respond_to_transaction(
        &self,
        transaction: &Transaction,
        response: SipResponse,
    ) -> RouteOutcome {
        let status = response.status_code();
        if let Err(e) = self
            .transactions
            .record_response(&transaction.key, &response)
            .await
        {
            debug!("Response {} not recorded for {}: {}", status, transaction.key, e);
        }
        metrics::record_response(status);
        match self
            .relay
            .send_response(&response, transaction.source, transaction.transport)
            .await
        {
            Ok(()) => RouteOutcome::Replied(status),
            Err(_) => RouteOutcome::Dropped("response not sent"),
        }
    }
}
