//! Discovery: find every other context in the tree that runs this code.
//!
//! One context plays the `Server` role (the sidebar, which owns the annotation
//! set); any number play `Client` (annotatable documents). The handshake:
//!
//! 1. On start, servers and clients walk the tree top-down, breadth-first,
//!    and post `offer` (server) or `discovery` (client) to every context
//!    except their own.
//! 2. Clients answer an `offer` with `request`, one at a time.
//! 3. Servers answer `discovery` with `offer`.
//! 4. Servers answer `request` with `ack:<token>`, minting a fresh token, and
//!    report the peer. Clients report the peer when they see the `ack`.
//!
//! A server that receives `offer` or `ack` has found a second server in the
//! same tree. That is fatal: the session stops and the error is published.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::context::{Context, ContextId, Listener, ListenerId, OPAQUE_ORIGIN, WILDCARD_ORIGIN};
use crate::error::DiscoveryError;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "cross_frame";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DiscoveryOptions {
    pub role: Role,
    /// Origin allowed to receive beacons; `*` for any
    pub origin: String,
    /// Message prefix is `__<namespace>_dhcp_`
    pub namespace: String,
}

impl DiscoveryOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            origin: WILDCARD_ORIGIN.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Discovery,
    Offer,
    Request,
    Ack,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Discovery => "discovery",
            MessageKind::Offer => "offer",
            MessageKind::Request => "request",
            MessageKind::Ack => "ack",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(MessageKind::Discovery),
            "offer" => Some(MessageKind::Offer),
            "request" => Some(MessageKind::Request),
            "ack" => Some(MessageKind::Ack),
            _ => None,
        }
    }
}

/// One handshake message: a kind, optionally suffixed with a numeric token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryMessage {
    pub kind: MessageKind,
    pub token: Option<String>,
}

impl DiscoveryMessage {
    pub fn new(kind: MessageKind) -> Self {
        Self { kind, token: None }
    }

    pub fn ack(token: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Ack,
            token: Some(token.into()),
        }
    }

    /// Parse `__<namespace>_dhcp_<kind>[:<digits>]`. Anything else is `None`.
    pub fn parse(namespace: &str, data: &str) -> Option<Self> {
        let body = data
            .strip_prefix("__")?
            .strip_prefix(namespace)?
            .strip_prefix("_dhcp_")?;
        let (kind, token) = match body.split_once(':') {
            Some((kind, token)) => {
                if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                (kind, Some(token.to_string()))
            }
            None => (body, None),
        };
        Some(Self {
            kind: MessageKind::parse(kind)?,
            token,
        })
    }

    pub fn format(&self, namespace: &str) -> String {
        match &self.token {
            Some(token) => format!("__{namespace}_dhcp_{}:{token}", self.kind.as_str()),
            None => format!("__{namespace}_dhcp_{}", self.kind.as_str()),
        }
    }
}

/// What to do after processing one message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Message to post back to the sender
    pub reply: Option<DiscoveryMessage>,
    /// Token of a completed handshake with the sender
    pub discovered: Option<String>,
}

/// Role-specific handshake state, free of any I/O.
#[derive(Debug)]
pub struct DiscoveryState {
    role: Role,
    /// Client only: waiting for the `ack` to a `request` already sent
    request_in_progress: bool,
    /// Server only: every token minted so far
    issued: HashSet<String>,
}

impl DiscoveryState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            request_in_progress: false,
            issued: HashSet::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn request_in_progress(&self) -> bool {
        self.request_in_progress
    }

    pub fn process(
        &mut self,
        message: &DiscoveryMessage,
        origin: &str,
    ) -> Result<Transition, DiscoveryError> {
        match self.role {
            Role::Server => self.process_as_server(message, origin),
            Role::Client => Ok(self.process_as_client(message)),
        }
    }

    fn process_as_server(
        &mut self,
        message: &DiscoveryMessage,
        origin: &str,
    ) -> Result<Transition, DiscoveryError> {
        match message.kind {
            MessageKind::Discovery => Ok(Transition {
                reply: Some(DiscoveryMessage::new(MessageKind::Offer)),
                discovered: None,
            }),
            MessageKind::Request => {
                let token = self.generate_token();
                Ok(Transition {
                    reply: Some(DiscoveryMessage::ack(token.clone())),
                    discovered: Some(token),
                })
            }
            MessageKind::Offer | MessageKind::Ack => Err(DiscoveryError::SecondServer {
                origin: origin.to_string(),
            }),
        }
    }

    fn process_as_client(&mut self, message: &DiscoveryMessage) -> Transition {
        match message.kind {
            MessageKind::Offer if !self.request_in_progress => {
                self.request_in_progress = true;
                Transition {
                    reply: Some(DiscoveryMessage::new(MessageKind::Request)),
                    discovered: None,
                }
            }
            MessageKind::Ack => {
                self.request_in_progress = false;
                Transition {
                    reply: None,
                    discovered: message.token.clone(),
                }
            }
            _ => Transition::default(),
        }
    }

    fn generate_token(&mut self) -> String {
        loop {
            let token = rand::random::<u64>().to_string();
            if self.issued.insert(token.clone()) {
                return token;
            }
        }
    }
}

/// Origins a reply can't be addressed to are treated as same-origin.
fn effective_origin(event_origin: &str, local_origin: &str) -> String {
    if event_origin == OPAQUE_ORIGIN
        || event_origin.starts_with("moz-extension:")
        || local_origin.starts_with("moz-extension:")
    {
        WILDCARD_ORIGIN.to_string()
    } else {
        event_origin.to_string()
    }
}

fn claim_key(role: Role) -> String {
    format!("discovery:{role}")
}

/// Invoked with `(peer, peer_origin, token)` for every completed handshake.
pub type DiscoveryCallback = Arc<dyn Fn(ContextId, String, String) + Send + Sync>;

struct Session {
    listener: ListenerId,
    cancel: CancellationToken,
}

/// A discovery session bound to one context.
pub struct Discovery {
    context: Context,
    options: DiscoveryOptions,
    session: Arc<Mutex<Option<Session>>>,
    fatal: watch::Sender<Option<DiscoveryError>>,
}

impl Discovery {
    pub fn new(context: Context, options: DiscoveryOptions) -> Self {
        let (fatal, _) = watch::channel(None);
        Self {
            context,
            options,
            session: Arc::new(Mutex::new(None)),
            fatal,
        }
    }

    pub fn role(&self) -> Role {
        self.options.role
    }

    fn claim_key(&self) -> String {
        claim_key(self.options.role)
    }

    /// Start listening for handshake messages and announce this context to
    /// every other context in the tree. Must be called inside a tokio runtime.
    pub fn start_discovery<F>(&self, on_discovery: F) -> Result<(), DiscoveryError>
    where
        F: Fn(ContextId, String, String) + Send + Sync + 'static,
    {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some() || !self.context.try_claim(&self.claim_key()) {
            return Err(DiscoveryError::AlreadyInProgress(self.options.role));
        }

        let listener = match self.context.add_listener() {
            Ok(listener) => listener,
            Err(e) => {
                self.context.release_claim(&self.claim_key());
                return Err(e.into());
            }
        };
        let cancel = CancellationToken::new();
        *session = Some(Session {
            listener: listener.id(),
            cancel: cancel.clone(),
        });
        drop(session);

        tokio::spawn(run_listener(
            listener,
            self.context.clone(),
            self.options.clone(),
            Arc::new(on_discovery),
            cancel,
            self.session.clone(),
            self.fatal.clone(),
        ));

        info!(
            context = %self.context.id(),
            role = %self.options.role,
            "discovery started"
        );
        self.beacon();
        Ok(())
    }

    /// Stop listening. No message is sent: peers have no notion of being
    /// "undiscovered".
    pub fn stop_discovery(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
            self.context.remove_listener(session.listener);
            self.context.release_claim(&self.claim_key());
            debug!(context = %self.context.id(), "discovery stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The topology error that stopped this session, if any.
    pub fn fatal_error(&self) -> Option<DiscoveryError> {
        self.fatal.borrow().clone()
    }

    /// Watch for the topology error that stops this session.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<DiscoveryError>> {
        self.fatal.subscribe()
    }

    /// Resolves once a fatal error has stopped this session.
    pub async fn wait_fatal(&self) -> Option<DiscoveryError> {
        let mut rx = self.fatal.subscribe();
        rx.wait_for(Option::is_some).await.ok().and_then(|e| e.clone())
    }

    fn beacon(&self) {
        let message = match self.options.role {
            Role::Server => DiscoveryMessage::new(MessageKind::Offer),
            Role::Client => DiscoveryMessage::new(MessageKind::Discovery),
        };
        let data = Value::String(message.format(&self.options.namespace));
        let tree = self.context.tree();
        for target in tree.breadth_first(self.context.top()) {
            if target == self.context.id() {
                continue;
            }
            if let Err(e) = self
                .context
                .post_message(target, data.clone(), &self.options.origin)
            {
                debug!(target = %target, error = %e, "beacon not delivered");
            }
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop_discovery();
    }
}

async fn run_listener(
    mut listener: Listener,
    context: Context,
    options: DiscoveryOptions,
    on_discovery: DiscoveryCallback,
    cancel: CancellationToken,
    session: Arc<Mutex<Option<Session>>>,
    fatal: watch::Sender<Option<DiscoveryError>>,
) {
    let mut state = DiscoveryState::new(options.role);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = listener.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(message) = event
            .data
            .as_str()
            .and_then(|data| DiscoveryMessage::parse(&options.namespace, data))
        else {
            continue;
        };
        let origin = effective_origin(&event.origin, context.origin());
        trace!(from = %event.source, kind = message.kind.as_str(), "discovery message");

        match state.process(&message, &origin) {
            Ok(transition) => {
                if let Some(reply) = transition.reply {
                    let data = Value::String(reply.format(&options.namespace));
                    if let Err(e) = context.post_message(event.source, data, &origin) {
                        debug!(peer = %event.source, error = %e, "discovery reply not delivered");
                    }
                }
                if let Some(token) = transition.discovered {
                    info!(peer = %event.source, origin = %origin, "discovered peer");
                    on_discovery(event.source, origin, token);
                }
            }
            Err(err) => {
                error!(error = %err, "discovery stopped on topology error");
                context.remove_listener(listener.id());
                // Only end the session this task belongs to.
                let mut current = session.lock().unwrap_or_else(PoisonError::into_inner);
                if current.as_ref().is_some_and(|s| s.listener == listener.id()) {
                    *current = None;
                    context.release_claim(&claim_key(options.role));
                }
                drop(current);
                fatal.send_replace(Some(err));
                break;
            }
        }
    }
}
