use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, Sender};
use serde::Deserialize;

use super::identity::IdentityProvider;
use crate::error::NetError;

pub const GENERAL_HANDSHAKE_FAILURE: &str = "General handshake failure.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub params: BTreeMap<String, String>,
}

type ReplyMessage = (u64, Result<Vec<u8>, String>);

/// One-shot completion handle for a bootstrap request. May be completed from
/// any thread; the result is picked up on the next frame.
#[derive(Debug)]
pub struct BootstrapReply {
    generation: u64,
    tx: Sender<ReplyMessage>,
}

impl BootstrapReply {
    pub fn succeed(self, body: Vec<u8>) {
        let _ = self.tx.send((self.generation, Ok(body)));
    }

    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.tx.send((self.generation, Err(reason.into())));
    }
}

/// The out-of-band request/response exchange used to obtain a session token.
pub trait BootstrapTransport: Send {
    fn post(&mut self, request: BootstrapRequest, reply: BootstrapReply);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: String,
    pub protocol: u32,
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    Accepted(SessionGrant),
    /// The server answered with an error message.
    Rejected(String),
    /// Transport failure or an unreadable response.
    Failed(String),
    /// The server broke the handshake contract.
    Violation(NetError),
}

#[derive(Debug, Deserialize)]
struct BootstrapDocument {
    #[serde(rename = "authID")]
    auth_id: Option<u64>,
    error: Option<String>,
    token: Option<String>,
    protocol: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    AwaitingChallenge,
    AwaitingFinal,
}

#[derive(Debug)]
struct HandshakeRequest {
    request: BootstrapRequest,
    phase: HandshakePhase,
}

pub struct HandshakeClient {
    transport: Box<dyn BootstrapTransport>,
    identity: Arc<dyn IdentityProvider>,
    replies_tx: Sender<ReplyMessage>,
    replies_rx: Receiver<ReplyMessage>,
    generation: u64,
    pending: Option<HandshakeRequest>,
}

impl HandshakeClient {
    pub fn new(transport: Box<dyn BootstrapTransport>, identity: Arc<dyn IdentityProvider>) -> Self {
        let (replies_tx, replies_rx) = crossbeam_channel::unbounded();
        Self {
            transport,
            identity,
            replies_tx,
            replies_rx,
            generation: 0,
            pending: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn begin(&mut self, host: &str, port: u16, path: &str, name: &str, protocol: u32) {
        self.cancel();

        let mut params = BTreeMap::new();
        params.insert("method".to_string(), "initConnect".to_string());
        params.insert("name".to_string(), name.to_string());
        params.insert("protocol".to_string(), protocol.to_string());
        params.insert("guid".to_string(), self.identity.guid().to_string());

        let request = BootstrapRequest {
            host: host.to_string(),
            port,
            path: path.to_string(),
            params,
        };

        log::debug!("Bootstrapping session with {}:{}", host, port);

        self.pending = Some(HandshakeRequest {
            request: request.clone(),
            phase: HandshakePhase::AwaitingChallenge,
        });
        self.post(request);
    }

    /// Forgets the in-flight request. A late reply to it is discarded.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.pending = None;
    }

    fn post(&mut self, request: BootstrapRequest) {
        let reply = BootstrapReply {
            generation: self.generation,
            tx: self.replies_tx.clone(),
        };
        self.transport.post(request, reply);
    }

    /// Handles any replies that have arrived. Returns an outcome once the
    /// exchange has finished.
    pub fn poll(&mut self) -> Option<HandshakeOutcome> {
        while let Ok((generation, result)) = self.replies_rx.try_recv() {
            if generation != self.generation || self.pending.is_none() {
                log::debug!("Discarding stale bootstrap reply");
                continue;
            }
            if let Some(outcome) = self.handle_response(result) {
                self.pending = None;
                return Some(outcome);
            }
        }
        None
    }

    fn handle_response(&mut self, result: Result<Vec<u8>, String>) -> Option<HandshakeOutcome> {
        let body = match result {
            Ok(body) => body,
            Err(reason) => {
                log::warn!("Bootstrap request failed: {}", reason);
                return Some(HandshakeOutcome::Failed(GENERAL_HANDSHAKE_FAILURE.to_string()));
            }
        };

        let document: BootstrapDocument = match serde_json::from_slice(&body) {
            Ok(document) => document,
            Err(e) => {
                return Some(HandshakeOutcome::Failed(format!(
                    "Invalid handshake response: {}",
                    e
                )));
            }
        };

        if let Some(auth_id) = document.auth_id {
            let pending = self.pending.as_mut()?;
            return match pending.phase {
                HandshakePhase::AwaitingChallenge => {
                    let ticket = self.identity.auth_ticket(auth_id);
                    pending
                        .request
                        .params
                        .insert("authTicket".to_string(), BASE64.encode(ticket));
                    pending.phase = HandshakePhase::AwaitingFinal;

                    log::debug!("Server requested auth ticket {}, retrying", auth_id);
                    let request = pending.request.clone();
                    self.post(request);
                    None
                }
                HandshakePhase::AwaitingFinal => {
                    Some(HandshakeOutcome::Violation(NetError::RepeatedAuthChallenge))
                }
            };
        }

        if let Some(error) = document.error {
            return Some(HandshakeOutcome::Rejected(error));
        }

        match (document.token, document.protocol) {
            (Some(token), Some(protocol)) => {
                Some(HandshakeOutcome::Accepted(SessionGrant { token, protocol }))
            }
            _ => Some(HandshakeOutcome::Failed(
                "Invalid handshake response: missing token or protocol".to_string(),
            )),
        }
    }
}
