use std::thread;

use serde::Serialize;
use tether::{BootstrapReply, BootstrapRequest, BootstrapTransport};

#[derive(Debug, Clone, Serialize)]
struct PresetDocument {
    token: String,
    protocol: u32,
}

/// Answers every bootstrap request with a fixed token, for servers that do
/// not run a bootstrap endpoint. The reply arrives from a separate thread the
/// way a real request/response exchange would.
pub struct PresetBootstrap {
    document: PresetDocument,
}

impl PresetBootstrap {
    pub fn new(token: impl Into<String>, protocol: u32) -> Self {
        Self {
            document: PresetDocument {
                token: token.into(),
                protocol,
            },
        }
    }
}

impl BootstrapTransport for PresetBootstrap {
    fn post(&mut self, request: BootstrapRequest, reply: BootstrapReply) {
        log::debug!(
            "Bootstrap {}:{}{} with {:?}",
            request.host,
            request.port,
            request.path,
            request.params
        );

        let body = serde_json::to_vec(&self.document);
        thread::spawn(move || match body {
            Ok(body) => reply.succeed(body),
            Err(e) => reply.fail(e.to_string()),
        });
    }
}
