/// Who the local player is. Supplied by the host application.
pub trait IdentityProvider: Send + Sync {
    fn guid(&self) -> u64;

    fn display_name(&self) -> String;

    /// Mints a ticket answering the server's authentication challenge.
    fn auth_ticket(&self, auth_id: u64) -> Vec<u8>;
}

#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub guid: u64,
    pub name: String,
    pub ticket: Vec<u8>,
}

impl StaticIdentity {
    pub fn new(guid: u64, name: impl Into<String>) -> Self {
        Self {
            guid,
            name: name.into(),
            ticket: Vec::new(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn guid(&self) -> u64 {
        self.guid
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn auth_ticket(&self, auth_id: u64) -> Vec<u8> {
        let mut ticket = auth_id.to_le_bytes().to_vec();
        ticket.extend_from_slice(&self.ticket);
        ticket
    }
}
