use super::address::NetAddress;
use super::protocol::DatagramWriter;

/// Extension points invoked by the frame pump at lifecycle transitions.
///
/// Hooks run while the pump is locked, so they must not call back into the
/// `NetClient` methods that take the pump lock.
pub trait SessionHooks: Send {
    fn on_session_created(&mut self, _server: &NetAddress) {}

    fn on_init_received(&mut self, _server: &NetAddress) {}

    fn on_connect_ok(&mut self, _server: &NetAddress) {}

    /// Called before the end tag is written, so extra tagged messages can be
    /// appended to the outbound datagram.
    fn on_build_message(&mut self, _writer: &mut DatagramWriter) {}

    fn on_connection_error(&mut self, _message: &str) {}

    fn on_connection_timed_out(&mut self) {}

    fn on_finalize_disconnect(&mut self, _server: &NetAddress) {}

    fn on_attempt_disconnect(&mut self, _reason: &str) {}
}

#[derive(Debug, Default)]
pub struct NoHooks;

impl SessionHooks for NoHooks {}
