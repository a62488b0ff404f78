//! Listener Manager Implementation

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::debug;

use crate::config::ForwardRule;
use crate::relay::{Relay, RelaySession};
use crate::report::{ForwardEvent, RuleReporter, StatusSink};
use crate::transport::{self, BoxedStream, Transport};

/// Lifecycle of a listener manager. There is no way back from `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Unstarted,
    Binding,
    Accepting,
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Unstarted => "unstarted",
            ListenerState::Binding => "binding",
            ListenerState::Accepting => "accepting",
            ListenerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a listener manager stopped
#[derive(Debug)]
pub enum ListenerExit {
    /// The source address could not be bound; no connection was served
    BindFailed(anyhow::Error),
    /// The listening socket failed while accepting
    AcceptFailed(anyhow::Error),
}

/// Owns one rule's listening socket and turns every accepted connection
/// into a relay session
pub struct ListenerManager {
    rule: Arc<ForwardRule>,
    transport: Arc<dyn Transport>,
    reporter: RuleReporter,
    state: ListenerState,
    local_addr: Option<SocketAddr>,
}

impl ListenerManager {
    /// Create a manager using the transport named by the rule
    pub fn new(rule: Arc<ForwardRule>, sink: Arc<dyn StatusSink>) -> Self {
        let transport = transport::for_kind(rule.transport);
        Self::with_transport(rule, transport, sink)
    }

    pub fn with_transport(
        rule: Arc<ForwardRule>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let reporter = RuleReporter::new(sink, rule.silent);
        Self {
            rule,
            transport,
            reporter,
            state: ListenerState::Unstarted,
            local_addr: None,
        }
    }

    pub fn rule(&self) -> &Arc<ForwardRule> {
        &self.rule
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Address actually bound, once the manager got past binding
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn transition(&mut self, next: ListenerState) {
        debug!("{} listener {} -> {}", self.rule.label, self.state, next);
        self.state = next;
    }

    /// Bind and accept until the listening socket fails.
    ///
    /// Dialing happens inline, so a slow destination delays the next accept
    /// on this rule. Relays run as independent tasks and are never awaited.
    pub async fn run(&mut self) -> ListenerExit {
        self.transition(ListenerState::Binding);

        let mut listener = match self.transport.listen(&self.rule.src).await {
            Ok(listener) => listener,
            Err(e) => {
                self.reporter.emit(ForwardEvent::BindFailed {
                    label: self.rule.label.clone(),
                    src: self.rule.src.clone(),
                    error: format!("{:#}", e),
                });
                self.transition(ListenerState::Stopped);
                return ListenerExit::BindFailed(e);
            }
        };

        self.local_addr = listener.local_addr().ok();
        if let Some(local_addr) = self.local_addr {
            self.reporter.emit(ForwardEvent::ListenerBound {
                label: self.rule.label.clone(),
                local_addr,
            });
        }
        self.transition(ListenerState::Accepting);

        loop {
            match listener.accept().await {
                Ok((inbound, peer)) => self.handle_connection(inbound, peer).await,
                Err(e) => {
                    self.reporter.emit(ForwardEvent::AcceptFailed {
                        label: self.rule.label.clone(),
                        src: self.rule.src.clone(),
                        error: format!("{:#}", e),
                    });
                    self.transition(ListenerState::Stopped);
                    return ListenerExit::AcceptFailed(e);
                }
            }
        }
    }

    /// Dial the destination and hand the pair to a relay task
    async fn handle_connection(&self, inbound: BoxedStream, peer: SocketAddr) {
        let outbound = match self.transport.dial(&self.rule.dst).await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.reporter.emit(ForwardEvent::DialFailed {
                    label: self.rule.label.clone(),
                    dst: self.rule.dst.clone(),
                    error: format!("{:#}", e),
                });
                drop(inbound);
                return;
            }
        };

        let relay = Relay::new(
            Arc::clone(&self.rule),
            self.reporter.clone(),
            self.transport.copy_buffer_size(),
        );
        let reporter = self.reporter.clone();
        let label = self.rule.label.clone();
        let session = RelaySession::new(peer);
        let session_id = session.session_id.clone();

        tokio::spawn(async move {
            if let Err(e) = relay.run(session, inbound, outbound).await {
                reporter.emit(ForwardEvent::RelayFailed {
                    label,
                    session_id,
                    error: format!("{:#}", e),
                });
            }
        });
    }
}
