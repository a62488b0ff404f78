//! Forwarding Engine
//!
//! Starts one listener manager per enabled rule and waits for all of them.
//! Managers share nothing but the status sink; there is no supervision, so
//! once every listener has stopped the engine returns.
//!
//! There is no cancellation path. A stalled dial, read or write holds its
//! task until the process exits.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::config::{ForwardRule, ProxyConfig};
use crate::listener::ListenerManager;
use crate::report::{ForwardEvent, NullSink, StatusSink, TracingSink};
use crate::transport::{self, TransportFactory};

/// What happened during one engine run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSummary {
    /// Forwarding was switched off for the whole process
    pub globally_disabled: bool,
    /// Listener managers started
    pub started: usize,
    /// Rules skipped because they are disabled
    pub disabled: usize,
    /// Listener managers that have stopped
    pub stopped: usize,
}

pub struct Engine {
    rules: Vec<Arc<ForwardRule>>,
    disable: bool,
    sink: Arc<dyn StatusSink>,
    transports: TransportFactory,
}

impl Engine {
    /// Build an engine reporting to `sink`. A silent configuration replaces
    /// the sink with one that drops everything.
    pub fn new(config: ProxyConfig, sink: Arc<dyn StatusSink>) -> Self {
        let sink = if config.silent {
            Arc::new(NullSink) as Arc<dyn StatusSink>
        } else {
            sink
        };

        Self {
            rules: config.forward.into_iter().map(Arc::new).collect(),
            disable: config.disable,
            sink,
            transports: Arc::new(transport::for_kind),
        }
    }

    /// Replace how listeners pick their transport
    pub fn with_transports(mut self, transports: TransportFactory) -> Self {
        self.transports = transports;
        self
    }

    /// Build an engine reporting through `tracing`
    pub fn from_config(config: ProxyConfig) -> Self {
        Self::new(config, Arc::new(TracingSink))
    }

    pub fn rules(&self) -> &[Arc<ForwardRule>] {
        &self.rules
    }

    /// Run every enabled rule until all listeners have stopped
    pub async fn run(self) -> EngineSummary {
        let mut summary = EngineSummary::default();
        if self.disable {
            summary.globally_disabled = true;
            return summary;
        }

        let mut managers = JoinSet::new();
        for rule in self.rules {
            if !rule.is_enabled() {
                self.sink.emit(ForwardEvent::RuleDisabled {
                    label: rule.label.clone(),
                    src: rule.src.clone(),
                    dst: rule.dst.clone(),
                    transport: rule.transport,
                });
                summary.disabled += 1;
                continue;
            }

            self.sink.emit(ForwardEvent::RuleRunning {
                label: rule.label.clone(),
                src: rule.src.clone(),
                dst: rule.dst.clone(),
                transport: rule.transport,
            });

            let sink = Arc::clone(&self.sink);
            let transport = (self.transports)(rule.transport);
            managers.spawn(async move {
                let mut manager = ListenerManager::with_transport(rule, transport, sink);
                manager.run().await
            });
            summary.started += 1;
        }

        while let Some(result) = managers.join_next().await {
            summary.stopped += 1;
            match result {
                // The manager already reported why it stopped
                Ok(_) => {}
                Err(e) => self.sink.emit(ForwardEvent::ListenerCrashed {
                    error: e.to_string(),
                }),
            }
        }

        summary
    }
}
