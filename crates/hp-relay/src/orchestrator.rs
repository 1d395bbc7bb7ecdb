//! Session/restart orchestrator
//!
//! A session is one message bus plus the components built on it. The
//! orchestrator starts a session, waits for a restart request on `system`
//! (or an external stop), stops every component with a bounded join, and
//! starts the next session on a fresh bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hp_core::config::{BusConfig, RelayConfig, SessionConfig};
use hp_core::{BusMessage, Channel, MessageBus, RestartReason, ShutdownFlag};

use crate::component::Component;
use crate::discovery::{DiscoveryRelay, RelaySide};
use crate::proxy::Multiplexer;
use crate::tap::BusTap;

/// Builds the components of one session
pub trait ComponentFactory: Send + Sync {
    /// Components in start order, all attached to `bus`
    fn build(&self, bus: &MessageBus, session: u64) -> Result<Vec<Box<dyn Component>>>;
}

/// The production component set: both discovery relays, the multiplexer,
/// and the bus tap when enabled
pub struct RelayFactory {
    config: Arc<RelayConfig>,
}

impl RelayFactory {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { config }
    }
}

impl ComponentFactory for RelayFactory {
    fn build(&self, bus: &MessageBus, session: u64) -> Result<Vec<Box<dyn Component>>> {
        let network = &self.config.network;
        let poll = self.config.session.bus_poll;

        let gateway = DiscoveryRelay::new(RelaySide::Gateway, network, poll, bus.clone())
            .context("gateway discovery relay")?;
        let boiler = DiscoveryRelay::new(RelaySide::Boiler, network, poll, bus.clone())
            .context("boiler discovery relay")?;
        let multiplexer = Multiplexer::new(Arc::clone(&self.config), bus.clone());

        let mut components: Vec<Box<dyn Component>> =
            vec![Box::new(gateway), Box::new(boiler), Box::new(multiplexer)];
        if self.config.session.tap {
            components.push(Box::new(BusTap::new(bus.clone())));
        }

        tracing::debug!("session {}: built {} components", session, components.len());
        Ok(components)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Restart(RestartReason),
    Stopped,
}

struct Running {
    name: String,
    flag: ShutdownFlag,
    handle: JoinHandle<()>,
}

/// Runs sessions until stopped
pub struct Orchestrator<F> {
    factory: F,
    session: SessionConfig,
    bus: BusConfig,
    stop: CancellationToken,
    sessions: u64,
}

impl<F: ComponentFactory> Orchestrator<F> {
    pub fn new(factory: F, config: &RelayConfig, stop: CancellationToken) -> Self {
        Self {
            factory,
            session: config.session.clone(),
            bus: config.bus.clone(),
            stop,
            sessions: 0,
        }
    }

    /// Sessions started so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Loop over sessions until the stop token is cancelled
    pub async fn run(&mut self) -> Result<()> {
        while !self.stop.is_cancelled() {
            self.sessions += 1;
            let session = self.sessions;

            let pause = match self.run_session(session).await {
                Ok(SessionOutcome::Stopped) => break,
                Ok(SessionOutcome::Restart(reason)) => {
                    tracing::info!("session {} ended ({}), restarting", session, reason);
                    self.session.restart_pause
                }
                Err(e) => {
                    tracing::error!("session {} failed: {:#}", session, e);
                    self.session.error_pause
                }
            };

            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("orchestrator stopped after {} session(s)", self.sessions);
        Ok(())
    }

    /// Run one session to its end
    pub async fn run_session(&mut self, session: u64) -> Result<SessionOutcome> {
        let bus = MessageBus::with_policies(self.bus.policies());
        let system = bus.subscribe(Channel::System, "orchestrator");

        let components = self
            .factory
            .build(&bus, session)
            .with_context(|| format!("building session {}", session))?;

        tracing::info!("session {} starting {} components", session, components.len());
        let mut running = Vec::with_capacity(components.len());
        for component in components {
            let name = component.name().to_string();
            let flag = component.shutdown_flag().clone();
            let task_name = name.clone();
            let handle = tokio::spawn(async move {
                match component.run().await {
                    Ok(()) => tracing::debug!("{} returned", task_name),
                    Err(e) => tracing::error!("{} failed: {:#}", task_name, e),
                }
            });
            running.push(Running { name, flag, handle });
        }

        let outcome = loop {
            let msg = tokio::select! {
                _ = self.stop.cancelled() => break SessionOutcome::Stopped,
                msg = system.listen(self.session.bus_poll) => msg,
            };

            match msg {
                Some(BusMessage::Restart { reason }) => break SessionOutcome::Restart(reason),
                Some(other) => tracing::debug!("ignoring {:?} on system", other),
                None if running.iter().all(|c| c.handle.is_finished()) => {
                    tracing::warn!("every component of session {} exited", session);
                    break SessionOutcome::Restart(RestartReason::TransportFailure);
                }
                None => {}
            }
        };

        self.stop_components(running).await;
        Ok(outcome)
    }

    /// Request shutdown of every component, then join each one
    async fn stop_components(&self, running: Vec<Running>) {
        for component in &running {
            component.flag.request();
        }

        let limit: Duration = self.session.shutdown_timeout;
        for mut component in running {
            match tokio::time::timeout(limit, &mut component.handle).await {
                Ok(Ok(())) => tracing::debug!("{} stopped", component.name),
                Ok(Err(e)) => tracing::error!("{} task ended abnormally: {}", component.name, e),
                Err(_) => {
                    tracing::warn!("{} did not stop within {:?}, aborting", component.name, limit);
                    component.handle.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hp_core::Shutdown;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    enum Behaviour {
        /// Publish a restart request after a short delay
        Restart(RestartReason),
        /// Wait for shutdown
        Idle,
        /// Ignore shutdown entirely
        Stuck,
    }

    struct Probe {
        name: String,
        behaviour: Behaviour,
        bus: MessageBus,
        log: Log,
        shutdown: ShutdownFlag,
    }

    impl Shutdown for Probe {
        fn shutdown_flag(&self) -> &ShutdownFlag {
            &self.shutdown
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(self: Box<Self>) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            match self.behaviour {
                Behaviour::Restart(reason) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    self.bus.publish(Channel::System, BusMessage::restart(reason));
                    self.bus.publish(Channel::System, BusMessage::restart(reason));
                    self.shutdown.requested().await;
                }
                Behaviour::Idle => self.shutdown.requested().await,
                Behaviour::Stuck => std::future::pending::<()>().await,
            }
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }
    }

    struct ProbeFactory {
        log: Log,
        stuck: bool,
    }

    impl ComponentFactory for ProbeFactory {
        fn build(&self, bus: &MessageBus, session: u64) -> Result<Vec<Box<dyn Component>>> {
            self.log.lock().unwrap().push(format!("build {}", session));
            let probe = |name: &str, behaviour| -> Box<dyn Component> {
                Box::new(Probe {
                    name: format!("{}-{}", name, session),
                    behaviour,
                    bus: bus.clone(),
                    log: Arc::clone(&self.log),
                    shutdown: ShutdownFlag::new(),
                })
            };
            let idle = if self.stuck { Behaviour::Stuck } else { Behaviour::Idle };
            Ok(vec![
                probe("idle", idle),
                probe("trigger", Behaviour::Restart(RestartReason::GatewayClosed)),
            ])
        }
    }

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.session.bus_poll = Duration::from_millis(20);
        config.session.restart_pause = Duration::from_millis(10);
        config.session.shutdown_timeout = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn test_session_restarts_once_per_request() {
        let log: Log = Arc::default();
        let factory = ProbeFactory { log: Arc::clone(&log), stuck: false };
        let mut orchestrator = Orchestrator::new(factory, &config(), CancellationToken::new());

        let outcome = orchestrator.run_session(1).await.unwrap();
        assert_eq!(outcome, SessionOutcome::Restart(RestartReason::GatewayClosed));

        let log = log.lock().unwrap();
        assert_eq!(log[0], "build 1");
        assert!(log.contains(&"stop idle-1".to_string()));
        assert!(log.contains(&"stop trigger-1".to_string()));
    }

    #[tokio::test]
    async fn test_components_stop_before_next_session_is_built() {
        let log: Log = Arc::default();
        let stop = CancellationToken::new();
        let factory = ProbeFactory { log: Arc::clone(&log), stuck: false };
        let mut orchestrator = Orchestrator::new(factory, &config(), stop.clone());

        let handle = tokio::spawn(async move {
            orchestrator.run().await.unwrap();
            orchestrator.sessions()
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        stop.cancel();
        let sessions = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(sessions >= 2);

        let log = log.lock().unwrap();
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert!(position("stop idle-1") < position("build 2"));
        assert!(position("stop trigger-1") < position("build 2"));
    }

    #[tokio::test]
    async fn test_stuck_component_is_aborted() {
        let log: Log = Arc::default();
        let factory = ProbeFactory { log: Arc::clone(&log), stuck: true };
        let mut orchestrator = Orchestrator::new(factory, &config(), CancellationToken::new());

        let outcome = tokio::time::timeout(Duration::from_secs(2), orchestrator.run_session(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Restart(RestartReason::GatewayClosed));
        assert!(!log.lock().unwrap().contains(&"stop idle-1".to_string()));
    }

    #[tokio::test]
    async fn test_external_stop_ends_session() {
        let log: Log = Arc::default();
        let stop = CancellationToken::new();
        stop.cancel();
        let factory = ProbeFactory { log: Arc::clone(&log), stuck: false };
        let mut orchestrator = Orchestrator::new(factory, &config(), stop);

        orchestrator.run().await.unwrap();
        assert_eq!(orchestrator.sessions(), 0);
        assert!(log.lock().unwrap().is_empty());
    }
}
