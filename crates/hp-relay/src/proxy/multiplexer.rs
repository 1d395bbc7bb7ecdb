//! Session multiplexer
//!
//! Owns every TCP socket of a session: the gateway listener and connection,
//! the boiler connection, and the command listener and client. Requests from
//! either client go to the boiler one at a time; boiler output goes back to
//! whoever asked, heartbeats and unsolicited lines to the gateway.
//!
//! The multiplexer never reconnects. When the session ends it publishes one
//! restart request on `system` and returns.

use std::future::pending;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::FramedRead;

use hp_core::config::RelayConfig;
use hp_core::{
    BusError, BusMessage, Channel, ChannelReceiver, DiscoveryMarker, MessageBus, PeerAddress,
    RestartReason, Shutdown, ShutdownFlag,
};
use hp_protocol::frame::{decode_latin1, trim_terminator};
use hp_protocol::{
    request_line, Analyser, InfoEvent, InfoKey, LineCodec, LineKind, ParseState, ProtocolError,
};

use super::caller::{Caller, Dispatcher, Request};
use super::ProxyState;
use crate::component::Component;
use crate::discovery::socket::{bind_tcp_listener, connect_tcp, Interface};

/// A connected line-oriented client
struct Client {
    peer: SocketAddr,
    reader: FramedRead<OwnedReadHalf, LineCodec>,
    writer: OwnedWriteHalf,
}

impl Client {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: FramedRead::new(reader, LineCodec::new()),
            writer,
        }
    }
}

/// The active socket set of one session
struct Links {
    gateway_listener: Option<TcpListener>,
    gateway: Option<Client>,
    boiler_reader: OwnedReadHalf,
    boiler_writer: OwnedWriteHalf,
    command_listener: TcpListener,
    command: Option<Client>,
}

enum Event {
    Shutdown,
    Bootstrap(Result<Option<BusMessage>, BusError>),
    GatewayAccepted(io::Result<(TcpStream, SocketAddr)>),
    GatewayLine(Option<Result<Bytes, ProtocolError>>),
    BoilerData(io::Result<usize>),
    CommandAccepted(io::Result<(TcpStream, SocketAddr)>),
    CommandLine(Option<Result<Bytes, ProtocolError>>),
    ResponseTimeout,
}

enum Flow {
    Continue,
    End(RestartReason),
    Stop,
}

/// Parameter records gathered after the gateway logged in
struct BoilerConfigQuery {
    remaining: usize,
    records: Vec<String>,
}

/// TCP relay and session-end detector
pub struct Multiplexer {
    config: Arc<RelayConfig>,
    bus: MessageBus,
    receiver: ChannelReceiver,
    shutdown: ShutdownFlag,
    state: watch::Sender<ProxyState>,
    analyser: Analyser,
    dispatcher: Dispatcher,
    identity_markers: usize,
    restart_requested: bool,
    boiler_config: Option<BoilerConfigQuery>,
}

impl Multiplexer {
    /// Create a multiplexer; it subscribes to `bootstrap` immediately so no
    /// discovery published after construction is missed
    pub fn new(config: Arc<RelayConfig>, bus: MessageBus) -> Self {
        let shutdown = ShutdownFlag::new();
        let mut receiver = ChannelReceiver::new("multiplexer", bus.clone(), shutdown.clone());
        receiver.subscribe(Channel::Bootstrap);

        let analyser = Analyser::new(config.analyser.heartbeat_fields.clone())
            .with_heartbeat_interval(config.analyser.heartbeat_interval);
        let dispatcher = Dispatcher::new(config.session.response_timeout);
        let (state, _) = watch::channel(ProxyState::Discovering);

        Self {
            config,
            bus,
            receiver,
            shutdown,
            state,
            analyser,
            dispatcher,
            identity_markers: 0,
            restart_requested: false,
            boiler_config: None,
        }
    }

    /// Watch the multiplexer's lifecycle
    pub fn state_receiver(&self) -> watch::Receiver<ProxyState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ProxyState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("multiplexer {} -> {}", previous, state);
        }
    }

    async fn serve(&mut self) -> Result<()> {
        let Some(boiler) = self.discover().await? else {
            return Ok(());
        };
        self.publish_info(InfoKey::BoilerAddr, boiler.host.to_string());
        self.publish_info(InfoKey::BoilerPort, boiler.port.to_string());

        self.set_state(ProxyState::Connecting);
        let links = match self.connect(boiler).await {
            Ok(links) => links,
            Err(e) => {
                tracing::error!("session setup failed: {:#}", e);
                self.end_session(RestartReason::TransportFailure);
                return Ok(());
            }
        };

        self.set_state(ProxyState::Relaying);
        self.relay_loop(links).await;
        Ok(())
    }

    /// Wait until both peers are known; returns the boiler address, or
    /// `None` if shutdown came first
    async fn discover(&mut self) -> Result<Option<PeerAddress>> {
        self.set_state(ProxyState::Discovering);
        tracing::info!("waiting for peer discovery");

        loop {
            let data = self.receiver.data();
            if let (Some(gateway), Some(boiler)) = (data.gateway, data.boiler) {
                tracing::info!("gateway at {}, boiler at {}", gateway, boiler);
                return Ok(Some(boiler));
            }
            match self.receiver.handle(self.config.session.bus_poll).await {
                Ok(Some(msg)) => {
                    self.note_identity(&msg);
                }
                Ok(None) => tracing::trace!("peers still unknown"),
                Err(BusError::ShutdownRequested) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Count gateway identity broadcasts; returns true for an identity marker
    fn note_identity(&mut self, msg: &BusMessage) -> bool {
        if let BusMessage::Marker(DiscoveryMarker::AppIdentity(identity)) = msg {
            self.identity_markers += 1;
            tracing::debug!("gateway identity {} (seen {} times)", identity, self.identity_markers);
            return true;
        }
        false
    }

    async fn connect(&self, boiler: PeerAddress) -> Result<Links> {
        let network = &self.config.network;
        let interface: Interface = network.boiler_interface.parse()?;
        let address = SocketAddrV4::new(boiler.host, network.boiler_port);

        tracing::info!("connecting to boiler at {} via {}", address, interface);
        let stream = connect_tcp(&interface, address, network.socket_timeout).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("TCP_NODELAY on boiler link: {}", e);
        }
        let (boiler_reader, boiler_writer) = stream.into_split();

        let gateway_listener = bind_tcp_listener(&network.gateway_listen_address())?;
        let command_listener = bind_tcp_listener(&network.command_listen_address())?;
        tracing::info!(
            "listening for the gateway on {} and commands on {}",
            network.gateway_listen_address(),
            network.command_listen_address()
        );

        Ok(Links {
            gateway_listener: Some(gateway_listener),
            gateway: None,
            boiler_reader,
            boiler_writer,
            command_listener,
            command: None,
        })
    }

    async fn relay_loop(&mut self, mut links: Links) {
        let shutdown = self.shutdown.clone();
        let poll = self.config.session.bus_poll;
        let mut read_buf = vec![0u8; self.config.network.buffer_size.max(512)];

        loop {
            let deadline = self.dispatcher.deadline();
            let event = tokio::select! {
                _ = shutdown.requested() => Event::Shutdown,
                msg = self.receiver.handle(poll) => Event::Bootstrap(msg),
                res = accept(links.gateway_listener.as_ref()) => Event::GatewayAccepted(res),
                line = next_line(links.gateway.as_mut()) => Event::GatewayLine(line),
                res = links.boiler_reader.read(&mut read_buf) => Event::BoilerData(res),
                res = links.command_listener.accept() => Event::CommandAccepted(res),
                line = next_line(links.command.as_mut()) => Event::CommandLine(line),
                _ = sleep_until(deadline) => Event::ResponseTimeout,
            };

            let flow = match event {
                Event::Shutdown | Event::Bootstrap(Err(BusError::ShutdownRequested)) => Flow::Stop,
                Event::Bootstrap(Err(e)) => {
                    tracing::warn!("bootstrap subscription: {}", e);
                    Flow::Continue
                }
                Event::Bootstrap(Ok(Some(msg))) => self.on_bootstrap(&msg, &links),
                Event::Bootstrap(Ok(None)) => Flow::Continue,
                Event::GatewayAccepted(Ok((stream, peer))) => {
                    tracing::info!("gateway connected from {}", peer);
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("TCP_NODELAY on gateway link: {}", e);
                    }
                    links.gateway = Some(Client::new(stream, peer));
                    // one gateway per session
                    links.gateway_listener = None;
                    Flow::Continue
                }
                Event::GatewayAccepted(Err(e)) => {
                    tracing::error!("gateway accept failed: {}", e);
                    Flow::End(RestartReason::TransportFailure)
                }
                Event::GatewayLine(Some(Ok(line))) => {
                    self.submit(&mut links, Request::new(Caller::Gateway, line)).await
                }
                Event::GatewayLine(Some(Err(e))) => {
                    tracing::error!("gateway read failed: {}", e);
                    Flow::End(RestartReason::GatewayClosed)
                }
                Event::GatewayLine(None) => {
                    tracing::info!("gateway closed the connection");
                    Flow::End(RestartReason::GatewayClosed)
                }
                Event::BoilerData(Ok(0)) => {
                    tracing::error!("boiler closed the connection");
                    Flow::End(RestartReason::TransportFailure)
                }
                Event::BoilerData(Ok(len)) => {
                    let data = Bytes::copy_from_slice(&read_buf[..len]);
                    self.on_boiler_data(&mut links, &data).await
                }
                Event::BoilerData(Err(e)) => {
                    tracing::error!("boiler read failed: {}", e);
                    Flow::End(RestartReason::TransportFailure)
                }
                Event::CommandAccepted(Ok((stream, peer))) => {
                    if links.command.is_some() {
                        tracing::info!("new command client {} replaces the previous one", peer);
                        self.drop_command(&mut links);
                    } else {
                        tracing::info!("command client connected from {}", peer);
                    }
                    links.command = Some(Client::new(stream, peer));
                    Flow::Continue
                }
                Event::CommandAccepted(Err(e)) => {
                    tracing::warn!("command accept failed: {}", e);
                    Flow::Continue
                }
                Event::CommandLine(Some(Ok(line))) => {
                    self.submit(&mut links, Request::new(Caller::Command, line)).await
                }
                Event::CommandLine(Some(Err(e))) => {
                    tracing::warn!("command client read failed: {}", e);
                    self.drop_command(&mut links);
                    Flow::Continue
                }
                Event::CommandLine(None) => {
                    self.drop_command(&mut links);
                    Flow::Continue
                }
                Event::ResponseTimeout => {
                    tracing::warn!(
                        "no complete reply for {:?} within {:?} ({} request(s) waiting)",
                        self.dispatcher.current(),
                        self.config.session.response_timeout,
                        self.dispatcher.pending()
                    );
                    self.analyser.abandon_request();
                    let next = self.complete_request();
                    self.dispatch(&mut links, next).await
                }
            };

            match flow {
                Flow::Continue => {}
                Flow::End(reason) => {
                    self.end_session(reason);
                    break;
                }
                Flow::Stop => {
                    tracing::info!("multiplexer stopping on shutdown request");
                    self.set_state(ProxyState::Ending);
                    break;
                }
            }
        }

        if let Err(e) = links.boiler_writer.shutdown().await {
            tracing::debug!("closing boiler link: {}", e);
        }
        drop(links);
        tracing::info!("boiler connection closed");
    }

    fn on_bootstrap(&mut self, msg: &BusMessage, links: &Links) -> Flow {
        if !self.note_identity(msg) || links.gateway.is_none() || self.identity_markers < 2 {
            return Flow::Continue;
        }
        if self.config.session.restart_on_duplicate_identity {
            tracing::info!("gateway announced itself again during the session");
            Flow::End(RestartReason::DuplicateIdentity)
        } else {
            tracing::debug!("repeated gateway identity ignored");
            Flow::Continue
        }
    }

    async fn submit(&mut self, links: &mut Links, request: Request) -> Flow {
        let next = self.dispatcher.submit(request);
        self.dispatch(links, next).await
    }

    /// Send `next` to the boiler, then any request that can follow it
    /// without waiting for a reply
    async fn dispatch(&mut self, links: &mut Links, mut next: Option<Request>) -> Flow {
        while let Some(request) = next.take() {
            let state = self.analyser.parse_request(&request.line);
            self.publish_events();
            tracing::debug!(
                "{} request {:?} ({:?})",
                request.caller,
                decode_latin1(trim_terminator(&request.line)),
                state
            );

            if let Err(e) = links.boiler_writer.write_all(&request.line).await {
                tracing::error!("boiler write failed: {}", e);
                return Flow::End(RestartReason::TransportFailure);
            }

            // a line the analyser does not wait on completes at once
            if !state.is_in_flight() {
                next = self.complete_request();
            }
        }
        Flow::Continue
    }

    async fn on_boiler_data(&mut self, links: &mut Links, data: &[u8]) -> Flow {
        let caller = self.dispatcher.current();
        let parse = self.analyser.feed_response(data);
        self.publish_events();

        let mut to_gateway = BytesMut::new();
        let mut to_command = BytesMut::new();
        for line in &parse.lines {
            let target = match line.kind {
                LineKind::Heartbeat | LineKind::Notice => Some(Caller::Gateway),
                LineKind::Reply | LineKind::Error => caller,
            };
            match target {
                Some(Caller::Gateway) => to_gateway.extend_from_slice(&line.bytes),
                Some(Caller::Command) => to_command.extend_from_slice(&line.bytes),
                Some(Caller::Internal) => self.record_internal(&line.bytes),
                Some(Caller::Detached) => {
                    tracing::debug!("reply for a departed command client dropped")
                }
                None => tracing::trace!("reply line without caller dropped"),
            }
        }

        if !to_gateway.is_empty() {
            match links.gateway.as_mut() {
                Some(gateway) => {
                    if let Err(e) = gateway.writer.write_all(&to_gateway).await {
                        tracing::error!("write to gateway {} failed: {}", gateway.peer, e);
                        return Flow::End(RestartReason::GatewayClosed);
                    }
                }
                None => tracing::trace!("no gateway yet, {} bytes dropped", to_gateway.len()),
            }
        }
        if !to_command.is_empty() {
            if let Some(command) = links.command.as_mut() {
                if let Err(e) = command.writer.write_all(&to_command).await {
                    tracing::warn!("write to command client {} failed: {}", command.peer, e);
                    self.drop_command(links);
                }
            }
        }

        if parse.state == ParseState::SessionEnding {
            return Flow::End(RestartReason::SessionCleared);
        }

        let mut next = None;
        if parse.login_completed {
            next = self.queue_boiler_config();
        }
        if caller.is_some() && !parse.state.is_in_flight() {
            next = self.complete_request();
        }
        self.dispatch(links, next).await
    }

    /// Finish the in-flight request and hand back the next one
    fn complete_request(&mut self) -> Option<Request> {
        if self.dispatcher.current() == Some(Caller::Internal) {
            self.finish_internal();
        }
        self.dispatcher.complete()
    }

    fn drop_command(&mut self, links: &mut Links) {
        if let Some(command) = links.command.take() {
            let dropped = self.dispatcher.forget(Caller::Command);
            tracing::info!(
                "command client {} disconnected ({} queued request(s) dropped)",
                command.peer,
                dropped
            );
        }
    }

    /// Queue the boiler configuration queries; returns the one to send now
    /// if the link is idle
    fn queue_boiler_config(&mut self) -> Option<Request> {
        let queries = self.config.session.boiler_config_queries.clone();
        if queries.is_empty() || self.boiler_config.is_some() {
            return None;
        }
        tracing::info!("gateway logged in, querying {} boiler parameters", queries.len());
        self.boiler_config = Some(BoilerConfigQuery {
            remaining: queries.len(),
            records: Vec::new(),
        });

        let mut first = None;
        for parameter in queries {
            let line = request_line(&format!("$par get {}", parameter));
            if let Some(request) = self.dispatcher.submit(Request::new(Caller::Internal, line)) {
                first = Some(request);
            }
        }
        first
    }

    fn record_internal(&mut self, line: &[u8]) {
        let text = decode_latin1(trim_terminator(line));
        if let (Some(query), false) = (self.boiler_config.as_mut(), text.is_empty()) {
            query.records.push(text);
        }
    }

    fn finish_internal(&mut self) {
        let Some(query) = self.boiler_config.as_mut() else {
            return;
        };
        query.remaining = query.remaining.saturating_sub(1);
        if query.remaining > 0 {
            return;
        }
        let value = query.records.join("\n");
        tracing::info!("boiler configuration gathered ({} records)", query.records.len());
        self.publish_info(InfoKey::BoilerConfig, value);
    }

    fn publish_info(&self, key: InfoKey, value: impl Into<String>) {
        self.bus
            .publish(Channel::Info, BusMessage::Info(InfoEvent::new(key, value)));
    }

    fn publish_events(&mut self) {
        for event in self.analyser.take_events() {
            let msg = BusMessage::from(event);
            let channel = match msg {
                BusMessage::Track(_) => Channel::Track,
                _ => Channel::Info,
            };
            self.bus.publish(channel, msg);
        }
    }

    /// Fire the one restart request of this session
    fn end_session(&mut self, reason: RestartReason) {
        self.set_state(ProxyState::Ending);
        if self.restart_requested {
            tracing::debug!("restart already requested, {} ignored", reason);
            return;
        }
        self.restart_requested = true;
        tracing::info!("session ending: {}", reason);
        self.bus.publish(Channel::System, BusMessage::restart(reason));
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

async fn next_line(client: Option<&mut Client>) -> Option<Result<Bytes, ProtocolError>> {
    match client {
        Some(client) => client.reader.next().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

impl Shutdown for Multiplexer {
    fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }
}

#[async_trait]
impl Component for Multiplexer {
    fn name(&self) -> &str {
        "multiplexer"
    }

    async fn run(mut self: Box<Self>) -> Result<()> {
        let result = self.serve().await;
        self.set_state(ProxyState::Exited);
        result
    }
}
