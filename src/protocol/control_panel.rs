//! # Control Panel Protocol
//!
//! An authenticated command bus over one bundle channel.
//!
//! ## Session
//! 1. [`ControlPanelProtocol::open`] runs the challenge-response login
//!    (see [`crate::protocol::auth`]); open hooks fire once it succeeds
//! 2. [`ControlPanelProtocol::run`] pings every `ping_interval`, answers pings,
//!    turns pongs into deadline extensions, flushes queued commands and
//!    dispatches received ones
//! 3. the loop ends when the owning connection is asked to close, is
//!    cancelled, or the channel dies
//!
//! ## Liveness
//! A pong carrying our own timestamp yields the round-trip time `rtt`. The
//! connection deadline is pushed to `now + (liveness_base - rtt)`. A link whose
//! `rtt` reaches `liveness_base` is reported unhealthy and left to time out.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ProtocolConfig;
use crate::core::bundle::PacketBundleChannel;
use crate::core::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::{answer_challenge, check_verdict, CredentialStore, Secret, ServerChallenge};
use crate::protocol::dispatcher::CommandDispatcher;
use crate::protocol::envelope::{AuthMessage, Envelope, Payload};
use crate::protocol::sender::CommandSender;
use crate::service::worker::Connection;
use crate::utils::metrics::global_metrics;
use crate::utils::time::current_timestamp_millis;
use crate::utils::timeout::{with_timeout_error, TLS_CLOSE_TIMEOUT};

/// Which side of the login this end plays
pub enum Role {
    Client { identity: String, secret: Secret },
    Server { credentials: Arc<dyn CredentialStore> },
}

impl Role {
    pub fn client(identity: impl Into<String>, secret: Secret) -> Self {
        Role::Client {
            identity: identity.into(),
            secret,
        }
    }

    pub fn server(credentials: Arc<dyn CredentialStore>) -> Self {
        Role::Server { credentials }
    }

    fn name(&self) -> &'static str {
        match self {
            Role::Client { .. } => "client",
            Role::Server { .. } => "server",
        }
    }
}

type OpenHook = Box<dyn FnOnce(&CommandSender) + 'static>;

pub struct ControlPanelProtocol<'a, C: Channel> {
    channel: &'a mut PacketBundleChannel<C>,
    connection: Connection,
    role: Role,
    config: ProtocolConfig,
    identity: Option<String>,
    authenticated: bool,
    last_ping: Option<Duration>,
    open_hooks: Vec<OpenHook>,
    dispatcher: CommandDispatcher,
    sender: CommandSender,
}

impl<'a, C: Channel> ControlPanelProtocol<'a, C> {
    pub fn new(
        channel: &'a mut PacketBundleChannel<C>,
        connection: Connection,
        role: Role,
        config: ProtocolConfig,
    ) -> Self {
        let identity = match &role {
            Role::Client { identity, .. } => Some(identity.clone()),
            Role::Server { .. } => None,
        };
        Self {
            channel,
            connection,
            role,
            config,
            identity,
            authenticated: false,
            last_ping: None,
            open_hooks: Vec::new(),
            dispatcher: CommandDispatcher::new(),
            sender: CommandSender::new(),
        }
    }

    /// Client: our identity. Server: the peer's, once authenticated.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Most recent round-trip time, if a pong has arrived
    pub fn last_ping(&self) -> Option<Duration> {
        self.last_ping
    }

    /// Handle for queuing commands from elsewhere, including other threads
    pub fn sender(&self) -> CommandSender {
        self.sender.clone()
    }

    /// Queue a command; it goes out on the next loop tick.
    pub fn send(&self, command: impl Into<String>, payload: Payload) {
        self.sender.send(command, payload);
    }

    /// Listener fired for every `command`
    pub fn add_command<F>(&mut self, command: &str, listener: F)
    where
        F: FnMut(&Payload, &CommandSender) + 'static,
    {
        self.dispatcher.register(command.to_owned(), listener);
    }

    /// Listener fired for the next `command` only
    pub fn command_hook<F>(&mut self, command: &str, listener: F)
    where
        F: FnOnce(&Payload, &CommandSender) + 'static,
    {
        self.dispatcher.hook(command.to_owned(), listener);
    }

    /// Run `hook` once authenticated; immediately if that already happened.
    pub fn open_hook<F>(&mut self, hook: F)
    where
        F: FnOnce(&CommandSender) + 'static,
    {
        if self.authenticated {
            hook(&self.sender);
        } else {
            self.open_hooks.push(Box::new(hook));
        }
    }

    /// Authenticate the session.
    #[instrument(skip(self), fields(role = self.role.name(), connection = self.connection.id()))]
    pub async fn open(&mut self) -> Result<()> {
        if self.authenticated {
            return Ok(());
        }
        let outcome = match &self.role {
            Role::Client { .. } => self.login().await,
            Role::Server { .. } => self.challenge().await,
        };
        if let Err(e) = outcome {
            if e.is_authentication_failure() {
                global_metrics().auth_failure();
                warn!(error=%e, "Control panel authentication failed");
                if let Err(close) = self.channel.close().await {
                    debug!(error=%close, "Close after failed login");
                }
            }
            return Err(e);
        }

        self.authenticated = true;
        info!(identity = self.identity.as_deref().unwrap_or_default(), "Control panel open");
        for hook in std::mem::take(&mut self.open_hooks) {
            hook(&self.sender);
        }
        Ok(())
    }

    async fn login(&mut self) -> Result<()> {
        let Role::Client { identity, .. } = &self.role else {
            return Ok(());
        };
        let hello = AuthMessage::Hello {
            identity: identity.clone(),
        };
        self.queue(&hello)?;

        let challenge: AuthMessage = self.next_message().await?;
        let response = match &self.role {
            Role::Client { secret, .. } => answer_challenge(secret, challenge)?,
            Role::Server { .. } => return Ok(()),
        };
        self.queue(&response)?;

        check_verdict(self.next_message().await?)
    }

    async fn challenge(&mut self) -> Result<()> {
        let credentials = match &self.role {
            Role::Server { credentials } => Arc::clone(credentials),
            Role::Client { .. } => return Ok(()),
        };

        let hello: AuthMessage = self.next_message().await?;
        let (pending, message) = match ServerChallenge::issue(credentials.as_ref(), hello) {
            Ok(issued) => issued,
            Err(e) => return Err(self.reject(e).await),
        };
        self.queue(&message)?;

        let response: AuthMessage = self.next_message().await?;
        match pending.verify(response) {
            Ok(identity) => {
                self.identity = Some(identity);
                self.queue(&AuthMessage::Accepted)?;
                self.channel.flush().await
            }
            Err(e) => Err(self.reject(e).await),
        }
    }

    /// Tell the client why, best effort, and hand back the error.
    async fn reject(&mut self, error: ProtocolError) -> ProtocolError {
        let rejected = AuthMessage::Rejected {
            reason: match &error {
                ProtocolError::AuthenticationFailed(reason) => reason.clone(),
                other => other.to_string(),
            },
        };
        if self.queue(&rejected).is_ok() {
            if let Err(e) = with_timeout_error(self.channel.flush(), TLS_CLOSE_TIMEOUT).await {
                debug!(error=%e, "Rejection not delivered");
            }
        }
        error
    }

    /// Serve the session until closed or cancelled.
    #[instrument(skip(self), fields(role = self.role.name(), connection = self.connection.id()))]
    pub async fn run(&mut self) -> Result<()> {
        self.open().await?;

        let mut ticker = tokio::time::interval(self.config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sender = self.sender.clone();

        loop {
            self.flush_commands()?;
            tokio::select! {
                biased;
                _ = self.connection.cancelled() => return Err(ProtocolError::Cancelled),
                _ = self.connection.closing() => {
                    debug!("Close requested");
                    return self.close().await;
                }
                _ = ticker.tick() => {
                    let now = current_timestamp_millis()?;
                    self.queue(&Envelope::ping(now))?;
                }
                _ = sender.queued() => {}
                bundle = self.channel.receive() => {
                    self.handle_bundle(bundle?)?;
                }
            }
        }
    }

    /// Flush queued commands and close the channel. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if !self.channel.is_closed() {
            if let Err(e) = self.flush_commands() {
                debug!(error=%e, "Dropping queued commands on close");
            }
        }
        self.channel.close().await
    }

    fn handle_bundle(&mut self, bundle: Vec<u8>) -> Result<()> {
        let decoded = self.config.format.decode::<Envelope>(&bundle);
        self.channel.recycle(bundle);
        let mut envelope = decoded?;

        if let Some(timestamp) = envelope.ping {
            self.queue(&Envelope::pong(timestamp))?;
        }
        if let Some(timestamp) = envelope.pong {
            self.on_pong(timestamp)?;
        }

        let commands = envelope.take_commands().map_err(|e| {
            global_metrics().protocol_error();
            warn!(error=%e, "Malformed control panel envelope");
            e
        })?;
        for command in &commands {
            trace!(command=%command.name, "Dispatching");
            self.dispatcher.dispatch(command, &self.sender);
        }
        Ok(())
    }

    fn on_pong(&mut self, timestamp: i64) -> Result<()> {
        let elapsed = current_timestamp_millis()?.saturating_sub(timestamp).max(0);
        let rtt = Duration::from_millis(elapsed as u64);
        self.last_ping = Some(rtt);

        match self.config.liveness_base.checked_sub(rtt) {
            Some(extension) if !extension.is_zero() => {
                self.connection.extend_deadline(extension);
                trace!(rtt_ms = elapsed, "Deadline extended");
            }
            _ => warn!(
                rtt_ms = elapsed,
                liveness_base_ms = self.config.liveness_base.as_millis() as u64,
                "Link unhealthy, deadline not extended"
            ),
        }
        Ok(())
    }

    fn flush_commands(&mut self) -> Result<()> {
        let commands = self.sender.drain();
        if commands.is_empty() {
            return Ok(());
        }
        self.queue(&Envelope::with_commands(commands))
    }

    fn queue<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let format = self.config.format;
        format.encode_into(message, self.channel.output())?;
        self.channel.queue_bundle()
    }

    async fn next_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bundle = tokio::select! {
            _ = self.connection.cancelled() => return Err(ProtocolError::Cancelled),
            bundle = self.channel.receive() => bundle?,
        };
        let decoded = self.config.format.decode(&bundle);
        self.channel.recycle(bundle);
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::pipe;
    use crate::protocol::auth::StaticCredentials;

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            ping_interval: Duration::from_millis(20),
            liveness_base: Duration::from_secs(10),
            ..ProtocolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_pong_extends_deadline() {
        let (a, _b) = pipe();
        let mut channel = PacketBundleChannel::new(a);
        let connection = Connection::new(1);
        let mut panel = ControlPanelProtocol::new(
            &mut channel,
            connection.clone(),
            Role::client("panel", Secret::password("pw")),
            config(),
        );

        assert!(connection.deadline().is_none());
        let now = current_timestamp_millis().unwrap();
        panel.on_pong(now).unwrap();
        let deadline = connection.deadline().unwrap();
        assert!(deadline > std::time::Instant::now() + Duration::from_secs(9));
        assert!(panel.last_ping().unwrap() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_slow_pong_leaves_deadline() {
        let (a, _b) = pipe();
        let mut channel = PacketBundleChannel::new(a);
        let connection = Connection::new(1);
        let mut panel = ControlPanelProtocol::new(
            &mut channel,
            connection.clone(),
            Role::client("panel", Secret::password("pw")),
            config(),
        );

        let stale = current_timestamp_millis().unwrap() - 20_000;
        panel.on_pong(stale).unwrap();
        assert!(connection.deadline().is_none());
        assert!(panel.last_ping().unwrap() >= Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_open_hook_after_open_fires_immediately() {
        let (a, b) = pipe();
        let mut client_channel = PacketBundleChannel::new(a);
        let mut server_channel = PacketBundleChannel::new(b);
        let store = Arc::new(StaticCredentials::new().with_password("panel", "pw"));

        let mut client = ControlPanelProtocol::new(
            &mut client_channel,
            Connection::new(1),
            Role::client("panel", Secret::password("pw")),
            config(),
        );
        let mut server = ControlPanelProtocol::new(
            &mut server_channel,
            Connection::new(2),
            Role::server(store),
            config(),
        );

        let fired = std::rc::Rc::new(std::cell::Cell::new(0));
        let f = fired.clone();
        server.open_hook(move |_| f.set(f.get() + 1));

        let (c, s) = tokio::join!(client.open(), server.open());
        c.unwrap();
        s.unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(server.identity(), Some("panel"));

        let f = fired.clone();
        server.open_hook(move |_| f.set(f.get() + 10));
        assert_eq!(fired.get(), 11);
    }
}
