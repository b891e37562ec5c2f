//! # Control Panel Protocol Layer
//!
//! Authenticated command bus carried inside bundles.
//!
//! ## Components
//! - **Envelope**: `Ping` / `Pong` / `Commands` wire map and login messages
//! - **Auth**: password and keypair challenge-response
//! - **Dispatcher**: persistent and one-shot command listeners
//! - **Sender**: cloneable outbound command queue
//! - **Control Panel**: the session loop tying them together

pub mod auth;
pub mod control_panel;
pub mod dispatcher;
pub mod envelope;
pub mod sender;

pub use auth::{CredentialStore, Secret, StaticCredentials, Verifier};
pub use control_panel::{ControlPanelProtocol, Role};
pub use dispatcher::CommandDispatcher;
pub use envelope::{AuthMessage, Command, Envelope, Payload};
pub use sender::CommandSender;
