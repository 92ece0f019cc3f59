//! Client side of the chat platform: one [`MessagingSession`] per signed-in
//! user, backed by a live broker connection with a REST fallback.

pub mod api;
pub mod config;
pub mod error;
pub mod presence;
pub mod reconnect;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod transport;

pub use api::{AttachmentUpload, HttpMessagingApi, MessagingApi};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use error::{SendError, TransportError};
pub use session::{DeliveryRoute, MessagingSession, OutgoingMessage, SessionEvent};
pub use store::UnreadTotals;
pub use transport::{MissingTransport, Transport, WsTransport};
