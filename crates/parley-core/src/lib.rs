//! Shared types and collaborator contracts for parley chat sessions.

pub mod api;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod presence;
pub mod transport;
pub mod widget;

pub use api::BackendApi;
pub use errors::{ApiError, TransportError};
pub use events::SessionEvent;
pub use ids::{AccountId, ClientToken, ConversationId, CustomerId, MessageId};
pub use messages::{Conversation, Customer, CustomerFilters, CustomerMetadata, Message, MessageType};
pub use presence::{Presence, PresenceEntry};
pub use transport::{Channel, ChannelEvent, RealtimeTransport};
pub use widget::{AccountStatus, WidgetSettings};
