pub mod client;
pub mod stream;
pub mod types;

pub use client::{parse_role_draft, ApiClient};
pub use stream::{consume, SseDecoder, StreamDecoder, StreamEvent, StreamOutcome, StreamPhase};
pub use types::{ConnectionStatus, Message, Role, RoleDraft};
