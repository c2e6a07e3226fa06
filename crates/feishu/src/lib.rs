pub mod bitable;
pub mod cards;
pub mod crypto;
pub mod events;
pub mod sender;

pub use bitable::{
    BitableApi, BitableClient, BitableRecord, CalendarEventInput, RecordPage, SearchFilter,
    TableInfo,
};
pub use cards::{parse_card, render_card, Block, RenderedResponse};
pub use events::{
    verify_and_normalize, InboundDecision, InboundMessage, MessageDeduplicator, WebhookContext,
    WebhookError,
};
pub use sender::{FeishuSender, MessageSender, TokenCache};
