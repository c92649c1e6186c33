use std::fmt;
use std::str::FromStr;

/// Every event a subscriber can listen for.
///
/// Primary kinds are derived from the top-level field of an update envelope,
/// derived kinds from a nested field of an already classified payload, and
/// lifecycle kinds are emitted by the bot itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    // Primary
    Message,
    EditedMessage,
    ChannelPost,
    EditedChannelPost,
    MessageReaction,
    MessageReactionCount,
    InlineQuery,
    ChosenInlineResult,
    CallbackQuery,
    ShippingQuery,
    PreCheckoutQuery,
    Poll,
    PollAnswer,
    MyChatMember,
    ChatMember,
    ChatJoinRequest,
    ChatBoost,
    RemovedChatBoost,

    // Derived
    Reply,
    SuccessfulPayment,
    WebAppData,
    ChannelReply,
    CallbackGame,

    // Lifecycle
    Update,
    Ready,
    Tick,
    Stopped,
}

/// A sub-event fired when `nested_field` is present on the primary payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedEvent {
    pub nested_field: &'static str,
    pub kind: EventKind,
}

/// One row of the taxonomy: which envelope field identifies a primary kind,
/// and which sub-events hang off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventBinding {
    pub kind: EventKind,
    pub envelope_field: &'static str,
    pub derived: &'static [DerivedEvent],
}

const MESSAGE_DERIVED: &[DerivedEvent] = &[
    DerivedEvent {
        nested_field: "reply_to_message",
        kind: EventKind::Reply,
    },
    DerivedEvent {
        nested_field: "successful_payment",
        kind: EventKind::SuccessfulPayment,
    },
    DerivedEvent {
        nested_field: "web_app_data",
        kind: EventKind::WebAppData,
    },
];

const CHANNEL_POST_DERIVED: &[DerivedEvent] = &[DerivedEvent {
    nested_field: "reply_to_message",
    kind: EventKind::ChannelReply,
}];

const CALLBACK_QUERY_DERIVED: &[DerivedEvent] = &[DerivedEvent {
    nested_field: "game_short_name",
    kind: EventKind::CallbackGame,
}];

/// All primary kinds, in the order envelopes are probed during decoding.
pub const PRIMARY_KINDS: [EventKind; 18] = [
    EventKind::Message,
    EventKind::EditedMessage,
    EventKind::ChannelPost,
    EventKind::EditedChannelPost,
    EventKind::MessageReaction,
    EventKind::MessageReactionCount,
    EventKind::InlineQuery,
    EventKind::ChosenInlineResult,
    EventKind::CallbackQuery,
    EventKind::ShippingQuery,
    EventKind::PreCheckoutQuery,
    EventKind::Poll,
    EventKind::PollAnswer,
    EventKind::MyChatMember,
    EventKind::ChatMember,
    EventKind::ChatJoinRequest,
    EventKind::ChatBoost,
    EventKind::RemovedChatBoost,
];

pub const ALL_KINDS: [EventKind; 27] = [
    EventKind::Message,
    EventKind::EditedMessage,
    EventKind::ChannelPost,
    EventKind::EditedChannelPost,
    EventKind::MessageReaction,
    EventKind::MessageReactionCount,
    EventKind::InlineQuery,
    EventKind::ChosenInlineResult,
    EventKind::CallbackQuery,
    EventKind::ShippingQuery,
    EventKind::PreCheckoutQuery,
    EventKind::Poll,
    EventKind::PollAnswer,
    EventKind::MyChatMember,
    EventKind::ChatMember,
    EventKind::ChatJoinRequest,
    EventKind::ChatBoost,
    EventKind::RemovedChatBoost,
    EventKind::Reply,
    EventKind::SuccessfulPayment,
    EventKind::WebAppData,
    EventKind::ChannelReply,
    EventKind::CallbackGame,
    EventKind::Update,
    EventKind::Ready,
    EventKind::Tick,
    EventKind::Stopped,
];

impl EventKind {
    /// Stable string constant used in logs, config and string-keyed subscriptions.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::EditedMessage => "edited_message",
            EventKind::ChannelPost => "channel_post",
            EventKind::EditedChannelPost => "edited_channel_post",
            EventKind::MessageReaction => "message_reaction",
            EventKind::MessageReactionCount => "message_reaction_count",
            EventKind::InlineQuery => "inline_query",
            EventKind::ChosenInlineResult => "chosen_inline_result",
            EventKind::CallbackQuery => "callback_query",
            EventKind::ShippingQuery => "shipping_query",
            EventKind::PreCheckoutQuery => "pre_checkout_query",
            EventKind::Poll => "poll",
            EventKind::PollAnswer => "poll_answer",
            EventKind::MyChatMember => "my_chat_member",
            EventKind::ChatMember => "chat_member",
            EventKind::ChatJoinRequest => "chat_join_request",
            EventKind::ChatBoost => "chat_boost",
            EventKind::RemovedChatBoost => "removed_chat_boost",
            EventKind::Reply => "reply",
            EventKind::SuccessfulPayment => "successful_payment",
            EventKind::WebAppData => "web_app_data",
            EventKind::ChannelReply => "channel_reply",
            EventKind::CallbackGame => "callback_game",
            EventKind::Update => "update",
            EventKind::Ready => "ready",
            EventKind::Tick => "tick",
            EventKind::Stopped => "stopped",
        }
    }

    /// The taxonomy row for a primary kind, `None` for derived and lifecycle kinds.
    ///
    /// For primary kinds the envelope field has the same spelling as the kind
    /// itself, which is what the Bot API uses.
    pub fn binding(self) -> Option<EventBinding> {
        let derived: &'static [DerivedEvent] = match self {
            EventKind::Message => MESSAGE_DERIVED,
            EventKind::ChannelPost => CHANNEL_POST_DERIVED,
            EventKind::CallbackQuery => CALLBACK_QUERY_DERIVED,
            kind if kind.is_primary() => &[],
            _ => return None,
        };
        Some(EventBinding {
            kind: self,
            envelope_field: self.as_str(),
            derived,
        })
    }

    pub fn is_primary(self) -> bool {
        PRIMARY_KINDS.contains(&self)
    }

    /// Primary kind identified by a top-level envelope field.
    pub fn from_envelope_field(field: &str) -> Option<EventKind> {
        field.parse().ok().filter(|kind: &EventKind| kind.is_primary())
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_KINDS
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}
