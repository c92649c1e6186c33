use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::taxonomy::{EventKind, PRIMARY_KINDS};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("update envelope is not a JSON object")]
    NotAnObject,

    #[error("update envelope has no integer update_id")]
    MissingUpdateId,
}

/// The object stored under an envelope's payload field.
///
/// Entity types are not modelled here; handlers pick the fields they need or
/// deserialize the payload into their own types.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(Map<String, Value>);

impl Payload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// A field's value, treating explicit `null` as absent.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    pub fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    #[allow(dead_code)]
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    #[allow(dead_code)]
    pub fn deserialize<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }
}

/// Decoded form of an envelope: exactly one primary kind and its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateKind {
    Message(Payload),
    EditedMessage(Payload),
    ChannelPost(Payload),
    EditedChannelPost(Payload),
    MessageReaction(Payload),
    MessageReactionCount(Payload),
    InlineQuery(Payload),
    ChosenInlineResult(Payload),
    CallbackQuery(Payload),
    ShippingQuery(Payload),
    PreCheckoutQuery(Payload),
    Poll(Payload),
    PollAnswer(Payload),
    MyChatMember(Payload),
    ChatMember(Payload),
    ChatJoinRequest(Payload),
    ChatBoost(Payload),
    RemovedChatBoost(Payload),
    /// Envelope carrying a field this client has no binding for. Holds the
    /// field name when one could be found.
    Unknown(Option<String>),
}

impl UpdateKind {
    fn classified(kind: EventKind, payload: Payload) -> Self {
        match kind {
            EventKind::Message => UpdateKind::Message(payload),
            EventKind::EditedMessage => UpdateKind::EditedMessage(payload),
            EventKind::ChannelPost => UpdateKind::ChannelPost(payload),
            EventKind::EditedChannelPost => UpdateKind::EditedChannelPost(payload),
            EventKind::MessageReaction => UpdateKind::MessageReaction(payload),
            EventKind::MessageReactionCount => UpdateKind::MessageReactionCount(payload),
            EventKind::InlineQuery => UpdateKind::InlineQuery(payload),
            EventKind::ChosenInlineResult => UpdateKind::ChosenInlineResult(payload),
            EventKind::CallbackQuery => UpdateKind::CallbackQuery(payload),
            EventKind::ShippingQuery => UpdateKind::ShippingQuery(payload),
            EventKind::PreCheckoutQuery => UpdateKind::PreCheckoutQuery(payload),
            EventKind::Poll => UpdateKind::Poll(payload),
            EventKind::PollAnswer => UpdateKind::PollAnswer(payload),
            EventKind::MyChatMember => UpdateKind::MyChatMember(payload),
            EventKind::ChatMember => UpdateKind::ChatMember(payload),
            EventKind::ChatJoinRequest => UpdateKind::ChatJoinRequest(payload),
            EventKind::ChatBoost => UpdateKind::ChatBoost(payload),
            EventKind::RemovedChatBoost => UpdateKind::RemovedChatBoost(payload),
            other => UpdateKind::Unknown(Some(other.as_str().to_string())),
        }
    }

    /// Primary event kind, `None` for unrecognized envelopes.
    pub fn event_kind(&self) -> Option<EventKind> {
        let kind = match self {
            UpdateKind::Message(_) => EventKind::Message,
            UpdateKind::EditedMessage(_) => EventKind::EditedMessage,
            UpdateKind::ChannelPost(_) => EventKind::ChannelPost,
            UpdateKind::EditedChannelPost(_) => EventKind::EditedChannelPost,
            UpdateKind::MessageReaction(_) => EventKind::MessageReaction,
            UpdateKind::MessageReactionCount(_) => EventKind::MessageReactionCount,
            UpdateKind::InlineQuery(_) => EventKind::InlineQuery,
            UpdateKind::ChosenInlineResult(_) => EventKind::ChosenInlineResult,
            UpdateKind::CallbackQuery(_) => EventKind::CallbackQuery,
            UpdateKind::ShippingQuery(_) => EventKind::ShippingQuery,
            UpdateKind::PreCheckoutQuery(_) => EventKind::PreCheckoutQuery,
            UpdateKind::Poll(_) => EventKind::Poll,
            UpdateKind::PollAnswer(_) => EventKind::PollAnswer,
            UpdateKind::MyChatMember(_) => EventKind::MyChatMember,
            UpdateKind::ChatMember(_) => EventKind::ChatMember,
            UpdateKind::ChatJoinRequest(_) => EventKind::ChatJoinRequest,
            UpdateKind::ChatBoost(_) => EventKind::ChatBoost,
            UpdateKind::RemovedChatBoost(_) => EventKind::RemovedChatBoost,
            UpdateKind::Unknown(_) => return None,
        };
        Some(kind)
    }

    pub fn payload(&self) -> Option<&Payload> {
        match self {
            UpdateKind::Message(p)
            | UpdateKind::EditedMessage(p)
            | UpdateKind::ChannelPost(p)
            | UpdateKind::EditedChannelPost(p)
            | UpdateKind::MessageReaction(p)
            | UpdateKind::MessageReactionCount(p)
            | UpdateKind::InlineQuery(p)
            | UpdateKind::ChosenInlineResult(p)
            | UpdateKind::CallbackQuery(p)
            | UpdateKind::ShippingQuery(p)
            | UpdateKind::PreCheckoutQuery(p)
            | UpdateKind::Poll(p)
            | UpdateKind::PollAnswer(p)
            | UpdateKind::MyChatMember(p)
            | UpdateKind::ChatMember(p)
            | UpdateKind::ChatJoinRequest(p)
            | UpdateKind::ChatBoost(p)
            | UpdateKind::RemovedChatBoost(p) => Some(p),
            UpdateKind::Unknown(_) => None,
        }
    }
}

/// One update envelope, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct Update {
    pub update_id: i64,
    pub kind: UpdateKind,
    raw: Value,
}

impl Update {
    /// The envelope exactly as the Bot API delivered it.
    #[allow(dead_code)]
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.kind.payload()
    }

    pub fn from_value(raw: Value) -> Result<Self, DecodeError> {
        let envelope = raw.as_object().ok_or(DecodeError::NotAnObject)?;
        let update_id = envelope
            .get("update_id")
            .and_then(Value::as_i64)
            .ok_or(DecodeError::MissingUpdateId)?;

        // A payload field must hold an object; anything else is left
        // unclassified rather than failing the whole batch.
        let classified = PRIMARY_KINDS.iter().find_map(|&kind| {
            match envelope.get(kind.as_str()) {
                Some(Value::Object(fields)) => Some((kind, Payload::new(fields.clone()))),
                _ => None,
            }
        });

        let kind = match classified {
            Some((kind, payload)) => UpdateKind::classified(kind, payload),
            None => UpdateKind::Unknown(
                envelope
                    .iter()
                    .find(|(key, value)| key.as_str() != "update_id" && !value.is_null())
                    .map(|(key, _)| key.clone()),
            ),
        };

        Ok(Self {
            update_id,
            kind,
            raw,
        })
    }
}

impl TryFrom<Value> for Update {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Update::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decodes_every_primary_kind() {
        for kind in PRIMARY_KINDS {
            let mut raw = json!({ "update_id": 7 });
            raw[kind.as_str()] = json!({ "id": "x" });
            let update = Update::from_value(raw.clone()).unwrap();
            assert_eq!(update.update_id, 7);
            assert_eq!(update.kind.event_kind(), Some(kind));
            assert_eq!(update.raw(), &raw);
            assert_eq!(update.payload().unwrap().get("id"), Some(&json!("x")));
        }
    }

    #[test]
    fn test_unknown_field_is_kept_unclassified() {
        let update = Update::from_value(json!({
            "update_id": 3,
            "business_message": { "message_id": 1 }
        }))
        .unwrap();
        assert_eq!(
            update.kind,
            UpdateKind::Unknown(Some("business_message".to_string()))
        );
        assert!(update.payload().is_none());
    }

    #[test]
    fn test_null_or_scalar_payload_is_not_classified() {
        let update = Update::from_value(json!({ "update_id": 4, "message": null })).unwrap();
        assert_eq!(update.kind, UpdateKind::Unknown(None));

        let update = Update::from_value(json!({ "update_id": 5, "poll": 12 })).unwrap();
        assert_eq!(update.kind.event_kind(), None);
    }

    #[test]
    fn test_rejects_envelopes_without_update_id() {
        assert_eq!(
            Update::from_value(json!({ "message": {} })),
            Err(DecodeError::MissingUpdateId)
        );
        assert_eq!(
            Update::from_value(json!({ "update_id": "1", "message": {} })),
            Err(DecodeError::MissingUpdateId)
        );
        assert_eq!(Update::from_value(json!([1, 2])), Err(DecodeError::NotAnObject));
    }

    #[test]
    fn test_deserialize_through_serde() {
        let body = r#"[
            {"update_id":1,"message":{"text":"hi"}},
            {"update_id":2,"inline_query":{"query":"q"}}
        ]"#;
        let updates: Vec<Update> = serde_json::from_str(body).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].kind.event_kind(), Some(EventKind::InlineQuery));
    }

    #[test]
    fn test_payload_treats_null_as_absent() {
        let update = Update::from_value(json!({
            "update_id": 9,
            "message": { "text": "hi", "reply_to_message": null }
        }))
        .unwrap();
        let payload = update.payload().unwrap();
        assert!(payload.has("text"));
        assert!(!payload.has("reply_to_message"));
    }

    #[test]
    fn test_payload_deserializes_into_caller_type() {
        #[derive(serde::Deserialize)]
        struct Text {
            text: String,
        }
        let update =
            Update::from_value(json!({ "update_id": 1, "message": { "text": "hello" } })).unwrap();
        let text: Text = update.payload().unwrap().deserialize().unwrap();
        assert_eq!(text.text, "hello");
    }
}
