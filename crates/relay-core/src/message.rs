//! Relay-to-client messages.
//!
//! Each message serializes as a JSON array whose first element names it:
//!
//! ```json
//! ["EVENT", "sub1", {"id": "…", …}]
//! ["EOSE", "sub1"]
//! ["OK", "5c83…", true, ""]
//! ["NOTICE", "rate-limited: slow down"]
//! ```

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// One stored event matching a subscription.
    Event { subscription_id: String, event: Event },
    /// All stored matches for the subscription have been sent.
    Eose { subscription_id: String },
    /// Outcome of an event submission. `message` is empty on acceptance,
    /// otherwise a machine-readable prefix (`invalid:`, `duplicate:`,
    /// `error:`) followed by a human-readable reason.
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice { message: String },
}

impl RelayMessage {
    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice {
            message: message.into(),
        }
    }

    /// Compact JSON text of the message.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("[\"NOTICE\",\"error: unencodable message\"]"))
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event)?;
                seq.end()
            }
            RelayMessage::Eose { subscription_id } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Notice { message } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_serialize_as_tagged_arrays() {
        let eose = RelayMessage::Eose {
            subscription_id: "sub1".into(),
        };
        assert_eq!(serde_json::to_value(&eose).unwrap(), json!(["EOSE", "sub1"]));

        let ok = RelayMessage::Ok {
            event_id: "ab".into(),
            accepted: false,
            message: "duplicate: already have this event".into(),
        };
        assert_eq!(
            ok.to_json(),
            r#"["OK","ab",false,"duplicate: already have this event"]"#
        );

        assert_eq!(
            serde_json::to_value(RelayMessage::notice("rate-limited: slow down")).unwrap(),
            json!(["NOTICE", "rate-limited: slow down"])
        );
    }

    #[test]
    fn event_message_embeds_the_event_object() {
        let event = Event {
            id: "aa".into(),
            pubkey: "bb".into(),
            kind: 1,
            created_at: 5,
            tags: vec![],
            content: "hi".into(),
            sig: "cc".into(),
        };
        let msg = RelayMessage::Event {
            subscription_id: "s".into(),
            event: event.clone(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value[0], "EVENT");
        assert_eq!(value[1], "s");
        assert_eq!(serde_json::from_value::<Event>(value[2].clone()).unwrap(), event);
    }
}
