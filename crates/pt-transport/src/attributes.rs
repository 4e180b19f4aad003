//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Mapping between message attributes and substrate attachments."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bytes::Bytes;
use pt_msg::Message;
use pt_substrate::{Attachment, Sample};

/// Attachment entry that carries [`Message::attributes`] on every put,
/// query and reply.
pub const ATTRIBUTES_KEY: &str = "attributes";

pub(crate) fn attachment_for(message: &Message) -> Attachment {
    Attachment::single(ATTRIBUTES_KEY, message.attributes().clone())
}

pub(crate) fn attributes_of(attachment: Option<&Attachment>) -> Option<Bytes> {
    attachment?.get(ATTRIBUTES_KEY).cloned()
}

/// Rebuild a message from a sample, or `None` when the attributes entry is
/// missing.
pub(crate) fn message_from(sample: &Sample) -> Option<Message> {
    let attributes = attributes_of(sample.attachment.as_ref())?;
    Some(Message::new(sample.payload.clone(), attributes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pt_substrate::KeyExpr;

    #[test]
    fn empty_attributes_still_produce_an_entry() {
        let attachment = attachment_for(&Message::from_static(b"payload", b""));
        assert_eq!(attachment.get(ATTRIBUTES_KEY), Some(&Bytes::new()));
    }

    #[test]
    fn sample_without_entry_is_not_a_message() {
        let key = KeyExpr::new("t/1").expect("key");
        let bare = Sample::new(key.clone(), Bytes::from_static(b"x"), None);
        assert!(message_from(&bare).is_none());

        let other = Sample::new(key, Bytes::from_static(b"x"), Some(Attachment::single("trace", "1")));
        assert!(message_from(&other).is_none());
    }

    #[test]
    fn sample_with_entry_round_trips_attributes() {
        let message = Message::from_static(b"hello", b"k=v");
        let sample = Sample::new(
            KeyExpr::new("t/1").expect("key"),
            message.payload().clone(),
            Some(attachment_for(&message)),
        );
        assert_eq!(message_from(&sample), Some(message));
    }
}
