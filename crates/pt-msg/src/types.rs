//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message value type carried by every transport primitive."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bytes::Bytes;

/// Opaque payload plus an opaque attribute side-channel.
///
/// Fields are private so a constructed message cannot be mutated; cloning is
/// cheap because both halves are reference-counted [`Bytes`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Message {
    payload: Bytes,
    attributes: Bytes,
}

impl Message {
    /// Construct a message from any byte-like payload and attributes.
    pub fn new(payload: impl Into<Bytes>, attributes: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            attributes: attributes.into(),
        }
    }

    /// Construct a message from static byte strings without copying.
    pub fn from_static(payload: &'static [u8], attributes: &'static [u8]) -> Self {
        Self {
            payload: Bytes::from_static(payload),
            attributes: Bytes::from_static(attributes),
        }
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Opaque attribute bytes (routing/trace metadata).
    pub fn attributes(&self) -> &Bytes {
        &self.attributes
    }

    /// Total number of bytes carried, payload and attributes together.
    pub fn len(&self) -> usize {
        self.payload.len() + self.attributes.len()
    }

    /// True when both payload and attributes are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split the message into `(payload, attributes)`.
    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.payload, self.attributes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_static_keeps_both_halves() {
        let message = Message::from_static(b"hello", b"k=v");
        assert_eq!(message.payload().as_ref(), b"hello");
        assert_eq!(message.attributes().as_ref(), b"k=v");
        assert_eq!(message.len(), 8);
    }

    #[test]
    fn new_accepts_owned_buffers() {
        let message = Message::new(vec![0u8, 255, 128], String::from("trace=1"));
        assert_eq!(message.payload().as_ref(), &[0u8, 255, 128]);
        assert_eq!(message.attributes().as_ref(), b"trace=1");
    }

    #[test]
    fn empty_message_reports_empty() {
        let message = Message::default();
        assert!(message.is_empty());
        let (payload, attributes) = message.into_parts();
        assert!(payload.is_empty() && attributes.is_empty());
    }

    #[test]
    fn clones_compare_equal() {
        let message = Message::from_static(b"ping", b"");
        assert_eq!(message.clone(), message);
    }
}
