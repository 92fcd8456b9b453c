//! Core traits for application messages.
//!
//! These traits define the contract between the transport and the
//! application-level message types it carries.

use super::codec::Writer;
use super::time::HostTimestamp;

/// An application message that can be sent to a peer.
///
/// The transport only frames the envelope: channel, delivery flags and an
/// optional timestamp. The payload layout is owned by the implementor.
///
/// # Example
///
/// ```
/// use netcode::core::{Message, Writer};
///
/// struct Chat { text: String }
///
/// impl Message for Chat {
///     fn channel(&self) -> u8 { 1 }
///     fn reliable(&self) -> bool { true }
///     fn ordered(&self) -> bool { true }
///     fn write(&self, writer: &mut Writer) {
///         writer.write_str(&self.text);
///     }
/// }
/// ```
pub trait Message {
    /// Channel the message travels on. Ordering and deduplication are scoped
    /// to a channel.
    fn channel(&self) -> u8 {
        super::constants::CHANNEL_DEFAULT
    }

    /// Whether the message carries a timestamp.
    fn timed(&self) -> bool {
        false
    }

    /// Timestamp to send with a timed message. `None` means "now".
    fn timestamp(&self) -> Option<HostTimestamp> {
        None
    }

    /// Whether the message is retransmitted until acknowledged.
    fn reliable(&self) -> bool {
        false
    }

    /// Whether the message is delivered in sequence order.
    fn ordered(&self) -> bool {
        false
    }

    /// Whether duplicates of the message are suppressed.
    fn unique(&self) -> bool {
        false
    }

    /// Serialize the payload.
    fn write(&self, writer: &mut Writer);
}

/// A message whose payload is a plain byte buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BytesMessage {
    /// Channel.
    pub channel: u8,
    /// Timed flag.
    pub timed: bool,
    /// Reliable flag.
    pub reliable: bool,
    /// Ordered flag.
    pub ordered: bool,
    /// Unique flag.
    pub unique: bool,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl BytesMessage {
    /// Create an unreliable, unordered message.
    pub fn new(channel: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel,
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Mark the message timed.
    pub fn with_timed(mut self) -> Self {
        self.timed = true;
        self
    }

    /// Mark the message reliable.
    pub fn with_reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Mark the message ordered.
    pub fn with_ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Mark the message unique.
    pub fn with_unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl Message for BytesMessage {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn timed(&self) -> bool {
        self.timed
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn ordered(&self) -> bool {
        self.ordered
    }

    fn unique(&self) -> bool {
        self.unique
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.payload);
    }
}

impl<M: Message + ?Sized> Message for &M {
    fn channel(&self) -> u8 {
        (**self).channel()
    }

    fn timed(&self) -> bool {
        (**self).timed()
    }

    fn timestamp(&self) -> Option<HostTimestamp> {
        (**self).timestamp()
    }

    fn reliable(&self) -> bool {
        (**self).reliable()
    }

    fn ordered(&self) -> bool {
        (**self).ordered()
    }

    fn unique(&self) -> bool {
        (**self).unique()
    }

    fn write(&self, writer: &mut Writer) {
        (**self).write(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_message_flags() {
        let message = BytesMessage::new(3, b"abc".to_vec())
            .with_reliable()
            .with_ordered();
        assert_eq!(message.channel(), 3);
        assert!(message.reliable());
        assert!(message.ordered());
        assert!(!message.unique());
        assert!(!message.timed());

        let mut writer = Writer::new();
        message.write(&mut writer);
        assert_eq!(writer.as_slice(), b"abc");
    }
}
