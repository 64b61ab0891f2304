//! Message type and priority levels

use core::fmt;
use std::any::Any;
use std::time::Instant;

/// Opaque message payload; dropped with the message
pub type MsgPayload = Box<dyn Any + Send>;

/// Message priority level
///
/// Lower index = higher priority. The queue holds one FIFO list per level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum MsgPriority {
    /// Control traffic that must preempt everything else
    VeryHigh = 0,
    High = 1,
    /// Default for ordinary traffic
    Normal = 2,
    Low = 3,
    VeryLow = 4,
}

impl MsgPriority {
    /// Number of priority levels
    pub const COUNT: usize = 5;

    #[inline]
    pub const fn as_index(&self) -> usize {
        *self as usize
    }

    #[inline]
    pub const fn from_index(idx: usize) -> Option<MsgPriority> {
        match idx {
            0 => Some(MsgPriority::VeryHigh),
            1 => Some(MsgPriority::High),
            2 => Some(MsgPriority::Normal),
            3 => Some(MsgPriority::Low),
            4 => Some(MsgPriority::VeryLow),
            _ => None,
        }
    }

    /// Iterator over all priorities (highest to lowest)
    pub fn iter() -> impl Iterator<Item = MsgPriority> {
        [
            MsgPriority::VeryHigh,
            MsgPriority::High,
            MsgPriority::Normal,
            MsgPriority::Low,
            MsgPriority::VeryLow,
        ]
        .into_iter()
    }
}

impl Default for MsgPriority {
    fn default() -> Self {
        MsgPriority::Normal
    }
}

impl fmt::Display for MsgPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MsgPriority::VeryHigh => write!(f, "VERY_HIGH"),
            MsgPriority::High => write!(f, "HIGH"),
            MsgPriority::Normal => write!(f, "NORMAL"),
            MsgPriority::Low => write!(f, "LOW"),
            MsgPriority::VeryLow => write!(f, "VERY_LOW"),
        }
    }
}

/// What a message carries
pub enum MsgBody {
    /// An integer code plus an optional opaque payload
    Data { code: i32, payload: Option<MsgPayload> },

    /// A closure executed on the consuming thread
    Exec(Box<dyn FnOnce() + Send>),
}

impl std::fmt::Debug for MsgBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MsgBody::Data { code, payload } => f
                .debug_struct("Data")
                .field("code", code)
                .field("payload", &payload.as_ref().map(|_| "<payload>"))
                .finish(),
            MsgBody::Exec(_) => f.debug_tuple("Exec").field(&"<closure>").finish(),
        }
    }
}

/// A queued message
pub struct Msg {
    pri: MsgPriority,
    /// Stamped under the queue lock at enqueue
    when: Option<Instant>,
    body: MsgBody,
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("pri", &self.pri)
            .field("when", &self.when)
            .field("body", &self.body)
            .finish()
    }
}

impl Msg {
    /// Build a data message
    pub fn data(pri: MsgPriority, code: i32, payload: Option<MsgPayload>) -> Msg {
        Msg {
            pri,
            when: None,
            body: MsgBody::Data { code, payload },
        }
    }

    /// Build an exec message
    pub fn exec(pri: MsgPriority, run: impl FnOnce() + Send + 'static) -> Msg {
        Msg {
            pri,
            when: None,
            body: MsgBody::Exec(Box::new(run)),
        }
    }

    #[inline]
    pub fn priority(&self) -> MsgPriority {
        self.pri
    }

    /// When the message was enqueued; `None` until it enters a queue
    #[inline]
    pub fn enqueued_at(&self) -> Option<Instant> {
        self.when
    }

    #[inline]
    pub fn body(&self) -> &MsgBody {
        &self.body
    }

    #[inline]
    pub fn into_body(self) -> MsgBody {
        self.body
    }

    pub(crate) fn stamp(&mut self) {
        self.when = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(MsgPriority::VeryHigh < MsgPriority::High);
        assert!(MsgPriority::High < MsgPriority::Normal);
        assert!(MsgPriority::Low < MsgPriority::VeryLow);
    }

    #[test]
    fn test_priority_round_trip() {
        for p in MsgPriority::iter() {
            assert_eq!(MsgPriority::from_index(p.as_index()), Some(p));
        }
        assert_eq!(MsgPriority::from_index(5), None);
    }

    #[test]
    fn test_message_stamp() {
        let mut m = Msg::data(MsgPriority::Normal, 7, None);
        assert!(m.enqueued_at().is_none());
        m.stamp();
        assert!(m.enqueued_at().is_some());
    }

    #[test]
    fn test_data_payload_downcast() {
        let m = Msg::data(MsgPriority::High, 1, Some(Box::new(String::from("abc"))));
        match m.into_body() {
            MsgBody::Data { code, payload } => {
                assert_eq!(code, 1);
                let s = payload.unwrap().downcast::<String>().unwrap();
                assert_eq!(*s, "abc");
            }
            _ => panic!("expected data message"),
        }
    }
}
