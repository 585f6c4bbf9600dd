use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mqcore_utils::{timestamp_millis, TimestampMillis};

use crate::{MqError, Result};

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
pub type TopicName = ByteString;
pub type TopicFilter = ByteString;
/// Numeric protocol packet identifier; `0` is never a valid id.
pub type PacketId = u16;

pub const PUBLISH_COMMAND: u8 = 0x30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        *self as u8
    }

    #[inline]
    pub fn less_value(&self, other: QoS) -> QoS {
        if *self < other {
            *self
        } else {
            other
        }
    }
}

impl TryFrom<u8> for QoS {
    type Error = MqError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqError::Msg(format!("invalid qos value {v}"))),
        }
    }
}

/// A packet that the ledgers and the retained storage can hold.
pub trait Packet: Clone + Send + Sync + fmt::Debug + 'static {
    fn encode(&self) -> Result<Bytes>;

    fn decode(data: &[u8]) -> Result<Self>
    where
        Self: Sized;

    /// Content identity, unique per stored copy.
    fn uuid(&self) -> Uuid;

    fn command_code(&self) -> u8;
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub uuid: Uuid,
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
    pub create_time: TimestampMillis,
}

impl Publish {
    #[inline]
    pub fn new<T: Into<TopicName>>(topic: T, payload: Bytes, qos: QoS) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            dup: false,
            retain: false,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload,
            create_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = NonZeroU16::new(packet_id);
        self
    }

    /// Copy for one recipient: fresh identity, no packet id, delivery time reset.
    #[inline]
    pub fn fork(&self) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            dup: false,
            retain: false,
            packet_id: None,
            create_time: timestamp_millis(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publish {{ uuid: {}, topic: {}, qos: {:?}, packet_id: {:?}, dup: {}, retain: {}, payload: {}B }}",
            self.uuid,
            self.topic,
            self.qos,
            self.packet_id,
            self.dup,
            self.retain,
            self.payload.len()
        )
    }
}

impl Packet for Publish {
    #[inline]
    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    #[inline]
    fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    #[inline]
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    fn command_code(&self) -> u8 {
        PUBLISH_COMMAND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_order() {
        assert!(QoS::AtMostOnce < QoS::AtLeastOnce);
        assert!(QoS::AtLeastOnce < QoS::ExactlyOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn publish_codec() {
        let p = Publish::new("a/b", Bytes::from_static(b"hello"), QoS::AtLeastOnce).retain(true).packet_id(7);
        let data = p.encode().unwrap();
        let p2 = Publish::decode(&data).unwrap();
        assert_eq!(p, p2);
        assert_eq!(p2.command_code(), PUBLISH_COMMAND);
        assert!(Publish::decode(&data[..3]).is_err());
    }

    #[test]
    fn fork_gets_fresh_identity() {
        let p = Publish::new("a/b", Bytes::from_static(b"x"), QoS::ExactlyOnce).retain(true).packet_id(9);
        let c = p.fork();
        assert_ne!(c.uuid(), p.uuid());
        assert_eq!(c.packet_id, None);
        assert!(!c.retain);
        assert_eq!(c.topic, p.topic);
        assert_eq!(c.payload, p.payload);
    }
}
