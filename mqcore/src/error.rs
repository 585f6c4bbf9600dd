use crate::topic::TopicError;
use crate::types::{ClientId, PacketId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqError {
    #[error("topic error, {0}")]
    Topic(#[from] TopicError),
    #[error("not found, {0}")]
    NotFound(String),
    #[error("invalid node, {0}")]
    InvalidNode(String),
    #[error("client not found, {0}")]
    ClientNotFound(ClientId),
    #[error("provided packet id is in use, {0}")]
    PacketIdInUse(PacketId),
    #[error("no packet id available")]
    PacketIdExhausted,
    #[error("codec error, {0}")]
    Codec(String),
    #[error("{0}")]
    Msg(String),
}

impl MqError {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, MqError::NotFound(_) | MqError::ClientNotFound(_))
    }
}

impl From<bincode::Error> for MqError {
    #[inline]
    fn from(e: bincode::Error) -> Self {
        MqError::Codec(e.to_string())
    }
}

impl From<String> for MqError {
    #[inline]
    fn from(e: String) -> Self {
        MqError::Msg(e)
    }
}

impl From<&str> for MqError {
    #[inline]
    fn from(e: &str) -> Self {
        MqError::Msg(e.to_string())
    }
}
