use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);
id_newtype!(ClientId);
id_newtype!(TempId);

impl ClientId {
    /// Idempotency key minted at composition time, stable across retries of
    /// the same logical send.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl TempId {
    pub fn generate() -> Self {
        Self(format!("tmp-{}", Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "image" => MessageKind::Image,
            "voice" => MessageKind::Voice,
            "file" => MessageKind::File,
            _ => MessageKind::Text,
        }
    }
}
