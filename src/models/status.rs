//! Status vocabularies shared by the job families.
//!
//! Statuses are closed enums inside the crate but are persisted as plain string
//! tokens. A token written by a newer deployment that this build does not know
//! decodes into `Unknown` and is written back unchanged, so older readers never
//! fail on a record just because its status is new to them.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_status {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $token:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            /// A token this build does not recognise.
            Unknown(String),
        }

        impl $name {
            /// Persisted token for this status.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $token,)+
                    Self::Unknown(token) => token,
                }
            }
        }

        impl From<String> for $name {
            fn from(token: String) -> Self {
                match token.as_str() {
                    $($token => Self::$variant,)+
                    _ => Self::Unknown(token),
                }
            }
        }

        impl From<&str> for $name {
            fn from(token: &str) -> Self {
                Self::from(token.to_string())
            }
        }

        impl From<$name> for String {
            fn from(status: $name) -> Self {
                match status {
                    $name::Unknown(token) => token,
                    known => known.as_str().to_string(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_status! {
    /// Status of an export job and of its main archive.
    JobStatus {
        InProgress => "IN_PROGRESS",
        Success => "SUCCESS",
        Error => "ERROR",
    }
}

string_status! {
    /// Status of a thumbnail, compare or convert request.
    GenerationStatus {
        Loading => "LOADING",
        Unavailable => "UNAVAILABLE",
        CouldNotGenerate => "COULDNOTGENERATE",
        Available => "AVAILABLE",
    }
}

string_status! {
    /// Processing state of a chunk of generation requests.
    ChunkStatus {
        InQueue => "INQUEUE",
        Processing => "PROCESSING",
        Processed => "PROCESSED",
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

impl GenerationStatus {
    /// COULDNOTGENERATE and the ready states are terminal; unknown tokens are not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CouldNotGenerate | Self::Available)
    }
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed)
    }

    /// Chunks only move forward through INQUEUE, PROCESSING, PROCESSED.
    /// Repeating the current status is allowed; unknown tokens never match.
    pub fn can_advance_to(&self, next: &ChunkStatus) -> bool {
        match (self.stage(), next.stage()) {
            (Some(from), Some(to)) => to >= from,
            _ => false,
        }
    }

    fn stage(&self) -> Option<u8> {
        match self {
            Self::InQueue => Some(0),
            Self::Processing => Some(1),
            Self::Processed => Some(2),
            Self::Unknown(_) => None,
        }
    }
}
