// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Uuid-backed identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies the chat a composer session is bound to.
///
/// Also the key under which drafts are persisted.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChatId {
    pub uuid: Uuid,
}

impl ChatId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Identifies one submission captured by the outbox.
///
/// Assigned when a submission is queued while offline, so the embedding
/// application can correlate the queued acknowledgement with the later replay.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubmissionId {
    pub uuid: Uuid,
}

impl SubmissionId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// Identifies one unit of background compression work.
///
/// Never reused; every task resolves exactly once under its id.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub uuid: Uuid,
}

impl TaskId {
    pub fn new(uuid: Uuid) -> Self {
        Self { uuid }
    }

    pub fn random() -> Self {
        Self {
            uuid: Uuid::new_v4(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

mod sqlx_impls {
    use sqlx::{Database, Decode, Encode, Sqlite, Type, encode::IsNull, error::BoxDynError};

    use super::*;

    impl Type<Sqlite> for ChatId {
        fn type_info() -> <Sqlite as Database>::TypeInfo {
            <Uuid as Type<Sqlite>>::type_info()
        }
    }

    impl<'q> Encode<'q, Sqlite> for ChatId {
        fn encode_by_ref(
            &self,
            buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
        ) -> Result<IsNull, BoxDynError> {
            Encode::<Sqlite>::encode_by_ref(&self.uuid, buf)
        }
    }

    impl<'r> Decode<'r, Sqlite> for ChatId {
        fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
            let id: Uuid = Decode::<Sqlite>::decode(value)?;
            Ok(Self::new(id))
        }
    }
}
