use serde::{Deserialize, Serialize};

use crate::{Currency, Entity, UserId};

/// A user's current spendable amount.
///
/// Created implicitly by the first credit and never deleted. Funds placed on
/// hold by a reservation are no longer part of `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    user_id: UserId,
    amount: Currency,
}

impl Balance {
    pub fn new(user_id: UserId, amount: Currency) -> Self {
        Self { user_id, amount }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn amount(&self) -> Currency {
        self.amount
    }
}

impl Entity for Balance {
    type Id = UserId;

    fn id(&self) -> &Self::Id {
        &self.user_id
    }
}
