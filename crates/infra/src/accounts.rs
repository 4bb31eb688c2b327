//! Connected ad accounts known to the submission service.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use adsight_core::{AccountId, OwnerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: AccountId,
    pub owner: OwnerId,
    pub platform: String,
    pub active: bool,
}

/// Lookup of linked accounts, used to validate live-account reports.
pub trait AccountDirectory: Send + Sync + 'static {
    fn lookup(&self, id: AccountId) -> Option<LinkedAccount>;
}

#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<AccountId, LinkedAccount>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account: LinkedAccount) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.id, account);
    }

    /// Mark an account disconnected. Returns false if it is unknown.
    pub fn deactivate(&self, id: AccountId) -> bool {
        match self
            .accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
        {
            Some(account) => {
                account.active = false;
                true
            }
            None => false,
        }
    }
}

impl AccountDirectory for InMemoryAccountDirectory {
    fn lookup(&self, id: AccountId) -> Option<LinkedAccount> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}
