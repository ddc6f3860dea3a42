//! User persistence seam.
//!
//! The core never owns profile or currency storage. It registers joining
//! players and lets scripts read/adjust balances through [`UserStore`].
//! [`MemoryUserStore`] backs tests and standalone servers.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};

use crate::protocol::PlayerId;

/// Public profile of a stored user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: PlayerId,
    pub name: String,
}

/// Profile and balance storage.
pub trait UserStore: Send + Sync {
    /// Registers a user with a zero balance. Re-registering renames.
    fn create_user(&self, id: &PlayerId, name: &str) -> anyhow::Result<()>;

    fn get_user(&self, id: &PlayerId) -> Option<UserRecord>;

    /// Adds `amount` (may be negative) and returns the new balance.
    fn add_balance(&self, id: &PlayerId, amount: i64) -> anyhow::Result<i64>;

    /// Balance of a user; unknown users read as zero.
    fn get_balance(&self, id: &PlayerId) -> i64;
}

#[derive(Debug)]
struct Account {
    name: String,
    balance: i64,
}

/// In-memory [`UserStore`].
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    accounts: RwLock<HashMap<PlayerId, Account>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl UserStore for MemoryUserStore {
    fn create_user(&self, id: &PlayerId, name: &str) -> anyhow::Result<()> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        accounts
            .entry(id.clone())
            .and_modify(|a| a.name = name.to_string())
            .or_insert_with(|| Account {
                name: name.to_string(),
                balance: 0,
            });
        Ok(())
    }

    fn get_user(&self, id: &PlayerId) -> Option<UserRecord> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(id).map(|a| UserRecord {
            id: id.clone(),
            name: a.name.clone(),
        })
    }

    fn add_balance(&self, id: &PlayerId, amount: i64) -> anyhow::Result<i64> {
        let mut accounts = self.accounts.write().unwrap_or_else(PoisonError::into_inner);
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown user {id}"))?;
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or_else(|| anyhow::anyhow!("balance overflow for user {id}"))?;
        Ok(account.balance)
    }

    fn get_balance(&self, id: &PlayerId) -> i64 {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        accounts.get(id).map(|a| a.balance).unwrap_or(0)
    }
}
