// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Test doubles shared by the unit tests.

use std::collections::BTreeMap;

use crate::error::StorageError;
use crate::storage::{AccountId, ChatStore, MemoryChatStore, MessageId, NewMessage, StoredMessage};

/// A store whose message operations always fail.
///
/// Built with [`FailingStore::with_accounts`], account lookups still work so
/// a session can log in and then hit the failing read paths.
pub struct FailingStore {
    accounts: Option<MemoryChatStore>,
}

impl FailingStore {
    /// Every operation fails, including login.
    pub fn new() -> Self {
        FailingStore { accounts: None }
    }

    /// Accounts work; message operations fail.
    pub fn with_accounts(accounts: &[(&str, &str)]) -> Self {
        let store = MemoryChatStore::with_hash_iterations(1_000);
        for (username, password) in accounts {
            store.provision_account(username, password).unwrap();
        }
        FailingStore {
            accounts: Some(store),
        }
    }

    fn accounts(&self) -> Result<&MemoryChatStore, StorageError> {
        self.accounts.as_ref().ok_or(StorageError::Poisoned)
    }
}

impl ChatStore for FailingStore {
    fn find_account(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AccountId>, StorageError> {
        self.accounts()?.find_account(username, password)
    }

    fn provision_account(&self, username: &str, password: &str) -> Result<AccountId, StorageError> {
        self.accounts()?.provision_account(username, password)
    }

    fn insert_message(&self, _: NewMessage) -> Result<MessageId, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn query_history(&self, _: &str) -> Result<Vec<StoredMessage>, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn count_unread(&self, _: &str, _: &str) -> Result<u64, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn group_unread(&self, _: &str) -> Result<BTreeMap<String, u64>, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn mark_read(&self, _: &str, _: &str) -> Result<usize, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn account_count(&self) -> Result<usize, StorageError> {
        self.accounts()?.account_count()
    }

    fn message_count(&self) -> Result<usize, StorageError> {
        Err(StorageError::Poisoned)
    }
}
