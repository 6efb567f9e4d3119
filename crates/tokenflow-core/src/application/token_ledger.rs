//! Token ledger
//!
//! Tracks the live tokens of every process instance. Consumed tokens are
//! archived rather than dropped so that ancestry stays walkable.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

use crate::domain::events::{event_types, RecordEvent};
use crate::domain::process_instance::ProcessInstanceId;
use crate::domain::repository::{Record, RecordKey, Transaction};
use crate::domain::token::{ArchivedToken, Token, TokenId};
use crate::CoreError;

/// Token operations, always run inside the caller's transaction
#[async_trait]
pub trait TokenService: Send + Sync {
    /// A live token with the given reference
    async fn get_token(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Token, CoreError>;

    /// Create `count` tokens sharing `ref_id` and `parent_ref_id`
    async fn create_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
        parent_ref_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<Token>, CoreError>;

    /// Consume one live token with the given reference
    async fn consume_token(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Token, CoreError>;

    /// Consume `count` live tokens with the given reference
    async fn consume_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
        count: usize,
    ) -> Result<Vec<Token>, CoreError>;

    /// Number of live tokens
    async fn count_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, CoreError>;

    /// Live tokens
    async fn tokens_of(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Token>, CoreError>;

    /// Ancestry of `ref_id`, starting with a token of that reference and
    /// ending with a root token. Live and consumed tokens are both walked.
    async fn lineage(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Vec<Token>, CoreError>;

    /// Remove every live and consumed token, returning how many were removed
    async fn delete_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, CoreError>;
}

/// Recorder-backed [`TokenService`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenLedger;

impl TokenLedger {
    /// Create a ledger
    pub fn new() -> Self {
        Self
    }

    async fn find_any(
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Option<Token>, CoreError> {
        let live = tx.tokens_of(process_instance_id).await?;
        if let Some(token) = live.into_iter().find(|t| t.ref_id == ref_id) {
            return Ok(Some(token));
        }
        let archived = tx.archived_tokens_of(process_instance_id).await?;
        Ok(archived
            .into_iter()
            .map(|a| a.token)
            .find(|t| t.ref_id == ref_id))
    }
}

#[async_trait]
impl TokenService for TokenLedger {
    async fn get_token(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Token, CoreError> {
        tx.tokens_of(process_instance_id)
            .await?
            .into_iter()
            .find(|token| token.ref_id == ref_id)
            .ok_or(CoreError::TokenNotFound {
                process_instance_id: process_instance_id.0,
                ref_id,
            })
    }

    async fn create_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
        parent_ref_id: Option<u64>,
        count: usize,
    ) -> Result<Vec<Token>, CoreError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let token = Token {
                id: TokenId(tx.next_id()),
                ref_id,
                parent_ref_id,
                process_instance_id,
            };
            tx.record_insert(
                Record::Token(token.clone()),
                RecordEvent::new(event_types::TOKEN_CREATED).for_process_instance(process_instance_id),
            )
            .await?;
            created.push(token);
        }
        debug!(
            process_instance_id = %process_instance_id,
            ref_id,
            parent_ref_id = ?parent_ref_id,
            count,
            "Tokens created"
        );
        Ok(created)
    }

    async fn consume_token(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Token, CoreError> {
        let token = self.get_token(tx, process_instance_id, ref_id).await?;
        tx.record_delete(
            RecordKey::Token(token.id),
            RecordEvent::new(event_types::TOKEN_DELETED).for_process_instance(process_instance_id),
        )
        .await?;
        tx.record_insert(
            Record::ArchivedToken(ArchivedToken::from(token.clone())),
            RecordEvent::new(event_types::ARCHIVED).for_process_instance(process_instance_id),
        )
        .await?;
        debug!(process_instance_id = %process_instance_id, ref_id, token_id = %token.id, "Token consumed");
        Ok(token)
    }

    async fn consume_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
        count: usize,
    ) -> Result<Vec<Token>, CoreError> {
        let mut consumed = Vec::with_capacity(count);
        for _ in 0..count {
            consumed.push(self.consume_token(tx, process_instance_id, ref_id).await?);
        }
        Ok(consumed)
    }

    async fn count_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, CoreError> {
        Ok(tx.tokens_of(process_instance_id).await?.len())
    }

    async fn tokens_of(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<Token>, CoreError> {
        Ok(tx.tokens_of(process_instance_id).await?)
    }

    async fn lineage(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
        ref_id: u64,
    ) -> Result<Vec<Token>, CoreError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(ref_id);

        while let Some(current) = next {
            if !seen.insert(current) {
                break;
            }
            match Self::find_any(tx, process_instance_id, current).await? {
                Some(token) => {
                    next = token.parent_ref_id;
                    chain.push(token);
                }
                None if chain.is_empty() => {
                    return Err(CoreError::TokenNotFound {
                        process_instance_id: process_instance_id.0,
                        ref_id,
                    })
                }
                None => break,
            }
        }

        Ok(chain)
    }

    async fn delete_tokens(
        &self,
        tx: &mut dyn Transaction,
        process_instance_id: ProcessInstanceId,
    ) -> Result<usize, CoreError> {
        let mut removed = 0;
        for token in tx.tokens_of(process_instance_id).await? {
            tx.record_delete(
                RecordKey::Token(token.id),
                RecordEvent::new(event_types::TOKEN_DELETED).for_process_instance(process_instance_id),
            )
            .await?;
            removed += 1;
        }
        for archived in tx.archived_tokens_of(process_instance_id).await? {
            tx.record_delete(
                RecordKey::ArchivedToken(archived.token.id),
                RecordEvent::new(event_types::ARCHIVE_DELETED)
                    .for_process_instance(process_instance_id),
            )
            .await?;
            removed += 1;
        }
        Ok(removed)
    }
}
