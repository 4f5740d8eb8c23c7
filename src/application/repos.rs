//! Repository traits describing the card data layer.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::cards::{Card, RelatedCards};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("stored card `{id}` is malformed: {message}")]
    Malformed { id: String, message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn malformed(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            id: id.into(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
pub trait CardsRepo: Send + Sync {
    /// Resolve a card by identifier, falling back to slug. An identifier match
    /// wins over a slug match.
    async fn find_card_by_id_or_slug(&self, id_or_slug: &str) -> Result<Option<Card>, RepoError>;

    /// Load the cards `card` links to. Links to cards that do not exist are
    /// omitted.
    async fn related_cards_for(&self, card: &Card) -> Result<RelatedCards, RepoError>;

    /// Confirm the backing store is reachable.
    async fn health_check(&self) -> Result<(), RepoError>;
}
