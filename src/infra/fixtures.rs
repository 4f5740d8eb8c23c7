//! Card repository backed by a JSON fixture file.
//!
//! Lets the pipeline render candidate card states without a database:
//!
//! ```json
//! { "cards": [ { "id": "c1", "slugs": ["hello"], "published": true, "title": "Hello" } ] }
//! ```

use std::{collections::HashMap, path::Path};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::application::repos::{CardsRepo, RepoError};
use crate::domain::cards::{Card, RelatedCard, RelatedCards};

use super::error::InfraError;

#[derive(Debug, Deserialize)]
struct FixtureFile {
    cards: Vec<FixtureCard>,
}

#[derive(Debug, Deserialize)]
struct FixtureCard {
    #[serde(default)]
    slugs: Vec<String>,
    #[serde(flatten)]
    card: Card,
}

#[derive(Debug, Default)]
pub struct FixtureCards {
    cards: HashMap<String, Card>,
    slugs: HashMap<String, String>,
}

impl FixtureCards {
    pub async fn load(path: &Path) -> Result<Self, InfraError> {
        let raw = tokio::fs::read(path).await?;
        Self::from_json(&raw).map_err(|err| {
            InfraError::configuration(format!(
                "invalid card fixtures in {}: {err}",
                path.display()
            ))
        })
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let file: FixtureFile = serde_json::from_slice(raw)?;
        Ok(Self::from_cards(file.cards.into_iter().map(|entry| (entry.card, entry.slugs))))
    }

    pub fn from_cards(cards: impl IntoIterator<Item = (Card, Vec<String>)>) -> Self {
        let mut fixtures = Self::default();
        for (card, slugs) in cards {
            for slug in slugs {
                fixtures.slugs.entry(slug).or_insert_with(|| card.id.clone());
            }
            fixtures.cards.insert(card.id.clone(), card);
        }
        fixtures
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

#[async_trait]
impl CardsRepo for FixtureCards {
    async fn find_card_by_id_or_slug(&self, id_or_slug: &str) -> Result<Option<Card>, RepoError> {
        let card = self.cards.get(id_or_slug).or_else(|| {
            self.slugs
                .get(id_or_slug)
                .and_then(|id| self.cards.get(id))
        });
        Ok(card.cloned())
    }

    async fn related_cards_for(&self, card: &Card) -> Result<RelatedCards, RepoError> {
        Ok(card
            .links
            .iter()
            .filter_map(|id| {
                let linked = self.cards.get(id)?;
                Some((id.clone(), related_projection(linked)))
            })
            .collect())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

fn related_projection(card: &Card) -> RelatedCard {
    let mut extra = match serde_json::to_value(card) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    extra.remove("id");
    extra.remove("published");
    RelatedCard {
        published: card.is_published(),
        extra,
    }
}
