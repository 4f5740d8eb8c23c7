//! Postgres-backed card repository.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{
    query, query_as,
    postgres::{PgPool, PgPoolOptions},
    types::Json,
};

use crate::application::repos::{CardsRepo, RepoError};
use crate::domain::cards::{Card, RelatedCard, RelatedCards};

#[derive(sqlx::FromRow)]
struct CardRow {
    id: String,
    published: bool,
    payload: Json<Value>,
}

impl CardRow {
    fn into_card(self) -> Result<Card, RepoError> {
        card_from_payload(self.id, self.published, self.payload.0)
    }

    fn into_related(self) -> (String, RelatedCard) {
        let mut extra = match self.payload.0 {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        extra.remove("id");
        extra.remove("published");
        (
            self.id,
            RelatedCard {
                published: self.published,
                extra,
            },
        )
    }
}

/// Build a card from its stored payload. The row's own `id` and `published`
/// columns win over whatever the payload carries.
pub fn card_from_payload(id: String, published: bool, payload: Value) -> Result<Card, RepoError> {
    let mut object = match payload {
        Value::Object(map) => map,
        Value::Null => Default::default(),
        other => {
            return Err(RepoError::malformed(
                &id,
                format!("payload must be a JSON object, found {other}"),
            ));
        }
    };
    object.insert("id".to_string(), Value::String(id.clone()));
    object.insert("published".to_string(), Value::Bool(published));

    serde_json::from_value(Value::Object(object)).map_err(|err| RepoError::malformed(&id, err))
}

#[derive(Clone)]
pub struct PostgresCards {
    pool: Arc<PgPool>,
}

impl PostgresCards {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(Into::into)
    }
}

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            RepoError::Timeout
        }
        other => RepoError::from_persistence(other),
    }
}

#[async_trait]
impl CardsRepo for PostgresCards {
    async fn find_card_by_id_or_slug(&self, id_or_slug: &str) -> Result<Option<Card>, RepoError> {
        let row = query_as::<_, CardRow>(
            r#"
            SELECT id, published, payload
            FROM cards
            WHERE id = $1 OR $1 = ANY(slugs)
            ORDER BY (id = $1) DESC, id
            LIMIT 1
            "#,
        )
        .bind(id_or_slug)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(CardRow::into_card).transpose()
    }

    async fn related_cards_for(&self, card: &Card) -> Result<RelatedCards, RepoError> {
        if card.links.is_empty() {
            return Ok(RelatedCards::new());
        }

        let rows = query_as::<_, CardRow>(
            r#"
            SELECT id, published, payload
            FROM cards
            WHERE id = ANY($1)
            "#,
        )
        .bind(&card.links)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(CardRow::into_related).collect())
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_columns_override_the_payload() {
        let card = card_from_payload(
            "c1".to_string(),
            true,
            json!({ "id": "stale", "published": false, "title": "Hello", "links": ["c2"] }),
        )
        .expect("card");

        assert_eq!(card.id, "c1");
        assert!(card.is_published());
        assert_eq!(card.title.as_deref(), Some("Hello"));
        assert_eq!(card.links, vec!["c2".to_string()]);
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let err = card_from_payload("c1".to_string(), true, json!([1, 2])).expect_err("array");
        assert!(matches!(err, RepoError::Malformed { ref id, .. } if id == "c1"));
    }

    #[test]
    fn related_projection_drops_identity_columns() {
        let row = CardRow {
            id: "c2".to_string(),
            published: true,
            payload: Json(json!({ "id": "c2", "published": false, "title": "Other" })),
        };

        let (id, related) = row.into_related();
        assert_eq!(id, "c2");
        assert!(related.published);
        assert_eq!(related.extra.get("title"), Some(&json!("Other")));
        assert!(!related.extra.contains_key("id"));
    }
}
