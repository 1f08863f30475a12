//! Routes and handlers of the items service.

use axum::{Json, Router, extract::Path, http::StatusCode, routing::get};
use safe_persist_core::{GuardConfig, Persistence};
use safe_persist_testing::{InMemorySession, InMemoryStore};
use safe_persist_web::{AppError, GuardLayer, Guarded, RequestGuard, WebResult};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{CreateItem, ITEM_PREFIX, Item, LAST_VIEWED_KEY};

type Session = Guarded<InMemorySession>;

/// Item routes without the guard layer.
#[must_use]
pub fn item_routes() -> Router {
    Router::new()
        .route("/items", get(list_items).post(create_item))
        .route("/items/touch", get(touch_items))
        .route("/items/draft", get(draft_item).post(draft_item))
        .route("/items/:id", get(get_item))
}

/// Item routes behind the persistence guard.
#[must_use]
pub fn app(store: InMemoryStore, config: GuardConfig) -> Router {
    item_routes().layer(GuardLayer::new(store).with_config(config))
}

fn item_key(id: &str) -> String {
    format!("{ITEM_PREFIX}{id}")
}

async fn list_items(Guarded(session): Session, RequestGuard(context): RequestGuard) -> Json<Vec<Item>> {
    let items: Vec<Item> = session
        .inner()
        .list()
        .into_iter()
        .filter_map(|(key, name)| {
            key.strip_prefix(ITEM_PREFIX).map(|id| Item {
                id: id.to_string(),
                name,
            })
        })
        .collect();

    debug!(request_id = %context.request_id(), count = items.len(), "Listed items");
    Json(items)
}

async fn get_item(Guarded(session): Session, Path(id): Path<String>) -> WebResult<Json<Item>> {
    let name = session
        .inner()
        .get(&item_key(&id))
        .ok_or_else(|| AppError::not_found("Item", &id))?;

    Ok(Json(Item { id, name }))
}

async fn create_item(
    Guarded(session): Session,
    Json(request): Json<CreateItem>,
) -> WebResult<(StatusCode, Json<Item>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("Item name must not be blank"));
    }

    let item = Item {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
    };
    session.inner().insert(item_key(&item.id), item.name.clone());
    session.persist().await?;

    info!(item_id = %item.id, "Item created");
    Ok((StatusCode::CREATED, Json(item)))
}

/// Records when the catalogue was last viewed. Persisting on a safe request
/// is blocked.
async fn touch_items(Guarded(session): Session, RequestGuard(context): RequestGuard) -> WebResult<Json<Vec<Item>>> {
    session
        .inner()
        .insert(LAST_VIEWED_KEY, context.entered_at().to_rfc3339());
    session.persist().await?;
    Ok(Json(Vec::new()))
}

/// Stages an item and answers as if it were saved, without persisting.
async fn draft_item(Guarded(session): Session) -> (StatusCode, Json<Item>) {
    let item = Item {
        id: Uuid::new_v4().to_string(),
        name: "draft".to_string(),
    };
    session.inner().insert(item_key(&item.id), item.name.clone());
    (StatusCode::ACCEPTED, Json(item))
}
