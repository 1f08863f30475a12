//! Items API demonstrating the persistence guard.
//!
//! A small catalogue of named items kept in an in-memory store. Two routes
//! are deliberately faulty so each violation cause can be observed:
//!
//! | Route | Outcome |
//! |---|---|
//! | `GET /items` | lists committed items |
//! | `POST /items` | stages and persists an item, `201 Created` |
//! | `GET /items/:id` | one item or `404` |
//! | `GET /items/touch` | persists on a safe request, blocked (Forbidden) |
//! | `POST /items/draft` | stages without persisting (`UnsafedData`) |
//! | `GET /items/draft` | stages on a safe request (`ModifiedData`) |

use serde::{Deserialize, Serialize};

pub mod router;

pub use router::{app, item_routes};

/// A catalogue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Item identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Body of `POST /items`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateItem {
    /// Display name; must not be blank.
    pub name: String,
}

/// Key prefix of item entries in the store.
pub const ITEM_PREFIX: &str = "item:";

/// Key of the view marker written by `GET /items/touch`.
pub const LAST_VIEWED_KEY: &str = "meta:last-viewed";
