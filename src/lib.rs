//! # fragdb - A Fragment Store for Retrieval Augmented Answers
//!
//! fragdb keeps short text fragments with their embedding vectors in a single
//! SQLite file. Vectors are stored as little-endian `f64` blobs and compared
//! inside SQLite by the `vec_dist` scalar function (negated cosine
//! similarity), so a nearest neighbour query is a plain ascending `ORDER BY`.
//!
//! ## Example
//!
//! ```
//! use fragdb::{search, FragmentStore, Limit};
//!
//! let store = FragmentStore::open_in_memory().unwrap();
//!
//! // Store fragments under two labels
//! store.upsert("QA", "refunds", "Refunds take 14 days", "openai/small", &[1.0, 0.0, 0.0]).unwrap();
//! store.upsert("QA", "shipping", "Shipping is free", "openai/small", &[0.0, 1.0, 0.0]).unwrap();
//! store.upsert("policies", "returns", "Returns need a receipt", "openai/small", &[0.9, 0.1, 0.0]).unwrap();
//!
//! // Unchanged content does not need a new embedding
//! assert!(!store.is_dirty("QA", "refunds", "Refunds take 14 days").unwrap());
//!
//! // One fragment per label, merged without duplicates
//! let limits = vec![Limit::new("QA", 1), Limit::new("policies", 1)];
//! let found = search(&store, &[1.0, 0.2, 0.0], &limits).unwrap();
//! assert_eq!(found[0].name, "refunds");
//! assert_eq!(found[1].name, "returns");
//! ```

pub mod config;
pub mod distance;
pub mod error;
pub mod openai;
pub mod provider;
pub mod rag;
pub mod search;
pub mod server;
pub mod store;
pub mod vector;

pub use distance::{DecodeCache, DistanceStats, ScalarFunctionHost, StatsSnapshot, VecDist, VectorArg};
pub use error::{CodecError, DistanceError, Error, Result};
pub use provider::{EmbedPurpose, Embedder, Generator, ModelRef, Proxy};
pub use rag::{AddOutcome, Answer, Knowledge};
pub use search::{search, Limit};
pub use store::{Fragment, FragmentStore, DEFAULT_LABEL};
