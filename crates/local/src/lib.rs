//! Filesystem-backed state store, lock files and a local provider.
//!
//! Layout under the backend root:
//!
//! ```text
//! <root>/state/<key>/v000001.json   one file per saved version
//! <root>/locks/<key>.lock            present while a run holds the key
//! <root>/objects.json                objects managed by LocalProvider
//! ```

mod backend;
mod provider;

pub use backend::LocalBackend;
pub use provider::LocalProvider;
