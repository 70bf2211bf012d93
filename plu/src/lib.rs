//! Catalog model and PLU codec.
//!
//! A PLU identifies one sellable unit of a product: product, version, variant
//! and, depending on the option type, a schedule date and a round. Its
//! canonical form is `productId|productVersion|variantId|schedule|round`; the
//! short hash produced by [`codec::hash`] is the key order creation uses to
//! look it up.

pub mod codec;
pub mod status;
pub mod types;

pub use codec::{CodecError, DEFAULT_HASH_LENGTH, PluHasher, Sha256Hasher, expand, hash};
pub use status::{Stage, SyncStatus, TransitionError};
pub use types::*;
