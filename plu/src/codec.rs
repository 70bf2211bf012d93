//! Expansion of a product's sellable option space into canonical PLU strings
//! and the short codes used as their cache keys.

use crate::types::{
    CanonicalPlu, OptionItem, PluDetail, PluHashMap, PluParseError, Product, ProductOption,
    ProductOptionTypeCode, Variant,
};
use indexmap::IndexSet;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Crockford base32: digits and upper case letters without I, L, O, U.
pub const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// 256 digest bits, 5 bits per character.
pub const MAX_HASH_LENGTH: usize = 51;

pub const DEFAULT_HASH_LENGTH: usize = 12;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum CodecError {
    #[error("hash length must be between 1 and {MAX_HASH_LENGTH}, got {0}")]
    InvalidHashLength(usize),

    #[error("hash {hash} maps to both {first:?} and {second:?}")]
    HashCollision {
        hash: String,
        first: String,
        second: String,
    },

    #[error("malformed PLU for option {option_id}: {source}")]
    MalformedPlu {
        option_id: i64,
        #[source]
        source: PluParseError,
    },
}

/// Maps a canonical PLU string to a fixed-length code. Implementations must
/// be deterministic.
pub trait PluHasher: Send + Sync {
    fn hash(&self, canonical: &str, length: usize) -> Result<String, CodecError>;
}

/// SHA-256 digest encoded as Crockford base32.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hasher;

impl PluHasher for Sha256Hasher {
    fn hash(&self, canonical: &str, length: usize) -> Result<String, CodecError> {
        hash(canonical, length)
    }
}

pub fn hash(canonical: &str, length: usize) -> Result<String, CodecError> {
    if length == 0 || length > MAX_HASH_LENGTH {
        return Err(CodecError::InvalidHashLength(length));
    }

    let digest = Sha256::digest(canonical.as_bytes());
    let mut code = String::with_capacity(length);

    // Read the digest as a bit stream, most significant bit first.
    let mut buffer: u16 = 0;
    let mut bits = 0;
    for byte in digest.iter() {
        buffer = (buffer << 8) | u16::from(*byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let index = usize::from((buffer >> bits) & 0x1f);
            code.push(char::from(ALPHABET[index]));
            if code.len() == length {
                return Ok(code);
            }
        }
        buffer &= (1 << bits) - 1;
    }

    Ok(code)
}

/// Builds the canonical strings for one option item, in emission order.
fn item_plus(
    product: &Product,
    option: &ProductOption,
    item: &OptionItem,
    variant: &Variant,
) -> Result<Vec<CanonicalPlu>, PluParseError> {
    let plu = |schedule: Option<&str>, round: Option<&str>| {
        CanonicalPlu::new(
            product.product_id,
            product.product_version,
            variant.variant_id,
            schedule,
            round,
        )
    };

    match option.product_option_type_code {
        ProductOptionTypeCode::Round => {
            let mut plus = Vec::with_capacity(item.schedules.len() * item.rounds.len());
            for schedule in &item.schedules {
                for round in &item.rounds {
                    plus.push(plu(Some(schedule.as_str()), Some(round.as_str()))?);
                }
            }
            Ok(plus)
        }
        ProductOptionTypeCode::Schedule => item
            .schedules
            .iter()
            .map(|schedule| plu(Some(schedule.as_str()), None))
            .collect(),
        ProductOptionTypeCode::List => Ok(vec![plu(None, None)?]),
    }
}

/// Expands every option of `product` into PLU details.
///
/// Canonical strings are deduplicated across the whole product: a PLU already
/// produced by an earlier option is not repeated by a later one. Options that
/// produce no new PLU are omitted. Two different strings hashing to the same
/// code abort the expansion with [`CodecError::HashCollision`].
pub fn expand(
    product: &Product,
    hasher: &dyn PluHasher,
    length: usize,
) -> Result<Vec<PluDetail>, CodecError> {
    let mut seen: IndexSet<String> = IndexSet::new();
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut details: Vec<PluDetail> = Vec::new();

    for group in &product.option_groups {
        for option in &group.options {
            let mut plus = Vec::new();
            let mut plu_hash = PluHashMap::new();

            for item in &option.items {
                for variant in &item.variants {
                    let canonicals = item_plus(product, option, item, variant).map_err(
                        |source| CodecError::MalformedPlu {
                            option_id: option.option_id,
                            source,
                        },
                    )?;

                    for canonical in canonicals {
                        let canonical = canonical.to_string();
                        if !seen.insert(canonical.clone()) {
                            continue;
                        }

                        let code = hasher.hash(&canonical, length)?;
                        if let Some(first) = owners.get(&code) {
                            return Err(CodecError::HashCollision {
                                hash: code,
                                first: first.clone(),
                                second: canonical,
                            });
                        }
                        owners.insert(code.clone(), canonical.clone());
                        plu_hash.insert(code, canonical.clone());
                        plus.push(canonical);
                    }
                }
            }

            if !plus.is_empty() {
                details.push(PluDetail {
                    option_id: option.option_id,
                    product_option_type_code: option.product_option_type_code,
                    plus,
                    plu_hash,
                });
            }
        }
    }

    Ok(details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SyncStatus;
    use crate::types::{OptionGroup, ProductOption};

    fn variant(variant_id: i64) -> Variant {
        Variant {
            variant_id,
            name: format!("variant {variant_id}"),
            refundable: false,
            approved: false,
            images: vec![],
        }
    }

    fn product_with_options(
        product_id: i64,
        product_version: i32,
        options: Vec<ProductOption>,
    ) -> Product {
        Product {
            product_id,
            product_version,
            title: "test product".into(),
            category_codes: vec![],
            option_groups: vec![OptionGroup {
                group_id: 1,
                name: "group".into(),
                options,
            }],
            facilities: vec![],
            images: vec![],
            status: SyncStatus::Pending,
        }
    }

    fn option(
        option_id: i64,
        code: ProductOptionTypeCode,
        schedules: &[&str],
        rounds: &[&str],
        variants: &[i64],
    ) -> ProductOption {
        ProductOption {
            option_id,
            name: format!("option {option_id}"),
            product_option_type_code: code,
            items: vec![OptionItem {
                item_id: option_id * 10,
                name: "item".into(),
                variants: variants.iter().copied().map(variant).collect(),
                schedules: schedules.iter().map(|s| s.to_string()).collect(),
                rounds: rounds.iter().map(|s| s.to_string()).collect(),
            }],
        }
    }

    /// Hashes every string to the same code.
    struct ConstantHasher;

    impl PluHasher for ConstantHasher {
        fn hash(&self, _canonical: &str, length: usize) -> Result<String, CodecError> {
            Ok("X".repeat(length))
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let first = hash("42|3|7||", 12).unwrap();
        assert_eq!(first, hash("42|3|7||", 12).unwrap());
        assert_eq!(first.len(), 12);
        assert!(first.bytes().all(|b| ALPHABET.contains(&b)));

        // Truncation keeps a common prefix
        let long = hash("42|3|7||", MAX_HASH_LENGTH).unwrap();
        assert_eq!(long.len(), MAX_HASH_LENGTH);
        assert!(long.starts_with(&first));

        assert_ne!(first, hash("42|3|8||", 12).unwrap());
    }

    #[test]
    fn test_hash_known_value() {
        // sha256("") starts with e3 b0 c4 42: 11100 01110 11000 01100 0100 ...
        assert_eq!(hash("", 4).unwrap(), "WERC");
    }

    #[test]
    fn test_hash_length_bounds() {
        assert_eq!(hash("a", 0), Err(CodecError::InvalidHashLength(0)));
        assert_eq!(
            hash("a", MAX_HASH_LENGTH + 1),
            Err(CodecError::InvalidHashLength(MAX_HASH_LENGTH + 1))
        );
        assert!(hash("a", 1).is_ok());
    }

    #[test]
    fn test_expand_list() {
        let product =
            product_with_options(42, 3, vec![option(1, ProductOptionTypeCode::List, &[], &[], &[7])]);
        let details = expand(&product, &Sha256Hasher, DEFAULT_HASH_LENGTH).unwrap();

        assert_eq!(details.len(), 1);
        assert_eq!(details[0].product_option_type_code, ProductOptionTypeCode::List);
        assert_eq!(details[0].plus, vec!["42|3|7||".to_string()]);
        assert_eq!(details[0].plu_hash.len(), 1);
        let (code, plu) = details[0].plu_hash.iter().next().unwrap();
        assert_eq!(plu, "42|3|7||");
        assert_eq!(code, &hash("42|3|7||", DEFAULT_HASH_LENGTH).unwrap());
    }

    #[test]
    fn test_expand_round() {
        let product = product_with_options(
            42,
            5,
            vec![option(
                1,
                ProductOptionTypeCode::Round,
                &["2025-01-01"],
                &["09:00", "13:00"],
                &[9],
            )],
        );
        let details = expand(&product, &Sha256Hasher, DEFAULT_HASH_LENGTH).unwrap();

        assert_eq!(details.len(), 1);
        assert_eq!(
            details[0].plus,
            vec![
                "42|5|9|2025-01-01|09:00".to_string(),
                "42|5|9|2025-01-01|13:00".to_string(),
            ]
        );
        assert_eq!(details[0].plu_hash.len(), 2);
    }

    #[test]
    fn test_expand_schedule() {
        let product = product_with_options(
            1,
            1,
            vec![option(
                4,
                ProductOptionTypeCode::Schedule,
                &["2025-01-01", "2025-01-02"],
                &["09:00"],
                &[1, 2],
            )],
        );
        let details = expand(&product, &Sha256Hasher, DEFAULT_HASH_LENGTH).unwrap();

        assert_eq!(
            details[0].plus,
            vec![
                "1|1|1|2025-01-01|".to_string(),
                "1|1|1|2025-01-02|".to_string(),
                "1|1|2|2025-01-01|".to_string(),
                "1|1|2|2025-01-02|".to_string(),
            ]
        );
    }

    #[test]
    fn test_expand_deduplicates_across_options() {
        let product = product_with_options(
            1,
            1,
            vec![
                option(1, ProductOptionTypeCode::List, &[], &[], &[7]),
                option(2, ProductOptionTypeCode::List, &[], &[], &[7, 8]),
                option(3, ProductOptionTypeCode::List, &[], &[], &[8]),
            ],
        );
        let details = expand(&product, &Sha256Hasher, DEFAULT_HASH_LENGTH).unwrap();

        // Option 3 has nothing new and is omitted
        assert_eq!(details.len(), 2);
        assert_eq!(details[0].plus, vec!["1|1|7||".to_string()]);
        assert_eq!(details[1].plus, vec!["1|1|8||".to_string()]);

        let all: Vec<&String> = details.iter().flat_map(|d| d.plus.iter()).collect();
        let unique: IndexSet<&String> = all.iter().copied().collect();
        assert_eq!(all.len(), unique.len());
    }

    #[test]
    fn test_expand_empty_schedules() {
        let product = product_with_options(
            1,
            1,
            vec![option(1, ProductOptionTypeCode::Round, &["2025-01-01"], &[], &[7])],
        );
        assert!(expand(&product, &Sha256Hasher, 8).unwrap().is_empty());
    }

    #[test]
    fn test_expand_round_trip() {
        let product = product_with_options(
            77,
            2,
            vec![
                option(
                    1,
                    ProductOptionTypeCode::Round,
                    &["2025-01-01", "2025-01-02"],
                    &["09:00", "13:00"],
                    &[1, 2, 3],
                ),
                option(2, ProductOptionTypeCode::Schedule, &["2025-02-01"], &[], &[4]),
                option(3, ProductOptionTypeCode::List, &[], &[], &[5]),
            ],
        );
        let details = expand(&product, &Sha256Hasher, DEFAULT_HASH_LENGTH).unwrap();
        assert_eq!(details.len(), 3);

        for detail in &details {
            assert_eq!(detail.plus.len(), detail.plu_hash.len());
            for (code, plu) in &detail.plu_hash {
                assert_eq!(&hash(plu, DEFAULT_HASH_LENGTH).unwrap(), code);
                let parsed: CanonicalPlu = plu.parse().unwrap();
                assert_eq!(parsed.product_id, 77);
                assert_eq!(&parsed.to_string(), plu);
            }
        }
    }

    #[test]
    fn test_expand_rejects_collision() {
        let product = product_with_options(
            1,
            1,
            vec![option(1, ProductOptionTypeCode::List, &[], &[], &[7, 8])],
        );
        let err = expand(&product, &ConstantHasher, 4).unwrap_err();
        assert_eq!(
            err,
            CodecError::HashCollision {
                hash: "XXXX".into(),
                first: "1|1|7||".into(),
                second: "1|1|8||".into(),
            }
        );
    }

    #[test]
    fn test_expand_rejects_malformed_segment() {
        let product = product_with_options(
            1,
            1,
            vec![option(9, ProductOptionTypeCode::Schedule, &["2025|01"], &[], &[7])],
        );
        assert!(matches!(
            expand(&product, &Sha256Hasher, 8),
            Err(CodecError::MalformedPlu { option_id: 9, .. })
        ));
    }
}
