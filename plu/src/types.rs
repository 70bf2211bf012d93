use crate::status::SyncStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type ProductId = i64;
pub type VariantId = i64;

/// Short hash code -> canonical PLU string.
pub type PluHashMap = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductOptionTypeCode {
    Schedule,
    Round,
    List,
}

impl ProductOptionTypeCode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProductOptionTypeCode::Schedule => "SCHEDULE",
            ProductOptionTypeCode::Round => "ROUND",
            ProductOptionTypeCode::List => "LIST",
        }
    }
}

impl fmt::Display for ProductOptionTypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supplier category code, optionally narrowed to a sub category.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryFilter {
    pub category_code: String,
    #[serde(default)]
    pub sub_category_code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductImage {
    pub url: String,
    pub image_type_code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Facility {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub variant_id: VariantId,
    pub name: String,
    #[serde(default)]
    pub refundable: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub images: Vec<ProductImage>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionItem {
    pub item_id: i64,
    pub name: String,
    #[serde(default)]
    pub variants: Vec<Variant>,
    /// Departure dates, e.g. `2025-01-01`.
    #[serde(default)]
    pub schedules: Vec<String>,
    /// Time slots within a schedule, e.g. `09:00`.
    #[serde(default)]
    pub rounds: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductOption {
    pub option_id: i64,
    pub name: String,
    pub product_option_type_code: ProductOptionTypeCode,
    #[serde(default)]
    pub items: Vec<OptionItem>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionGroup {
    pub group_id: i64,
    pub name: String,
    #[serde(default)]
    pub options: Vec<ProductOption>,
}

/// Supplier-of-record catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub product_id: ProductId,
    pub product_version: i32,
    pub title: String,
    #[serde(default)]
    pub category_codes: Vec<CategoryFilter>,
    #[serde(default)]
    pub option_groups: Vec<OptionGroup>,
    #[serde(default)]
    pub facilities: Vec<Facility>,
    #[serde(default)]
    pub images: Vec<ProductImage>,
    #[serde(default)]
    pub status: SyncStatus,
}

impl Product {
    pub fn view_schedule_status(&self) -> bool {
        self.status.is_complete(crate::status::Stage::View)
    }

    pub fn image_schedule_status(&self) -> bool {
        self.status.is_complete(crate::status::Stage::Image)
    }

    pub fn content_schedule_status(&self) -> bool {
        self.status.is_complete(crate::status::Stage::Content)
    }

    /// Iterates every variant together with the option and item it belongs to.
    pub fn variants(&self) -> impl Iterator<Item = (&OptionGroup, &ProductOption, &OptionItem, &Variant)> {
        self.option_groups.iter().flat_map(|group| {
            group.options.iter().flat_map(move |option| {
                option.items.iter().flat_map(move |item| {
                    item.variants
                        .iter()
                        .map(move |variant| (group, option, item, variant))
                })
            })
        })
    }
}

/// One variant as it appears in the flattened view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewVariant {
    pub group_id: i64,
    pub option_id: i64,
    pub item_id: i64,
    pub variant_id: VariantId,
    pub name: String,
    pub product_option_type_code: ProductOptionTypeCode,
    pub refundable: bool,
    pub approved: bool,
}

/// Codes produced for one (option, option type) pair of a product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluDetail {
    pub option_id: i64,
    pub product_option_type_code: ProductOptionTypeCode,
    /// Canonical PLU strings in emission order.
    pub plus: Vec<String>,
    pub plu_hash: PluHashMap,
}

/// Denormalized projection of a product. Disposable; rebuilt from the product.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductView {
    pub product_id: ProductId,
    pub product_version: i32,
    pub title: String,
    pub variants: Vec<ViewVariant>,
    pub plu_details: Vec<PluDetail>,
}

impl ProductView {
    /// Union of every detail's hash map.
    pub fn plu_hashes(&self) -> PluHashMap {
        self.plu_details
            .iter()
            .flat_map(|detail| detail.plu_hash.iter())
            .map(|(hash, plu)| (hash.clone(), plu.clone()))
            .collect()
    }
}

pub const PLU_DELIMITER: char = '|';

/// Parsed form of `productId|productVersion|variantId|schedule|round`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanonicalPlu {
    pub product_id: ProductId,
    pub product_version: i32,
    pub variant_id: VariantId,
    pub schedule: String,
    pub round: String,
}

impl CanonicalPlu {
    pub fn new(
        product_id: ProductId,
        product_version: i32,
        variant_id: VariantId,
        schedule: Option<&str>,
        round: Option<&str>,
    ) -> Result<Self, PluParseError> {
        let schedule = schedule.unwrap_or_default();
        let round = round.unwrap_or_default();
        for segment in [schedule, round] {
            if segment.contains(PLU_DELIMITER) {
                return Err(PluParseError::DelimiterInSegment(segment.to_string()));
            }
        }
        Ok(CanonicalPlu {
            product_id,
            product_version,
            variant_id,
            schedule: schedule.to_string(),
            round: round.to_string(),
        })
    }
}

impl fmt::Display for CanonicalPlu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}|{}",
            self.product_id, self.product_version, self.variant_id, self.schedule, self.round
        )
    }
}

impl FromStr for CanonicalPlu {
    type Err = PluParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(PLU_DELIMITER).collect();
        let &[product_id, product_version, variant_id, schedule, round] = parts.as_slice() else {
            return Err(PluParseError::SegmentCount(parts.len()));
        };

        let number = |field: &'static str, value: &str| {
            value.parse::<i64>().map_err(|_| PluParseError::InvalidNumber {
                field,
                value: value.to_string(),
            })
        };

        let product_version = i32::try_from(number("product_version", product_version)?)
            .map_err(|_| PluParseError::InvalidNumber {
                field: "product_version",
                value: product_version.to_string(),
            })?;

        Ok(CanonicalPlu {
            product_id: number("product_id", product_id)?,
            product_version,
            variant_id: number("variant_id", variant_id)?,
            schedule: schedule.to_string(),
            round: round.to_string(),
        })
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum PluParseError {
    #[error("expected 5 segments, found {0}")]
    SegmentCount(usize),
    #[error("invalid {field}: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("segment {0:?} contains the PLU delimiter")]
    DelimiterInSegment(String),
}
