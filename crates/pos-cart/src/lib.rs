use serde::{Deserialize, Serialize};

use pos_catalog::{ProductPage, ProductRecord, TransactionDraft, TransactionItem};

pub use accumulator::{BatchOutcome, SessionAccumulator};

mod accumulator;

/// One priced, quantified row of a cart.
///
/// Rows are keyed by product id, or `productId|variantName` when a variant
/// applies, so the same product in two variants stays two rows. `subtotal`
/// is never stored independently of quantity: every mutation goes through
/// a method that recomputes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: i64,
    pub stock: u32,
    pub variant_name: Option<String>,
    pub quantity: u32,
    pub subtotal: i64,
}

impl LineItem {
    /// Builds a line item from a catalog record. When the product has
    /// variants the first one is taken as representative: visual detection
    /// cannot tell variants apart, so index 0 stands in for all of them.
    pub fn from_product(record: &ProductRecord, quantity: u32) -> Self {
        match record.variants.first() {
            Some(variant) => Self {
                product_id: record.id.clone(),
                name: format!("{} - {}", record.name, variant.name),
                unit_price: variant.price,
                stock: variant.stock,
                variant_name: Some(variant.name.clone()),
                quantity,
                subtotal: variant.price * i64::from(quantity),
            },
            None => Self {
                product_id: record.id.clone(),
                name: record.name.clone(),
                unit_price: record.price,
                stock: record.stock,
                variant_name: None,
                quantity,
                subtotal: record.price * i64::from(quantity),
            },
        }
    }

    pub fn key(&self) -> String {
        match &self.variant_name {
            Some(variant) => format!("{}|{}", self.product_id, variant),
            None => self.product_id.clone(),
        }
    }

    fn recompute_subtotal(&mut self) {
        self.subtotal = self.unit_price * i64::from(self.quantity);
    }

    /// Manual edit: quantity is clamped to `1..=stock`. Detection-derived
    /// quantities never pass through here and are not stock-clamped.
    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity.clamp(1, self.stock.max(1));
        self.recompute_subtotal();
    }

    /// Increment affordance; will not exceed available stock.
    pub fn increase(&mut self) {
        self.quantity = (self.quantity + 1).min(self.stock);
        self.recompute_subtotal();
    }

    /// Decrement affordance; floored at one.
    pub fn decrease(&mut self) {
        self.quantity = self.quantity.saturating_sub(1).max(1);
        self.recompute_subtotal();
    }
}

/// Merges one finished session's line items into the accumulated cart:
/// matching keys sum quantity and subtotal, new keys append. Commutative
/// and associative over repeated sessions.
pub fn merge_session(cart: &mut Vec<LineItem>, session: &[LineItem]) {
    for item in session {
        match cart.iter_mut().find(|existing| existing.key() == item.key()) {
            Some(existing) => {
                existing.quantity += item.quantity;
                existing.subtotal += item.subtotal;
            }
            None => cart.push(item.clone()),
        }
    }
}

pub fn remove_item(cart: &mut Vec<LineItem>, key: &str) {
    cart.retain(|item| item.key() != key);
}

pub fn cart_total(cart: &[LineItem]) -> i64 {
    cart.iter().map(|item| item.subtotal).sum()
}

/// Maps a cart into the transaction service's draft shape.
pub fn draft_from_cart(cart: &[LineItem]) -> TransactionDraft {
    TransactionDraft {
        data: cart
            .iter()
            .map(|item| TransactionItem {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
                variant_name: item.variant_name.clone(),
            })
            .collect(),
    }
}

/// A selectable product row for the manual entry surface, one per variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductOption {
    pub key: String,
    pub label: String,
    pub unit_price: i64,
    pub stock: u32,
    pub product_id: String,
    pub variant_name: Option<String>,
}

/// Flattens a catalog page into selectable options: products with variants
/// contribute one option per variant, labelled with the remaining stock.
pub fn product_options(page: &ProductPage) -> Vec<ProductOption> {
    page.data
        .iter()
        .flat_map(|product| {
            if product.variants.is_empty() {
                vec![ProductOption {
                    key: product.id.clone(),
                    label: format!("{} (stock: {})", product.name, product.stock),
                    unit_price: product.price,
                    stock: product.stock,
                    product_id: product.id.clone(),
                    variant_name: None,
                }]
            } else {
                product
                    .variants
                    .iter()
                    .map(|variant| ProductOption {
                        key: format!("{}|{}", product.id, variant.name),
                        label: format!(
                            "{} - {} (stock: {})",
                            product.name, variant.name, variant.stock
                        ),
                        unit_price: variant.price,
                        stock: variant.stock,
                        product_id: product.id.clone(),
                        variant_name: Some(variant.name.clone()),
                    })
                    .collect()
            }
        })
        .collect()
}
