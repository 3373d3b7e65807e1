use std::sync::Arc;

use vellum::{
    Versioned,
    versioned::{VersionedValue, upgrade_into},
};

#[derive(Debug, Versioned)]
#[versioned(name = "order-placed", version = 1, upgrade = OrderPlacedV2)]
pub struct OrderPlacedV1 {
    pub total: u32,
}

#[derive(Debug, Versioned)]
#[versioned(name = "order-placed", version = 2, upgrade = OrderPlaced)]
pub struct OrderPlacedV2 {
    pub total: u64,
}

#[derive(Debug, Versioned)]
#[versioned(name = "order-placed", version = 3)]
pub struct OrderPlaced {
    pub total: u64,
    pub currency: String,
}

impl From<&OrderPlacedV1> for OrderPlacedV2 {
    fn from(old: &OrderPlacedV1) -> Self {
        Self {
            total: u64::from(old.total),
        }
    }
}

impl From<&OrderPlacedV2> for OrderPlaced {
    fn from(old: &OrderPlacedV2) -> Self {
        Self {
            total: old.total,
            currency: "EUR".to_string(),
        }
    }
}

fn main() {
    let stored: Arc<dyn VersionedValue> = Arc::new(OrderPlacedV1 { total: 12 });
    let latest = upgrade_into::<OrderPlaced>(stored).unwrap();
    assert_eq!(latest.total, 12);
    assert_eq!(latest.currency, "EUR");
}
