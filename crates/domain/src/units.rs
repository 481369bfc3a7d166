use serde::{Deserialize, Serialize};

use crate::strategy::WeightedUnit;

/// A physical unit as kept by the association's inventory.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Unit {
    pub unit_id: i64,
    pub association_id: i64,
    pub building_id: i64,
    pub cadastral_number: String,
    pub unit_number: String,
    pub address: String,
    pub entrance: i64,
    pub floor: i64,
    pub unit_type: String,
    pub area: f64,
    /// Ownership share used as voting weight.
    pub part: f64,
    pub room_count: i64,
}

impl Unit {
    pub fn weighted(&self) -> WeightedUnit {
        WeightedUnit {
            unit_id: self.unit_id,
            part: self.part,
            area: self.area,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Owner {
    pub owner_id: i64,
    pub association_id: i64,
    pub name: String,
    pub identification_number: String,
}

/// An active ownership link.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerUnit {
    pub owner: Owner,
    pub unit_id: i64,
}
