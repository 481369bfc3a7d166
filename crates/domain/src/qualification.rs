use std::collections::BTreeMap;
use std::sync::Arc;

use crate::DomainResult;
use crate::gathering::{QualificationRule, UnitAggregate};
use crate::ports::units::UnitInventory;
use crate::strategy::WeightedUnit;
use crate::units::Unit;

/// Units eligible to vote in one gathering, keyed and ordered by unit id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QualifiedUnits {
    units: BTreeMap<i64, Unit>,
}

impl QualifiedUnits {
    pub fn from_units(units: impl IntoIterator<Item = Unit>) -> Self {
        Self {
            units: units.into_iter().map(|unit| (unit.unit_id, unit)).collect(),
        }
    }

    pub fn contains(&self, unit_id: i64) -> bool {
        self.units.contains_key(&unit_id)
    }

    pub fn get(&self, unit_id: i64) -> Option<&Unit> {
        self.units.get(&unit_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    pub fn weighted(&self) -> Vec<WeightedUnit> {
        self.units.values().map(Unit::weighted).collect()
    }

    pub fn aggregate(&self) -> UnitAggregate {
        let mut aggregate = UnitAggregate::default();
        for unit in self.units.values() {
            aggregate.add(unit.part, unit.area);
        }
        aggregate
    }
}

#[derive(Clone)]
pub struct QualificationResolver {
    inventory: Arc<dyn UnitInventory>,
}

impl QualificationResolver {
    pub fn new(inventory: Arc<dyn UnitInventory>) -> Self {
        Self { inventory }
    }

    pub fn inventory(&self) -> &Arc<dyn UnitInventory> {
        &self.inventory
    }

    pub async fn resolve(
        &self,
        association_id: i64,
        rule: &QualificationRule,
    ) -> DomainResult<QualifiedUnits> {
        let units = self.inventory.qualified_units(association_id, rule).await?;
        Ok(QualifiedUnits::from_units(
            units
                .into_iter()
                .filter(|unit| unit.association_id == association_id),
        ))
    }
}
