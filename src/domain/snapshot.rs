//! Quote snapshots: frozen copies of a priced configuration.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::entities::{BreakdownLine, Configuration, ConfigurationSnapshot, Selection};
use crate::domain::error::{DomainError, DomainResult};

/// The content covered by the checksum, in a fixed field order.
#[derive(Serialize)]
struct Sealed<'a> {
    configuration_id: &'a Uuid,
    manufacturing_type_id: &'a Uuid,
    quote_ref: &'a Option<String>,
    selections: &'a [Selection],
    price_breakdown: &'a [BreakdownLine],
    weight_breakdown: &'a [BreakdownLine],
    technical_snapshot: &'a BTreeMap<String, f64>,
    total_price: f64,
    calculated_weight: f64,
    created_at: &'a DateTime<Utc>,
}

impl ConfigurationSnapshot {
    /// Deep-copy the priced state of `config`.
    pub fn capture(config: &Configuration, quote_ref: Option<String>) -> DomainResult<Self> {
        let mut snapshot = Self {
            id: Uuid::new_v4(),
            configuration_id: config.id,
            manufacturing_type_id: config.manufacturing_type_id,
            quote_ref,
            selections: config.selections.clone(),
            price_breakdown: config.price_breakdown.clone(),
            weight_breakdown: config.weight_breakdown.clone(),
            technical_snapshot: config.calculated_technical_data.clone(),
            total_price: config.total_price,
            calculated_weight: config.calculated_weight,
            created_at: Utc::now(),
            checksum: String::new(),
        };
        snapshot.checksum = snapshot.compute_checksum()?;
        Ok(snapshot)
    }

    /// True if the content still matches the checksum taken at capture.
    pub fn verify(&self) -> bool {
        self.compute_checksum().map(|c| c == self.checksum).unwrap_or(false)
    }

    fn compute_checksum(&self) -> DomainResult<String> {
        let sealed = Sealed {
            configuration_id: &self.configuration_id,
            manufacturing_type_id: &self.manufacturing_type_id,
            quote_ref: &self.quote_ref,
            selections: &self.selections,
            price_breakdown: &self.price_breakdown,
            weight_breakdown: &self.weight_breakdown,
            technical_snapshot: &self.technical_snapshot,
            total_price: self.total_price,
            calculated_weight: self.calculated_weight,
            created_at: &self.created_at,
        };
        let bytes = serde_json::to_vec(&sealed).map_err(|e| DomainError::InvalidValue {
            field: "snapshot".into(),
            message: e.to_string(),
        })?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{BreakdownKind, ManufacturingType};

    fn priced() -> Configuration {
        let mt = ManufacturingType::new("Window", 200.0, 12.0);
        let mut config = Configuration::new(&mt);
        config.total_price = 275.0;
        config.price_breakdown = vec![BreakdownLine {
            node_id: None,
            path: "base".into(),
            kind: BreakdownKind::Base,
            delta: 200.0,
        }];
        config
    }

    #[test]
    fn given_configuration_when_capturing_then_copies_totals_and_verifies() {
        let config = priced();

        let snapshot = ConfigurationSnapshot::capture(&config, Some("Q-1001".into())).unwrap();

        assert_eq!(snapshot.total_price, 275.0);
        assert_eq!(snapshot.configuration_id, config.id);
        assert_eq!(snapshot.checksum.len(), 64);
        assert!(snapshot.verify());
    }

    #[test]
    fn given_tampered_snapshot_when_verifying_then_fails() {
        let mut snapshot = ConfigurationSnapshot::capture(&priced(), None).unwrap();

        snapshot.total_price = 1.0;

        assert!(!snapshot.verify());
    }

    #[test]
    fn given_later_config_change_when_inspecting_snapshot_then_unchanged() {
        let mut config = priced();
        let snapshot = ConfigurationSnapshot::capture(&config, None).unwrap();

        config.total_price = 999.0;
        config.price_breakdown.clear();

        assert_eq!(snapshot.total_price, 275.0);
        assert_eq!(snapshot.price_breakdown.len(), 1);
    }
}
