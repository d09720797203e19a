use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};

/// Unit-price configuration consumed once per computation.
///
/// When `custom_prices_enabled` is set, these values replace every
/// metric-derived node price; otherwise they are only the fallback for
/// missing or non-finite prices.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomPricing {
    pub cpu: f64,
    pub spot_cpu: f64,
    pub ram: f64,
    pub spot_ram: f64,
    pub gpu: f64,
    pub spot_gpu: f64,
    /// Storage, per GiB-hour.
    pub storage: f64,
    /// Flat discount fraction applied fleet-wide.
    pub discount: f64,
    /// Additional negotiated discount fraction.
    pub negotiated_discount: f64,
    pub custom_prices_enabled: bool,
    /// Egress unit prices per GiB, used when the backend reports none.
    pub zone_network_egress: f64,
    pub region_network_egress: f64,
    pub internet_network_egress: f64,
    /// Flat per-cluster management fee, per hour.
    pub cluster_management: f64,
}

impl Default for CustomPricing {
    fn default() -> Self {
        CustomPricing {
            cpu: 0.031611,
            spot_cpu: 0.006655,
            ram: 0.004237,
            spot_ram: 0.000892,
            gpu: 0.95,
            spot_gpu: 0.308,
            storage: 0.00005479452,
            discount: 0.0,
            negotiated_discount: 0.0,
            custom_prices_enabled: false,
            zone_network_egress: 0.01,
            region_network_egress: 0.01,
            internet_network_egress: 0.12,
            cluster_management: 0.0,
        }
    }
}

impl CustomPricing {
    pub fn cpu_price(&self, spot: bool) -> f64 {
        if spot {
            self.spot_cpu
        } else {
            self.cpu
        }
    }

    pub fn ram_price(&self, spot: bool) -> f64 {
        if spot {
            self.spot_ram
        } else {
            self.ram
        }
    }

    pub fn gpu_price(&self, spot: bool) -> f64 {
        if spot {
            self.spot_gpu
        } else {
            self.gpu
        }
    }
}

/// Seam to the pricing layer. Read-mostly; implementations must be safe
/// under concurrent reads from parallel computations.
pub trait PricingProvider: Send + Sync {
    fn config(&self) -> CustomPricing;

    /// Fold the flat and negotiated discounts with any provider rule for
    /// this instance type. Spot capacity is already discounted by its
    /// market price, so no further discount applies.
    fn combined_discount_for_node(&self, node_type: &str, spot: bool) -> f64 {
        let _ = node_type;
        if spot {
            return 0.0;
        }
        let config = self.config();
        combine_discounts(config.discount, config.negotiated_discount)
    }
}

/// Successive discounts compose multiplicatively, never past 100%.
pub fn combine_discounts(flat: f64, negotiated: f64) -> f64 {
    let d = 1.0 - (1.0 - flat.clamp(0.0, 1.0)) * (1.0 - negotiated.clamp(0.0, 1.0));
    d.clamp(0.0, 1.0)
}

/// In-memory provider backed by a shared, reloadable config.
pub struct ConfigPricing {
    config: Arc<RwLock<CustomPricing>>,
}

impl ConfigPricing {
    pub fn new(config: CustomPricing) -> Self {
        ConfigPricing {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn update(&self, config: CustomPricing) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}

impl PricingProvider for ConfigPricing {
    fn config(&self) -> CustomPricing {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discounts_compose_multiplicatively() {
        let d = combine_discounts(0.2, 0.1);
        assert!((d - 0.28).abs() < 1e-9);
        assert_eq!(combine_discounts(1.0, 0.5), 1.0);
        assert_eq!(combine_discounts(0.0, 0.0), 0.0);
    }

    #[test]
    fn spot_nodes_skip_the_discount() {
        let provider = ConfigPricing::new(CustomPricing {
            discount: 0.3,
            ..CustomPricing::default()
        });
        assert_eq!(provider.combined_discount_for_node("n2-standard-4", true), 0.0);
        assert!((provider.combined_discount_for_node("n2-standard-4", false) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn spot_prices_select_the_spot_variant() {
        let config = CustomPricing::default();
        assert_eq!(config.cpu_price(true), config.spot_cpu);
        assert_eq!(config.ram_price(false), config.ram);
    }

    #[test]
    fn update_is_visible_to_readers() {
        let provider = ConfigPricing::new(CustomPricing::default());
        provider.update(CustomPricing {
            cpu: 1.0,
            ..CustomPricing::default()
        });
        assert_eq!(provider.config().cpu, 1.0);
    }
}
