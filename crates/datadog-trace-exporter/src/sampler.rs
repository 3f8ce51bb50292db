// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Receiving end of the agent's sampling feedback.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

/// Rate table sent back by the agent, keyed by `service:<name>,env:<env>`.
pub type RateByService = HashMap<String, f64>;

/// Key the agent uses for its default rate.
pub const DEFAULT_RATE_KEY: &str = "service:,env:";

/// Consumer of the `rate_by_service` table returned with every successful flush.
pub trait RateByServiceSink: Send + Sync {
    /// Replaces the whole table. Entries missing from `rates` are forgotten.
    fn update(&self, rates: RateByService);
}

/// Rate table holder used by the priority sampler. Lookups come from the hot path, updates only
/// from the agent client.
#[derive(Debug, Default)]
pub struct PrioritySampler {
    rates: RwLock<RateByService>,
}

impl PrioritySampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current table.
    pub fn rates(&self) -> RateByService {
        self.rates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rate for a service and env, falling back to the agent default and then to keeping
    /// everything.
    pub fn rate_for(&self, service: &str, env: &str) -> f64 {
        let rates = self.rates.read().unwrap_or_else(PoisonError::into_inner);
        rates
            .get(&format!("service:{service},env:{env}"))
            .or_else(|| rates.get(DEFAULT_RATE_KEY))
            .copied()
            .unwrap_or(1.0)
    }
}

impl RateByServiceSink for PrioritySampler {
    fn update(&self, rates: RateByService) {
        debug!("Updating sampling rates for {} services", rates.len());
        *self.rates.write().unwrap_or_else(PoisonError::into_inner) = rates;
    }
}
