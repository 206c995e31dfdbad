//! Plan catalog
//!
//! The catalog is a fixed set of plans keyed by slug. Prices are monthly, in major
//! currency units. A limit of `None` means unlimited.

use std::sync::Arc;

use dealflow_shared::PlanSlug;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, Plan, PlanSeed};

/// Length of a genuine trial
pub const TRIAL_DAYS: i64 = 14;

/// The plan set every deployment starts with
pub fn default_plans(currency: &str) -> Vec<PlanSeed> {
    PlanSlug::ALL
        .iter()
        .map(|slug| {
            let (name, price, users, contacts, pipelines) = match slug {
                PlanSlug::Lite => ("Lite", 0, Some(2), Some(500), Some(1)),
                PlanSlug::Team => ("Team", 1500, Some(10), Some(10_000), Some(5)),
                PlanSlug::Pro => ("Pro", 2500, None, None, None),
            };
            PlanSeed {
                slug: *slug,
                name: name.to_string(),
                price_per_month: price,
                currency: currency.to_string(),
                user_limit: users,
                contact_limit: contacts,
                pipeline_limit: pipelines,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct PlanCatalog {
    store: Arc<dyn BillingStore>,
    currency: String,
}

impl PlanCatalog {
    pub fn new(store: Arc<dyn BillingStore>, currency: impl Into<String>) -> Self {
        Self {
            store,
            currency: currency.into(),
        }
    }

    /// Insert any default plan whose slug is missing. Existing rows are left as they are.
    /// Returns the number of plans inserted.
    pub async fn ensure_default_plans(&self) -> BillingResult<usize> {
        let mut inserted = 0;
        for seed in default_plans(&self.currency) {
            if self.store.insert_plan_if_missing(&seed).await? {
                tracing::info!(slug = %seed.slug, price = seed.price_per_month, "Seeded plan");
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let plans = self.store.list_plans().await?;
        if plans.is_empty() {
            tracing::error!("Plan catalog is empty; was ensure_default_plans run?");
        }
        Ok(plans)
    }

    /// Look up a plan a caller asked for. Unknown ids are a caller mistake.
    pub async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| BillingError::Validation(format!("Unknown plan: {}", plan_id)))
    }

    /// Look up the plan a stored row points at. A dangling id is a data fault.
    pub(crate) async fn plan_of_record(&self, plan_id: Uuid) -> BillingResult<Plan> {
        self.store.get_plan(plan_id).await?.ok_or_else(|| {
            BillingError::Internal(format!("Subscription references missing plan {}", plan_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBillingStore;

    #[test]
    fn test_default_plans() {
        let plans = default_plans("RUB");
        assert_eq!(plans.len(), 3);

        let lite = &plans[0];
        assert_eq!(lite.slug, PlanSlug::Lite);
        assert_eq!(lite.price_per_month, 0);
        assert_eq!(lite.user_limit, Some(2));

        let pro = plans.iter().find(|p| p.slug == PlanSlug::Pro).unwrap();
        assert_eq!(pro.price_per_month, 2500);
        assert!(pro.contact_limit.is_none());
        assert!(plans.iter().all(|p| p.currency == "RUB"));
    }

    #[tokio::test]
    async fn test_ensure_default_plans_is_idempotent() {
        let store = Arc::new(MemoryBillingStore::new());
        let catalog = PlanCatalog::new(store.clone(), "RUB");

        assert_eq!(catalog.ensure_default_plans().await.unwrap(), 3);
        assert_eq!(catalog.ensure_default_plans().await.unwrap(), 0);

        let plans = catalog.list_plans().await.unwrap();
        assert_eq!(plans.len(), 3);
        assert!(plans.windows(2).all(|w| w[0].price_per_month <= w[1].price_per_month));
    }

    #[tokio::test]
    async fn test_unknown_plan_is_validation_error() {
        let store = Arc::new(MemoryBillingStore::new());
        let catalog = PlanCatalog::new(store, "RUB");
        let err = catalog.get_plan(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }
}
