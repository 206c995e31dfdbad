//! PostgreSQL implementation of [`BillingStore`]

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, Company, Invoice, NewInvoice, NewSubscription, PendingInvoice, Plan, PlanSeed,
    Settlement, StaleSweep, SubscriptionRecord,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, NewBillingEvent};
use crate::numbering::format_invoice_number;
use crate::period::add_months;

/// Attempts at allocating a number before giving up on repeated unique violations
const INVOICE_NUMBER_ATTEMPTS: usize = 3;

const SUBSCRIPTION_COLUMNS: &str = r#"
    s.id, s.company_id, s.plan_id, s.status, s.billing_interval, s.current_period_end,
    s.trial_ends_at, s.external_subscription_id, s.cancel_at_period_end,
    (SELECT i.id FROM invoices i
      WHERE i.subscription_id = s.id AND i.status = 'PENDING'
      ORDER BY i.created_at DESC
      LIMIT 1) AS pending_invoice_id,
    s.created_at, s.updated_at
"#;

const INVOICE_COLUMNS: &str = r#"
    id, subscription_id, company_id, invoice_number, payment_period_months, amount,
    currency, status, external_id, paid_at, created_at, updated_at
"#;

const PLAN_COLUMNS: &str = r#"
    id, slug, name, price_per_month, currency, user_limit, contact_limit, pipeline_limit,
    created_at, updated_at
"#;

/// Billing store backed by PostgreSQL
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_create_pending_invoice(
        &self,
        new: &NewInvoice,
    ) -> Result<BillingResult<PendingInvoice>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // Row lock on the day's counter serialises concurrent allocations
        let (sequence,): (i32,) = sqlx::query_as(
            r#"
            INSERT INTO invoice_number_counters (issued_on, last_value)
            VALUES ($1, 1)
            ON CONFLICT (issued_on) DO UPDATE
                SET last_value = invoice_number_counters.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(new.issued_at.date())
        .fetch_one(&mut *tx)
        .await?;

        let invoice_number = match format_invoice_number(new.issued_at.date(), sequence as u32) {
            Ok(number) => number,
            Err(e) => return Ok(Err(e)),
        };

        let (subscription_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (company_id, plan_id, status, current_period_end)
            VALUES ($1, $2, 'TRIAL', $3)
            RETURNING id
            "#,
        )
        .bind(new.company_id)
        .bind(new.plan_id)
        .bind(new.period_end)
        .fetch_one(&mut *tx)
        .await?;

        let insert_invoice = format!(
            r#"
            INSERT INTO invoices
                (subscription_id, company_id, invoice_number, payment_period_months,
                 amount, currency, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'PENDING')
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice: Invoice = sqlx::query_as(&insert_invoice)
            .bind(subscription_id)
            .bind(new.company_id)
            .bind(&invoice_number)
            .bind(i32::from(new.payment_period))
            .bind(new.amount)
            .bind(&new.currency)
            .fetch_one(&mut *tx)
            .await?;

        let subscription = fetch_subscription(&mut *tx, subscription_id)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;

        tx.commit().await?;

        Ok(Ok(PendingInvoice {
            subscription,
            invoice,
        }))
    }
}

async fn fetch_subscription<'e, E>(
    executor: E,
    subscription_id: Uuid,
) -> Result<Option<SubscriptionRecord>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {} FROM subscriptions s WHERE s.id = $1",
        SUBSCRIPTION_COLUMNS
    );
    sqlx::query_as::<_, SubscriptionRecord>(&sql)
        .bind(subscription_id)
        .fetch_optional(executor)
        .await
}

/// Lock the PENDING invoices of a row waiting for payment. Returns false when the row
/// has invoices but none of them is PENDING any more (expired or failed meanwhile).
async fn lock_open_invoices(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    subscription_id: Uuid,
) -> BillingResult<bool> {
    let pending: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM invoices WHERE subscription_id = $1 AND status = 'PENDING' FOR UPDATE",
    )
    .bind(subscription_id)
    .fetch_all(&mut **tx)
    .await?;
    if !pending.is_empty() {
        return Ok(true);
    }

    let (linked,): (bool,) =
        sqlx::query_as("SELECT EXISTS (SELECT 1 FROM invoices WHERE subscription_id = $1)")
            .bind(subscription_id)
            .fetch_one(&mut **tx)
            .await?;
    Ok(!linked)
}

fn is_invoice_number_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().as_deref() == Some("23505")
                && db_err.constraint() == Some("invoices_invoice_number_key")
        }
        _ => false,
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_plan_if_missing(&self, seed: &PlanSeed) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO plans
                (slug, name, price_per_month, currency, user_limit, contact_limit, pipeline_limit)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (slug) DO NOTHING
            "#,
        )
        .bind(seed.slug)
        .bind(&seed.name)
        .bind(seed.price_per_month)
        .bind(&seed.currency)
        .bind(seed.user_limit)
        .bind(seed.contact_limit)
        .bind(seed.pipeline_limit)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let sql = format!(
            "SELECT {} FROM plans ORDER BY price_per_month ASC, slug ASC",
            PLAN_COLUMNS
        );
        Ok(sqlx::query_as(&sql).fetch_all(&self.pool).await?)
    }

    async fn get_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        let sql = format!("SELECT {} FROM plans WHERE id = $1", PLAN_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_company(&self, company_id: Uuid) -> BillingResult<Option<Company>> {
        Ok(
            sqlx::query_as("SELECT id, name, legal_form FROM companies WHERE id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn company_user_ids(&self, company_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE company_id = $1 ORDER BY created_at")
                .bind(company_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn list_subscriptions(
        &self,
        company_id: Uuid,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            "SELECT {} FROM subscriptions s WHERE s.company_id = $1 ORDER BY s.created_at DESC",
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn insert_subscription(&self, new: NewSubscription) -> BillingResult<SubscriptionRecord> {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (company_id, plan_id, status, current_period_end, trial_ends_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, company_id, plan_id, status, billing_interval, current_period_end,
                      trial_ends_at, external_subscription_id, cancel_at_period_end,
                      NULL::uuid AS pending_invoice_id, created_at, updated_at
            "#,
        )
        .bind(new.company_id)
        .bind(new.plan_id)
        .bind(new.status)
        .bind(new.current_period_end)
        .bind(new.trial_ends_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn switch_trial_plan(
        &self,
        subscription_id: Uuid,
        plan_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions s
            SET plan_id = $2, updated_at = NOW()
            WHERE s.id = $1
              AND s.status = 'TRIAL'
              AND s.trial_ends_at IS NOT NULL
              AND s.trial_ends_at > $3
              AND NOT EXISTS (
                  SELECT 1 FROM invoices i
                  WHERE i.subscription_id = s.id AND i.status = 'PENDING'
              )
            RETURNING s.id
            "#,
        )
        .bind(subscription_id)
        .bind(plan_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            return Ok(None);
        }

        let record = fetch_subscription(&mut *tx, subscription_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn expiring_subscriptions(
        &self,
        after: OffsetDateTime,
        until: OffsetDateTime,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions s
            WHERE s.status IN ('ACTIVE', 'TRIAL')
              AND s.current_period_end > $1
              AND s.current_period_end <= $2
            ORDER BY s.current_period_end ASC
            "#,
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(after)
            .bind(until)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn awaiting_provider(&self, company_id: Uuid) -> BillingResult<Vec<SubscriptionRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM subscriptions s
            WHERE s.company_id = $1
              AND s.status = 'TRIAL'
              AND s.external_subscription_id IS NOT NULL
            ORDER BY s.created_at ASC
            "#,
            SUBSCRIPTION_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn companies_awaiting_provider(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT company_id FROM subscriptions
            WHERE status = 'TRIAL' AND external_subscription_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn activate_awaiting(
        &self,
        subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut tx = self.pool.begin().await?;

        let waiting: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id FROM subscriptions
            WHERE id = $1 AND status = 'TRIAL' AND external_subscription_id IS NOT NULL
            FOR UPDATE
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        if waiting.is_none() || !lock_open_invoices(&mut tx, subscription_id).await? {
            return Ok(None);
        }

        let period_end = add_months(paid_at, months)?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'ACTIVE', current_period_end = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'PAID', paid_at = $2, updated_at = NOW()
            WHERE subscription_id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(subscription_id)
        .bind(paid_at)
        .execute(&mut *tx)
        .await?;

        let record = fetch_subscription(&mut *tx, subscription_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn merge_renewal(
        &self,
        pending_subscription_id: Uuid,
        active_subscription_id: Uuid,
        months: u32,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let mut tx = self.pool.begin().await?;

        let pending: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM subscriptions WHERE id = $1 AND status = 'TRIAL' FOR UPDATE",
        )
        .bind(pending_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        if pending.is_none() || !lock_open_invoices(&mut tx, pending_subscription_id).await? {
            return Ok(None);
        }

        let active: Option<(Option<OffsetDateTime>,)> = sqlx::query_as(
            "SELECT current_period_end FROM subscriptions WHERE id = $1 AND status = 'ACTIVE' FOR UPDATE",
        )
        .bind(active_subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((current_end,)) = active else {
            return Ok(None);
        };

        // Never lose unused paid time
        let anchor = current_end.map_or(paid_at, |end| end.max(paid_at));
        let new_period_end = add_months(anchor, months)?;

        sqlx::query(
            r#"
            UPDATE invoices
            SET subscription_id = $2,
                status = CASE WHEN status = 'PENDING' THEN 'PAID' ELSE status END,
                paid_at = CASE WHEN status = 'PENDING' THEN $3 ELSE paid_at END,
                updated_at = NOW()
            WHERE subscription_id = $1
            "#,
        )
        .bind(pending_subscription_id)
        .bind(active_subscription_id)
        .bind(paid_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(pending_subscription_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE subscriptions SET current_period_end = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(active_subscription_id)
        .bind(new_period_end)
        .execute(&mut *tx)
        .await?;

        let record = fetch_subscription(&mut *tx, active_subscription_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    async fn abandon_awaiting(&self, subscription_id: Uuid) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'CANCELED', updated_at = NOW()
            WHERE id = $1 AND status = 'TRIAL' AND external_subscription_id IS NOT NULL
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_pending_invoice(&self, new: NewInvoice) -> BillingResult<PendingInvoice> {
        for attempt in 1..=INVOICE_NUMBER_ATTEMPTS {
            match self.try_create_pending_invoice(&new).await {
                Ok(result) => return result,
                Err(e) if is_invoice_number_conflict(&e) => {
                    tracing::warn!(
                        company_id = %new.company_id,
                        attempt = attempt,
                        "Invoice number already taken, allocating the next one"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BillingError::Internal(format!(
            "Could not allocate a unique invoice number after {} attempts",
            INVOICE_NUMBER_ATTEMPTS
        )))
    }

    async fn attach_external_payment(
        &self,
        invoice_id: Uuid,
        payment_id: &str,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let subscription: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE invoices SET external_id = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING subscription_id
            "#,
        )
        .bind(invoice_id)
        .bind(payment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (subscription_id,) = subscription
            .ok_or_else(|| BillingError::NotFound(format!("Invoice {} not found", invoice_id)))?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET external_subscription_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .bind(payment_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let sql = format!("SELECT {} FROM invoices WHERE id = $1", INVOICE_COLUMNS);
        Ok(sqlx::query_as(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_invoice_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE external_id = $1",
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn pending_invoices_with_amount(&self, amount: i64) -> BillingResult<Vec<Invoice>> {
        let sql = format!(
            r#"
            SELECT {} FROM invoices
            WHERE status = 'PENDING' AND amount = $1
            ORDER BY created_at DESC
            "#,
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(amount)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn list_invoices(&self, company_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE company_id = $1 ORDER BY created_at DESC",
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn settle_invoice(
        &self,
        invoice_id: Uuid,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Option<Settlement>> {
        let mut tx = self.pool.begin().await?;

        // The status guard is the replay protection: a second delivery matches no row
        let sql = format!(
            r#"
            UPDATE invoices
            SET status = 'PAID', paid_at = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoice: Option<Invoice> = sqlx::query_as(&sql)
            .bind(invoice_id)
            .bind(paid_at)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(invoice) = invoice else {
            return Ok(None);
        };

        let period_end = add_months(paid_at, invoice.months())?;

        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'ACTIVE', current_period_end = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(invoice.subscription_id)
        .bind(period_end)
        .execute(&mut *tx)
        .await?;

        let subscription = fetch_subscription(&mut *tx, invoice.subscription_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "Subscription {} of invoice {} not found",
                    invoice.subscription_id, invoice.invoice_number
                ))
            })?;

        tx.commit().await?;

        Ok(Some(Settlement {
            invoice,
            subscription,
        }))
    }

    async fn fail_invoice(&self, invoice_id: Uuid) -> BillingResult<Option<Invoice>> {
        let sql = format!(
            r#"
            UPDATE invoices
            SET status = 'FAILED', updated_at = NOW()
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        Ok(sqlx::query_as(&sql)
            .bind(invoice_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fail_stale_invoices(&self, created_before: OffsetDateTime) -> BillingResult<StaleSweep> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE invoices
            SET status = 'FAILED', updated_at = NOW()
            WHERE status = 'PENDING' AND created_at < $1
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        );
        let invoices: Vec<Invoice> = sqlx::query_as(&sql)
            .bind(created_before)
            .fetch_all(&mut *tx)
            .await?;

        let subscription_ids: Vec<Uuid> = invoices.iter().map(|i| i.subscription_id).collect();

        // Genuine trials never carry invoices, so only pending-activation rows match
        let abandoned: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE subscriptions s
            SET status = 'CANCELED', updated_at = NOW()
            WHERE s.id = ANY($1)
              AND s.status = 'TRIAL'
              AND s.trial_ends_at IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM invoices i
                  WHERE i.subscription_id = s.id AND i.status = 'PENDING'
              )
            RETURNING s.id
            "#,
        )
        .bind(&subscription_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StaleSweep {
            invoices,
            abandoned_subscriptions: abandoned.into_iter().map(|(id,)| id).collect(),
        })
    }

    async fn record_event(&self, event: NewBillingEvent) -> BillingResult<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (company_id, event_type, event_data, actor_id, actor_type)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(event.company_id)
        .bind(event.event_type.to_string())
        .bind(&event.event_data)
        .bind(event.actor_id)
        .bind(event.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_events(&self, company_id: Uuid, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        Ok(sqlx::query_as(
            r#"
            SELECT id, company_id, event_type, event_data, actor_id, actor_type, created_at
            FROM billing_events
            WHERE company_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(company_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_ping() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = PgPool::connect(&url).await.expect("Failed to connect");
        PgBillingStore::new(pool).ping().await.expect("ping failed");
    }
}
