use crate::error::WorkflowError;

/// Basis points in 100%.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Commission applied to accepted bid prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionRate {
    bps: u32,
}

impl CommissionRate {
    pub fn from_bps(bps: u32) -> Result<Self, WorkflowError> {
        if bps > BPS_DENOMINATOR {
            return Err(WorkflowError::InvalidInput(format!(
                "commission rate {bps} bps exceeds {BPS_DENOMINATOR}"
            )));
        }
        Ok(Self { bps })
    }

    pub fn bps(self) -> u32 {
        self.bps
    }

    /// Split a price (minor units) into `(commission, amount)`.
    ///
    /// Commission rounds half up; `amount = price - commission`, so the two
    /// always sum back to the price.
    pub fn split(self, price_minor: i64) -> Result<(i64, i64), WorkflowError> {
        if price_minor <= 0 {
            return Err(WorkflowError::InvalidInput(format!(
                "price must be positive, got {price_minor}"
            )));
        }
        let scaled = i128::from(price_minor) * i128::from(self.bps);
        let denominator = i128::from(BPS_DENOMINATOR);
        let commission = (scaled + denominator / 2) / denominator;
        let commission = i64::try_from(commission).map_err(|_| {
            WorkflowError::InvalidInput(format!("commission overflow for price {price_minor}"))
        })?;
        Ok((commission, price_minor - commission))
    }
}

impl Default for CommissionRate {
    fn default() -> Self {
        // 10%
        Self { bps: 1_000 }
    }
}

/// Workflow tuning.
#[derive(Debug, Clone, Default)]
pub struct WorkflowConfig {
    pub commission: CommissionRate,
}

impl WorkflowConfig {
    pub fn with_commission_bps(bps: u32) -> Result<Self, WorkflowError> {
        Ok(Self {
            commission: CommissionRate::from_bps(bps)?,
        })
    }
}

/// Entity store backend selection.
#[derive(Debug, Clone, Default)]
pub enum StoreConfig {
    /// Process memory only; state is lost on restart.
    #[default]
    Memory,
    /// PostgreSQL via the `postgres` feature.
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::Memory
    }

    pub fn postgres(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            database_url: database_url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub workflow: WorkflowConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate_takes_ten_percent() {
        assert_eq!(CommissionRate::default().split(100).unwrap(), (10, 90));
    }

    #[test]
    fn commission_rounds_half_up() {
        let rate = CommissionRate::from_bps(250).unwrap();
        // 2.5% of 20 = 0.5 -> 1
        assert_eq!(rate.split(20).unwrap(), (1, 19));
        // 2.5% of 19 = 0.475 -> 0
        assert_eq!(rate.split(19).unwrap(), (0, 19));
    }

    #[test]
    fn rejects_rates_above_one_hundred_percent() {
        assert!(CommissionRate::from_bps(10_001).is_err());
        assert_eq!(CommissionRate::from_bps(10_000).unwrap().split(7).unwrap(), (7, 0));
    }

    #[test]
    fn large_prices_do_not_overflow() {
        let (commission, amount) = CommissionRate::default().split(i64::MAX).unwrap();
        assert_eq!(commission + amount, i64::MAX);
    }
}
