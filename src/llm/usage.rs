//! Token 用量、计价与汇总
//!
//! 计价表是注入的配置（按模型名，USD / 1M tokens）；未知模型计为 0 成本。

use std::collections::HashMap;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

/// 单次调用的 token 数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// 单价（USD / 1M tokens）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// 计价表
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    rates: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.rates.insert(model.into(), pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.rates.get(model)
    }

    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        match self.rates.get(model) {
            Some(rate) => {
                usage.input_tokens as f64 * rate.input / 1_000_000.0
                    + usage.output_tokens as f64 * rate.output / 1_000_000.0
            }
            None => {
                tracing::debug!(model, "no pricing configured, cost counted as 0");
                0.0
            }
        }
    }
}

impl FromIterator<(String, ModelPricing)> for PricingTable {
    fn from_iter<I: IntoIterator<Item = (String, ModelPricing)>>(iter: I) -> Self {
        Self {
            rates: iter.into_iter().collect(),
        }
    }
}

/// 一个阶段（可能含多次调用）的用量记录
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// 限流重试 + 解析重试次数
    pub retries: u32,
}

impl UsageRecord {
    pub fn new(usage: TokenUsage, cost: f64, retries: u32) -> Self {
        Self {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost,
            retries,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl AddAssign for UsageRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
        self.cost += rhs.cost;
        self.retries += rhs.retries;
    }
}

/// 一次运行（或一个批次条目）的用量汇总，含降级阶段计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub retries: u32,
    /// 以兜底结果收场的阶段数
    pub failures: u32,
}

impl UsageTotals {
    pub fn record(&mut self, usage: &UsageRecord) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
        self.total_tokens += usage.total_tokens();
        self.cost += usage.cost;
        self.retries += usage.retries;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn merge(&mut self, other: &UsageTotals) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cost += other.cost;
        self.retries += other.retries;
        self.failures += other.failures;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_per_million() {
        let table = PricingTable::new().with_model(
            "gpt-4.1-mini",
            ModelPricing {
                input: 0.150,
                output: 0.600,
            },
        );
        let cost = table.cost("gpt-4.1-mini", &TokenUsage::new(1_000_000, 500_000));
        assert!((cost - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_costs_nothing() {
        let table = PricingTable::new();
        assert_eq!(table.cost("mystery", &TokenUsage::new(100, 100)), 0.0);
    }

    #[test]
    fn test_totals_accumulate_records() {
        let mut totals = UsageTotals::default();
        let mut record = UsageRecord::new(TokenUsage::new(10, 5), 0.01, 1);
        record += UsageRecord::new(TokenUsage::new(3, 2), 0.02, 0);
        totals.record(&record);
        totals.record_failure();

        assert_eq!(totals.input_tokens, 13);
        assert_eq!(totals.output_tokens, 7);
        assert_eq!(totals.total_tokens, 20);
        assert_eq!(totals.retries, 1);
        assert_eq!(totals.failures, 1);
        assert!((totals.cost - 0.03).abs() < 1e-9);
    }
}
