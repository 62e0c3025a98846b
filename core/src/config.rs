//! DQ configuration: per asset-class default policies, per risk-factor
//! overrides, and run-level knobs.

use crate::calendar::CalendarKind;
use crate::error::{DqError, DqResult};
use crate::reconciliation::{DiffMode, ReconBasis, ReconConfig};
use crate::rules::{FxTriangleConfig, MissingDaysConfig, RuleSpec, SpikeConfig, StaleConfig};
use crate::series::ChangeMeasure;
use crate::store::RiskFactorRecord;
use crate::types::{AssetClass, RiskFactorId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoResolvePolicy {
    #[serde(default = "default_true")]
    pub enabled:      bool,
    /// Consecutive quiet runs before an exception auto-resolves.
    #[serde(default = "default_quiet_runs")]
    pub quiet_runs:   u32,
    /// Rule codes that always wait for an analyst.
    #[serde(default)]
    pub exempt_rules: BTreeSet<String>,
}

fn default_true() -> bool { true }
fn default_quiet_runs() -> u32 { 3 }

impl Default for AutoResolvePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            quiet_runs: default_quiet_runs(),
            exempt_rules: BTreeSet::new(),
        }
    }
}

impl AutoResolvePolicy {
    pub fn allows(&self, rule_code: &str) -> bool {
        self.enabled && self.quiet_runs > 0 && !self.exempt_rules.contains(rule_code)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RiskFactorPolicy {
    /// Reconciliation reference order. The first source with data is also
    /// the primary series the rules read.
    #[serde(default)]
    pub source_priority: Vec<String>,
    #[serde(default)]
    pub rules:           Vec<RuleSpec>,
    #[serde(default)]
    pub reconciliation:  Option<ReconConfig>,
    #[serde(default)]
    pub auto_resolve:    AutoResolvePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFactorConfig {
    pub id:          RiskFactorId,
    pub asset_class: AssetClass,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub unit:        String,
    /// Defaults to the asset class calendar.
    #[serde(default)]
    pub calendar:    Option<CalendarKind>,
    #[serde(default)]
    pub sources:     Vec<String>,
    /// Replaces the asset-class policy when present.
    #[serde(default)]
    pub policy:      Option<RiskFactorPolicy>,
}

impl RiskFactorConfig {
    pub fn calendar(&self) -> CalendarKind {
        self.calendar
            .unwrap_or_else(|| CalendarKind::for_asset_class(self.asset_class))
    }

    pub fn record(&self) -> RiskFactorRecord {
        RiskFactorRecord {
            risk_factor_id: self.id.clone(),
            asset_class: self.asset_class,
            description: self.description.clone(),
            unit: self.unit.clone(),
            calendar: self.calendar(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DqConfig {
    /// Calendar days of history loaded per run.
    #[serde(default = "default_lookback_days")]
    pub lookback_days:         u32,
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries:  u32,
    /// Evaluate factors on the rayon pool.
    #[serde(default = "default_true")]
    pub parallel:              bool,
    #[serde(default = "default_engine_actor")]
    pub engine_actor:          String,
    #[serde(default)]
    pub asset_class_policies:  BTreeMap<AssetClass, RiskFactorPolicy>,
    #[serde(default)]
    pub risk_factors:          Vec<RiskFactorConfig>,
}

fn default_lookback_days() -> u32 { 400 }
fn default_max_conflict_retries() -> u32 { 3 }
fn default_engine_actor() -> String { "dq-engine".into() }

impl DqConfig {
    /// Load a universe file (see `data/universe.json`).
    /// In tests, use DqConfig::default_test().
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        let config: DqConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn risk_factor(&self, id: &str) -> Option<&RiskFactorConfig> {
        self.risk_factors.iter().find(|rf| rf.id == id)
    }

    /// Effective policy: the factor's own override, else its asset-class
    /// default, with the source priority falling back to the factor's
    /// source list.
    pub fn policy_for(&self, rf: &RiskFactorConfig) -> RiskFactorPolicy {
        let mut policy = rf
            .policy
            .clone()
            .or_else(|| self.asset_class_policies.get(&rf.asset_class).cloned())
            .unwrap_or_default();
        if policy.source_priority.is_empty() {
            policy.source_priority = rf.sources.clone();
        }
        policy
    }

    pub fn validate(&self) -> DqResult<()> {
        if self.lookback_days == 0 {
            return Err(DqError::Config("lookback_days must be > 0".into()));
        }
        if self.engine_actor.trim().is_empty() {
            return Err(DqError::Config("engine_actor must not be empty".into()));
        }
        let mut seen = BTreeSet::new();
        for rf in &self.risk_factors {
            if !seen.insert(rf.id.as_str()) {
                return Err(DqError::Config(format!("duplicate risk factor '{}'", rf.id)));
            }
        }
        for rf in &self.risk_factors {
            let policy = self.policy_for(rf);
            for rule in &policy.rules {
                for peer in rule.peer_ids() {
                    if self.risk_factor(&peer).is_none() {
                        return Err(DqError::Config(format!(
                            "{}: rule {} references unknown peer '{peer}'",
                            rf.id,
                            rule.code()
                        )));
                    }
                }
            }
            if let Some(recon) = &policy.reconciliation {
                if !(recon.threshold.is_finite() && recon.threshold >= 0.0) {
                    return Err(DqError::Config(format!(
                        "{}: reconciliation threshold {} must be >= 0",
                        rf.id, recon.threshold
                    )));
                }
            }
        }
        Ok(())
    }

    /// Small deterministic universe for tests: two UST tenors, an FX
    /// triangle and one equity index, each with two sources.
    pub fn default_test() -> Self {
        let rates = RiskFactorPolicy {
            source_priority: Vec::new(),
            rules: vec![
                RuleSpec::Spike(SpikeConfig {
                    measure: ChangeMeasure::Difference,
                    ..SpikeConfig::default()
                }),
                RuleSpec::MissingDays(MissingDaysConfig::default()),
                RuleSpec::Stale(StaleConfig { min_repeats: 5, tolerance: 0.0 }),
            ],
            reconciliation: Some(ReconConfig {
                mode: DiffMode::Absolute,
                threshold: 0.02,
                basis: ReconBasis::Level,
                consecutive: 1,
            }),
            auto_resolve: AutoResolvePolicy::default(),
        };
        let fx = RiskFactorPolicy {
            source_priority: Vec::new(),
            rules: vec![
                RuleSpec::Spike(SpikeConfig {
                    measure: ChangeMeasure::LogReturn,
                    ..SpikeConfig::default()
                }),
                RuleSpec::Stale(StaleConfig::default()),
            ],
            reconciliation: Some(ReconConfig {
                mode: DiffMode::Relative,
                threshold: 0.002,
                basis: ReconBasis::Level,
                consecutive: 1,
            }),
            auto_resolve: AutoResolvePolicy::default(),
        };
        let equities = RiskFactorPolicy {
            source_priority: Vec::new(),
            rules: vec![
                RuleSpec::Spike(SpikeConfig {
                    measure: ChangeMeasure::LogReturn,
                    ..SpikeConfig::default()
                }),
                RuleSpec::Stale(StaleConfig::default()),
            ],
            reconciliation: Some(ReconConfig {
                mode: DiffMode::Relative,
                threshold: 0.006,
                basis: ReconBasis::Return,
                consecutive: 2,
            }),
            auto_resolve: AutoResolvePolicy::default(),
        };

        let mut eurgbp_policy = fx.clone();
        eurgbp_policy.rules.push(RuleSpec::FxTriangle(FxTriangleConfig {
            leg_ab: "EURUSD".into(),
            leg_bc: "USDGBP".into(),
            rel_tolerance: 0.002,
        }));

        let rf = |id: &str, asset_class, description: &str, unit: &str, sources: &[&str]| {
            RiskFactorConfig {
                id: id.into(),
                asset_class,
                description: description.into(),
                unit: unit.into(),
                calendar: None,
                sources: sources.iter().map(|s| s.to_string()).collect(),
                policy: None,
            }
        };

        let mut eurgbp = rf("EURGBP", AssetClass::Fx, "EUR/GBP cross", "GBP per EUR", &["ecb", "twelvedata"]);
        eurgbp.policy = Some(eurgbp_policy);

        Self {
            lookback_days: default_lookback_days(),
            max_conflict_retries: default_max_conflict_retries(),
            parallel: true,
            engine_actor: default_engine_actor(),
            asset_class_policies: BTreeMap::from([
                (AssetClass::Rates, rates),
                (AssetClass::Fx, fx),
                (AssetClass::Equities, equities),
            ]),
            risk_factors: vec![
                rf("US10Y", AssetClass::Rates, "UST 10Y par yield", "pct", &["fred", "stooq"]),
                rf("US2Y", AssetClass::Rates, "UST 2Y par yield", "pct", &["fred", "stooq"]),
                rf("EURUSD", AssetClass::Fx, "EUR/USD spot", "USD per EUR", &["ecb", "twelvedata"]),
                rf("USDGBP", AssetClass::Fx, "USD/GBP spot", "GBP per USD", &["ecb", "twelvedata"]),
                eurgbp,
                rf("SPX", AssetClass::Equities, "S&P 500 index", "index points", &["stooq", "yfinance"]),
            ],
        }
    }
}
