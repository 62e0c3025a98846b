//! Seeded synthetic market data for demos and tests.
//!
//! Each asset class shares a common driver so correlated factors stay
//! correlated; FX crosses that carry a triangle rule are built as the product
//! of their legs. Every source is the true level plus a small independent
//! error. Defects are injected on top, after generation.

use crate::config::{DqConfig, RiskFactorConfig};
use crate::rng::SeriesRng;
use crate::rules::RuleSpec;
use crate::series::Observation;
use crate::types::{AssetClass, RiskFactorId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Weight of the asset-class driver in each factor's daily shock.
const COMMON_RHO: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Defect {
    /// Bump the first source's print on `date` by `sigmas` daily vols.
    Spike { risk_factor_id: RiskFactorId, date: NaiveDate, sigmas: f64 },
    /// Every source repeats the previous print for `days` business days.
    Stale { risk_factor_id: RiskFactorId, from: NaiveDate, days: usize },
    /// No source prints for `days` business days.
    Gap { risk_factor_id: RiskFactorId, from: NaiveDate, days: usize },
    /// One source is off by `rel` (relative) from `from` onwards.
    SourceDrift { risk_factor_id: RiskFactorId, source: String, from: NaiveDate, rel: f64 },
}

struct Profile {
    start_level: f64,
    daily_vol:   f64,
    /// Log-normal walk when true, additive otherwise.
    multiplicative: bool,
    source_error: f64,
}

fn profile(asset_class: AssetClass) -> Profile {
    match asset_class {
        AssetClass::Rates => Profile {
            start_level: 4.0,
            daily_vol: 0.05,
            multiplicative: false,
            source_error: 0.001,
        },
        AssetClass::Fx => Profile {
            start_level: 1.1,
            daily_vol: 0.005,
            multiplicative: true,
            source_error: 0.0001,
        },
        AssetClass::Equities => Profile {
            start_level: 4500.0,
            daily_vol: 0.01,
            multiplicative: true,
            source_error: 0.0002,
        },
        AssetClass::Commodities => Profile {
            start_level: 80.0,
            daily_vol: 0.015,
            multiplicative: true,
            source_error: 0.0005,
        },
    }
}

pub struct SyntheticUniverse {
    seed:    u64,
    start:   NaiveDate,
    end:     NaiveDate,
    defects: Vec<Defect>,
}

impl SyntheticUniverse {
    pub fn new(seed: u64, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            seed,
            start,
            end,
            defects: Vec::new(),
        }
    }

    pub fn with_defect(mut self, defect: Defect) -> Self {
        self.defects.push(defect);
        self
    }

    /// Observations for every configured risk factor and source, all stamped
    /// `ingested_at`, sorted by (risk factor, source, date).
    pub fn generate(&self, config: &DqConfig, ingested_at: DateTime<Utc>) -> Vec<Observation> {
        let truths = self.true_levels(config);
        let mut out = Vec::new();
        for rf in &config.risk_factors {
            let Some(truth) = truths.get(&rf.id) else {
                continue;
            };
            let p = profile(rf.asset_class);
            for source in &rf.sources {
                let mut rng = SeriesRng::named(self.seed, &format!("source:{}:{source}", rf.id));
                let mut prints: BTreeMap<NaiveDate, f64> = truth
                    .iter()
                    .map(|(d, v)| {
                        let noisy = if p.multiplicative {
                            v * (1.0 + p.source_error * rng.normal())
                        } else {
                            v + p.source_error * rng.normal()
                        };
                        (*d, round6(noisy))
                    })
                    .collect();
                self.inject(rf, source, &mut prints, &p);
                out.extend(prints.into_iter().map(|(obs_date, value)| Observation {
                    risk_factor_id: rf.id.clone(),
                    source: source.clone(),
                    obs_date,
                    value,
                    ingested_at,
                }));
            }
        }
        out
    }

    fn true_levels(&self, config: &DqConfig) -> BTreeMap<RiskFactorId, BTreeMap<NaiveDate, f64>> {
        let mut drivers: BTreeMap<AssetClass, SeriesRng> = BTreeMap::new();
        let mut common: BTreeMap<(AssetClass, NaiveDate), f64> = BTreeMap::new();
        let mut levels = BTreeMap::new();

        let (crosses, plain): (Vec<&RiskFactorConfig>, Vec<&RiskFactorConfig>) = config
            .risk_factors
            .iter()
            .partition(|rf| triangle_legs(config, rf).is_some());

        for (i, rf) in plain.iter().enumerate() {
            let p = profile(rf.asset_class);
            let calendar = rf.calendar();
            let mut rng = SeriesRng::named(self.seed, &format!("truth:{}", rf.id));
            let driver = drivers
                .entry(rf.asset_class)
                .or_insert_with(|| SeriesRng::named(self.seed, &format!("common:{}", rf.asset_class)));
            // Spread starting levels so tenors and pairs differ.
            let mut level = p.start_level * (1.0 + 0.05 * i as f64);
            let mut series = BTreeMap::new();
            for date in calendar.business_days(self.start, self.end) {
                let zc = *common
                    .entry((rf.asset_class, date))
                    .or_insert_with(|| driver.normal());
                let shock = COMMON_RHO * zc + (1.0 - COMMON_RHO * COMMON_RHO).sqrt() * rng.normal();
                level = if p.multiplicative {
                    level * (p.daily_vol * shock).exp()
                } else {
                    level + p.daily_vol * shock
                };
                series.insert(date, level);
            }
            levels.insert(rf.id.clone(), series);
        }

        for rf in crosses {
            let Some((ab, bc)) = triangle_legs(config, rf) else {
                continue;
            };
            let (Some(a), Some(b)) = (levels.get(&ab), levels.get(&bc)) else {
                continue;
            };
            let series: BTreeMap<NaiveDate, f64> = a
                .iter()
                .filter_map(|(d, va)| b.get(d).map(|vb| (*d, va * vb)))
                .collect();
            levels.insert(rf.id.clone(), series);
        }
        levels
    }

    fn inject(
        &self,
        rf: &RiskFactorConfig,
        source: &str,
        prints: &mut BTreeMap<NaiveDate, f64>,
        p: &Profile,
    ) {
        let calendar = rf.calendar();
        for defect in self.defects.iter() {
            match defect {
                Defect::Spike { risk_factor_id, date, sigmas } if *risk_factor_id == rf.id => {
                    if rf.sources.first().map(String::as_str) != Some(source) {
                        continue;
                    }
                    if let Some(v) = prints.get_mut(date) {
                        *v = if p.multiplicative {
                            round6(*v * (p.daily_vol * sigmas).exp())
                        } else {
                            round6(*v + p.daily_vol * sigmas)
                        };
                    }
                }
                Defect::Stale { risk_factor_id, from, days } if *risk_factor_id == rf.id => {
                    let Some(frozen) = prints.range(..*from).next_back().map(|(_, v)| *v) else {
                        continue;
                    };
                    for d in calendar.business_days(*from, self.end).into_iter().take(*days) {
                        if let Some(v) = prints.get_mut(&d) {
                            *v = frozen;
                        }
                    }
                }
                Defect::Gap { risk_factor_id, from, days } if *risk_factor_id == rf.id => {
                    for d in calendar.business_days(*from, self.end).into_iter().take(*days) {
                        prints.remove(&d);
                    }
                }
                Defect::SourceDrift { risk_factor_id, source: s, from, rel }
                    if *risk_factor_id == rf.id && s == source =>
                {
                    for (_, v) in prints.range_mut(*from..) {
                        *v = round6(*v * (1.0 + rel));
                    }
                }
                _ => {}
            }
        }
    }
}

/// `(leg_ab, leg_bc)` when the factor's policy carries a triangle rule.
fn triangle_legs(config: &DqConfig, rf: &RiskFactorConfig) -> Option<(RiskFactorId, RiskFactorId)> {
    config.policy_for(rf).rules.into_iter().find_map(|r| match r {
        RuleSpec::FxTriangle(t) => Some((t.leg_ab, t.leg_bc)),
        _ => None,
    })
}

fn round6(v: f64) -> f64 {
    (v * 1e6).round() / 1e6
}
