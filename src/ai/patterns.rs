use std::collections::{BTreeMap, BTreeSet};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ContentDiagnostic;
use crate::game::buffs::BuffApplication;
use crate::game::cards::Element;
use crate::game::state::EnemyRank;

const WEIGHT_TOLERANCE: f64 = 1e-6;

fn one() -> u32 {
    1
}

/// 以 (hp, maxHp) 为输入的血量条件。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HpCondition {
    /// hp / maxHp > ratio
    Above { ratio: f64 },
    /// hp / maxHp <= ratio
    AtMost { ratio: f64 },
    /// min < hp / maxHp <= max
    Between { min: f64, max: f64 },
    Any { conditions: Vec<HpCondition> },
    All { conditions: Vec<HpCondition> },
}

impl HpCondition {
    pub fn holds(&self, hp: i32, max_hp: i32) -> bool {
        let ratio = hp.max(0) as f64 / max_hp.max(1) as f64;
        match self {
            HpCondition::Above { ratio: threshold } => ratio > *threshold,
            HpCondition::AtMost { ratio: threshold } => ratio <= *threshold,
            HpCondition::Between { min, max } => ratio > *min && ratio <= *max,
            HpCondition::Any { conditions } => conditions
                .iter()
                .any(|condition| condition.holds(hp, max_hp)),
            HpCondition::All { conditions } => conditions
                .iter()
                .all(|condition| condition.holds(hp, max_hp)),
        }
    }
}

/// 敌人一次行动的内容。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnemyAction {
    pub name: String,
    #[serde(default)]
    pub damage: i32,
    #[serde(default = "one")]
    pub hit_count: u32,
    #[serde(default)]
    pub guard_gain: i32,
    #[serde(default)]
    pub heal: i32,
    /// 施加给玩家的减益。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debuffs: Vec<BuffApplication>,
    /// 施加给自身的增益。
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buffs: Vec<BuffApplication>,
    #[serde(default = "one")]
    pub energy_cost: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Element>,
}

impl EnemyAction {
    pub fn attack(name: impl Into<String>, damage: i32, hit_count: u32) -> Self {
        Self {
            name: name.into(),
            damage,
            hit_count,
            guard_gain: 0,
            heal: 0,
            debuffs: Vec::new(),
            buffs: Vec::new(),
            energy_cost: 1,
            element: None,
        }
    }

    pub fn defend(name: impl Into<String>, guard_gain: i32) -> Self {
        Self {
            guard_gain,
            hit_count: 0,
            ..Self::attack(name, 0, 0)
        }
    }

    pub fn with_debuff(mut self, debuff: BuffApplication) -> Self {
        self.debuffs.push(debuff);
        self
    }

    pub fn with_buff(mut self, buff: BuffApplication) -> Self {
        self.buffs.push(buff);
        self
    }

    pub fn is_attack(&self) -> bool {
        self.damage > 0 && self.hit_count > 0
    }
}

/// AI 行动表中的一项。`phase_number >= 1` 为固定轮转槽位，`0` 为按概率抽选。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiPattern {
    #[serde(default)]
    pub phase_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<HpCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    pub action: EnemyAction,
}

impl AiPattern {
    pub fn rotation(phase_number: u32, action: EnemyAction) -> Self {
        Self {
            phase_number,
            condition: None,
            probability: None,
            action,
        }
    }

    pub fn weighted(probability: f64, action: EnemyAction) -> Self {
        Self {
            phase_number: 0,
            condition: None,
            probability: Some(probability),
            action,
        }
    }

    pub fn when(mut self, condition: HpCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    fn condition_holds(&self, hp: i32, max_hp: i32) -> bool {
        self.condition
            .as_ref()
            .map(|condition| condition.holds(hp, max_hp))
            .unwrap_or(true)
    }

    fn tier_key(&self) -> String {
        match &self.condition {
            Some(condition) => serde_json::to_string(condition)
                .unwrap_or_else(|_| format!("{condition:?}")),
            None => "always".to_string(),
        }
    }
}

/// 敌人静态定义（权威数据，只读）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnemyDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rank: EnemyRank,
    #[serde(default = "one")]
    pub depth: u32,
    pub max_hp: i32,
    #[serde(default)]
    pub max_ap: i32,
    pub speed: i32,
    pub attack: i32,
    #[serde(default = "one")]
    pub energy: u32,
    #[serde(default)]
    pub ai_patterns: Vec<AiPattern>,
}

impl EnemyDefinition {
    pub fn is_boss(&self) -> bool {
        self.rank == EnemyRank::Boss
    }

    /// 校验每个血量档位内的概率之和为 1.0，且轮转槽位连续。
    pub fn validate_patterns(&self) -> Vec<ContentDiagnostic> {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for pattern in self
            .ai_patterns
            .iter()
            .filter(|pattern| pattern.phase_number == 0)
        {
            if let Some(probability) = pattern.probability {
                *sums.entry(pattern.tier_key()).or_default() += probability;
            }
        }
        let mut diagnostics: Vec<ContentDiagnostic> = sums
            .into_iter()
            .filter(|(_, sum)| (sum - 1.0).abs() > WEIGHT_TOLERANCE)
            .map(|(tier, sum)| ContentDiagnostic::InvalidPatternWeights {
                enemy_id: self.id.clone(),
                tier,
                sum,
            })
            .collect();

        // 轮转槽位必须恰好是 1..=N。
        let slots: BTreeSet<u32> = self
            .ai_patterns
            .iter()
            .map(|pattern| pattern.phase_number)
            .filter(|slot| *slot > 0)
            .collect();
        if let Some(highest) = slots.last().copied() {
            if highest as usize != slots.len() {
                diagnostics.push(ContentDiagnostic::SparseRotation {
                    enemy_id: self.id.clone(),
                    slots: slots.len() as u32,
                    highest,
                });
            }
        }
        diagnostics
    }
}

/// 行动的来源，供界面展示意图。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DecisionSource {
    Rotation { phase_number: u32 },
    Weighted { roll: f64, candidates: usize },
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnemyDecision {
    pub action: EnemyAction,
    pub source: DecisionSource,
}

/// 选择敌人行动。只读定义与当前血量，不修改任何共享状态；
/// 随机性全部来自调用方传入的 `rng`，因此用克隆的 rng 即可无副作用地预览。
pub fn determine_enemy_action<R: Rng + ?Sized>(
    definition: &EnemyDefinition,
    hp: i32,
    max_hp: i32,
    turn_count: u32,
    rng: &mut R,
) -> EnemyDecision {
    if let Some(decision) = rotation_action(definition, hp, max_hp, turn_count) {
        return decision;
    }
    if let Some(decision) = weighted_action(definition, hp, max_hp, rng) {
        return decision;
    }
    EnemyDecision {
        action: EnemyAction::attack("Attack", definition.attack, 1),
        source: DecisionSource::Fallback,
    }
}

fn rotation_action(
    definition: &EnemyDefinition,
    hp: i32,
    max_hp: i32,
    turn_count: u32,
) -> Option<EnemyDecision> {
    let cycle = definition
        .ai_patterns
        .iter()
        .map(|pattern| pattern.phase_number)
        .max()
        .filter(|cycle| *cycle > 0)?;
    let slot = match turn_count % cycle {
        0 => cycle,
        slot => slot,
    };
    definition
        .ai_patterns
        .iter()
        .filter(|pattern| pattern.phase_number == slot && pattern.probability.is_none())
        .find(|pattern| pattern.condition_holds(hp, max_hp))
        .map(|pattern| EnemyDecision {
            action: pattern.action.clone(),
            source: DecisionSource::Rotation { phase_number: slot },
        })
}

fn weighted_action<R: Rng + ?Sized>(
    definition: &EnemyDefinition,
    hp: i32,
    max_hp: i32,
    rng: &mut R,
) -> Option<EnemyDecision> {
    let candidates: Vec<&AiPattern> = definition
        .ai_patterns
        .iter()
        .filter(|pattern| pattern.phase_number == 0)
        .filter(|pattern| pattern.condition_holds(hp, max_hp))
        .collect();
    let first = candidates.first()?;

    let total: f64 = candidates.iter().map(|pattern| pattern_weight(pattern)).sum();
    let roll = rng.gen::<f64>();
    if total <= 0.0 {
        return Some(EnemyDecision {
            action: first.action.clone(),
            source: DecisionSource::Weighted {
                roll,
                candidates: candidates.len(),
            },
        });
    }

    let target = roll * total;
    let mut cumulative = 0.0;
    let mut chosen = candidates[candidates.len() - 1];
    for pattern in &candidates {
        cumulative += pattern_weight(pattern);
        if target < cumulative {
            chosen = *pattern;
            break;
        }
    }
    Some(EnemyDecision {
        action: chosen.action.clone(),
        source: DecisionSource::Weighted {
            roll,
            candidates: candidates.len(),
        },
    })
}

fn pattern_weight(pattern: &AiPattern) -> f64 {
    pattern.probability.unwrap_or(1.0).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::buffs::BuffKind;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn definition(patterns: Vec<AiPattern>) -> EnemyDefinition {
        EnemyDefinition {
            id: "golem".into(),
            name: "Stone Golem".into(),
            rank: EnemyRank::Boss,
            depth: 1,
            max_hp: 90,
            max_ap: 0,
            speed: 5,
            attack: 7,
            energy: 1,
            ai_patterns: patterns,
        }
    }

    fn tiered_boss() -> EnemyDefinition {
        definition(vec![
            AiPattern::weighted(0.7, EnemyAction::attack("Slam", 10, 1))
                .when(HpCondition::Above { ratio: 0.66 }),
            AiPattern::weighted(0.3, EnemyAction::defend("Harden", 8))
                .when(HpCondition::Above { ratio: 0.66 }),
            AiPattern::weighted(1.0, EnemyAction::attack("Quake", 6, 3))
                .when(HpCondition::Between { min: 0.33, max: 0.66 }),
            AiPattern::weighted(
                1.0,
                EnemyAction::attack("Crumble", 20, 1)
                    .with_debuff(BuffApplication::new(BuffKind::DefDown, 2, 25)),
            )
            .when(HpCondition::AtMost { ratio: 0.33 }),
        ])
    }

    #[test]
    fn rotation_is_deterministic_and_cycles() {
        let def = definition(vec![
            AiPattern::rotation(1, EnemyAction::attack("Jab", 4, 1)),
            AiPattern::rotation(2, EnemyAction::defend("Brace", 5)),
            AiPattern::rotation(3, EnemyAction::attack("Smash", 12, 1)),
        ]);
        let mut rng_a = SmallRng::seed_from_u64(1);
        let mut rng_b = SmallRng::seed_from_u64(99);
        for turn in 1..=9 {
            let a = determine_enemy_action(&def, 50, 90, turn, &mut rng_a);
            let b = determine_enemy_action(&def, 50, 90, turn, &mut rng_b);
            assert_eq!(a, b, "rotation must not depend on randomness");
        }
        let names: Vec<String> = (1..=4)
            .map(|turn| determine_enemy_action(&def, 50, 90, turn, &mut rng_a).action.name)
            .collect();
        assert_eq!(names, vec!["Jab", "Brace", "Smash", "Jab"]);
    }

    #[test]
    fn hp_tiers_restrict_the_weighted_pool() {
        let def = tiered_boss();
        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..50 {
            let high = determine_enemy_action(&def, 80, 90, 1, &mut rng);
            assert!(["Slam", "Harden"].contains(&high.action.name.as_str()));
            let mid = determine_enemy_action(&def, 45, 90, 1, &mut rng);
            assert_eq!(mid.action.name, "Quake");
            let low = determine_enemy_action(&def, 25, 90, 1, &mut rng);
            assert_eq!(low.action.name, "Crumble");
        }
    }

    #[test]
    fn weighted_draw_roughly_follows_probabilities() {
        let def = tiered_boss();
        let mut rng = SmallRng::seed_from_u64(11);
        let slams = (0..2_000)
            .filter(|_| determine_enemy_action(&def, 90, 90, 1, &mut rng).action.name == "Slam")
            .count();
        assert!((1_250..1_550).contains(&slams), "slam count {slams}");
    }

    #[test]
    fn falls_back_to_basic_attack_without_patterns() {
        let def = definition(Vec::new());
        let mut rng = SmallRng::seed_from_u64(5);
        let decision = determine_enemy_action(&def, 10, 90, 4, &mut rng);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert_eq!(decision.action.damage, 7);
    }

    #[test]
    fn rotation_condition_miss_falls_through_to_weighted() {
        let def = definition(vec![
            AiPattern::rotation(1, EnemyAction::attack("Frenzy", 30, 1))
                .when(HpCondition::AtMost { ratio: 0.5 }),
            AiPattern::weighted(1.0, EnemyAction::defend("Wait", 2)),
        ]);
        let mut rng = SmallRng::seed_from_u64(5);
        assert_eq!(
            determine_enemy_action(&def, 90, 90, 1, &mut rng).action.name,
            "Wait"
        );
        assert_eq!(
            determine_enemy_action(&def, 20, 90, 1, &mut rng).action.name,
            "Frenzy"
        );
    }

    #[test]
    fn weight_validation_flags_bad_tiers_only() {
        assert!(tiered_boss().validate_patterns().is_empty());
        let broken = definition(vec![
            AiPattern::weighted(0.5, EnemyAction::attack("A", 1, 1)),
            AiPattern::weighted(0.2, EnemyAction::attack("B", 1, 1)),
        ]);
        let diagnostics = broken.validate_patterns();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(
            diagnostics[0],
            ContentDiagnostic::InvalidPatternWeights { .. }
        ));
    }

    #[test]
    fn sparse_rotation_slots_are_flagged() {
        let dense = definition(vec![
            AiPattern::rotation(1, EnemyAction::attack("Jab", 4, 1)),
            AiPattern::rotation(2, EnemyAction::defend("Brace", 5)),
            AiPattern::rotation(2, EnemyAction::attack("Lunge", 9, 1))
                .when(HpCondition::AtMost { ratio: 0.5 }),
        ]);
        assert!(dense.validate_patterns().is_empty());

        let sparse = definition(vec![
            AiPattern::rotation(1, EnemyAction::attack("Jab", 4, 1)),
            AiPattern::rotation(3, EnemyAction::attack("Smash", 12, 1)),
        ]);
        assert_eq!(
            sparse.validate_patterns(),
            vec![ContentDiagnostic::SparseRotation {
                enemy_id: "golem".into(),
                slots: 2,
                highest: 3,
            }]
        );
    }

    #[test]
    fn between_condition_is_exclusive_below_inclusive_above() {
        let mid = HpCondition::Between { min: 0.33, max: 0.66 };
        assert!(mid.holds(66, 100));
        assert!(!mid.holds(33, 100));
        assert!(!mid.holds(67, 100));
    }
}
