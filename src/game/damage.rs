//! 伤害与减免：护甲(AP) → 格挡(guard) → 生命 的逐段吸收，以及逃跑概率。

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cards::Element;
use super::config::BattleConfig;
use super::state::CombatantStats;

/// 单次命中的结算。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct HitOutcome {
    pub incoming: i32,
    pub ap_absorbed: i32,
    pub guard_absorbed: i32,
    pub hp_damage: i32,
    /// 本次命中把 AP 打到 0（破甲）。
    pub broke_armor: bool,
}

/// 对目标结算一次命中：先扣 AP，再扣格挡，剩余部分扣生命，均不低于 0。
pub fn apply_hit(target: &CombatantStats, amount: i32) -> (CombatantStats, HitOutcome) {
    let mut stats = target.clone();
    let mut remaining = amount.max(0);
    let mut outcome = HitOutcome {
        incoming: remaining,
        ..HitOutcome::default()
    };

    if stats.ap > 0 && remaining > 0 {
        let absorbed = remaining.min(stats.ap);
        stats.ap -= absorbed;
        remaining -= absorbed;
        outcome.ap_absorbed = absorbed;
        outcome.broke_armor = stats.ap == 0;
    }

    if stats.guard > 0 && remaining > 0 {
        let absorbed = remaining.min(stats.guard);
        stats.guard -= absorbed;
        remaining -= absorbed;
        outcome.guard_absorbed = absorbed;
    }

    if remaining > 0 {
        let dealt = remaining.min(stats.hp);
        stats.hp -= dealt;
        outcome.hp_damage = dealt;
    }

    (stats, outcome)
}

/// 已折算职业与装备修正的一次攻击。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttackProfile {
    pub base_damage: i32,
    pub hit_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Element>,
    /// 熟练度、宝石、共鸣等乘算修正。
    pub multiplier: f64,
    /// 剑气等每段固定加值。
    pub flat_bonus: i32,
    /// 攻击方的百分比修正（增减益 + 装备）。
    pub outgoing_percent: i32,
    pub crit_chance: f64,
    pub crit_multiplier: f64,
}

impl AttackProfile {
    pub fn new(base_damage: i32, hit_count: u32) -> Self {
        Self {
            base_damage,
            hit_count,
            element: None,
            multiplier: 1.0,
            flat_bonus: 0,
            outgoing_percent: 0,
            crit_chance: 0.0,
            crit_multiplier: 1.0,
        }
    }

    pub fn with_crit(mut self, chance: f64, multiplier: f64) -> Self {
        self.crit_chance = chance;
        self.crit_multiplier = multiplier;
        self
    }

    /// 减免前的单段伤害。`incoming_percent` 为目标侧修正（易伤为正，减伤为负）。
    pub fn per_hit(&self, incoming_percent: i32, critical: bool) -> i32 {
        let percent = (100 + self.outgoing_percent + incoming_percent).max(0) as f64 / 100.0;
        let mut value = (self.base_damage as f64 * self.multiplier + self.flat_bonus as f64) * percent;
        if critical {
            value *= self.crit_multiplier;
        }
        value.floor().max(0.0) as i32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DamageReport {
    pub hits: Vec<HitOutcome>,
    pub critical: bool,
    pub ap_absorbed: i32,
    pub guard_absorbed: i32,
    pub hp_damage: i32,
    pub broke_armor: bool,
}

impl DamageReport {
    pub fn total_absorbed(&self) -> i32 {
        self.ap_absorbed + self.guard_absorbed
    }

    fn push(&mut self, hit: HitOutcome) {
        self.ap_absorbed += hit.ap_absorbed;
        self.guard_absorbed += hit.guard_absorbed;
        self.hp_damage += hit.hp_damage;
        self.broke_armor |= hit.broke_armor;
        self.hits.push(hit);
    }
}

/// 多段攻击逐段独立结算；目标倒下后剩余段数不再结算。暴击每次攻击判定一次。
pub fn resolve_attack<R: Rng + ?Sized>(
    attack: &AttackProfile,
    target: &CombatantStats,
    target_reduction_percent: i32,
    rng: &mut R,
) -> (CombatantStats, DamageReport) {
    let critical = attack.crit_chance > 0.0 && rng.gen::<f64>() < attack.crit_chance;
    let incoming_percent = target.buffs.incoming_percent() - target_reduction_percent;
    let amount = attack.per_hit(incoming_percent, critical);

    let mut stats = target.clone();
    let mut report = DamageReport {
        critical,
        ..DamageReport::default()
    };
    for _ in 0..attack.hit_count {
        if stats.is_defeated() {
            break;
        }
        let (next, hit) = apply_hit(&stats, amount);
        stats = next;
        report.push(hit);
    }
    (stats, report)
}

/// 按百分比取整（向下）。
pub fn percent_of(amount: i32, percent: i32) -> i32 {
    if amount <= 0 || percent <= 0 {
        return 0;
    }
    amount * percent / 100
}

/// 逃跑概率：`clamp(0.4 * 己方速度 / max(1, 对方速度), 0.1, 0.95)`。
pub fn escape_chance(actor_speed: i32, opposing_speed: i32, config: &BattleConfig) -> f64 {
    let ratio = actor_speed.max(0) as f64 / opposing_speed.max(1) as f64;
    (config.escape_base * ratio).clamp(config.escape_min, config.escape_max)
}

/// 一次伯努利判定。
pub fn roll_escape<R: Rng + ?Sized>(chance: f64, rng: &mut R) -> bool {
    rng.gen::<f64>() < chance
}
