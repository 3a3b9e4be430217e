//! 战斗奖励：魂、魔石、卡牌奖励与派生解锁列表。

use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::cards::{CardCatalog, CardTypeId, DerivationUnlock};
use super::config::BattleConfig;
use super::state::{EnemyBattleState, EnemyRank};

/// 遭遇类型，由敌人列表推出。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EncounterKind {
    Single,
    Double,
    Triple,
    Boss,
}

impl EncounterKind {
    pub fn of(enemies: &[EnemyBattleState]) -> Self {
        if enemies.iter().any(|enemy| enemy.rank == EnemyRank::Boss) {
            return EncounterKind::Boss;
        }
        match enemies.len() {
            0 | 1 => EncounterKind::Single,
            2 => EncounterKind::Double,
            _ => EncounterKind::Triple,
        }
    }

    pub fn enemy_count(&self) -> usize {
        match self {
            EncounterKind::Single | EncounterKind::Boss => 1,
            EncounterKind::Double => 2,
            EncounterKind::Triple => 3,
        }
    }
}

impl FromStr for EncounterKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "single" => Ok(EncounterKind::Single),
            "double" => Ok(EncounterKind::Double),
            "triple" => Ok(EncounterKind::Triple),
            "boss" => Ok(EncounterKind::Boss),
            other => Err(format!("unknown encounter kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BattleRewards {
    pub encounter: EncounterKind,
    pub souls_gained: u32,
    pub magic_stones: u32,
    pub card_rewards: Vec<CardTypeId>,
    pub derivation_unlocks: Vec<DerivationUnlock>,
}

/// 胜利奖励。魂 = Σ(按阶级的魂值 × 深度) + 牌组熟练度总和 / 5。
pub fn compute_rewards<R: Rng + ?Sized>(
    enemies: &[EnemyBattleState],
    depth: u32,
    total_mastery: u32,
    unlocks: &[DerivationUnlock],
    catalog: &CardCatalog,
    config: &BattleConfig,
    rng: &mut R,
) -> BattleRewards {
    let depth = depth.max(1);
    let souls_gained = enemies
        .iter()
        .map(|enemy| config.souls_for_rank(enemy.rank) * depth)
        .sum::<u32>()
        + total_mastery / 5;

    let magic_stones = enemies
        .iter()
        .map(|enemy| match enemy.rank {
            EnemyRank::Boss => config.boss_magic_stones,
            EnemyRank::Elite => 1,
            EnemyRank::Normal => u32::from(rng.gen::<f64>() < config.magic_stone_chance),
        })
        .sum();

    let pool = catalog.reward_pool();
    let card_rewards = pool
        .choose_multiple(rng, config.card_reward_count)
        .map(|template| template.card_type_id.clone())
        .collect();

    BattleRewards {
        encounter: EncounterKind::of(enemies),
        souls_gained,
        magic_stones,
        card_rewards,
        derivation_unlocks: unlocks.to_vec(),
    }
}

/// 魂残渣转入永久进度，存活与阵亡使用不同倍率（向下取整）。
pub fn transfer_souls(remnant: u32, survived: bool, config: &BattleConfig) -> u32 {
    let multiplier = if survived {
        config.soul_transfer_survived
    } else {
        config.soul_transfer_fallen
    };
    (remnant as f64 * multiplier).floor().max(0.0) as u32
}
