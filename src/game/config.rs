use serde::{Deserialize, Serialize};

use super::state::EnemyRank;

/// 战斗可调参数。所有字段都有默认值，JSON 中缺省的字段沿用默认。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BattleConfig {
    pub hand_size: u8,
    pub player_max_energy: u32,
    /// 熟练度 Lv1/Lv2/Lv3 所需使用次数。
    pub mastery_thresholds: [u32; 3],
    /// 熟练度 Lv1/Lv2/Lv3 的伤害加成（0.2 = +20%）。
    pub mastery_bonuses: [f64; 3],
    /// 每级宝石的伤害加成。
    pub gem_bonus_per_level: f64,
    pub base_crit_chance: f64,
    pub crit_multiplier: f64,
    pub escape_base: f64,
    pub escape_min: f64,
    pub escape_max: f64,
    pub sword_energy_max: u32,
    pub sword_energy_flat_bonus: i32,
    pub resonance_max_stacks: u32,
    pub resonance_bonus: f64,
    pub souls_normal: u32,
    pub souls_elite: u32,
    pub souls_boss: u32,
    pub magic_stone_chance: f64,
    pub boss_magic_stones: u32,
    pub card_reward_count: usize,
    pub soul_transfer_survived: f64,
    pub soul_transfer_fallen: f64,
}

impl BattleConfig {
    pub const DEFAULT_HAND_SIZE: u8 = 5;
    pub const DEFAULT_PLAYER_ENERGY: u32 = 3;
    pub const MAX_MASTERY_LEVEL: u8 = 3;

    pub fn new() -> Self {
        Self {
            hand_size: Self::DEFAULT_HAND_SIZE,
            player_max_energy: Self::DEFAULT_PLAYER_ENERGY,
            mastery_thresholds: [5, 15, 30],
            mastery_bonuses: [0.2, 0.4, 1.0],
            gem_bonus_per_level: 0.1,
            base_crit_chance: 0.05,
            crit_multiplier: 1.5,
            escape_base: 0.4,
            escape_min: 0.1,
            escape_max: 0.95,
            sword_energy_max: 10,
            sword_energy_flat_bonus: 1,
            resonance_max_stacks: 3,
            resonance_bonus: 0.15,
            souls_normal: 10,
            souls_elite: 25,
            souls_boss: 80,
            magic_stone_chance: 0.25,
            boss_magic_stones: 3,
            card_reward_count: 3,
            soul_transfer_survived: 1.0,
            soul_transfer_fallen: 0.5,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// 根据累计使用次数换算熟练度等级（0-3）。
    pub fn mastery_level(&self, use_count: u32) -> u8 {
        self.mastery_thresholds
            .iter()
            .filter(|threshold| use_count >= **threshold)
            .count() as u8
    }

    /// 熟练度等级对应的伤害加成。
    pub fn mastery_bonus(&self, level: u8) -> f64 {
        match level {
            0 => 0.0,
            level => {
                let index = (level.min(Self::MAX_MASTERY_LEVEL) - 1) as usize;
                self.mastery_bonuses[index]
            }
        }
    }

    pub fn souls_for_rank(&self, rank: EnemyRank) -> u32 {
        match rank {
            EnemyRank::Normal => self.souls_normal,
            EnemyRank::Elite => self.souls_elite,
            EnemyRank::Boss => self.souls_boss,
        }
    }
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self::new()
    }
}
