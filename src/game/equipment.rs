use serde::{Deserialize, Serialize};

use crate::error::ContentDiagnostic;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EquipmentEffect {
    /// 输出伤害百分比加成。
    DamageBonus { percent: i32 },
    /// 承受伤害百分比减免。
    DamageReduction { percent: i32 },
    /// 按造成的生命伤害百分比回复。
    Lifesteal { percent: i32 },
    /// 受到敌人攻击时的固定反击伤害。
    Counter { damage: i32 },
    /// 暴击率加成（0.05 = +5%）。
    CritChance { chance: f64 },
    /// 暴击倍率加成。
    CritDamage { multiplier: f64 },
}

impl EquipmentEffect {
    /// 从原始数据记录解析；未知类型返回 `None`。
    pub fn parse(effect_type: &str, value: f64) -> Option<Self> {
        let effect = match effect_type {
            "damageBonus" => EquipmentEffect::DamageBonus {
                percent: value as i32,
            },
            "damageReduction" => EquipmentEffect::DamageReduction {
                percent: value as i32,
            },
            "lifesteal" => EquipmentEffect::Lifesteal {
                percent: value as i32,
            },
            "counter" => EquipmentEffect::Counter {
                damage: value as i32,
            },
            "critChance" => EquipmentEffect::CritChance { chance: value },
            "critDamage" => EquipmentEffect::CritDamage { multiplier: value },
            _ => return None,
        };
        Some(effect)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquipmentSkill {
    pub required_level: u32,
    pub effect: EquipmentEffect,
}

/// 未经校验的技能记录（来自存档或外部数据）。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEquipmentSkill {
    pub effect_type: String,
    pub value: f64,
    #[serde(default)]
    pub required_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEquippedItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub level: u32,
    pub durability: u32,
    pub max_durability: u32,
    #[serde(default)]
    pub skills: Vec<RawEquipmentSkill>,
}

/// 已装备的物品。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquippedItem {
    pub id: String,
    pub name: String,
    pub level: u32,
    pub durability: u32,
    pub max_durability: u32,
    #[serde(default)]
    pub skills: Vec<EquipmentSkill>,
}

impl EquippedItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>, level: u32, durability: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level,
            durability,
            max_durability: durability,
            skills: Vec::new(),
        }
    }

    pub fn with_skill(mut self, required_level: u32, effect: EquipmentEffect) -> Self {
        self.skills.push(EquipmentSkill {
            required_level,
            effect,
        });
        self
    }

    /// 解析原始记录，未知效果类型被跳过并作为诊断返回。
    pub fn from_raw(raw: RawEquippedItem) -> (Self, Vec<ContentDiagnostic>) {
        let mut diagnostics = Vec::new();
        let mut skills = Vec::new();
        for skill in raw.skills {
            match EquipmentEffect::parse(&skill.effect_type, skill.value) {
                Some(effect) => skills.push(EquipmentSkill {
                    required_level: skill.required_level,
                    effect,
                }),
                None => diagnostics.push(
                    ContentDiagnostic::UnknownEquipmentEffect {
                        item_id: raw.id.clone(),
                        effect_type: skill.effect_type,
                    }
                    .report(),
                ),
            }
        }
        (
            Self {
                id: raw.id,
                name: raw.name,
                level: raw.level,
                durability: raw.durability.min(raw.max_durability),
                max_durability: raw.max_durability,
                skills,
            },
            diagnostics,
        )
    }

    pub fn is_broken(&self) -> bool {
        self.durability == 0
    }

    pub fn unlocked_skills(&self) -> impl Iterator<Item = &EquipmentSkill> {
        let level = self.level;
        self.skills
            .iter()
            .filter(move |skill| level >= skill.required_level)
    }

    pub fn worn(&self, amount: u32) -> Self {
        Self {
            durability: self.durability.saturating_sub(amount),
            ..self.clone()
        }
    }
}

/// 所有装备已解锁技能的加总。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct EquipmentBonuses {
    pub damage_bonus_percent: i32,
    pub damage_reduction_percent: i32,
    pub lifesteal_percent: i32,
    pub counter_damage: i32,
    pub crit_chance: f64,
    pub crit_multiplier: f64,
}

impl EquipmentBonuses {
    pub fn aggregate(items: &[EquippedItem]) -> Self {
        let mut bonuses = Self::default();
        for item in items.iter().filter(|item| !item.is_broken()) {
            for skill in item.unlocked_skills() {
                match skill.effect {
                    EquipmentEffect::DamageBonus { percent } => {
                        bonuses.damage_bonus_percent += percent
                    }
                    EquipmentEffect::DamageReduction { percent } => {
                        bonuses.damage_reduction_percent += percent
                    }
                    EquipmentEffect::Lifesteal { percent } => bonuses.lifesteal_percent += percent,
                    EquipmentEffect::Counter { damage } => bonuses.counter_damage += damage,
                    EquipmentEffect::CritChance { chance } => bonuses.crit_chance += chance,
                    EquipmentEffect::CritDamage { multiplier } => {
                        bonuses.crit_multiplier += multiplier
                    }
                }
            }
        }
        bonuses
    }
}

/// 战斗结束时回传的耐久变化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurabilityDelta {
    pub item_id: String,
    pub lost: u32,
    pub remaining: u32,
}
