use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::buffs::{BuffApplication, BuffKind, BuffLedger};
use super::cards::{CardInstanceId, CardTypeId, CharacterClass, DerivationUnlock, Element};
use super::effects::CardExecutionResult;
use super::equipment::EquippedItem;
use super::scheduler::PhaseEntry;
use crate::ai::EnemyDefinition;

/// 敌人在战斗中的位置索引。
pub type EnemyIndex = usize;

/// 玩家与敌人共用的战斗属性。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CombatantStats {
    pub hp: i32,
    pub max_hp: i32,
    #[serde(default)]
    pub ap: i32,
    #[serde(default)]
    pub max_ap: i32,
    #[serde(default)]
    pub guard: i32,
    pub speed: i32,
    #[serde(default)]
    pub buffs: BuffLedger,
}

impl CombatantStats {
    pub fn new(max_hp: i32, max_ap: i32, speed: i32) -> Self {
        Self {
            hp: max_hp,
            max_hp,
            ap: max_ap,
            max_ap,
            guard: 0,
            speed,
            buffs: BuffLedger::new(),
        }
    }

    pub fn is_defeated(&self) -> bool {
        self.hp <= 0
    }

    /// AP 已被打空的破甲状态。
    pub fn is_broken(&self) -> bool {
        self.max_ap > 0 && self.ap == 0
    }

    /// 计入加速/减速后的速度。
    pub fn effective_speed(&self) -> i32 {
        (self.speed + self.buffs.speed_modifier()).max(0)
    }

    pub fn healed(&self, amount: i32) -> (Self, i32) {
        if amount <= 0 || self.is_defeated() {
            return (self.clone(), 0);
        }
        let restored = amount.min(self.max_hp - self.hp).max(0);
        (
            Self {
                hp: self.hp + restored,
                ..self.clone()
            },
            restored,
        )
    }

    pub fn with_guard(&self, amount: i32) -> Self {
        Self {
            guard: self.guard.saturating_add(amount.max(0)),
            ..self.clone()
        }
    }

    pub fn with_buffs(&self, incoming: &[BuffApplication]) -> Self {
        Self {
            buffs: self.buffs.apply(incoming),
            ..self.clone()
        }
    }

    /// 直接扣除生命（持续伤害、反伤），绕过 AP 与格挡。
    pub fn lose_hp(&self, amount: i32) -> (Self, i32) {
        let lost = amount.max(0).min(self.hp.max(0));
        (
            Self {
                hp: self.hp - lost,
                ..self.clone()
            },
            lost,
        )
    }
}

/// 法师的元素共鸣。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Resonance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<Element>,
    pub stacks: u32,
}

/// 玩家战斗状态。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerState {
    pub stats: CombatantStats,
    pub class: CharacterClass,
    pub energy: u32,
    pub max_energy: u32,
    #[serde(default)]
    pub sword_energy: u32,
    #[serde(default)]
    pub resonance: Resonance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equipment: Vec<EquippedItem>,
}

impl PlayerState {
    pub fn new(stats: CombatantStats, class: CharacterClass, max_energy: u32) -> Self {
        Self {
            stats,
            class,
            energy: max_energy,
            max_energy,
            sword_energy: 0,
            resonance: Resonance::default(),
            equipment: Vec::new(),
        }
    }

    pub fn with_equipment(mut self, equipment: Vec<EquippedItem>) -> Self {
        self.equipment = equipment;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnemyRank {
    #[default]
    Normal,
    Elite,
    Boss,
}

/// 由定义派生的敌人运行时状态。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnemyBattleState {
    pub enemy_id: String,
    pub name: String,
    pub rank: EnemyRank,
    pub stats: CombatantStats,
    pub energy: u32,
    pub max_energy: u32,
    pub phase_count: u32,
    pub turn_count: u32,
}

impl EnemyBattleState {
    pub fn from_definition(definition: &EnemyDefinition) -> Self {
        Self {
            enemy_id: definition.id.clone(),
            name: definition.name.clone(),
            rank: definition.rank,
            stats: CombatantStats::new(definition.max_hp, definition.max_ap, definition.speed),
            energy: definition.energy,
            max_energy: definition.energy,
            phase_count: 0,
            turn_count: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.stats.is_defeated()
    }
}

/// 战斗中的行动者引用。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CombatantRef {
    Player,
    Enemy { index: EnemyIndex },
}

/// 战斗结果；离开 `Ongoing` 后不再改变。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BattleResult {
    #[default]
    Ongoing,
    Victory,
    Defeat,
    Escaped,
}

impl BattleResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BattleResult::Ongoing)
    }
}

/// 战斗事件流。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum BattleEvent {
    RoundStarted {
        round: u32,
    },
    PhaseStarted {
        entry: PhaseEntry,
    },
    PhaseSkipped {
        entry: PhaseEntry,
        reason: String,
    },
    CardsDrawn {
        card_ids: Vec<CardInstanceId>,
        reshuffled: bool,
    },
    HandDiscarded {
        count: usize,
    },
    CardPlayed {
        card_id: CardInstanceId,
        card_type_id: CardTypeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<CombatantRef>,
    },
    DamageResolved {
        source: CombatantRef,
        target: CombatantRef,
        ap_absorbed: i32,
        guard_absorbed: i32,
        hp_damage: i32,
        critical: bool,
    },
    ArmorBroken {
        target: CombatantRef,
    },
    GuardGained {
        target: CombatantRef,
        amount: i32,
    },
    Healed {
        target: CombatantRef,
        amount: i32,
    },
    BuffApplied {
        target: CombatantRef,
        kind: BuffKind,
        stacks: u32,
        duration: u32,
    },
    BuffExpired {
        target: CombatantRef,
        kind: BuffKind,
    },
    DebuffsCleared {
        target: CombatantRef,
    },
    DamageOverTime {
        target: CombatantRef,
        amount: i32,
    },
    Reflected {
        source: CombatantRef,
        target: CombatantRef,
        amount: i32,
    },
    EnemyActed {
        index: EnemyIndex,
        action: String,
    },
    EnemyDefeated {
        index: EnemyIndex,
    },
    MasteryIncreased {
        card_id: CardInstanceId,
        level: u8,
    },
    DerivationUnlocked {
        unlock: DerivationUnlock,
    },
    EscapeAttempted {
        chance: f64,
        success: bool,
    },
    BattleEnded {
        result: BattleResult,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IntegrityError {
    HpOutOfRange { target: CombatantRef, hp: i32 },
    NegativeResource { target: CombatantRef },
    DuplicateCardId { card_id: CardInstanceId },
    PhaseCursorOutOfRange { cursor: usize, len: usize },
}

/// 单个战斗者的快照。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombatantSnapshot {
    pub target: CombatantRef,
    pub name: String,
    pub hp: i32,
    pub max_hp: i32,
    pub ap: i32,
    pub max_ap: i32,
    pub guard: i32,
    pub energy: u32,
    pub speed: i32,
    pub buffs: BuffLedger,
    pub alive: bool,
}

impl CombatantSnapshot {
    pub fn of_player(player: &PlayerState) -> Self {
        Self::build(CombatantRef::Player, "Player", &player.stats, player.energy)
    }

    pub fn of_enemy(index: EnemyIndex, enemy: &EnemyBattleState) -> Self {
        Self::build(
            CombatantRef::Enemy { index },
            &enemy.name,
            &enemy.stats,
            enemy.energy,
        )
    }

    fn build(target: CombatantRef, name: &str, stats: &CombatantStats, energy: u32) -> Self {
        Self {
            target,
            name: name.to_string(),
            hp: stats.hp,
            max_hp: stats.max_hp,
            ap: stats.ap,
            max_ap: stats.max_ap,
            guard: stats.guard,
            energy,
            speed: stats.effective_speed(),
            buffs: stats.buffs.clone(),
            alive: !stats.is_defeated(),
        }
    }
}

/// 供表现层轮询的可序列化战斗快照。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BattleSnapshot {
    pub result: BattleResult,
    pub round: u32,
    pub player: CombatantSnapshot,
    pub sword_energy: u32,
    pub resonance: Resonance,
    pub enemies: Vec<CombatantSnapshot>,
    pub phase_queue: Vec<PhaseEntry>,
    pub current_phase_index: usize,
    pub hand: Vec<CardInstanceId>,
    pub draw_pile_count: usize,
    pub discard_pile_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution: Option<CardExecutionResult>,
}

/// 检查战斗状态的基本不变量。
pub fn integrity_check<'a>(
    player: &PlayerState,
    enemies: &[EnemyBattleState],
    cards: impl Iterator<Item = &'a CardInstanceId>,
) -> Result<(), IntegrityError> {
    let mut combatants = vec![(CombatantRef::Player, &player.stats)];
    combatants.extend(
        enemies
            .iter()
            .enumerate()
            .map(|(index, enemy)| (CombatantRef::Enemy { index }, &enemy.stats)),
    );
    for (target, stats) in combatants {
        if stats.hp < 0 || stats.hp > stats.max_hp {
            return Err(IntegrityError::HpOutOfRange {
                target,
                hp: stats.hp,
            });
        }
        if stats.ap < 0 || stats.guard < 0 {
            return Err(IntegrityError::NegativeResource { target });
        }
    }

    let mut seen = HashSet::new();
    for card_id in cards {
        if !seen.insert(*card_id) {
            return Err(IntegrityError::DuplicateCardId { card_id: *card_id });
        }
    }
    Ok(())
}
