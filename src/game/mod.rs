//! 战斗核心逻辑（牌堆、增减益、伤害结算、出牌管线、阶段调度、战斗会话）。

pub mod buffs;
pub mod cards;
pub mod config;
pub mod damage;
pub mod deck;
pub mod effects;
pub mod equipment;
pub mod rewards;
pub mod rules;
pub mod scheduler;
pub mod state;

pub use buffs::{BuffApplication, BuffEntry, BuffKind, BuffLedger};
pub use cards::{
    Card,
    CardCatalog,
    CardCategory,
    CardInstanceId,
    CardTemplate,
    CardTypeId,
    CharacterClass,
    DerivationEntry,
    DerivationGraph,
    DerivationUnlock,
    Element,
};
pub use config::BattleConfig;
pub use damage::{apply_hit, escape_chance, resolve_attack, AttackProfile, DamageReport, HitOutcome};
pub use deck::{create_initial_deck, discard, draw, shuffle, CardIdAllocator, DeckState, DrawResult};
pub use effects::{
    execute_card,
    CardEffect,
    CardExecution,
    CardExecutionResult,
    CardPlay,
    EffectCondition,
    ExecutionContext,
};
pub use equipment::{DurabilityDelta, EquipmentBonuses, EquipmentEffect, EquipmentSkill, EquippedItem};
pub use rewards::{compute_rewards, transfer_souls, BattleRewards, EncounterKind};
pub use rules::{BattleOutcome, BattleSession, BattleSetup, EscapeAttempt, RuleError};
pub use scheduler::{build_base_queue, build_round_queue, expand_queue, PhaseActor, PhaseEntry, PhaseQueue};
pub use state::{
    BattleEvent,
    BattleResult,
    BattleSnapshot,
    CombatantRef,
    CombatantSnapshot,
    CombatantStats,
    EnemyBattleState,
    EnemyIndex,
    EnemyRank,
    IntegrityError,
    PlayerState,
    Resonance,
};
