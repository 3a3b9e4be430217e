//! 内容加载阶段的错误与诊断。

use serde::{Deserialize, Serialize};

/// 无法继续加载的内容错误。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "type")]
pub enum ContentError {
    #[error("card type `{card_type_id}` is defined more than once")]
    DuplicateCardType { card_type_id: String },
    #[error("enemy `{enemy_id}` is defined more than once")]
    DuplicateEnemy { enemy_id: String },
    #[error("failed to parse {source_name}: {message}")]
    Malformed {
        source_name: String,
        message: String,
    },
}

/// 可跳过的数据完整性问题：记录警告后丢弃对应条目。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[serde(tag = "type")]
pub enum ContentDiagnostic {
    #[error("derivation {parent} -> {child} references unknown card `{missing}`")]
    UnknownDerivationCard {
        parent: String,
        child: String,
        missing: String,
    },
    #[error("derivation {parent} -> {child} would create a cycle")]
    DerivationCycle { parent: String, child: String },
    #[error("card `{child}` already derives from `{existing_parent}`, ignoring `{parent}`")]
    DuplicateDerivationParent {
        parent: String,
        child: String,
        existing_parent: String,
    },
    #[error("derivation {parent} -> {child} requires mastery {required}, above the maximum")]
    InvalidDerivationMastery {
        parent: String,
        child: String,
        required: u8,
    },
    #[error("equipment `{item_id}` skill references unknown effect type `{effect_type}`")]
    UnknownEquipmentEffect { item_id: String, effect_type: String },
    #[error("enemy `{enemy_id}` pattern weights for tier {tier} sum to {sum}, expected 1.0")]
    InvalidPatternWeights {
        enemy_id: String,
        tier: String,
        sum: f64,
    },
    #[error("enemy `{enemy_id}` has {slots} rotation slots numbered up to {highest}")]
    SparseRotation {
        enemy_id: String,
        slots: u32,
        highest: u32,
    },
}

impl ContentDiagnostic {
    pub(crate) fn report(self) -> Self {
        tracing::warn!(diagnostic = %self, "skipping invalid content entry");
        self
    }
}

/// 战斗无法开始。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "type")]
pub enum SetupError {
    #[error("a battle needs at least one enemy")]
    NoEnemies,
    #[error("player max hp must be positive, got {max_hp}")]
    InvalidPlayerStats { max_hp: i32 },
    #[error("failed to parse battle setup: {message}")]
    Malformed { message: String },
}
