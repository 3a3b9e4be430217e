//! 敌人 AI：按阶段轮转与血量档位加权的行动选择。

pub mod patterns;

pub use patterns::{
    determine_enemy_action,
    AiPattern,
    DecisionSource,
    EnemyAction,
    EnemyDecision,
    EnemyDefinition,
    HpCondition,
};
