//! 增益/减益账本：以固定枚举为键的状态表，所有操作均返回新表。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum BuffKind {
    Burn,
    Poison,
    Bleed,
    Slow,
    Stun,
    AtkDown,
    DefDown,
    AtkUp,
    DefUp,
    Haste,
    Regen,
    Reflect,
    Lifesteal,
}

impl BuffKind {
    pub fn is_debuff(&self) -> bool {
        matches!(
            self,
            BuffKind::Burn
                | BuffKind::Poison
                | BuffKind::Bleed
                | BuffKind::Slow
                | BuffKind::Stun
                | BuffKind::AtkDown
                | BuffKind::DefDown
        )
    }

    /// 在持有者阶段开始时造成伤害的持续伤害类状态。
    pub fn is_damage_over_time(&self) -> bool {
        matches!(self, BuffKind::Burn | BuffKind::Poison | BuffKind::Bleed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BuffEntry {
    pub stacks: u32,
    pub duration: u32,
    pub value: i32,
    #[serde(default)]
    pub permanent: bool,
}

/// 一次待施加的状态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuffApplication {
    pub kind: BuffKind,
    #[serde(default = "default_stacks")]
    pub stacks: u32,
    pub duration: u32,
    #[serde(default)]
    pub value: i32,
    #[serde(default)]
    pub permanent: bool,
}

fn default_stacks() -> u32 {
    1
}

impl BuffApplication {
    pub fn new(kind: BuffKind, duration: u32, value: i32) -> Self {
        Self {
            kind,
            stacks: 1,
            duration,
            value,
            permanent: false,
        }
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(transparent)]
pub struct BuffLedger {
    entries: BTreeMap<BuffKind, BuffEntry>,
}

impl BuffLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: BuffKind) -> Option<&BuffEntry> {
        self.entries.get(&kind)
    }

    pub fn has(&self, kind: BuffKind) -> bool {
        self.entries.contains_key(&kind)
    }

    /// 指定状态的数值，不存在时为 0。
    pub fn value_of(&self, kind: BuffKind) -> i32 {
        self.entries.get(&kind).map(|entry| entry.value).unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BuffKind, &BuffEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 同类状态叠加层数与数值，持续时间取两者较大值；任一方为永久则结果为永久。
    pub fn apply(&self, incoming: &[BuffApplication]) -> Self {
        let mut entries = self.entries.clone();
        for application in incoming {
            entries
                .entry(application.kind)
                .and_modify(|entry| {
                    entry.stacks = entry.stacks.saturating_add(application.stacks);
                    entry.value = entry.value.saturating_add(application.value);
                    entry.permanent = entry.permanent || application.permanent;
                    if !entry.permanent {
                        entry.duration = entry.duration.max(application.duration);
                    }
                })
                .or_insert(BuffEntry {
                    stacks: application.stacks,
                    duration: application.duration,
                    value: application.value,
                    permanent: application.permanent,
                });
        }
        Self { entries }
    }

    /// 移除所有非永久的减益。
    pub fn clear_debuffs(&self) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(kind, entry)| !kind.is_debuff() || entry.permanent)
            .map(|(kind, entry)| (*kind, *entry))
            .collect();
        Self { entries }
    }

    /// 持续时间减一，归零的非永久状态被移除。返回新表与过期的状态类型。
    pub fn tick_durations(&self) -> (Self, Vec<BuffKind>) {
        let mut expired = Vec::new();
        let mut entries = BTreeMap::new();
        for (kind, entry) in &self.entries {
            if entry.permanent {
                entries.insert(*kind, *entry);
                continue;
            }
            let duration = entry.duration.saturating_sub(1);
            if duration == 0 {
                expired.push(*kind);
            } else {
                entries.insert(
                    *kind,
                    BuffEntry {
                        duration,
                        ..*entry
                    },
                );
            }
        }
        (Self { entries }, expired)
    }

    /// 速度修正：加速加值，减速减值。
    pub fn speed_modifier(&self) -> i32 {
        self.value_of(BuffKind::Haste) - self.value_of(BuffKind::Slow)
    }

    /// 输出伤害百分比修正。
    pub fn outgoing_percent(&self) -> i32 {
        self.value_of(BuffKind::AtkUp) - self.value_of(BuffKind::AtkDown)
    }

    /// 承受伤害百分比修正（正值表示多受伤害）。
    pub fn incoming_percent(&self) -> i32 {
        self.value_of(BuffKind::DefDown) - self.value_of(BuffKind::DefUp)
    }

    /// 阶段开始时的持续伤害总量。
    pub fn damage_over_time(&self) -> i32 {
        self.entries
            .iter()
            .filter(|(kind, _)| kind.is_damage_over_time())
            .map(|(_, entry)| entry.value.max(0))
            .sum()
    }
}
