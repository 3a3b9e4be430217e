//! 阶段队列：按速度排定一轮内玩家与敌人的行动顺序。

use serde::{Deserialize, Serialize};

use super::state::{EnemyBattleState, EnemyIndex};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhaseActor {
    Player,
    Enemy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PhaseEntry {
    pub actor: PhaseActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enemy_index: Option<EnemyIndex>,
}

impl PhaseEntry {
    pub fn player() -> Self {
        Self {
            actor: PhaseActor::Player,
            enemy_index: None,
        }
    }

    /// 基础队列中尚未展开的敌方槽位。
    pub fn enemy_slot() -> Self {
        Self {
            actor: PhaseActor::Enemy,
            enemy_index: None,
        }
    }

    pub fn enemy(index: EnemyIndex) -> Self {
        Self {
            actor: PhaseActor::Enemy,
            enemy_index: Some(index),
        }
    }

    pub fn is_player(&self) -> bool {
        self.actor == PhaseActor::Player
    }
}

/// 基础队列：速度高者先行，平速玩家优先；一方速度达到另一方两倍时获得第二个槽位。
pub fn build_base_queue(player_speed: i32, enemy_speed: i32) -> Vec<PhaseEntry> {
    let player_first = player_speed >= enemy_speed;
    let (fast, slow) = if player_first {
        (player_speed, enemy_speed)
    } else {
        (enemy_speed, player_speed)
    };
    let double = fast > slow && fast >= slow.saturating_mul(2);

    let (fast_entry, slow_entry) = if player_first {
        (PhaseEntry::player(), PhaseEntry::enemy_slot())
    } else {
        (PhaseEntry::enemy_slot(), PhaseEntry::player())
    };

    let mut queue = vec![fast_entry, slow_entry];
    if double {
        queue.push(fast_entry);
    }
    queue
}

/// 把每个敌方槽位按稳定索引展开为每个存活敌人一项。
pub fn expand_queue(base: &[PhaseEntry], alive: &[EnemyIndex]) -> Vec<PhaseEntry> {
    let mut expanded = Vec::with_capacity(base.len() + alive.len());
    for entry in base {
        match (entry.actor, entry.enemy_index) {
            (PhaseActor::Enemy, None) => {
                expanded.extend(alive.iter().map(|index| PhaseEntry::enemy(*index)))
            }
            _ => expanded.push(*entry),
        }
    }
    expanded
}

/// 依据当前速度（含增减益）生成一轮的完整队列。
pub fn build_round_queue(player_speed: i32, enemies: &[EnemyBattleState]) -> Vec<PhaseEntry> {
    let alive: Vec<EnemyIndex> = enemies
        .iter()
        .enumerate()
        .filter(|(_, enemy)| enemy.is_alive())
        .map(|(index, _)| index)
        .collect();
    let enemy_speed = alive
        .iter()
        .map(|index| enemies[*index].stats.effective_speed())
        .max()
        .unwrap_or(0);
    expand_queue(&build_base_queue(player_speed, enemy_speed), &alive)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseQueue {
    pub entries: Vec<PhaseEntry>,
    pub current_phase_index: usize,
    pub round: u32,
}

impl PhaseQueue {
    pub fn new(entries: Vec<PhaseEntry>) -> Self {
        Self {
            entries,
            current_phase_index: 0,
            round: 1,
        }
    }

    pub fn current(&self) -> Option<PhaseEntry> {
        self.entries.get(self.current_phase_index).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 游标前进一格并按队列长度回绕；回绕时返回 `true`，表示一轮结束。
    pub fn advance(&mut self) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.current_phase_index = (self.current_phase_index + 1) % self.entries.len();
        self.current_phase_index == 0
    }

    /// 新一轮：替换队列并把游标归零。
    pub fn start_round(&mut self, entries: Vec<PhaseEntry>) {
        self.entries = entries;
        self.current_phase_index = 0;
        self.round += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::EnemyDefinition;
    use crate::game::state::EnemyRank;

    fn enemy(speed: i32) -> EnemyBattleState {
        EnemyBattleState::from_definition(&EnemyDefinition {
            id: format!("e{speed}"),
            name: "Slime".into(),
            rank: EnemyRank::Normal,
            depth: 1,
            max_hp: 20,
            max_ap: 0,
            speed,
            attack: 3,
            energy: 1,
            ai_patterns: Vec::new(),
        })
    }

    #[test]
    fn faster_side_goes_first_and_ties_favor_player() {
        assert_eq!(
            build_base_queue(10, 8),
            vec![PhaseEntry::player(), PhaseEntry::enemy_slot()]
        );
        assert_eq!(
            build_base_queue(8, 8),
            vec![PhaseEntry::player(), PhaseEntry::enemy_slot()]
        );
        assert_eq!(
            build_base_queue(6, 8),
            vec![PhaseEntry::enemy_slot(), PhaseEntry::player()]
        );
    }

    #[test]
    fn double_speed_earns_an_extra_slot() {
        assert_eq!(
            build_base_queue(20, 10),
            vec![
                PhaseEntry::player(),
                PhaseEntry::enemy_slot(),
                PhaseEntry::player()
            ]
        );
        assert_eq!(
            build_base_queue(3, 9),
            vec![
                PhaseEntry::enemy_slot(),
                PhaseEntry::player(),
                PhaseEntry::enemy_slot()
            ]
        );
        assert_eq!(build_base_queue(0, 0).len(), 2);
    }

    #[test]
    fn expansion_gives_each_alive_enemy_a_slot() {
        let base = build_base_queue(10, 5);
        let expanded = expand_queue(&base, &[0, 2]);
        assert_eq!(
            expanded,
            vec![
                PhaseEntry::player(),
                PhaseEntry::enemy(0),
                PhaseEntry::enemy(2)
            ]
        );
        let single = expand_queue(&[PhaseEntry::enemy_slot(), PhaseEntry::player()], &[0]);
        assert_eq!(single, vec![PhaseEntry::enemy(0), PhaseEntry::player()]);
    }

    #[test]
    fn round_queue_skips_dead_enemies() {
        let mut enemies = vec![enemy(4), enemy(12), enemy(6)];
        enemies[1].stats.hp = 0;
        let queue = build_round_queue(7, &enemies);
        assert_eq!(
            queue,
            vec![
                PhaseEntry::player(),
                PhaseEntry::enemy(0),
                PhaseEntry::enemy(2)
            ]
        );
    }

    #[test]
    fn cursor_wraps_and_reports_round_end() {
        let mut queue = PhaseQueue::new(vec![
            PhaseEntry::player(),
            PhaseEntry::enemy(0),
            PhaseEntry::enemy(1),
        ]);
        assert!(!queue.advance());
        assert!(!queue.advance());
        assert!(queue.advance());
        assert_eq!(queue.current(), Some(PhaseEntry::player()));
        queue.start_round(vec![PhaseEntry::enemy(0), PhaseEntry::player()]);
        assert_eq!(queue.round, 2);
        assert_eq!(queue.current_phase_index, 0);
    }
}
